/// Tests for the durable conversation store.
use chatgate::chatgate::models::role;
use chatgate::chatgate::store::{
    init_schema, ConversationStore, ConversationUpdate, NewConversation, NewMessage,
};
use chatgate::chatgate::users::UserResolver;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    init_schema(&pool).await.expect("schema");
    pool
}

async fn demo_user(pool: &SqlitePool) -> i64 {
    UserResolver::new(pool.clone())
        .resolve(None)
        .await
        .expect("demo user")
}

#[tokio::test]
async fn create_and_get_eagerly_loads_messages() {
    chatgate::init_logger();
    let pool = test_pool().await;
    let user = demo_user(&pool).await;
    let store = ConversationStore::new(pool);

    let conversation = store
        .create(NewConversation {
            user_id: user,
            title: "T1".into(),
            model_name: Some("m-small".into()),
            system_prompt: None,
            data: json!({}),
        })
        .await
        .unwrap();
    assert_eq!(conversation.status, "active");
    assert_eq!(conversation.total_tokens, 0);

    store
        .add_message(NewMessage {
            id: None,
            conversation_id: conversation.id.clone(),
            role: role::USER.into(),
            content: "hi".into(),
            raw_content: None,
            token_count: 1,
            data: json!({}),
        })
        .await
        .unwrap();

    let loaded = store.get(&conversation.id).await.unwrap().unwrap();
    assert_eq!(loaded.messages.len(), 1);
    assert_eq!(loaded.messages[0].content, "hi");
}

#[tokio::test]
async fn create_with_unknown_owner_fails_not_found() {
    let pool = test_pool().await;
    let store = ConversationStore::new(pool);
    let err = store
        .create(NewConversation {
            user_id: 4242,
            title: "orphan".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn token_counter_tracks_message_sums() {
    let pool = test_pool().await;
    let user = demo_user(&pool).await;
    let store = ConversationStore::new(pool);
    let conversation = store
        .create(NewConversation {
            user_id: user,
            title: "sums".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    for (count, content) in [(3_i64, "one"), (5, "two"), (7, "three")] {
        store
            .add_message(NewMessage {
                id: None,
                conversation_id: conversation.id.clone(),
                role: role::USER.into(),
                content: content.into(),
                raw_content: None,
                token_count: count,
                data: json!({}),
            })
            .await
            .unwrap();
    }

    let loaded = store.get(&conversation.id).await.unwrap().unwrap();
    let sum: i64 = loaded.messages.iter().map(|m| m.token_count).sum();
    assert_eq!(loaded.total_tokens, sum);
    assert_eq!(loaded.total_tokens, 15);
}

#[tokio::test]
async fn roles_come_back_as_plain_strings() {
    let pool = test_pool().await;
    let user = demo_user(&pool).await;
    let store = ConversationStore::new(pool);
    let conversation = store
        .create(NewConversation {
            user_id: user,
            title: "roles".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    for r in [role::USER, role::ASSISTANT, role::SYSTEM, role::TOOL] {
        store
            .add_message(NewMessage {
                id: None,
                conversation_id: conversation.id.clone(),
                role: r.into(),
                content: format!("{r} says"),
                raw_content: None,
                token_count: 1,
                data: json!({}),
            })
            .await
            .unwrap();
    }
    let messages = store.list_messages(&conversation.id, 100, 0).await.unwrap();
    let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant", "system", "tool"]);
}

#[tokio::test]
async fn invalid_role_is_rejected() {
    let pool = test_pool().await;
    let user = demo_user(&pool).await;
    let store = ConversationStore::new(pool);
    let conversation = store
        .create(NewConversation {
            user_id: user,
            title: "bad role".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let err = store
        .add_message(NewMessage {
            id: None,
            conversation_id: conversation.id,
            role: "wizard".into(),
            content: "zap".into(),
            raw_content: None,
            token_count: 0,
            data: json!({}),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn soft_delete_hides_hard_delete_removes() {
    let pool = test_pool().await;
    let user = demo_user(&pool).await;
    let store = ConversationStore::new(pool);
    let soft = store
        .create(NewConversation {
            user_id: user,
            title: "soft".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let hard = store
        .create(NewConversation {
            user_id: user,
            title: "hard".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(store.delete(&soft.id, false).await.unwrap());
    let listed = store.list_by_user(user, 50, 0, None).await.unwrap();
    assert!(listed.iter().all(|c| c.id != soft.id));
    // The row itself survives a soft delete.
    assert_eq!(
        store.get(&soft.id).await.unwrap().unwrap().status,
        "deleted"
    );

    assert!(store.delete(&hard.id, true).await.unwrap());
    assert!(store.get(&hard.id).await.unwrap().is_none());

    // Deleting something absent reports false.
    assert!(!store.delete("nope", true).await.unwrap());
}

#[tokio::test]
async fn update_unknown_conversation_fails_not_found() {
    let pool = test_pool().await;
    let store = ConversationStore::new(pool);
    let err = store
        .update("missing", ConversationUpdate::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn update_replaces_mutable_fields() {
    let pool = test_pool().await;
    let user = demo_user(&pool).await;
    let store = ConversationStore::new(pool);
    let conversation = store
        .create(NewConversation {
            user_id: user,
            title: "before".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let updated = store
        .update(
            &conversation.id,
            ConversationUpdate {
                title: Some("after".into()),
                status: Some("archived".into()),
                data: Some(json!({"pinned": true})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title, "after");
    assert_eq!(updated.status, "archived");
    assert_eq!(updated.data["pinned"], true);

    let err = store
        .update(
            &conversation.id,
            ConversationUpdate {
                status: Some("vaporised".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn list_is_ordered_by_update_time_and_respects_status_filter() {
    let pool = test_pool().await;
    let user = demo_user(&pool).await;
    let store = ConversationStore::new(pool);

    let first = store
        .create(NewConversation {
            user_id: user,
            title: "first".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = store
        .create(NewConversation {
            user_id: user,
            title: "second".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let listed = store.list_by_user(user, 10, 0, None).await.unwrap();
    assert_eq!(listed[0].id, second.id);

    // Touching the older conversation moves it to the front.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    store
        .add_message(NewMessage {
            id: None,
            conversation_id: first.id.clone(),
            role: role::USER.into(),
            content: "bump".into(),
            raw_content: None,
            token_count: 1,
            data: json!({}),
        })
        .await
        .unwrap();
    let listed = store.list_by_user(user, 10, 0, None).await.unwrap();
    assert_eq!(listed[0].id, first.id);

    store
        .update(
            &second.id,
            ConversationUpdate {
                status: Some("archived".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let archived = store
        .list_by_user(user, 10, 0, Some("archived"))
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, second.id);
}

#[tokio::test]
async fn search_matches_titles_and_content_case_insensitively() {
    let pool = test_pool().await;
    let user = demo_user(&pool).await;
    let store = ConversationStore::new(pool);

    let by_title = store
        .create(NewConversation {
            user_id: user,
            title: "Quarterly Budget".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let by_content = store
        .create(NewConversation {
            user_id: user,
            title: "misc".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    store
        .add_message(NewMessage {
            id: None,
            conversation_id: by_content.id.clone(),
            role: role::USER.into(),
            content: "let's review the BUDGET numbers".into(),
            raw_content: None,
            token_count: 1,
            data: json!({}),
        })
        .await
        .unwrap();
    let deleted = store
        .create(NewConversation {
            user_id: user,
            title: "budget but deleted".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    store.delete(&deleted.id, false).await.unwrap();

    let hits = store.search(user, "budget", 10).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|c| c.id.as_str()).collect();
    assert!(ids.contains(&by_title.id.as_str()));
    assert!(ids.contains(&by_content.id.as_str()));
    assert!(!ids.contains(&deleted.id.as_str()));
}

#[tokio::test]
async fn recent_messages_returns_tail_in_creation_order() {
    let pool = test_pool().await;
    let user = demo_user(&pool).await;
    let store = ConversationStore::new(pool);
    let conversation = store
        .create(NewConversation {
            user_id: user,
            title: "tail".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    for i in 0..5 {
        store
            .add_message(NewMessage {
                id: None,
                conversation_id: conversation.id.clone(),
                role: role::USER.into(),
                content: format!("m{i}"),
                raw_content: None,
                token_count: 1,
                data: json!({}),
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
    }
    let tail = store.recent_messages(&conversation.id, 2).await.unwrap();
    let contents: Vec<&str> = tail.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m3", "m4"]);
}

#[tokio::test]
async fn concurrent_user_provisioning_is_race_tolerant() {
    let pool = test_pool().await;
    let resolver = std::sync::Arc::new(UserResolver::new(pool.clone()));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move { resolver.resolve(None).await }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
}
