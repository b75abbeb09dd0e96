/// Tests for layered configuration loading.
use chatgate::chatgate::settings::Settings;
use std::io::Write;

#[test]
fn json_file_values_resolve_through_dotted_paths() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "log_level": "debug",
            "stream_session_ttl_seconds": 120,
            "enable_thinking_mode": "false",
            "llm_providers": {{
                "ollama": {{"enabled": true, "base_url": "http://gpu-box:11434"}},
                "openai": {{"enabled": true, "api_key": "sk-test", "timeout": 45}}
            }},
            "mcp": {{
                "approval_timeout_seconds": 60,
                "servers": [
                    {{"name": "files", "base_url": "http://files:9000", "auto_approve_tools": ["read_file"]}},
                    {{"name": "off", "base_url": "http://off:9000", "enabled": false}}
                ]
            }}
        }}"#
    )
    .unwrap();

    let settings = Settings::from_file(file.path());
    assert_eq!(settings.log_level(), "debug");
    assert_eq!(settings.stream_session_ttl_seconds(), 120);
    assert!(!settings.enable_thinking_mode());
    assert_eq!(settings.approval_timeout_seconds(), 60);

    let ollama = settings.provider("ollama");
    assert!(ollama.enabled);
    assert_eq!(ollama.base_url.as_deref(), Some("http://gpu-box:11434"));

    let openai = settings.provider("openai");
    assert_eq!(openai.api_key.as_deref(), Some("sk-test"));
    assert_eq!(openai.timeout_seconds, 45);

    let servers = settings.mcp_servers();
    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0].name, "files");
    assert!(servers[0].enabled);
    assert_eq!(servers[0].auto_approve_tools, vec!["read_file".to_string()]);
    assert!(!servers[1].enabled);
}

#[test]
fn missing_file_degrades_to_defaults() {
    let settings = Settings::from_file("/nonexistent/config.json");
    assert_eq!(settings.stream_session_ttl_seconds(), 300);
    assert_eq!(settings.context_message_limit(), 20);
    assert!(settings.auth_enabled());
    assert!(settings.redis_url().is_none());
    assert!(!settings.provider("openai").enabled);
}

#[test]
fn malformed_json_degrades_to_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{not json").unwrap();
    let settings = Settings::from_file(file.path());
    assert_eq!(settings.identity_audience(), "account");
}

#[test]
fn environment_overrides_the_file() {
    // Env precedence is process-global state; the variable is scoped to
    // this test's unique key to stay parallel-safe.
    std::env::set_var("SETTINGS_TESTS_PROBE_KEY", " from-env ");
    let settings = Settings::from_value(serde_json::json!({
        "settings_tests_probe_key": "from-file"
    }));
    assert_eq!(
        settings.get("settings_tests_probe_key").as_deref(),
        Some("from-env")
    );
    std::env::remove_var("SETTINGS_TESTS_PROBE_KEY");
}
