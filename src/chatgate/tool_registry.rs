//! Normalised registry of tools discovered from MCP servers.
//!
//! Each tool is validated against a meta-schema on registration, keyed by
//! its qualified `server.tool` name, and formatted on demand for the
//! target LLM provider. On a name collision across servers the
//! first-registered tool wins, mirroring the model registry's precedence
//! rule.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use crate::chatgate::error::{GatewayError, Result};

/// A normalised tool exposed by an MCP server.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    /// `server.tool`, unique across all servers.
    pub qualified_name: String,
    /// Bare name as the owning server knows it.
    pub name: String,
    pub description: String,
    /// JSON-Schema object describing accepted arguments.
    pub parameters: Value,
    /// Owning server.
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Summary counters exposed by the tools listing endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_tools: usize,
    pub servers: Vec<String>,
}

/// Thread-safe store of tool descriptors.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register the raw tool definitions discovered on
    /// `server_name`. Returns the number registered plus the per-tool
    /// validation failures that were skipped.
    pub async fn register(
        &self,
        server_name: &str,
        raw_tools: &[Value],
    ) -> (usize, Vec<String>) {
        let mut registered = 0;
        let mut failures = Vec::new();
        let mut tools = self.tools.write().await;
        for raw in raw_tools {
            match normalise(server_name, raw) {
                Ok(descriptor) => {
                    // First registration wins; collisions keep the
                    // earlier provider for deterministic precedence.
                    if tools.contains_key(&descriptor.qualified_name) {
                        log::warn!(
                            "tool {} already registered; keeping existing entry",
                            descriptor.qualified_name
                        );
                        continue;
                    }
                    tools.insert(descriptor.qualified_name.clone(), descriptor);
                    registered += 1;
                }
                Err(e) => failures.push(e.to_string()),
            }
        }
        log::info!(
            "registered {} tool(s) from {} ({} rejected)",
            registered,
            server_name,
            failures.len()
        );
        (registered, failures)
    }

    /// Drop every tool belonging to `server_name`.
    pub async fn unregister_server(&self, server_name: &str) {
        self.tools
            .write()
            .await
            .retain(|_, tool| tool.server != server_name);
    }

    /// Look up by qualified name, tolerating the underscore form some
    /// providers require (`server_tool` for `server.tool`).
    pub async fn get(&self, name: &str) -> Option<ToolDescriptor> {
        let tools = self.tools.read().await;
        if let Some(tool) = tools.get(name) {
            return Some(tool.clone());
        }
        tools
            .values()
            .find(|t| t.qualified_name.replace('.', "_") == name)
            .cloned()
    }

    /// All registered tools, unordered.
    pub async fn list(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let tools = self.tools.read().await;
        let mut servers: Vec<String> = tools.values().map(|t| t.server.clone()).collect();
        servers.sort();
        servers.dedup();
        RegistryStats {
            total_tools: tools.len(),
            servers,
        }
    }

    /// All tools formatted for one provider style.
    pub async fn format_for_provider(&self, provider: &str) -> Vec<Value> {
        self.tools
            .read()
            .await
            .values()
            .map(|tool| format_tool(tool, provider))
            .collect()
    }

    /// Validate call arguments against the tool's schema. Returns a list
    /// of human-readable problems, empty when the call is well-formed.
    pub async fn validate_arguments(&self, tool_name: &str, args: &Value) -> Result<Vec<String>> {
        let tool = self
            .get(tool_name)
            .await
            .ok_or_else(|| GatewayError::ToolNotFound(tool_name.to_string()))?;
        Ok(validate_against_schema(&tool.parameters, args))
    }
}

fn normalise(server_name: &str, raw: &Value) -> Result<ToolDescriptor> {
    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation("tool definition has no name"))?;
    if !valid_tool_name(name) {
        return Err(GatewayError::validation(format!(
            "tool name {name:?} must match [A-Za-z_][A-Za-z0-9_]*"
        )));
    }
    let description = raw
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if description.len() < 10 || description.len() > 500 {
        return Err(GatewayError::validation(format!(
            "tool {name}: description must be 10-500 characters"
        )));
    }
    // MCP servers publish either `inputSchema` or `parameters`.
    let parameters = raw
        .get("inputSchema")
        .or_else(|| raw.get("parameters"))
        .cloned()
        .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
    if !parameters.is_object() {
        return Err(GatewayError::validation(format!(
            "tool {name}: parameters must be a JSON-Schema object"
        )));
    }
    Ok(ToolDescriptor {
        qualified_name: format!("{server_name}.{name}"),
        name: name.to_string(),
        description: description.to_string(),
        parameters,
        server: server_name.to_string(),
        category: raw
            .get("category")
            .and_then(Value::as_str)
            .map(str::to_string),
        tags: raw
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn valid_tool_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Format one tool for the given provider style.
pub fn format_tool(tool: &ToolDescriptor, provider: &str) -> Value {
    match provider {
        "openai" => json!({
            "type": "function",
            "function": {
                "name": tool.qualified_name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        }),
        // Anthropic's tool-name pattern disallows dots.
        "anthropic" => json!({
            "name": tool.qualified_name.replace('.', "_"),
            "description": tool.description,
            "input_schema": tool.parameters,
        }),
        // Local model families handle nested schemas poorly; nested
        // objects are flattened to JSON-encoded string fields.
        "ollama" => json!({
            "type": "function",
            "function": {
                "name": tool.qualified_name,
                "description": tool.description,
                "parameters": flatten_nested_objects(&tool.parameters),
            }
        }),
        _ => json!({
            "name": tool.qualified_name,
            "description": tool.description,
            "parameters": tool.parameters,
        }),
    }
}

fn flatten_nested_objects(schema: &Value) -> Value {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return schema.clone();
    };
    let mut flattened = Map::new();
    for (key, prop) in properties {
        if prop.get("type").and_then(Value::as_str) == Some("object") {
            let description = prop
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            flattened.insert(
                key.clone(),
                json!({
                    "type": "string",
                    "description": format!("{} (JSON format)", description),
                }),
            );
        } else {
            flattened.insert(key.clone(), prop.clone());
        }
    }
    let mut out = schema.as_object().cloned().unwrap_or_default();
    out.insert("properties".into(), Value::Object(flattened));
    Value::Object(out)
}

fn validate_against_schema(schema: &Value, args: &Value) -> Vec<String> {
    let mut problems = Vec::new();
    let Some(args_map) = args.as_object() else {
        return vec!["arguments must be a JSON object".to_string()];
    };
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !args_map.contains_key(field) {
                problems.push(format!("missing required field {field:?}"));
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in args_map {
            let Some(expected) = properties.get(key) else {
                problems.push(format!("unexpected field {key:?}"));
                continue;
            };
            if let Some(kind) = expected.get("type").and_then(Value::as_str) {
                let ok = match kind {
                    "string" => value.is_string(),
                    "number" => value.is_number(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !ok {
                    problems.push(format!("field {key:?} must be of type {kind}"));
                }
            }
        }
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tool() -> Value {
        json!({
            "name": "get_weather",
            "description": "Look up current weather for a location.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "location": {"type": "string", "description": "City name"},
                    "options": {"type": "object", "description": "Extra options"}
                },
                "required": ["location"]
            }
        })
    }

    #[tokio::test]
    async fn registration_validates_and_qualifies_names() {
        let registry = ToolRegistry::new();
        let (count, failures) = registry.register("weather", &[sample_tool()]).await;
        assert_eq!(count, 1);
        assert!(failures.is_empty());
        let tool = registry.get("weather.get_weather").await.unwrap();
        assert_eq!(tool.name, "get_weather");
        assert_eq!(tool.server, "weather");
    }

    #[tokio::test]
    async fn short_descriptions_are_rejected() {
        let registry = ToolRegistry::new();
        let bad = json!({"name": "x_tool", "description": "short", "inputSchema": {"type": "object"}});
        let (count, failures) = registry.register("srv", &[bad]).await;
        assert_eq!(count, 0);
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn first_registration_wins_on_collision() {
        let registry = ToolRegistry::new();
        registry.register("a", &[sample_tool()]).await;
        // Same qualified name can only arise from the same server here;
        // re-registering must not replace the original entry.
        let mut altered = sample_tool();
        altered["description"] = json!("A different description entirely.");
        registry.register("a", &[altered]).await;
        let tool = registry.get("a.get_weather").await.unwrap();
        assert!(tool.description.starts_with("Look up"));
    }

    #[tokio::test]
    async fn underscore_lookup_resolves_sanitised_names() {
        let registry = ToolRegistry::new();
        registry.register("weather", &[sample_tool()]).await;
        assert!(registry.get("weather_get_weather").await.is_some());
    }

    #[tokio::test]
    async fn provider_formats_differ() {
        let registry = ToolRegistry::new();
        registry.register("weather", &[sample_tool()]).await;

        let openai = registry.format_for_provider("openai").await;
        assert_eq!(openai[0]["type"], "function");
        assert_eq!(openai[0]["function"]["name"], "weather.get_weather");

        let anthropic = registry.format_for_provider("anthropic").await;
        assert_eq!(anthropic[0]["name"], "weather_get_weather");
        assert!(anthropic[0]["input_schema"].is_object());

        let ollama = registry.format_for_provider("ollama").await;
        let props = &ollama[0]["function"]["parameters"]["properties"];
        assert_eq!(props["options"]["type"], "string");
        assert!(props["options"]["description"]
            .as_str()
            .unwrap()
            .ends_with("(JSON format)"));

        let generic = registry.format_for_provider("generic").await;
        assert_eq!(generic[0]["name"], "weather.get_weather");
    }

    #[tokio::test]
    async fn argument_validation_reports_problems() {
        let registry = ToolRegistry::new();
        registry.register("weather", &[sample_tool()]).await;
        let problems = registry
            .validate_arguments("weather.get_weather", &json!({"location": 7, "bogus": 1}))
            .await
            .unwrap();
        assert!(problems.iter().any(|p| p.contains("location")));
        assert!(problems.iter().any(|p| p.contains("bogus")));

        let clean = registry
            .validate_arguments("weather.get_weather", &json!({"location": "Lisbon"}))
            .await
            .unwrap();
        assert!(clean.is_empty());
    }
}
