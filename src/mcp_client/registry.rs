//! Tool registry for one server.
//!
//! Holds the tools and resources a server advertised during discovery, in
//! the order it listed them, and validates tool calls against the declared
//! input schema before anything is sent.

use std::collections::HashMap;

use serde_json::Value;

use super::errors::McpError;
use super::types::{ResourceDescriptor, ToolDescriptor};

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Tools and resources advertised by a single server.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    server: String,
    tools: Vec<ToolDescriptor>,
    /// `tool_name → index into tools`.
    index: HashMap<String, usize>,
    resources: Vec<ResourceDescriptor>,
}

impl ToolRegistry {
    /// Create an empty registry for `server`.
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            ..Self::default()
        }
    }

    /// Build a registry from discovery results.
    ///
    /// A repeated tool name keeps its first definition.
    pub fn build(
        server: &str,
        tools: Vec<ToolDescriptor>,
        resources: Vec<ResourceDescriptor>,
    ) -> Self {
        let mut registry = Self::new(server);
        for tool in tools {
            if registry.index.contains_key(&tool.name) {
                tracing::warn!(server, tool = %tool.name, "duplicate tool name, keeping first");
                continue;
            }
            registry.index.insert(tool.name.clone(), registry.tools.len());
            registry.tools.push(tool);
        }
        registry.resources = resources;
        registry
    }

    pub fn get_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate a tool call: tool exists and arguments match schema.
    ///
    /// This is a basic structural check: arguments form an object, required
    /// fields are present, and top-level fields have the declared JSON type.
    /// Full JSON Schema validation is left to the server.
    pub fn validate_tool_call(&self, tool_name: &str, arguments: &Value) -> Result<(), McpError> {
        let def = self.get_tool(tool_name).ok_or_else(|| McpError::UnknownTool {
            server: self.server.clone(),
            tool: tool_name.to_string(),
        })?;

        let invalid = |reason: String| McpError::InvalidArguments {
            tool: tool_name.to_string(),
            reason,
        };

        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => return check_required(&def.input_schema, None).map_err(invalid),
            other => {
                return Err(invalid(format!(
                    "arguments must be an object, got {}",
                    json_type(other)
                )))
            }
        };

        check_required(&def.input_schema, Some(args)).map_err(invalid)?;

        if let Some(props) = def.input_schema.get("properties").and_then(Value::as_object) {
            for (field, value) in args {
                let Some(expected) = props
                    .get(field)
                    .and_then(|p| p.get("type"))
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                if !type_matches(expected, value) {
                    return Err(invalid(format!(
                        "field '{field}' must be {expected}, got {}",
                        json_type(value)
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_required(
    schema: &Value,
    args: Option<&serde_json::Map<String, Value>>,
) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    for field in required.iter().filter_map(Value::as_str) {
        let present = args.map(|a| a.contains_key(field)).unwrap_or(false);
        if !present {
            return Err(format!("missing required field: '{field}'"));
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // Unknown type keywords are left to the server.
        _ => true,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_tool(name: &str, schema: Value) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: format!("Tool {name}"),
            input_schema: schema,
        }
    }

    fn fs_registry() -> ToolRegistry {
        ToolRegistry::build(
            "fs",
            vec![
                make_tool(
                    "read_file",
                    json!({
                        "type": "object",
                        "properties": {"path": {"type": "string"}, "limit": {"type": "integer"}},
                        "required": ["path"]
                    }),
                ),
                make_tool("list_dir", json!({"type": "object"})),
            ],
            vec![ResourceDescriptor {
                uri: "fs://fs/readme".into(),
                name: None,
                description: None,
                mime_type: None,
            }],
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = fs_registry();
        assert_eq!(reg.len(), 2);
        assert!(reg.get_tool("read_file").is_some());
        assert!(reg.get_tool("write_file").is_none());
        assert_eq!(reg.tool_names(), vec!["read_file", "list_dir"]);
        assert_eq!(reg.resources().len(), 1);
    }

    #[test]
    fn test_duplicate_tool_keeps_first() {
        let reg = ToolRegistry::build(
            "fs",
            vec![
                make_tool("a", json!({"description": "first"})),
                make_tool("a", json!({"description": "second"})),
            ],
            Vec::new(),
        );
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get_tool("a").unwrap().input_schema["description"], "first");
    }

    #[test]
    fn test_validate_tool_call_valid() {
        let reg = fs_registry();
        assert!(reg
            .validate_tool_call("read_file", &json!({"path": "/tmp/x", "limit": 10}))
            .is_ok());
        assert!(reg.validate_tool_call("list_dir", &Value::Null).is_ok());
    }

    #[test]
    fn test_validate_tool_call_missing_required() {
        let reg = fs_registry();
        let err = reg.validate_tool_call("read_file", &json!({})).unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn test_validate_tool_call_wrong_type() {
        let reg = fs_registry();
        let err = reg
            .validate_tool_call("read_file", &json!({"path": 5}))
            .unwrap_err();
        assert!(err.to_string().contains("must be string"));
    }

    #[test]
    fn test_validate_tool_call_non_object_arguments() {
        let reg = fs_registry();
        let err = reg
            .validate_tool_call("list_dir", &json!(["a"]))
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));
    }

    #[test]
    fn test_validate_tool_call_unknown_tool() {
        let reg = fs_registry();
        let err = reg
            .validate_tool_call("missing_tool", &json!({}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Tool 'missing_tool' not found on server 'fs'.");
    }

    #[test]
    fn test_empty_registry() {
        let reg = ToolRegistry::new("x");
        assert!(reg.is_empty());
        assert!(reg.resources().is_empty());
    }
}
