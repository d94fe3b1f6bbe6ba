//! Tool descriptor registry
//!
//! Maps tool names to their invocation contract. Names are unique; a later
//! registration under the same name replaces the earlier one, since
//! providers may reconnect.
//!
//! Lookups forgive spelling: `Read-File` finds `read_file`, and configured
//! aliases map other names (`open` -> `navigate`) onto registered tools.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskpilot_mcp::McpTool;

use crate::config::FallbackBackend;
use crate::error::{Error, Result};

/// Which backend executes a tool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRef {
    Gui,
    Code,
    /// A tool provider session, by provider name
    Provider(String),
}

impl From<FallbackBackend> for BackendRef {
    fn from(fallback: FallbackBackend) -> Self {
        match fallback {
            FallbackBackend::Gui => Self::Gui,
            FallbackBackend::Code => Self::Code,
        }
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gui => write!(f, "gui"),
            Self::Code => write!(f, "code"),
            Self::Provider(name) => write!(f, "provider:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments
    #[serde(default)]
    pub parameters: Value,
    pub backend: BackendRef,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, backend: BackendRef) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: Value::Null,
            backend,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Descriptor for a tool discovered on `provider`
    pub fn from_mcp(tool: McpTool, provider: &str) -> Self {
        Self {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
            backend: BackendRef::Provider(provider.to_string()),
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolDescriptor>>,
    /// Normalized alias -> registered tool name
    aliases: RwLock<HashMap<String, String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aliases<I, A, T>(self, aliases: I) -> Self
    where
        I: IntoIterator<Item = (A, T)>,
        A: AsRef<str>,
        T: Into<String>,
    {
        for (alias, target) in aliases {
            self.add_alias(alias.as_ref(), target);
        }
        self
    }

    /// Let `alias` stand for the tool registered as `target`
    pub fn add_alias(&self, alias: &str, target: impl Into<String>) {
        self.aliases
            .write()
            .insert(normalize_tool_name(alias), target.into());
    }

    /// The registered name `name` refers to: itself, its configured alias
    /// target, or the tool whose normalized name matches
    pub fn canonical_name(&self, name: &str) -> Option<String> {
        let tools = self.tools.read();
        if tools.contains_key(name) {
            return Some(name.to_string());
        }

        let key = normalize_tool_name(name);
        if let Some(target) = self.aliases.read().get(&key)
            && tools.contains_key(target)
        {
            return Some(target.clone());
        }
        tools
            .keys()
            .filter(|registered| normalize_tool_name(registered) == key)
            .min()
            .cloned()
    }

    /// Register a descriptor, returning the one it replaced
    pub fn register(&self, descriptor: ToolDescriptor) -> Option<ToolDescriptor> {
        let previous = self
            .tools
            .write()
            .insert(descriptor.name.clone(), descriptor.clone());

        if let Some(previous) = &previous {
            if previous.backend != descriptor.backend {
                tracing::warn!(
                    tool = %descriptor.name,
                    old = %previous.backend,
                    new = %descriptor.backend,
                    "Tool re-registered with a different backend"
                );
            }
        }
        tracing::debug!(tool = %descriptor.name, backend = %descriptor.backend, "Registered tool");
        previous
    }

    /// Drop every descriptor served by `backend`, returning how many
    pub fn unregister(&self, backend: &BackendRef) -> usize {
        let mut tools = self.tools.write();
        let before = tools.len();
        tools.retain(|_, descriptor| &descriptor.backend != backend);
        let removed = before - tools.len();
        drop(tools);

        if removed > 0 {
            tracing::info!(%backend, removed, "Unregistered tools");
        }
        removed
    }

    /// Look up a tool by name or alias. The descriptor carries the
    /// registered name.
    pub fn resolve(&self, name: &str) -> Result<ToolDescriptor> {
        self.canonical_name(name)
            .and_then(|canonical| self.tools.read().get(&canonical).cloned())
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// All descriptors, sorted by name
    pub fn snapshot(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<_> = self.tools.read().values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Names of the tools served by `backend`, sorted
    pub fn names_for(&self, backend: &BackendRef) -> Vec<String> {
        let mut names: Vec<_> = self
            .tools
            .read()
            .values()
            .filter(|d| &d.backend == backend)
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }
}

/// Lowercase with every separator folded to `_`
pub fn normalize_tool_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Check `arguments` against a JSON schema's `required` list and the
/// primitive `type` of each declared property
pub fn validate_arguments(schema: &Value, arguments: &Value) -> std::result::Result<(), String> {
    let empty = serde_json::Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => return Err(format!("arguments must be an object, got {}", json_type(other))),
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| !args.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required arguments: {}", missing.join(", ")));
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in args {
            let Some(expected) = properties.get(key).and_then(|p| p.get("type")) else {
                continue;
            };
            let allowed: Vec<&str> = match expected {
                Value::String(t) => vec![t.as_str()],
                Value::Array(types) => types.iter().filter_map(Value::as_str).collect(),
                _ => continue,
            };
            if !allowed.iter().any(|t| type_matches(t, value)) {
                return Err(format!(
                    "argument '{}' should be {}, got {}",
                    key,
                    allowed.join(" or "),
                    json_type(value)
                ));
            }
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
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // unknown type keywords are not enforced
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
