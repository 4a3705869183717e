//! Tool registry: aggregates tool definitions across all MCP servers.
//!
//! Provides:
//! - Tool lookup by encoded name (`server.tool`) or by (server, tool)
//! - Validation that tool call arguments match the declared schema
//! - A capability summary for the system prompt
//! - Suggestions of similarly named tools when a lookup fails

use std::collections::BTreeMap;

use super::codec;
use super::errors::McpError;
use super::types::{McpToolDefinition, ProviderTool};

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool catalog across all MCP servers.
///
/// Keys are encoded names (`"modbus.read_holding_registers"`), so the same
/// tool name on two servers occupies two distinct entries. Iteration order
/// is sorted by encoded name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ProviderTool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every tool belonging to `server_name` with `tools`.
    pub fn register_server_tools(&mut self, server_name: &str, tools: Vec<McpToolDefinition>) {
        self.unregister_server(server_name);
        for tool in tools {
            let entry = ProviderTool {
                server: server_name.to_string(),
                tool,
            };
            self.tools.insert(entry.encoded_name(), entry);
        }
    }

    /// Remove all tools belonging to a server.
    pub fn unregister_server(&mut self, server_name: &str) {
        self.tools.retain(|_, t| t.server != server_name);
    }

    /// Look up a tool by its encoded name.
    pub fn get(&self, encoded: &str) -> Option<&ProviderTool> {
        self.tools.get(encoded)
    }

    /// Look up a tool by server and tool name.
    pub fn lookup(&self, server: &str, tool: &str) -> Option<&McpToolDefinition> {
        self.tools.get(&codec::encode(server, tool)).map(|t| &t.tool)
    }

    /// All tools, sorted by encoded name.
    pub fn all_tools(&self) -> Vec<ProviderTool> {
        self.tools.values().cloned().collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools
            .values()
            .filter(|t| t.server == server_name)
            .count()
    }

    /// All unique server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.values().map(|t| t.server.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Generate a concise capability summary for the system prompt.
    ///
    /// Lists servers with tool counts, e.g.
    /// `Available capabilities (5 tools across 2 servers): modbus (3), s7comm (2).`
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No industrial protocol tools are currently available.".to_string();
        }

        let server_names = self.server_names();
        let server_parts: Vec<String> = server_names
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_server(name)))
            .collect();

        format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            server_names.len(),
            server_parts.join(", "),
        )
    }

    /// Find up to `max_results` tools on `server` whose names are most
    /// similar to `name`, best first.
    pub fn find_similar(&self, server: &str, name: &str, max_results: usize) -> Vec<String> {
        let candidates = self
            .tools
            .values()
            .filter(|t| t.server == server)
            .map(|t| t.tool.name.as_str());
        rank_similar(name, candidates, max_results)
    }
}

/// Rank `candidates` by similarity to `name`, keeping at most `max_results`
/// above a minimum score.
pub fn rank_similar<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = &'a str>,
    max_results: usize,
) -> Vec<String> {
    let mut scored: Vec<(&str, f64)> = candidates
        .into_iter()
        .map(|c| (c, similarity(name, c)))
        .filter(|(_, score)| *score > 0.3) // Floor: don't suggest wildly different tools
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    scored.truncate(max_results);
    scored.into_iter().map(|(n, _)| n.to_string()).collect()
}

// ─── Argument Validation ─────────────────────────────────────────────────────

/// Validate tool call arguments against the tool's declared input schema.
///
/// This is a structural check: the payload is an object, required fields
/// are present, top-level values have the declared `type` (and `enum`
/// membership), and no unknown fields are passed when
/// `additionalProperties` is `false`. Nested schemas are left to the
/// server.
pub fn validate_arguments(
    tool_name: &str,
    schema: &serde_json::Value,
    arguments: &serde_json::Value,
) -> Result<(), McpError> {
    let invalid = |reason: String| McpError::InvalidArguments {
        tool: tool_name.to_string(),
        reason,
    };

    let args = arguments
        .as_object()
        .ok_or_else(|| invalid(format!("arguments must be a JSON object, got {}", json_type_name(arguments))))?;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if !args.contains_key(field) {
                return Err(invalid(format!("missing required field: '{field}'")));
            }
        }
    }

    let properties = schema.get("properties").and_then(|p| p.as_object());
    let closed = schema.get("additionalProperties") == Some(&serde_json::Value::Bool(false));

    for (key, value) in args {
        let Some(prop) = properties.and_then(|p| p.get(key)) else {
            if closed {
                return Err(invalid(format!("unexpected field: '{key}'")));
            }
            continue;
        };

        if let Some(expected) = prop.get("type") {
            let allowed: Vec<&str> = match expected {
                serde_json::Value::String(t) => vec![t.as_str()],
                serde_json::Value::Array(ts) => ts.iter().filter_map(|t| t.as_str()).collect(),
                _ => Vec::new(),
            };
            if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
                return Err(invalid(format!(
                    "field '{key}' must be {}, got {}",
                    allowed.join(" or "),
                    json_type_name(value)
                )));
            }
        }

        if let Some(options) = prop.get("enum").and_then(|e| e.as_array()) {
            if !options.contains(value) {
                return Err(invalid(format!(
                    "field '{key}' must be one of {}",
                    serde_json::Value::Array(options.clone())
                )));
            }
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type keywords are not ours to reject.
        _ => true,
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_f64() => "number",
        serde_json::Value::Number(_) => "integer",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    // Single-row DP
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity between two strings (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
