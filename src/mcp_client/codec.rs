//! Tool name codec.
//!
//! Tools from every server share one flat namespace when shown to the
//! model. A tool is addressed as `{server}.{tool}`: server names are
//! restricted to `[A-Za-z0-9_-]`, so the first `.` always marks the
//! boundary and the tool part may contain anything (including further dots).

use super::errors::McpError;

/// Separator between server and tool name. Never valid in a server name.
pub const SEPARATOR: char = '.';

/// Join a server name and a tool name into one identifier.
pub fn encode(server: &str, tool: &str) -> String {
    format!("{server}{SEPARATOR}{tool}")
}

/// Split an identifier at the first separator.
///
/// Returns `None` if there is no separator or either side is empty.
pub fn decode(identifier: &str) -> Option<(&str, &str)> {
    let (server, tool) = identifier.split_once(SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// Whether every character is in `[A-Za-z0-9_-]` and the string is non-empty.
pub fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Check that a server name can be round-tripped through [`encode`] /
/// [`decode`].
pub fn validate_provider_name(name: &str) -> Result<(), McpError> {
    if name.is_empty() {
        return Err(McpError::InvalidProviderName {
            name: name.to_string(),
            reason: "name is empty".into(),
        });
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(McpError::InvalidProviderName {
            name: name.to_string(),
            reason: format!("character '{bad}' not allowed (use A-Z, a-z, 0-9, '_' or '-')"),
        });
    }
    Ok(())
}
