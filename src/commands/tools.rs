//! `list-tools` and `call` commands.
//!
//! Both print to stdout; diagnostics go through tracing.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::mcp_client::{McpClient, McpError, ToolCallResult, ToolListing};

/// Print every tool grouped by server. Servers that failed to list are
/// reported after the table.
pub async fn list_tools(client: &McpClient, filter: Option<&[String]>) {
    let listing = client.get_all_tools(filter).await;
    print!("{}", format_listing(&listing));
}

/// Human-readable listing.
pub fn format_listing(listing: &ToolListing) -> String {
    let mut by_server: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for tool in &listing.tools {
        by_server
            .entry(tool.server.as_str())
            .or_default()
            .push(tool.tool.name.as_str());
    }

    let mut out = String::new();
    for tool in &listing.tools {
        let description = tool.tool.description.lines().next().unwrap_or_default();
        out.push_str(&format!("{:<40} {description}\n", tool.encoded_name()));
    }
    out.push_str(&format!(
        "\n{} tools across {} servers\n",
        listing.tools.len(),
        by_server.len()
    ));
    for (server, err) in &listing.failures {
        out.push_str(&format!("unavailable: {server}: {err}\n"));
    }
    out
}

/// Invoke one tool and print the outcome as JSON. Returns whether the call
/// succeeded.
///
/// `raw_args` defaults to `{}`; invalid JSON is reported like any other
/// failure without contacting the server.
pub async fn call(client: &McpClient, server: &str, tool: &str, raw_args: Option<&str>) -> bool {
    let outcome = match parse_arguments(tool, raw_args) {
        Ok(arguments) => client.call_tool(server, tool, arguments).await,
        Err(e) => Err(e),
    };
    let output = call_output(server, tool, &outcome);
    println!(
        "{}",
        serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string())
    );
    matches!(outcome, Ok(ref r) if r.success)
}

fn parse_arguments(tool: &str, raw: Option<&str>) -> Result<Value, McpError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(json!({})),
        Some(raw) => serde_json::from_str(raw).map_err(|e| McpError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("arguments are not valid JSON: {e}"),
        }),
    }
}

/// Structured output for `call`, failures included.
pub fn call_output(server: &str, tool: &str, outcome: &Result<ToolCallResult, McpError>) -> Value {
    match outcome {
        Ok(result) => {
            let mut value = serde_json::to_value(result).unwrap_or_else(|_| json!({}));
            if !result.success {
                value["kind"] = json!("capability_execution_error");
            }
            value
        }
        Err(e) => json!({
            "server": server,
            "tool_name": tool,
            "success": false,
            "error": e.to_string(),
            "kind": e.kind(),
        }),
    }
}
