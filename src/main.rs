//! fieldmcp command-line entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fieldmcp::commands::{chat, tools};
use fieldmcp::gateway;

/// Multi-server MCP host for industrial protocol tool servers.
#[derive(Parser, Debug)]
#[command(name = "fieldmcp")]
#[command(author, version, about)]
#[command(long_about = r#"
fieldmcp starts industrial protocol tool servers (Modbus, S7comm, BACnet, ...)
as child processes, speaks MCP with each over stdio, and lets a language model
or a browser call their tools.

Servers are auto-discovered from `*-python` projects under the project root
and merged with mcp-servers.json (entries in the file win). The project root is
$FIELDMCP_PROJECT_ROOT or the current directory.

Example:
  fieldmcp list-tools --servers modbus,s7comm
  fieldmcp call modbus read_holding_registers '{"address": 0, "count": 4}'
  fieldmcp chat
  fieldmcp gateway --bind 0.0.0.0:8765
"#)]
struct Cli {
    /// Server table (mcp-servers.json)
    #[arg(long, global = true, value_name = "PATH", env = "FIELDMCP_SERVERS")]
    config: Option<PathBuf>,

    /// Models file (models.yaml)
    #[arg(long, global = true, value_name = "PATH", env = "FIELDMCP_MODELS")]
    models: Option<PathBuf>,

    /// Verbosity (-v mirrors logs to stderr, -vv adds trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat with the model and all tool servers
    Chat {
        /// Only offer tools from these servers
        #[arg(long, value_delimiter = ',')]
        servers: Option<Vec<String>>,
    },
    /// List tools from every server
    ListTools {
        /// Only list these servers
        #[arg(long, value_delimiter = ',')]
        servers: Option<Vec<String>>,
    },
    /// Call one tool and print the result as JSON
    Call {
        server: String,
        tool: String,
        /// Arguments as a JSON object (default `{}`)
        args: Option<String>,
    },
    /// Serve the WebSocket gateway for the browser client
    Gateway {
        #[arg(long, default_value = gateway::DEFAULT_BIND)]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    fieldmcp::init_tracing(cli.verbose, cli.log_json);

    let project_root = fieldmcp::resolve_project_root();
    let models = match &cli.command {
        Command::Chat { .. } => Some(fieldmcp::load_models(&project_root, cli.models.as_deref())?),
        _ => fieldmcp::load_models_optional(&project_root, cli.models.as_deref())?,
    };
    let enabled = models.as_ref().and_then(|m| m.enabled_servers.as_deref());
    let servers = fieldmcp::resolve_servers_config(&project_root, cli.config.as_deref(), enabled)
        .context("resolving server configuration")?;
    let client = Arc::new(fieldmcp::build_client(servers, models.as_ref()));

    let result = match cli.command {
        Command::Chat { servers } => {
            let models = models.context("models.yaml is required for chat")?;
            chat::run(client.clone(), models, servers).await
        }
        Command::ListTools { servers } => {
            tools::list_tools(&client, servers.as_deref()).await;
            Ok(())
        }
        Command::Call { server, tool, args } => {
            let ok = tools::call(&client, &server, &tool, args.as_deref()).await;
            client.stop_all().await;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Gateway { bind } => gateway::serve(client.clone(), bind).await,
    };

    client.stop_all().await;
    tracing::info!("=== fieldmcp exiting ===");
    result
}
