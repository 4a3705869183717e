//! Interactive terminal chat.
//!
//! Reads one message per line from stdin, runs it through the
//! [`ChatOrchestrator`], and prints the answer on stdout. Tool activity is
//! shown on stderr as it happens. Ctrl-C while a turn is running stops
//! waiting for it; at the prompt it leaves, as do Ctrl-D and `/quit`.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;

use crate::agent_core::{AgentError, AgentEvent, ChatOrchestrator};
use crate::inference::{ChatModel, InferenceClient, ModelsConfig};
use crate::mcp_client::McpClient;

/// A line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplInput<'a> {
    Quit,
    Reset,
    Tools,
    Help,
    Empty,
    /// `/restart <server>`
    Restart(&'a str),
    Message(&'a str),
}

pub fn parse_input(line: &str) -> ReplInput<'_> {
    match line.trim() {
        "" => ReplInput::Empty,
        "/quit" | "/exit" => ReplInput::Quit,
        "/reset" => ReplInput::Reset,
        "/tools" => ReplInput::Tools,
        "/help" => ReplInput::Help,
        text => match text.strip_prefix("/restart ") {
            Some(server) if !server.trim().is_empty() => ReplInput::Restart(server.trim()),
            _ => ReplInput::Message(text),
        },
    }
}

const HELP: &str = "\
Commands:
  /tools             re-list tools from all servers
  /restart <server>  restart a server and reset its restart budget
  /reset             forget the conversation
  /quit              exit (also Ctrl-D, or Ctrl-C at the prompt)
Ctrl-C while the assistant is working stops waiting for it.";

/// One-line rendering of an event for the terminal. `None` for events that
/// are not shown.
pub fn render_event(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::ToolCallStarted {
            tool_name,
            arguments,
            ..
        } => Some(format!("  → {tool_name} {arguments}")),
        AgentEvent::ToolCallFinished {
            tool_name,
            success,
            execution_time_ms,
            ..
        } => {
            let mark = if *success { "ok" } else { "failed" };
            Some(format!("  ← {tool_name} {mark} ({execution_time_ms}ms)"))
        }
        AgentEvent::RoundLimitReached { rounds } => {
            Some(format!("  stopped after {rounds} tool rounds"))
        }
        AgentEvent::ModelTurnStarted { .. } | AgentEvent::FinalAnswer { .. } => None,
    }
}

/// Read the next prompt line. `None` at end of input or when `interrupt`
/// fires first.
pub async fn next_prompt_line<R, F>(
    lines: &mut Lines<R>,
    interrupt: F,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    F: Future,
{
    tokio::select! {
        line = lines.next_line() => line,
        _ = interrupt => Ok(None),
    }
}

/// Run the chat loop until stdin closes or the user quits.
pub async fn run(
    client: Arc<McpClient>,
    models: ModelsConfig,
    servers: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let model = InferenceClient::from_config(models.clone())?;
    if !model.health_check().await {
        tracing::warn!(
            endpoint = %model.current_base_url(),
            "model endpoint not reachable, requests will use the fallback chain"
        );
        eprintln!(
            "warning: model endpoint {} is not reachable",
            model.current_base_url()
        );
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = render_event(&event) {
                eprintln!("{line}");
            }
        }
    });

    let filter = servers.or_else(|| models.enabled_servers.clone());
    let mut chat = ChatOrchestrator::new(model, client)
        .with_max_tool_rounds(models.max_tool_rounds)
        .with_max_result_chars(models.max_tool_result_chars)
        .with_server_filter(filter)
        .with_system_prompt(models.system_prompt.clone())
        .with_events(tx);

    refresh(&mut chat).await;
    println!(
        "fieldmcp chat ({}), {} tools. /help for commands.",
        chat.model().model_name(),
        chat.tool_count()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let Some(line) = next_prompt_line(&mut lines, tokio::signal::ctrl_c()).await? else {
            println!();
            break;
        };

        match parse_input(&line) {
            ReplInput::Empty => continue,
            ReplInput::Quit => break,
            ReplInput::Help => println!("{HELP}"),
            ReplInput::Reset => {
                chat.reset();
                println!("conversation cleared");
            }
            ReplInput::Tools => refresh(&mut chat).await,
            ReplInput::Restart(server) => {
                let restarted = chat.client().restart_server(server).await;
                match restarted {
                    Ok(tools) => {
                        println!("{server} restarted, {} tools", tools.len());
                        refresh(&mut chat).await;
                    }
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            ReplInput::Message(text) => {
                let outcome = tokio::select! {
                    result = chat.send_message(text) => Some(result),
                    _ = tokio::signal::ctrl_c() => None,
                };
                match outcome {
                    Some(Ok(answer)) => println!("\n{answer}\n"),
                    Some(Err(AgentError::RoundLimitReached { rounds })) => {
                        eprintln!("stopped: the model kept calling tools for {rounds} rounds");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "chat turn failed");
                        eprintln!("error: {e}");
                    }
                    None => {
                        let closed = chat.recover_after_cancel();
                        tracing::info!(closed_calls = closed, "turn cancelled by user");
                        eprintln!("\ncancelled");
                    }
                }
            }
        }
    }

    drop(chat);
    let _ = printer.await;
    Ok(())
}

async fn refresh<M: ChatModel>(chat: &mut ChatOrchestrator<M>) {
    for (server, err) in chat.refresh_tools().await {
        eprintln!("warning: {server} unavailable: {err}");
    }
}
