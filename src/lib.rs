pub mod agent_core;
pub mod commands;
pub mod gateway;
pub mod inference;
pub mod mcp_client;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;

use inference::config::{find_config_path, load_models_config, PROJECT_ROOT_ENV};
use inference::ModelsConfig;
use mcp_client::discovery::{discover_servers, load_servers_file, merge_configs};
use mcp_client::{McpClient, McpServersConfig, ServerConfig};

/// Default provider table, looked up in the project root.
pub const SERVERS_FILE: &str = "mcp-servers.json";

/// Env var injected into every server so they share the host's data dir.
const DATA_DIR_ENV: &str = "FIELDMCP_DATA_DIR";

/// Return the platform-standard data directory for fieldmcp.
///
/// - macOS: `~/Library/Application Support/fieldmcp/`
/// - Windows: `{FOLDERID_RoamingAppData}\fieldmcp\`
/// - Linux: `$XDG_DATA_HOME/fieldmcp/` (fallback `~/.local/share/fieldmcp/`)
///
/// Falls back to `~/.fieldmcp/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("fieldmcp");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fieldmcp")
}

// ─── Logging ────────────────────────────────────────────────────────────────

/// Initialize tracing: a rotating log file in the data directory, mirrored to
/// stderr when `verbose > 0`. Stdout stays free for command output.
///
/// On each startup existing logs rotate (fieldmcp.log → .1 → .2 → .3). If the
/// log file cannot be opened, logging goes to stderr only.
///
/// With `json` the file gets one JSON object per event instead of text.
///
/// Returns the log file path when file logging is active.
pub fn init_tracing(verbose: u8, json: bool) -> Option<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    let log_path = log_dir.join("fieldmcp.log");

    let log_file = std::fs::create_dir_all(&log_dir)
        .and_then(|()| {
            rotate_log_file(&log_path, 3);
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
        })
        .ok();

    let default_filter = match verbose {
        0 => "fieldmcp=info,warn",
        1 => "fieldmcp=debug,info",
        _ => "fieldmcp=trace,debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (text_layer, json_layer) = match log_file.as_ref().and_then(|f| f.try_clone().ok()) {
        Some(f) if json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_writer(FlushingWriter::new(f))
                    .with_target(true),
            ),
        ),
        Some(f) => (
            Some(
                fmt::layer()
                    .with_writer(FlushingWriter::new(f))
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(false),
            ),
            None,
        ),
        None => (None, None),
    };
    let stderr_layer = (verbose > 0 || log_file.is_none()).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(stderr_layer)
        .try_init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== fieldmcp starting ==="
    );

    log_file.map(|_| log_path)
}

/// Rotate log files: `fieldmcp.log` → `.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the process is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// Determine the project root: `FIELDMCP_PROJECT_ROOT` if set, else the
/// current directory.
pub fn resolve_project_root() -> PathBuf {
    if let Ok(root) = std::env::var(PROJECT_ROOT_ENV) {
        if !root.is_empty() {
            return PathBuf::from(root);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Load `models.yaml`, from `explicit` if given or by searching upward from
/// the project root.
pub fn load_models(project_root: &Path, explicit: Option<&Path>) -> anyhow::Result<ModelsConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => find_config_path(project_root)?,
    };
    let config = load_models_config(&path)
        .with_context(|| format!("loading models config {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        active = %config.active_model,
        models = config.models.len(),
        "loaded models config"
    );
    Ok(config)
}

/// Load `models.yaml` only if one can be found. An explicit path that fails
/// to load is still an error.
pub fn load_models_optional(
    project_root: &Path,
    explicit: Option<&Path>,
) -> anyhow::Result<Option<ModelsConfig>> {
    if explicit.is_some() {
        return load_models(project_root, explicit).map(Some);
    }
    match find_config_path(project_root) {
        Ok(path) => load_models(project_root, Some(&path)).map(Some),
        Err(_) => Ok(None),
    }
}

/// Resolve the server table.
///
/// 1. Auto-discovers `*-python` protocol servers under the project root.
/// 2. Loads the provider table (`explicit`, else `mcp-servers.json` in the
///    project root if present). An explicit file that is missing or invalid
///    is an error.
/// 3. Merges: table entries fully replace discovered entries.
/// 4. Applies the `enabled_servers` allowlist.
/// 5. Resolves relative paths and venvs, and injects the data dir env var.
pub fn resolve_servers_config(
    project_root: &Path,
    explicit: Option<&Path>,
    enabled_servers: Option<&[String]>,
) -> anyhow::Result<McpServersConfig> {
    let discovered = discover_servers(project_root);
    tracing::info!(
        discovered = discovered.len(),
        servers = ?discovered.keys().collect::<Vec<_>>(),
        "auto-discovered protocol servers"
    );

    let overrides = match explicit {
        Some(path) => load_servers_file(path)
            .with_context(|| format!("loading servers file {}", path.display()))?,
        None => {
            let default = project_root.join(SERVERS_FILE);
            if default.exists() {
                load_servers_file(&default).unwrap_or_else(|e| {
                    tracing::warn!(path = %default.display(), error = %e, "ignoring invalid servers file");
                    HashMap::new()
                })
            } else {
                HashMap::new()
            }
        }
    };

    let mut servers = merge_configs(discovered, overrides);
    if let Some(allowlist) = enabled_servers {
        filter_by_enabled_servers(&mut servers, allowlist);
    }

    let base_dir = match explicit.and_then(Path::parent) {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => project_root.to_path_buf(),
    };
    let app_data = data_dir().to_string_lossy().into_owned();
    for server_config in servers.values_mut() {
        server_config.resolve_paths(&base_dir);
        server_config
            .env
            .entry(DATA_DIR_ENV.to_string())
            .or_insert_with(|| app_data.clone());
    }

    tracing::info!(
        server_count = servers.len(),
        servers = ?servers.keys().collect::<Vec<_>>(),
        "final server config"
    );
    Ok(McpServersConfig { servers })
}

/// Keep only servers named in `allowlist`. An empty list keeps everything.
fn filter_by_enabled_servers(servers: &mut HashMap<String, ServerConfig>, allowlist: &[String]) {
    if allowlist.is_empty() {
        return;
    }
    let allowed: HashSet<&str> = allowlist.iter().map(String::as_str).collect();
    let before = servers.len();
    servers.retain(|name, _| allowed.contains(name.as_str()));
    tracing::info!(
        before,
        after = servers.len(),
        enabled = ?allowlist,
        "filtered servers by enabled_servers allowlist"
    );
}

/// Build the shared client, applying `call_timeout_ms` from the models
/// config when present.
pub fn build_client(servers: McpServersConfig, models: Option<&ModelsConfig>) -> McpClient {
    let mut client = McpClient::new(servers);
    if let Some(timeout_ms) = models.and_then(|m| m.call_timeout_ms) {
        client.set_call_timeout(timeout_ms);
    }
    client
}

// ─── Tests ──────────────────────────────────────────────────────────────────
