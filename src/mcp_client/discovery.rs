//! MCP Server Auto-Discovery: scan a projects directory and build configs
//! from conventions.
//!
//! Protocol servers live in `*-python` project directories, either directly
//! under the scanned root or one level down inside a per-protocol folder:
//!
//! ```text
//! root/
//!   MODBUS-Project/modbus-python/src/modbus_mcp/cli.py
//!   S7comm-Project/s7comm-python/src/s7comm_mcp/server.py
//!   mqtt-python/src/mqtt_mcp/mqtt_server.py
//! ```
//!
//! A project is recognised by `pyproject.toml` or a `src/<pkg>_mcp/`
//! package. The JSON servers file becomes an optional override.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::codec;
use super::errors::McpError;
use super::types::{McpServersConfig, ServerConfig};

/// Suffix marking a Python protocol-server project directory.
const PYTHON_PROJECT_SUFFIX: &str = "-python";

// ─── Platform Helpers ────────────────────────────────────────────────────────

/// Platform-correct Python command.
///
/// macOS 12.3+ removed the `python` symlink; only `python3` exists.
/// Windows installs Python as `python.exe` via the official installer.
fn default_python_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "python"
    } else {
        "python3"
    }
}

// ─── Detection ───────────────────────────────────────────────────────────────

/// The `src/<pkg>_mcp` package directory of a project, if any.
fn find_package(project_dir: &Path) -> Option<PathBuf> {
    let mut packages: Vec<PathBuf> = std::fs::read_dir(project_dir.join("src"))
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with("_mcp"))
        })
        .collect();
    packages.sort();
    packages.into_iter().next()
}

fn is_python_project(dir: &Path) -> bool {
    let named = dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PYTHON_PROJECT_SUFFIX));
    named && (dir.join("pyproject.toml").is_file() || find_package(dir).is_some())
}

/// Detect the Python entry module inside a package.
///
/// Prefers `cli.py` (the console entry point), then a `*_server.py`
/// module, then `server.py`.
fn detect_entry_module(package_dir: &Path) -> String {
    if package_dir.join("cli.py").is_file() {
        return "cli".to_string();
    }

    let mut server_modules: Vec<String> = std::fs::read_dir(package_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.file_name().to_str().map(String::from))
                .filter_map(|n| n.strip_suffix(".py").map(String::from))
                .filter(|stem| stem.ends_with("_server"))
                .collect()
        })
        .unwrap_or_default();
    server_modules.sort();

    // Fallback to convention; fails at runtime with a clear error if absent.
    server_modules
        .into_iter()
        .next()
        .unwrap_or_else(|| "server".to_string())
}

/// Server name for a project directory: `S7comm-python` → `s7comm`.
///
/// Characters outside `[A-Za-z0-9_-]` become `_` so the name can be encoded.
fn server_name(dir_name: &str) -> String {
    dir_name
        .strip_suffix(PYTHON_PROJECT_SUFFIX)
        .unwrap_or(dir_name)
        .to_ascii_lowercase()
        .chars()
        .map(|c| if codec::is_identifier(c.encode_utf8(&mut [0; 4])) { c } else { '_' })
        .collect()
}

// ─── Config Generation ──────────────────────────────────────────────────────

/// Generate a `ServerConfig` for a Python protocol server.
///
/// Runs `python3 -m <pkg>.<entry>` from the project directory with `src`
/// on `PYTHONPATH`. If a `.venv` directory exists in the project, sets
/// `venv: ".venv"`.
fn py_config(project_dir: &Path) -> ServerConfig {
    let venv = if project_dir.join(".venv").is_dir() {
        Some(".venv".to_string())
    } else {
        None
    };

    let (package, entry) = match find_package(project_dir) {
        Some(pkg_dir) => {
            let package = pkg_dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            (package, detect_entry_module(&pkg_dir))
        }
        None => {
            let name = project_dir
                .file_name()
                .and_then(|n| n.to_str())
                .map(server_name)
                .unwrap_or_default();
            (format!("{name}_mcp"), "server".to_string())
        }
    };

    let mut env = HashMap::new();
    env.insert(
        "PYTHONPATH".to_string(),
        project_dir.join("src").to_string_lossy().into_owned(),
    );

    ServerConfig {
        command: default_python_command().to_string(),
        args: vec!["-m".to_string(), format!("{package}.{entry}")],
        env,
        cwd: Some(project_dir.to_string_lossy().into_owned()),
        venv,
        enabled: true,
    }
}

// ─── Discovery ──────────────────────────────────────────────────────────────

/// Scan `root` (and each of its subdirectories) for `*-python` protocol
/// server projects and generate `ServerConfig` entries.
///
/// Skips directories starting with `_` or `.`. Returns an empty map if the
/// directory doesn't exist.
pub fn discover_servers(root: &Path) -> HashMap<String, ServerConfig> {
    let mut configs = HashMap::new();

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(
                path = %root.display(),
                error = %e,
                "servers directory not found, skipping auto-discovery"
            );
            return configs;
        }
    };

    for path in visible_subdirs(entries) {
        if is_python_project(&path) {
            add_project(&mut configs, &path);
            continue;
        }
        // One level down: `MODBUS-Project/modbus-python`.
        if let Ok(children) = std::fs::read_dir(&path) {
            for child in visible_subdirs(children) {
                if is_python_project(&child) {
                    add_project(&mut configs, &child);
                }
            }
        }
    }

    configs
}

fn visible_subdirs(entries: std::fs::ReadDir) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('_') && !n.starts_with('.'))
        })
        .collect();
    dirs.sort();
    dirs
}

fn add_project(configs: &mut HashMap<String, ServerConfig>, project_dir: &Path) {
    let Some(dir_name) = project_dir.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let name = server_name(dir_name);
    if configs.contains_key(&name) {
        tracing::warn!(
            server = %name,
            path = %project_dir.display(),
            "duplicate server name during discovery, keeping the first"
        );
        return;
    }
    let config = py_config(project_dir);
    tracing::debug!(server = %name, args = ?config.args, "auto-discovered MCP server");
    configs.insert(name, config);
}

// ─── Servers File ───────────────────────────────────────────────────────────

/// Load a `mcp-servers.json` file.
pub fn load_servers_file(path: &Path) -> Result<HashMap<String, ServerConfig>, McpError> {
    let content = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("cannot read {}: {e}", path.display()),
    })?;
    let cfg: McpServersConfig =
        serde_json::from_str(&content).map_err(|e| McpError::ConfigError {
            reason: format!("cannot parse {}: {e}", path.display()),
        })?;
    tracing::info!(
        path = %path.display(),
        count = cfg.servers.len(),
        "loaded MCP servers file"
    );
    Ok(cfg.servers)
}

// ─── Merge ──────────────────────────────────────────────────────────────────

/// Merge auto-discovered configs with explicit entries from the servers file.
///
/// Explicit entries **fully replace** discovered entries for the same server
/// name. Explicit-only servers (not on disk) are added as-is.
pub fn merge_configs(
    mut discovered: HashMap<String, ServerConfig>,
    overrides: HashMap<String, ServerConfig>,
) -> HashMap<String, ServerConfig> {
    discovered.extend(overrides);
    discovered
}

// ─── Tests ──────────────────────────────────────────────────────────────────
