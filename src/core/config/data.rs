use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Reconnection settings as stored on disk.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl ReconnectConfig {
    fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Event-stream URL of the MCP search server (e.g. "https://mcp.example.com/sse")
    pub base_url: Option<String>,
    /// Name reported in status output; also the keyring account for the token
    pub server_name: Option<String>,
    /// MCP tool invoked for each search
    pub tool_name: Option<String>,
    /// MCP protocol version requested during initialize
    pub protocol_version: Option<String>,
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    /// Pause between handshake messages
    pub handshake_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "ReconnectConfig::is_empty")]
    pub reconnect: ReconnectConfig,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.config/mcp-search/config.toml` → `~/.config/mcp-search/config.toml`
/// - Windows: paths are shown unchanged
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
