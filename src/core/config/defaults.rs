use crate::core::config::data::Config;
use crate::mcp::backoff::BackoffConfig;
use reqwest::Url;
use rust_mcp_schema::LATEST_PROTOCOL_VERSION;
use std::time::Duration;

pub const DEFAULT_SERVER_NAME: &str = "mcp-search";
pub const DEFAULT_TOOL_NAME: &str = "search";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HANDSHAKE_DELAY_MS: u64 = 50;

/// Runtime settings injected into a search client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: Url,
    pub server_name: String,
    pub tool_name: String,
    pub protocol_version: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub handshake_delay: Duration,
    pub reconnect: BackoffConfig,
}

impl ClientConfig {
    /// Default settings for the given stream URL.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            server_name: DEFAULT_SERVER_NAME.to_string(),
            tool_name: DEFAULT_TOOL_NAME.to_string(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            handshake_delay: Duration::from_millis(DEFAULT_HANDSHAKE_DELAY_MS),
            reconnect: BackoffConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout.is_zero() {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("Heartbeat interval must be > 0".to_string());
        }
        if self.tool_name.trim().is_empty() {
            return Err("Tool name must not be empty".to_string());
        }
        self.reconnect.validate()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

impl Config {
    /// Configured server name, or the default when unset.
    pub fn server_name(&self) -> &str {
        non_blank(&self.server_name).unwrap_or(DEFAULT_SERVER_NAME)
    }

    /// Resolves on-disk settings into a validated [`ClientConfig`].
    pub fn client_config(&self) -> Result<ClientConfig, String> {
        let base_url = non_blank(&self.base_url).ok_or_else(|| {
            "MCP base_url is not configured. Set base_url in the config file.".to_string()
        })?;
        let base_url =
            Url::parse(base_url).map_err(|err| format!("Invalid MCP base_url {base_url}: {err}"))?;

        let mut config = ClientConfig::new(base_url);
        config.server_name = self.server_name().to_string();
        if let Some(tool) = non_blank(&self.tool_name) {
            config.tool_name = tool.to_string();
        }
        if let Some(version) = non_blank(&self.protocol_version) {
            config.protocol_version = version.to_string();
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            config.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.handshake_delay_ms {
            config.handshake_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect.initial_delay_ms {
            config.reconnect.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect.max_delay_ms {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = self.reconnect.max_attempts {
            config.reconnect.max_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }
}
