use crate::core::config::data::Config;

fn show<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "(unset)".to_string(),
    }
}

impl Config {
    /// One `key: value` line per setting, in `set` key spelling.
    pub fn describe(&self) -> Vec<String> {
        vec![
            format!("base-url: {}", show(&self.base_url)),
            format!("server-name: {}", show(&self.server_name)),
            format!("tool-name: {}", show(&self.tool_name)),
            format!("protocol-version: {}", show(&self.protocol_version)),
            format!("connect-timeout-ms: {}", show(&self.connect_timeout_ms)),
            format!("request-timeout-ms: {}", show(&self.request_timeout_ms)),
            format!("heartbeat-interval-ms: {}", show(&self.heartbeat_interval_ms)),
            format!("handshake-delay-ms: {}", show(&self.handshake_delay_ms)),
            format!(
                "reconnect-initial-delay-ms: {}",
                show(&self.reconnect.initial_delay_ms)
            ),
            format!(
                "reconnect-max-delay-ms: {}",
                show(&self.reconnect.max_delay_ms)
            ),
            format!(
                "reconnect-max-attempts: {}",
                show(&self.reconnect.max_attempts)
            ),
        ]
    }

    pub fn print_all(&self) {
        println!("Current configuration:");
        for line in self.describe() {
            println!("  {line}");
        }
    }
}
