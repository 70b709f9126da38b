//! Key-based edits behind `mcp-search set` and `mcp-search unset`.

use crate::core::config::data::Config;

pub const SETTING_KEYS: &[&str] = &[
    "base-url",
    "server-name",
    "tool-name",
    "protocol-version",
    "connect-timeout-ms",
    "request-timeout-ms",
    "heartbeat-interval-ms",
    "handshake-delay-ms",
    "reconnect-initial-delay-ms",
    "reconnect-max-delay-ms",
    "reconnect-max-attempts",
];

fn unknown_key(key: &str) -> String {
    format!(
        "Unknown setting '{key}'. Available settings: {}",
        SETTING_KEYS.join(", ")
    )
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| format!("{key} expects a whole number, got '{value}'"))
}

impl Config {
    /// Applies `value` to the setting named `key` and returns a confirmation.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<String, String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(format!("{key} needs a value; use unset to clear it"));
        }

        match key {
            "base-url" => {
                reqwest::Url::parse(trimmed)
                    .map_err(|err| format!("Invalid URL {trimmed}: {err}"))?;
                self.base_url = Some(trimmed.to_string());
            }
            "server-name" => self.server_name = Some(trimmed.to_string()),
            "tool-name" => self.tool_name = Some(trimmed.to_string()),
            "protocol-version" => self.protocol_version = Some(trimmed.to_string()),
            "connect-timeout-ms" => self.connect_timeout_ms = Some(parse_number(key, trimmed)?),
            "request-timeout-ms" => self.request_timeout_ms = Some(parse_number(key, trimmed)?),
            "heartbeat-interval-ms" => {
                self.heartbeat_interval_ms = Some(parse_number(key, trimmed)?)
            }
            "handshake-delay-ms" => self.handshake_delay_ms = Some(parse_number(key, trimmed)?),
            "reconnect-initial-delay-ms" => {
                self.reconnect.initial_delay_ms = Some(parse_number(key, trimmed)?)
            }
            "reconnect-max-delay-ms" => {
                self.reconnect.max_delay_ms = Some(parse_number(key, trimmed)?)
            }
            "reconnect-max-attempts" => {
                self.reconnect.max_attempts = Some(parse_number(key, trimmed)?)
            }
            _ => return Err(unknown_key(key)),
        }
        Ok(format!("✅ Set {key} to: {trimmed}"))
    }

    pub fn unset_value(&mut self, key: &str) -> Result<String, String> {
        match key {
            "base-url" => self.base_url = None,
            "server-name" => self.server_name = None,
            "tool-name" => self.tool_name = None,
            "protocol-version" => self.protocol_version = None,
            "connect-timeout-ms" => self.connect_timeout_ms = None,
            "request-timeout-ms" => self.request_timeout_ms = None,
            "heartbeat-interval-ms" => self.heartbeat_interval_ms = None,
            "handshake-delay-ms" => self.handshake_delay_ms = None,
            "reconnect-initial-delay-ms" => self.reconnect.initial_delay_ms = None,
            "reconnect-max-delay-ms" => self.reconnect.max_delay_ms = None,
            "reconnect-max-attempts" => self.reconnect.max_attempts = None,
            _ => return Err(unknown_key(key)),
        }
        Ok(format!("✅ Unset {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_round_trips_through_set_and_unset() {
        for key in SETTING_KEYS {
            let mut config = Config::default();
            let value = if *key == "base-url" {
                "https://mcp.example.com/sse"
            } else {
                "42"
            };
            config.set_value(key, value).expect("set should succeed");
            assert_ne!(config, Config::default(), "{key} was not stored");
            config.unset_value(key).expect("unset should succeed");
            assert_eq!(config, Config::default(), "{key} was not cleared");
        }
    }

    #[test]
    fn rejects_bad_values_and_unknown_keys() {
        let mut config = Config::default();
        assert!(config.set_value("base-url", "not a url").is_err());
        assert!(config.set_value("request-timeout-ms", "soon").is_err());
        assert!(config.set_value("tool-name", "  ").is_err());
        let err = config.set_value("theme", "dark").unwrap_err();
        assert!(err.contains("Available settings"));
        assert!(config.unset_value("theme").is_err());
    }

    #[test]
    fn describe_lists_every_key() {
        let mut config = Config::default();
        config.set_value("tool-name", "web_search").unwrap();
        let lines = config.describe();
        assert_eq!(lines.len(), SETTING_KEYS.len());
        assert!(lines.contains(&"tool-name: web_search".to_string()));
        assert!(lines.contains(&"base-url: (unset)".to_string()));
    }
}
