use std::time::Duration;

/// Relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Identifier of this process within the fleet, reported by `/health`.
    pub instance_id: String,
    /// Redis connection string shared by every instance. When unset the relay
    /// runs in single-process mode on in-memory presence and bus.
    pub redis_url: Option<String>,
    /// Prefix for every Redis key and pub/sub channel the relay touches.
    pub key_prefix: String,
    /// Optional shared secret required on the WebSocket upgrade.
    pub auth_api_key: Option<String>,
    /// Lifetime of a presence record absent a refresh.
    pub presence_ttl_secs: u64,
    /// How often each connection refreshes its presence record.
    pub presence_refresh_secs: u64,
    /// How long a new connection may take to send `hello`.
    pub handshake_timeout_secs: u64,
    /// Consecutive malformed frames tolerated before the connection is closed.
    pub max_malformed_frames: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if the presence timing is inconsistent.
    pub fn from_env() -> Self {
        let config = Self {
            port: parsed_var("PORT", 8000),
            instance_id: optional_var("INSTANCE_ID").unwrap_or_else(|| "unknown-instance".to_string()),
            redis_url: optional_var("REDIS_URL"),
            key_prefix: optional_var("REDIS_KEY_PREFIX").unwrap_or_else(|| "relay".to_string()),
            auth_api_key: optional_var("AUTH_API_KEY"),
            presence_ttl_secs: parsed_var("PRESENCE_TTL_SECS", 120),
            presence_refresh_secs: parsed_var("PRESENCE_REFRESH_SECS", 30),
            handshake_timeout_secs: parsed_var("HANDSHAKE_TIMEOUT_SECS", 10),
            max_malformed_frames: parsed_var("MAX_MALFORMED_FRAMES", 5),
        };
        if let Err(reason) = config.validate() {
            panic!("invalid relay configuration: {reason}");
        }
        config
    }

    /// A refresh must land at least twice inside one TTL window so that a single
    /// missed cycle never expires a live connection.
    pub fn validate(&self) -> Result<(), String> {
        if self.presence_refresh_secs == 0 {
            return Err("PRESENCE_REFRESH_SECS must be greater than zero".to_string());
        }
        if self.presence_refresh_secs * 2 >= self.presence_ttl_secs {
            return Err(format!(
                "PRESENCE_REFRESH_SECS ({}) must be less than half of PRESENCE_TTL_SECS ({})",
                self.presence_refresh_secs, self.presence_ttl_secs
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err("HANDSHAKE_TIMEOUT_SECS must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn presence_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.presence_refresh_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            instance_id: "unknown-instance".to_string(),
            redis_url: None,
            key_prefix: "relay".to_string(),
            auth_api_key: None,
            presence_ttl_secs: 120,
            presence_refresh_secs: 30,
            handshake_timeout_secs: 10,
            max_malformed_frames: 5,
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    optional_var(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn refresh_must_fit_twice_in_ttl() {
        let config = Config {
            presence_ttl_secs: 60,
            presence_refresh_secs: 30,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("PRESENCE_REFRESH_SECS"));
    }

    #[test]
    fn zero_refresh_is_rejected() {
        let config = Config {
            presence_refresh_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
