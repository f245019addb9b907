use std::path::PathBuf;
use std::time::Duration;

/// Bus client configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket URL of the message bus (e.g. `ws://localhost:5000/nats`).
    pub server_url: String,
    /// Where the permissions cache is persisted. `None` keeps it in memory.
    pub permissions_path: Option<PathBuf>,
    /// Timing and limits for the connection facade.
    pub settings: Settings,
}

/// Tunables for connection establishment and the facade state machine.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Delay between connect attempts.
    pub connect_retry_delay: Duration,
    /// How long a superseded connection keeps serving before it is drained.
    pub drain_grace: Duration,
    /// Coalescing window for permission upgrades.
    pub permission_debounce: Duration,
    /// Subscriptions across active and retired connections that trigger standby.
    pub max_subscriptions: usize,
    /// Base delay before resuming after a subscription-limit standby.
    /// Multiplied by the (growing) penalty.
    pub subscription_backoff: Duration,
    /// Growth factor applied to the penalty on each limit breach.
    pub subscription_penalty_factor: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_retry_delay: Duration::from_millis(3000),
            drain_grace: Duration::from_millis(30_000),
            permission_debounce: Duration::from_millis(1000),
            max_subscriptions: 400,
            subscription_backoff: Duration::from_millis(10_000),
            subscription_penalty_factor: 1.25,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            server_url: std::env::var("BUS_SERVER_URL")
                .unwrap_or_else(|_| "ws://localhost:5000/nats".to_string()),
            permissions_path: std::env::var("BUS_PERMISSIONS_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            settings: Settings {
                connect_retry_delay: millis_var("BUS_CONNECT_RETRY_MS")
                    .unwrap_or(defaults.connect_retry_delay),
                drain_grace: millis_var("BUS_DRAIN_GRACE_MS").unwrap_or(defaults.drain_grace),
                permission_debounce: millis_var("BUS_PERMISSION_DEBOUNCE_MS")
                    .unwrap_or(defaults.permission_debounce),
                max_subscriptions: std::env::var("BUS_MAX_SUBSCRIPTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.max_subscriptions),
                subscription_backoff: millis_var("BUS_SUBSCRIPTION_BACKOFF_MS")
                    .unwrap_or(defaults.subscription_backoff),
                subscription_penalty_factor: defaults.subscription_penalty_factor,
            },
        }
    }

    /// In-memory configuration pointing at `server_url`, used by tests and
    /// the in-process demo.
    pub fn local(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            permissions_path: None,
            settings: Settings::default(),
        }
    }
}

fn millis_var(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.connect_retry_delay, Duration::from_secs(3));
        assert_eq!(s.drain_grace, Duration::from_secs(30));
        assert_eq!(s.permission_debounce, Duration::from_secs(1));
        assert_eq!(s.max_subscriptions, 400);
        assert_eq!(s.subscription_penalty_factor, 1.25);
    }

    #[test]
    fn local_config_has_no_persistence() {
        let config = Config::local("memory://test");
        assert_eq!(config.server_url, "memory://test");
        assert!(config.permissions_path.is_none());
    }
}
