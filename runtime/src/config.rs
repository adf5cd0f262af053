use std::time::Duration;

use serde::Deserialize;

/// Deadlines and capacities for the actor layer. These are runtime
/// defaults; hosts override them through the node configuration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Bounded mailbox size per server.
    pub mailbox_capacity: usize,
    /// Ceiling for a synchronous reply wait.
    pub message_timeout_secs: u64,
    /// Ceiling for enqueueing onto a full mailbox before surfacing
    /// backpressure.
    pub enqueue_timeout_millis: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            mailbox_capacity: 100,
            message_timeout_secs: 5,
            enqueue_timeout_millis: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bounds() {
        let config = RuntimeConfig::default();
        assert_eq!(config.mailbox_capacity, 100);
        assert_eq!(config.message_timeout(), Duration::from_secs(5));
        assert_eq!(config.enqueue_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"mailbox_capacity": 8}"#).unwrap();
        assert_eq!(config.mailbox_capacity, 8);
        assert_eq!(config.message_timeout_secs, 5);
    }
}
