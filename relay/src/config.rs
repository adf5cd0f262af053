//! Node configuration: a YAML file plus flag/environment overrides.

use std::path::Path;

use federation::FederationConfig;
use runtime::RuntimeConfig;
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub federation: FederationConfig,
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
    /// statsd exporter target, `host:port`; metrics are recorded but not
    /// exported when absent.
    pub statsd_addr: Option<String>,
    /// tracing env-filter directive, e.g. `info` or `runtime=debug`.
    pub log_filter: Option<String>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_values_override_defaults_only_where_present() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port: 9001\nttl_default: 4\nmessage_timeout_secs: 2\nstatsd_addr: \"127.0.0.1:8125\""
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.federation.port, 9001);
        assert_eq!(config.federation.ttl_default, 4);
        assert_eq!(config.runtime.message_timeout_secs, 2);
        assert_eq!(config.statsd_addr.as_deref(), Some("127.0.0.1:8125"));

        // Untouched keys keep their defaults.
        assert_eq!(config.federation.host, "0.0.0.0");
        assert_eq!(config.runtime.mailbox_capacity, 100);
    }

    #[test]
    fn peers_on_start_parse_from_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "peers_on_start:\n  - node_id: abcd0123abcd0123\n    address: \"ws://10.0.0.2:8080\""
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.federation.peers_on_start.len(), 1);
        assert_eq!(
            config.federation.peers_on_start[0].node_id,
            "abcd0123abcd0123"
        );
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port: [not a number").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Yaml(_))
        ));
    }
}
