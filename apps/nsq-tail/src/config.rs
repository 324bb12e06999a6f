//! nsq-tail configuration.
//!
//! Read from TOML (`--config <path>`, or `~/.config/nsqlink/tail.toml` when
//! present), then overridden by `NSQLINK_*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use nsqlink_client::PoolConfig;
use nsqlink_protocol::address::split_list;

/// What the tail does with the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailMode {
    /// Subscribe to `topic`/`channel` and print every message.
    #[default]
    Consume,
    /// Publish each stdin line to `topic`.
    Publish,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Brokers to connect to directly (`host:port`).
    #[serde(default)]
    pub nsqd_addresses: Vec<String>,

    /// Full lookupd query URLs, e.g. `http://127.0.0.1:4161/lookup?topic=test`.
    #[serde(default)]
    pub lookupd_urls: Vec<String>,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_channel")]
    pub channel: String,

    #[serde(default)]
    pub mode: TailMode,

    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_topic() -> String {
    "test".into()
}

fn default_channel() -> String {
    "nsq-tail".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nsqd_addresses: Vec::new(),
            lookupd_urls: Vec::new(),
            topic: default_topic(),
            channel: default_channel(),
            mode: TailMode::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl Config {
    /// Loads the file at `path`, or the default location if it exists.
    ///
    /// Environment overrides are applied afterwards and the client id
    /// falls back to the hostname.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = default_path();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Config::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        if config.pool.client_id.is_none() {
            config.pool.client_id = hostname::get().ok().and_then(|h| h.into_string().ok());
        }
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration file read");
        Ok(config)
    }

    /// Applies `NSQLINK_*` overrides looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(topic) = var("NSQLINK_TOPIC") {
            self.topic = topic;
        }
        if let Some(channel) = var("NSQLINK_CHANNEL") {
            self.channel = channel;
        }
        if let Some(addrs) = var("NSQLINK_NSQD_ADDRESSES") {
            self.nsqd_addresses = split_list(&addrs);
        }
        if let Some(urls) = var("NSQLINK_LOOKUPD_URLS") {
            self.lookupd_urls = split_list(&urls);
        }
        if let Some(mode) = var("NSQLINK_MODE") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "consume" => self.mode = TailMode::Consume,
                "publish" => self.mode = TailMode::Publish,
                other => tracing::warn!(mode = %other, "unknown NSQLINK_MODE, ignoring"),
            }
        }
    }

    /// Rejects a configuration with nowhere to connect.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nsqd_addresses.is_empty() && self.lookupd_urls.is_empty() {
            anyhow::bail!("no nsqd_addresses or lookupd_urls configured");
        }
        Ok(())
    }
}

fn default_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".config").join("nsqlink").join("tail.toml")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.topic, "test");
        assert_eq!(config.channel, "nsq-tail");
        assert_eq!(config.mode, TailMode::Consume);
        assert!(config.nsqd_addresses.is_empty());
        assert!(config.validate().is_err());
    }

    #[test]
    fn full_toml() {
        let toml_str = r#"
            nsqd_addresses = ["127.0.0.1:4150", "127.0.0.1:4250"]
            topic = "orders"
            channel = "billing"
            mode = "publish"

            [pool]
            lookupd_interval_secs = 10
            rdy_count = 5

            [pool.reconnect]
            max_delay_ms = 2000
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.nsqd_addresses.len(), 2);
        assert_eq!(config.topic, "orders");
        assert_eq!(config.mode, TailMode::Publish);
        assert_eq!(config.pool.lookupd_interval_secs, 10);
        assert_eq!(config.pool.rdy_count, 5);
        assert_eq!(config.pool.reconnect.max_delay_ms, 2000);
        assert_eq!(config.pool.reconnect.initial_delay_ms, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: Config =
            toml::from_str(r#"lookupd_urls = ["http://127.0.0.1:4161/lookup?topic=test"]"#).unwrap();
        assert_eq!(config.topic, "test");
        assert_eq!(config.pool, PoolConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NSQLINK_TOPIC", "events"),
            ("NSQLINK_NSQD_ADDRESSES", "a:4150, b:4150,"),
            ("NSQLINK_MODE", "Publish"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.topic, "events");
        assert_eq!(config.channel, "nsq-tail");
        assert_eq!(config.nsqd_addresses, vec!["a:4150", "b:4150"]);
        assert_eq!(config.mode, TailMode::Publish);
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tail.toml");
        std::fs::write(&path, "nsqd_addresses = [\"127.0.0.1:4150\"]\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.nsqd_addresses.is_empty());
    }

    #[test]
    fn load_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&tmp.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn default_path_is_under_nsqlink() {
        assert!(default_path().to_string_lossy().contains("nsqlink"));
    }
}
