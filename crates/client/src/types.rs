//! Public types for the connection pool.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use nsqlink_protocol::constants::{
    DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_LOOKUPD_INTERVAL, DEFAULT_LOOKUPD_TIMEOUT,
    DEFAULT_RDY_COUNT,
};
use nsqlink_protocol::{Message, ProtocolError, command::validate_name};

use crate::connection::Connection;

/// Status of a single broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// Closed; the pool drops the link once it sees this.
    Disconnected = 0,
    /// TCP connect or handshake in progress (also while reconnecting).
    Connecting = 1,
    /// Handshake done; consumers still wait for the subscribe ack.
    Connected = 2,
    /// Broker accepted the subscription (consumer) or ready to publish (producer).
    Ready = 3,
}

impl ConnectionStatus {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::Ready,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

/// Role of a pool, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Producer,
    Consumer { topic: String, channel: String },
}

impl Mode {
    /// Builds a consumer mode after validating both names.
    pub fn consumer(topic: &str, channel: &str) -> Result<Self, ProtocolError> {
        validate_name(topic)?;
        validate_name(channel)?;
        Ok(Mode::Consumer {
            topic: topic.to_string(),
            channel: channel.to_string(),
        })
    }

    pub fn is_consumer(&self) -> bool {
        matches!(self, Mode::Consumer { .. })
    }

    /// Returns `(topic, channel)` for consumers.
    pub fn subscription(&self) -> Option<(&str, &str)> {
        match self {
            Mode::Consumer { topic, channel } => Some((topic, channel)),
            Mode::Producer => None,
        }
    }
}

/// Aggregate lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    /// `close()` was called; links are being torn down.
    Closing,
    /// The last link went away after `close()`.
    Closed,
}

/// Message delivery callback. Returning `true` finishes the message,
/// `false` re-queues it.
pub type MessageCallback = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Fired once per link that becomes ready to publish (producer mode).
pub type ReadyCallback = Box<dyn FnMut(&Connection) + Send>;

/// Fired at most once, when the last link is removed.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// Pool and transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Directory re-query period in seconds.
    #[serde(default = "default_lookupd_interval_secs")]
    pub lookupd_interval_secs: u64,

    /// Directory HTTP timeout in milliseconds.
    #[serde(default = "default_lookupd_timeout_ms")]
    pub lookupd_timeout_ms: u64,

    /// In-flight budget announced after a subscription is accepted.
    #[serde(default = "default_rdy_count")]
    pub rdy_count: u32,

    /// A link with no inbound traffic for this long is considered dead.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    /// Client identifier sent with IDENTIFY. No IDENTIFY is sent when unset.
    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

fn default_lookupd_interval_secs() -> u64 {
    DEFAULT_LOOKUPD_INTERVAL.as_secs()
}

fn default_lookupd_timeout_ms() -> u64 {
    DEFAULT_LOOKUPD_TIMEOUT.as_millis() as u64
}

fn default_rdy_count() -> u32 {
    DEFAULT_RDY_COUNT
}

fn default_heartbeat_timeout_secs() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT.as_secs()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lookupd_interval_secs: default_lookupd_interval_secs(),
            lookupd_timeout_ms: default_lookupd_timeout_ms(),
            rdy_count: default_rdy_count(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            client_id: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Directory re-query period (at least one second).
    pub fn lookupd_interval(&self) -> Duration {
        Duration::from_secs(self.lookupd_interval_secs.max(1))
    }

    pub fn lookupd_timeout(&self) -> Duration {
        Duration::from_millis(self.lookupd_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }
}

/// Backoff between reconnect attempts of a single link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first attempt.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    15_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

/// Floor applied after jitter so a tiny backoff never busy-loops.
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(50);

impl ReconnectConfig {
    /// Unjittered wait before re-dial `attempt` (1-based): the initial delay
    /// multiplied by the backoff factor per earlier attempt, up to the cap.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let steps = attempt.saturating_sub(1).min(63) as i32;
        let ms = (self.initial_delay_ms as f64 * self.backoff_factor.powi(steps))
            .min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// [`base_delay`](Self::base_delay) scaled into `[0.75, 1.25)`, so links
    /// dropped by one broker restart spread out their re-dials.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let scale = 0.75 + f64::from(nanos) / 2_000_000_000.0;
        self.base_delay(attempt).mul_f64(scale).max(MIN_RECONNECT_DELAY)
    }
}
