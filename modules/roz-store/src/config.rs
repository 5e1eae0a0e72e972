use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StoreError;

/// What a producer experiences when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// `dispatch` suspends until the loop frees a slot.
    Block,
    /// `dispatch` fails immediately with `StoreError::QueueSaturated`.
    Reject,
}

/// How pending actions are treated when the store stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    /// Soft stop: every action accepted before the stop is processed first.
    Drain,
    /// Hard stop: pending actions are discarded and their acks fail with
    /// `StoreError::Stopped`.
    Discard,
}

/// Whether listener failures reach the dispatch acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerFailurePolicy {
    /// Failures are logged only.
    Log,
    /// Failures are logged and collected into the action's `Receipt`.
    Aggregate,
}

/// Queue shape. `capacity: None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub capacity: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            overflow: OverflowPolicy::Block,
        }
    }
}

/// Store configuration. Defaults: unbounded queue, drain on stop, listener
/// failures logged only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub queue: QueueConfig,
    pub stop_mode: StopMode,
    pub listener_failures: ListenerFailurePolicy,
    /// Buffer size of the broadcast change feed.
    pub change_feed_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            stop_mode: StopMode::Drain,
            listener_failures: ListenerFailurePolicy::Log,
            change_feed_capacity: 256,
        }
    }
}

impl StoreConfig {
    pub fn bounded(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.queue = QueueConfig {
            capacity: Some(capacity),
            overflow,
        };
        self
    }

    pub fn with_stop_mode(mut self, mode: StopMode) -> Self {
        self.stop_mode = mode;
        self
    }

    pub fn with_listener_failures(mut self, policy: ListenerFailurePolicy) -> Self {
        self.listener_failures = policy;
        self
    }

    pub fn with_change_feed_capacity(mut self, capacity: usize) -> Self {
        self.change_feed_capacity = capacity;
        self
    }

    /// Load configuration from `ROZ_*` environment variables, falling back to
    /// the defaults for anything unset.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`StoreConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoreError> {
        let defaults = Self::default();

        let capacity = optional_parse::<usize>(&lookup, "ROZ_QUEUE_CAPACITY")?;
        let overflow = optional_parse::<OverflowPolicy>(&lookup, "ROZ_QUEUE_OVERFLOW")?
            .unwrap_or(defaults.queue.overflow);
        let stop_mode =
            optional_parse::<StopMode>(&lookup, "ROZ_STOP_MODE")?.unwrap_or(defaults.stop_mode);
        let listener_failures =
            optional_parse::<ListenerFailurePolicy>(&lookup, "ROZ_LISTENER_FAILURES")?
                .unwrap_or(defaults.listener_failures);
        let change_feed_capacity =
            optional_parse::<usize>(&lookup, "ROZ_CHANGE_FEED_CAPACITY")?
                .unwrap_or(defaults.change_feed_capacity);

        let config = Self {
            queue: QueueConfig { capacity, overflow },
            stop_mode,
            listener_failures,
            change_feed_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.queue.capacity == Some(0) {
            return Err(StoreError::Config(
                "queue capacity must be greater than zero".into(),
            ));
        }
        if self.change_feed_capacity == 0 {
            return Err(StoreError::Config(
                "change feed capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        info!(
            queue_capacity = ?self.queue.capacity,
            overflow = ?self.queue.overflow,
            stop_mode = ?self.stop_mode,
            listener_failures = ?self.listener_failures,
            change_feed_capacity = self.change_feed_capacity,
            "Store config"
        );
    }
}

fn optional_parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| StoreError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "reject" => Ok(Self::Reject),
            other => Err(format!("expected `block` or `reject`, got `{other}`")),
        }
    }
}

impl FromStr for StopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "discard" => Ok(Self::Discard),
            other => Err(format!("expected `drain` or `discard`, got `{other}`")),
        }
    }
}

impl FromStr for ListenerFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "aggregate" => Ok(Self::Aggregate),
            other => Err(format!("expected `log` or `aggregate`, got `{other}`")),
        }
    }
}
