use std::path::PathBuf;

use thiserror::Error;

use crate::registry::SubscriptionId;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The reducer returned an error or panicked. The snapshot was left as it
    /// was before this action.
    #[error("Reduction failed for action `{action_type}`: {source}")]
    Reduction {
        action_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Action queue is full (capacity {capacity})")]
    QueueSaturated { capacity: usize },

    #[error("Store is stopped")]
    Stopped,

    #[error("Malformed action: {0}")]
    MalformedAction(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors from reading an initial-state document.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read initial state {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in initial state {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Initial state {path} is not a JSON object")]
    NotAnObject { path: PathBuf },
}

/// A listener that returned an error or panicked while handling an action.
#[derive(Debug)]
pub struct ListenerFailure {
    pub subscription: SubscriptionId,
    pub action_type: String,
    pub error: anyhow::Error,
}

impl std::fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "listener {} failed on `{}`: {}",
            self.subscription, self.action_type, self.error
        )
    }
}
