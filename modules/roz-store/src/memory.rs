//! In-memory listener for tests and debugging.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::traits::{ActionLike, Listener};

/// One recorded listener call.
#[derive(Debug)]
pub struct Invocation<S> {
    pub action_type: String,
    pub previous: Arc<S>,
    pub next: Arc<S>,
}

impl<S> Clone for Invocation<S> {
    fn clone(&self) -> Self {
        Self {
            action_type: self.action_type.clone(),
            previous: Arc::clone(&self.previous),
            next: Arc::clone(&self.next),
        }
    }
}

/// Records every call it receives. Thread-safe.
///
/// Register it behind an `Arc` and keep a clone to read the recorded calls.
/// A listener built with [`MemoryListener::failing`] records the call and
/// then returns an error.
pub struct MemoryListener<S> {
    calls: Mutex<Vec<Invocation<S>>>,
    fail_with: Option<String>,
}

impl<S> Default for MemoryListener<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> MemoryListener<S> {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: None,
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(message.into()),
        }
    }

    /// All calls so far, oldest first.
    pub fn invocations(&self) -> Vec<Invocation<S>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl<A, S> Listener<A, S> for MemoryListener<S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    async fn on_action(&self, action: &A, previous: &Arc<S>, next: &Arc<S>) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Invocation {
                action_type: action.action_type().to_string(),
                previous: Arc::clone(previous),
                next: Arc::clone(next),
            });

        match &self.fail_with {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(()),
        }
    }
}
