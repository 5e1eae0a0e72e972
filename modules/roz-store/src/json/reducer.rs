use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use super::action::Action;
use super::path::{get_path, set_path};
use crate::engine::Commit;
use crate::traits::{Reducer, Transition};

/// Reducer for JSON document state.
///
/// `SET_STATE` writes into a copy of the tree; every other type is a no-op.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReducer;

impl Reducer<Action, Value> for JsonReducer {
    fn reduce(&self, state: &Value, action: &Action) -> Result<Transition<Value>> {
        match action {
            Action::SetState { path, value } => {
                if get_path(state, path) == Some(value) {
                    return Ok(Transition::Unchanged);
                }
                let mut next = state.clone();
                set_path(&mut next, path, value.clone())
                    .with_context(|| format!("SET_STATE at `{path}`"))?;
                Ok(Transition::Next(next))
            }
            Action::Other(_) => Ok(Transition::Unchanged),
        }
    }
}

/// A single path write, derived from a `SET_STATE` commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChanged {
    pub version: u64,
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub action: Action,
}

impl StateChanged {
    pub const EVENT_TYPE: &'static str = "STATE_CHANGED";

    /// Every applied `SET_STATE` yields an event, including a write of the
    /// value already at the path. `None` for any other action type.
    pub fn from_commit(commit: &Commit<Action, Value>) -> Option<Self> {
        let Action::SetState { path, .. } = commit.action.as_ref() else {
            return None;
        };
        Some(Self {
            version: commit.version,
            path: path.clone(),
            old_value: get_path(&commit.previous, path).cloned(),
            new_value: get_path(&commit.next, path).cloned(),
            action: Action::clone(&commit.action),
        })
    }
}
