use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::traits::ActionLike;

pub const SET_STATE: &str = "SET_STATE";

/// Wire shape of any action: a string `type` plus opaque fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RawAction {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Actions understood by [`JsonReducer`](super::JsonReducer).
///
/// Unknown types are kept verbatim in `Other` and pass through the reducer
/// as no-ops, but still reach listeners subscribed to their type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction", into = "RawAction")]
pub enum Action {
    /// Write `value` at the dotted `path`.
    SetState { path: String, value: Value },
    Other(RawAction),
}

impl Action {
    pub fn set_state(path: impl Into<String>, value: Value) -> Self {
        Action::SetState {
            path: path.into(),
            value,
        }
    }

    pub fn other(action_type: impl Into<String>) -> Self {
        Action::Other(RawAction::new(action_type))
    }

    /// Parse a JSON object. Only the structure is checked: a string `type`
    /// must be present, and `SET_STATE` needs a string `path`.
    pub fn from_value(value: Value) -> Result<Self, StoreError> {
        let raw: RawAction = serde_json::from_value(value)
            .map_err(|e| StoreError::MalformedAction(e.to_string()))?;
        Self::try_from(raw)
    }

    pub fn to_value(&self) -> Value {
        let raw = RawAction::from(self.clone());
        // A string-keyed map of values always serializes.
        serde_json::to_value(raw).unwrap_or(Value::Null)
    }
}

impl ActionLike for Action {
    fn action_type(&self) -> &str {
        match self {
            Action::SetState { .. } => SET_STATE,
            Action::Other(raw) => raw.action_type.as_str(),
        }
    }
}

impl TryFrom<RawAction> for Action {
    type Error = StoreError;

    fn try_from(mut raw: RawAction) -> Result<Self, Self::Error> {
        if raw.action_type != SET_STATE {
            return Ok(Action::Other(raw));
        }

        let path = match raw.payload.remove("path") {
            Some(Value::String(path)) => path,
            Some(other) => {
                return Err(StoreError::MalformedAction(format!(
                    "{SET_STATE} `path` must be a string, got {other}"
                )))
            }
            None => {
                return Err(StoreError::MalformedAction(format!(
                    "{SET_STATE} requires a `path`"
                )))
            }
        };
        let value = raw.payload.remove("value").unwrap_or(Value::Null);

        Ok(Action::SetState { path, value })
    }
}

impl From<Action> for RawAction {
    fn from(action: Action) -> Self {
        match action {
            Action::SetState { path, value } => RawAction::new(SET_STATE)
                .with_field("path", Value::String(path))
                .with_field("value", value),
            Action::Other(raw) => raw,
        }
    }
}
