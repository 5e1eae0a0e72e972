//! JSON document flavour of the store.
//!
//! State is a `serde_json::Value` tree, actions arrive as JSON objects with a
//! `type` tag, and `SET_STATE` writes a value at a dotted path.

pub mod action;
pub mod path;
pub mod reducer;

use serde_json::Value;

pub use action::{Action, RawAction, SET_STATE};
pub use path::{get_path, set_path, PathError};
pub use reducer::{JsonReducer, StateChanged};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::store::Store;

/// A store over a JSON document.
pub type JsonStore = Store<Action, Value>;

/// Start a [`JsonStore`] with the [`JsonReducer`]. Must be called inside a
/// tokio runtime.
pub fn spawn_json_store(initial: Value, config: StoreConfig) -> Result<JsonStore, StoreError> {
    Store::spawn(initial, JsonReducer, config)
}
