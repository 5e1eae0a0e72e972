//! Initial-state loading.
//!
//! Reads a JSON object document from disk. Failures belong to the loader;
//! the store only ever receives a ready value.

use std::io::ErrorKind;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::error::LoadError;

/// Read and parse the document at `path`. The top level must be an object.
pub async fn load_initial_state(path: impl AsRef<Path>) -> Result<Value, LoadError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let value: Value = serde_json::from_str(&text).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if !value.is_object() {
        return Err(LoadError::NotAnObject {
            path: path.to_path_buf(),
        });
    }

    info!(path = %path.display(), "Initial state loaded");
    Ok(value)
}

/// Like [`load_initial_state`], but any failure is logged and an empty object
/// is returned instead.
pub async fn load_initial_state_or_empty(path: impl AsRef<Path>) -> Value {
    let path = path.as_ref();
    match load_initial_state(path).await {
        Ok(value) => value,
        Err(LoadError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "Initial state file not found, starting empty");
            Value::Object(Map::new())
        }
        Err(e) => {
            error!(error = %e, "Failed to load initial state, starting empty");
            Value::Object(Map::new())
        }
    }
}
