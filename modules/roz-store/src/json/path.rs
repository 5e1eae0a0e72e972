//! Dotted-path reads and writes on JSON trees.
//!
//! `"players.player_alpha.username"` walks object keys; a segment made only
//! of ASCII digits indexes into an array. Arrays never grow: an out-of-range
//! index is an error on write and `None` on read.

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,

    #[error("index {index} out of range at `{segment_path}` (len {len})")]
    IndexOutOfRange {
        segment_path: String,
        index: usize,
        len: usize,
    },

    #[error("`{segment_path}` is not a container")]
    NotAContainer { segment_path: String },
}

/// Read the value at `path`, if every segment resolves.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => array_index(segment).and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `value` at `path` in place.
///
/// Missing or scalar intermediate object members are replaced by `{}`.
/// Array segments must address an existing element. On error the tree may
/// already hold objects created for earlier segments, so callers that need
/// all-or-nothing writes work on a copy.
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }

    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments.split_last().ok_or(PathError::Empty)?;

    let mut node = root;
    for (depth, segment) in parents.iter().enumerate() {
        node = match node {
            Value::Object(map) => {
                let child = map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !is_container(child) {
                    *child = Value::Object(Map::new());
                }
                child
            }
            Value::Array(items) => {
                let len = items.len();
                let index = array_index(segment)
                    .ok_or_else(|| not_a_container(&segments, depth))?;
                let child = items
                    .get_mut(index)
                    .ok_or_else(|| out_of_range(&segments, depth, index, len))?;
                if !is_container(child) {
                    *child = Value::Object(Map::new());
                }
                child
            }
            _ => return Err(not_a_container(&segments, depth)),
        };
    }

    let depth = parents.len();
    match node {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let len = items.len();
            let index = array_index(last).ok_or_else(|| not_a_container(&segments, depth))?;
            let slot = items
                .get_mut(index)
                .ok_or_else(|| out_of_range(&segments, depth, index, len))?;
            *slot = value;
            Ok(())
        }
        _ => Err(not_a_container(&segments, depth)),
    }
}

fn array_index(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Object(_) | Value::Array(_))
}

fn prefix(segments: &[&str], depth: usize) -> String {
    segments[..=depth].join(".")
}

fn not_a_container(segments: &[&str], depth: usize) -> PathError {
    PathError::NotAContainer {
        segment_path: prefix(segments, depth),
    }
}

fn out_of_range(segments: &[&str], depth: usize, index: usize, len: usize) -> PathError {
    PathError::IndexOutOfRange {
        segment_path: prefix(segments, depth),
        index,
        len,
    }
}
