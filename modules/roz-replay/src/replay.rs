//! Replay an action log through a JSON store.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use roz_store::json::{spawn_json_store, Action, StateChanged};
use roz_store::{Commit, StoreConfig};

type Feed = broadcast::Receiver<Arc<Commit<Action, Value>>>;

/// One parsed line of the action log.
#[derive(Debug, Clone)]
pub struct LoggedAction {
    /// 1-based line number in the log.
    pub line: usize,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub applied: usize,
    /// Rejected by the queue or failed to reduce.
    pub failed: usize,
    pub events: usize,
}

/// Parse a JSON-lines log. Blank lines are skipped.
pub fn parse_log(log: &str) -> Result<Vec<LoggedAction>> {
    log.lines()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(index, text)| {
            let line = index + 1;
            let value = serde_json::from_str(text)
                .with_context(|| format!("line {line}: invalid JSON"))?;
            let action = Action::from_value(value).with_context(|| format!("line {line}"))?;
            Ok(LoggedAction { line, action })
        })
        .collect()
}

/// Run `actions` in order against `initial`, stop the store, and return the
/// summary with the final state.
///
/// When `on_event` is given it receives a `STATE_CHANGED` event for every
/// applied `SET_STATE`, in commit order. A failing action is reported per
/// line and the replay carries on.
pub async fn replay<F>(
    initial: Value,
    config: StoreConfig,
    actions: Vec<LoggedAction>,
    on_event: Option<F>,
) -> Result<(Summary, Arc<Value>)>
where
    F: FnMut(&StateChanged) -> Result<()> + Send + 'static,
{
    let total = actions.len();
    // The feed holds one commit per action, so the printer never lags.
    let capacity = config.change_feed_capacity.max(total);
    let store = spawn_json_store(initial, config.with_change_feed_capacity(capacity))?;

    let printer = on_event.map(|on_event| {
        let (done, finished) = oneshot::channel();
        let task = tokio::spawn(print_events(store.watch(), finished, on_event));
        (done, task)
    });

    let mut failed = 0usize;
    let mut acks = Vec::with_capacity(total);
    for LoggedAction { line, action } in actions {
        match store.dispatch(action).await {
            Ok(ack) => acks.push((line, ack)),
            Err(e) => {
                warn!(line, error = %e, "Action not accepted");
                failed += 1;
            }
        }
    }

    let mut applied = 0usize;
    for (line, ack) in acks {
        match ack.await {
            Ok(_) => applied += 1,
            Err(e) => {
                warn!(line, error = %e, "Action failed");
                failed += 1;
            }
        }
    }

    let events = match printer {
        Some((done, task)) => {
            let _ = done.send(());
            task.await.context("Event printer task failed")??
        }
        None => 0,
    };

    store.shutdown().await;
    info!(version = store.version(), applied, failed, "Replay finished");

    let summary = Summary {
        total,
        applied,
        failed,
        events,
    };
    Ok((summary, store.get_state()))
}

async fn print_events<F>(
    mut feed: Feed,
    mut finished: oneshot::Receiver<()>,
    mut on_event: F,
) -> Result<usize>
where
    F: FnMut(&StateChanged) -> Result<()>,
{
    let mut printed = 0usize;
    loop {
        tokio::select! {
            biased;

            received = feed.recv() => match received {
                Ok(commit) => printed += emit(&commit, &mut on_event)?,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change feed lagged, some events were dropped");
                }
                Err(RecvError::Closed) => return Ok(printed),
            },

            _ = &mut finished => break,
        }
    }

    // Every acknowledged action was broadcast before its ack resolved.
    loop {
        match feed.try_recv() {
            Ok(commit) => printed += emit(&commit, &mut on_event)?,
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Change feed lagged, some events were dropped");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(printed),
        }
    }
}

fn emit<F>(commit: &Commit<Action, Value>, on_event: &mut F) -> Result<usize>
where
    F: FnMut(&StateChanged) -> Result<()>,
{
    match StateChanged::from_commit(commit) {
        Some(event) => {
            on_event(&event)?;
            Ok(1)
        }
        None => Ok(0),
    }
}
