//! The dispatch loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use arc_swap::ArcSwap;
use futures::FutureExt;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ListenerFailurePolicy, StopMode};
use crate::error::{ListenerFailure, StoreError};
use crate::queue::QueueReceiver;
use crate::registry::ListenerRegistry;
use crate::traits::{ActionLike, Reducer, Transition};

/// The published snapshot together with the version that produced it.
pub(crate) struct Published<S> {
    pub(crate) version: u64,
    pub(crate) state: Arc<S>,
}

/// A successfully reduced action, as broadcast on the change feed.
#[derive(Debug)]
pub struct Commit<A, S> {
    pub version: u64,
    pub action: Arc<A>,
    pub previous: Arc<S>,
    pub next: Arc<S>,
    /// `false` when the reducer returned `Transition::Unchanged`; `previous`
    /// and `next` are then the same allocation.
    pub changed: bool,
}

/// What a dispatch acknowledgement resolves to once the action, and every
/// listener for it, has finished.
#[derive(Debug)]
pub struct Receipt<S> {
    pub version: u64,
    pub previous: Arc<S>,
    pub next: Arc<S>,
    pub changed: bool,
    /// Empty unless the store aggregates listener failures.
    pub listener_failures: Vec<ListenerFailure>,
}

pub(crate) type Reply<S> = oneshot::Sender<Result<Receipt<S>, StoreError>>;

/// A queued action and the channel its outcome is reported on.
pub(crate) struct Envelope<A, S> {
    pub(crate) action: Arc<A>,
    pub(crate) reply: Reply<S>,
}

/// State shared between the store handles and the dispatch loop. The loop is
/// the only writer of `current`.
pub(crate) struct Shared<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    pub(crate) current: ArcSwap<Published<S>>,
    pub(crate) registry: ListenerRegistry<A, S>,
    pub(crate) changes: broadcast::Sender<Arc<Commit<A, S>>>,
    reducer: Box<dyn Reducer<A, S>>,
    listener_failures: ListenerFailurePolicy,
}

impl<A, S> Shared<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    pub(crate) fn new(
        initial: S,
        reducer: Box<dyn Reducer<A, S>>,
        listener_failures: ListenerFailurePolicy,
        change_feed_capacity: usize,
    ) -> Self {
        let (changes, _) = broadcast::channel(change_feed_capacity.max(1));
        Self {
            current: ArcSwap::from_pointee(Published {
                version: 0,
                state: Arc::new(initial),
            }),
            registry: ListenerRegistry::new(),
            changes,
            reducer,
            listener_failures,
        }
    }

    /// One full cycle: reduce, publish, notify.
    async fn apply(&self, action: Arc<A>) -> Result<Receipt<S>, StoreError> {
        let action_type = action.action_type();
        let epoch = self.registry.epoch();
        let current = self.current.load_full();
        let previous = Arc::clone(&current.state);

        // 1. Reduce (pure)
        let reduced = panic::catch_unwind(AssertUnwindSafe(|| {
            self.reducer.reduce(&*previous, &*action)
        }));
        let transition = match reduced {
            Ok(Ok(transition)) => transition,
            Ok(Err(source)) => {
                warn!(action_type, error = %source, "Reduction failed, snapshot unchanged");
                return Err(StoreError::Reduction {
                    action_type: action_type.to_string(),
                    source,
                });
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(action_type, panic = %message, "Reducer panicked, snapshot unchanged");
                return Err(StoreError::Reduction {
                    action_type: action_type.to_string(),
                    source: anyhow!("reducer panicked: {message}"),
                });
            }
        };

        // 2. Publish
        let changed = !transition.is_unchanged();
        let next = match transition {
            Transition::Unchanged => Arc::clone(&previous),
            Transition::Next(state) => Arc::new(state),
        };
        let version = current.version + 1;
        self.current.store(Arc::new(Published {
            version,
            state: Arc::clone(&next),
        }));
        debug!(version, action_type, changed, "Action applied");

        // 3. Notify listeners registered before this cycle began
        let failures = self.notify(&action, &previous, &next, epoch).await;

        // 4. Feed. No receivers is fine.
        let _ = self.changes.send(Arc::new(Commit {
            version,
            action: Arc::clone(&action),
            previous: Arc::clone(&previous),
            next: Arc::clone(&next),
            changed,
        }));

        Ok(Receipt {
            version,
            previous,
            next,
            changed,
            listener_failures: match self.listener_failures {
                ListenerFailurePolicy::Log => Vec::new(),
                ListenerFailurePolicy::Aggregate => failures,
            },
        })
    }

    async fn notify(
        &self,
        action: &A,
        previous: &Arc<S>,
        next: &Arc<S>,
        epoch: u64,
    ) -> Vec<ListenerFailure> {
        let action_type = action.action_type();
        let mut failures = Vec::new();

        for entry in self.registry.lookup(action_type, epoch) {
            if !entry.is_active() {
                debug!(subscription = %entry.id, action_type, "Listener removed mid-cycle, skipping");
                continue;
            }

            let call = entry.listener.on_action(action, previous, next);
            let error = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(payload) => anyhow!("listener panicked: {}", panic_message(payload.as_ref())),
            };

            error!(subscription = %entry.id, action_type, error = %error, "Listener failed");
            failures.push(ListenerFailure {
                subscription: entry.id,
                action_type: action_type.to_string(),
                error,
            });
        }

        failures
    }
}

/// The single consumer. Owns the receiving half of the queue.
pub(crate) struct DispatchLoop<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    shared: Arc<Shared<A, S>>,
    queue: QueueReceiver<Envelope<A, S>>,
    stop: watch::Receiver<Option<StopMode>>,
}

impl<A, S> DispatchLoop<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    pub(crate) fn new(
        shared: Arc<Shared<A, S>>,
        queue: QueueReceiver<Envelope<A, S>>,
        stop: watch::Receiver<Option<StopMode>>,
    ) -> Self {
        Self {
            shared,
            queue,
            stop,
        }
    }

    /// Process actions until a stop is requested or every store handle is
    /// gone, then drain or discard what is left.
    pub(crate) async fn run(mut self) {
        info!("Dispatch loop running, waiting for actions");

        let mode = loop {
            tokio::select! {
                biased;

                changed = self.stop.changed() => match changed {
                    Ok(()) => {
                        if let Some(mode) = *self.stop.borrow() {
                            break mode;
                        }
                    }
                    // Every store handle dropped
                    Err(_) => break StopMode::Drain,
                },

                next = self.queue.recv() => match next {
                    Some(envelope) => self.process(envelope).await,
                    None => break StopMode::Drain,
                },
            }
        };

        self.queue.close();

        match mode {
            StopMode::Drain => {
                let mut drained = 0usize;
                while let Some(envelope) = self.queue.recv().await {
                    self.process(envelope).await;
                    drained += 1;
                }
                info!(drained, "Dispatch loop stopped after draining queue");
            }
            StopMode::Discard => {
                let mut discarded = 0usize;
                while let Some(envelope) = self.queue.try_recv() {
                    let _ = envelope.reply.send(Err(StoreError::Stopped));
                    discarded += 1;
                }
                info!(discarded, "Dispatch loop stopped, pending actions discarded");
            }
        }
    }

    async fn process(&self, envelope: Envelope<A, S>) {
        let Envelope { action, reply } = envelope;
        let outcome = self.shared.apply(action).await;
        // The waiter may have given up; the action is applied regardless.
        let _ = reply.send(outcome);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
