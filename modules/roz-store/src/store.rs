//! Store façade: dispatch, read, subscribe, lifecycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use anyhow::Result as AnyResult;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{StopMode, StoreConfig};
use crate::engine::{Commit, DispatchLoop, Envelope, Receipt, Shared};
use crate::error::StoreError;
use crate::queue::{self, QueueSender};
use crate::registry::SubscriptionHandle;
use crate::traits::{ActionLike, FnListener, Listener, Reducer};

/// Lifecycle of the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Constructed, not started. Dispatched actions are buffered.
    Idle = 0,
    Running = 1,
    /// A stop was requested; the loop is draining or discarding.
    Stopping = 2,
    Stopped = 3,
}

impl LoopState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Loop state shared with the dispatch task, which marks the store stopped
/// when it exits whether or not anyone is awaiting [`Store::stop`].
struct Lifecycle {
    state: AtomicU8,
    stopped: watch::Sender<bool>,
}

impl Lifecycle {
    fn new() -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(LoopState::Idle as u8),
            stopped,
        }
    }

    fn load(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: LoopState, to: LoopState) -> Result<(), LoopState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(LoopState::from_u8)
    }

    fn finish(&self) {
        self.state.store(LoopState::Stopped as u8, Ordering::SeqCst);
        self.stopped.send_replace(true);
    }
}

/// Runs `finish` when the dispatch task ends, including by panic or abort.
struct FinishOnDrop(Arc<Lifecycle>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

async fn drive<A, S>(dispatch_loop: DispatchLoop<A, S>, lifecycle: Arc<Lifecycle>)
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    let _finish = FinishOnDrop(lifecycle);
    dispatch_loop.run().await;
}

enum Driver<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    Pending(DispatchLoop<A, S>),
    Running(JoinHandle<()>),
    Taken,
}

struct StoreInner<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    shared: Arc<Shared<A, S>>,
    sender: QueueSender<Envelope<A, S>>,
    config: StoreConfig,
    lifecycle: Arc<Lifecycle>,
    driver: Mutex<Driver<A, S>>,
    stop_signal: watch::Sender<Option<StopMode>>,
}

/// Single-writer state container.
///
/// Actions go through one FIFO queue to one dispatch loop, which reduces,
/// publishes the new snapshot and runs the listeners for the action's type
/// before taking the next action. Reads never block. Cloning a `Store`
/// clones a handle to the same container.
pub struct Store<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    inner: Arc<StoreInner<A, S>>,
}

impl<A, S> Clone for Store<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, S> Store<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    /// Build a store around `initial`. The dispatch loop is not running until
    /// [`Store::start`]; actions dispatched before that wait in the queue.
    pub fn new(
        initial: S,
        reducer: impl Reducer<A, S>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        config.validate()?;

        let shared = Arc::new(Shared::new(
            initial,
            Box::new(reducer),
            config.listener_failures,
            config.change_feed_capacity,
        ));
        let (sender, receiver) = queue::channel(config.queue);
        let (stop_signal, stop_rx) = watch::channel(None);
        let dispatch_loop = DispatchLoop::new(Arc::clone(&shared), receiver, stop_rx);

        Ok(Self {
            inner: Arc::new(StoreInner {
                shared,
                sender,
                config,
                lifecycle: Arc::new(Lifecycle::new()),
                driver: Mutex::new(Driver::Pending(dispatch_loop)),
                stop_signal,
            }),
        })
    }

    /// [`Store::new`] followed by [`Store::start`]. Must be called inside a
    /// tokio runtime.
    pub fn spawn(
        initial: S,
        reducer: impl Reducer<A, S>,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        let store = Self::new(initial, reducer, config)?;
        store.start()?;
        Ok(store)
    }

    /// Spawn the dispatch loop on the current tokio runtime.
    ///
    /// Starting a running store logs a warning and does nothing. Starting a
    /// stopped store fails with `StoreError::Stopped`.
    pub fn start(&self) -> Result<(), StoreError> {
        let mut driver = lock(&self.inner.driver);
        match std::mem::replace(&mut *driver, Driver::Taken) {
            Driver::Pending(dispatch_loop) => {
                if self
                    .inner
                    .lifecycle
                    .transition(LoopState::Idle, LoopState::Running)
                    .is_err()
                {
                    // Lost the race against stop(); it will run the loop.
                    *driver = Driver::Pending(dispatch_loop);
                    return Err(StoreError::Stopped);
                }
                let lifecycle = Arc::clone(&self.inner.lifecycle);
                *driver = Driver::Running(tokio::spawn(drive(dispatch_loop, lifecycle)));
                info!(config = ?self.inner.config, "Store started");
                Ok(())
            }
            other => {
                *driver = other;
                match self.state() {
                    LoopState::Stopping | LoopState::Stopped => Err(StoreError::Stopped),
                    _ => {
                        warn!("Store already running");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Stop the dispatch loop.
    ///
    /// `Drain` processes everything accepted before the call; `Discard` fails
    /// the acks of pending actions with `StoreError::Stopped`. New dispatches
    /// fail fast as soon as the call begins. Idempotent: later calls wait for
    /// the first stop to finish and ignore their `mode`.
    ///
    /// The drain runs on the dispatch task, so dropping this future (for
    /// example on a shutdown timeout) does not leave the store half stopped.
    pub async fn stop(&self, mode: StopMode) {
        let lifecycle = &self.inner.lifecycle;
        let first = loop {
            let current = lifecycle.load();
            match current {
                LoopState::Idle | LoopState::Running => {
                    if lifecycle.transition(current, LoopState::Stopping).is_ok() {
                        break true;
                    }
                }
                LoopState::Stopping | LoopState::Stopped => break false,
            }
        };

        if first {
            info!(?mode, "Stopping store");
            self.inner.stop_signal.send_replace(Some(mode));

            let driver = std::mem::replace(&mut *lock(&self.inner.driver), Driver::Taken);
            let handle = match driver {
                // Never started: spawn the loop now so a drain still happens.
                Driver::Pending(dispatch_loop) => {
                    Some(tokio::spawn(drive(dispatch_loop, Arc::clone(lifecycle))))
                }
                Driver::Running(handle) => Some(handle),
                Driver::Taken => None,
            };
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    error!(error = %e, "Dispatch loop task failed");
                }
            }
        }

        let mut stopped = lifecycle.stopped.subscribe();
        let _ = stopped.wait_for(|done| *done).await;

        if first {
            info!(version = self.version(), "Store stopped");
        }
    }

    /// Stop using the configured [`StopMode`].
    pub async fn shutdown(&self) {
        self.stop(self.inner.config.stop_mode).await;
    }

    /// The stop mode [`Store::shutdown`] uses.
    pub fn shutdown_mode(&self) -> StopMode {
        self.inner.config.stop_mode
    }

    pub fn state(&self) -> LoopState {
        self.inner.lifecycle.load()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Enqueue an action.
    ///
    /// Returns once the action holds its place in the total order. Only a full
    /// queue with the `Block` policy makes this wait. Await the returned
    /// [`Ack`] to learn the outcome, or drop it.
    pub async fn dispatch(&self, action: A) -> Result<Ack<S>, StoreError> {
        let (envelope, ack) = self.envelope(action)?;
        self.inner.sender.enqueue(envelope).await?;
        Ok(ack)
    }

    /// Enqueue without ever waiting. A full bounded queue is reported as
    /// `QueueSaturated` regardless of the overflow policy.
    pub fn try_dispatch(&self, action: A) -> Result<Ack<S>, StoreError> {
        let (envelope, ack) = self.envelope(action)?;
        self.inner.sender.try_enqueue(envelope)?;
        Ok(ack)
    }

    /// Dispatch and wait until the action and its listeners have finished.
    pub async fn dispatch_and_wait(&self, action: A) -> Result<Receipt<S>, StoreError> {
        self.dispatch(action).await?.await
    }

    fn envelope(&self, action: A) -> Result<(Envelope<A, S>, Ack<S>), StoreError> {
        if matches!(self.state(), LoopState::Stopping | LoopState::Stopped) {
            return Err(StoreError::Stopped);
        }
        debug!(action_type = action.action_type(), "Action dispatched");
        let (reply, rx) = oneshot::channel();
        Ok((
            Envelope {
                action: Arc::new(action),
                reply,
            },
            Ack { rx },
        ))
    }

    /// The latest published snapshot. Lock-free; the returned value never
    /// changes.
    pub fn get_state(&self) -> Arc<S> {
        Arc::clone(&self.inner.shared.current.load().state)
    }

    /// Number of actions reduced so far. Matches the `version` of the last
    /// receipt.
    pub fn version(&self) -> u64 {
        self.inner.shared.current.load().version
    }

    /// Register `listener` for actions of `action_type`. Takes effect from the
    /// next action the loop dequeues.
    pub fn subscribe(
        &self,
        action_type: impl Into<String>,
        listener: impl Listener<A, S>,
    ) -> Result<SubscriptionHandle, StoreError> {
        if matches!(self.state(), LoopState::Stopping | LoopState::Stopped) {
            return Err(StoreError::Stopped);
        }
        let handle = self
            .inner
            .shared
            .registry
            .subscribe(action_type, Arc::new(listener));
        debug!(subscription = %handle.id(), action_type = handle.action_type(), "Listener subscribed");
        Ok(handle)
    }

    /// [`Store::subscribe`] with a synchronous closure.
    pub fn subscribe_fn<F>(
        &self,
        action_type: impl Into<String>,
        f: F,
    ) -> Result<SubscriptionHandle, StoreError>
    where
        F: Fn(&A, &S, &S) -> AnyResult<()> + Send + Sync + 'static,
    {
        self.subscribe(action_type, FnListener(f))
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.inner.shared.registry.unsubscribe(handle);
        debug!(subscription = %handle.id(), removed, "Listener unsubscribed");
        removed
    }

    /// Receive every commit from now on. Slow receivers skip ahead instead
    /// of holding up the loop.
    pub fn watch(&self) -> broadcast::Receiver<Arc<Commit<A, S>>> {
        self.inner.shared.changes.subscribe()
    }
}

impl<A, S> Store<A, S>
where
    A: ActionLike,
    S: Clone + Send + Sync + 'static,
{
    /// Owned copy of the latest snapshot.
    pub fn state_cloned(&self) -> S {
        S::clone(&self.get_state())
    }
}

/// Completion handle for one dispatched action.
///
/// Resolves to the [`Receipt`] once the action and its listeners have run,
/// to `StoreError::Reduction` if the reducer failed, or to
/// `StoreError::Stopped` if the action was discarded. Dropping it does not
/// affect processing.
#[must_use = "dropping an Ack ignores the outcome of the action"]
pub struct Ack<S> {
    rx: oneshot::Receiver<Result<Receipt<S>, StoreError>>,
}

impl<S> Future for Ack<S> {
    type Output = Result<Receipt<S>, StoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StoreError::Stopped)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
