//! Core traits for the store.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Actions carry a type tag used for listener lookup and logging.
///
/// Implement this on a tagged enum with one variant per known action plus a
/// passthrough variant for types the reducer does not recognise.
pub trait ActionLike: Send + Sync + 'static {
    /// The `type` discriminant, e.g. `"SET_STATE"`.
    fn action_type(&self) -> &str;
}

/// Outcome of a single reduction.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<S> {
    /// The action did not change anything. The published snapshot keeps its
    /// identity.
    Unchanged,
    /// A new snapshot to publish.
    Next(S),
}

impl<S> Transition<S> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Transition::Unchanged)
    }
}

/// Pure state transitions. No I/O, no side effects.
///
/// Receives the current snapshot by shared reference and returns the next one
/// without touching its inputs. Unknown action types must return
/// `Transition::Unchanged`, not an error. An `Err` (or a panic) is a failed
/// reduction: the snapshot stays as it was and the failure is reported to
/// whoever awaits that action.
pub trait Reducer<A: ActionLike, S>: Send + Sync + 'static {
    fn reduce(&self, state: &S, action: &A) -> Result<Transition<S>>;
}

impl<A, S, F> Reducer<A, S> for F
where
    A: ActionLike,
    F: Fn(&S, &A) -> Result<Transition<S>> + Send + Sync + 'static,
{
    fn reduce(&self, state: &S, action: &A) -> Result<Transition<S>> {
        self(state, action)
    }
}

/// Handler invoked after an action of a subscribed type was reduced.
///
/// Called with the action, the snapshot before it and the snapshot after it.
/// The dispatch loop awaits each call before invoking the next listener.
/// Errors are reported but never roll back the transition.
#[async_trait]
pub trait Listener<A, S>: Send + Sync + 'static
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    async fn on_action(&self, action: &A, previous: &Arc<S>, next: &Arc<S>) -> Result<()>;
}

/// Adapter that turns a synchronous closure into a [`Listener`].
pub struct FnListener<F>(pub F);

#[async_trait]
impl<A, S, F> Listener<A, S> for FnListener<F>
where
    A: ActionLike,
    S: Send + Sync + 'static,
    F: Fn(&A, &S, &S) -> Result<()> + Send + Sync + 'static,
{
    async fn on_action(&self, action: &A, previous: &Arc<S>, next: &Arc<S>) -> Result<()> {
        (self.0)(action, previous.as_ref(), next.as_ref())
    }
}

/// Blanket impl so a shared listener can be registered while the caller keeps
/// a handle for assertions.
#[async_trait]
impl<A, S, L> Listener<A, S> for Arc<L>
where
    A: ActionLike,
    S: Send + Sync + 'static,
    L: Listener<A, S> + ?Sized,
{
    async fn on_action(&self, action: &A, previous: &Arc<S>, next: &Arc<S>) -> Result<()> {
        (**self).on_action(action, previous, next).await
    }
}
