//! Listener registry.
//!
//! Copy-on-write table of listeners keyed by action type. Writers swap in a
//! new table; the dispatch loop reads without locking.
//!
//! Every entry carries a registration id drawn from the table itself. The
//! loop records the table's `next_id` when it dequeues an action (the
//! "epoch") and only invokes entries registered below it, so a listener added
//! while action N is in flight first sees N+1. Removal takes the entry out of
//! the table and clears its `active` flag; the loop checks the flag right
//! before each call, so a removal that commits before a listener's turn
//! suppresses it. A call already in progress is not interrupted.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::traits::{ActionLike, Listener};

/// Identity of a registration. Ids increase in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    action_type: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }
}

pub(crate) struct ListenerEntry<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    pub(crate) id: SubscriptionId,
    pub(crate) listener: Arc<dyn Listener<A, S>>,
    active: AtomicBool,
}

impl<A, S> ListenerEntry<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

struct Table<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    next_id: u64,
    by_type: HashMap<String, Vec<Arc<ListenerEntry<A, S>>>>,
}

impl<A, S> Clone for Table<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            next_id: self.next_id,
            by_type: self.by_type.clone(),
        }
    }
}

/// Mapping from action type to listeners in registration order.
pub struct ListenerRegistry<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    table: ArcSwap<Table<A, S>>,
}

impl<A, S> Default for ListenerRegistry<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A, S> ListenerRegistry<A, S>
where
    A: ActionLike,
    S: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(Table {
                next_id: 1,
                by_type: HashMap::new(),
            }),
        }
    }

    /// Register `listener` for `action_type`, after any existing listeners.
    pub fn subscribe(
        &self,
        action_type: impl Into<String>,
        listener: Arc<dyn Listener<A, S>>,
    ) -> SubscriptionHandle {
        let action_type = action_type.into();
        let previous = self.table.rcu(|current| {
            let mut next = Table::clone(current);
            let entry = Arc::new(ListenerEntry {
                id: SubscriptionId(current.next_id),
                listener: Arc::clone(&listener),
                active: AtomicBool::new(true),
            });
            next.by_type
                .entry(action_type.clone())
                .or_default()
                .push(entry);
            next.next_id += 1;
            next
        });

        SubscriptionHandle {
            id: SubscriptionId(previous.next_id),
            action_type,
        }
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let previous = self.table.rcu(|current| {
            let mut next = Table::clone(current);
            if let Some(entries) = next.by_type.get_mut(&handle.action_type) {
                entries.retain(|entry| entry.id != handle.id);
                if entries.is_empty() {
                    next.by_type.remove(&handle.action_type);
                }
            }
            next
        });

        let removed = previous
            .by_type
            .get(&handle.action_type)
            .and_then(|entries| entries.iter().find(|entry| entry.id == handle.id));

        match removed {
            Some(entry) => {
                entry.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Registration mark for a dispatch cycle. Entries registered at or after
    /// this mark are not invoked in that cycle.
    pub(crate) fn epoch(&self) -> u64 {
        self.table.load().next_id
    }

    /// Listeners for `action_type` registered before `epoch`, in order.
    pub(crate) fn lookup(&self, action_type: &str, epoch: u64) -> Vec<Arc<ListenerEntry<A, S>>> {
        self.table
            .load()
            .by_type
            .get(action_type)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.id.0 < epoch)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of live registrations for `action_type`.
    pub fn listener_count(&self, action_type: &str) -> usize {
        self.table
            .load()
            .by_type
            .get(action_type)
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().by_type.is_empty()
    }
}
