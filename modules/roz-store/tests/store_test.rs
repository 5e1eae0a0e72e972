//! Integration tests for the store: ordering, reduction, listeners,
//! backpressure and lifecycle. No external services required.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use roz_store::{
    ActionLike, ListenerFailurePolicy, LoopState, MemoryListener, OverflowPolicy, Reducer,
    StopMode, Store, StoreConfig, StoreError, SubscriptionHandle, Transition,
};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Test action type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum CounterAction {
    Increment,
    Add(i64),
    Fail,
    Panic,
    Tagged(String),
    Unknown(String),
}

impl ActionLike for CounterAction {
    fn action_type(&self) -> &str {
        match self {
            CounterAction::Increment => "INCREMENT",
            CounterAction::Add(_) => "ADD",
            CounterAction::Fail => "FAIL",
            CounterAction::Panic => "PANIC",
            CounterAction::Tagged(_) => "TAGGED",
            CounterAction::Unknown(action_type) => action_type.as_str(),
        }
    }
}

// ---------------------------------------------------------------------------
// Test state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
struct Counter {
    count: i64,
    seen: Vec<String>,
}

impl Counter {
    fn at(count: i64) -> Self {
        Self {
            count,
            seen: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Test reducer
// ---------------------------------------------------------------------------

struct CounterReducer;

impl Reducer<CounterAction, Counter> for CounterReducer {
    fn reduce(&self, state: &Counter, action: &CounterAction) -> Result<Transition<Counter>> {
        match action {
            CounterAction::Increment => Ok(Transition::Next(Counter {
                count: state.count + 1,
                seen: state.seen.clone(),
            })),
            CounterAction::Add(n) => Ok(Transition::Next(Counter {
                count: state.count + n,
                seen: state.seen.clone(),
            })),
            CounterAction::Fail => bail!("refusing to reduce"),
            CounterAction::Panic => panic!("reducer blew up"),
            CounterAction::Tagged(tag) => {
                let mut next = state.clone();
                next.seen.push(tag.clone());
                Ok(Transition::Next(next))
            }
            CounterAction::Unknown(_) => Ok(Transition::Unchanged),
        }
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

type CounterStore = Store<CounterAction, Counter>;

fn spawn_counter(config: StoreConfig) -> CounterStore {
    Store::spawn(Counter::at(0), CounterReducer, config).unwrap()
}

fn unknown(action_type: &str) -> CounterAction {
    CounterAction::Unknown(action_type.to_string())
}

/// Records a label into a shared log each time it runs.
fn record_into(
    log: &Arc<Mutex<Vec<String>>>,
    label: &str,
) -> impl Fn(&CounterAction, &Counter, &Counter) -> Result<()> + Send + Sync + 'static {
    let log = Arc::clone(log);
    let label = label.to_string();
    move |_action, _previous, _next| {
        log.lock().unwrap().push(label.clone());
        Ok(())
    }
}

/// Listener that blocks until released.
struct Gate {
    release: Arc<Notify>,
}

#[async_trait]
impl roz_store::Listener<CounterAction, Counter> for Gate {
    async fn on_action(
        &self,
        _action: &CounterAction,
        _previous: &Arc<Counter>,
        _next: &Arc<Counter>,
    ) -> Result<()> {
        self.release.notified().await;
        Ok(())
    }
}

// =========================================================================
// Reduction
// =========================================================================

#[tokio::test]
async fn increment_unknown_increment_counts_to_three() {
    let store = spawn_counter(StoreConfig::default());

    for action in [
        CounterAction::Increment,
        CounterAction::Increment,
        unknown("UNKNOWN"),
        CounterAction::Increment,
    ] {
        store.dispatch_and_wait(action).await.unwrap();
    }

    assert_eq!(store.get_state().count, 3);
    assert_eq!(store.version(), 4);
}

#[tokio::test]
async fn final_state_is_sequential_fold_of_reducer() {
    let store = spawn_counter(StoreConfig::default());
    let actions = vec![
        CounterAction::Add(5),
        CounterAction::Increment,
        CounterAction::Tagged("a".into()),
        unknown("NOPE"),
        CounterAction::Add(-3),
        CounterAction::Tagged("b".into()),
        CounterAction::Increment,
    ];

    let mut acks = Vec::new();
    for action in actions.clone() {
        acks.push(store.dispatch(action).await.unwrap());
    }
    for ack in acks {
        ack.await.unwrap();
    }

    let expected = actions.iter().fold(Counter::at(0), |state, action| {
        match CounterReducer.reduce(&state, action).unwrap() {
            Transition::Unchanged => state,
            Transition::Next(next) => next,
        }
    });

    assert_eq!(*store.get_state(), expected);
    assert_eq!(expected.count, 4);
    assert_eq!(expected.seen, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn unknown_action_keeps_snapshot_identity() {
    let store = spawn_counter(StoreConfig::default());
    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();

    let before = store.get_state();
    let receipt = store.dispatch_and_wait(unknown("SOMETHING_NEW")).await.unwrap();
    let after = store.get_state();

    assert!(Arc::ptr_eq(&before, &after));
    assert!(!receipt.changed);
    assert!(Arc::ptr_eq(&receipt.previous, &receipt.next));
    assert_eq!(receipt.version, 2);
}

#[tokio::test]
async fn held_snapshot_never_changes() {
    let store = spawn_counter(StoreConfig::default());
    let held = store.get_state();

    store.dispatch_and_wait(CounterAction::Add(10)).await.unwrap();

    assert_eq!(held.count, 0);
    assert_eq!(store.get_state().count, 10);
    assert_eq!(store.state_cloned(), Counter::at(10));
}

// =========================================================================
// Reduction failures
// =========================================================================

#[tokio::test]
async fn reduction_failure_leaves_snapshot_and_loop_continues() {
    let store = spawn_counter(StoreConfig::default());
    let fail_listener = Arc::new(MemoryListener::<Counter>::new());
    store.subscribe("FAIL", Arc::clone(&fail_listener)).unwrap();

    let first = store.dispatch(CounterAction::Increment).await.unwrap();
    let failing = store.dispatch(CounterAction::Fail).await.unwrap();
    let third = store.dispatch(CounterAction::Increment).await.unwrap();

    let first = first.await.unwrap();
    assert_eq!(first.next.count, 1);

    let err = failing.await.unwrap_err();
    assert!(
        matches!(&err, StoreError::Reduction { action_type, .. } if action_type == "FAIL"),
        "unexpected error: {err}"
    );

    let third = third.await.unwrap();
    assert_eq!(third.previous.count, 1);
    assert_eq!(third.next.count, 2);
    assert_eq!(third.version, 2);

    assert_eq!(fail_listener.count(), 0);
    assert_eq!(store.get_state().count, 2);
}

#[tokio::test]
async fn reducer_panic_is_isolated_to_its_action() {
    let store = spawn_counter(StoreConfig::default());

    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();
    let err = store.dispatch_and_wait(CounterAction::Panic).await.unwrap_err();
    assert!(err.to_string().contains("PANIC"));
    assert!(matches!(err, StoreError::Reduction { .. }));

    let receipt = store.dispatch_and_wait(CounterAction::Increment).await.unwrap();
    assert_eq!(receipt.next.count, 2);
    assert_eq!(store.state(), LoopState::Running);
}

// =========================================================================
// Listeners
// =========================================================================

#[tokio::test]
async fn listener_sees_previous_and_next_then_stops_after_unsubscribe() {
    let store = spawn_counter(StoreConfig::default());
    let listener = Arc::new(MemoryListener::<Counter>::new());
    let handle = store.subscribe("INCREMENT", Arc::clone(&listener)).unwrap();

    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();

    let calls = listener.invocations();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action_type, "INCREMENT");
    assert_eq!(calls[0].previous.count, 0);
    assert_eq!(calls[0].next.count, 1);

    assert!(store.unsubscribe(&handle));
    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();

    assert_eq!(listener.count(), 1);
    assert_eq!(store.get_state().count, 2);
}

#[tokio::test]
async fn listeners_fire_in_registration_order_for_their_type_only() {
    let store = spawn_counter(StoreConfig::default());
    let log = Arc::new(Mutex::new(Vec::new()));

    store.subscribe_fn("INCREMENT", record_into(&log, "first")).unwrap();
    store.subscribe_fn("ADD", record_into(&log, "add")).unwrap();
    store.subscribe_fn("INCREMENT", record_into(&log, "second")).unwrap();
    store.subscribe_fn("INCREMENT", record_into(&log, "third")).unwrap();

    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);

    store.dispatch_and_wait(CounterAction::Add(2)).await.unwrap();
    store.dispatch_and_wait(unknown("INCREMENTS")).await.unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["first", "second", "third", "add"]
    );
}

#[tokio::test]
async fn listener_runs_for_unchanged_transition_of_its_type() {
    let store = spawn_counter(StoreConfig::default());
    let listener = Arc::new(MemoryListener::<Counter>::new());
    store.subscribe("LEGACY", Arc::clone(&listener)).unwrap();

    store.dispatch_and_wait(unknown("LEGACY")).await.unwrap();

    let calls = listener.invocations();
    assert_eq!(calls.len(), 1);
    assert!(Arc::ptr_eq(&calls[0].previous, &calls[0].next));
}

#[tokio::test]
async fn listener_added_mid_cycle_starts_with_next_action() {
    let store = spawn_counter(StoreConfig::default());
    let late = Arc::new(MemoryListener::<Counter>::new());
    let added = Arc::new(AtomicBool::new(false));

    {
        let store_handle = store.clone();
        let late = Arc::clone(&late);
        let added = Arc::clone(&added);
        store
            .subscribe_fn("INCREMENT", move |_, _, _| {
                if !added.swap(true, Ordering::SeqCst) {
                    store_handle.subscribe("INCREMENT", Arc::clone(&late))?;
                }
                Ok(())
            })
            .unwrap();
    }

    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();
    assert_eq!(late.count(), 0);

    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();
    let calls = late.invocations();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].next.count, 2);
}

#[tokio::test]
async fn listener_removed_by_earlier_listener_does_not_fire() {
    let store = spawn_counter(StoreConfig::default());
    let victim = Arc::new(MemoryListener::<Counter>::new());
    let victim_handle: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));

    {
        let store_handle = store.clone();
        let victim_handle = Arc::clone(&victim_handle);
        store
            .subscribe_fn("INCREMENT", move |_, _, _| {
                if let Some(handle) = victim_handle.lock().unwrap().take() {
                    store_handle.unsubscribe(&handle);
                }
                Ok(())
            })
            .unwrap();
    }
    let handle = store.subscribe("INCREMENT", Arc::clone(&victim)).unwrap();
    *victim_handle.lock().unwrap() = Some(handle.clone());

    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();
    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();

    assert_eq!(victim.count(), 0);
    assert!(!store.unsubscribe(&handle));
}

#[tokio::test]
async fn listener_failure_is_logged_and_does_not_roll_back() {
    let store = spawn_counter(StoreConfig::default());
    let failing = Arc::new(MemoryListener::<Counter>::failing("listener exploded"));
    let healthy = Arc::new(MemoryListener::<Counter>::new());
    store.subscribe("INCREMENT", Arc::clone(&failing)).unwrap();
    store.subscribe("INCREMENT", Arc::clone(&healthy)).unwrap();

    let receipt = store.dispatch_and_wait(CounterAction::Increment).await.unwrap();

    assert!(receipt.listener_failures.is_empty());
    assert_eq!(failing.count(), 1);
    assert_eq!(healthy.count(), 1);
    assert_eq!(store.get_state().count, 1);
}

#[tokio::test]
async fn aggregate_policy_surfaces_listener_failures_on_ack() {
    let store = spawn_counter(
        StoreConfig::default().with_listener_failures(ListenerFailurePolicy::Aggregate),
    );
    let failing = store
        .subscribe("INCREMENT", MemoryListener::<Counter>::failing("nope"))
        .unwrap();
    let panicking = store
        .subscribe_fn("INCREMENT", |_, _, _| -> Result<()> { panic!("listener panic") })
        .unwrap();
    let healthy = Arc::new(MemoryListener::<Counter>::new());
    store.subscribe("INCREMENT", Arc::clone(&healthy)).unwrap();

    let receipt = store.dispatch_and_wait(CounterAction::Increment).await.unwrap();

    let failed: Vec<_> = receipt
        .listener_failures
        .iter()
        .map(|f| f.subscription)
        .collect();
    assert_eq!(failed, vec![failing.id(), panicking.id()]);
    assert!(receipt.listener_failures[0].error.to_string().contains("nope"));
    assert!(receipt.listener_failures[1]
        .error
        .to_string()
        .contains("listener panic"));
    assert_eq!(healthy.count(), 1);
    assert_eq!(receipt.next.count, 1);
}

// =========================================================================
// Ordering
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_observe_one_total_order() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 25;

    let store = spawn_counter(StoreConfig::default());
    let first_log = Arc::new(Mutex::new(Vec::new()));
    let second_log = Arc::new(Mutex::new(Vec::new()));
    for log in [&first_log, &second_log] {
        let log = Arc::clone(log);
        store
            .subscribe_fn("TAGGED", move |action, _, _| {
                if let CounterAction::Tagged(tag) = action {
                    log.lock().unwrap().push(tag.clone());
                }
                Ok(())
            })
            .unwrap();
    }
    let mut feed = store.watch();

    let mut producers = Vec::new();
    for producer in 0..PRODUCERS {
        let store = store.clone();
        producers.push(tokio::spawn(async move {
            let mut acks = Vec::new();
            for seq in 0..PER_PRODUCER {
                let tag = format!("{producer}:{seq}");
                acks.push(store.dispatch(CounterAction::Tagged(tag)).await.unwrap());
            }
            for ack in acks {
                ack.await.unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let applied = store.get_state().seen.clone();
    assert_eq!(applied.len(), PRODUCERS * PER_PRODUCER);
    assert_eq!(*first_log.lock().unwrap(), applied);
    assert_eq!(*second_log.lock().unwrap(), applied);

    let mut from_feed = Vec::new();
    let mut last_version = 0;
    while from_feed.len() < applied.len() {
        let commit = feed.recv().await.unwrap();
        assert_eq!(commit.version, last_version + 1);
        last_version = commit.version;
        if let CounterAction::Tagged(tag) = commit.action.as_ref() {
            from_feed.push(tag.clone());
        }
    }
    assert_eq!(from_feed, applied);

    // Each producer's own actions keep their submission order.
    for producer in 0..PRODUCERS {
        let prefix = format!("{producer}:");
        let seqs: Vec<usize> = applied
            .iter()
            .filter_map(|tag| tag.strip_prefix(&prefix))
            .map(|seq| seq.parse().unwrap())
            .collect();
        assert_eq!(seqs, (0..PER_PRODUCER).collect::<Vec<_>>());
    }
}

// =========================================================================
// Queue policies
// =========================================================================

#[tokio::test]
async fn bounded_reject_queue_refuses_second_action() {
    let config = StoreConfig::default().bounded(1, OverflowPolicy::Reject);
    let store = Store::new(Counter::at(0), CounterReducer, config).unwrap();

    let accepted = store.dispatch(CounterAction::Increment).await.unwrap();
    let rejected = store.dispatch(CounterAction::Increment).await;
    assert!(matches!(
        rejected,
        Err(StoreError::QueueSaturated { capacity: 1 })
    ));

    store.start().unwrap();
    let receipt = accepted.await.unwrap();
    assert_eq!(receipt.version, 1);
    assert_eq!(store.get_state().count, 1);
}

#[tokio::test]
async fn bounded_block_queue_waits_for_space() {
    let config = StoreConfig::default().bounded(1, OverflowPolicy::Block);
    let store = Store::new(Counter::at(0), CounterReducer, config).unwrap();

    let first = store.dispatch(CounterAction::Add(1)).await.unwrap();
    assert!(matches!(
        store.try_dispatch(CounterAction::Add(10)),
        Err(StoreError::QueueSaturated { capacity: 1 })
    ));

    let blocked = {
        let store = store.clone();
        tokio::spawn(async move { store.dispatch(CounterAction::Add(2)).await })
    };
    tokio::task::yield_now().await;
    assert!(!blocked.is_finished());

    store.start().unwrap();
    first.await.unwrap();
    let second = blocked.await.unwrap().unwrap();
    let receipt = second.await.unwrap();

    assert_eq!(receipt.next.count, 3);
}

// =========================================================================
// Acknowledgements
// =========================================================================

#[tokio::test]
async fn abandoned_ack_does_not_cancel_processing() {
    let store = spawn_counter(StoreConfig::default());
    let release = Arc::new(Notify::new());
    store
        .subscribe(
            "INCREMENT",
            Gate {
                release: Arc::clone(&release),
            },
        )
        .unwrap();

    let ack = store.dispatch(CounterAction::Increment).await.unwrap();
    let waited = tokio::time::timeout(Duration::from_millis(20), ack).await;
    assert!(waited.is_err(), "listener is gated, ack cannot resolve yet");

    release.notify_one();
    let receipt = store.dispatch_and_wait(CounterAction::Add(0)).await.unwrap();

    assert_eq!(receipt.previous.count, 1);
    assert_eq!(store.get_state().count, 1);
    assert_eq!(store.version(), 2);
}

#[tokio::test]
async fn watch_feed_reports_commits_with_versions() {
    let store = spawn_counter(StoreConfig::default());
    let mut feed = store.watch();

    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();
    store.dispatch_and_wait(CounterAction::Fail).await.unwrap_err();
    store.dispatch_and_wait(unknown("IGNORED")).await.unwrap();

    let first = feed.recv().await.unwrap();
    assert_eq!(first.version, 1);
    assert!(first.changed);
    assert_eq!(first.next.count, 1);

    let second = feed.recv().await.unwrap();
    assert_eq!(second.version, 2);
    assert!(!second.changed);
    assert_eq!(second.action.action_type(), "IGNORED");
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test]
async fn operations_after_stop_fail_fast() {
    let store = spawn_counter(StoreConfig::default());
    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();

    store.stop(StopMode::Drain).await;
    assert_eq!(store.state(), LoopState::Stopped);

    assert!(matches!(
        store.dispatch(CounterAction::Increment).await,
        Err(StoreError::Stopped)
    ));
    assert!(matches!(
        store.try_dispatch(CounterAction::Increment),
        Err(StoreError::Stopped)
    ));
    assert!(matches!(
        store.subscribe("INCREMENT", MemoryListener::<Counter>::new()),
        Err(StoreError::Stopped)
    ));
    assert!(matches!(store.start(), Err(StoreError::Stopped)));

    // Reads keep returning the final snapshot.
    assert_eq!(store.get_state().count, 1);

    // Second stop is a no-op.
    store.stop(StopMode::Discard).await;
    assert_eq!(store.state(), LoopState::Stopped);
}

#[tokio::test]
async fn drain_stop_processes_everything_accepted() {
    let store = spawn_counter(StoreConfig::default());
    let mut acks = Vec::new();
    for _ in 0..50 {
        acks.push(store.dispatch(CounterAction::Increment).await.unwrap());
    }

    store.stop(StopMode::Drain).await;

    for ack in acks {
        ack.await.unwrap();
    }
    assert_eq!(store.get_state().count, 50);
    assert_eq!(store.version(), 50);
}

#[tokio::test]
async fn drain_stop_on_never_started_store_still_drains() {
    let store = Store::new(Counter::at(0), CounterReducer, StoreConfig::default()).unwrap();
    let first = store.dispatch(CounterAction::Increment).await.unwrap();
    let second = store.dispatch(CounterAction::Add(4)).await.unwrap();
    assert_eq!(store.state(), LoopState::Idle);

    store.shutdown().await;

    assert_eq!(store.shutdown_mode(), StopMode::Drain);
    assert_eq!(first.await.unwrap().version, 1);
    assert_eq!(second.await.unwrap().next.count, 5);
    assert_eq!(store.state(), LoopState::Stopped);
}

#[tokio::test]
async fn discard_stop_fails_pending_acks() {
    let store = Store::new(
        Counter::at(0),
        CounterReducer,
        StoreConfig::default().with_stop_mode(StopMode::Discard),
    )
    .unwrap();
    let mut acks = Vec::new();
    for _ in 0..3 {
        acks.push(store.dispatch(CounterAction::Increment).await.unwrap());
    }

    store.shutdown().await;

    for ack in acks {
        assert!(matches!(ack.await, Err(StoreError::Stopped)));
    }
    assert_eq!(store.get_state().count, 0);
    assert_eq!(store.version(), 0);
}

#[tokio::test]
async fn concurrent_stops_all_return_after_shutdown() {
    let store = spawn_counter(StoreConfig::default());
    for _ in 0..10 {
        let _ = store.dispatch(CounterAction::Increment).await.unwrap();
    }

    let a = store.clone();
    let b = store.clone();
    tokio::join!(a.stop(StopMode::Drain), b.stop(StopMode::Drain));

    assert_eq!(store.state(), LoopState::Stopped);
    assert_eq!(store.get_state().count, 10);
}

#[tokio::test]
async fn stop_completes_after_first_stop_is_cancelled() {
    let store = spawn_counter(StoreConfig::default());
    let release = Arc::new(Notify::new());
    store
        .subscribe(
            "INCREMENT",
            Gate {
                release: Arc::clone(&release),
            },
        )
        .unwrap();
    let ack = store.dispatch(CounterAction::Increment).await.unwrap();

    let first = tokio::time::timeout(Duration::from_millis(20), store.stop(StopMode::Drain)).await;
    assert!(first.is_err(), "listener is gated, the drain cannot finish yet");
    assert_eq!(store.state(), LoopState::Stopping);

    release.notify_one();
    let second = tokio::time::timeout(Duration::from_secs(1), store.stop(StopMode::Drain)).await;
    assert!(second.is_ok(), "stop hung after an abandoned first stop");

    assert_eq!(store.state(), LoopState::Stopped);
    assert_eq!(ack.await.unwrap().next.count, 1);
    assert_eq!(store.get_state().count, 1);
}

#[tokio::test]
async fn cancelled_stop_of_never_started_store_still_drains() {
    let store = Store::new(Counter::at(0), CounterReducer, StoreConfig::default()).unwrap();
    let ack = store.dispatch(CounterAction::Add(3)).await.unwrap();

    // Dropped after its first poll.
    let _ = tokio::time::timeout(Duration::ZERO, store.stop(StopMode::Drain)).await;

    tokio::time::timeout(Duration::from_secs(1), store.stop(StopMode::Drain))
        .await
        .unwrap();
    assert_eq!(store.state(), LoopState::Stopped);
    assert_eq!(ack.await.unwrap().next.count, 3);
}

#[tokio::test]
async fn starting_twice_is_harmless() {
    let store = spawn_counter(StoreConfig::default());
    store.start().unwrap();
    store.dispatch_and_wait(CounterAction::Increment).await.unwrap();
    assert_eq!(store.get_state().count, 1);
}
