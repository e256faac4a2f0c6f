//! Ordering properties of lanes and retirement under random schedules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;

use entity_replication::core::{
    CompletionToken, ConcurrencyKey, EntityDescriptor, EntityId, EntityVersion, NodeId,
    RequestOrigin, ServerEntityAction, ServerEntityRequest,
};
use entity_replication::daemon::{JobClass, LaneJob, LanePool, RetirementManager};

fn entity(name: &str) -> EntityId {
    EntityId::new("Ledger", name).unwrap_or_else(|e| panic!("invalid entity {name}: {e}"))
}

#[derive(Clone, Copy, Debug)]
struct Span {
    key: ConcurrencyKey,
    start: u64,
    end: u64,
}

fn key_strategy() -> impl Strategy<Value = ConcurrencyKey> {
    prop_oneof![
        6 => (1i32..4).prop_map(ConcurrencyKey::new),
        1 => Just(ConcurrencyKey::MANAGEMENT),
        1 => Just(ConcurrencyKey::UNIVERSAL),
    ]
}

/// Runs `keys` as jobs of one entity and returns each job's execution span,
/// indexed by submission order.
fn run_lanes(keys: &[ConcurrencyKey], workers: usize) -> Vec<Span> {
    let pool = LanePool::start(workers, keys.len() + 1).expect("start pool");
    let scheduler = pool.scheduler();
    let clock = Arc::new(AtomicU64::new(0));
    let spans = Arc::new(Mutex::new(HashMap::new()));
    let (done_tx, done_rx) = crossbeam::channel::unbounded();
    let target = entity("fifo");

    for (index, key) in keys.iter().copied().enumerate() {
        let clock = Arc::clone(&clock);
        let spans = Arc::clone(&spans);
        let done = done_tx.clone();
        let job = LaneJob::new(
            target.clone(),
            key,
            JobClass::Regular,
            move || {
                let start = clock.fetch_add(1, Ordering::SeqCst);
                std::thread::yield_now();
                let end = clock.fetch_add(1, Ordering::SeqCst);
                spans.lock().unwrap().insert(index, Span { key, start, end });
                done.send(index).unwrap();
            },
            |err| panic!("job cancelled: {err}"),
        );
        scheduler.submit(job).expect("queue has room");
    }
    for _ in keys {
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("job finished");
    }
    pool.shutdown();

    let spans = spans.lock().unwrap();
    (0..keys.len()).map(|index| spans[&index]).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn same_key_jobs_run_in_submission_order(
        keys in proptest::collection::vec(key_strategy(), 1..40),
        workers in 1usize..5,
    ) {
        let spans = run_lanes(&keys, workers);
        for (i, earlier) in spans.iter().enumerate() {
            for later in &spans[i + 1..] {
                let ordered = earlier.key == later.key
                    || earlier.key.is_barrier()
                    || later.key.is_barrier();
                if ordered {
                    prop_assert!(
                        earlier.end < later.start,
                        "{:?} overlapped or ran after {:?}",
                        earlier,
                        later
                    );
                }
            }
        }
    }
}

fn internal_request(n: u64) -> ServerEntityRequest {
    ServerEntityRequest {
        descriptor: EntityDescriptor::internal(entity("chain"), EntityVersion::FIRST),
        action: ServerEntityAction::Invoke,
        key: ConcurrencyKey::new(1),
        payload: Bytes::from(n.to_string()),
        source: NodeId::random(),
        origin: RequestOrigin::Internal,
    }
}

/// Builds a chain where token `i` waits on token `i + 1`.
fn chain(len: u64) -> (RetirementManager, Vec<ServerEntityRequest>) {
    let manager = RetirementManager::new();
    let requests: Vec<_> = (0..len).map(internal_request).collect();
    for (n, request) in requests.iter().enumerate() {
        manager
            .register_with_message(
                request.clone(),
                CompletionToken::from_raw(n as u64),
                ConcurrencyKey::new(1),
            )
            .unwrap();
    }
    for n in 1..len {
        manager
            .defer_retirement(CompletionToken::from_raw(n - 1), CompletionToken::from_raw(n))
            .unwrap();
    }
    (manager, requests)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn deferred_requests_never_retire_before_their_target(
        order in (1u64..10).prop_flat_map(|len| Just((0..len).collect::<Vec<_>>()).prop_shuffle()),
    ) {
        let len = order.len() as u64;
        let (manager, requests) = chain(len);
        let mut retired_in: HashMap<Bytes, usize> = HashMap::new();
        for (call, raw) in order.iter().enumerate() {
            let retired = manager
                .retire_for_completion(CompletionToken::from_raw(*raw))
                .unwrap();
            for request in retired {
                prop_assert!(
                    retired_in.insert(request.payload.clone(), call).is_none(),
                    "{:?} retired twice",
                    request
                );
            }
        }
        prop_assert_eq!(retired_in.len(), requests.len());
        prop_assert_eq!(manager.pending(), 0);
        for pair in requests.windows(2) {
            prop_assert!(retired_in[&pair[0].payload] >= retired_in[&pair[1].payload]);
        }
    }
}

#[test]
fn in_order_completion_retires_the_whole_chain_at_once() {
    let (manager, requests) = chain(5);
    for n in 0..4 {
        let retired = manager
            .retire_for_completion(CompletionToken::from_raw(n))
            .unwrap();
        assert!(retired.is_empty(), "token {n} retired early");
    }
    let retired = manager
        .retire_for_completion(CompletionToken::from_raw(4))
        .unwrap();
    assert_eq!(retired, requests);
}
