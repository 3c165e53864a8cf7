//! Activation lifecycle through a running silo: creation, activation
//! failure, idle collection, explicit deactivation and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use futures::future::join_all;
use async_trait::async_trait;
use moonpool_silo::{
    ActivationState, DeactivationReason, GrainId, InMemoryDirectory,
    InMemoryStorage, RejectionType, RequestError, Silo, SiloAddress, SiloConfig, SiloError,
    SiloStatus, StaticMembership, StorageError, StorageProvider, StoredState,
};

fn start(tally: &Arc<Tally>, config: SiloConfig) -> Silo {
    Silo::builder()
        .config(config)
        .grain_type(counter_type(tally))
        .grain_type(failing_type(tally))
        .grain_type(worker_type(tally))
        .start()
        .expect("silo starts")
}

#[tokio::test(start_paused = true)]
async fn test_call_activates_grain_once() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());

    let grain = counter("alice");
    for expected in 1..=3 {
        let reply = silo
            .call(grain.clone(), IFACE, INCREMENT, Vec::new())
            .await
            .expect("increment");
        assert_eq!(decode(&reply), expected);
    }

    assert_eq!(tally.activations(), 1);
    assert_eq!(silo.catalog().activation_count(), 1);
    let registered = silo.lookup(&grain).await.expect("lookup");
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].silo, silo.address());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_creation_converges_on_one_activation() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let grain = counter("race");

    let calls = (0..8).map(|_| silo.call(grain.clone(), IFACE, INCREMENT, Vec::new()));
    let mut results: Vec<i64> = join_all(calls)
        .await
        .into_iter()
        .map(|r| decode(&r.expect("every racing call succeeds")))
        .collect();
    results.sort_unstable();
    settle().await;

    assert_eq!(results, (1..=8).collect::<Vec<_>>());
    assert_eq!(tally.activations(), 1, "only the directory winner activates");
    assert_eq!(silo.catalog().activation_count(), 1);
    assert_eq!(silo.lookup(&grain).await.expect("lookup").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_activation_rejects_queued_requests() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let grain = GrainId::new(FAILING, "broken");

    let err = silo
        .call(grain.clone(), IFACE, INCREMENT, Vec::new())
        .await
        .expect_err("activation fails");
    match err {
        RequestError::Rejected { kind, reason } => {
            assert_eq!(kind, RejectionType::Unrecoverable);
            assert!(reason.contains("refusing to activate"), "reason: {reason}");
        }
        other => panic!("unexpected error {other:?}"),
    }

    settle().await;
    assert_eq!(tally.activations(), 0);
    assert_eq!(silo.catalog().activation_count(), 0);
    assert!(silo.lookup(&grain).await.expect("lookup").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_idle_activation_is_collected_once() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let config = SiloConfig::builder()
        .collection_quantum(Duration::from_secs(10))
        .default_age_limit(Duration::from_secs(60))
        .build();
    let silo = start(&tally, config);
    let grain = counter("idle");

    silo.call(grain.clone(), IFACE, INCREMENT, Vec::new())
        .await
        .expect("increment");
    let record = silo.catalog().find_activations(&grain)[0].clone();
    assert_eq!(silo.catalog().collector().count(), 1);

    tokio::time::advance(Duration::from_secs(65)).await;
    tokio::time::timeout(Duration::from_secs(1), record.wait_deactivated())
        .await
        .expect("collected after its age limit");

    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(tally.deactivations(), 1);
    assert_eq!(tally.reasons(), vec![DeactivationReason::IdleCollection]);
    assert_eq!(record.state(), ActivationState::Invalid);
    assert_eq!(silo.catalog().activation_count(), 0);
    assert!(silo.lookup(&grain).await.expect("lookup").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_activity_postpones_collection() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let config = SiloConfig::builder()
        .collection_quantum(Duration::from_secs(10))
        .default_age_limit(Duration::from_secs(60))
        .build();
    let silo = start(&tally, config);
    let grain = counter("busy");

    for _ in 0..4 {
        silo.call(grain.clone(), IFACE, INCREMENT, Vec::new())
            .await
            .expect("increment");
        tokio::time::advance(Duration::from_secs(40)).await;
        settle().await;
    }
    assert_eq!(tally.deactivations(), 0);
    assert_eq!(silo.catalog().activation_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_blocks_forced_collection() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let grain = counter("pinned");

    silo.call(grain.clone(), IFACE, KEEP_ALIVE, encode(3600))
        .await
        .expect("keep alive");
    assert_eq!(silo.catalog().collect_activations(Duration::ZERO).await, 0);

    silo.call(grain.clone(), IFACE, KEEP_ALIVE, encode(0))
        .await
        .expect("clear keep alive");
    assert_eq!(silo.catalog().collect_activations(Duration::ZERO).await, 1);
    assert_eq!(tally.reasons(), vec![DeactivationReason::ExplicitRequest]);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_is_capped() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let config = SiloConfig::builder()
        .max_keep_alive(Duration::from_secs(10))
        .build();
    let silo = start(&tally, config);
    let grain = counter("capped");

    silo.call(grain.clone(), IFACE, KEEP_ALIVE, encode(3600))
        .await
        .expect("keep alive");
    let record = silo.catalog().find_activations(&grain)[0].clone();
    let until = record.lock().keep_alive_until().expect("keep-alive set");
    assert!(until <= tokio::time::Instant::now() + Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_deactivate_on_idle() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let grain = counter("leaving");

    silo.call(grain.clone(), IFACE, INCREMENT, Vec::new())
        .await
        .expect("increment");
    let record = silo.catalog().find_activations(&grain)[0].clone();

    silo.call(grain.clone(), IFACE, DEACTIVATE, Vec::new())
        .await
        .expect("deactivate request");
    tokio::time::timeout(Duration::from_secs(1), record.wait_deactivated())
        .await
        .expect("deactivated once idle");
    settle().await;

    assert_eq!(tally.reasons(), vec![DeactivationReason::ApplicationRequest]);
    assert_eq!(silo.catalog().activation_count(), 0);

    let reply = silo
        .call(grain, IFACE, GET, Vec::new())
        .await
        .expect("fresh activation");
    assert_eq!(decode(&reply), 0, "state does not survive deactivation");
    assert_eq!(tally.activations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_delete_grains_local() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let grain = counter("doomed");

    silo.call(grain.clone(), IFACE, INCREMENT, Vec::new())
        .await
        .expect("increment");
    silo.catalog().delete_grains_local(&[grain.clone()]).await;

    assert_eq!(tally.deactivations(), 1);
    assert_eq!(silo.catalog().activation_count(), 0);
    assert!(silo.lookup(&grain).await.expect("lookup").is_empty());

    // a second delete finds nothing to do
    silo.catalog().delete_grains_local(&[grain]).await;
    assert_eq!(tally.deactivations(), 1);
}

/// In-memory storage whose reads take `delay`.
#[derive(Debug)]
struct DelayedStorage {
    inner: InMemoryStorage,
    delay: Duration,
}

#[async_trait]
impl StorageProvider for DelayedStorage {
    async fn read_state(
        &self,
        grain_type: &str,
        grain: &GrainId,
    ) -> Result<Option<StoredState>, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_state(grain_type, grain).await
    }

    async fn write_state(
        &self,
        grain_type: &str,
        grain: &GrainId,
        data: Vec<u8>,
        expected_etag: Option<&str>,
    ) -> Result<String, StorageError> {
        self.inner
            .write_state(grain_type, grain, data, expected_etag)
            .await
    }

    async fn clear_state(
        &self,
        grain_type: &str,
        grain: &GrainId,
        expected_etag: Option<&str>,
    ) -> Result<(), StorageError> {
        self.inner.clear_state(grain_type, grain, expected_etag).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_activation_abandons_initialization() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let storage = Arc::new(DelayedStorage {
        inner: InMemoryStorage::new(),
        delay: Duration::from_secs(1),
    });
    let silo = Arc::new(
        Silo::builder()
            .storage_provider("delayed", storage)
            .grain_type(counter_type(&tally).storage("delayed"))
            .start()
            .expect("silo starts"),
    );
    let grain = counter("half-built");

    let call = {
        let silo = silo.clone();
        let grain = grain.clone();
        tokio::spawn(async move { silo.call(grain, IFACE, INCREMENT, Vec::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let first = silo.catalog().find_activations(&grain)[0].clone();
    assert_eq!(first.lock().state(), ActivationState::Activating);
    silo.catalog().delete_grains_local(&[grain.clone()]).await;
    assert_eq!(first.lock().state(), ActivationState::Invalid);
    assert_eq!(tally.deactivations(), 0, "never-activated grain is not deactivated");

    // the queued request is rerouted to a fresh activation
    let reply = call.await.expect("join").expect("increment");
    assert_eq!(decode(&reply), 1);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(tally.activations(), 1);
    assert_eq!(tally.deactivations(), 0);
    let registered = silo.lookup(&grain).await.expect("lookup");
    assert_eq!(registered.len(), 1);
    assert_ne!(registered[0], *first.address());
    assert_eq!(silo.catalog().activation_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_membership_loss_deactivates_owned_grains() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let local = SiloAddress::localhost(2000, 1);
    let remote = SiloAddress::localhost(2001, 1);
    let membership = Arc::new(StaticMembership::new(local));
    membership.update_status(remote, SiloStatus::Active);

    let silo = Silo::builder()
        .silo(local)
        .membership(membership.clone())
        .directory(Arc::new(InMemoryDirectory::with_partition_owners(vec![remote])))
        .grain_type(counter_type(&tally))
        .start()
        .expect("silo starts");
    let grain = counter("orphan");

    silo.call(grain.clone(), IFACE, INCREMENT, Vec::new())
        .await
        .expect("increment");
    let record = silo.catalog().find_activations(&grain)[0].clone();

    membership.update_status(remote, SiloStatus::Dead);
    tokio::time::timeout(Duration::from_secs(1), record.wait_deactivated())
        .await
        .expect("deactivated after partition owner died");

    assert_eq!(tally.reasons(), vec![DeactivationReason::DirectoryOwnerLost]);
    assert_eq!(silo.catalog().activation_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_system_grain_is_exempt_from_collection() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());

    let record = silo
        .create_system_grain(GrainId::system(COUNTER, "membership"))
        .await
        .expect("system grain");

    assert_eq!(record.state(), ActivationState::Inactive);
    assert!(record.is_exempt_from_collection());
    assert_eq!(silo.catalog().collector().count(), 0);
    assert_eq!(silo.catalog().collect_activations(Duration::ZERO).await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_activation_loads_persisted_state() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let grain = counter("stored");
    let storage = Arc::new(InMemoryStorage::new());
    storage
        .write_state("Counter", &grain, b"hello".to_vec(), None)
        .await
        .expect("seed state");

    let silo = Silo::builder()
        .storage_provider("memory", storage)
        .grain_type(counter_type(&tally).storage("memory"))
        .start()
        .expect("silo starts");

    silo.call(grain, IFACE, INCREMENT, Vec::new())
        .await
        .expect("increment");
    let loaded = tally.loaded_state.lock().expect("tally lock").clone();
    assert_eq!(loaded, vec![Some(b"hello".to_vec())]);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_storage_provider_fails_activation() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = Silo::builder()
        .grain_type(counter_type(&tally).storage("missing"))
        .start()
        .expect("silo starts");

    let err = silo
        .call(counter("nostore"), IFACE, INCREMENT, Vec::new())
        .await
        .expect_err("no provider");
    assert!(matches!(
        err,
        RequestError::Rejected {
            kind: RejectionType::Unrecoverable,
            ..
        }
    ));
    assert_eq!(tally.activations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_grain_statistics() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());

    for key in ["a", "b"] {
        silo.call(counter(key), IFACE, INCREMENT, Vec::new())
            .await
            .expect("increment");
    }
    silo.call(GrainId::new(WORKER, "w"), IFACE, INCREMENT, Vec::new())
        .await
        .expect("worker");

    assert_eq!(
        silo.catalog().get_simple_grain_statistics(),
        vec![("Counter".to_string(), 2), ("Worker".to_string(), 1)]
    );
    let stats = silo.catalog().get_grain_statistics();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|s| s.silo == silo.address()));

    let report = silo.catalog().get_detailed_grain_report(&counter("a"));
    assert_eq!(report.grain_type.as_deref(), Some("Counter"));
    assert_eq!(report.local_activations.len(), 1);
    assert_eq!(report.primary_for_grain, Some(silo.address()));
    assert!(report.to_string().contains("Counter"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_deactivates_everything() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());

    for key in ["x", "y", "z"] {
        silo.call(counter(key), IFACE, INCREMENT, Vec::new())
            .await
            .expect("increment");
    }
    silo.stop().await.expect("stop");

    assert_eq!(tally.deactivations(), 3);
    assert!(tally
        .reasons()
        .iter()
        .all(|r| *r == DeactivationReason::SiloShutdown));
    assert_eq!(silo.catalog().activation_count(), 0);
    assert!(matches!(silo.stop().await, Err(SiloError::ShuttingDown)));
}

#[test]
fn test_start_outside_runtime_fails() {
    let tally = Arc::new(Tally::default());
    let result = Silo::builder()
        .grain_type(counter_type(&tally))
        .start();
    assert!(matches!(result, Err(SiloError::NoRuntime)));
}
