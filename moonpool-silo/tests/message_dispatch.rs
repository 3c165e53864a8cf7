//! Message dispatch through a running silo: queueing, interleaving,
//! overload, deadlock detection and rejection paths.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use moonpool_silo::{
    GrainId, GrainType, MessageFlags, RejectionType, RequestError, Silo, SiloConfig, SiloStatus,
};
use tokio::task::JoinHandle;

fn start(tally: &Arc<Tally>, config: SiloConfig) -> Arc<Silo> {
    let silo = Silo::builder()
        .config(config)
        .grain_type(counter_type(tally))
        .grain_type(reentrant_type(tally))
        .start()
        .expect("silo starts");
    Arc::new(silo)
}

fn spawn_call(
    silo: &Arc<Silo>,
    grain: GrainId,
    method: u32,
    body: Vec<u8>,
    flags: MessageFlags,
) -> JoinHandle<Result<Vec<u8>, RequestError>> {
    let silo = silo.clone();
    tokio::spawn(async move { silo.call_with_flags(grain, IFACE, method, body, flags).await })
}

/// Sleeping lets every runnable task reach quiescence before the paused
/// clock moves.
async fn quiesce() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_busy_activation_queues_second_request() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let grain = counter("queue");

    silo.call(grain.clone(), IFACE, GET, Vec::new())
        .await
        .expect("activate");
    let record = silo.catalog().find_activations(&grain)[0].clone();

    let first = spawn_call(&silo, grain.clone(), SLOW, encode(1000), MessageFlags::empty());
    quiesce().await;
    let second = spawn_call(&silo, grain.clone(), SLOW, encode(1000), MessageFlags::empty());
    quiesce().await;

    {
        let inner = record.lock();
        assert_eq!(inner.running_count(), 1);
        assert_eq!(inner.waiting_count(), 1);
    }

    let first = decode(&first.await.expect("join").expect("first call"));
    let second = decode(&second.await.expect("join").expect("second call"));
    assert_eq!((first, second), (1, 2));
    assert_eq!(tally.max_in_flight(), 1);
    assert_eq!(record.lock().waiting_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_read_only_requests_interleave() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let grain = counter("readers");

    silo.call(grain.clone(), IFACE, GET, Vec::new())
        .await
        .expect("activate");

    let first = spawn_call(&silo, grain.clone(), SLOW, encode(1000), MessageFlags::READ_ONLY);
    quiesce().await;
    let second = spawn_call(&silo, grain.clone(), SLOW, encode(1000), MessageFlags::READ_ONLY);

    first.await.expect("join").expect("first call");
    second.await.expect("join").expect("second call");
    assert_eq!(tally.max_in_flight(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_always_interleave_bypasses_busy_turn() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let grain = counter("urgent");

    silo.call(grain.clone(), IFACE, GET, Vec::new())
        .await
        .expect("activate");

    let slow = spawn_call(&silo, grain.clone(), SLOW, encode(1000), MessageFlags::empty());
    quiesce().await;
    let started = tokio::time::Instant::now();
    silo.call_with_flags(grain, IFACE, GET, Vec::new(), MessageFlags::ALWAYS_INTERLEAVE)
        .await
        .expect("interleaved get");
    assert!(started.elapsed() < Duration::from_millis(500));

    slow.await.expect("join").expect("slow call");
}

#[tokio::test(start_paused = true)]
async fn test_hard_limit_rejects_as_overloaded() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let config = SiloConfig::builder().max_enqueued_requests(0, 2).build();
    let silo = start(&tally, config);
    let grain = counter("crowded");

    silo.call(grain.clone(), IFACE, GET, Vec::new())
        .await
        .expect("activate");

    let mut calls = Vec::new();
    for _ in 0..3 {
        calls.push(spawn_call(&silo, grain.clone(), SLOW, encode(1000), MessageFlags::empty()));
        quiesce().await;
    }

    let mut ok = 0;
    let mut overloaded = 0;
    for call in calls {
        match call.await.expect("join") {
            Ok(_) => ok += 1,
            Err(RequestError::Rejected {
                kind: RejectionType::Overloaded,
                reason,
            }) => {
                assert!(reason.contains("MaxEnqueuedRequests"), "reason: {reason}");
                overloaded += 1;
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!((ok, overloaded), (2, 1));
}

#[tokio::test(start_paused = true)]
async fn test_call_cycle_on_non_reentrant_grain_is_a_deadlock() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());

    let err = silo
        .call(counter("a"), IFACE, RELAY, b"1:b,1:a".to_vec())
        .await
        .expect_err("cycle a -> b -> a");
    match err {
        RequestError::Fault(reason) => assert!(reason.contains("deadlock"), "reason: {reason}"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_call_cycle_on_reentrant_grain_completes() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let a = GrainId::new(REENTRANT, "a");

    let reply = silo
        .call(a.clone(), IFACE, RELAY, b"2:b,2:a".to_vec())
        .await
        .expect("reentrant cycle");
    assert_eq!(decode(&reply), 1);

    let count = silo.call(a, IFACE, GET, Vec::new()).await.expect("get");
    assert_eq!(decode(&count), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadlock_detection_can_be_disabled() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let config = SiloConfig::builder()
        .deadlock_detection(false)
        .response_timeout(Duration::from_secs(5))
        .resend_on_timeout(false)
        .build();
    let silo = start(&tally, config);

    let err = silo
        .call(counter("a"), IFACE, RELAY, b"1:b,1:a".to_vec())
        .await
        .expect_err("cycle waits for its own turn");
    let timed_out = match &err {
        RequestError::Timeout(_) => true,
        RequestError::Fault(reason) => reason.contains("timed out"),
        _ => false,
    };
    assert!(timed_out, "got {err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_grain_error_is_returned_to_caller() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());

    let err = silo
        .call(counter("oops"), IFACE, FAIL, Vec::new())
        .await
        .expect_err("method fails");
    assert_eq!(err, RequestError::Fault("boom".into()));

    // the activation survives an application error
    let reply = silo
        .call(counter("oops"), IFACE, INCREMENT, Vec::new())
        .await
        .expect("increment");
    assert_eq!(decode(&reply), 1);
    assert_eq!(tally.activations(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_method_faults() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());

    let err = silo
        .call(counter("m"), IFACE, 99, Vec::new())
        .await
        .expect_err("no such method");
    assert!(matches!(err, RequestError::Fault(reason) if reason.contains("unknown method")));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_grain_type_is_rejected() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());

    let err = silo
        .call(GrainId::new(GrainType(99), "ghost"), IFACE, GET, Vec::new())
        .await
        .expect_err("unregistered type");
    assert!(matches!(
        err,
        RequestError::Rejected {
            kind: RejectionType::Unrecoverable,
            ..
        }
    ));
    assert_eq!(silo.catalog().activation_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_injected_rejections_exhaust_resends() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let config = SiloConfig::builder()
        .fault_injection(1.0, 0.0, Some(7))
        .build();
    let silo = start(&tally, config);

    let err = silo
        .call(counter("unlucky"), IFACE, GET, Vec::new())
        .await
        .expect_err("always rejected");
    assert_eq!(
        err,
        RequestError::Rejected {
            kind: RejectionType::Transient,
            reason: "Injected rejection".into(),
        }
    );
    assert_eq!(tally.activations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_requests_rejected_while_shutting_down() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());

    silo.membership()
        .update_status(silo.address(), SiloStatus::ShuttingDown);
    let err = silo
        .call(counter("late"), IFACE, GET, Vec::new())
        .await
        .expect_err("shutting down");
    match err {
        RequestError::Rejected { reason, .. } => {
            assert!(reason.contains("shutting down"), "reason: {reason}")
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(tally.activations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_one_way_message_runs_turn() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = start(&tally, SiloConfig::default());
    let grain = counter("fire");

    silo.send_one_way(grain.clone(), IFACE, INCREMENT, Vec::new())
        .expect("send");
    quiesce().await;

    let reply = silo.call(grain, IFACE, GET, Vec::new()).await.expect("get");
    assert_eq!(decode(&reply), 1);
    assert_eq!(silo.client().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stateless_worker_spreads_concurrent_requests() {
    init_tracing();
    let tally = Arc::new(Tally::default());
    let silo = Arc::new(
        Silo::builder()
            .grain_type(worker_type(&tally))
            .start()
            .expect("silo starts"),
    );
    let grain = GrainId::new(WORKER, "pool");

    silo.call(grain.clone(), IFACE, GET, Vec::new())
        .await
        .expect("activate");
    let calls: Vec<_> = (0..3)
        .map(|_| spawn_call(&silo, grain.clone(), SLOW, encode(1000), MessageFlags::empty()))
        .collect();
    for call in calls {
        call.await.expect("join").expect("worker call");
    }

    let local = silo.catalog().find_activations(&grain).len();
    assert!((1..=4).contains(&local), "{local} worker activations");
    assert_eq!(silo.lookup(&grain).await.expect("lookup").len(), local);
}
