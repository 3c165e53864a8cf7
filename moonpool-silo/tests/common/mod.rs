//! Shared grains and helpers for silo integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use moonpool_silo::grain::MethodFuture;
use moonpool_silo::{
    DeactivationReason, Grain, GrainContext, GrainError, GrainId, GrainType, GrainTypeData,
    MessageFlags, MethodTable, StoredState,
};

pub const COUNTER: GrainType = GrainType(1);
pub const REENTRANT: GrainType = GrainType(2);
pub const FAILING: GrainType = GrainType(3);
pub const WORKER: GrainType = GrainType(4);

pub const IFACE: u32 = 1;
pub const INCREMENT: u32 = 1;
pub const GET: u32 = 2;
pub const FAIL: u32 = 3;
pub const SLOW: u32 = 4;
pub const RELAY: u32 = 5;
pub const KEEP_ALIVE: u32 = 6;
pub const DEACTIVATE: u32 = 7;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Lifecycle and concurrency observations shared by every grain of a type.
#[derive(Debug, Default)]
pub struct Tally {
    pub activations: AtomicUsize,
    pub deactivations: AtomicUsize,
    pub reasons: Mutex<Vec<DeactivationReason>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub loaded_state: Mutex<Vec<Option<Vec<u8>>>>,
}

impl Tally {
    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reasons(&self) -> Vec<DeactivationReason> {
        self.reasons.lock().expect("tally lock").clone()
    }
}

/// Counter grain used by most tests.
///
/// `RELAY` takes a comma separated list of `type:key` hops, calls the first
/// hop with the rest, and increments once the list is empty.
pub struct TestGrain {
    tally: Arc<Tally>,
    count: AtomicI64,
    fail_activation: bool,
    methods: MethodTable<TestGrain>,
}

impl TestGrain {
    pub fn new(tally: Arc<Tally>, fail_activation: bool) -> Self {
        Self {
            tally,
            count: AtomicI64::new(0),
            fail_activation,
            methods: MethodTable::new()
                .with(IFACE, INCREMENT, increment)
                .with(IFACE, GET, get)
                .with(IFACE, FAIL, fail)
                .with(IFACE, SLOW, slow)
                .with(IFACE, RELAY, relay)
                .with(IFACE, KEEP_ALIVE, keep_alive)
                .with(IFACE, DEACTIVATE, deactivate),
        }
    }

    fn enter(&self) {
        let now = self.tally.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.tally.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn encode(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}

fn increment<'a>(grain: &'a TestGrain, _ctx: &'a GrainContext, _body: &'a [u8]) -> MethodFuture<'a> {
    Box::pin(async move { Ok(encode(grain.count.fetch_add(1, Ordering::SeqCst) + 1)) })
}

fn get<'a>(grain: &'a TestGrain, _ctx: &'a GrainContext, _body: &'a [u8]) -> MethodFuture<'a> {
    Box::pin(async move { Ok(encode(grain.count.load(Ordering::SeqCst))) })
}

fn fail<'a>(_grain: &'a TestGrain, _ctx: &'a GrainContext, _body: &'a [u8]) -> MethodFuture<'a> {
    Box::pin(async move { Err(GrainError::Failed("boom".into())) })
}

fn slow<'a>(grain: &'a TestGrain, _ctx: &'a GrainContext, body: &'a [u8]) -> MethodFuture<'a> {
    Box::pin(async move {
        grain.enter();
        let millis = u64::try_from(decode(body)).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        grain.leave();
        Ok(encode(grain.count.fetch_add(1, Ordering::SeqCst) + 1))
    })
}

fn relay<'a>(grain: &'a TestGrain, ctx: &'a GrainContext, body: &'a [u8]) -> MethodFuture<'a> {
    Box::pin(async move {
        let route = String::from_utf8_lossy(body).to_string();
        let Some((hop, rest)) = split_route(&route) else {
            return Ok(encode(grain.count.fetch_add(1, Ordering::SeqCst) + 1));
        };
        ctx.call(hop, IFACE, RELAY, rest.into_bytes(), MessageFlags::empty())
            .await
            .map_err(|err| GrainError::Failed(err.to_string()))
    })
}

fn keep_alive<'a>(_grain: &'a TestGrain, ctx: &'a GrainContext, body: &'a [u8]) -> MethodFuture<'a> {
    Box::pin(async move {
        let secs = u64::try_from(decode(body)).unwrap_or(0);
        ctx.delay_deactivation(Duration::from_secs(secs));
        Ok(Vec::new())
    })
}

fn deactivate<'a>(_grain: &'a TestGrain, ctx: &'a GrainContext, _body: &'a [u8]) -> MethodFuture<'a> {
    Box::pin(async move {
        ctx.deactivate_on_idle();
        Ok(Vec::new())
    })
}

fn split_route(route: &str) -> Option<(GrainId, String)> {
    let mut hops = route.split(',').filter(|h| !h.is_empty());
    let hop = hops.next()?;
    let (grain_type, key) = hop.split_once(':')?;
    let grain_type = GrainType(grain_type.parse().ok()?);
    let rest: Vec<&str> = hops.collect();
    Some((GrainId::new(grain_type, key), rest.join(",")))
}

#[async_trait]
impl Grain for TestGrain {
    async fn on_activate(
        &self,
        _ctx: &GrainContext,
        state: Option<StoredState>,
    ) -> Result<(), GrainError> {
        if self.fail_activation {
            return Err(GrainError::Failed("refusing to activate".into()));
        }
        self.tally
            .loaded_state
            .lock()
            .expect("tally lock")
            .push(state.map(|s| s.data));
        self.tally.activations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_deactivate(
        &self,
        _ctx: &GrainContext,
        reason: DeactivationReason,
    ) -> Result<(), GrainError> {
        self.tally.deactivations.fetch_add(1, Ordering::SeqCst);
        self.tally.reasons.lock().expect("tally lock").push(reason);
        Ok(())
    }

    async fn invoke(
        &self,
        ctx: &GrainContext,
        interface_id: u32,
        method_id: u32,
        body: &[u8],
    ) -> Result<Vec<u8>, GrainError> {
        self.methods
            .dispatch(self, ctx, interface_id, method_id, body)
            .await
    }
}

pub fn counter_type(tally: &Arc<Tally>) -> GrainTypeData {
    let tally = tally.clone();
    GrainTypeData::new(COUNTER, "Counter", move |_| {
        Arc::new(TestGrain::new(tally.clone(), false)) as Arc<dyn Grain>
    })
}

pub fn reentrant_type(tally: &Arc<Tally>) -> GrainTypeData {
    let tally = tally.clone();
    GrainTypeData::new(REENTRANT, "Reentrant", move |_| {
        Arc::new(TestGrain::new(tally.clone(), false)) as Arc<dyn Grain>
    })
    .reentrant()
}

pub fn failing_type(tally: &Arc<Tally>) -> GrainTypeData {
    let tally = tally.clone();
    GrainTypeData::new(FAILING, "Failing", move |_| {
        Arc::new(TestGrain::new(tally.clone(), true)) as Arc<dyn Grain>
    })
}

pub fn worker_type(tally: &Arc<Tally>) -> GrainTypeData {
    let tally = tally.clone();
    GrainTypeData::new(WORKER, "Worker", move |_| {
        Arc::new(TestGrain::new(tally.clone(), false)) as Arc<dyn Grain>
    })
    .stateless_worker(4)
}

pub fn counter(key: &str) -> GrainId {
    GrainId::new(COUNTER, key)
}

/// Let spawned tasks run until nothing is left to do.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
