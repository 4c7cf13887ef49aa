use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use gbn_abstract::{EngineConfig, Substrate};
use tracing::{info, trace, warn};

use crate::engine::{Engine, EngineStats, Step};
use crate::error::RdtError;
use crate::queue::{QueueRx, QueueTx, app_queue};

type Worker = JoinHandle<Result<EngineStats, RdtError>>;

/// Reliable transport endpoint driven by its own engine thread.
///
/// The application calls [`send`](Self::send) and [`receive`](Self::receive)
/// from any thread; the engine thread owns every piece of protocol state.
///
/// Dropping a started endpoint tells its thread to quit at the next poll,
/// discarding whatever is still unacknowledged. Only [`stop`](Self::stop)
/// waits for delivery.
pub struct Rdt<S> {
    engine: Option<Engine<S>>,
    idle_sleep: Duration,
    to_engine: QueueTx<Bytes>,
    from_engine: QueueRx<Bytes>,
    stop: Arc<AtomicBool>,
    abandon: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl<S: Substrate + Send + 'static> Rdt<S> {
    pub fn new(config: EngineConfig, substrate: S) -> Result<Self, RdtError> {
        config.validate()?;
        let (to_engine, inbound) = app_queue("inbound", config.queue_capacity);
        let (outbound, from_engine) = app_queue("outbound", config.queue_capacity);
        let engine = Engine::new(&config, substrate, inbound, outbound)?;
        Ok(Self {
            engine: Some(engine),
            idle_sleep: config.idle_sleep(),
            to_engine,
            from_engine,
            stop: Arc::new(AtomicBool::new(false)),
            abandon: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Spawn the engine thread.
    pub fn start(&mut self) -> Result<(), RdtError> {
        let engine = self.engine.take().ok_or(RdtError::AlreadyStarted)?;
        let stop = self.stop.clone();
        let abandon = self.abandon.clone();
        let idle_sleep = self.idle_sleep;
        let worker = thread::Builder::new()
            .name("gbn-engine".to_string())
            .spawn(move || run_loop(engine, &stop, &abandon, idle_sleep))
            .map_err(RdtError::Spawn)?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Ask the engine to finish and wait for it.
    ///
    /// The engine keeps running until every payload already handed to
    /// [`send`](Self::send) has been acknowledged. If the peer is gone for
    /// good this never returns; dropping the `Rdt` instead ends the thread
    /// and abandons whatever is still unacknowledged.
    pub fn stop(&mut self) -> Result<EngineStats, RdtError> {
        let worker = self.worker.take().ok_or(RdtError::NotRunning)?;
        self.stop.store(true, Ordering::Release);
        worker.join().map_err(|_| RdtError::Panicked)?
    }

    /// Queue a payload for reliable delivery, blocking while the queue is full.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), RdtError> {
        self.to_engine.put(payload.into())
    }

    /// `true` when [`send`](Self::send) would not block.
    pub fn ready_to_send(&self) -> bool {
        self.to_engine.has_capacity()
    }

    /// Next delivered payload, blocking until one arrives.
    pub fn receive(&self) -> Result<Bytes, RdtError> {
        self.from_engine.take()
    }

    pub fn try_receive(&self) -> Result<Option<Bytes>, RdtError> {
        self.from_engine.try_take()
    }

    /// `true` when [`receive`](Self::receive) would not block.
    pub fn has_incoming(&self) -> bool {
        self.from_engine.has_data()
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl<S> Drop for Rdt<S> {
    fn drop(&mut self) {
        self.abandon.store(true, Ordering::Release);
    }
}

fn run_loop<S: Substrate>(
    mut engine: Engine<S>,
    stop: &AtomicBool,
    abandon: &AtomicBool,
    idle_sleep: Duration,
) -> Result<EngineStats, RdtError> {
    let t0 = Instant::now();
    info!("engine loop started");

    while !(stop.load(Ordering::Acquire) && engine.is_drained()) {
        if abandon.load(Ordering::Acquire) {
            warn!(
                in_flight = engine.send_state().in_flight(),
                "endpoint dropped, abandoning engine loop"
            );
            break;
        }
        match engine.poll(t0.elapsed()) {
            Ok(Step::Idle) | Ok(Step::AwaitingBurst(_)) => thread::sleep(idle_sleep),
            Ok(step) => trace!(?step, "engine step"),
            Err(e) => {
                warn!(error = %e, "engine loop terminated");
                return Err(e);
            }
        }
    }

    let stats = engine.stats();
    info!(?stats, "engine loop stopped");
    Ok(stats)
}
