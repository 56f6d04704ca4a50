use crate::dispatch::{DispatchBatch, DispatchWorker, Dispatcher, Frame, Sink, DEFAULT_QUEUE_CAPACITY};
use crate::error::{EngineError, Result};
use crate::generator::generate;
use crate::message::SceneId;
use crate::metrics::{Metrics, MetricsSnapshot, DEFAULT_CAPACITY};
use crate::pattern::Pattern;
use crate::pipeline::{Pipeline, Registration, TickContext};
use crate::store::{Scene, Track, TrackStatus, TrackStore};
use crate::timing::{spin_until, StepClock, DEFAULT_BPM, DEFAULT_SUBDIVISION};
use crate::transport::{StopPolicy, Transport, TransportState};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

/// Engine startup parameters.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub bpm: f64,
    pub subdivision: u32,
    pub stop_policy: StopPolicy,
    /// The clock sleeps until this long before a deadline, then spins.
    pub spin_margin: Duration,
    pub queue_capacity: usize,
    pub metrics_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            subdivision: DEFAULT_SUBDIVISION,
            stop_policy: StopPolicy::default(),
            spin_margin: Duration::from_millis(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            metrics_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// State shared between the control plane and the timing thread.
#[derive(Debug)]
pub struct EngineState {
    pub transport: Transport,
    /// Replaced copy-on-write so a tick's snapshot never changes under it.
    pub store: Arc<TrackStore>,
}

/// Read-only engine view for the presentation layer.
#[derive(Clone, Debug, Serialize)]
pub struct EngineSnapshot {
    pub state: TransportState,
    pub bpm: f64,
    pub step_index: u64,
    pub subdivision: u32,
    pub tracks: Vec<TrackStatus>,
    pub active_scene: Option<SceneId>,
    pub metrics: MetricsSnapshot,
}

enum Signal {
    /// Shared state changed; re-evaluate the next deadline.
    Wake,
    Shutdown,
}

struct Shared {
    state: RwLock<EngineState>,
    signals: Sender<Signal>,
    metrics: Metrics,
    registrations: Vec<Registration>,
    subdivision: u32,
    shutdown: AtomicBool,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to a running engine.
///
/// Every control operation takes the state lock briefly, applies the change
/// and wakes the timing thread. Cloning is cheap.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn play(&self) -> Result<TransportState> {
        self.update(|state| Ok(state.transport.play()))
    }

    pub fn stop(&self) -> Result<TransportState> {
        self.update(|state| Ok(state.transport.stop()))
    }

    pub fn pause(&self) -> Result<TransportState> {
        self.update(|state| Ok(state.transport.pause()))
    }

    /// Change the tempo from the next step boundary on.
    pub fn set_bpm(&self, bpm: f64) -> Result<TransportState> {
        self.update(|state| state.transport.set_bpm(bpm))
    }

    pub fn mute(&self, track_id: &str, muted: bool) -> Result<bool> {
        self.update_store(|store| store.mute(track_id, muted))
    }

    pub fn solo(&self, track_id: &str, soloed: bool) -> Result<bool> {
        self.update_store(|store| store.solo(track_id, soloed))
    }

    pub fn activate_scene(&self, scene_id: &str) -> Result<bool> {
        self.update_store(|store| store.activate_scene(scene_id))
    }

    pub fn deactivate_scene(&self) -> Result<Option<SceneId>> {
        self.update_store(|store| Ok(store.deactivate_scene()))
    }

    pub fn insert_track(&self, track: Track) -> Result<Option<Track>> {
        self.update_store(|store| Ok(store.insert_track(track)))
    }

    pub fn remove_track(&self, track_id: &str) -> Result<Track> {
        self.update_store(|store| store.remove_track(track_id))
    }

    pub fn set_pattern(&self, track_id: &str, pattern: Pattern) -> Result<()> {
        self.update_store(|store| store.set_pattern(track_id, pattern))
    }

    pub fn insert_scene(&self, scene: Scene) -> Result<()> {
        self.update_store(|store| {
            store.insert_scene(scene);
            Ok(())
        })
    }

    /// Read the current state with a closure.
    pub fn with_state<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&EngineState) -> R,
    {
        f(&self.shared.read())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let (state, bpm, step_index, store) = self.with_state(|s| {
            (
                s.transport.state(),
                s.transport.bpm(),
                s.transport.step_index(),
                Arc::clone(&s.store),
            )
        });
        EngineSnapshot {
            state,
            bpm,
            step_index,
            subdivision: self.shared.subdivision,
            tracks: store.track_statuses(),
            active_scene: store.active_scene_id().cloned(),
            metrics: self.shared.metrics.snapshot(),
        }
    }

    /// Pipeline registrations in execution order, with declared endpoints.
    pub fn extension_registrations(&self) -> &[Registration] {
        &self.shared.registrations
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Wait until the transport's next step is at least `step`.
    /// Returns false on timeout.
    pub fn wait_for_step(&self, step: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.with_state(|s| s.transport.step_index()) >= step {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_micros(500));
        }
    }

    /// Signal the timing thread to exit.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::SeqCst) {
            let _ = self.shared.signals.send(Signal::Shutdown);
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    fn update<R>(&self, f: impl FnOnce(&mut EngineState) -> Result<R>) -> Result<R> {
        if self.is_shutdown_requested() {
            return Err(EngineError::EngineUnavailable("engine has shut down".to_string()));
        }
        let result = f(&mut self.shared.write());
        let _ = self.shared.signals.send(Signal::Wake);
        result
    }

    fn update_store<R>(&self, f: impl FnOnce(&mut TrackStore) -> Result<R>) -> Result<R> {
        self.update(|state| f(Arc::make_mut(&mut state.store)))
    }
}

/// A running engine. Dropping it stops and joins its threads.
pub struct Engine {
    handle: EngineHandle,
    clock_thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Start the dispatch worker and the timing thread. The transport
    /// starts stopped.
    pub fn start(
        options: EngineOptions,
        store: TrackStore,
        pipeline: Pipeline,
        sinks: Vec<Box<dyn Sink>>,
    ) -> Result<Self> {
        let metrics = Metrics::new(options.metrics_capacity);
        let dispatch = DispatchWorker::spawn(Dispatcher::new(sinks, metrics.clone()), options.queue_capacity)?;

        let (signals_tx, signals_rx) = unbounded();
        let subdivision = options.subdivision.max(1);
        let transport = Transport::new(options.bpm, options.stop_policy);
        let shared = Arc::new(Shared {
            state: RwLock::new(EngineState {
                transport,
                store: Arc::new(store),
            }),
            signals: signals_tx,
            metrics,
            registrations: pipeline.registrations().to_vec(),
            subdivision,
            shutdown: AtomicBool::new(false),
        });

        let clock = ClockThread {
            clock: StepClock::new(shared.read().transport.bpm(), subdivision),
            shared: Arc::clone(&shared),
            signals: signals_rx,
            pipeline,
            dispatch,
            spin_margin: options.spin_margin,
            epoch: None,
        };

        let clock_thread = thread::Builder::new()
            .name("vibeloop-clock".to_string())
            .spawn(move || clock.run())
            .map_err(|e| EngineError::EngineUnavailable(format!("failed to spawn timing thread: {}", e)))?;

        log::info!(
            "[ENGINE] started: {} BPM, {} steps per beat, {} extensions",
            options.bpm,
            subdivision,
            shared.registrations.len()
        );

        Ok(Self {
            handle: EngineHandle { shared },
            clock_thread: Some(clock_thread),
        })
    }

    /// Get a handle to control the engine.
    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Shut down gracefully, waiting for pending batches to be dispatched.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.clock_thread.take() {
            if thread.join().is_err() {
                log::error!("[ENGINE] timing thread panicked");
            }
            log::info!("[ENGINE] stopped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.join();
    }
}

/// The timing thread: owns the clock and the pipeline, fires one tick at a
/// time.
struct ClockThread {
    shared: Arc<Shared>,
    signals: Receiver<Signal>,
    clock: StepClock,
    pipeline: Pipeline,
    dispatch: DispatchWorker,
    spin_margin: Duration,
    /// Transport epoch the clock is armed for.
    epoch: Option<u64>,
}

impl ClockThread {
    fn run(mut self) {
        log::info!("[CLOCK] timing thread started");
        loop {
            let Some(deadline) = self.sync() else {
                match self.signals.recv() {
                    Ok(Signal::Wake) => continue,
                    Ok(Signal::Shutdown) | Err(_) => break,
                }
            };

            let wake_at = deadline.checked_sub(self.spin_margin).unwrap_or(deadline);
            if Instant::now() < wake_at {
                match self.signals.recv_deadline(wake_at) {
                    Ok(Signal::Wake) => continue,
                    Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            } else {
                // Catching up: keep firing, but still honour shutdown.
                match self.signals.try_recv() {
                    Ok(Signal::Shutdown) | Err(TryRecvError::Disconnected) => break,
                    Ok(Signal::Wake) | Err(TryRecvError::Empty) => {}
                }
            }

            spin_until(deadline);
            self.tick();
        }
        log::info!("[CLOCK] timing thread stopped");
    }

    /// Bring the clock in line with the transport; returns the deadline of
    /// the next step, or `None` while not playing.
    fn sync(&mut self) -> Option<Instant> {
        let (playing, epoch, bpm, step) = {
            let state = self.shared.read();
            (
                state.transport.is_playing(),
                state.transport.epoch(),
                state.transport.bpm(),
                state.transport.step_index(),
            )
        };

        if self.epoch != Some(epoch) {
            self.epoch = Some(epoch);
            self.clock.retempo(bpm);
            if playing {
                self.clock.arm(Instant::now(), step);
                log::debug!("[CLOCK] armed at step {} ({:?} per step)", step, self.clock.interval());
            } else {
                self.clock.disarm();
                log::debug!("[CLOCK] disarmed at step {}", step);
            }
        } else if bpm != self.clock.bpm() {
            self.clock.retempo(bpm);
            log::info!("[CLOCK] tempo {} BPM ({:?} per step)", bpm, self.clock.interval());
        }

        if playing {
            self.clock.deadline(step)
        } else {
            None
        }
    }

    fn tick(&mut self) {
        let claimed = {
            let mut state = self.shared.write();
            if Some(state.transport.epoch()) != self.epoch {
                None
            } else {
                let bpm = state.transport.bpm();
                state
                    .transport
                    .claim_step()
                    .map(|step| (step, bpm, Arc::clone(&state.store)))
            }
        };
        let Some((step, bpm, store)) = claimed else {
            return;
        };

        let fired_at = Instant::now();
        let frame = Frame {
            step,
            tick_time: SystemTime::now(),
        };
        let lateness = self.clock.lateness(step, fired_at);
        let deviation = self.clock.mark_fired(step, fired_at);

        let batch = generate(step, &store);
        let generated = batch.len();
        let ctx = TickContext::new(bpm, step, store.active_scene_id().cloned(), self.clock.subdivision());
        drop(store);

        let outcome = self.pipeline.run(batch, ctx, &self.shared.metrics);
        log::trace!(
            "[CLOCK] step {} late by {:?}: {} generated, {} to dispatch, {} faults",
            step,
            lateness,
            generated,
            outcome.messages.len(),
            outcome.faults.len()
        );

        self.dispatch.submit(DispatchBatch {
            frame,
            messages: outcome.messages,
        });
        self.shared
            .metrics
            .record_tick(deviation, lateness, fired_at.elapsed());
    }
}
