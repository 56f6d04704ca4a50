//! Message dispatch.
//!
//! The [`Dispatcher`] fans each tick's finalized batch out to its sinks.
//! Delivery is best-effort: a message that fails is counted and logged and
//! the rest of the batch still goes out. Nothing is reported back to the
//! clock. The [`DispatchWorker`] runs a dispatcher on its own thread so
//! socket and device writes never block the timing thread.

#[cfg(feature = "native")]
pub mod midi;
#[cfg(feature = "native")]
pub mod osc;

use crate::error::{DispatchError, EngineError, Result};
use crate::message::{Message, Target};
use crate::metrics::Metrics;
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

/// A dispatch failure is logged on its first occurrence and then every this
/// many occurrences per sink.
const FAILURE_LOG_EVERY: u64 = 100;

/// Default bound of the timing-to-dispatch queue, in batches.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Tick a batch belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frame {
    pub step: u64,
    /// Wall-clock time the tick fired; `Ahead` timestamps are relative to it.
    pub tick_time: SystemTime,
}

impl Frame {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            tick_time: SystemTime::now(),
        }
    }
}

/// One tick's finalized messages.
#[derive(Clone, Debug)]
pub struct DispatchBatch {
    pub frame: Frame,
    pub messages: Vec<Message>,
}

/// A transport endpoint messages can be written to.
pub trait Sink: Send {
    fn name(&self) -> &str;

    /// Whether this sink handles messages for `target`.
    fn accepts(&self, target: &Target) -> bool;

    fn send(&mut self, frame: &Frame, message: &Message) -> std::result::Result<(), DispatchError>;

    /// Called once per batch after all its messages were sent.
    fn flush(&mut self, _frame: &Frame) -> std::result::Result<(), DispatchError> {
        Ok(())
    }
}

/// Per-batch delivery summary.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

struct SinkSlot {
    sink: Box<dyn Sink>,
    failures: u64,
}

/// Routes messages to every sink that accepts their target.
pub struct Dispatcher {
    sinks: Vec<SinkSlot>,
    metrics: Metrics,
    unrouted: u64,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Box<dyn Sink>>, metrics: Metrics) -> Self {
        let sinks = sinks
            .into_iter()
            .map(|sink| SinkSlot { sink, failures: 0 })
            .collect();
        Self {
            sinks,
            metrics,
            unrouted: 0,
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn Sink>) {
        self.sinks.push(SinkSlot { sink, failures: 0 });
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.sink.name().to_string()).collect()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Send a batch. A message counts as delivered when at least one sink
    /// took it.
    pub fn dispatch(&mut self, batch: DispatchBatch) -> DispatchReport {
        let frame = batch.frame;
        let mut report = DispatchReport::default();

        for message in &batch.messages {
            let mut routed = false;
            let mut delivered = false;
            for slot in self.sinks.iter_mut() {
                if !slot.sink.accepts(&message.target) {
                    continue;
                }
                routed = true;
                match slot.sink.send(&frame, message) {
                    Ok(()) => delivered = true,
                    Err(err) => slot.record_failure(&frame, &err, &self.metrics),
                }
            }

            if !routed {
                self.unrouted += 1;
                self.metrics.record_dispatch_failure();
                if self.unrouted == 1 || self.unrouted % FAILURE_LOG_EVERY == 0 {
                    let err = DispatchError::NoRoute(message.target.to_string());
                    log::warn!("[DISPATCH] step {}: {} ({} so far)", frame.step, err, self.unrouted);
                }
                report.failed += 1;
            } else if delivered {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        for slot in self.sinks.iter_mut() {
            if let Err(err) = slot.sink.flush(&frame) {
                slot.record_failure(&frame, &err, &self.metrics);
            }
        }

        self.metrics.record_dispatched(report.delivered as u64);
        log::trace!(
            "[DISPATCH] step {}: {} delivered, {} failed",
            frame.step,
            report.delivered,
            report.failed
        );
        report
    }
}

impl SinkSlot {
    fn record_failure(&mut self, frame: &Frame, err: &DispatchError, metrics: &Metrics) {
        self.failures += 1;
        metrics.record_dispatch_failure();
        if self.failures == 1 || self.failures % FAILURE_LOG_EVERY == 0 {
            log::warn!(
                "[DISPATCH] step {}: sink '{}' failed: {} ({} failures so far)",
                frame.step,
                self.sink.name(),
                err,
                self.failures
            );
        }
    }
}

/// A [`Dispatcher`] running on its own thread behind a bounded queue.
pub struct DispatchWorker {
    tx: Option<Sender<DispatchBatch>>,
    thread: Option<JoinHandle<()>>,
    metrics: Metrics,
}

impl DispatchWorker {
    /// Spawn the dispatch thread.
    pub fn spawn(mut dispatcher: Dispatcher, capacity: usize) -> Result<Self> {
        let (tx, rx) = bounded::<DispatchBatch>(capacity.max(1));
        let metrics = dispatcher.metrics().clone();
        let sinks = dispatcher.sink_names();

        let thread = thread::Builder::new()
            .name("vibeloop-dispatch".to_string())
            .spawn(move || {
                log::info!("[DISPATCH] worker started with sinks {:?}", sinks);
                for batch in rx.iter() {
                    dispatcher.dispatch(batch);
                }
                log::info!("[DISPATCH] worker stopped");
            })
            .map_err(|e| EngineError::EngineUnavailable(format!("failed to spawn dispatch thread: {}", e)))?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            metrics,
        })
    }

    /// Queue a batch without blocking. A full queue drops the batch.
    pub fn submit(&self, batch: DispatchBatch) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(batch) {
            Ok(()) => true,
            Err(TrySendError::Full(batch)) => {
                let dropped = self.metrics.counters().dropped_batches + 1;
                if dropped == 1 || dropped % FAILURE_LOG_EVERY == 0 {
                    log::warn!(
                        "[DISPATCH] queue full, dropped batch for step {} ({} so far)",
                        batch.frame.step,
                        dropped
                    );
                }
                self.metrics.record_dropped_batch();
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.metrics.record_dropped_batch();
                false
            }
        }
    }

    /// Drain the queue and join the thread.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[DISPATCH] worker thread panicked");
            }
        }
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One batch as seen by a [`CaptureSink`].
#[derive(Clone, Debug)]
pub struct CapturedBatch {
    pub step: u64,
    pub tick_time: SystemTime,
    pub messages: Vec<Message>,
}

#[derive(Default)]
struct CaptureBuffer {
    pending: Vec<Message>,
    batches: Vec<CapturedBatch>,
}

/// In-memory sink for dry runs and tests.
///
/// Clones share the same buffer, so one clone can be handed to the
/// dispatcher while another reads what was captured.
#[derive(Clone, Default)]
pub struct CaptureSink {
    buffer: Arc<Mutex<CaptureBuffer>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every flushed batch, in dispatch order.
    pub fn batches(&self) -> Vec<CapturedBatch> {
        self.lock().batches.clone()
    }

    /// Steps of the captured batches, in dispatch order.
    pub fn steps(&self) -> Vec<u64> {
        self.lock().batches.iter().map(|b| b.step).collect()
    }

    /// All captured messages with their step.
    pub fn messages(&self) -> Vec<(u64, Message)> {
        self.lock()
            .batches
            .iter()
            .flat_map(|b| b.messages.iter().map(move |m| (b.step, m.clone())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut buffer = self.lock();
        buffer.pending.clear();
        buffer.batches.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CaptureBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Sink for CaptureSink {
    fn name(&self) -> &str {
        "capture"
    }

    fn accepts(&self, _target: &Target) -> bool {
        true
    }

    fn send(&mut self, _frame: &Frame, message: &Message) -> std::result::Result<(), DispatchError> {
        self.lock().pending.push(message.clone());
        Ok(())
    }

    fn flush(&mut self, frame: &Frame) -> std::result::Result<(), DispatchError> {
        let mut buffer = self.lock();
        let messages = std::mem::take(&mut buffer.pending);
        buffer.batches.push(CapturedBatch {
            step: frame.step,
            tick_time: frame.tick_time,
            messages,
        });
        Ok(())
    }
}

/// Accepts everything and sends nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn accepts(&self, _target: &Target) -> bool {
        true
    }

    fn send(&mut self, _frame: &Frame, _message: &Message) -> std::result::Result<(), DispatchError> {
        Ok(())
    }
}
