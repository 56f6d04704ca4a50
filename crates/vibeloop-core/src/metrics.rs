//! Timing statistics for external inspection.
//!
//! [`Metrics`] is a cheap cloneable handle shared by the timing thread, the
//! dispatch worker and the control plane. Samples go into bounded
//! overwrite-oldest buffers; recording never blocks (a contended lock
//! drops the sample and bumps `dropped_samples`) and never performs I/O.

use crate::error::Stage;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

/// Default number of samples kept per buffer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Number of jitter values included in snapshots as "recent".
const RECENT_JITTER: usize = 16;

/// Fixed-capacity buffer that overwrites its oldest entry when full.
#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, returning the evicted oldest item if the buffer was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// How a hook invocation ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOutcome {
    Ok,
    Timeout,
    Failure,
}

/// One hook invocation's timing.
#[derive(Clone, Debug)]
pub struct HookSample {
    pub extension: Arc<str>,
    pub stage: Stage,
    pub duration: Duration,
    pub outcome: HookOutcome,
}

/// Percentile summary of a latency distribution, in microseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub max_us: f64,
}

impl LatencyStats {
    /// Nearest-rank percentiles over the given values.
    pub fn from_values(mut values: Vec<f64>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        values.sort_by(f64::total_cmp);
        Self {
            count: values.len(),
            p50_us: percentile(&values, 50.0),
            p95_us: percentile(&values, 95.0),
            p99_us: percentile(&values, 99.0),
            max_us: values[values.len() - 1],
        }
    }
}

/// Inter-step interval deviation summary, in microseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct JitterStats {
    pub count: usize,
    pub mean_us: f64,
    pub stddev_us: f64,
    pub max_abs_us: f64,
    /// Newest last.
    pub recent_us: Vec<f64>,
}

impl JitterStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let recent_start = values.len().saturating_sub(RECENT_JITTER);
        Self {
            count: values.len(),
            mean_us: mean,
            stddev_us: variance.sqrt(),
            max_abs_us: values.iter().fold(0.0, |max: f64, v| max.max(v.abs())),
            recent_us: values[recent_start..].to_vec(),
        }
    }
}

/// Monotonic counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub ticks: u64,
    pub hook_timeouts: u64,
    pub hook_failures: u64,
    pub messages_dispatched: u64,
    pub dispatch_failures: u64,
    pub dropped_batches: u64,
    pub dropped_samples: u64,
}

/// Read-only view handed to the presentation layer.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hook_latency: LatencyStats,
    pub hook_latency_by_extension: BTreeMap<String, LatencyStats>,
    pub jitter: JitterStats,
    pub lateness: LatencyStats,
    /// Time from firing a tick to handing its batch to dispatch.
    pub tick_duration: LatencyStats,
    pub counters: CounterSnapshot,
}

struct Buffers {
    hooks: RingBuffer<HookSample>,
    jitter_us: RingBuffer<f64>,
    lateness_us: RingBuffer<f64>,
    tick_us: RingBuffer<f64>,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    hook_timeouts: AtomicU64,
    hook_failures: AtomicU64,
    messages_dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_samples: AtomicU64,
}

/// Shared metrics recorder.
#[derive(Clone)]
pub struct Metrics {
    buffers: Arc<Mutex<Buffers>>,
    counters: Arc<Counters>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Metrics {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: Arc::new(Mutex::new(Buffers {
                hooks: RingBuffer::new(capacity),
                jitter_us: RingBuffer::new(capacity),
                lateness_us: RingBuffer::new(capacity),
                tick_us: RingBuffer::new(capacity),
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Record one hook invocation.
    pub fn record_hook(&self, sample: HookSample) {
        match sample.outcome {
            HookOutcome::Timeout => bump(&self.counters.hook_timeouts, 1),
            HookOutcome::Failure => bump(&self.counters.hook_failures, 1),
            HookOutcome::Ok => {}
        }
        self.with_buffers(|buffers| {
            buffers.hooks.push(sample);
        });
    }

    /// Record a fired tick: interval deviation (if any), lateness and how
    /// long the tick took.
    pub fn record_tick(&self, deviation_us: Option<f64>, lateness: Duration, elapsed: Duration) {
        bump(&self.counters.ticks, 1);
        self.with_buffers(|buffers| {
            if let Some(deviation) = deviation_us {
                buffers.jitter_us.push(deviation);
            }
            buffers.lateness_us.push(as_micros(lateness));
            buffers.tick_us.push(as_micros(elapsed));
        });
    }

    pub fn record_dispatched(&self, count: u64) {
        bump(&self.counters.messages_dispatched, count);
    }

    pub fn record_dispatch_failure(&self) {
        bump(&self.counters.dispatch_failures, 1);
    }

    pub fn record_dropped_batch(&self) {
        bump(&self.counters.dropped_batches, 1);
    }

    /// Forget buffered samples (counters are kept).
    pub fn clear_samples(&self) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.hooks.clear();
        buffers.jitter_us.clear();
        buffers.lateness_us.clear();
        buffers.tick_us.clear();
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        CounterSnapshot {
            ticks: c.ticks.load(Ordering::Relaxed),
            hook_timeouts: c.hook_timeouts.load(Ordering::Relaxed),
            hook_failures: c.hook_failures.load(Ordering::Relaxed),
            messages_dispatched: c.messages_dispatched.load(Ordering::Relaxed),
            dispatch_failures: c.dispatch_failures.load(Ordering::Relaxed),
            dropped_batches: c.dropped_batches.load(Ordering::Relaxed),
            dropped_samples: c.dropped_samples.load(Ordering::Relaxed),
        }
    }

    /// Compute percentiles and jitter over the buffered samples.
    ///
    /// Runs on the caller's thread; buffers are copied out under the lock
    /// and summarized after releasing it.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (hooks, jitter, lateness, ticks) = {
            let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            (
                buffers.hooks.iter().cloned().collect::<Vec<_>>(),
                buffers.jitter_us.iter().copied().collect::<Vec<_>>(),
                buffers.lateness_us.iter().copied().collect::<Vec<_>>(),
                buffers.tick_us.iter().copied().collect::<Vec<_>>(),
            )
        };

        let mut by_extension: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for sample in &hooks {
            by_extension
                .entry(sample.extension.to_string())
                .or_default()
                .push(as_micros(sample.duration));
        }

        MetricsSnapshot {
            hook_latency: LatencyStats::from_values(
                hooks.iter().map(|s| as_micros(s.duration)).collect(),
            ),
            hook_latency_by_extension: by_extension
                .into_iter()
                .map(|(name, values)| (name, LatencyStats::from_values(values)))
                .collect(),
            jitter: JitterStats::from_values(&jitter),
            lateness: LatencyStats::from_values(lateness),
            tick_duration: LatencyStats::from_values(ticks),
            counters: self.counters(),
        }
    }

    fn with_buffers(&self, f: impl FnOnce(&mut Buffers)) {
        match self.buffers.try_lock() {
            Ok(mut buffers) => f(&mut buffers),
            Err(TryLockError::Poisoned(poisoned)) => f(&mut poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => bump(&self.counters.dropped_samples, 1),
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("counters", &self.counters())
            .finish_non_exhaustive()
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

fn as_micros(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000_000.0
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
