//! vibeloop core - Clock, transport and extension pipeline for a live-coding loop.
//!
//! This crate provides the building blocks of the loop backend:
//!
//! - **Timing** - Drift-free step clock anchored on absolute deadlines
//! - **Transport** - Play/pause/stop/bpm state machine owning the step index
//! - **Store** - Tracks, patterns, mute/solo and scenes
//! - **Generator** - Pure step-to-messages event generation
//! - **Pipeline** - Ordered, fault-isolated extension hooks
//! - **Dispatch** - OSC (UDP) and MIDI output, off the timing thread
//! - **Metrics** - Hook latency percentiles, clock jitter, counters
//! - **Runtime** - The engine, its threads and the control plane
//!
//! # Architecture
//!
//! One timing thread fires ticks. Each tick claims the next step from the
//! [`Transport`] and takes a snapshot of the [`TrackStore`] under a single
//! lock, runs [`generate`] and then the [`Pipeline`], and hands the batch to
//! the dispatch worker. Control operations go through an [`EngineHandle`].
//!
//! # Feature Flags
//!
//! - `native` (default) - UDP OSC via rosc and MIDI output via midir

pub mod config;
pub mod dispatch;
pub mod error;
pub mod extensions;
pub mod generator;
pub mod message;
pub mod metrics;
pub mod pattern;
pub mod pipeline;
pub mod runtime;
pub mod store;
pub mod timing;
pub mod transport;

// Re-export main types
pub use config::{EngineConfig, ExtensionConfig, SceneConfig, TrackConfig};
pub use dispatch::{
    CaptureSink, CapturedBatch, DispatchBatch, DispatchReport, DispatchWorker, Dispatcher, Frame,
    NullSink, Sink,
};
pub use error::{DispatchError, EngineError, EntityKind, HookError, Result, Stage};
pub use extensions::{Cps, DropEmpty, ExtensionFactory, ExtensionRegistry, Nudge, Orbit, Rename};
pub use generator::generate;
pub use message::{Message, MidiEvent, Param, SceneId, Target, TimestampIntent, TrackId, Value};
pub use metrics::{
    CounterSnapshot, HookOutcome, HookSample, JitterStats, LatencyStats, Metrics, MetricsSnapshot,
    RingBuffer,
};
pub use pattern::Pattern;
pub use pipeline::{
    panic_message, Capabilities, Endpoint, Extension, Pipeline, PipelineBuilder, PipelineOutcome,
    Registration, TickContext,
};
pub use runtime::{Engine, EngineHandle, EngineOptions, EngineSnapshot, EngineState};
pub use store::{Scene, Track, TrackStatus, TrackStore};
pub use timing::{step_interval, StepClock};
pub use transport::{StopPolicy, Transport, TransportState};

// Native-only re-exports
#[cfg(feature = "native")]
pub use dispatch::{midi::MidiSink, osc::OscSink};
