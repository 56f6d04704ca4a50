//! vibeloop runtime - runs the loop.
//!
//! The runtime manages:
//! - The timing thread (clock, generator, extension pipeline)
//! - The dispatch worker thread
//! - The shared transport/store state mutated by the control plane

pub mod thread;

pub use thread::{Engine, EngineHandle, EngineOptions, EngineSnapshot, EngineState};
