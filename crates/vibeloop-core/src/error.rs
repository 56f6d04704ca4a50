//! Error types for vibeloop-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Track,
    Scene,
    Extension,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Track => write!(f, "track"),
            EntityKind::Scene => write!(f, "scene"),
            EntityKind::Extension => write!(f, "extension"),
        }
    }
}

/// Errors surfaced synchronously to the control plane.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A parameter was out of range (e.g. non-positive BPM).
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// An unknown track or scene id was referenced.
    #[error("Unknown {kind} '{id}'")]
    NotFound { kind: EntityKind, id: String },

    /// The timing resource could not be acquired; the engine cannot run.
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl EngineError {
    pub(crate) fn track_not_found(id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind: EntityKind::Track,
            id: id.into(),
        }
    }

    pub(crate) fn scene_not_found(id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind: EntityKind::Scene,
            id: id.into(),
        }
    }
}

/// Pipeline stage a hook ran in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transform,
    BeforeSend,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Transform => write!(f, "transform"),
            Stage::BeforeSend => write!(f, "before_send"),
        }
    }
}

/// Errors produced by extension hooks.
///
/// These never leave the pipeline: the offending hook's contribution is
/// discarded for the tick and the error is recorded in metrics.
#[derive(Debug, Clone, Error)]
pub enum HookError {
    /// The hook ran past its per-tick budget.
    #[error("{extension}.{stage} overran its budget: {elapsed:?} > {budget:?}")]
    Timeout {
        extension: String,
        stage: Stage,
        elapsed: Duration,
        budget: Duration,
    },

    /// The hook reported a fault or panicked.
    #[error("{extension}.{stage} failed: {reason}")]
    Failure {
        extension: String,
        stage: Stage,
        reason: String,
    },
}

impl HookError {
    /// Convenience constructor for extensions reporting their own faults.
    pub fn failure(extension: &str, stage: Stage, reason: impl Into<String>) -> Self {
        HookError::Failure {
            extension: extension.to_string(),
            stage,
            reason: reason.into(),
        }
    }
}

/// Errors from sending a single message to a transport.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The message could not be serialized for the wire.
    #[error("Encoding error: {0}")]
    Encode(String),

    /// Socket or device IO failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// MIDI backend error
    #[error("MIDI error: {0}")]
    Midi(String),

    /// No configured sink accepts the message's target.
    #[error("No sink accepts target {0}")]
    NoRoute(String),
}
