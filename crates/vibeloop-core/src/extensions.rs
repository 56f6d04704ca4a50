//! Built-in extensions and the extension registry.
//!
//! Destination-specific behaviour (SuperDirt's `cps` and `orbit`
//! parameters, latency compensation) lives here, outside the core loop.
//! Every extension is created from its `[[extensions]]` config entry by a
//! factory registered under its name.

use crate::config::{duration, ExtensionConfig};
use crate::error::{EngineError, HookError, Result};
use crate::message::{Message, TimestampIntent};
use crate::pipeline::{Capabilities, Extension, Pipeline, PipelineBuilder, TickContext};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Creates an extension from its free-form options table.
pub type ExtensionFactory = Box<dyn Fn(&toml::Table) -> Result<Box<dyn Extension>> + Send + Sync>;

/// Name to factory map used to build the pipeline from configuration.
pub struct ExtensionRegistry {
    factories: BTreeMap<String, ExtensionFactory>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ExtensionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry knowing every built-in extension.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("drop_empty", |_| Ok(Box::new(DropEmpty)));
        registry.register("cps", |options| Ok(Box::new(Cps::from_options(options)?)));
        registry.register("rename", |options| Ok(Box::new(Rename::from_options(options)?)));
        registry.register("orbit", |options| Ok(Box::new(Orbit::from_options(options)?)));
        registry.register("nudge", |options| Ok(Box::new(Nudge::from_options(options)?)));
        registry
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&toml::Table) -> Result<Box<dyn Extension>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate one extension.
    pub fn create(&self, name: &str, options: &toml::Table) -> Result<Box<dyn Extension>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            EngineError::Config(format!(
                "unknown extension '{}' (available: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        factory(options)
    }

    /// Build a pipeline from configured entries.
    pub fn build_pipeline(&self, entries: &[ExtensionConfig], hook_budget: Duration) -> Result<Pipeline> {
        let mut builder = PipelineBuilder::new();
        builder.hook_budget(hook_budget);
        for entry in entries {
            let extension = self.create(&entry.name, &entry.options)?;
            builder.register_boxed(extension, entry.priority);
        }
        Ok(builder.build())
    }
}

fn parse_options<T: DeserializeOwned>(name: &str, options: &toml::Table) -> Result<T> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|e| EngineError::Config(format!("invalid options for extension '{}': {}", name, e)))
}

/// Drops messages with no parameters.
#[derive(Debug, Default)]
pub struct DropEmpty;

impl Extension for DropEmpty {
    fn name(&self) -> &str {
        "drop_empty"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSFORM
    }

    fn transform(&mut self, batch: &mut Vec<Message>, _ctx: &TickContext) -> std::result::Result<(), HookError> {
        batch.retain(|msg| !msg.params.is_empty());
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CpsOptions {
    #[serde(default = "default_beats_per_cycle")]
    beats_per_cycle: f64,
}

fn default_beats_per_cycle() -> f64 {
    4.0
}

/// Stamps SuperDirt's cycles-per-second onto every message.
#[derive(Debug)]
pub struct Cps {
    beats_per_cycle: f64,
}

impl Cps {
    pub fn new(beats_per_cycle: f64) -> Result<Self> {
        if !beats_per_cycle.is_finite() || beats_per_cycle <= 0.0 {
            return Err(EngineError::Config(format!(
                "cps: beats_per_cycle must be positive, got {}",
                beats_per_cycle
            )));
        }
        Ok(Self { beats_per_cycle })
    }

    fn from_options(options: &toml::Table) -> Result<Self> {
        let options: CpsOptions = parse_options("cps", options)?;
        Self::new(options.beats_per_cycle)
    }
}

impl Extension for Cps {
    fn name(&self) -> &str {
        "cps"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::BEFORE_SEND
    }

    fn before_send(&mut self, batch: &mut Vec<Message>, bpm: f64, _step: u64) -> std::result::Result<(), HookError> {
        let cps = (bpm / 60.0 / self.beats_per_cycle) as f32;
        for msg in batch.iter_mut() {
            msg.set_param("cps", cps);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RenameOptions {
    #[serde(default)]
    params: BTreeMap<String, String>,
}

/// Renames parameters right before sending.
#[derive(Debug)]
pub struct Rename {
    params: BTreeMap<String, String>,
}

impl Rename {
    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self { params }
    }

    fn from_options(options: &toml::Table) -> Result<Self> {
        let options: RenameOptions = parse_options("rename", options)?;
        Ok(Self::new(options.params))
    }
}

impl Extension for Rename {
    fn name(&self) -> &str {
        "rename"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::BEFORE_SEND
    }

    fn before_send(&mut self, batch: &mut Vec<Message>, _bpm: f64, _step: u64) -> std::result::Result<(), HookError> {
        // Each name maps from its original, so renames never chain.
        for param in batch.iter_mut().flat_map(|msg| msg.params.iter_mut()) {
            if let Some(to) = param.name.as_deref().and_then(|name| self.params.get(name)) {
                param.name = Some(to.clone());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrbitOptions {
    #[serde(default)]
    tracks: BTreeMap<String, i32>,
    default: Option<i32>,
}

/// Routes OSC messages to SuperDirt orbits per source track.
#[derive(Debug)]
pub struct Orbit {
    tracks: BTreeMap<String, i32>,
    default: Option<i32>,
}

impl Orbit {
    pub fn new(tracks: BTreeMap<String, i32>, default: Option<i32>) -> Self {
        Self { tracks, default }
    }

    fn from_options(options: &toml::Table) -> Result<Self> {
        let options: OrbitOptions = parse_options("orbit", options)?;
        Ok(Self::new(options.tracks, options.default))
    }
}

impl Extension for Orbit {
    fn name(&self) -> &str {
        "orbit"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSFORM
    }

    fn transform(&mut self, batch: &mut Vec<Message>, _ctx: &TickContext) -> std::result::Result<(), HookError> {
        for msg in batch.iter_mut().filter(|m| m.target.is_osc()) {
            let orbit = msg
                .origin
                .as_ref()
                .and_then(|track| self.tracks.get(track.as_str()).copied())
                .or(self.default);
            if let Some(orbit) = orbit {
                msg.set_param("orbit", orbit);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NudgeOptions {
    #[serde(with = "duration")]
    latency: Duration,
}

/// Schedules every message a fixed latency ahead of the tick.
#[derive(Debug)]
pub struct Nudge {
    latency: Duration,
}

impl Nudge {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    fn from_options(options: &toml::Table) -> Result<Self> {
        let options: NudgeOptions = parse_options("nudge", options)?;
        Ok(Self::new(options.latency))
    }
}

impl Extension for Nudge {
    fn name(&self) -> &str {
        "nudge"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::TRANSFORM
    }

    fn transform(&mut self, batch: &mut Vec<Message>, _ctx: &TickContext) -> std::result::Result<(), HookError> {
        let timing = if self.latency.is_zero() {
            TimestampIntent::Immediate
        } else {
            TimestampIntent::Ahead(self.latency)
        };
        for msg in batch.iter_mut() {
            msg.timing = timing;
        }
        Ok(())
    }
}
