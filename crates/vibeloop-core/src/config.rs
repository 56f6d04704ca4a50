//! Configuration file support for vibeloop
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/vibeloop/config.toml`
//! - macOS: `~/Library/Application Support/vibeloop/config.toml`
//! - Windows: `%APPDATA%\vibeloop\config.toml`
//!
//! Durations are written the humantime way: `"100us"`, `"2ms"`, `"1s"`.

use crate::dispatch::{Sink, DEFAULT_QUEUE_CAPACITY};
use crate::error::{EngineError, Result};
use crate::extensions::ExtensionRegistry;
use crate::message::{Message, MidiEvent, Param, SceneId, TrackId};
use crate::metrics::DEFAULT_CAPACITY;
use crate::pattern::Pattern;
use crate::pipeline::{Pipeline, DEFAULT_HOOK_BUDGET};
use crate::runtime::EngineOptions;
use crate::store::{Scene, Track, TrackStore};
use crate::timing::{DEFAULT_BPM, DEFAULT_SUBDIVISION};
use crate::transport::StopPolicy;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Serde adapter for humantime duration strings.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transport: TransportSettings,
    pub clock: ClockSettings,
    pub pipeline: PipelineSettings,
    pub dispatch: DispatchSettings,
    pub metrics: MetricsSettings,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<TrackConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scenes: Vec<SceneConfig>,
}

/// Transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub bpm: f64,
    /// Steps per beat
    pub subdivision: u32,
    pub stop_policy: StopPolicy,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            subdivision: DEFAULT_SUBDIVISION,
            stop_policy: StopPolicy::default(),
        }
    }
}

/// Clock settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    /// How long before a deadline the clock stops sleeping and spins
    #[serde(with = "duration")]
    pub spin_margin: Duration,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            spin_margin: Duration::from_millis(1),
        }
    }
}

/// Extension pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Per-hook time budget
    #[serde(with = "duration")]
    pub hook_budget: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            hook_budget: DEFAULT_HOOK_BUDGET,
        }
    }
}

/// Dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Socket write timeout
    #[serde(with = "duration")]
    pub send_timeout: Duration,
    /// Batches buffered between the clock and the dispatch thread
    pub queue_capacity: usize,
    pub osc: OscSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi: Option<MidiSettings>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(2),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            osc: OscSettings::default(),
            midi: None,
        }
    }
}

/// OSC target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for OscSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 57120,
        }
    }
}

/// MIDI output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiSettings {
    /// Case-insensitive substring of the output port name
    pub port: String,
}

/// Metrics settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Samples kept per ring buffer
    pub capacity: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// One `[[extensions]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "toml::Table::is_empty")]
    pub options: toml::Table,
}

impl ExtensionConfig {
    pub fn new(name: &str, priority: i32) -> Self {
        Self {
            name: name.to_string(),
            priority,
            options: toml::Table::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

/// MIDI note played on each hit of a track
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MidiNoteConfig {
    pub channel: u8,
    pub note: u8,
    #[serde(default = "default_velocity")]
    pub velocity: u8,
}

fn default_velocity() -> u8 {
    100
}

/// One `[[tracks]]` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub id: String,
    /// Step string, e.g. `"x...x..."`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<String>,
    /// `[hits, steps]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub euclid: Option<[usize; 2]>,
    /// OSC address of the emitted message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub osc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi: Option<MidiNoteConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    pub muted: bool,
    pub soloed: bool,
}

impl TrackConfig {
    /// Message emitted on every hit.
    pub fn template(&self) -> Result<Message> {
        let mut message = match (&self.osc, &self.midi) {
            (Some(address), None) => Message::osc(address.clone()),
            (None, Some(midi)) => {
                if midi.channel > 15 || midi.note > 127 || midi.velocity > 127 {
                    return Err(EngineError::Config(format!(
                        "track '{}': MIDI channel must be 0-15, note and velocity 0-127",
                        self.id
                    )));
                }
                Message::midi(
                    midi.channel,
                    MidiEvent::NoteOn {
                        note: midi.note,
                        velocity: midi.velocity,
                    },
                )
            }
            _ => {
                return Err(EngineError::Config(format!(
                    "track '{}': set exactly one of `osc` or `midi`",
                    self.id
                )))
            }
        };
        message.params = self.params.clone();
        Ok(message)
    }

    pub fn pattern(&self) -> Result<Pattern> {
        let template = self.template()?;
        match (self.steps.as_deref(), self.euclid) {
            (Some(steps), None) => Pattern::from_steps(steps, template)
                .map_err(|e| EngineError::Config(format!("track '{}': {}", self.id, e))),
            (None, Some([hits, steps])) => Pattern::euclid(hits, steps, template)
                .map_err(|e| EngineError::Config(format!("track '{}': {}", self.id, e))),
            _ => Err(EngineError::Config(format!(
                "track '{}': set exactly one of `steps` or `euclid`",
                self.id
            ))),
        }
    }

    pub fn to_track(&self) -> Result<Track> {
        Ok(Track::new(self.id.as_str(), self.pattern()?)
            .muted(self.muted)
            .soloed(self.soloed))
    }
}

/// One `[[scenes]]` entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub id: String,
    pub tracks: Vec<String>,
    /// Track id to step string played instead while the scene is active
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, String>,
}

impl EngineConfig {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(EngineError::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "vibeloop") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(EngineError::Config("Could not determine config directory".to_string()))
        }
    }

    /// Write the commented template to `path`.
    pub fn write_template(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            return Err(EngineError::Config(format!(
                "{:?} already exists (use --force to overwrite)",
                path
            )));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, Self::template())?;
        Ok(())
    }

    /// Check everything that can be checked without opening devices.
    pub fn validate(&self) -> Result<()> {
        let t = &self.transport;
        if !t.bpm.is_finite() || t.bpm <= 0.0 {
            return Err(EngineError::Config(format!(
                "transport.bpm must be a positive number, got {}",
                t.bpm
            )));
        }
        if t.subdivision == 0 {
            return Err(EngineError::Config("transport.subdivision must be at least 1".to_string()));
        }
        if self.pipeline.hook_budget.is_zero() {
            return Err(EngineError::Config("pipeline.hook_budget must not be zero".to_string()));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(EngineError::Config("dispatch.queue_capacity must be at least 1".to_string()));
        }
        if self.metrics.capacity == 0 {
            return Err(EngineError::Config("metrics.capacity must be at least 1".to_string()));
        }

        let registry = ExtensionRegistry::with_builtins();
        for entry in &self.extensions {
            registry.create(&entry.name, &entry.options)?;
        }

        check_unique("track", self.tracks.iter().map(|t| t.id.as_str()))?;
        check_unique("scene", self.scenes.iter().map(|s| s.id.as_str()))?;
        self.build_store()?;
        Ok(())
    }

    /// Tracks and scenes as a store, with every scene inactive.
    pub fn build_store(&self) -> Result<TrackStore> {
        let mut store = TrackStore::new();
        for track in &self.tracks {
            store.insert_track(track.to_track()?);
        }

        for scene in &self.scenes {
            let mut members = Vec::with_capacity(scene.tracks.len());
            for id in &scene.tracks {
                if store.track(id).is_none() {
                    return Err(EngineError::Config(format!(
                        "scene '{}' references unknown track '{}'",
                        scene.id, id
                    )));
                }
                members.push(TrackId::new(id));
            }

            let mut built = Scene::new(SceneId::new(&scene.id), members);
            for (track_id, steps) in &scene.overrides {
                let track = self.tracks.iter().find(|t| &t.id == track_id).ok_or_else(|| {
                    EngineError::Config(format!(
                        "scene '{}' overrides unknown track '{}'",
                        scene.id, track_id
                    ))
                })?;
                let pattern = Pattern::from_steps(steps, track.template()?)
                    .map_err(|e| EngineError::Config(format!("scene '{}': {}", scene.id, e)))?;
                built = built.with_override(track_id.as_str(), pattern);
            }
            store.insert_scene(built);
        }
        Ok(store)
    }

    /// Pipeline from the `[[extensions]]` entries.
    pub fn build_pipeline(&self, registry: &ExtensionRegistry) -> Result<Pipeline> {
        registry.build_pipeline(&self.extensions, self.pipeline.hook_budget)
    }

    /// OSC and MIDI sinks as configured.
    #[cfg(feature = "native")]
    pub fn build_sinks(&self) -> Result<Vec<Box<dyn Sink>>> {
        use crate::dispatch::{midi::MidiSink, osc::OscSink};

        let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
        let osc = &self.dispatch.osc;
        if osc.enabled {
            let sink = OscSink::connect(&osc.host, osc.port, self.dispatch.send_timeout)
                .map_err(|e| EngineError::Config(format!("OSC target {}:{}: {}", osc.host, osc.port, e)))?;
            sinks.push(Box::new(sink));
        }
        if let Some(midi) = &self.dispatch.midi {
            let sink = MidiSink::open(&midi.port)
                .map_err(|e| EngineError::Config(format!("MIDI port '{}': {}", midi.port, e)))?;
            sinks.push(Box::new(sink));
        }
        Ok(sinks)
    }

    /// Without native transports there is nothing to send to.
    #[cfg(not(feature = "native"))]
    pub fn build_sinks(&self) -> Result<Vec<Box<dyn Sink>>> {
        Ok(Vec::new())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            bpm: self.transport.bpm,
            subdivision: self.transport.subdivision,
            stop_policy: self.transport.stop_policy,
            spin_margin: self.clock.spin_margin,
            queue_capacity: self.dispatch.queue_capacity,
            metrics_capacity: self.metrics.capacity,
        }
    }

    /// Default configuration file with comments.
    pub fn template() -> &'static str {
        r#"# vibeloop configuration file

[transport]
# Tempo in beats per minute
bpm = 120.0

# Steps per beat (4 = 16th notes)
subdivision = 4

# What stop does with the step position: "reset" or "preserve"
stop_policy = "reset"

[clock]
# Stop sleeping this long before each step and spin for precision
spin_margin = "1ms"

[pipeline]
# Time budget of a single extension hook; overruns are discarded
hook_budget = "100us"

[dispatch]
send_timeout = "2ms"
queue_capacity = 64

[dispatch.osc]
# SuperDirt listens on 57120 by default
enabled = true
host = "127.0.0.1"
port = 57120

# [dispatch.midi]
# Case-insensitive substring of the MIDI output port
# port = "Midi Through"

[metrics]
# Samples kept for percentiles and jitter
capacity = 1024

# Extensions run in priority order (lower first), then in file order.
[[extensions]]
name = "drop_empty"
priority = 0

[[extensions]]
name = "cps"
priority = 10
options = { beats_per_cycle = 4.0 }

# [[extensions]]
# name = "nudge"
# options = { latency = "50ms" }

[[tracks]]
id = "kick"
steps = "x... x... x... x..."
osc = "/dirt/play"
params = [{ name = "s", value = "bd" }]

[[tracks]]
id = "hat"
euclid = [5, 8]
osc = "/dirt/play"
params = [{ name = "s", value = "hh" }, { name = "gain", value = 0.8 }]

# [[tracks]]
# id = "bass"
# steps = "x..x ..x. x... ..x."
# midi = { channel = 0, note = 36, velocity = 110 }

[[scenes]]
id = "intro"
tracks = ["hat"]
"#
    }
}

fn check_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(EngineError::Config(format!("{} id must not be empty", kind)));
        }
        if !seen.insert(id) {
            return Err(EngineError::Config(format!("duplicate {} id '{}'", kind, id)));
        }
    }
    Ok(())
}
