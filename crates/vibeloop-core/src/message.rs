//! Outgoing message model.
//!
//! A [`Message`] is what the step event generator produces and what the
//! extension pipeline rewrites. It is mutable while inside the pipeline and
//! moved into the dispatcher afterwards.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier of a track.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(Arc<str>);

/// Unique identifier of a scene.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneId(Arc<str>);

macro_rules! impl_id {
    ($ty:ident) => {
        impl $ty {
            pub fn new(id: impl AsRef<str>) -> Self {
                Self(Arc::from(id.as_ref()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $ty {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $ty {
            fn from(value: String) -> Self {
                Self(Arc::from(value))
            }
        }

        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

impl_id!(TrackId);
impl_id!(SceneId);

/// A typed parameter value.
///
/// In configuration files integers become `Int` and must fit in 32 bits;
/// floats become `Float`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f32),
    Double(f64),
    Str(String),
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a boolean, a 32-bit integer, a float or a string")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        i32::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {} is out of range for a 32-bit parameter", v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        i32::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {} is out of range for a 32-bit parameter", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v as f32))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Bool(_) | Value::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

/// One entry of a message's ordered parameter list.
///
/// Named parameters go out on OSC as a `name, value` pair; unnamed ones
/// send only the value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Param {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: Value,
}

impl Param {
    pub fn named(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            value: value.into(),
        }
    }

    pub fn positional(value: impl Into<Value>) -> Self {
        Self {
            name: None,
            value: value.into(),
        }
    }
}

/// MIDI channel message kinds the dispatcher can emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MidiEvent {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    ControlChange { controller: u8, value: u8 },
}

/// Where a message goes.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// OSC address pattern on the configured host:port.
    Osc { address: String },
    /// MIDI channel (0-15) on the selected output device.
    Midi { channel: u8, event: MidiEvent },
}

impl Target {
    pub fn is_osc(&self) -> bool {
        matches!(self, Target::Osc { .. })
    }

    pub fn is_midi(&self) -> bool {
        matches!(self, Target::Midi { .. })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Osc { address } => write!(f, "osc:{}", address),
            Target::Midi { channel, .. } => write!(f, "midi:ch{}", channel),
        }
    }
}

/// When the receiver should act on a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampIntent {
    /// Act on receipt.
    #[default]
    Immediate,
    /// Act this long after the tick's wall-clock time.
    Ahead(Duration),
}

/// A single outgoing message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Message {
    pub target: Target,
    pub params: Vec<Param>,
    pub timing: TimestampIntent,
    /// Track that produced the message, stamped by the generator.
    pub origin: Option<TrackId>,
}

impl Message {
    /// Create an OSC message with no parameters.
    pub fn osc(address: impl Into<String>) -> Self {
        Self::new(Target::Osc {
            address: address.into(),
        })
    }

    /// Create a MIDI message on the given channel.
    pub fn midi(channel: u8, event: MidiEvent) -> Self {
        Self::new(Target::Midi {
            channel: channel & 0x0F,
            event,
        })
    }

    pub fn new(target: Target) -> Self {
        Self {
            target,
            params: Vec::new(),
            timing: TimestampIntent::Immediate,
            origin: None,
        }
    }

    /// Builder-style named parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push(Param::named(name, value));
        self
    }

    /// Builder-style unnamed parameter.
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.params.push(Param::positional(value));
        self
    }

    pub fn with_timing(mut self, timing: TimestampIntent) -> Self {
        self.timing = timing;
        self
    }

    /// Value of the first parameter with the given name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| &p.value)
    }

    /// Append a named parameter, even if one with the same name exists.
    pub fn push_param(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.params.push(Param::named(name, value));
    }

    /// Replace the first parameter with this name, or append it.
    pub fn set_param(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self
            .params
            .iter_mut()
            .find(|p| p.name.as_deref() == Some(name))
        {
            Some(param) => param.value = value,
            None => self.params.push(Param::named(name, value)),
        }
    }

    /// Rename every parameter called `from`. Returns whether any matched.
    pub fn rename_param(&mut self, from: &str, to: &str) -> bool {
        let mut renamed = false;
        for param in &mut self.params {
            if param.name.as_deref() == Some(from) {
                param.name = Some(to.to_string());
                renamed = true;
            }
        }
        renamed
    }

    /// Remove the first parameter with this name.
    pub fn remove_param(&mut self, name: &str) -> Option<Value> {
        let index = self
            .params
            .iter()
            .position(|p| p.name.as_deref() == Some(name))?;
        Some(self.params.remove(index).value)
    }

    /// Whether this message came from the given track.
    pub fn is_from(&self, track: &str) -> bool {
        self.origin.as_ref().map(TrackId::as_str) == Some(track)
    }
}
