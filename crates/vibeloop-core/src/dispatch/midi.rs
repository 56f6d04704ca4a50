//! MIDI output through midir.
//!
//! Sends are synchronous and run on the dispatch worker. A device error
//! fails the message it was sending.

use super::{Frame, Sink};
use crate::error::DispatchError;
use crate::message::{Message, MidiEvent, Target};
use midir::{MidiOutput, MidiOutputConnection};

const CLIENT_NAME: &str = "vibeloop";

/// Raw bytes of a channel message.
pub fn encode(channel: u8, event: MidiEvent) -> [u8; 3] {
    let channel = channel & 0x0F;
    match event {
        MidiEvent::NoteOn { note, velocity } => [0x90 | channel, note & 0x7F, velocity & 0x7F],
        MidiEvent::NoteOff { note } => [0x80 | channel, note & 0x7F, 0],
        MidiEvent::ControlChange { controller, value } => {
            [0xB0 | channel, controller & 0x7F, value & 0x7F]
        }
    }
}

/// Names of the available output ports.
pub fn list_output_ports() -> Result<Vec<String>, DispatchError> {
    let output = MidiOutput::new(CLIENT_NAME).map_err(|e| DispatchError::Midi(e.to_string()))?;
    Ok(output
        .ports()
        .iter()
        .enumerate()
        .map(|(index, port)| {
            output
                .port_name(port)
                .unwrap_or_else(|_| format!("Unknown Device {}", index))
        })
        .collect())
}

/// Byte-level MIDI output.
pub(crate) trait MidiOut: Send {
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), DispatchError>;
}

impl MidiOut for MidiOutputConnection {
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), DispatchError> {
        self.send(bytes).map_err(|e| DispatchError::Midi(e.to_string()))
    }
}

/// Sink for MIDI-targeted messages.
pub struct MidiSink {
    output: Box<dyn MidiOut>,
    name: String,
}

impl MidiSink {
    /// Open the first output port whose name contains `port` (case-insensitive).
    pub fn open(port: &str) -> Result<Self, DispatchError> {
        let (connection, name) = connect(&port.to_lowercase())?;
        log::info!("[MIDI] connected to output '{}'", name);
        Ok(Self::with_output(&name, Box::new(connection)))
    }

    pub(crate) fn with_output(name: &str, output: Box<dyn MidiOut>) -> Self {
        Self {
            output,
            name: format!("midi:{}", name),
        }
    }
}

fn connect(wanted: &str) -> Result<(MidiOutputConnection, String), DispatchError> {
    let output = MidiOutput::new(CLIENT_NAME).map_err(|e| DispatchError::Midi(e.to_string()))?;
    let port = output
        .ports()
        .into_iter()
        .find(|p| {
            output
                .port_name(p)
                .map(|n| n.to_lowercase().contains(wanted))
                .unwrap_or(false)
        })
        .ok_or_else(|| DispatchError::Midi(format!("no MIDI output port matching '{}'", wanted)))?;
    let name = output
        .port_name(&port)
        .map_err(|e| DispatchError::Midi(e.to_string()))?;
    let connection = output
        .connect(&port, "vibeloop-out")
        .map_err(|e| DispatchError::Midi(e.to_string()))?;
    Ok((connection, name))
}

impl Sink for MidiSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, target: &Target) -> bool {
        target.is_midi()
    }

    fn send(&mut self, _frame: &Frame, message: &Message) -> Result<(), DispatchError> {
        let Target::Midi { channel, event } = message.target else {
            return Err(DispatchError::Encode(format!("{} is not a MIDI target", message.target)));
        };
        self.output.send_bytes(&encode(channel, event))
    }
}
