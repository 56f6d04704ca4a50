//! OSC over UDP.
//!
//! Named parameters are flattened into `name, value` argument pairs the way
//! SuperDirt expects; unnamed parameters send only their value. Messages
//! with an `Ahead` timestamp are wrapped in a bundle carrying an NTP
//! timetag, everything else goes out as a plain message.

use super::{Frame, Sink};
use crate::error::DispatchError;
use crate::message::{Message, Param, Target, TimestampIntent, Value};
use rosc::{encoder, OscBundle, OscMessage, OscPacket, OscTime, OscType};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// SuperDirt's default listening port.
pub const DEFAULT_PORT: u16 = 57120;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// UDP sink for every OSC-targeted message.
pub struct OscSink {
    socket: UdpSocket,
    addr: SocketAddr,
    name: String,
}

impl OscSink {
    /// Resolve `host:port` and bind an ephemeral local socket to it.
    pub fn connect(host: &str, port: u16, send_timeout: Duration) -> Result<Self, DispatchError> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| DispatchError::Encode(format!("could not resolve {}:{}", host, port)))?;
        let bind = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind)?;
        if !send_timeout.is_zero() {
            socket.set_write_timeout(Some(send_timeout))?;
        }
        socket.connect(addr)?;
        log::info!("[OSC] sending to {}", addr);
        Ok(Self {
            socket,
            addr,
            name: format!("osc:{}", addr),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Sink for OscSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts(&self, target: &Target) -> bool {
        target.is_osc()
    }

    fn send(&mut self, frame: &Frame, message: &Message) -> Result<(), DispatchError> {
        let buf = encode(frame, message)?;
        self.socket.send(&buf)?;
        Ok(())
    }
}

/// Encode one message as an OSC packet.
pub fn encode(frame: &Frame, message: &Message) -> Result<Vec<u8>, DispatchError> {
    let packet = to_packet(frame, message)?;
    encoder::encode(&packet).map_err(|e| DispatchError::Encode(e.to_string()))
}

fn to_packet(frame: &Frame, message: &Message) -> Result<OscPacket, DispatchError> {
    let Target::Osc { address } = &message.target else {
        return Err(DispatchError::Encode(format!(
            "{} is not an OSC target",
            message.target
        )));
    };
    let packet = OscPacket::Message(OscMessage {
        addr: address.clone(),
        args: to_args(&message.params),
    });

    Ok(match message.timing {
        TimestampIntent::Immediate => packet,
        TimestampIntent::Ahead(offset) => OscPacket::Bundle(OscBundle {
            timetag: system_time_to_ntp(frame.tick_time + offset),
            content: vec![packet],
        }),
    })
}

fn to_args(params: &[Param]) -> Vec<OscType> {
    let mut args = Vec::with_capacity(params.len() * 2);
    for param in params {
        if let Some(name) = &param.name {
            args.push(OscType::String(name.clone()));
        }
        args.push(to_arg(&param.value));
    }
    args
}

fn to_arg(value: &Value) -> OscType {
    match value {
        Value::Bool(v) => OscType::Bool(*v),
        Value::Int(v) => OscType::Int(*v),
        Value::Float(v) => OscType::Float(*v),
        Value::Double(v) => OscType::Double(*v),
        Value::Str(v) => OscType::String(v.clone()),
    }
}

/// Wall-clock time as an OSC timetag.
pub fn system_time_to_ntp(time: SystemTime) -> OscTime {
    let elapsed = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let seconds = ((elapsed.as_secs() + NTP_UNIX_OFFSET) % (u32::MAX as u64 + 1)) as u32;
    let fractional = (((elapsed.subsec_nanos() as u64) << 32) / 1_000_000_000) as u32;
    OscTime::from((seconds, fractional))
}
