//! Powered Up hub protocol
//!
//! The subset of the LEGO Wireless Protocol 3.0 (LWP3) needed to drive a
//! train motor and read a colour/distance sensor.

use crate::error::HubError;
use tracing::trace;

/// LWP3 hub service UUID
pub const HUB_SERVICE_UUID: &str = "00001623-1212-efde-1623-785feabcd123";

/// LWP3 hub characteristic UUID - commands are written and notifications
/// are received on the same characteristic
pub const HUB_CHAR_UUID: &str = "00001624-1212-efde-1623-785feabcd123";

/// Message types
pub mod message {
    pub const PORT_INPUT_FORMAT_SETUP: u8 = 0x41;
    pub const PORT_VALUE_SINGLE: u8 = 0x45;
    pub const PORT_OUTPUT_COMMAND: u8 = 0x81;
}

/// Port output sub-commands
pub mod output {
    pub const SET_ACC_TIME: u8 = 0x05;
    pub const START_SPEED: u8 = 0x07;
    pub const WRITE_DIRECT_MODE_DATA: u8 = 0x51;
}

/// Hub id is always 0 for a single hub
const HUB_ID: u8 = 0x00;

/// Execute immediately and request command feedback
const STARTUP_AND_COMPLETION: u8 = 0x11;

/// Power limit sent with StartSpeed
const MAX_POWER: u8 = 100;

/// Acceleration profile flag for StartSpeed / SetAccTime
const USE_ACC_PROFILE: u8 = 0x01;

/// Smallest valid frame: length, hub id, message type
const HEADER_LEN: usize = 3;

/// A frame parsed back from raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SetPower { port: u8, power: i8 },
    SetAccTime { port: u8, time_ms: u16 },
    StartSpeed { port: u8, speed: i8 },
    InputFormatSetup { port: u8, mode: u8, delta: u32, notify: bool },
    PortValue { port: u8, value: Vec<u8> },
    Other { message_type: u8, body: Vec<u8> },
}

fn frame(message_type: u8, body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.push((HEADER_LEN + body.len()) as u8);
    bytes.push(HUB_ID);
    bytes.push(message_type);
    bytes.extend_from_slice(body);
    bytes
}

/// Set the motor power immediately (WriteDirectModeData, mode 0).
pub fn encode_set_power(port: u8, power: i8) -> Vec<u8> {
    frame(
        message::PORT_OUTPUT_COMMAND,
        &[
            port,
            STARTUP_AND_COMPLETION,
            output::WRITE_DIRECT_MODE_DATA,
            0x00,
            power as u8,
        ],
    )
}

/// Ramp to `target` over `duration_ms`: SetAccTime followed by a StartSpeed
/// that uses the acceleration profile. Both frames go out in one write.
pub fn encode_ramp(port: u8, target: i8, duration_ms: u16) -> Vec<u8> {
    let [lo, hi] = duration_ms.to_le_bytes();
    let mut bytes = frame(
        message::PORT_OUTPUT_COMMAND,
        &[
            port,
            STARTUP_AND_COMPLETION,
            output::SET_ACC_TIME,
            lo,
            hi,
            USE_ACC_PROFILE,
        ],
    );
    bytes.extend(frame(
        message::PORT_OUTPUT_COMMAND,
        &[
            port,
            STARTUP_AND_COMPLETION,
            output::START_SPEED,
            target as u8,
            MAX_POWER,
            USE_ACC_PROFILE,
        ],
    ));
    bytes
}

/// Select a sensor mode and enable value notifications for it.
pub fn encode_input_format_setup(port: u8, mode: u8, delta: u32, notify: bool) -> Vec<u8> {
    let mut body = vec![port, mode];
    body.extend_from_slice(&delta.to_le_bytes());
    body.push(u8::from(notify));
    frame(message::PORT_INPUT_FORMAT_SETUP, &body)
}

/// Build the notification a hub sends for a single-mode sensor value.
pub fn encode_port_value(port: u8, value: &[u8]) -> Vec<u8> {
    let mut body = vec![port];
    body.extend_from_slice(value);
    frame(message::PORT_VALUE_SINGLE, &body)
}

/// Split a write or notification buffer into its length-prefixed frames.
pub fn split_frames(bytes: &[u8]) -> Result<Vec<&[u8]>, HubError> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let len = rest[0] as usize;
        if len < HEADER_LEN || len > rest.len() {
            return Err(HubError::Protocol(format!(
                "bad frame length {} with {} bytes remaining",
                len,
                rest.len()
            )));
        }
        let (head, tail) = rest.split_at(len);
        frames.push(head);
        rest = tail;
    }
    Ok(frames)
}

/// Parse a single frame.
pub fn parse_frame(bytes: &[u8]) -> Result<Frame, HubError> {
    if bytes.len() < HEADER_LEN || bytes[0] as usize != bytes.len() {
        return Err(HubError::Protocol(format!(
            "malformed frame {:02X?}",
            bytes
        )));
    }
    trace!("Raw frame: {:02X?}", bytes);

    let message_type = bytes[2];
    let body = &bytes[HEADER_LEN..];
    let short = || HubError::Protocol(format!("truncated frame {:02X?}", bytes));

    let parsed = match message_type {
        message::PORT_OUTPUT_COMMAND => {
            if body.len() < 3 {
                return Err(short());
            }
            let port = body[0];
            let args = &body[3..];
            match body[2] {
                output::WRITE_DIRECT_MODE_DATA if args.len() >= 2 => Frame::SetPower {
                    port,
                    power: args[1] as i8,
                },
                output::SET_ACC_TIME if args.len() >= 2 => Frame::SetAccTime {
                    port,
                    time_ms: u16::from_le_bytes([args[0], args[1]]),
                },
                output::START_SPEED if !args.is_empty() => Frame::StartSpeed {
                    port,
                    speed: args[0] as i8,
                },
                output::WRITE_DIRECT_MODE_DATA | output::SET_ACC_TIME | output::START_SPEED => {
                    return Err(short())
                }
                _ => Frame::Other {
                    message_type,
                    body: body.to_vec(),
                },
            }
        }
        message::PORT_INPUT_FORMAT_SETUP => {
            if body.len() < 7 {
                return Err(short());
            }
            Frame::InputFormatSetup {
                port: body[0],
                mode: body[1],
                delta: u32::from_le_bytes([body[2], body[3], body[4], body[5]]),
                notify: body[6] != 0,
            }
        }
        message::PORT_VALUE_SINGLE => {
            if body.len() < 2 {
                return Err(short());
            }
            Frame::PortValue {
                port: body[0],
                value: body[1..].to_vec(),
            }
        }
        _ => Frame::Other {
            message_type,
            body: body.to_vec(),
        },
    };
    Ok(parsed)
}

/// Parse every frame in a buffer.
pub fn parse_frames(bytes: &[u8]) -> Result<Vec<Frame>, HubError> {
    split_frames(bytes)?.into_iter().map(parse_frame).collect()
}
