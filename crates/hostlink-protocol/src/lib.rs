//! Protocol types for hostlink host-guest communication.
//!
//! This crate defines the wire format shared by the host and the guest-side
//! channel agent. Records travel as raw fixed-width structures; every integer
//! is little-endian regardless of the platform, so the byte layout is stable
//! across both ends of the queue pair.
//!
//! # Wire layout
//!
//! ```text
//! command record (1032 bytes)
//! +---------------+----------------------------+
//! | id (8, LE)    | payload (1024, zero-padded)|
//! +---------------+----------------------------+
//!
//! response record (1040 bytes)
//! +---------------+--------------------------------------------+
//! | id (8, LE)    | body union (1032)                          |
//! +---------------+--------------------------------------------+
//!   body = echoed command record (8 + 1024)
//!        | memory info (6 x u64 + u32, zero-padded)
//! ```
//!
//! The body union carries no discriminant of its own; the leading `id` tells
//! the host which arm it is looking at.

#![deny(missing_docs)]

use thiserror::Error;

/// Fixed width of a command payload on the wire.
pub const PAYLOAD_LEN: usize = 1024;

/// Total wire size of a command record: 8-byte id + payload field.
pub const COMMAND_RECORD_LEN: usize = 8 + PAYLOAD_LEN;

/// Width of the response body union. The echoed-command arm is the larger
/// one, so the union is exactly one command record wide.
pub const RESPONSE_BODY_LEN: usize = COMMAND_RECORD_LEN;

/// Total wire size of a response record: 8-byte tag + body union.
pub const RESPONSE_RECORD_LEN: usize = 8 + RESPONSE_BODY_LEN;

/// Encoded width of the memory-info body arm before padding.
const MEMORY_INFO_LEN: usize = 6 * 8 + 4;

/// Built-in command identifiers understood by the channel agent.
///
/// IDs outside this set are valid on the wire; the agent treats them as
/// no-ops unless a plugin slot claims them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    /// Query the guest's memory statistics.
    MemStats,
    /// Run a line command on the guest (fire-and-forget).
    RunCommand,
    /// Poll for completed asynchronous execution results.
    ExecStatus,
    /// Read and reset the guest's page-fault counter.
    FaultCount,
    /// Dispatch the payload to plugin registry slot 0.
    PluginSlot0,
    /// Fetch the most recent exec-info string.
    ExecInfo,
    /// Throughput probe: reply with a filler buffer of a requested tier.
    Throughput,
    /// Dispatch the payload to plugin registry slot 1.
    PluginSlot1,
}

impl CommandId {
    /// Map a raw wire id to a known command, if any.
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(CommandId::MemStats),
            2 => Some(CommandId::RunCommand),
            3 => Some(CommandId::ExecStatus),
            4 => Some(CommandId::FaultCount),
            5 => Some(CommandId::PluginSlot0),
            6 => Some(CommandId::ExecInfo),
            7 => Some(CommandId::Throughput),
            8 => Some(CommandId::PluginSlot1),
            _ => None,
        }
    }

    /// The raw id this command travels as.
    pub fn as_raw(self) -> i64 {
        match self {
            CommandId::MemStats => 1,
            CommandId::RunCommand => 2,
            CommandId::ExecStatus => 3,
            CommandId::FaultCount => 4,
            CommandId::PluginSlot0 => 5,
            CommandId::ExecInfo => 6,
            CommandId::Throughput => 7,
            CommandId::PluginSlot1 => 8,
        }
    }
}

/// Error produced while building or decoding wire records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A payload exceeded the fixed wire width.
    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLong {
        /// Offered payload length in bytes.
        len: usize,
        /// The fixed wire width.
        max: usize,
    },

    /// A buffer was shorter than the record it should contain.
    #[error("buffer too short: expected {expected} bytes, got {got}")]
    ShortBuffer {
        /// Bytes the record needs.
        expected: usize,
        /// Bytes actually available.
        got: usize,
    },
}

/// A bounded byte string that is guaranteed to fit the fixed payload field.
///
/// Construction is the single bounds check for every fixed-width copy in the
/// system: once a `Payload` exists, encoding cannot overrun.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    bytes: Vec<u8>,
}

impl Payload {
    /// Build a payload, rejecting anything wider than the wire field.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
        let bytes = bytes.into();
        if bytes.len() > PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLong {
                len: bytes.len(),
                max: PAYLOAD_LEN,
            });
        }
        Ok(Self { bytes })
    }

    /// The empty payload.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a payload, deterministically truncating anything wider than
    /// the wire field. For producers that prefer losing a tail over
    /// rejecting the record.
    pub fn truncate_to_fit(bytes: impl Into<Vec<u8>>) -> Self {
        let mut bytes = bytes.into();
        bytes.truncate(PAYLOAD_LEN);
        Self { bytes }
    }

    /// Raw payload bytes (without wire padding).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy text view of the payload.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Write the payload into a fixed wire field, zero-padding the tail.
    fn encode_into(&self, field: &mut [u8]) {
        debug_assert_eq!(field.len(), PAYLOAD_LEN);
        field[..self.bytes.len()].copy_from_slice(&self.bytes);
        field[self.bytes.len()..].fill(0);
    }

    /// Read a payload back from a fixed wire field. Padding zeros terminate
    /// the string, per the C-string convention of the wire layout.
    fn decode_from(field: &[u8]) -> Self {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        Self {
            bytes: field[..end].to_vec(),
        }
    }
}

impl std::str::FromStr for Payload {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Payload::new(s.as_bytes().to_vec())
    }
}

/// One host-to-guest request unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Raw command id. Known values map through [`CommandId::from_raw`].
    pub id: i64,
    /// Command payload.
    pub payload: Payload,
}

impl CommandRecord {
    /// Build a command record for a known command id.
    pub fn new(id: CommandId, payload: Payload) -> Self {
        Self {
            id: id.as_raw(),
            payload,
        }
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> [u8; COMMAND_RECORD_LEN] {
        let mut buf = [0u8; COMMAND_RECORD_LEN];
        buf[..8].copy_from_slice(&self.id.to_le_bytes());
        self.payload.encode_into(&mut buf[8..]);
        buf
    }

    /// Decode from a wire buffer holding at least one command record.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < COMMAND_RECORD_LEN {
            return Err(ProtocolError::ShortBuffer {
                expected: COMMAND_RECORD_LEN,
                got: buf.len(),
            });
        }
        let id = i64::from_le_bytes(buf[..8].try_into().expect("8-byte slice"));
        let payload = Payload::decode_from(&buf[8..COMMAND_RECORD_LEN]);
        Ok(Self { id, payload })
    }
}

/// Memory statistics snapshot, mirroring the collaborator's fixed-shape
/// record. Copied by value end to end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Total usable memory, in units.
    pub total: u64,
    /// Currently free memory, in units.
    pub free: u64,
    /// Shared memory, in units.
    pub shared: u64,
    /// Buffer memory, in units.
    pub buffer: u64,
    /// Total high memory, in units.
    pub total_high: u64,
    /// Free high memory, in units.
    pub free_high: u64,
    /// Size of one unit in bytes.
    pub unit: u32,
}

impl MemoryInfo {
    fn encode_into(&self, field: &mut [u8]) {
        field[..8].copy_from_slice(&self.total.to_le_bytes());
        field[8..16].copy_from_slice(&self.free.to_le_bytes());
        field[16..24].copy_from_slice(&self.shared.to_le_bytes());
        field[24..32].copy_from_slice(&self.buffer.to_le_bytes());
        field[32..40].copy_from_slice(&self.total_high.to_le_bytes());
        field[40..48].copy_from_slice(&self.free_high.to_le_bytes());
        field[48..52].copy_from_slice(&self.unit.to_le_bytes());
        field[MEMORY_INFO_LEN..].fill(0);
    }

    fn decode_from(field: &[u8]) -> Self {
        let u64_at = |off: usize| {
            u64::from_le_bytes(field[off..off + 8].try_into().expect("8-byte slice"))
        };
        Self {
            total: u64_at(0),
            free: u64_at(8),
            shared: u64_at(16),
            buffer: u64_at(24),
            total_high: u64_at(32),
            free_high: u64_at(40),
            unit: u32::from_le_bytes(field[48..52].try_into().expect("4-byte slice")),
        }
    }
}

/// Body union of a response record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// An echoed command record (inner id + text).
    Echo {
        /// Inner command id being echoed or answered.
        id: i64,
        /// Response text.
        text: Payload,
    },
    /// A memory statistics record.
    MemStats(MemoryInfo),
}

/// One guest-to-host reply unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    /// Leading id/status tag. Mirrors the command id it answers.
    pub id: i64,
    /// Response body.
    pub body: ResponseBody,
}

impl ResponseRecord {
    /// Build an echo-style response answering `id` with `text`.
    pub fn echo(id: i64, text: Payload) -> Self {
        Self {
            id,
            body: ResponseBody::Echo { id, text },
        }
    }

    /// Build a memory-statistics response.
    pub fn mem_stats(info: MemoryInfo) -> Self {
        Self {
            id: CommandId::MemStats.as_raw(),
            body: ResponseBody::MemStats(info),
        }
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> [u8; RESPONSE_RECORD_LEN] {
        let mut buf = [0u8; RESPONSE_RECORD_LEN];
        buf[..8].copy_from_slice(&self.id.to_le_bytes());
        let body = &mut buf[8..];
        match &self.body {
            ResponseBody::Echo { id, text } => {
                body[..8].copy_from_slice(&id.to_le_bytes());
                text.encode_into(&mut body[8..8 + PAYLOAD_LEN]);
            }
            ResponseBody::MemStats(info) => info.encode_into(body),
        }
        buf
    }

    /// Decode from a wire buffer. The leading tag selects the body arm:
    /// the memory-stats command id means the memory-info arm, everything
    /// else is an echo.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < RESPONSE_RECORD_LEN {
            return Err(ProtocolError::ShortBuffer {
                expected: RESPONSE_RECORD_LEN,
                got: buf.len(),
            });
        }
        let id = i64::from_le_bytes(buf[..8].try_into().expect("8-byte slice"));
        let body_field = &buf[8..RESPONSE_RECORD_LEN];
        let body = if id == CommandId::MemStats.as_raw() {
            ResponseBody::MemStats(MemoryInfo::decode_from(body_field))
        } else {
            ResponseBody::Echo {
                id: i64::from_le_bytes(body_field[..8].try_into().expect("8-byte slice")),
                text: Payload::decode_from(&body_field[8..8 + PAYLOAD_LEN]),
            }
        };
        Ok(Self { id, body })
    }
}
