//! FINS command codes, outbound frame assembly and the generic command
//! descriptor table.
//!
//! An outbound FINS frame is `header(10) || command code(2) || body`. The
//! body layouts (all integers big-endian):
//!
//! | Command | Code | Body |
//! |---------|------|------|
//! | Memory Area Read | 0101 | `address(4) ‖ count(2)` |
//! | Memory Area Write | 0102 | `address(4) ‖ count(2) ‖ payload` |
//! | Memory Area Fill | 0103 | `address(4) ‖ count(2) ‖ value(2)` |
//! | Multiple Memory Area Read | 0104 | `address(4)*` |
//! | Memory Area Transfer | 0105 | `src(4) ‖ dst(4) ‖ count(2)` |
//! | Run | 0401 | `program(2) ‖ mode(1)` or empty |
//! | Stop | 0402 | empty |
//! | CPU Unit Data Read | 0501 | empty |
//! | Controller Status Read | 0601 | empty |
//! | Clock Read | 0701 | empty |
//!
//! Write payloads are two bytes per word, or one byte per bit
//! (0x00/0x01) when the target is a bit address.

use std::time::Duration;

use crate::address::MemoryAddress;
use crate::error::{FinsError, Result};
use crate::header::{FinsHeader, FINS_HEADER_SIZE};

/// Maximum number of words or bits in a single read/write/fill/transfer.
pub const MAX_ITEMS_PER_COMMAND: u16 = 999;

/// The FINS commands this client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Memory Area Read (0101).
    Read,
    /// Memory Area Write (0102).
    Write,
    /// Memory Area Fill (0103).
    Fill,
    /// Multiple Memory Area Read (0104).
    ReadMultiple,
    /// Memory Area Transfer (0105).
    Transfer,
    /// Run (0401).
    Run,
    /// Stop (0402).
    Stop,
    /// CPU Unit Data Read (0501).
    CpuUnitData,
    /// Controller Status Read (0601).
    Status,
    /// Clock Read (0701).
    ClockRead,
}

impl CommandKind {
    /// Returns the 2-byte command code.
    pub fn code(self) -> u16 {
        match self {
            Self::Read => 0x0101,
            Self::Write => 0x0102,
            Self::Fill => 0x0103,
            Self::ReadMultiple => 0x0104,
            Self::Transfer => 0x0105,
            Self::Run => 0x0401,
            Self::Stop => 0x0402,
            Self::CpuUnitData => 0x0501,
            Self::Status => 0x0601,
            Self::ClockRead => 0x0701,
        }
    }

    /// Resolves a wire command code back to a kind.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0101 => Some(Self::Read),
            0x0102 => Some(Self::Write),
            0x0103 => Some(Self::Fill),
            0x0104 => Some(Self::ReadMultiple),
            0x0105 => Some(Self::Transfer),
            0x0401 => Some(Self::Run),
            0x0402 => Some(Self::Stop),
            0x0501 => Some(Self::CpuUnitData),
            0x0601 => Some(Self::Status),
            0x0701 => Some(Self::ClockRead),
            _ => None,
        }
    }

    /// Returns the operation name carried on responses.
    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Fill => "fill",
            Self::ReadMultiple => "read-multiple",
            Self::Transfer => "transfer",
            Self::Run => "run",
            Self::Stop => "stop",
            Self::CpuUnitData => "cpu-unit-data-read",
            Self::Status => "status",
            Self::ClockRead => "clock-read",
        }
    }

    /// Returns the code as the 4-hex-digit string used for dispatch.
    pub fn hex(self) -> String {
        format!("{:04x}", self.code())
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Payload for a memory area write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteData {
    /// One 16-bit value per word address.
    Words(Vec<u16>),
    /// One flag per bit address.
    Bits(Vec<bool>),
}

impl WriteData {
    /// Number of items carried.
    pub fn len(&self) -> usize {
        match self {
            Self::Words(w) => w.len(),
            Self::Bits(b) => b.len(),
        }
    }

    /// Returns `true` when no items are carried.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether this payload targets bit addresses.
    pub fn is_bits(&self) -> bool {
        matches!(self, Self::Bits(_))
    }
}

/// PLC operating mode for the Run command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Debug mode.
    Debug,
    /// Monitor mode (writes allowed while running).
    Monitor,
    /// Run mode.
    Run,
}

impl RunMode {
    /// Wire value of the mode byte.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Debug => 0x01,
            Self::Monitor => 0x02,
            Self::Run => 0x04,
        }
    }

    /// Resolves a wire mode value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Debug),
            0x02 => Some(Self::Monitor),
            0x04 => Some(Self::Run),
            _ => None,
        }
    }
}

/// Capture of a submitted command, kept by the sequence manager for the
/// lifetime of the transaction. The receive path consults it to decode
/// the reply (bit vs word values, multi-read address order).
#[derive(Debug, Clone)]
pub struct Request {
    /// Allocated service ID.
    pub sid: u8,
    /// Command kind.
    pub kind: CommandKind,
    /// Primary address (read/write/fill, transfer source).
    pub address: Option<MemoryAddress>,
    /// Address list for multi-reads, in wire order.
    pub addresses: Vec<MemoryAddress>,
    /// Item count where the command carries one.
    pub count: Option<u16>,
    /// Caller-supplied correlation tag, echoed on completion.
    pub tag: Option<String>,
    /// Effective timeout for this request.
    pub timeout: Duration,
}

/// Assembles a complete outbound frame from a minted header, command code
/// and body.
pub(crate) fn assemble_frame(header: FinsHeader, kind: CommandKind, body: &[u8]) -> Vec<u8> {
    let code = kind.code();
    let mut frame = Vec::with_capacity(FINS_HEADER_SIZE + 2 + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.push((code >> 8) as u8);
    frame.push((code & 0xFF) as u8);
    frame.extend_from_slice(body);
    frame
}

/// Body of a Memory Area Read: `address(4) ‖ count(2)`.
pub(crate) fn read_body(address: [u8; 4], count: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(6);
    body.extend_from_slice(&address);
    body.extend_from_slice(&count.to_be_bytes());
    body
}

/// Body of a Memory Area Write: `address(4) ‖ count(2) ‖ payload`.
pub(crate) fn write_body(address: [u8; 4], data: &WriteData) -> Vec<u8> {
    let count = data.len() as u16;
    let mut body = Vec::with_capacity(6 + data.len() * 2);
    body.extend_from_slice(&address);
    body.extend_from_slice(&count.to_be_bytes());
    match data {
        WriteData::Words(words) => {
            for word in words {
                body.extend_from_slice(&word.to_be_bytes());
            }
        }
        WriteData::Bits(bits) => {
            for bit in bits {
                body.push(u8::from(*bit));
            }
        }
    }
    body
}

/// Body of a Memory Area Fill: `address(4) ‖ count(2) ‖ value(2)`.
pub(crate) fn fill_body(address: [u8; 4], count: u16, value: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&address);
    body.extend_from_slice(&count.to_be_bytes());
    body.extend_from_slice(&value.to_be_bytes());
    body
}

/// Body of a Multiple Memory Area Read: concatenated 4-byte addresses, no
/// count prefix.
pub(crate) fn multi_read_body(addresses: &[[u8; 4]]) -> Vec<u8> {
    let mut body = Vec::with_capacity(addresses.len() * 4);
    for address in addresses {
        body.extend_from_slice(address);
    }
    body
}

/// Body of a Memory Area Transfer: `src(4) ‖ dst(4) ‖ count(2)`.
pub(crate) fn transfer_body(src: [u8; 4], dst: [u8; 4], count: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(10);
    body.extend_from_slice(&src);
    body.extend_from_slice(&dst);
    body.extend_from_slice(&count.to_be_bytes());
    body
}

/// Body of a Run command. With a mode the body addresses all programs
/// (0xFFFF) and carries the mode byte; without one the body is empty and
/// the PLC applies its default mode.
pub(crate) fn run_body(mode: Option<RunMode>) -> Vec<u8> {
    match mode {
        Some(mode) => vec![0xFF, 0xFF, mode.to_u8()],
        None => Vec::new(),
    }
}

/// A parameter to the generic [`command`](crate::FinsClient::command)
/// dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// A symbolic address.
    Text(String),
    /// A count, fill value, or mode.
    Number(u32),
    /// Word write payload.
    Words(Vec<u16>),
    /// Bit write payload.
    Bits(Vec<bool>),
    /// Address list for multi-reads.
    TextList(Vec<String>),
}

impl Param {
    fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Number(_) => "number",
            Self::Words(_) | Self::Bits(_) => "data",
            Self::TextList(_) => "text list",
        }
    }
}

/// Positional parameter requirement in a command descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamSpec {
    Text,
    Number,
    Data,
    TextList,
    OptionalNumber,
}

impl ParamSpec {
    fn accepts(self, param: &Param) -> bool {
        match self {
            Self::Text => matches!(param, Param::Text(_)),
            Self::Number | Self::OptionalNumber => matches!(param, Param::Number(_)),
            Self::Data => matches!(param, Param::Words(_) | Param::Bits(_)),
            Self::TextList => matches!(param, Param::TextList(_)),
        }
    }

    fn required(self) -> bool {
        !matches!(self, Self::OptionalNumber)
    }
}

/// Descriptor for one dispatchable command code.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Descriptor {
    pub kind: CommandKind,
    pub params: &'static [ParamSpec],
}

/// Looks up the descriptor for a 4-hex-digit command code string.
pub(crate) fn descriptor(code: &str) -> Option<Descriptor> {
    let descriptor = |kind, params| Some(Descriptor { kind, params });
    match code {
        "0101" => descriptor(CommandKind::Read, &[ParamSpec::Text, ParamSpec::Number][..]),
        "0102" => descriptor(CommandKind::Write, &[ParamSpec::Text, ParamSpec::Data][..]),
        "0103" => descriptor(
            CommandKind::Fill,
            &[ParamSpec::Text, ParamSpec::Number, ParamSpec::Number][..],
        ),
        "0104" => descriptor(CommandKind::ReadMultiple, &[ParamSpec::TextList][..]),
        "0105" => descriptor(
            CommandKind::Transfer,
            &[ParamSpec::Text, ParamSpec::Text, ParamSpec::Number][..],
        ),
        "0401" => descriptor(CommandKind::Run, &[ParamSpec::OptionalNumber][..]),
        "0402" => descriptor(CommandKind::Stop, &[][..]),
        "0501" => descriptor(CommandKind::CpuUnitData, &[][..]),
        "0601" => descriptor(CommandKind::Status, &[][..]),
        "0701" => descriptor(CommandKind::ClockRead, &[][..]),
        _ => None,
    }
}

/// Validates generic-dispatch parameters against a descriptor: arity
/// first, then the primitive type of each position.
pub(crate) fn check_params(descriptor: &Descriptor, params: &[Param]) -> Result<()> {
    let required = descriptor.params.iter().filter(|p| p.required()).count();
    if params.len() < required || params.len() > descriptor.params.len() {
        return Err(FinsError::invalid_parameter(
            "params",
            format!(
                "{} expects {} to {} parameters, got {}",
                descriptor.kind.name(),
                required,
                descriptor.params.len(),
                params.len()
            ),
        ));
    }
    for (position, (expected, param)) in descriptor.params.iter().zip(params).enumerate() {
        if !expected.accepts(param) {
            return Err(FinsError::invalid_parameter(
                format!("params[{position}]"),
                format!("unexpected {} parameter", param.kind_name()),
            ));
        }
    }
    Ok(())
}
