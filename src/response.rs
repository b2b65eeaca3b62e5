//! FINS response parsing.
//!
//! An inbound frame is `header(10) || command code(2) || end code(2) ||
//! body`. The command code selects the body parser; the original
//! [`Request`] supplies what the wire format alone cannot (bit vs word
//! values for reads, the address list for multi-reads).
//!
//! # End Codes
//!
//! The two end-code bytes carry three flag bits alongside the main and
//! sub response codes:
//!
//! - MRES bit 7 - network relay error
//! - SRES bit 7 - fatal CPU unit error
//! - SRES bit 6 - non-fatal CPU unit error
//!
//! The masked remainder forms the 4-hex-digit end code looked up in the
//! description table. An end code other than `"0000"` still completes the
//! transaction normally; the caller inspects [`EndCode`].
//!
//! # Example
//!
//! ```
//! use fins_client::EndCode;
//!
//! let code = EndCode::from_bytes(0xC0, 0x40);
//! assert!(code.network_relay_error);
//! assert!(code.non_fatal_cpu_error);
//! assert!(!code.fatal_cpu_error);
//! assert_eq!(code.code(), "0040");
//! ```

use std::net::SocketAddr;

use crate::address::{MemoryAddress, PlcFamily};
use crate::command::{CommandKind, Request};
use crate::error::{end_code_description, FinsError, Result};
use crate::header::{FinsHeader, FINS_HEADER_SIZE};
use crate::utils::get_bit;

/// Minimum inbound frame: header (10) + command code (2) + end code (2).
pub const MIN_RESPONSE_SIZE: usize = FINS_HEADER_SIZE + 4;

/// Decoded FINS end code with its flag bits separated out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndCode {
    /// Masked main response code (MRES).
    pub main: u8,
    /// Masked sub response code (SRES).
    pub sub: u8,
    /// MRES bit 7: the frame crossed a relay that reported an error.
    pub network_relay_error: bool,
    /// SRES bit 7: a fatal error is present in the CPU unit.
    pub fatal_cpu_error: bool,
    /// SRES bit 6: a non-fatal error is present in the CPU unit.
    pub non_fatal_cpu_error: bool,
}

impl EndCode {
    /// Decodes the two raw end-code bytes of a reply.
    pub fn from_bytes(mres: u8, sres: u8) -> Self {
        Self {
            main: mres & 0x3F,
            sub: sres & 0x4F,
            network_relay_error: (mres & 0x80) != 0,
            fatal_cpu_error: (sres & 0x80) != 0,
            non_fatal_cpu_error: (sres & 0x40) != 0,
        }
    }

    /// Returns the end code as four lowercase hex digits, e.g. `"1103"`.
    pub fn code(&self) -> String {
        format!("{:04x}", (u16::from(self.main) << 8) | u16::from(self.sub))
    }

    /// Returns the human-readable description from the end-code table, or
    /// `"undefined"` for unknown codes.
    pub fn description(&self) -> &'static str {
        end_code_description(self.main, self.sub)
    }

    /// Returns whether the end code signals normal completion.
    pub fn is_normal(&self) -> bool {
        self.main == 0 && self.sub == 0
    }
}

impl std::fmt::Display for EndCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// Values carried by a Memory Area Read reply. The variant follows the
/// request address: word addresses yield words, bit addresses yield
/// one flag per byte of payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseValues {
    /// Big-endian 16-bit words.
    Words(Vec<u16>),
    /// One flag per requested bit.
    Bits(Vec<bool>),
}

impl ResponseValues {
    /// Word values, if this is a word read.
    pub fn words(&self) -> Option<&[u16]> {
        match self {
            Self::Words(w) => Some(w),
            Self::Bits(_) => None,
        }
    }

    /// Bit values, if this is a bit read.
    pub fn bits(&self) -> Option<&[bool]> {
        match self {
            Self::Bits(b) => Some(b),
            Self::Words(_) => None,
        }
    }

    /// Number of values carried.
    pub fn len(&self) -> usize {
        match self {
            Self::Words(w) => w.len(),
            Self::Bits(b) => b.len(),
        }
    }

    /// Returns `true` when no values are carried.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single value of a multi-read reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataValue {
    /// A 16-bit word.
    Word(u16),
    /// A single bit.
    Bit(bool),
}

/// One item of a multi-read reply, paired with the address it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiReadValue {
    /// The requested address.
    pub address: MemoryAddress,
    /// The value the PLC echoed for it.
    pub value: DataValue,
}

/// Controller operating status (Controller Status Read, 0601).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Raw status byte.
    pub status: u8,
    /// Decoded status label.
    pub status_text: &'static str,
    /// Raw mode byte.
    pub mode: u8,
    /// Decoded mode label.
    pub mode_text: &'static str,
    /// Names of the fatal error flags currently set.
    pub fatal_errors: Vec<&'static str>,
    /// Names of the non-fatal error flags currently set.
    pub non_fatal_errors: Vec<&'static str>,
    /// Error code reported alongside a message, when present.
    pub error_code: Option<u16>,
    /// PLC message text, when present.
    pub message: Option<String>,
}

/// Fatal error flag names, bit position in the fatal error word.
const FATAL_ERROR_BITS: [(u8, &str); 10] = [
    (15, "Memory error"),
    (14, "I/O bus error"),
    (13, "Duplication error"),
    (12, "Inner board error"),
    (11, "I/O point overflow"),
    (10, "I/O setting error"),
    (9, "Program error"),
    (8, "Cycle time over"),
    (7, "SFC error"),
    (6, "FALS error"),
];

/// Non-fatal error flag names, bit position in the non-fatal error word.
const NON_FATAL_ERROR_BITS: [(u8, &str); 13] = [
    (15, "FAL error"),
    (13, "Duplex error"),
    (12, "Indirect DM error"),
    (10, "I/O verification error"),
    (9, "Inner board error"),
    (8, "Battery error"),
    (7, "CPU bus unit error"),
    (6, "Special I/O unit error"),
    (5, "SYSMAC BUS/2 error"),
    (4, "SYSMAC BUS error"),
    (3, "Remote I/O error"),
    (2, "Host link error"),
    (0, "PC link error"),
];

/// One CPU bus unit slot of a CPU Unit Data Read reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuBusUnit {
    /// Rack slot number (0-15).
    pub slot: u8,
    /// Whether a unit is installed in the slot.
    pub installed: bool,
    /// Unit number, meaningful when installed.
    pub unit_number: u8,
}

/// CPU unit description (CPU Unit Data Read, 0501).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuUnitData {
    /// CPU unit model string.
    pub model: String,
    /// CPU unit internal version string.
    pub internal_version: String,
    /// DIP switch settings.
    pub dip_switch: u8,
    /// Highest installed EM bank number.
    pub largest_em_bank: u8,
    /// Program area capacity in kilowords.
    pub program_area_size: u16,
    /// IOM area size in kilobytes.
    pub iom_size: u8,
    /// Number of DM words.
    pub dm_words: u16,
    /// Timer/counter area size.
    pub timer_counter_size: u8,
    /// Number of EM banks without file memory.
    pub em_size: u8,
    /// Memory card type (0 = none).
    pub memory_card_type: u8,
    /// Memory card capacity in kilobytes.
    pub memory_card_size: u16,
    /// Configuration of the 16 CPU bus unit slots.
    pub cpu_bus_units: Vec<CpuBusUnit>,
}

/// PLC wall clock (Clock Read, 0701). All fields are decoded from BCD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTime {
    /// Full year.
    pub year: u16,
    /// Month (1-12).
    pub month: u8,
    /// Day of month (1-31).
    pub day: u8,
    /// Hour (0-23).
    pub hour: u8,
    /// Minute (0-59).
    pub minute: u8,
    /// Second (0-59).
    pub second: u8,
    /// Day of week (0 = Sunday).
    pub day_of_week: u8,
}

/// Command-specific payload of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Memory Area Read values.
    Values(ResponseValues),
    /// Multiple Memory Area Read values in request order.
    Multi(Vec<MultiReadValue>),
    /// Controller status.
    Status(ControllerStatus),
    /// CPU unit description.
    CpuUnit(CpuUnitData),
    /// PLC clock.
    Clock(ClockTime),
    /// No payload beyond the end code.
    Empty,
}

/// A fully parsed FINS reply.
#[derive(Debug, Clone)]
pub struct Response {
    /// Peer that sent the reply.
    pub remote: SocketAddr,
    /// Service ID echoed in the reply header.
    pub sid: u8,
    /// The command this reply answers.
    pub command: CommandKind,
    /// Decoded end code.
    pub end_code: EndCode,
    /// Command-specific payload.
    pub body: ResponseBody,
    /// Raw body bytes following the end code.
    pub raw: Vec<u8>,
}

impl Response {
    /// Returns the operation name, e.g. `"read"` or `"status"`.
    pub fn command_name(&self) -> &'static str {
        self.command.name()
    }
}

/// Parses an inbound frame against its originating request.
///
/// The caller has already established that the frame's SID belongs to
/// `request`; this function verifies the command code agrees with the
/// request kind and decodes the body accordingly. Bodies of abnormal
/// replies (end code ≠ `"0000"`) are not decoded.
pub(crate) fn parse_response(
    frame: &[u8],
    request: &Request,
    family: PlcFamily,
    remote: SocketAddr,
) -> Result<Response> {
    if frame.len() < MIN_RESPONSE_SIZE {
        return Err(FinsError::protocol(format!(
            "response too short: expected at least {} bytes, got {}",
            MIN_RESPONSE_SIZE,
            frame.len()
        )));
    }

    let header = FinsHeader::from_bytes(frame)?;
    let code = (u16::from(frame[FINS_HEADER_SIZE]) << 8) | u16::from(frame[FINS_HEADER_SIZE + 1]);
    if code != request.kind.code() {
        return Err(FinsError::protocol(format!(
            "response command code {:04x} does not match request '{}' ({})",
            code,
            request.kind.name(),
            request.kind.hex()
        )));
    }

    let end_code = EndCode::from_bytes(frame[FINS_HEADER_SIZE + 2], frame[FINS_HEADER_SIZE + 3]);
    let raw = frame[MIN_RESPONSE_SIZE..].to_vec();

    let body = if end_code.is_normal() {
        match request.kind {
            CommandKind::Read => ResponseBody::Values(parse_read_values(&raw, request)?),
            CommandKind::ReadMultiple => {
                ResponseBody::Multi(parse_multi_read(&raw, request, family)?)
            }
            CommandKind::Status => ResponseBody::Status(parse_status(&raw)?),
            CommandKind::CpuUnitData => ResponseBody::CpuUnit(parse_cpu_unit_data(&raw)?),
            CommandKind::ClockRead => ResponseBody::Clock(parse_clock(&raw)?),
            CommandKind::Write
            | CommandKind::Fill
            | CommandKind::Transfer
            | CommandKind::Run
            | CommandKind::Stop => ResponseBody::Empty,
        }
    } else {
        ResponseBody::Empty
    };

    Ok(Response {
        remote,
        sid: header.sid,
        command: request.kind,
        end_code,
        body,
        raw,
    })
}

/// Decodes read values, consulting the request address for the element
/// type: bit reads carry one byte per bit, word reads two bytes per word.
fn parse_read_values(raw: &[u8], request: &Request) -> Result<ResponseValues> {
    let is_bit = request
        .address
        .as_ref()
        .map(MemoryAddress::is_bit_address)
        .unwrap_or(false);

    if is_bit {
        Ok(ResponseValues::Bits(raw.iter().map(|&b| b != 0).collect()))
    } else {
        if raw.len() % 2 != 0 {
            return Err(FinsError::protocol(
                "word read payload has odd length".to_string(),
            ));
        }
        Ok(ResponseValues::Words(
            raw.chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
        ))
    }
}

/// Walks a multi-read body against the request's address list. Every item
/// starts with an echo of the area code, followed by one byte for a bit
/// address or two for a word address.
fn parse_multi_read(
    raw: &[u8],
    request: &Request,
    family: PlcFamily,
) -> Result<Vec<MultiReadValue>> {
    let mut values = Vec::with_capacity(request.addresses.len());
    let mut cursor = 0usize;

    for address in &request.addresses {
        let expected = address.area_code(family)?;
        let width = if address.is_bit_address() { 1 } else { 2 };
        if raw.len() < cursor + 1 + width {
            return Err(FinsError::protocol(format!(
                "multi-read response truncated at item {} of {}",
                values.len() + 1,
                request.addresses.len()
            )));
        }
        let echoed = raw[cursor];
        if echoed != expected {
            return Err(FinsError::protocol(format!(
                "multi-read area code mismatch for {}: expected {:#04x}, got {:#04x}",
                address, expected, echoed
            )));
        }
        cursor += 1;
        let value = if address.is_bit_address() {
            let bit = raw[cursor] != 0;
            cursor += 1;
            DataValue::Bit(bit)
        } else {
            let word = u16::from_be_bytes([raw[cursor], raw[cursor + 1]]);
            cursor += 2;
            DataValue::Word(word)
        };
        values.push(MultiReadValue {
            address: address.clone(),
            value,
        });
    }

    Ok(values)
}

fn parse_status(raw: &[u8]) -> Result<ControllerStatus> {
    if raw.len() < 6 {
        return Err(FinsError::protocol(
            "status response shorter than 6 bytes".to_string(),
        ));
    }

    let status = raw[0];
    let status_text = match status {
        0x00 => "Stop",
        0x01 => "Run",
        0x80 => "CPU standby",
        _ => "Unknown",
    };
    let mode = raw[1];
    let mode_text = match mode {
        0x00 => "Program",
        0x02 => "Monitor",
        0x04 => "Run",
        _ => "Unknown",
    };

    let fatal = u16::from_be_bytes([raw[2], raw[3]]);
    let non_fatal = u16::from_be_bytes([raw[4], raw[5]]);
    let fatal_errors = FATAL_ERROR_BITS
        .iter()
        .filter(|&&(bit, _)| get_bit(fatal, bit))
        .map(|&(_, name)| name)
        .collect();
    let non_fatal_errors = NON_FATAL_ERROR_BITS
        .iter()
        .filter(|&&(bit, _)| get_bit(non_fatal, bit))
        .map(|&(_, name)| name)
        .collect();

    // Error code and message text trail the flag words on controllers
    // that have a message to report.
    let error_code = if raw.len() >= 10 {
        Some(u16::from_be_bytes([raw[8], raw[9]]))
    } else {
        None
    };
    let message = if raw.len() > 10 {
        let text = ascii_field(&raw[10..raw.len().min(26)]);
        (!text.is_empty()).then_some(text)
    } else {
        None
    };

    Ok(ControllerStatus {
        status,
        status_text,
        mode,
        mode_text,
        fatal_errors,
        non_fatal_errors,
        error_code,
        message,
    })
}

fn parse_cpu_unit_data(raw: &[u8]) -> Result<CpuUnitData> {
    // model(20) + version(20) + dip(1) + bank(1) + area data(10) + bus(32)
    if raw.len() < 84 {
        return Err(FinsError::protocol(format!(
            "CPU unit data response shorter than 84 bytes ({})",
            raw.len()
        )));
    }

    let model = ascii_field(&raw[0..20]);
    let internal_version = ascii_field(&raw[20..40]);
    let dip_switch = raw[40];
    let largest_em_bank = raw[41];

    let program_area_size = u16::from_be_bytes([raw[42], raw[43]]);
    let iom_size = raw[44];
    let dm_words = u16::from_be_bytes([raw[45], raw[46]]);
    let timer_counter_size = raw[47];
    let em_size = raw[48];
    let memory_card_type = raw[49];
    let memory_card_size = u16::from_be_bytes([raw[50], raw[51]]);

    let mut cpu_bus_units = Vec::with_capacity(16);
    for slot in 0..16u8 {
        let base = 52 + usize::from(slot) * 2;
        let hi = raw[base];
        cpu_bus_units.push(CpuBusUnit {
            slot,
            installed: hi & 0x80 != 0,
            unit_number: raw[base + 1],
        });
    }

    Ok(CpuUnitData {
        model,
        internal_version,
        dip_switch,
        largest_em_bank,
        program_area_size,
        iom_size,
        dm_words,
        timer_counter_size,
        em_size,
        memory_card_type,
        memory_card_size,
        cpu_bus_units,
    })
}

fn parse_clock(raw: &[u8]) -> Result<ClockTime> {
    if raw.len() < 7 {
        return Err(FinsError::protocol(
            "clock response shorter than 7 bytes".to_string(),
        ));
    }
    let year = u16::from(bcd(raw[0]));
    Ok(ClockTime {
        year: if year < 98 { 2000 + year } else { 1900 + year },
        month: bcd(raw[1]),
        day: bcd(raw[2]),
        hour: bcd(raw[3]),
        minute: bcd(raw[4]),
        second: bcd(raw[5]),
        day_of_week: bcd(raw[6]),
    })
}

fn bcd(byte: u8) -> u8 {
    (byte >> 4) * 10 + (byte & 0x0F)
}

/// Trims a fixed-width ASCII field at the first NUL and strips trailing
/// spaces.
fn ascii_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}
