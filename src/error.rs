//! Error types for the FINS client.
//!
//! This module defines the [`FinsError`] enum and the [`Result`] type alias
//! used throughout the library, plus the description tables for FINS end
//! codes and FINS/TCP envelope error codes.
//!
//! # Error Categories
//!
//! - **Validation errors** - bad address syntax, unknown areas, bad counts
//! - **Admission errors** - the transaction queue is full, or a SID slot is
//!   still occupied
//! - **Communication errors** - timeouts, write failures, closed connections
//! - **Protocol errors** - malformed envelopes, mismatched command codes,
//!   unexpected SIDs
//!
//! A PLC reply whose end code is not `"0000"` is *not* an error: the
//! transaction completes normally and the caller inspects
//! [`EndCode`](crate::EndCode) on the response.
//!
//! # Example
//!
//! ```
//! use fins_client::FinsError;
//!
//! let err = FinsError::invalid_address("Q100", "unknown memory area");
//! assert_eq!(
//!     err.to_string(),
//!     "Invalid address 'Q100': unknown memory area"
//! );
//! ```

use std::io;
use thiserror::Error;

/// Returns a human-readable description for a FINS end code.
///
/// The end code is formed from the masked main response code (MRES) and sub
/// response code (SRES) of a reply. Codes absent from the table yield
/// `"undefined"`.
///
/// # Example
///
/// ```
/// use fins_client::end_code_description;
///
/// assert_eq!(end_code_description(0x00, 0x00), "Normal completion.");
/// assert_eq!(
///     end_code_description(0x11, 0x03),
///     "Parameter error: First address in inaccessible area."
/// );
/// assert_eq!(end_code_description(0x7F, 0x2E), "undefined");
/// ```
pub fn end_code_description(main: u8, sub: u8) -> &'static str {
    match (main, sub) {
        (0x00, 0x00) => "Normal completion.",
        (0x00, 0x01) => "Normal completion: Service was interrupted.",

        (0x01, 0x01) => "Local node error: Local node not part of network.",
        (0x01, 0x02) => "Local node error: Token time-out, node number too large.",
        (0x01, 0x03) => "Local node error: Number of transmit retries exceeded.",
        (0x01, 0x04) => "Local node error: Maximum number of frames exceeded.",
        (0x01, 0x05) => "Local node error: Node number setting error.",
        (0x01, 0x06) => "Local node error: Node number duplication error.",

        (0x02, 0x01) => "Destination node error: Destination node not part of network.",
        (0x02, 0x02) => "Destination node error: No node with the specified node number.",
        (0x02, 0x03) => "Destination node error: Third node not part of network.",
        (0x02, 0x04) => "Destination node error: Destination node busy.",
        (0x02, 0x05) => "Destination node error: Response time-out.",

        (0x03, 0x01) => "Controller error: Communications controller error.",
        (0x03, 0x02) => "Controller error: CPU unit error at the destination node.",
        (0x03, 0x03) => "Controller error: Controller error prevented a normal response.",
        (0x03, 0x04) => "Controller error: Unit number setting error.",

        (0x04, 0x01) => "Service unsupported: Undefined command.",
        (0x04, 0x02) => "Service unsupported: Not supported by unit model or version.",

        (0x05, 0x01) => "Routing table error: Destination address not in routing table.",
        (0x05, 0x02) => "Routing table error: Routing table is not registered.",
        (0x05, 0x03) => "Routing table error: Routing table error.",
        (0x05, 0x04) => "Routing table error: Maximum number of relay nodes exceeded.",

        (0x10, 0x01) => "Command format error: Command is longer than the maximum length.",
        (0x10, 0x02) => "Command format error: Command is shorter than the minimum length.",
        (0x10, 0x03) => {
            "Command format error: Designated number of data items differs from the actual number."
        }
        (0x10, 0x04) => "Command format error: Incorrect command format.",
        (0x10, 0x05) => "Command format error: Incorrect header.",

        (0x11, 0x01) => "Parameter error: Memory area code invalid or DM area unavailable.",
        (0x11, 0x02) => "Parameter error: Access size is wrong in command.",
        (0x11, 0x03) => "Parameter error: First address in inaccessible area.",
        (0x11, 0x04) => "Parameter error: Address range error.",
        (0x11, 0x06) => "Parameter error: Non-existent program number.",
        (0x11, 0x09) => "Parameter error: Sizes of data items in the command block are wrong.",
        (0x11, 0x0A) => "Parameter error: IOM break function cannot be executed.",
        (0x11, 0x0B) => "Parameter error: Response block is longer than the maximum length.",
        (0x11, 0x0C) => "Parameter error: Incorrect parameter code.",

        (0x20, 0x02) => "Read not possible: Data is protected.",
        (0x20, 0x03) => "Read not possible: Registered table does not exist.",
        (0x20, 0x04) => "Read not possible: Search data does not exist.",
        (0x20, 0x05) => "Read not possible: Non-existent program number.",
        (0x20, 0x06) => "Read not possible: Non-existent file.",
        (0x20, 0x07) => "Read not possible: Verification error.",

        (0x21, 0x01) => "Write not possible: Specified area is read-only.",
        (0x21, 0x02) => "Write not possible: Data is protected.",
        (0x21, 0x03) => "Write not possible: Too many files open.",
        (0x21, 0x05) => "Write not possible: Non-existent program number.",
        (0x21, 0x06) => "Write not possible: Non-existent file.",
        (0x21, 0x07) => "Write not possible: File already exists.",
        (0x21, 0x08) => "Write not possible: Data cannot be changed.",

        (0x22, 0x01) => "Not executable in current mode: Mode is wrong (executing).",
        (0x22, 0x02) => "Not executable in current mode: Mode is wrong (stopped).",
        (0x22, 0x03) => "Not executable in current mode: PLC is in PROGRAM mode.",
        (0x22, 0x04) => "Not executable in current mode: PLC is in DEBUG mode.",
        (0x22, 0x05) => "Not executable in current mode: PLC is in MONITOR mode.",
        (0x22, 0x06) => "Not executable in current mode: PLC is in RUN mode.",
        (0x22, 0x07) => "Not executable in current mode: Specified node is not the polling node.",
        (0x22, 0x08) => "Not executable in current mode: Step cannot be executed.",

        (0x23, 0x01) => "No such device: File device does not exist where specified.",
        (0x23, 0x02) => "No such device: Specified memory does not exist.",
        (0x23, 0x03) => "No such device: No clock exists.",

        (0x24, 0x01) => "Cannot start/stop: Data link table either incorrect or not registered.",

        (0x25, 0x02) => "Unit error: Parity or checksum error occurred.",
        (0x25, 0x03) => "Unit error: I/O setting error.",
        (0x25, 0x04) => "Unit error: Too many I/O points.",
        (0x25, 0x05) => "Unit error: CPU bus error.",
        (0x25, 0x06) => "Unit error: I/O duplication error.",
        (0x25, 0x07) => "Unit error: I/O bus error.",
        (0x25, 0x09) => "Unit error: SYSMAC BUS/2 error.",
        (0x25, 0x0A) => "Unit error: CPU bus unit error.",
        (0x25, 0x0D) => "Unit error: Duplication in SYSMAC BUS word allocation.",
        (0x25, 0x0F) => "Unit error: Memory error has occurred.",
        (0x25, 0x10) => "Unit error: Terminator not connected in SYSMAC BUS system.",

        (0x26, 0x01) => "Command error: The specified area is not protected.",
        (0x26, 0x02) => "Command error: Incorrect password.",
        (0x26, 0x04) => "Command error: The specified area is protected.",
        (0x26, 0x05) => "Command error: Service is already executing.",
        (0x26, 0x06) => "Command error: Service is not executing.",
        (0x26, 0x07) => "Command error: Service cannot be executed from the local node.",
        (0x26, 0x08) => "Command error: Service cannot be executed, settings are incorrect.",
        (0x26, 0x09) => "Command error: Incorrect settings in the command data.",
        (0x26, 0x0A) => "Command error: Action has already been registered.",
        (0x26, 0x0B) => "Command error: Cannot clear error, the cause still exists.",

        (0x30, 0x01) => "Access right error: The access right is held by another device.",

        (0x40, 0x01) => "Abort: Command was aborted with ABORT command.",

        _ => "undefined",
    }
}

/// Returns a human-readable description for the error field of a FINS/TCP
/// envelope.
///
/// The server reports handshake and framing problems through the 4-byte
/// error field of the 16-byte envelope header; a nonzero value terminates
/// the connection.
pub fn tcp_error_description(code: u32) -> &'static str {
    match code {
        0x0000_0001 => "The TCP header is not 'FINS'.",
        0x0000_0002 => "The data length is too long.",
        0x0000_0003 => "The command is not supported.",
        0x0000_0020 => "All connections are in use.",
        0x0000_0021 => "The specified node is already connected.",
        0x0000_0022 => "Attempt to access a protected node from an unspecified IP address.",
        0x0000_0023 => "The client FINS node address is out of range.",
        0x0000_0024 => "The same FINS node address is being used by the client and server.",
        0x0000_0025 => "All the node addresses available for allocation have been used.",
        _ => "undefined",
    }
}

/// Result type alias for FINS operations.
pub type Result<T> = std::result::Result<T, FinsError>;

/// Errors that can occur during FINS communication.
#[derive(Debug, Error)]
pub enum FinsError {
    /// A symbolic address failed to parse or names an unknown memory area.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The offending address string.
        address: String,
        /// Description of the failure.
        reason: String,
    },

    /// Invalid parameter provided to an operation.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// The transaction queue is at capacity; the submission was refused.
    #[error("Transaction queue full ({active}/{capacity})")]
    QueueFull {
        /// Transactions currently in flight.
        active: usize,
        /// Maximum concurrent transactions.
        capacity: usize,
    },

    /// A prior request with the same service ID has not yet terminated.
    #[error("Service ID 0x{sid:02X} is still in use")]
    SidInUse {
        /// The contested service ID.
        sid: u8,
    },

    /// The per-request timer expired before a reply arrived.
    #[error("Request with SID 0x{sid:02X} timed out after {elapsed_ms} ms")]
    Timeout {
        /// Service ID of the expired request.
        sid: u8,
        /// Time waited, in milliseconds.
        elapsed_ms: u64,
    },

    /// A transport-level write failure or connection closure.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the transport failure.
        reason: String,
    },

    /// I/O error while opening or using a socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A malformed or unexpected frame was received.
    #[error("Protocol error: {reason}")]
    Protocol {
        /// Description of the protocol violation.
        reason: String,
    },

    /// The client has been closed; no further submissions are accepted.
    #[error("Client is closed")]
    Closed,
}

impl FinsError {
    /// Creates a new `InvalidAddress` error.
    ///
    /// # Example
    ///
    /// ```
    /// use fins_client::FinsError;
    ///
    /// let err = FinsError::invalid_address("D", "missing word offset");
    /// ```
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidParameter` error.
    ///
    /// # Example
    ///
    /// ```
    /// use fins_client::FinsError;
    ///
    /// let err = FinsError::invalid_parameter("count", "must be greater than 0");
    /// ```
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `Protocol` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Creates a new `Transport` error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Returns `true` for failures that terminate an in-flight transaction
    /// asynchronously (timeout, transport, protocol), as opposed to
    /// synchronous validation or admission failures.
    pub fn is_asynchronous(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Transport { .. } | Self::Protocol { .. } | Self::Io(_)
        )
    }
}
