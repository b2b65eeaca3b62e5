//! # FINS Client
//!
//! An asynchronous Rust client for the Omron FINS (Factory Interface
//! Network Service) protocol, speaking to PLCs over UDP datagrams or a
//! FINS/TCP stream.
//!
//! Unlike a lock-step request/response client, this library multiplexes
//! up to 254 concurrent transactions over one socket, correlating
//! replies to requests by the 1-byte service ID of the FINS header. Each
//! submission returns immediately with a [`Transaction`] handle; the
//! reply, a timeout or a transport error resolves it later. Callers that
//! drop the handle receive outcomes on a broadcast [`FinsEvent`] stream
//! instead.
//!
//! ## Features
//!
//! - **UDP and TCP** - one FINS frame per datagram, or enveloped frames
//!   over a stream with the node-assignment handshake
//! - **Symbolic addressing** - `D100`, `CIO50.3`, `E1_200`, with
//!   family-selectable memory area tables (CS/CJ/NJ/NX and CV)
//! - **Concurrent transactions** - SID demultiplexing with per-request
//!   timeouts and admission back-pressure
//! - **Full command set** - read, write, fill, multi-read, transfer,
//!   run/stop, controller status, CPU unit data, clock read
//! - **Statistics** - round-trip window, reply/error/timeout counters,
//!   messages per second
//!
//! ## Quick Start
//!
//! ```no_run
//! use fins_client::{FinsClient, Options, ResponseBody, ResponseValues, WriteData};
//!
//! #[tokio::main]
//! async fn main() -> fins_client::Result<()> {
//!     // Connect to a PLC at the factory default address.
//!     let client = FinsClient::connect("192.168.1.250", 9600, Options::default()).await?;
//!
//!     // Read 10 words starting at DM100.
//!     let report = client.read("D100", 10, None, None)?.wait().await?;
//!     let response = report.response.expect("completed replies carry a response");
//!     assert_eq!(response.end_code.code(), "0000");
//!     if let ResponseBody::Values(ResponseValues::Words(words)) = &response.body {
//!         println!("D100..D109 = {:?}", words);
//!     }
//!
//!     // Write two words to DM200.
//!     client
//!         .write("D200", WriteData::Words(vec![0x1234, 0x5678]), None, None)?
//!         .wait()
//!         .await?;
//!
//!     // Set a single bit.
//!     client
//!         .write("CIO50.3", WriteData::Bits(vec![true]), None, None)?
//!         .wait()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrent Requests
//!
//! Submissions do not block each other; replies resolve in whatever
//! order the PLC produces them:
//!
//! ```no_run
//! # use fins_client::{FinsClient, Options};
//! # async fn example(client: &FinsClient) -> fins_client::Result<()> {
//! let a = client.read("D0", 50, None, Some("block-a".into()))?;
//! let b = client.read("W0", 20, None, Some("block-b".into()))?;
//! let (a, b) = tokio::join!(a.wait(), b.wait());
//! println!("a={:?} b={:?}", a?.tag, b?.tag);
//! # Ok(())
//! # }
//! ```
//!
//! ## End Codes
//!
//! A PLC that answers with an end code other than `"0000"` still
//! completes the transaction - inspect [`EndCode`] on the response:
//!
//! ```no_run
//! # use fins_client::{FinsClient, Options};
//! # async fn example(client: &FinsClient) -> fins_client::Result<()> {
//! let report = client.read("D100", 1, None, None)?.wait().await?;
//! let response = report.response.expect("reply");
//! if !response.end_code.is_normal() {
//!     eprintln!("PLC refused: {}", response.end_code);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Scope
//!
//! This is a client library only: no PLC emulation, no Host Link or
//! serial FINS, no automatic retry or reconnection policy beyond the
//! [`FinsClient::reconnect`] primitive. A dropped UDP datagram surfaces
//! as a timeout.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod address;
mod client;
mod command;
mod error;
mod header;
mod response;
mod sequence;
mod transport;
pub mod utils;

// Public re-exports
pub use address::{MemoryAddress, PlcFamily};
pub use client::{
    FinsClient, FinsEvent, Options, RequestOptions, Transaction, DEFAULT_MAX_QUEUE,
    DEFAULT_TIMEOUT,
};
pub use command::{CommandKind, Param, Request, RunMode, WriteData, MAX_ITEMS_PER_COMMAND};
pub use error::{end_code_description, tcp_error_description, FinsError, Result};
pub use header::{FinsHeader, Routing, FINS_HEADER_SIZE};
pub use response::{
    ClockTime, ControllerStatus, CpuBusUnit, CpuUnitData, DataValue, EndCode, MultiReadValue,
    Response, ResponseBody, ResponseValues, MIN_RESPONSE_SIZE,
};
pub use sequence::{SequenceReport, StatsSnapshot};
pub use transport::{Handshake, Protocol, DEFAULT_FINS_PORT, MAX_PACKET_SIZE, TCP_HEADER_LEN};
