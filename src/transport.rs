//! Transport layer for FINS communication.
//!
//! Two transports share one surface: UDP, where each datagram carries
//! exactly one FINS frame, and TCP, where every frame travels inside a
//! 16-byte envelope and the connection starts with a node-assignment
//! handshake. The transport knows bytes and envelopes; FINS semantics
//! stay in the protocol layer.
//!
//! # TCP Envelope
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | ASCII magic `"FINS"` |
//! | 4 | 4 | Length of everything after the length field |
//! | 8 | 4 | Command (2 = data frame) |
//! | 12 | 4 | Error code (nonzero terminates the connection) |
//! | 16 | n | FINS frame |
//!
//! A single TCP read may deliver several envelopes, or a fraction of
//! one; [`ReaderHalf`] buffers the stream and peels complete envelopes
//! as they form.
//!
//! # Handshake
//!
//! The client opens with a 20-byte node-assignment request (client node
//! 0 asks the server to choose) and receives a 24-byte reply carrying
//! the assigned client node and the server's own node. The protocol
//! layer patches those into its header template (`SA1`/`DA1`).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace, warn};

use crate::error::{tcp_error_description, FinsError, Result};
use crate::utils::format_packet;

/// Default FINS port for both transports.
pub const DEFAULT_FINS_PORT: u16 = 9600;

/// Maximum UDP datagram size accepted for a FINS frame.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Size of the FINS/TCP envelope header.
pub const TCP_HEADER_LEN: usize = 16;

const TCP_MAGIC: &[u8; 4] = b"FINS";
const TCP_COMMAND_NODE_REQUEST: u32 = 0;
const TCP_COMMAND_NODE_REPLY: u32 = 1;
const TCP_COMMAND_DATA: u32 = 2;

/// Wire transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// Connectionless datagrams (default).
    #[default]
    Udp,
    /// Stream transport with the FINS envelope and handshake.
    Tcp,
}

impl Protocol {
    /// Resolves the `protocol` option string.
    pub fn from_option(value: &str) -> Option<Self> {
        match value {
            "udp" => Some(Self::Udp),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

/// Node numbers assigned by the TCP handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Node number assigned to this client (becomes `SA1`).
    pub client_node: u8,
    /// The server's node number (becomes `DA1`).
    pub server_node: u8,
}

/// Wraps a FINS frame in a TCP data envelope.
pub(crate) fn wrap_frame(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TCP_HEADER_LEN + frame.len());
    out.extend_from_slice(TCP_MAGIC);
    out.extend_from_slice(&(frame.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(&TCP_COMMAND_DATA.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(frame);
    out
}

/// Builds the 20-byte node-assignment request. Client node 0 asks the
/// server to assign one.
pub(crate) fn handshake_request() -> [u8; 20] {
    let mut out = [0u8; 20];
    out[0..4].copy_from_slice(TCP_MAGIC);
    out[4..8].copy_from_slice(&12u32.to_be_bytes());
    out[8..12].copy_from_slice(&TCP_COMMAND_NODE_REQUEST.to_be_bytes());
    // error (12..16) and client node (16..20) stay zero
    out
}

/// Parses the 24-byte node-assignment reply.
pub(crate) fn parse_handshake_reply(data: &[u8]) -> Result<Handshake> {
    if data.len() < 24 {
        return Err(FinsError::protocol(format!(
            "handshake reply too short: expected 24 bytes, got {}",
            data.len()
        )));
    }
    if &data[0..4] != TCP_MAGIC {
        return Err(FinsError::protocol(
            "handshake reply does not start with 'FINS'".to_string(),
        ));
    }
    let length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if length != 16 {
        return Err(FinsError::protocol(format!(
            "handshake reply has unexpected length field {length}"
        )));
    }
    let command = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    if command != TCP_COMMAND_NODE_REPLY {
        return Err(FinsError::protocol(format!(
            "handshake reply has unexpected command {command}"
        )));
    }
    let error = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
    if error != 0 {
        return Err(FinsError::protocol(format!(
            "handshake rejected: {}",
            tcp_error_description(error)
        )));
    }
    Ok(Handshake {
        client_node: data[19],
        server_node: data[23],
    })
}

/// Peels every complete envelope off the stream buffer, leaving partial
/// data in place. Returns the FINS frames of the data envelopes.
pub(crate) fn peel_envelopes(buffer: &mut BytesMut) -> Result<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    loop {
        if buffer.len() < TCP_HEADER_LEN {
            return Ok(frames);
        }
        if &buffer[0..4] != TCP_MAGIC {
            return Err(FinsError::protocol(
                "envelope does not start with 'FINS'".to_string(),
            ));
        }
        let length = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
        if length < 8 {
            return Err(FinsError::protocol(format!(
                "envelope length field too small: {length}"
            )));
        }
        let total = 8 + length;
        if buffer.len() < total {
            // Body not complete yet; wait for more stream data.
            return Ok(frames);
        }
        let command = u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]);
        let error = u32::from_be_bytes([buffer[12], buffer[13], buffer[14], buffer[15]]);
        if error != 0 {
            return Err(FinsError::protocol(format!(
                "server reported envelope error: {}",
                tcp_error_description(error)
            )));
        }
        let frame = buffer[TCP_HEADER_LEN..total].to_vec();
        buffer.advance(total);
        if command == TCP_COMMAND_DATA {
            frames.push(frame);
        } else {
            warn!(command, "ignoring non-data envelope");
        }
    }
}

/// Cheaply cloneable send handle, shared with the spawned write tasks.
#[derive(Clone)]
pub(crate) enum Link {
    Udp {
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
    },
    Tcp {
        writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        remote: SocketAddr,
    },
}

impl Link {
    /// Writes one FINS frame, wrapping it in an envelope on TCP.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        match self {
            Self::Udp { socket, .. } => {
                trace!(packet = %format_packet(frame), "udp send");
                socket.send(frame).await?;
            }
            Self::Tcp { writer, .. } => {
                let enveloped = wrap_frame(frame);
                trace!(packet = %format_packet(&enveloped), "tcp send");
                writer.lock().await.write_all(&enveloped).await?;
            }
        }
        Ok(())
    }

    /// Remote endpoint address.
    pub fn remote(&self) -> SocketAddr {
        match self {
            Self::Udp { remote, .. } | Self::Tcp { remote, .. } => *remote,
        }
    }

    /// Best-effort shutdown of the write side.
    pub async fn shutdown(&self) {
        if let Self::Tcp { writer, .. } = self {
            let _ = writer.lock().await.shutdown().await;
        }
    }
}

/// Receive half of a transport, owned by the client's reader task.
pub(crate) enum ReaderHalf {
    Udp(Arc<UdpSocket>),
    Tcp {
        reader: OwnedReadHalf,
        buffer: BytesMut,
        pending: VecDeque<Vec<u8>>,
    },
}

impl ReaderHalf {
    /// Awaits the next complete FINS frame. Returns `None` when the peer
    /// closed the connection (TCP only).
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Udp(socket) => {
                let mut datagram = vec![0u8; MAX_PACKET_SIZE];
                let n = socket.recv(&mut datagram).await?;
                datagram.truncate(n);
                Ok(Some(datagram))
            }
            Self::Tcp {
                reader,
                buffer,
                pending,
            } => loop {
                if let Some(frame) = pending.pop_front() {
                    return Ok(Some(frame));
                }
                let n = reader.read_buf(buffer).await?;
                if n == 0 {
                    return Ok(None);
                }
                pending.extend(peel_envelopes(buffer)?);
            },
        }
    }
}

/// An opened transport: the shared send handle, the reader half, and the
/// handshake result on TCP.
pub(crate) struct Transport {
    pub link: Link,
    pub reader: ReaderHalf,
    pub handshake: Option<Handshake>,
}

/// Opens a transport to `host:port`, performing the node-assignment
/// handshake on TCP.
pub(crate) async fn open(protocol: Protocol, host: &str, port: u16) -> Result<Transport> {
    match protocol {
        Protocol::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect((host, port)).await?;
            let remote = socket.peer_addr()?;
            let socket = Arc::new(socket);
            debug!(%remote, "udp transport open");
            Ok(Transport {
                link: Link::Udp {
                    socket: Arc::clone(&socket),
                    remote,
                },
                reader: ReaderHalf::Udp(socket),
                handshake: None,
            })
        }
        Protocol::Tcp => {
            let mut stream = TcpStream::connect((host, port)).await?;
            let remote = stream.peer_addr()?;

            stream.write_all(&handshake_request()).await?;
            let mut reply = [0u8; 24];
            stream.read_exact(&mut reply).await?;
            let handshake = parse_handshake_reply(&reply)?;
            debug!(
                %remote,
                client_node = handshake.client_node,
                server_node = handshake.server_node,
                "tcp transport open, nodes assigned"
            );

            let (reader, writer) = stream.into_split();
            Ok(Transport {
                link: Link::Tcp {
                    writer: Arc::new(tokio::sync::Mutex::new(writer)),
                    remote,
                },
                reader: ReaderHalf::Tcp {
                    reader,
                    buffer: BytesMut::with_capacity(4096),
                    pending: VecDeque::new(),
                },
                handshake: Some(handshake),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_frame() {
        let wrapped = wrap_frame(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(&wrapped[0..4], b"FINS");
        assert_eq!(wrapped[4..8], 11u32.to_be_bytes()); // 8 + 3
        assert_eq!(wrapped[8..12], 2u32.to_be_bytes());
        assert_eq!(wrapped[12..16], [0, 0, 0, 0]);
        assert_eq!(&wrapped[16..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_handshake_request_layout() {
        let request = handshake_request();
        assert_eq!(&request[0..4], b"FINS");
        assert_eq!(request[4..8], 12u32.to_be_bytes());
        assert_eq!(request[8..12], [0, 0, 0, 0]);
        assert_eq!(request[12..20], [0; 8]);
    }

    fn handshake_reply(client_node: u8, server_node: u8) -> [u8; 24] {
        let mut reply = [0u8; 24];
        reply[0..4].copy_from_slice(b"FINS");
        reply[4..8].copy_from_slice(&16u32.to_be_bytes());
        reply[8..12].copy_from_slice(&1u32.to_be_bytes());
        reply[19] = client_node;
        reply[23] = server_node;
        reply
    }

    #[test]
    fn test_parse_handshake_reply() {
        let handshake = parse_handshake_reply(&handshake_reply(11, 1)).unwrap();
        assert_eq!(handshake.client_node, 11);
        assert_eq!(handshake.server_node, 1);
    }

    #[test]
    fn test_parse_handshake_reply_bad_magic() {
        let mut reply = handshake_reply(11, 1);
        reply[0] = b'X';
        assert!(parse_handshake_reply(&reply).is_err());
    }

    #[test]
    fn test_parse_handshake_reply_error_field() {
        let mut reply = handshake_reply(0, 0);
        reply[12..16].copy_from_slice(&0x20u32.to_be_bytes());
        let err = parse_handshake_reply(&reply).unwrap_err();
        assert!(err.to_string().contains("All connections are in use."));
    }

    #[test]
    fn test_parse_handshake_reply_short() {
        assert!(parse_handshake_reply(&[0u8; 20]).is_err());
    }

    #[test]
    fn test_peel_single_envelope() {
        let mut buffer = BytesMut::from(&wrap_frame(&[1, 2, 3])[..]);
        let frames = peel_envelopes(&mut buffer).unwrap();
        assert_eq!(frames, vec![vec![1, 2, 3]]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_peel_two_concatenated_envelopes() {
        let mut bytes = wrap_frame(&[1, 2, 3]);
        bytes.extend_from_slice(&wrap_frame(&[4, 5]));
        let mut buffer = BytesMut::from(&bytes[..]);
        let frames = peel_envelopes(&mut buffer).unwrap();
        assert_eq!(frames, vec![vec![1, 2, 3], vec![4, 5]]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_peel_split_envelope() {
        let whole = wrap_frame(&[9, 9, 9, 9]);
        let mut buffer = BytesMut::from(&whole[..10]);

        // First fragment: not even a complete header yet.
        assert!(peel_envelopes(&mut buffer).unwrap().is_empty());
        assert_eq!(buffer.len(), 10);

        buffer.extend_from_slice(&whole[10..]);
        let frames = peel_envelopes(&mut buffer).unwrap();
        assert_eq!(frames, vec![vec![9, 9, 9, 9]]);
    }

    #[test]
    fn test_peel_rejects_bad_magic() {
        let mut bytes = wrap_frame(&[1]);
        bytes[0] = b'M';
        let mut buffer = BytesMut::from(&bytes[..]);
        assert!(peel_envelopes(&mut buffer).is_err());
    }

    #[test]
    fn test_peel_surfaces_server_error() {
        let mut bytes = wrap_frame(&[]);
        bytes[12..16].copy_from_slice(&0x23u32.to_be_bytes());
        let mut buffer = BytesMut::from(&bytes[..]);
        let err = peel_envelopes(&mut buffer).unwrap_err();
        assert!(err
            .to_string()
            .contains("The client FINS node address is out of range."));
    }

    #[test]
    fn test_peel_skips_non_data_envelopes() {
        // A stray node-reply envelope between two data envelopes.
        let mut bytes = wrap_frame(&[1]);
        let mut node_reply = wrap_frame(&[0, 0, 0, 5]);
        node_reply[8..12].copy_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&node_reply);
        bytes.extend_from_slice(&wrap_frame(&[2]));

        let mut buffer = BytesMut::from(&bytes[..]);
        let frames = peel_envelopes(&mut buffer).unwrap();
        assert_eq!(frames, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_protocol_from_option() {
        assert_eq!(Protocol::from_option("udp"), Some(Protocol::Udp));
        assert_eq!(Protocol::from_option("tcp"), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_option("serial"), None);
    }
}
