//! End-to-end tests of the protocol engine against in-process mock PLC
//! endpoints speaking real FINS frames over UDP and FINS/TCP.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use fins_client::{
    FinsClient, FinsError, FinsEvent, Options, Protocol, RequestOptions, ResponseBody,
    ResponseValues, WriteData,
};

/// Builds a response header mirroring a request: source and destination
/// swapped, SID echoed.
fn reply_header(frame: &[u8]) -> Vec<u8> {
    vec![
        0xC0, 0x00, 0x02, frame[6], frame[7], frame[8], frame[3], frame[4], frame[5], frame[9],
    ]
}

/// Answers a FINS command frame the way a cooperative PLC would.
fn answer(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 12 {
        return None;
    }
    let code = u16::from_be_bytes([frame[10], frame[11]]);
    let body = &frame[12..];

    let mut reply = reply_header(frame);
    reply.push(frame[10]);
    reply.push(frame[11]);
    reply.extend_from_slice(&[0x00, 0x00]); // normal completion

    match code {
        // Memory Area Read: bit area codes sit below 0x60 in the CS
        // tables, so the mock answers bits or words accordingly.
        0x0101 => {
            let area = body[0];
            let count = u16::from_be_bytes([body[4], body[5]]);
            if area < 0x60 {
                for i in 0..count {
                    reply.push(u8::from(i % 2 == 0));
                }
            } else {
                for i in 0..count {
                    reply.extend_from_slice(&(100 + i).to_be_bytes());
                }
            }
        }
        0x0102 | 0x0103 | 0x0105 | 0x0401 | 0x0402 => {}
        0x0104 => {
            for chunk in body.chunks_exact(4) {
                reply.push(chunk[0]);
                if chunk[0] < 0x60 {
                    reply.push(0x01);
                } else {
                    reply.extend_from_slice(&[0xAB, 0xCD]);
                }
            }
        }
        0x0601 => reply.extend_from_slice(&[0x01, 0x02, 0x00, 0x00, 0x00, 0x00]),
        _ => return None,
    }
    Some(reply)
}

/// Spawns a UDP PLC that answers every request.
async fn spawn_udp_plc() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if let Some(reply) = answer(&buf[..n]) {
                let _ = socket.send_to(&reply, peer).await;
            }
        }
    });
    addr
}

/// Spawns a UDP endpoint that swallows every request.
async fn spawn_silent_udp() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while socket.recv_from(&mut buf).await.is_ok() {}
    });
    addr
}

#[derive(Clone, Copy)]
enum TcpBehavior {
    /// Answer each request as it arrives.
    Normal,
    /// Collect two requests, then write both replies in one segment.
    CoalesceTwo,
    /// Write each reply envelope in two fragments.
    Split,
}

fn envelope(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + frame.len());
    out.extend_from_slice(b"FINS");
    out.extend_from_slice(&(frame.len() as u32 + 8).to_be_bytes());
    out.extend_from_slice(&2u32.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(frame);
    out
}

/// Spawns a FINS/TCP PLC: performs the node-assignment handshake
/// (client node 11, server node 1), then serves requests per `behavior`.
async fn spawn_tcp_plc(behavior: TcpBehavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut handshake = [0u8; 20];
        stream.read_exact(&mut handshake).await.unwrap();
        assert_eq!(&handshake[0..4], b"FINS");

        let mut reply = [0u8; 24];
        reply[0..4].copy_from_slice(b"FINS");
        reply[4..8].copy_from_slice(&16u32.to_be_bytes());
        reply[8..12].copy_from_slice(&1u32.to_be_bytes());
        reply[19] = 11; // client node
        reply[23] = 1; // server node
        stream.write_all(&reply).await.unwrap();

        let mut batch = Vec::new();
        loop {
            let mut header = [0u8; 16];
            if stream.read_exact(&mut header).await.is_err() {
                return;
            }
            let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let mut frame = vec![0u8; length - 8];
            if stream.read_exact(&mut frame).await.is_err() {
                return;
            }

            // The handshake patches SA1/DA1: commands must arrive
            // addressed with the assigned nodes.
            assert_eq!(frame[7], 11, "SA1 should carry the assigned client node");
            assert_eq!(frame[4], 1, "DA1 should carry the server node");

            let Some(reply) = answer(&frame) else { continue };
            match behavior {
                TcpBehavior::Normal => {
                    stream.write_all(&envelope(&reply)).await.unwrap();
                }
                TcpBehavior::CoalesceTwo => {
                    batch.push(reply);
                    if batch.len() == 2 {
                        let mut combined = Vec::new();
                        for reply in batch.drain(..) {
                            combined.extend_from_slice(&envelope(&reply));
                        }
                        stream.write_all(&combined).await.unwrap();
                    }
                }
                TcpBehavior::Split => {
                    let bytes = envelope(&reply);
                    let (first, second) = bytes.split_at(10);
                    stream.write_all(first).await.unwrap();
                    stream.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    stream.write_all(second).await.unwrap();
                }
            }
        }
    });
    addr
}

#[tokio::test]
async fn udp_read_words() {
    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    let transaction = client.read("D0", 10, None, None).unwrap();
    assert_eq!(transaction.sid(), 1);
    let report = transaction.wait().await.unwrap();

    let response = report.response.unwrap();
    assert_eq!(response.end_code.code(), "0000");
    assert_eq!(response.command_name(), "read");
    match response.body {
        ResponseBody::Values(ResponseValues::Words(ref words)) => {
            assert_eq!(words.len(), 10);
            assert_eq!(words[0], 100);
            assert_eq!(words[9], 109);
        }
        ref other => panic!("unexpected body: {:?}", other),
    }
    assert!(report.sent);
    assert!(report.rtt_ms.is_some());
    assert_eq!(report.stats.replies, 1);

    // Exactly-once removal: the slot is gone once the reply delivered.
    assert_eq!(client.queue_count(), 0);
}

#[tokio::test]
async fn udp_read_bits() {
    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    let report = client
        .read("CIO50.3", 3, None, None)
        .unwrap()
        .wait()
        .await
        .unwrap();
    match report.response.unwrap().body {
        ResponseBody::Values(ResponseValues::Bits(ref bits)) => {
            assert_eq!(bits, &[true, false, true]);
        }
        ref other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn udp_write_fill_and_control() {
    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    let report = client
        .write("D200", WriteData::Words(vec![1, 2, 3]), None, None)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.response.unwrap().body, ResponseBody::Empty);

    let report = client
        .fill("D300", 0xBEEF, 16, None, None)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(report.response.unwrap().end_code.is_normal());

    let report = client
        .transfer("D0", "D100", 8, None, None)
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(report.response.unwrap().end_code.is_normal());

    let report = client.stop(None, None).unwrap().wait().await.unwrap();
    assert_eq!(report.response.unwrap().command_name(), "stop");
}

#[tokio::test]
async fn udp_status() {
    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    let report = client.status(None, None).unwrap().wait().await.unwrap();
    match report.response.unwrap().body {
        ResponseBody::Status(ref status) => {
            assert_eq!(status.status_text, "Run");
            assert_eq!(status.mode_text, "Monitor");
            assert!(status.fatal_errors.is_empty());
        }
        ref other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn udp_multi_read() {
    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    let report = client
        .read_multiple(&["D0", "CIO5.3"], None, None)
        .unwrap()
        .wait()
        .await
        .unwrap();
    match report.response.unwrap().body {
        ResponseBody::Multi(ref values) => {
            assert_eq!(values.len(), 2);
            assert_eq!(values[0].address.to_string(), "D0");
            assert_eq!(values[1].address.to_string(), "CIO5.3");
        }
        ref other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn generic_command_dispatch() {
    use fins_client::Param;

    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    let report = client
        .command(
            "0101",
            &[Param::Text("D0".into()), Param::Number(4)],
            None,
            Some("generic".into()),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.tag.as_deref(), Some("generic"));
    assert_eq!(report.response.unwrap().command_name(), "read");

    // Unknown code and bad parameter types are refused synchronously.
    assert!(matches!(
        client.command("9999", &[], None, None),
        Err(FinsError::InvalidParameter { .. })
    ));
    assert!(matches!(
        client.command("0101", &[Param::Number(1), Param::Number(2)], None, None),
        Err(FinsError::InvalidParameter { .. })
    ));
}

#[tokio::test]
async fn udp_timeout_expires_sequence() {
    let plc = spawn_silent_udp().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    let opts = RequestOptions {
        timeout: Some(Duration::from_millis(80)),
        ..RequestOptions::default()
    };
    let err = client
        .read("D0", 1, Some(opts), None)
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, FinsError::Timeout { sid: 1, .. }));

    assert_eq!(client.stats().timeouts, 1);
    assert_eq!(client.queue_count(), 0);
}

#[tokio::test]
async fn queue_full_refuses_submission() {
    let plc = spawn_silent_udp().await;
    let client = FinsClient::connect(
        "127.0.0.1",
        plc.port(),
        Options::default().with_max_queue(1),
    )
    .await
    .unwrap();
    let mut events = client.subscribe();

    let pending = client.read("D0", 1, None, None).unwrap();
    let err = client.read("D1", 1, None, None).unwrap_err();
    assert!(matches!(
        err,
        FinsError::QueueFull {
            active: 1,
            capacity: 1
        }
    ));
    // Admission failure leaves the queue untouched and emits `Full`.
    assert_eq!(client.queue_count(), 1);
    assert!(matches!(events.recv().await, Ok(FinsEvent::Full)));
    drop(pending);
}

#[tokio::test]
async fn sid_wraps_after_254_transactions() {
    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    for expected in 1..=254u8 {
        let transaction = client.read("D0", 1, None, None).unwrap();
        assert_eq!(transaction.sid(), expected);
        transaction.wait().await.unwrap();
    }

    // Slot 1 terminated long ago, so the wrap reuses it.
    let transaction = client.read("D0", 1, None, None).unwrap();
    assert_eq!(transaction.sid(), 1);
    transaction.wait().await.unwrap();
}

#[tokio::test]
async fn dropped_transaction_falls_back_to_broadcast() {
    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();
    let mut events = client.subscribe();

    // Fire-and-forget: drop the handle, the reply must arrive as an event.
    drop(client.read("D0", 2, None, Some("broadcast".into())).unwrap());

    match tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        FinsEvent::Reply(report) => {
            assert_eq!(report.tag.as_deref(), Some("broadcast"));
            assert!(report.response.is_some());
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn close_drops_pending_without_delivery() {
    let plc = spawn_silent_udp().await;
    let mut client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    let pending = client.read("D0", 1, None, None).unwrap();
    client.close().await;

    assert!(matches!(pending.wait().await, Err(FinsError::Closed)));
    assert_eq!(client.queue_count(), 0);
    assert!(matches!(
        client.read("D0", 1, None, None),
        Err(FinsError::Closed)
    ));
}

#[tokio::test]
async fn invalid_inputs_fail_synchronously() {
    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    assert!(matches!(
        client.read("Q100", 1, None, None),
        Err(FinsError::InvalidAddress { .. })
    ));
    assert!(matches!(
        client.read("D0", 0, None, None),
        Err(FinsError::InvalidParameter { .. })
    ));
    assert!(matches!(
        client.write("D0", WriteData::Bits(vec![true]), None, None),
        Err(FinsError::InvalidParameter { .. })
    ));
    assert!(matches!(
        client.fill("CIO0.1", 1, 1, None, None),
        Err(FinsError::InvalidParameter { .. })
    ));
    // Nothing was registered.
    assert_eq!(client.queue_count(), 0);
}

#[tokio::test]
async fn tcp_handshake_and_read() {
    let plc = spawn_tcp_plc(TcpBehavior::Normal).await;
    let client = FinsClient::connect(
        "127.0.0.1",
        plc.port(),
        Options::default().with_protocol(Protocol::Tcp),
    )
    .await
    .unwrap();

    let assignment = client.node_assignment().unwrap();
    assert_eq!(assignment.client_node, 11);
    assert_eq!(assignment.server_node, 1);

    let report = client
        .read("D0", 4, None, None)
        .unwrap()
        .wait()
        .await
        .unwrap();
    match report.response.unwrap().body {
        ResponseBody::Values(ResponseValues::Words(ref words)) => {
            assert_eq!(words, &[100, 101, 102, 103]);
        }
        ref other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn tcp_two_replies_in_one_segment() {
    let plc = spawn_tcp_plc(TcpBehavior::CoalesceTwo).await;
    let client = FinsClient::connect(
        "127.0.0.1",
        plc.port(),
        Options::default().with_protocol(Protocol::Tcp),
    )
    .await
    .unwrap();

    let a = client.read("D0", 1, None, Some("a".into())).unwrap();
    let b = client.read("D10", 2, None, Some("b".into())).unwrap();
    let (a, b) = tokio::join!(a.wait(), b.wait());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.tag.as_deref(), Some("a"));
    assert_eq!(b.tag.as_deref(), Some("b"));
    assert!(a.response.unwrap().end_code.is_normal());
    assert!(b.response.unwrap().end_code.is_normal());
    assert_eq!(client.queue_count(), 0);
}

#[tokio::test]
async fn tcp_reply_split_across_reads() {
    let plc = spawn_tcp_plc(TcpBehavior::Split).await;
    let client = FinsClient::connect(
        "127.0.0.1",
        plc.port(),
        Options::default().with_protocol(Protocol::Tcp),
    )
    .await
    .unwrap();

    let report = client
        .read("D0", 3, None, None)
        .unwrap()
        .wait()
        .await
        .unwrap();
    match report.response.unwrap().body {
        ResponseBody::Values(ResponseValues::Words(ref words)) => {
            assert_eq!(words, &[100, 101, 102]);
        }
        ref other => panic!("unexpected body: {:?}", other),
    }
}

#[tokio::test]
async fn request_tags_and_stats_ride_the_report() {
    let plc = spawn_udp_plc().await;
    let client = FinsClient::connect("127.0.0.1", plc.port(), Options::default())
        .await
        .unwrap();

    for _ in 0..5 {
        client
            .read("D0", 1, None, Some("poll".into()))
            .unwrap()
            .wait()
            .await
            .unwrap();
    }
    let stats = client.stats();
    assert_eq!(stats.replies, 5);
    assert_eq!(stats.errors, 0);
    assert!(stats.max_reply_ms >= stats.min_reply_ms);
    assert!(stats.average_reply_ms > 0.0);
}
