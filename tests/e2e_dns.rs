//! DNS responder tests over both transports: authoritative loopback answers
//! for the reserved label, verbatim forwarding for everything else, and
//! SERVFAIL when the upstream is unreachable.

use std::net::SocketAddr;
use std::time::Duration;

use devmux::dns::DnsServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;

fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(&0u16.to_be_bytes());
    data.extend_from_slice(&0u16.to_be_bytes());
    data.extend_from_slice(&0u16.to_be_bytes());
    for label in name.split('.') {
        data.push(label.len() as u8);
        data.extend_from_slice(label.as_bytes());
    }
    data.push(0x00);
    data.extend_from_slice(&qtype.to_be_bytes());
    data.extend_from_slice(&1u16.to_be_bytes()); // IN
    data
}

fn header_field(reply: &[u8], index: usize) -> u16 {
    u16::from_be_bytes([reply[index], reply[index + 1]])
}

/// End of the single question in a reply built from `build_query`.
fn question_end(name: &str) -> usize {
    12 + name.split('.').map(|l| l.len() + 1).sum::<usize>() + 1 + 4
}

/// Fake upstream resolver: echoes the query with QR set and a marker
/// appended, so forwarded replies are recognizable byte-for-byte.
async fn spawn_fake_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let mut reply = buf[..n].to_vec();
            reply[2] |= 0x80;
            reply.extend_from_slice(b"UPSTREAM");
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    addr
}

async fn udp_exchange(server: SocketAddr, query: &[u8]) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(query, server).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(10), socket.recv_from(&mut buf))
        .await
        .expect("reply within deadline")
        .unwrap();
    buf.truncate(n);
    buf
}

async fn tcp_exchange(server: SocketAddr, query: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(server).await.unwrap();
    stream.write_u16(query.len() as u16).await.unwrap();
    stream.write_all(query).await.unwrap();
    let len = tokio::time::timeout(Duration::from_secs(10), stream.read_u16())
        .await
        .expect("reply within deadline")
        .unwrap() as usize;
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn reserved_a_query_is_answered_with_loopback() {
    let upstream = spawn_fake_upstream().await;
    let server = DnsServer::start(0, upstream, CancellationToken::new())
        .await
        .unwrap();

    let query = build_query(0x4242, "foo.test", QTYPE_A);
    let reply = udp_exchange(server.udp_addr(), &query).await;

    assert_eq!(header_field(&reply, 0), 0x4242, "id preserved");
    let flags = header_field(&reply, 2);
    assert_eq!(flags & 0x8000, 0x8000, "QR set");
    assert_eq!(flags & 0x0400, 0x0400, "authoritative bit set");
    assert_eq!(flags & 0x000F, 0, "NOERROR");
    assert_eq!(header_field(&reply, 6), 1, "one answer");

    let ans = question_end("foo.test");
    assert_eq!(header_field(&reply, ans), 0xC00C, "name pointer");
    assert_eq!(header_field(&reply, ans + 2), QTYPE_A);
    assert_eq!(
        u32::from_be_bytes([reply[ans + 6], reply[ans + 7], reply[ans + 8], reply[ans + 9]]),
        60,
        "TTL 60"
    );
    assert_eq!(&reply[ans + 12..ans + 16], &[127, 0, 0, 1]);

    server.stop();
}

#[tokio::test]
async fn reserved_aaaa_query_is_empty_noerror() {
    let upstream = spawn_fake_upstream().await;
    let server = DnsServer::start(0, upstream, CancellationToken::new())
        .await
        .unwrap();

    let query = build_query(7, "foo.test", QTYPE_AAAA);
    let reply = udp_exchange(server.udp_addr(), &query).await;

    let flags = header_field(&reply, 2);
    assert_eq!(flags & 0x000F, 0, "NOERROR");
    assert_eq!(header_field(&reply, 6), 0, "no answers for AAAA");

    server.stop();
}

#[tokio::test]
async fn non_reserved_query_is_forwarded_verbatim() {
    let upstream = spawn_fake_upstream().await;
    let server = DnsServer::start(0, upstream, CancellationToken::new())
        .await
        .unwrap();

    let query = build_query(0x1111, "example.com", QTYPE_A);
    let reply = udp_exchange(server.udp_addr(), &query).await;

    let mut expected = query.clone();
    expected[2] |= 0x80;
    expected.extend_from_slice(b"UPSTREAM");
    assert_eq!(reply, expected, "daemon reply must equal the upstream's");

    server.stop();
}

#[tokio::test]
async fn dead_upstream_yields_servfail() {
    // A UDP port with nothing behind it.
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dead = probe.local_addr().unwrap();
    drop(probe);

    let server = DnsServer::start(0, dead, CancellationToken::new())
        .await
        .unwrap();

    let query = build_query(0x2222, "example.com", QTYPE_A);
    let reply = udp_exchange(server.udp_addr(), &query).await;

    assert_eq!(header_field(&reply, 0), 0x2222);
    assert_eq!(header_field(&reply, 2) & 0x000F, 2, "SERVFAIL");
    assert_eq!(header_field(&reply, 6), 0, "no answers");

    server.stop();
}

#[tokio::test]
async fn reserved_query_over_tcp() {
    let upstream = spawn_fake_upstream().await;
    let server = DnsServer::start(0, upstream, CancellationToken::new())
        .await
        .unwrap();

    let query = build_query(0x5151, "svc.test", QTYPE_A);
    let reply = tcp_exchange(server.tcp_addr(), &query).await;

    assert_eq!(header_field(&reply, 0), 0x5151);
    assert_eq!(header_field(&reply, 2) & 0x0400, 0x0400, "authoritative");
    assert_eq!(header_field(&reply, 6), 1);
    let ans = question_end("svc.test");
    assert_eq!(&reply[ans + 12..ans + 16], &[127, 0, 0, 1]);

    server.stop();
}

#[tokio::test]
async fn tcp_forward_without_tcp_upstream_yields_servfail() {
    // The fake upstream only speaks UDP, so TCP forwarding gets a refused
    // connection and the client a SERVFAIL.
    let upstream = spawn_fake_upstream().await;
    let server = DnsServer::start(0, upstream, CancellationToken::new())
        .await
        .unwrap();

    let query = build_query(0x6161, "example.com", QTYPE_A);
    let reply = tcp_exchange(server.tcp_addr(), &query).await;

    assert_eq!(header_field(&reply, 0), 0x6161);
    assert_eq!(header_field(&reply, 2) & 0x000F, 2, "SERVFAIL");

    server.stop();
}

#[tokio::test]
async fn stop_closes_the_listeners() {
    let upstream = spawn_fake_upstream().await;
    let server = DnsServer::start(0, upstream, CancellationToken::new())
        .await
        .unwrap();
    let tcp_addr = server.tcp_addr();

    // Sanity: reachable before stop.
    assert!(TcpStream::connect(tcp_addr).await.is_ok());

    server.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(
        TcpStream::connect(tcp_addr).await.is_err(),
        "tcp listener should be closed after stop"
    );
}
