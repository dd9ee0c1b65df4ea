//! DNS responder: authoritative for the reserved label, forwarding for
//! everything else.
//!
//! One UDP socket and one TCP listener share the same dispatch: queries whose
//! first question falls under `.test` get a synthesized loopback answer;
//! anything else is relayed verbatim to the upstream resolver over the same
//! transport it arrived on, with failures mapped to SERVFAIL.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::Error;
use crate::dns::wire;

/// Timeout for one upstream exchange (either transport).
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest message either transport can carry.
const MAX_MESSAGE: usize = 65_535;

pub struct DnsServer {
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    cancel: CancellationToken,
}

impl DnsServer {
    /// Bind both sockets on loopback and start serving. If either bind
    /// fails the other is released and a composite error is returned; after
    /// that, a loop error only ends its own task.
    pub async fn start(
        port: u16,
        upstream: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let (udp, tcp) = tokio::join!(UdpSocket::bind(bind_addr), TcpListener::bind(bind_addr));
        let (udp, tcp) = match (udp, tcp) {
            (Ok(udp), Ok(tcp)) => (udp, tcp),
            (udp, tcp) => {
                let mut errs = Vec::new();
                if let Err(e) = udp {
                    errs.push(format!("udp: {e}"));
                }
                if let Err(e) = tcp {
                    errs.push(format!("tcp: {e}"));
                }
                return Err(Error::Dns(format!(
                    "dns server startup failed: {}",
                    errs.join("; ")
                )));
            }
        };

        let udp_addr = udp.local_addr()?;
        let tcp_addr = tcp.local_addr()?;

        info!(addr = %udp_addr, upstream = %upstream, "dns listening");

        let udp = Arc::new(udp);
        tokio::spawn(udp_loop(udp, upstream, cancel.child_token()));
        tokio::spawn(tcp_loop(tcp, upstream, cancel.child_token()));

        Ok(Self {
            udp_addr,
            tcp_addr,
            cancel,
        })
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Answer locally when the first question is under the reserved label.
/// Returns `None` when the query should be forwarded instead.
fn answer_locally(data: &[u8]) -> Option<Vec<u8>> {
    let parsed = wire::parse_query(data)?;
    let first = parsed.questions.first()?;
    if !wire::is_reserved(&first.name) {
        return None;
    }
    Some(wire::build_loopback_reply(data, &parsed, Ipv4Addr::LOCALHOST))
}

async fn udp_loop(socket: Arc<UdpSocket>, upstream: SocketAddr, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_MESSAGE];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (n, peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "dns udp recv failed");
                        return;
                    }
                };

                let query = buf[..n].to_vec();
                let socket = socket.clone();
                tokio::spawn(async move {
                    let reply = match answer_locally(&query) {
                        Some(reply) => reply,
                        None => forward_udp(&query, upstream).await,
                    };
                    let _ = socket.send_to(&reply, peer).await;
                });
            }
            _ = cancel.cancelled() => {
                debug!("dns udp loop shutting down");
                return;
            }
        }
    }
}

async fn tcp_loop(listener: TcpListener, upstream: SocketAddr, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _peer) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        debug!(error = %e, "dns tcp accept failed");
                        return;
                    }
                };
                tokio::spawn(async move {
                    let _ = serve_tcp_conn(stream, upstream).await;
                });
            }
            _ = cancel.cancelled() => {
                debug!("dns tcp loop shutting down");
                return;
            }
        }
    }
}

/// Serve length-prefixed queries on one TCP connection until the client
/// closes it.
async fn serve_tcp_conn(mut stream: TcpStream, upstream: SocketAddr) -> std::io::Result<()> {
    loop {
        let len = match stream.read_u16().await {
            Ok(len) => len as usize,
            Err(_) => return Ok(()), // client closed
        };
        let mut query = vec![0u8; len];
        stream.read_exact(&mut query).await?;

        let reply = match answer_locally(&query) {
            Some(reply) => reply,
            None => forward_tcp(&query, upstream).await,
        };

        stream.write_u16(reply.len() as u16).await?;
        stream.write_all(&reply).await?;
    }
}

/// Relay a query to the upstream over UDP; SERVFAIL on any failure. Upstream
/// trouble is expected during network flakiness, so it only logs at debug.
async fn forward_udp(query: &[u8], upstream: SocketAddr) -> Vec<u8> {
    let exchange = async {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.connect(upstream).await?;
        socket.send(query).await?;
        let mut buf = vec![0u8; MAX_MESSAGE];
        let n = socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok::<Vec<u8>, std::io::Error>(buf)
    };

    match tokio::time::timeout(UPSTREAM_TIMEOUT, exchange).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            debug!(error = %e, "dns upstream udp exchange failed");
            wire::build_servfail(query).unwrap_or_default()
        }
        Err(_) => {
            debug!("dns upstream udp exchange timed out");
            wire::build_servfail(query).unwrap_or_default()
        }
    }
}

/// Relay a query to the upstream over TCP with the standard length prefix.
async fn forward_tcp(query: &[u8], upstream: SocketAddr) -> Vec<u8> {
    let exchange = async {
        let mut stream = TcpStream::connect(upstream).await?;
        stream.write_u16(query.len() as u16).await?;
        stream.write_all(query).await?;
        let len = stream.read_u16().await? as usize;
        let mut reply = vec![0u8; len];
        stream.read_exact(&mut reply).await?;
        Ok::<Vec<u8>, std::io::Error>(reply)
    };

    match tokio::time::timeout(UPSTREAM_TIMEOUT, exchange).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            debug!(error = %e, "dns upstream tcp exchange failed");
            wire::build_servfail(query).unwrap_or_default()
        }
        Err(_) => {
            debug!("dns upstream tcp exchange timed out");
            wire::build_servfail(query).unwrap_or_default()
        }
    }
}
