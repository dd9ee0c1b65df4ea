//! WebSocket relay.
//!
//! Upgrades are never forwarded through the generic proxy transport: pushing
//! compressed frames through it corrupts them (RSV1 mis-clearing). Instead
//! the protocol is terminated on both sides — the client handshake is
//! completed here with no extensions offered, and the upstream is dialed as
//! a fresh WebSocket client that never sees the client's compression offer.
//! Two pumps copy messages between the halves; the first failure tears both
//! connections down.

use std::net::SocketAddr;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::Request as WsRequest;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::proxy::http::{empty_body, full_body, BoxBody};

/// Accept the client's upgrade and splice it to a fresh upstream WebSocket
/// connection. Returns the 101 response; the relay itself runs detached.
pub async fn relay(
    mut req: Request<Incoming>,
    upstream_port: u16,
    host: String,
    remote: SocketAddr,
    cancel: CancellationToken,
) -> Response<BoxBody> {
    let Some(key) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|k| k.as_bytes().to_vec())
    else {
        let mut resp = Response::new(full_body("missing Sec-WebSocket-Key"));
        *resp.status_mut() = StatusCode::BAD_REQUEST;
        return resp;
    };
    let accept = derive_accept_key(&key);

    let path_q = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| remote.to_string());

    let on_upgrade = hyper::upgrade::on(&mut req);

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(u) => u,
            Err(e) => {
                info!(host = host, error = %e, "websocket client upgrade failed");
                return;
            }
        };
        let client_ws =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

        // The upstream handshake request carries only Host and the
        // forwarding headers; in particular the client's
        // Sec-WebSocket-Extensions never propagates.
        let upstream = match dial_upstream(upstream_port, &path_q, &host, &forwarded_for).await {
            Ok(ws) => ws,
            Err(e) => {
                // Dropping client_ws closes the accepted connection.
                info!(host = host, upstream = upstream_port, error = %e,
                      "websocket upstream dial failed");
                return;
            }
        };

        debug!(host = host, upstream = upstream_port, "websocket relay established");

        let (mut client_tx, mut client_rx) = client_ws.split();
        let (mut upstream_tx, mut upstream_rx) = upstream.split();

        tokio::select! {
            result = pump(&mut client_rx, &mut upstream_tx) => {
                if let Err(e) = result {
                    debug!(host = host, error = %e, "client-to-upstream pump ended");
                }
            }
            result = pump(&mut upstream_rx, &mut client_tx) => {
                if let Err(e) = result {
                    debug!(host = host, error = %e, "upstream-to-client pump ended");
                }
            }
            _ = cancel.cancelled() => {
                debug!(host = host, "websocket relay cancelled by shutdown");
            }
        }
        // Both halves drop here, closing both connections.
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, HeaderValue::from_static("Upgrade"))
        .header(UPGRADE, HeaderValue::from_static("websocket"))
        .header("sec-websocket-accept", accept)
        .body(empty_body())
        .unwrap_or_else(|_| {
            let mut resp = Response::new(empty_body());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
}

/// Fresh WebSocket client handshake against the upstream.
async fn dial_upstream(
    port: u16,
    path_q: &str,
    host: &str,
    forwarded_for: &str,
) -> Result<WebSocketStream<TcpStream>, WsError> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;

    let uri = format!("ws://127.0.0.1:{port}{path_q}");
    let request = WsRequest::builder()
        .uri(&uri)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header("X-Forwarded-Host", host)
        .header("X-Forwarded-For", forwarded_for)
        .body(())
        .map_err(|e| WsError::Io(std::io::Error::other(e)))?;

    let (ws, _response) = tokio_tungstenite::client_async(request, stream).await?;
    Ok(ws)
}

/// Copy messages from `src` to `dst` until either side errors or closes.
/// Message type is preserved verbatim (text, binary, ping, pong, close).
async fn pump<S, D>(src: &mut S, dst: &mut D) -> Result<(), WsError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    D: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(msg) = src.next().await {
        dst.send(msg?).await?;
    }
    Ok(())
}
