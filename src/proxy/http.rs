//! Host-dispatched HTTP reverse proxy.
//!
//! One handler serves both the plain and the TLS listener: look the Host
//! header up in the route table, forward non-upgrade requests to the
//! upstream with streaming bodies, hand WebSocket upgrades to the relay, and
//! render the route listing for unknown hosts.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody as HttpBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Route;
use crate::proxy::table::RouteTable;
use crate::proxy::ws;

pub type BoxBody = HttpBoxBody<Bytes, hyper::Error>;

/// Deadline for draining in-flight requests at shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that are connection-scoped and must not travel to the upstream.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn empty_body() -> BoxBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full_body<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub struct HttpProxy {
    table: Arc<RouteTable>,
    client: Client<HttpConnector, BoxBody>,
}

impl HttpProxy {
    pub fn new(table: Arc<RouteTable>) -> Self {
        // Dev upstreams restart constantly; never pool, dial fresh per request.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build_http();
        Self { table, client }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        remote: SocketAddr,
        cancel: CancellationToken,
    ) -> Response<BoxBody> {
        let host = request_host(&req);

        let Some(route) = self.table.find_http(&host) else {
            return self.not_found(&host);
        };

        if is_websocket_upgrade(&req) {
            return ws::relay(req, route.port, host, remote, cancel).await;
        }

        self.forward(req, &route, &host, remote).await
    }

    /// Forward a non-upgrade request, streaming both bodies. Chunked
    /// transfer and trailers ride along inside the hyper body.
    async fn forward(
        &self,
        req: Request<Incoming>,
        route: &Route,
        host: &str,
        remote: SocketAddr,
    ) -> Response<BoxBody> {
        let (mut parts, body) = req.into_parts();

        let path_q = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let upstream_url = format!("http://127.0.0.1:{}{}", route.port, path_q);
        parts.uri = match upstream_url.parse::<Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                debug!(url = upstream_url, error = %e, "bad upstream uri");
                return status_response(StatusCode::BAD_REQUEST, "devmux: bad request target");
            }
        };

        for name in HOP_BY_HOP {
            parts.headers.remove(*name);
        }
        if let Ok(value) = HeaderValue::from_str(host) {
            parts.headers.insert("x-forwarded-host", value);
        }
        if !parts.headers.contains_key("x-forwarded-for") {
            if let Ok(value) = HeaderValue::from_str(&remote.to_string()) {
                parts.headers.insert("x-forwarded-for", value);
            }
        }

        let outbound = Request::from_parts(parts, body.boxed());

        match self.client.request(outbound).await {
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                for name in HOP_BY_HOP {
                    parts.headers.remove(*name);
                }
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                info!(host = host, upstream = route.port, error = %e, "upstream unreachable");
                status_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("devmux: upstream unreachable ({e})"),
                )
            }
        }
    }

    /// 404 page listing every registered route.
    fn not_found(&self, host: &str) -> Response<BoxBody> {
        let routes = self.table.snapshot();
        let page = render_not_found(host, &routes);
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header("content-type", "text/html; charset=utf-8")
            .body(full_body(page))
            .unwrap_or_else(|_| status_response(StatusCode::NOT_FOUND, "not found"))
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(message.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Host header with any `:port` suffix stripped. Case is preserved: the
/// route lookup compares case-insensitively, and forwarded headers must
/// carry the host exactly as the client sent it.
fn request_host(req: &Request<Incoming>) -> String {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or("");
    raw.split(':').next().unwrap_or(raw).to_string()
}

/// An upgrade request must carry `Upgrade: websocket` and a `Connection`
/// header with the `upgrade` token, both case-insensitive.
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let upgrade_ws = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    let connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });

    upgrade_ws && connection_upgrade
}

// ─── Accept loops ──────────────────────────────────────────────────────────

/// Serve plain HTTP until cancelled, then drain in-flight connections.
pub async fn serve(
    listener: TcpListener,
    proxy: Arc<HttpProxy>,
    cancel: CancellationToken,
    errors: mpsc::Sender<anyhow::Error>,
) {
    let mut conns = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, remote)) => {
                        let proxy = proxy.clone();
                        let cancel = cancel.clone();
                        conns.spawn(async move {
                            serve_connection(TokioIo::new(stream), remote, proxy, cancel).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http accept failed");
                        let _ = errors.try_send(anyhow::anyhow!("http accept failed: {e}"));
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            _ = cancel.cancelled() => break,
        }
    }

    drain(conns).await;
}

/// Serve HTTPS: same handler behind a TLS handshake.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    proxy: Arc<HttpProxy>,
    cancel: CancellationToken,
    errors: mpsc::Sender<anyhow::Error>,
) {
    let mut conns = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, remote)) => {
                        let acceptor = acceptor.clone();
                        let proxy = proxy.clone();
                        let cancel = cancel.clone();
                        conns.spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(e) => {
                                    debug!(remote = %remote, error = %e, "tls handshake failed");
                                    return;
                                }
                            };
                            serve_connection(TokioIo::new(tls_stream), remote, proxy, cancel).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "https accept failed");
                        let _ = errors.try_send(anyhow::anyhow!("https accept failed: {e}"));
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            Some(_) = conns.join_next(), if !conns.is_empty() => {}
            _ = cancel.cancelled() => break,
        }
    }

    drain(conns).await;
}

async fn serve_connection<I>(
    io: TokioIo<I>,
    remote: SocketAddr,
    proxy: Arc<HttpProxy>,
    cancel: CancellationToken,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let cancel_for_service = cancel.clone();
    let service = service_fn(move |req| {
        let proxy = proxy.clone();
        let cancel = cancel_for_service.clone();
        async move { Ok::<_, Infallible>(proxy.handle(req, remote, cancel).await) }
    });

    let conn = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(remote = %remote, error = %e, "connection ended with error");
            }
        }
        _ = cancel.cancelled() => {
            // Stop taking new requests on this connection; let the one in
            // flight finish. The listener's drain bounds the total wait.
            conn.as_mut().graceful_shutdown();
            let _ = conn.as_mut().await;
        }
    }
}

/// Wait for in-flight connections up to the shutdown deadline, then abort.
async fn drain(mut conns: JoinSet<()>) {
    if conns.is_empty() {
        return;
    }
    let deadline = tokio::time::sleep(SHUTDOWN_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            next = conns.join_next() => {
                if next.is_none() {
                    return;
                }
            }
            _ = &mut deadline => {
                warn!(remaining = conns.len(), "shutdown deadline reached, closing connections");
                conns.abort_all();
                return;
            }
        }
    }
}

// ─── Not-found page ────────────────────────────────────────────────────────

fn render_not_found(host: &str, routes: &[Route]) -> String {
    let mut rows = String::new();
    if routes.is_empty() {
        rows.push_str(r#"    <div class="empty">no routes configured</div>"#);
        rows.push('\n');
    } else {
        for route in routes {
            let domain = html_escape(&route.domain);
            if route.is_tcp() {
                rows.push_str(&format!(
                    "    <div class=\"route\"><span>{domain}<span class=\"tag\">tcp</span></span>\
                     <span class=\"port\">:{} &rarr; :{}</span></div>\n",
                    route.listen_port, route.port
                ));
            } else {
                rows.push_str(&format!(
                    "    <div class=\"route\"><span><a href=\"http://{domain}\">{domain}</a></span>\
                     <span class=\"port\">:{}</span></div>\n",
                    route.port
                ));
            }
        }
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>devmux - not found</title>
<style>
  * {{ margin: 0; padding: 0; box-sizing: border-box; }}
  body {{ background: #0d1117; color: #c9d1d9; font-family: 'SF Mono', 'Cascadia Code', 'Fira Code', monospace; display: flex; justify-content: center; padding: 60px 20px; min-height: 100vh; }}
  .container {{ max-width: 600px; width: 100%; }}
  h1 {{ font-size: 1.4rem; color: #f85149; margin-bottom: 6px; }}
  .sub {{ color: #8b949e; font-size: 0.85rem; margin-bottom: 32px; }}
  h2 {{ font-size: 0.9rem; color: #8b949e; text-transform: uppercase; letter-spacing: 0.05em; margin-bottom: 12px; }}
  .routes {{ border: 1px solid #21262d; border-radius: 6px; overflow: hidden; }}
  .route {{ display: flex; justify-content: space-between; align-items: center; padding: 10px 14px; border-bottom: 1px solid #21262d; }}
  .route:last-child {{ border-bottom: none; }}
  .route a {{ color: #58a6ff; text-decoration: none; }}
  .route a:hover {{ text-decoration: underline; }}
  .port {{ color: #8b949e; font-size: 0.85rem; }}
  .tag {{ font-size: 0.7rem; color: #8b949e; background: #21262d; padding: 2px 6px; border-radius: 3px; margin-left: 8px; }}
  .empty {{ padding: 20px 14px; color: #8b949e; text-align: center; }}
</style>
</head>
<body>
<div class="container">
  <h1>not found</h1>
  <p class="sub">no route configured for <strong>{host}</strong></p>
  <h2>available routes</h2>
  <div class="routes">
{rows}  </div>
</div>
</body>
</html>"#,
        host = html_escape(host),
        rows = rows,
    )
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
