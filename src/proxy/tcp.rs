//! Per-route TCP listener pool.
//!
//! Each `tcp` route with a non-zero listen port gets a loopback listener
//! whose accepted connections are spliced to the upstream port. The
//! reconciler closes listeners whose route disappeared and opens listeners
//! for new routes; everything else is left running.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Route;

/// Timeout for dialing the upstream service.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

struct ListenerHandle {
    listen_port: u16,
    cancel: CancellationToken,
}

pub struct TcpProxyPool {
    /// The daemon's own HTTP/HTTPS ports; routes asking for them are skipped.
    reserved_ports: [u16; 2],
    listeners: Mutex<HashMap<String, ListenerHandle>>,
    cancel: CancellationToken,
}

impl TcpProxyPool {
    pub fn new(http_port: u16, https_port: u16, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            reserved_ports: [http_port, https_port],
            listeners: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    /// Open the listener for one route. No-op for non-`tcp` routes, routes
    /// without a listen port, and domains that already have a listener; bind
    /// failures are logged and skipped (the next reconcile retries).
    pub async fn ensure_route(&self, route: &Route) {
        if !route.is_tcp() {
            return;
        }
        if route.listen_port == 0 {
            debug!(domain = route.domain, "skipping tcp route without listen_port");
            return;
        }
        if self.reserved_ports.contains(&route.listen_port) {
            warn!(
                domain = route.domain,
                port = route.listen_port,
                "tcp route listen port collides with a proxy port, skipping"
            );
            return;
        }

        let key = route.domain.to_ascii_lowercase();
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&key) {
            return;
        }

        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, route.listen_port)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(
                    domain = route.domain,
                    port = route.listen_port,
                    error = %e,
                    "tcp listener bind failed"
                );
                return;
            }
        };

        info!(
            domain = route.domain,
            listen = route.listen_port,
            upstream = route.port,
            "tcp proxy listening"
        );

        let cancel = self.cancel.child_token();
        tokio::spawn(accept_loop(listener, route.port, cancel.clone()));
        listeners.insert(
            key,
            ListenerHandle {
                listen_port: route.listen_port,
                cancel,
            },
        );
    }

    /// Diff the pool against the latest route set: close listeners whose
    /// domain no longer has a `tcp` route, then open listeners for new ones.
    pub async fn reconcile(&self, routes: &[Route]) {
        let active: HashSet<String> = routes
            .iter()
            .filter(|r| r.is_tcp())
            .map(|r| r.domain.to_ascii_lowercase())
            .collect();

        {
            let mut listeners = self.listeners.lock().await;
            listeners.retain(|domain, handle| {
                if active.contains(domain) {
                    true
                } else {
                    handle.cancel.cancel();
                    info!(
                        domain = domain,
                        port = handle.listen_port,
                        "tcp listener stopped for removed route"
                    );
                    false
                }
            });
        }

        for route in routes.iter().filter(|r| r.is_tcp()) {
            self.ensure_route(route).await;
        }
    }

    /// Close every listener. Accept loops observe the cancellation and drop
    /// their sockets.
    pub async fn shutdown(&self) {
        let mut listeners = self.listeners.lock().await;
        for (_, handle) in listeners.drain() {
            handle.cancel.cancel();
        }
    }

    pub async fn has_listener(&self, domain: &str) -> bool {
        self.listeners
            .lock()
            .await
            .contains_key(&domain.to_ascii_lowercase())
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }
}

async fn accept_loop(listener: TcpListener, upstream_port: u16, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((conn, _peer)) => {
                        tokio::spawn(splice(conn, upstream_port));
                    }
                    Err(e) => {
                        debug!(error = %e, "tcp accept failed");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

/// Copy bytes both ways. Each direction half-closes its write side at EOF so
/// the peer observes end-of-input, and both directions finish before either
/// socket drops. Protocols where the client must signal end-of-input before
/// the server replies depend on this.
async fn splice(inbound: TcpStream, upstream_port: u16) {
    let upstream = match tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((Ipv4Addr::LOCALHOST, upstream_port)),
    )
    .await
    {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            info!(upstream = upstream_port, error = %e, "tcp upstream dial failed");
            return;
        }
        Err(_) => {
            info!(upstream = upstream_port, "tcp upstream dial timed out");
            return;
        }
    };

    let (mut client_read, mut client_write) = inbound.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let to_upstream = async {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    };
    let to_client = async {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };

    let _ = tokio::join!(to_upstream, to_client);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteKind;

    fn tcp_route(domain: &str, port: u16, listen_port: u16) -> Route {
        Route {
            domain: domain.to_string(),
            port,
            listen_port,
            kind: RouteKind::Tcp,
            tls: false,
            command: None,
            pid: None,
            log_file: None,
            created: None,
            id: None,
        }
    }

    #[tokio::test]
    async fn zero_listen_port_is_skipped() {
        let pool = TcpProxyPool::new(80, 443, CancellationToken::new());
        pool.ensure_route(&tcp_route("db.test", 5432, 0)).await;
        assert_eq!(pool.listener_count().await, 0);
    }

    #[tokio::test]
    async fn http_route_is_skipped() {
        let pool = TcpProxyPool::new(80, 443, CancellationToken::new());
        let mut route = tcp_route("app.test", 3000, 13000);
        route.kind = RouteKind::Http;
        pool.ensure_route(&route).await;
        assert_eq!(pool.listener_count().await, 0);
    }

    #[tokio::test]
    async fn proxy_port_collision_is_skipped() {
        let pool = TcpProxyPool::new(18080, 18443, CancellationToken::new());
        pool.ensure_route(&tcp_route("db.test", 5432, 18080)).await;
        assert_eq!(pool.listener_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_domain_is_idempotent() {
        let pool = TcpProxyPool::new(80, 443, CancellationToken::new());

        // Grab an ephemeral port for the listener.
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let route = tcp_route("db.test", 5432, port);
        pool.ensure_route(&route).await;
        pool.ensure_route(&route).await;
        assert_eq!(pool.listener_count().await, 1);
        assert!(pool.has_listener("DB.TEST").await);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_removes_stale_listeners() {
        let pool = TcpProxyPool::new(80, 443, CancellationToken::new());

        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        pool.reconcile(&[tcp_route("db.test", 5432, port)]).await;
        assert!(pool.has_listener("db.test").await);

        pool.reconcile(&[]).await;
        assert!(!pool.has_listener("db.test").await);
        assert_eq!(pool.listener_count().await, 0);
    }

    #[tokio::test]
    async fn repeated_reconcile_is_stable() {
        let pool = TcpProxyPool::new(80, 443, CancellationToken::new());

        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let routes = vec![tcp_route("db.test", 5432, port)];
        pool.reconcile(&routes).await;
        pool.reconcile(&routes).await;
        pool.reconcile(&routes).await;
        assert_eq!(pool.listener_count().await, 1);
        pool.shutdown().await;
    }
}
