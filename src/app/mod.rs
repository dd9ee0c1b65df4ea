pub mod cert;
pub mod watcher;

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{self, load_routes, DaemonState, Paths, Settings};
use crate::dns::{self, DnsServer};
use crate::proxy::{self, HttpProxy, RouteTable, TcpProxyPool};

use watcher::RouteWatcher;

/// The daemon: DNS responder, HTTP/HTTPS reverse proxy, TCP listener pool,
/// and the route watcher that keeps them fed, torn down together on signal.
pub struct App {
    settings: Settings,
    paths: Paths,
}

impl App {
    pub fn new(settings: Settings, paths: Paths) -> Self {
        Self { settings, paths }
    }

    pub async fn run(self) -> Result<()> {
        let Self { settings, paths } = self;

        std::fs::create_dir_all(&paths.config_dir)
            .with_context(|| format!("create {}", paths.config_dir.display()))?;
        std::fs::create_dir_all(&paths.logs_dir)
            .with_context(|| format!("create {}", paths.logs_dir.display()))?;

        let table = Arc::new(RouteTable::new());
        let routes = match load_routes(&paths.routes_file) {
            Ok(routes) => routes,
            Err(e) => {
                warn!(error = %e, "failed to load routes, starting with none");
                Vec::new()
            }
        };
        table.replace(routes.clone());

        let cancel = CancellationToken::new();
        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(4);

        // DNS: degraded on failure (the port may be taken by a system
        // resolver), the HTTP side keeps working.
        let upstream = dns::upstream::discover();
        let mut dns_enabled = true;
        let dns_server =
            match DnsServer::start(settings.dns_port, upstream, cancel.child_token()).await {
                Ok(server) => Some(server),
                Err(e) => {
                    warn!(error = %e, "DNS server failed to start, continuing without DNS");
                    dns_enabled = false;
                    None
                }
            };

        // HTTP: the one bind the daemon cannot live without.
        let proxy = Arc::new(HttpProxy::new(table.clone()));
        let http_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, settings.http_port))
            .await
            .with_context(|| format!("bind http port {}", settings.http_port))?;
        info!(addr = %http_listener.local_addr()?, "proxy listening");

        let mut server_tasks = Vec::new();
        server_tasks.push(tokio::spawn(proxy::http::serve(
            http_listener,
            proxy.clone(),
            cancel.child_token(),
            err_tx.clone(),
        )));

        // HTTPS: degraded on any failure, with the TLS flag cleared so
        // status tooling can see the daemon fell back to plain HTTP.
        let mut tls_enabled = settings.tls;
        if tls_enabled {
            let acceptor = cert::ensure_material(&paths.certs_dir)
                .and_then(|m| proxy::tls::build_acceptor(&m.server_cert, &m.server_key));
            match acceptor {
                Ok(acceptor) => {
                    match TcpListener::bind((Ipv4Addr::LOCALHOST, settings.https_port)).await {
                        Ok(listener) => {
                            info!(addr = %listener.local_addr()?, "proxy listening (tls)");
                            server_tasks.push(tokio::spawn(proxy::http::serve_tls(
                                listener,
                                acceptor,
                                proxy.clone(),
                                cancel.child_token(),
                                err_tx.clone(),
                            )));
                        }
                        Err(e) => {
                            warn!(port = settings.https_port, error = %e,
                                  "https bind failed, continuing without TLS");
                            tls_enabled = false;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "TLS setup failed, continuing without TLS");
                    tls_enabled = false;
                }
            }
        }

        // TCP listeners for the routes present at startup.
        let pool = TcpProxyPool::new(
            settings.http_port,
            settings.https_port,
            cancel.child_token(),
        );
        pool.reconcile(&routes).await;

        let watcher = RouteWatcher::new(
            paths.routes_file.clone(),
            table.clone(),
            pool.clone(),
            cancel.child_token(),
        );
        let watcher_task = tokio::spawn(watcher.run());

        config::state::write_pid_file(&paths.config_dir)?;
        config::state::write_state(
            &paths.config_dir,
            &DaemonState {
                pid: std::process::id(),
                http_port: settings.http_port,
                https_port: settings.https_port,
                dns_port: settings.dns_port,
                tls: tls_enabled,
                dns: dns_enabled,
            },
        )?;

        info!("devmux running");

        // Park until a signal arrives. Accept-loop errors funneled through
        // the channel are logged but do not bring the daemon down.
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("install SIGTERM handler")?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                Some(e) = err_rx.recv() => {
                    error!(error = %e, "listener error");
                }
            }
        }

        // Shutdown: cancel everything, let the HTTP loops drain in-flight
        // requests (bounded inside serve), then clean up the descriptors.
        cancel.cancel();
        pool.shutdown().await;
        if let Some(dns_server) = &dns_server {
            dns_server.stop();
        }
        for task in server_tasks {
            let _ = task.await;
        }
        let _ = watcher_task.await;

        config::state::remove_pid_file(&paths.config_dir);
        config::state::remove_state(&paths.config_dir);
        info!("shutdown complete");
        Ok(())
    }
}
