//! Route file watcher and reconciler.
//!
//! Polls the route file's modification time instead of using filesystem
//! events so that atomic-write-by-rename from the external writer is picked
//! up without racing a half-written file. On change the table snapshot is
//! swapped first, then the TCP pool is diffed against the new set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::load_routes;
use crate::proxy::{RouteTable, TcpProxyPool};

/// How often the route file is checked for changes.
pub const ROUTE_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct RouteWatcher {
    path: PathBuf,
    table: Arc<RouteTable>,
    pool: Arc<TcpProxyPool>,
    cancel: CancellationToken,
}

impl RouteWatcher {
    pub fn new(
        path: PathBuf,
        table: Arc<RouteTable>,
        pool: Arc<TcpProxyPool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            path,
            table,
            pool,
            cancel,
        }
    }

    pub async fn run(self) {
        let mut last_mod: Option<SystemTime> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(ROUTE_POLL_INTERVAL) => {}
                _ = self.cancel.cancelled() => return,
            }

            // A briefly missing file is the rename window of an atomic
            // writer; skip silently and catch it next tick.
            let Ok(metadata) = std::fs::metadata(&self.path) else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };

            if last_mod.is_some_and(|seen| modified <= seen) {
                continue;
            }
            last_mod = Some(modified);

            let routes = match load_routes(&self.path) {
                Ok(routes) => routes,
                Err(e) => {
                    warn!(error = %e, "route file reload failed, keeping previous routes");
                    continue;
                }
            };

            debug!(count = routes.len(), "routes reloaded");
            self.table.replace(routes.clone());
            self.pool.reconcile(&routes).await;
        }
    }
}
