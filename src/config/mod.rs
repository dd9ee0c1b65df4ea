pub mod routes;
pub mod state;

use std::path::{Path, PathBuf};

use crate::common::Error;

pub use routes::{load_routes, Route, RouteKind};
pub use state::DaemonState;

/// Shipped default ports. HTTP/HTTPS match the well-known ports so browsers
/// need no port suffix; DNS defaults to a high unprivileged port so the
/// daemon can run without clobbering a system resolver.
pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;
pub const DEFAULT_DNS_PORT: u16 = 1299;

/// On-disk layout of everything the daemon persists.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub routes_file: PathBuf,
    pub certs_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Paths {
    /// Layout rooted at `$HOME/.config/devmux`.
    pub fn resolve() -> Result<Self, Error> {
        let home = std::env::var("HOME")
            .map_err(|_| Error::Config("HOME is not set".to_string()))?;
        Ok(Self::from_base(Path::new(&home).join(".config").join("devmux")))
    }

    /// Layout rooted at an explicit base directory (`--dir`, tests).
    pub fn from_base(base: impl Into<PathBuf>) -> Self {
        let config_dir = base.into();
        Self {
            routes_file: config_dir.join("routes.json"),
            certs_dir: config_dir.join("certs"),
            logs_dir: config_dir.join("logs"),
            config_dir,
        }
    }
}

/// Daemon settings, fixed for the process lifetime. Listen ports are not
/// hot-reloadable; only the route table changes while running.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_port: u16,
    pub https_port: u16,
    pub dns_port: u16,
    pub tls: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
            dns_port: DEFAULT_DNS_PORT,
            tls: false,
        }
    }
}
