//! Upstream resolver discovery, run once at daemon startup.
//!
//! macOS publishes resolvers through configd (`scutil --dns`); Linux keeps
//! them in `/etc/resolv.conf`. Either way the first non-loopback nameserver
//! wins, and every failure falls through to the public fallback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::debug;

/// Public anycast fallback when discovery finds nothing usable.
pub fn fallback_upstream() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53))
}

/// Discover the system's upstream resolver. Best-effort: never fails, only
/// falls back.
pub fn discover() -> SocketAddr {
    let addr = detect_system_upstream().unwrap_or_else(fallback_upstream);
    debug!(upstream = %addr, "DNS upstream selected");
    addr
}

fn detect_system_upstream() -> Option<SocketAddr> {
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("scutil").arg("--dns").output().ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        return first_scutil_nameserver(&stdout).map(|ip| SocketAddr::new(ip, 53));
    }
    #[cfg(not(target_os = "macos"))]
    {
        let content = std::fs::read_to_string("/etc/resolv.conf").ok()?;
        first_resolv_conf_nameserver(&content).map(|ip| SocketAddr::new(ip, 53))
    }
}

/// Parse `scutil --dns` output; the default resolver's servers show up as
/// `nameserver[0] : 192.168.1.1` lines.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn first_scutil_nameserver(output: &str) -> Option<IpAddr> {
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with("nameserver") {
            continue;
        }
        let Some((_, value)) = trimmed.rsplit_once(':') else {
            continue;
        };
        if let Ok(ip) = value.trim().parse::<IpAddr>() {
            if !ip.is_loopback() {
                return Some(ip);
            }
        }
    }
    None
}

/// Parse `/etc/resolv.conf`, skipping loopback entries (which would be the
/// daemon itself, or a local stub resolver pointing back at us).
#[cfg_attr(target_os = "macos", allow(dead_code))]
fn first_resolv_conf_nameserver(content: &str) -> Option<IpAddr> {
    for line in content.lines() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("nameserver") else {
            continue;
        };
        let value = rest.trim();
        // Drop a scope id suffix (%eth0) if present.
        let value = value.split('%').next().unwrap_or(value);
        if let Ok(ip) = value.parse::<IpAddr>() {
            if !ip.is_loopback() {
                return Some(ip);
            }
        }
    }
    None
}
