use std::path::Path;

use serde::de::Deserializer;
use serde::{Deserialize, Serialize, Serializer};

use crate::common::Error;

/// Route kind. External writers only ever distinguish `tcp` from everything
/// else, so any unrecognized value is treated as HTTP rather than rejecting
/// the whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteKind {
    #[default]
    Http,
    Tcp,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Http => "http",
            RouteKind::Tcp => "tcp",
        }
    }
}

impl Serialize for RouteKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RouteKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.eq_ignore_ascii_case("tcp") {
            Ok(RouteKind::Tcp)
        } else {
            Ok(RouteKind::Http)
        }
    }
}

/// One entry of the route file. Written by external tooling; the daemon only
/// reads. `command`, `pid`, `log_file`, `created`, and `id` are informational
/// (list/logs tooling reads them) and are carried through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub domain: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub listen_port: u16,
    #[serde(rename = "type", default)]
    pub kind: RouteKind,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

impl Route {
    pub fn is_tcp(&self) -> bool {
        self.kind == RouteKind::Tcp
    }
}

/// Read the route file. A missing or zero-length file is an empty route set;
/// malformed JSON is an error so the caller can keep its previous snapshot.
pub fn load_routes(path: &Path) -> Result<Vec<Route>, Error> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let routes: Vec<Route> = serde_json::from_slice(&data)?;
    Ok(routes)
}
