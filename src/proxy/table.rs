//! In-memory route table.
//!
//! Readers vastly outnumber the single writer (the reconciler), so the table
//! is an immutable snapshot behind a reader-writer lock: `replace` builds a
//! fresh `Arc` and swaps it in, readers clone the `Arc` and drop the lock
//! before looking at a single route.

use std::sync::{Arc, RwLock};

use crate::config::Route;

#[derive(Default)]
pub struct RouteTable {
    inner: RwLock<Arc<Vec<Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. A request in flight keeps whatever snapshot was
    /// current when dispatch began.
    pub fn snapshot(&self) -> Arc<Vec<Route>> {
        self.inner.read().expect("route table lock poisoned").clone()
    }

    /// Atomically replace the snapshot. Readers observe either the old or
    /// the new set, never a mix.
    pub fn replace(&self, routes: Vec<Route>) {
        *self.inner.write().expect("route table lock poisoned") = Arc::new(routes);
    }

    /// Look up the HTTP route for a Host header value (port already
    /// stripped). Case-insensitive; TCP routes never match; first entry in
    /// file order wins.
    pub fn find_http(&self, host: &str) -> Option<Route> {
        self.snapshot()
            .iter()
            .find(|r| !r.is_tcp() && r.domain.eq_ignore_ascii_case(host))
            .cloned()
    }
}
