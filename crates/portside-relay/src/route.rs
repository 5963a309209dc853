//! Hostname routing table
//!
//! Maps a sniffed server name to a destination descriptor. Lookup is exact
//! match first, then the single-level wildcard parent: `api.example.com`
//! falls back to `*.example.com` when no exact route exists.

use dashmap::DashMap;
use tracing::debug;

/// Where a hostname's bytes should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dest {
    /// A named endpoint registered over its persistent connection
    Endpoint(String),
    /// The relay's own fallback server
    Home,
    /// Plain TCP forward
    Tcp(String),
}

#[derive(Default)]
pub struct RouteTable {
    routes: DashMap<String, Dest>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: impl Into<String>, dest: Dest) {
        let host = host.into();
        debug!(%host, ?dest, "route registered");
        self.routes.insert(host, dest);
    }

    pub fn remove(&self, host: &str) -> Option<Dest> {
        self.routes.remove(host).map(|(_, dest)| dest)
    }

    /// Exact match, then the wildcard parent.
    pub fn lookup(&self, host: &str) -> Option<Dest> {
        if let Some(dest) = self.routes.get(host) {
            return Some(dest.clone());
        }
        let parent = wildcard_parent(host)?;
        self.routes.get(&parent).map(|dest| dest.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// `api.example.com` -> `*.example.com`; `None` when the parent would not be
/// a real domain.
fn wildcard_parent(host: &str) -> Option<String> {
    let first_dot = host.find('.')?;
    let parent = &host[first_dot + 1..];
    if !parent.contains('.') {
        return None;
    }
    Some(format!("*.{parent}"))
}
