use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Counts accepted TCP connections and the requests each one carried.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    connections: Arc<Mutex<HashMap<SocketAddr, usize>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly accepted connection from `peer`.
    pub fn record_connection(&self, peer: SocketAddr) {
        self.connections.lock().unwrap().insert(peer, 0);
    }

    /// Record one request served on the connection from `peer`.
    pub fn record_request(&self, peer: SocketAddr) {
        *self.connections.lock().unwrap().entry(peer).or_insert(0) += 1;
    }

    /// Number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Requests served per connection, largest first.
    pub fn requests_per_connection(&self) -> Vec<usize> {
        let mut counts: Vec<usize> = self.connections.lock().unwrap().values().copied().collect();
        counts.sort_unstable_by(|a, b| b.cmp(a));
        counts
    }
}
