//! Implementation of the load balancer
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

/// The backend list was empty
#[derive(Debug, Error)]
#[error("load balancer needs at least one backend")]
pub struct NoBackends;

/// A backend picked by [`LoadBalancer::next_backend()`]
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Backend {
    index: usize,
    address: String,
}

impl Backend {
    /// Base URL, e.g. `http://localhost:8080`
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Request counters of one backend
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct BackendServer {
    pub address: String,
    pub requests: u64,
    pub errors: u64,
    /// Time of the last recorded outcome
    pub last_seen: Option<DateTime<Utc>>,
}

impl BackendServer {
    /// Failed share of all requests in percent
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64 * 100.0
        }
    }
}

struct BalancerState {
    cursor: usize,
    servers: Vec<BackendServer>,
}

/// Round-robin selector over a fixed list of backends
///
/// Error counters are bookkeeping only: a backend is never skipped, no
/// matter how often it failed.
pub struct LoadBalancer {
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    /// Create a new [`LoadBalancer`]
    pub fn new<I, S>(backends: I) -> Result<Self, NoBackends>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let servers: Vec<BackendServer> = backends
            .into_iter()
            .map(|address| BackendServer {
                address: address.into().trim_end_matches('/').to_string(),
                requests: 0,
                errors: 0,
                last_seen: None,
            })
            .collect();
        if servers.is_empty() {
            return Err(NoBackends);
        }
        Ok(Self {
            state: Mutex::new(BalancerState { cursor: 0, servers }),
        })
    }

    /// The backend under the cursor; advances the cursor by one
    pub fn next_backend(&self) -> Backend {
        let mut state = self.state.lock();
        let index = state.cursor;
        state.cursor = (index + 1) % state.servers.len();
        Backend {
            index,
            address: state.servers[index].address.clone(),
        }
    }

    /// Account for one forwarded request
    pub fn record_outcome(&self, backend: &Backend, success: bool) {
        let mut state = self.state.lock();
        let server = &mut state.servers[backend.index];
        server.requests += 1;
        if !success {
            server.errors += 1;
        }
        server.last_seen = Some(Utc::now());
    }

    /// Snapshot of every backend's counters, in configuration order
    pub fn stats(&self) -> Vec<BackendServer> {
        self.state.lock().servers.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().servers.is_empty()
    }
}
