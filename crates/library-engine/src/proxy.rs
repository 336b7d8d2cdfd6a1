//! Implementation of the reverse proxy
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use library_core::{Request, RequestHandler, Response};
use serde_json::json;
use tracing::{error, info};

use crate::balancer::LoadBalancer;
use crate::lifecycle::Shutdown;
use crate::report;
use crate::upstream::Upstream;

/// Request headers that are recomputed for the outbound request
const STRIPPED_REQUEST_HEADERS: [&str; 2] = ["host", "content-length"];
/// Backend response headers that are not relayed
const STRIPPED_RESPONSE_HEADERS: [&str; 2] = ["server", "date"];

/// Front that spreads client requests over the backend replicas
///
/// Every request goes to exactly one backend chosen by the [`LoadBalancer`].
/// A backend that cannot be reached yields a `502` right away; the request is
/// not retried elsewhere.
pub struct ReverseProxy {
    balancer: Arc<LoadBalancer>,
    upstream: Arc<dyn Upstream>,
    shutdown: Shutdown,
    reporter: Option<JoinHandle<()>>,
}

impl ReverseProxy {
    /// Create a new [`ReverseProxy`]
    pub fn new(balancer: Arc<LoadBalancer>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            balancer,
            upstream,
            shutdown: Shutdown::new(),
            reporter: None,
        }
    }

    /// Log the per-backend counters every `interval` until shutdown
    pub fn with_stats_reporter(mut self, interval: Duration) -> io::Result<Self> {
        let handle =
            report::spawn_balancer_reporter(self.balancer.clone(), interval, self.shutdown.signal())?;
        self.reporter = Some(handle);
        Ok(self)
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Forward `request` to the next backend and relay its answer
    pub fn forward(&self, mut request: Request) -> Response {
        let backend = self.balancer.next_backend();
        let client = request
            .remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        for name in STRIPPED_REQUEST_HEADERS {
            request.headers.remove(name);
        }
        request.headers.insert("X-Forwarded-For", client);
        request.headers.insert("X-Forwarded-Proto", "http");
        request.headers.insert("X-Proxy-Server", backend.address());

        let start = Instant::now();
        match self.upstream.send(backend.address(), &request) {
            Ok(mut response) => {
                let took = start.elapsed();
                self.balancer.record_outcome(&backend, true);
                for name in STRIPPED_RESPONSE_HEADERS {
                    response.headers.remove(name);
                }
                response
                    .headers
                    .insert("X-Proxy-Response-Time", format!("{:.3}s", took.as_secs_f64()));
                response.headers.insert("X-Served-By", backend.address());
                info!(
                    method = %request.method,
                    path = %request.url,
                    backend = backend.address(),
                    status = response.status,
                    elapsed_ms = took.as_millis() as u64,
                    "proxied request"
                );
                response
            }
            Err(e) => {
                self.balancer.record_outcome(&backend, false);
                error!(
                    method = %request.method,
                    path = %request.url,
                    backend = backend.address(),
                    error = %e,
                    "failed to reach backend"
                );
                Response::json(
                    502,
                    &json!({
                        "error": "Proxy Error",
                        "message": format!("Failed to connect to API server: {}", backend.address()),
                        "details": e.to_string(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
            }
        }
    }
}

impl RequestHandler for ReverseProxy {
    fn handle(&self, request: Request) -> Response {
        self.forward(request)
    }

    fn shutdown(self) {
        self.shutdown.trigger();
        if let Some(handle) = self.reporter {
            if handle.join().is_err() {
                error!("balancer stats reporter panicked");
            }
        }
    }
}
