//! Harness running whole deployments in-process for the integration tests
//!
//! Every replica and the proxy listen on an ephemeral port of `127.0.0.1`;
//! the tests talk to them over real HTTP.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use eyre::{eyre, Result};
use library_core::{Config, RequestHandler};
use library_engine::{MemoryStore, Replica, ReverseProxy};
use library_server::Serving;

mod api;
pub use api::{Api, ApiResponse};

/// ISBN of a sample book with five copies
pub const CLEAN_CODE: &str = "978-0132350884";

/// Address nothing listens on
pub const DEAD_BACKEND: &str = "http://127.0.0.1:1";

pub struct TestCtxBuilder {
    /// Number of replicas, each with its own store
    pub replicas: usize,
    /// Whether to put the reverse proxy in front of the replicas
    pub proxy: bool,
    /// Whether the proxy lists [`DEAD_BACKEND`] before the replicas
    pub dead_backend: bool,
    /// Handler threads per listening socket
    pub handler_threads: usize,
    /// Pause of the batch worker between two batches
    pub batch_interval: Duration,
    /// Simulated work per reservation
    pub processing_delay: Duration,
    pub batch_size: usize,
}

impl Default for TestCtxBuilder {
    fn default() -> Self {
        Self {
            replicas: 1,
            proxy: false,
            dead_backend: false,
            handler_threads: 4,
            batch_interval: Duration::from_millis(50),
            processing_delay: Duration::ZERO,
            batch_size: 10,
        }
    }
}

impl TestCtxBuilder {
    /// Create a builder for one replica without proxy
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of replicas
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        assert_ne!(replicas, 0);
        self.replicas = replicas;
        self
    }

    /// Route all requests through the reverse proxy
    pub fn with_proxy(mut self) -> Self {
        self.proxy = true;
        self
    }

    /// Put an unreachable backend first in the proxy's rotation
    pub fn with_dead_backend(mut self) -> Self {
        self.proxy = true;
        self.dead_backend = true;
        self
    }

    /// Set the pause between two batches
    pub fn with_batch_interval(mut self, interval: Duration) -> Self {
        self.batch_interval = interval;
        self
    }

    /// Set the simulated work per reservation
    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    /// Set the maximum number of reservations per batch
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Get the [`Config`] every component of the deployment is started with
    fn config(&self) -> Config {
        Config {
            environment: String::from("test"),
            processing_delay: self.processing_delay,
            batch_size: self.batch_size,
            batch_interval: self.batch_interval,
            idle_interval: Duration::from_millis(20),
            error_backoff: Duration::from_millis(50),
            proxy_timeout: Duration::from_secs(5),
            handler_threads: self.handler_threads,
            seed_sample_data: false,
            ..Config::default()
        }
    }

    /// Build the test context
    pub fn build(self) -> Result<TestCtx> {
        let mut config = self.config();

        let mut stores = Vec::with_capacity(self.replicas);
        let mut replicas = Vec::with_capacity(self.replicas);
        let mut replica_urls = Vec::with_capacity(self.replicas);
        for i in 0..self.replicas {
            let store = MemoryStore::with_sample_data();
            let replica = library_engine::launch_with_store(&config, Arc::new(store.clone()))?;
            stores.push(store);
            let serving = serve(replica, &format!("replica{i}"), self.handler_threads)?;
            replica_urls.push(url_of(&serving)?);
            replicas.push(serving);
        }

        let proxy = if self.proxy {
            config.backends = replica_urls.clone();
            if self.dead_backend {
                config.backends.insert(0, DEAD_BACKEND.to_string());
            }
            let proxy = library_engine::launch_proxy(&config)?;
            Some(serve(proxy, "proxy", self.handler_threads)?)
        } else {
            None
        };

        let entry = match &proxy {
            Some(proxy) => url_of(proxy)?,
            None => replica_urls[0].clone(),
        };

        Ok(TestCtx {
            api: Api::new(entry)?,
            stores,
            replica_urls,
            replicas,
            proxy,
            drop_bomb: DropBomb,
        })
    }
}

fn serve<H>(handler: H, name: &str, threads: usize) -> Result<Serving<H>>
where
    H: RequestHandler + Send + Sync + 'static,
{
    let server = tiny_http::Server::http("127.0.0.1:0").map_err(|e| eyre!("could not bind: {e}"))?;
    Ok(Serving::spawn(server, handler, name, threads)?)
}

fn url_of<H>(serving: &Serving<H>) -> Result<String>
where
    H: RequestHandler + Send + Sync + 'static,
{
    let addr = serving
        .addr()
        .ok_or_else(|| eyre!("server is not listening on an IP address"))?;
    Ok(format!("http://{addr}"))
}

/// Test context
pub struct TestCtx {
    /// Client for the entry point: the proxy if there is one, else the first
    /// replica
    pub api: Api,
    /// Store of each replica, in start order
    pub stores: Vec<MemoryStore>,
    /// Base URLs of the replicas, in start order
    pub replica_urls: Vec<String>,
    replicas: Vec<Serving<Replica>>,
    proxy: Option<Serving<ReverseProxy>>,

    drop_bomb: DropBomb,
}

impl TestCtx {
    /// Client talking to replica `i` directly
    pub fn replica_api(&self, i: usize) -> Result<Api> {
        Api::new(self.replica_urls[i].clone())
    }

    /// Store behind replica `i`
    pub fn store(&self, i: usize) -> &MemoryStore {
        &self.stores[i]
    }

    /// Position of the replica serving `base_url`
    pub fn replica_index(&self, base_url: &str) -> Option<usize> {
        self.replica_urls.iter().position(|url| url == base_url)
    }

    /// The replica served at position `i`
    pub fn replica(&self, i: usize) -> &Replica {
        self.replicas[i].handler()
    }

    /// The proxy, if the context has one
    pub fn proxy(&self) -> Option<&ReverseProxy> {
        self.proxy.as_ref().map(Serving::handler)
    }

    /// Block until the batch workers have finished `count` reservations in
    /// total, cache invalidation included
    pub fn wait_processed(&self, count: usize, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let processed: usize = self
                .replicas
                .iter()
                .map(|r| r.handler().sla().status().total_processed)
                .sum();
            if processed >= count {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(eyre!(
                    "only {processed} of {count} reservations processed after {timeout:?}"
                ));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Shut the deployment down and finish the test
    pub fn finish(self) {
        std::mem::forget(self.drop_bomb);
        drop(self.api);
        if let Some(proxy) = self.proxy {
            proxy.shutdown();
        }
        for replica in self.replicas {
            replica.shutdown();
        }
    }
}

struct DropBomb;

impl Drop for DropBomb {
    fn drop(&mut self) {
        eprintln!("@TestAuthor: You should call `ctx.finish()` to shut the library system down");
    }
}
