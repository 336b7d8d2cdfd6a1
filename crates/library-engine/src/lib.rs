//! :rocket: Engine of the library reservation system.
//!
//! A deployment consists of backend [replicas][Replica] and a
//! [reverse proxy][ReverseProxy] in front of them. Inside a replica, the
//! request handlers persist pending reservations and enqueue them; a single
//! [batch worker][BatchQueueWorker] applies them to the catalog using the
//! [connection pool][ConnectionPool], invalidates the
//! [book cache][RecencyCache] and feeds the [SLA tracker][SlaTracker].
//!
//! Both [`Replica`] and [`ReverseProxy`] implement
//! [`RequestHandler`][library_core::RequestHandler]; the HTTP server crate
//! serves either one.

use std::io;
use std::sync::Arc;

use library_core::{Config, ConfigError, Store, StoreError};
use thiserror::Error;
use tracing::info;

mod balancer;
mod cache;
mod lifecycle;
mod pool;
mod proxy;
mod queue;
mod replica;
mod report;
mod sla;
mod store;
mod upstream;
mod worker;

pub use balancer::{Backend, BackendServer, LoadBalancer, NoBackends};
pub use cache::{CacheStats, RecencyCache};
pub use lifecycle::{Shutdown, ShutdownSignal};
pub use pool::{ConnectionPool, PoolError, PoolStats, PooledConnection};
pub use proxy::ReverseProxy;
pub use queue::{reservation_queue, Next, QueueClosed, QueueConsumer, QueueProducer};
pub use replica::Replica;
pub use report::{append_report, render_sla_report};
pub use sla::{
    ComplianceSnapshot, Health, HealthStatus, SlaStatus, SlaTracker, LATENCY_TARGET,
    QUEUE_DEPTH_TARGET, UPTIME_TARGET,
};
pub use store::MemoryStore;
pub use upstream::{ForwardError, HttpUpstream, Upstream};
pub use worker::{BatchError, BatchQueueWorker, BatchSettings, Processed};

/// Errors while starting a replica or the proxy
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not open the initial store connections: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Backends(#[from] NoBackends),
    #[error("could not build the HTTP client: {0}")]
    Upstream(#[from] ForwardError),
    #[error("could not spawn a background thread: {0}")]
    Io(#[from] io::Error),
}

/// Start a replica backed by a fresh in-memory store
///
/// The store is seeded with the sample catalog if
/// [`Config::seed_sample_data`] is set.
pub fn launch(config: &Config) -> Result<Replica, LaunchError> {
    let store = MemoryStore::new();
    if config.seed_sample_data {
        store.seed_sample_data();
    }
    launch_with_store(config, Arc::new(store))
}

/// Start a replica on top of an existing store
///
/// The replica's batch worker must be the only writer of book availability
/// in `store`: give every replica a store of its own.
pub fn launch_with_store(config: &Config, store: Arc<dyn Store>) -> Result<Replica, LaunchError> {
    config.validate()?;
    Replica::start(config.clone(), store)
}

/// Start the reverse proxy over `config.backends`
pub fn launch_proxy(config: &Config) -> Result<ReverseProxy, LaunchError> {
    let balancer = Arc::new(LoadBalancer::new(config.backends.iter().cloned())?);
    let upstream = Arc::new(HttpUpstream::new(config.proxy_timeout)?);
    for (i, backend) in config.backends.iter().enumerate() {
        info!(backend = %backend, position = i + 1, "load balancing across backend");
    }
    Ok(ReverseProxy::new(balancer, upstream).with_stats_reporter(config.stats_interval)?)
}
