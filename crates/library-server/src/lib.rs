//! HTTP front of the library reservation system
//!
//! Serves any [`RequestHandler`] (a replica or the reverse proxy) over
//! `tiny_http` with a fixed number of handler threads.

#![warn(missing_docs)]

pub mod http;

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use library_core::{Config, ConfigError, RequestHandler};
use tracing::{debug, error};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// How often an idle handler thread checks whether it should stop
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Load `config_{environment}.json` from `dir`
///
/// The configured log level is only known afterwards, so anything logged
/// while loading goes through a temporary subscriber filtered by `RUST_LOG`
/// (default `info`) and writing to stderr.
pub fn load_config(dir: &Path, environment: &str) -> Result<Config, ConfigError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    load_config_logged(dir, environment, filter, io::stderr)
}

fn load_config_logged<W>(
    dir: &Path,
    environment: &str,
    filter: EnvFilter,
    writer: W,
) -> Result<Config, ConfigError>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    tracing::subscriber::with_default(bootstrap, || Config::load(dir, environment))
}

fn http_loop<H: RequestHandler>(server: &tiny_http::Server, handler: &H, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        let rq = match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(rq)) => rq,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "HTTP receive failed");
                continue;
            }
        };
        if let Some((rq, request)) = http::parse(rq) {
            let response = handler.handle(request);
            http::respond(rq, response);
        }
    }
}

/// Handler threads answering requests on one listening socket
pub struct Serving<H> {
    addr: Option<SocketAddr>,
    handler: Arc<H>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl<H> Serving<H>
where
    H: RequestHandler + Send + Sync + 'static,
{
    /// Serve `handler` on `server` with `threads` handler threads
    pub fn spawn(
        server: tiny_http::Server,
        handler: H,
        name: &str,
        threads: usize,
    ) -> io::Result<Self> {
        let addr = server.server_addr().to_ip();
        let server = Arc::new(server);
        let handler = Arc::new(handler);
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let server = server.clone();
            let handler = handler.clone();
            let thread_stop = stop.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}_{i}"))
                .spawn(move || http_loop(&server, &*handler, &thread_stop));
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    stop.store(true, Ordering::Relaxed);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            addr,
            handler,
            stop,
            threads: handles,
        })
    }

    /// Address the server is listening on
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// The handler being served
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Block until every handler thread has exited
    pub fn join(self) {
        for handle in self.threads {
            if handle.join().is_err() {
                error!("handler thread panicked");
            }
        }
    }

    /// Stop accepting requests, then shut the handler down
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads {
            if handle.join().is_err() {
                error!("handler thread panicked");
            }
        }
        match Arc::into_inner(self.handler) {
            Some(handler) => handler.shutdown(),
            None => debug!("handler still shared, skipping its shutdown"),
        }
    }
}
