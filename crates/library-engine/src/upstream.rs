//! Outbound HTTP to the backend replicas

use std::time::Duration;

use library_core::{Headers, Method, Request, Response};
use thiserror::Error;
use tracing::{debug, warn};

/// Failure to get any response out of a backend
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Transport error, including timeouts
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend could not be reached for another reason
    #[error("Backend unreachable: {0}")]
    Unreachable(String),
}

/// Sends a prepared request to a backend and returns whatever it answered
///
/// Any HTTP response, whatever its status, is a success here; only a failure
/// to obtain one is an error.
pub trait Upstream: Send + Sync {
    /// Send `request` to `base_url` joined with the request's url
    fn send(&self, base_url: &str, request: &Request) -> Result<Response, ForwardError>;
}

/// [`Upstream`] backed by a blocking `reqwest` client
pub struct HttpUpstream {
    client: reqwest::blocking::Client,
}

impl HttpUpstream {
    /// Create a new [`HttpUpstream`]; each request gives up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, ForwardError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

impl Upstream for HttpUpstream {
    fn send(&self, base_url: &str, request: &Request) -> Result<Response, ForwardError> {
        let url = format!("{base_url}{}", request.url);
        debug!(url = %url, method = %request.method, "forwarding request");

        let mut builder = self.client.request(to_reqwest(request.method), &url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        let response = builder.send()?;

        let status = response.status().as_u16();
        let headers = relay_headers(response.headers());
        let body = response.bytes()?.to_vec();
        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

/// Copy a backend's response headers
///
/// [`Headers`] hold text; a value that is not valid UTF-8 cannot be relayed
/// and is dropped with a warning.
fn relay_headers(map: &reqwest::header::HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        match value.to_str() {
            Ok(v) => headers.append(name.as_str(), v),
            Err(_) => warn!(
                header = name.as_str(),
                len = value.len(),
                "dropping backend response header that is not valid UTF-8"
            ),
        }
    }
    headers
}
