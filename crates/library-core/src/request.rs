use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// HTTP request method
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Method {
    /// GET request
    Get,
    /// HEAD request
    Head,
    /// POST request, may have a payload
    Post,
    /// PUT request, may have a payload
    Put,
    /// PATCH request, may have a payload
    Patch,
    /// DELETE request
    Delete,
    /// OPTIONS request
    Options,
}

impl Method {
    /// Upper-case name as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }

    /// Parse a wire method name, case-insensitively
    pub fn parse(name: &str) -> Option<Self> {
        let method = match name.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            _ => return None,
        };
        Some(method)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered list of header name/value pairs
///
/// Names keep the case they arrived with; lookups are case-insensitive.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Create an empty header list
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a header, keeping any existing header with the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every header called `name` with a single value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value.into()));
    }

    /// Remove every header called `name`
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value of the header called `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether a header called `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate over all name/value pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

/// Request received from a client
///
/// 📌 Hint: Both the replica router and the reverse proxy consume this type;
/// the HTTP server crate builds it from the wire.
#[derive(Clone, Debug)]
pub struct Request {
    /// Request method
    pub method: Method,
    /// Path including the query string, e.g. `/books?category=Systems`
    pub url: String,
    /// Request headers in arrival order
    pub headers: Headers,
    /// Raw request body
    pub body: Vec<u8>,
    /// Address of the connecting client, if known
    pub remote_addr: Option<IpAddr>,
}

impl Request {
    /// Create a request without headers, body or client address
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Headers::new(),
            body: Vec::new(),
            remote_addr: None,
        }
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a JSON body and the matching content type
    pub fn with_json<T: Serialize>(mut self, value: &T) -> Self {
        // Serializing plain data structures into a Vec cannot fail.
        self.body = serde_json::to_vec(value).unwrap_or_default();
        self.headers.insert("Content-Type", "application/json");
        self
    }

    /// Add a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Set the client address
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// The path without the query string
    pub fn path(&self) -> &str {
        match self.url.split_once('?') {
            Some((path, _)) => path,
            None => &self.url,
        }
    }

    /// Value of the query parameter `name`, if present
    ///
    /// Only `+` is decoded; the catalog API never needs percent-escapes.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let (_, query) = self.url.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.replace('+', " "))
    }
}

/// Response to a [`Request`]
#[derive(Clone, Debug)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Headers,
    /// Raw response body
    pub body: Vec<u8>,
}

impl Response {
    /// Empty response with the given status
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// JSON response with the given status
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json");
        Self {
            status,
            headers,
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    /// JSON error body in the `{"detail": ...}` shape used by the catalog API
    pub fn error(status: u16, detail: impl Into<String>) -> Self {
        Self::json(status, &serde_json::json!({ "detail": detail.into() }))
    }

    /// Parse the body as JSON
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Interface for handling requests from clients
///
/// 📌 Hint: The replica router and the reverse proxy implement this trait.
pub trait RequestHandler {
    /// Handle a request from a client
    ///
    /// This method may be called concurrently from different threads.
    fn handle(&self, request: Request) -> Response;

    /// Shut the component down
    ///
    /// This method waits for all threads spawned by the component (e.g., the
    /// batch worker and the reporters) to have terminated.
    fn shutdown(self);
}
