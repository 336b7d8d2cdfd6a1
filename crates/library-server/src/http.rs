//! 🏗 Conversion between `tiny_http` and the core message types

use library_core::{Headers, Method, Request, Response};
use tiny_http::Header;
use tracing::{debug, warn};

/// Response headers `tiny_http` computes itself
const FRAMING_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Parse the given HTTP request
///
/// If [`None`] is returned, the request was already answered with a
/// corresponding error message.
pub fn parse(mut rq: tiny_http::Request) -> Option<(tiny_http::Request, Request)> {
    let Some(method) = Method::parse(rq.method().as_str()) else {
        respond(rq, Response::error(405, "Method Not Allowed"));
        return None;
    };

    let headers: Headers = rq
        .headers()
        .iter()
        .map(|hdr| (hdr.field.as_str().as_str().to_string(), hdr.value.to_string()))
        .collect();
    let remote_addr = rq.remote_addr().map(|addr| addr.ip());

    let mut body = Vec::with_capacity(rq.body_length().unwrap_or(0));
    if let Err(e) = rq.as_reader().read_to_end(&mut body) {
        debug!(error = %e, "could not read request body");
        respond(rq, Response::error(400, "Could not read request body"));
        return None;
    }

    let request = Request {
        method,
        url: rq.url().to_string(),
        headers,
        body,
        remote_addr,
    };
    Some((rq, request))
}

/// Send `response` as the answer to `rq`
pub fn respond(rq: tiny_http::Request, response: Response) {
    let mut res = tiny_http::Response::from_data(response.body).with_status_code(response.status);
    for (name, value) in response.headers.iter() {
        if FRAMING_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            Ok(header) => res.add_header(header),
            Err(()) => warn!(header = name, "dropping invalid response header"),
        }
    }
    if let Err(e) = rq.respond(res) {
        debug!(error = %e, "HTTP response failed");
    }
}
