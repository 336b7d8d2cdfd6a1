use std::thread;
use std::time::{Duration, Instant};

use eyre::{eyre, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde_json::Value;

/// How often [`Api::wait_for_status`] polls the reservation list
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Status, headers and decoded body of one HTTP exchange
#[derive(Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    /// JSON body, [`Value::Null`] if the body was empty
    pub body: Value,
}

impl ApiResponse {
    /// Value of the response header `name`, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Fail unless the status is `expected`
    pub fn expect_status(self, expected: u16) -> Result<Self> {
        if self.status != expected {
            return Err(eyre!(
                "expected status {expected}, got {} with body {}",
                self.status,
                self.body
            ));
        }
        Ok(self)
    }
}

/// Blocking HTTP client for one base URL (a replica or the proxy)
#[derive(Clone)]
pub struct Api {
    base_url: String,
    client: Client,
}

impl Api {
    pub(crate) fn new(base_url: String) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { base_url, client })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send `GET {base_url}{path}`
    pub fn get(&self, path: &str) -> Result<ApiResponse> {
        let response = self.client.get(format!("{}{path}", self.base_url)).send()?;
        Self::decode(response)
    }

    /// Send `POST {base_url}{path}` with `body` as JSON
    pub fn post(&self, path: &str, body: &Value) -> Result<ApiResponse> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(body)?)
            .send()?;
        Self::decode(response)
    }

    fn decode(response: reqwest::blocking::Response) -> Result<ApiResponse> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let bytes = response.bytes()?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// Reserve `isbn` for `user_id` and return the reservation id
    pub fn reserve(&self, user_id: &str, isbn: &str) -> Result<u64> {
        let response = self
            .post(
                "/reservations",
                &serde_json::json!({ "user_id": user_id, "isbn": isbn }),
            )?
            .expect_status(200)?;
        response.body["reservation_id"]
            .as_u64()
            .ok_or_else(|| eyre!("reservation response without id: {}", response.body))
    }

    /// Current catalog entry of `isbn`
    pub fn book(&self, isbn: &str) -> Result<Value> {
        Ok(self.get(&format!("/books/{isbn}"))?.expect_status(200)?.body)
    }

    /// Status of reservation `id` as listed for `user_id`
    pub fn reservation_status(&self, user_id: &str, id: u64) -> Result<String> {
        let list = self
            .get(&format!("/reservations/my/{user_id}"))?
            .expect_status(200)?
            .body;
        list.as_array()
            .into_iter()
            .flatten()
            .find(|r| r["id"].as_u64() == Some(id))
            .and_then(|r| r["status"].as_str())
            .map(str::to_string)
            .ok_or_else(|| eyre!("reservation {id} not listed for {user_id}"))
    }

    /// Poll until reservation `id` leaves the pending state
    pub fn wait_for_status(&self, user_id: &str, id: u64, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.reservation_status(user_id, id)?;
            if status != "pending" {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Err(eyre!("reservation {id} still pending after {timeout:?}"));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
