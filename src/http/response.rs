//! Outbound response builder.

use serde::Serialize;

use super::{Headers, StatusCode};

/// An HTTP response flowing back through the middleware stack.
///
/// # Examples
///
/// ```
/// use cadence::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Cache-Control", "no-store")
///     .body("pong");
///
/// assert_eq!(response.status(), StatusCode::OK);
/// assert_eq!(response.headers().get("cache-control"), Some("no-store"));
/// assert_eq!(response.body_bytes(), b"pong");
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a header in place, replacing earlier values. For middleware that
    /// decorates a response it received from downstream.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Serializes `value` as the body and sets `Content-Type: application/json`.
    ///
    /// Serialization failures fall back to an empty JSON object.
    #[must_use]
    pub fn json<T: Serialize>(mut self, value: &T) -> Self {
        self.body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
        self.headers.set("Content-Type", "application/json");
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}
