//! Inbound request as handed over by the host server.

use std::net::SocketAddr;

use super::{Headers, Method};

/// An inbound HTTP request.
///
/// # Examples
///
/// ```
/// use cadence::http::{Method, Request};
///
/// let request = Request::new(Method::Get, "/api/recipes?page=2")
///     .header("X-Api-Key", "rider-42");
///
/// assert_eq!(request.path(), "/api/recipes");
/// assert_eq!(request.query_string(), Some("page=2"));
/// assert_eq!(request.headers().get("x-api-key"), Some("rider-42"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    headers: Headers,
    body: Vec<u8>,
    peer_addr: Option<SocketAddr>,
}

impl Request {
    /// Creates a request for `target`, which may carry a `?query` suffix.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        Self {
            method,
            path,
            query,
            headers: Headers::new(),
            body: Vec::new(),
            peer_addr: None,
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Records the TCP peer address the host accepted the request from.
    #[must_use]
    pub fn peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_query_from_path() {
        let req = Request::new(Method::Get, "/search?q=gravel&page=2");
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=gravel&page=2"));
    }

    #[test]
    fn plain_path_has_no_query() {
        let req = Request::new(Method::Post, "/api/challenges").body("{}");
        assert_eq!(req.query_string(), None);
        assert_eq!(req.body_bytes(), b"{}");
    }
}
