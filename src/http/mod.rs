//! HTTP primitives seen by the middleware layer.
//!
//! The host application owns the socket and the wire format; this module only
//! models what the rate limiter and metrics middleware inspect or decorate:
//! [`Method`], [`StatusCode`], [`Headers`], [`Request`], and [`Response`].

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::Request;
pub use response::Response;

/// An HTTP response status code.
///
/// Any `u16` is representable so that statuses produced by downstream
/// handlers pass through the metrics untouched; the common ones have
/// constants.
///
/// # Examples
///
/// ```
/// use cadence::http::StatusCode;
///
/// let status = StatusCode::TOO_MANY_REQUESTS;
/// assert_eq!(status.as_u16(), 429);
/// assert_eq!(status.canonical_reason(), "Too Many Requests");
/// assert!(status.is_client_error());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const OK: Self = Self(200);
    pub const CREATED: Self = Self(201);
    pub const NO_CONTENT: Self = Self(204);
    pub const NOT_MODIFIED: Self = Self(304);
    pub const BAD_REQUEST: Self = Self(400);
    pub const UNAUTHORIZED: Self = Self(401);
    pub const FORBIDDEN: Self = Self(403);
    pub const NOT_FOUND: Self = Self(404);
    pub const CONFLICT: Self = Self(409);
    pub const UNPROCESSABLE_ENTITY: Self = Self(422);
    pub const TOO_MANY_REQUESTS: Self = Self(429);
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);
    pub const BAD_GATEWAY: Self = Self(502);
    pub const SERVICE_UNAVAILABLE: Self = Self(503);
    pub const GATEWAY_TIMEOUT: Self = Self(504);

    pub const fn from_u16(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric status code as a `u16`.
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// `2xx` and `3xx`.
    pub fn is_success(self) -> bool {
        self.0 < 400
    }

    pub fn is_client_error(self) -> bool {
        (400..500).contains(&self.0)
    }

    pub fn is_server_error(self) -> bool {
        self.0 >= 500
    }

    /// Returns the canonical reason phrase, or `""` for codes without a constant.
    pub fn canonical_reason(self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            409 => "Conflict",
            422 => "Unprocessable Entity",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// An HTTP request method. Non-standard methods are kept in `Custom`.
///
/// # Examples
///
/// ```
/// use cadence::http::Method;
///
/// let method: Method = "PATCH".parse().unwrap();
/// assert_eq!(method, Method::Patch);
/// assert_eq!(method.as_str(), "PATCH");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Custom(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            _ => Self::Custom(s.to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert!(StatusCode::OK.is_success());
        assert!(StatusCode::NOT_MODIFIED.is_success());
        assert!(StatusCode::NOT_FOUND.is_client_error());
        assert!(!StatusCode::NOT_FOUND.is_server_error());
        assert!(StatusCode::from_u16(599).is_server_error());
        assert_eq!(StatusCode::from_u16(418).canonical_reason(), "");
    }

    #[test]
    fn method_parse_is_case_insensitive() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!(
            "PURGE".parse::<Method>().unwrap(),
            Method::Custom("PURGE".into())
        );
    }
}
