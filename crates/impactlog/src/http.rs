//! Minimal HTTP/1.1 vocabulary for the status server.
//!
//! Only what the server needs: parsing a request line, the handful of status
//! codes it can answer with, and the route table.

use std::fmt;
use std::net::SocketAddr;

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// `GET`, the only method served.
    Get,
    /// Anything else, kept verbatim for logging.
    Other(String),
}

impl Method {
    fn parse(token: &str) -> Self {
        if token == "GET" {
            Self::Get
        } else {
            Self::Other(token.to_string())
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Other(method) => write!(f, "{method}"),
        }
    }
}

/// A parsed request line plus the peer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Request target, compared verbatim against the route table.
    pub path: String,
    /// Remote address, if the transport reported one.
    pub peer: Option<SocketAddr>,
}

impl Request {
    /// Parse `METHOD SP PATH [SP VERSION]`.
    ///
    /// Returns `None` for an empty or malformed line; the connection is then
    /// closed without a response.
    #[must_use]
    pub fn parse(line: &str, peer: Option<SocketAddr>) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let method = parts.next()?;
        let path = parts.next()?;
        if let Some(version) = parts.next() {
            if !version.starts_with("HTTP/") || parts.next().is_some() {
                return None;
            }
        }
        Some(Self {
            method: Method::parse(method),
            path: path.to_string(),
            peer,
        })
    }
}

/// Status codes the server can answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 200
    Ok,
    /// 403
    Forbidden,
    /// 405
    MethodNotAllowed,
    /// 429
    TooManyRequests,
}

impl Status {
    /// Numeric code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Forbidden => 403,
            Self::MethodNotAllowed => 405,
            Self::TooManyRequests => 429,
        }
    }

    /// Reason phrase.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Forbidden => "Forbidden",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::TooManyRequests => "Too Many Requests",
        }
    }

    /// Head of a response without a body.
    #[must_use]
    pub fn empty_response(self) -> String {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            self.code(),
            self.reason()
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Head of a `200 OK` response whose body is streamed until the connection
/// closes.
#[must_use]
pub fn ok_head(content_type: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n"
    )
}

/// The fixed route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// `/`: the full page.
    Page,
    /// `/status`: the log version as plain text.
    Status,
    /// `/table_rows`: body rows only.
    TableRows,
}

impl Route {
    /// Look up a path by exact match.
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/" => Some(Self::Page),
            "/status" => Some(Self::Status),
            "/table_rows" => Some(Self::TableRows),
            _ => None,
        }
    }

    /// The path this route is served at.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Page => "/",
            Self::Status => "/status",
            Self::TableRows => "/table_rows",
        }
    }

    /// Content type of the response body.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Status => "text/plain",
            Self::Page | Self::TableRows => "text/html",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Option<SocketAddr> {
        Some("192.168.4.7:50000".parse().unwrap())
    }

    #[test]
    fn test_parse_get() {
        let request = Request::parse("GET /status HTTP/1.1\r\n", peer()).unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/status");
        assert_eq!(request.peer, peer());
    }

    #[test]
    fn test_parse_without_version() {
        let request = Request::parse("GET /", None).unwrap();
        assert_eq!(request.path, "/");
        assert!(request.peer.is_none());
    }

    #[test]
    fn test_parse_other_method() {
        let request = Request::parse("POST /status HTTP/1.1", peer()).unwrap();
        assert_eq!(request.method, Method::Other("POST".to_string()));
        assert_eq!(request.method.to_string(), "POST");
    }

    #[test]
    fn test_parse_lowercase_method_is_not_get() {
        let request = Request::parse("get / HTTP/1.1", peer()).unwrap();
        assert_ne!(request.method, Method::Get);
    }

    #[test]
    fn test_parse_malformed() {
        assert!(Request::parse("", peer()).is_none());
        assert!(Request::parse("\r\n", peer()).is_none());
        assert!(Request::parse("GET", peer()).is_none());
        assert!(Request::parse("GET / FTP/1.0", peer()).is_none());
        assert!(Request::parse("GET / HTTP/1.1 extra", peer()).is_none());
    }

    #[test]
    fn test_status_lines() {
        assert_eq!(Status::Ok.to_string(), "200 OK");
        assert_eq!(Status::Forbidden.code(), 403);
        assert_eq!(Status::MethodNotAllowed.reason(), "Method Not Allowed");
        assert_eq!(Status::TooManyRequests.code(), 429);
    }

    #[test]
    fn test_empty_response() {
        let head = Status::TooManyRequests.empty_response();
        assert!(head.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(head.contains("Content-Length: 0\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_ok_head() {
        let head = ok_head("text/plain");
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_routes_exact_match() {
        assert_eq!(Route::from_path("/"), Some(Route::Page));
        assert_eq!(Route::from_path("/status"), Some(Route::Status));
        assert_eq!(Route::from_path("/table_rows"), Some(Route::TableRows));
        assert_eq!(Route::from_path("/status?x=1"), None);
        assert_eq!(Route::from_path("/index.html"), None);
        assert_eq!(Route::from_path("/status/"), None);
    }

    #[test]
    fn test_route_content_types() {
        assert_eq!(Route::Status.content_type(), "text/plain");
        assert_eq!(Route::Page.content_type(), "text/html");
        assert_eq!(Route::TableRows.content_type(), "text/html");
        assert_eq!(Route::TableRows.path(), "/table_rows");
    }
}
