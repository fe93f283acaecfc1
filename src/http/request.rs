//! Request-head parsing using the [`httparse`] crate.
//!
//! Only the request line and header block are parsed here. Body bytes stay in
//! the engine's buffer and reach controllers chunk by chunk through dispatch.

use std::collections::HashMap;

use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing a request head.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("request head is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },
}

/// The parsed request line and headers of one exchange.
///
/// # Examples
///
/// ```
/// use ctlhttpd::http::RequestHead;
///
/// let raw = b"POST /submit?mode=fast HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
/// let (head, offset) = RequestHead::parse(raw).unwrap();
///
/// assert_eq!(head.method().as_str(), "POST");
/// assert_eq!(head.path(), "/submit");
/// assert_eq!(head.query_param("mode"), Some("fast"));
/// assert_eq!(head.content_length().unwrap(), Some(5));
/// assert_eq!(&raw[offset..], b"hello");
/// ```
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    params: HashMap<String, String>,
}

impl RequestHead {
    /// Maximum number of headers accepted per request.
    const MAX_HEADERS: usize = 64;

    /// Parses a request head from the start of `buf`.
    ///
    /// Returns the head and the offset at which the body begins.
    ///
    /// # Errors
    ///
    /// - [`HeadError::Incomplete`]: the header block is not terminated yet.
    /// - [`HeadError::Parse`]: the bytes are not valid HTTP/1.x.
    /// - [`HeadError::MissingField`]: method, path or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(HeadError::Incomplete),
        };

        let method = match raw_req
            .method
            .ok_or(HeadError::MissingField { field: "method" })?
            .parse::<Method>()
        {
            Ok(m) => m,
            Err(never) => match never {},
        };

        let raw_path = raw_req
            .path
            .ok_or(HeadError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(HeadError::MissingField { field: "version" })?;

        let mut header_list = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_list.insert(header.name, value);
            }
        }

        let params = query.as_deref().map(parse_query_string).unwrap_or_default();

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_list,
                query,
                params,
            },
            body_offset,
        ))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The version as it appears on the request line.
    pub fn version_str(&self) -> &'static str {
        if self.version == 0 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The raw query string without the leading `?`.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close, unless a
    /// `Connection` header says otherwise.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// `true` when the body uses chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
    }

    /// The declared body length, `None` when no `Content-Length` is present.
    ///
    /// # Errors
    ///
    /// [`HeadError::InvalidContentLength`] when the header is not a number.
    pub fn content_length(&self) -> Result<Option<usize>, HeadError> {
        match self.headers.get("content-length") {
            None => Ok(None),
            Some(value) => value.trim().parse().map(Some).map_err(|_| {
                HeadError::InvalidContentLength {
                    value: value.to_owned(),
                }
            }),
        }
    }
}

/// Parses a URL query string (`key=value&key2=value2`), decoding `+` as a
/// space. Percent-decoding is left to the controller.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (head, offset) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.method(), &Method::Get);
        assert_eq!(head.path(), "/");
        assert_eq!(head.version(), 1);
        assert_eq!(head.version_str(), "HTTP/1.1");
        assert_eq!(head.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
        assert_eq!(head.content_length().unwrap(), None);
    }

    #[test]
    fn parse_query_pairs() {
        let raw = b"GET /search?q=rust+lang&page=2&flag HTTP/1.1\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        assert_eq!(head.path(), "/search");
        assert_eq!(head.query_string(), Some("q=rust+lang&page=2&flag"));
        assert_eq!(head.query_param("q"), Some("rust lang"));
        assert_eq!(head.query_param("page"), Some("2"));
        assert_eq!(head.query_param("flag"), Some(""));
    }

    #[test]
    fn incomplete_head() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(
            RequestHead::parse(raw),
            Err(HeadError::Incomplete)
        ));
    }

    #[test]
    fn malformed_head() {
        let raw = b"GET / HTTP/9\r\n\r\n";
        assert!(matches!(RequestHead::parse(raw), Err(HeadError::Parse(_))));
    }

    #[test]
    fn keep_alive_defaults() {
        let (h11, _) = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(h11.is_keep_alive());
        let (h10, _) = RequestHead::parse(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!h10.is_keep_alive());
        let (close, _) =
            RequestHead::parse(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!close.is_keep_alive());
    }

    #[test]
    fn bad_content_length_is_reported() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        assert!(matches!(
            head.content_length(),
            Err(HeadError::InvalidContentLength { .. })
        ));
    }

    #[test]
    fn chunked_detection() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, Chunked\r\n\r\n";
        let (head, _) = RequestHead::parse(raw).unwrap();
        assert!(head.is_chunked());
    }
}
