// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Reading HTTP/1.x request heads and writing responses.
//!
//! Only what the redirect service needs is extracted from a request:
//! the method, the request target and the `Host` header. Request bodies
//! are never read.

use std::fmt;
use std::io::{self, Write};

use http::{Method, Response};
use url::Url;

/// The largest request head we are willing to buffer.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// The largest number of header fields we are willing to parse.
pub const MAX_HEADERS: usize = 32;

/// The parts of an HTTP request relevant to the redirect service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub method: Method,

    /// The request target in origin form: the path plus any query
    /// string.
    pub target: String,

    /// The `Host` header, if any, exactly as received.
    pub host: Option<String>,
}

impl Request {
    /// Returns the path portion of the request target.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }
}

/// Parses a request head from the beginning of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a complete head, in
/// which case the caller should read more data and try again. Callers
/// are responsible for enforcing [`MAX_HEAD_LEN`].
pub fn parse_request(buf: &[u8]) -> Result<Option<Request>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    if parsed.parse(buf)?.is_partial() {
        return Ok(None);
    }

    // For a complete parse, httparse guarantees these are filled in.
    let (method, target) = match (parsed.method, parsed.path) {
        (Some(method), Some(target)) => (method, target),
        _ => return Err(ParseError::Incomplete),
    };
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::InvalidMethod)?;

    let mut host = None;
    for header in parsed.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            if host.is_some() {
                return Err(ParseError::InvalidHost);
            }
            let value = std::str::from_utf8(header.value).map_err(|_| ParseError::InvalidHost)?;
            host = Some(value.trim().to_owned());
        }
    }

    // An absolute-form target (as sent to proxies) carries the
    // authority itself, which takes precedence over any Host header.
    let target = if target.starts_with('/') || target == "*" {
        target.to_owned()
    } else {
        let url = Url::parse(target).map_err(|_| ParseError::InvalidTarget)?;
        if let Some(authority) = url.host_str() {
            host = Some(match url.port() {
                Some(port) => format!("{}:{}", authority, port),
                None => authority.to_owned(),
            });
        }
        match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_owned(),
        }
    };

    Ok(Some(Request {
        method,
        target,
        host,
    }))
}

/// An error signaling an unacceptable request head.
#[derive(Debug)]
pub enum ParseError {
    Malformed(httparse::Error),
    Incomplete,
    InvalidMethod,
    InvalidTarget,
    InvalidHost,
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        Self::Malformed(e)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed request head: {}", e),
            Self::Incomplete => f.write_str("request line is incomplete"),
            Self::InvalidMethod => f.write_str("invalid request method"),
            Self::InvalidTarget => f.write_str("invalid request target"),
            Self::InvalidHost => f.write_str("invalid Host header"),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

/// Serializes `response` as an HTTP/1.1 message and writes it to
/// `writer` in a single call. The connection is always marked for
/// closing.
pub fn write_response<W: Write>(mut writer: W, response: &Response<Vec<u8>>) -> io::Result<()> {
    let status = response.status();
    let body = response.body();

    let mut buf = Vec::with_capacity(256 + body.len());
    write!(
        buf,
        "HTTP/1.1 {} {}\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or(""),
    )?;
    for (name, value) in response.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    write!(
        buf,
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    buf.extend_from_slice(body);
    writer.write_all(&buf)?;
    writer.flush()
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use http::header::LOCATION;
    use http::StatusCode;

    use super::*;

    #[test]
    fn parse_request_works() {
        let head = b"GET /docs/intro?x=1 HTTP/1.1\r\nHost: go.example.com:8081\r\nAccept: */*\r\n\r\n";
        let request = parse_request(head).unwrap().unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.target, "/docs/intro?x=1");
        assert_eq!(request.path(), "/docs/intro");
        assert_eq!(request.host.as_deref(), Some("go.example.com:8081"));
    }

    #[test]
    fn parse_request_waits_for_complete_head() {
        let head = b"GET / HTTP/1.1\r\nHost: go.example.com\r\n\r\n";
        for len in 0..head.len() {
            assert_eq!(parse_request(&head[..len]).unwrap(), None);
        }
        assert!(parse_request(head).unwrap().is_some());
    }

    #[test]
    fn parse_request_allows_missing_host() {
        let request = parse_request(b"HEAD / HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert_eq!(request.method, Method::HEAD);
        assert_eq!(request.host, None);
    }

    #[test]
    fn parse_request_takes_authority_from_absolute_target() {
        let head = b"GET http://go.example.com:8080/a?b=c HTTP/1.1\r\nHost: other.test\r\n\r\n";
        let request = parse_request(head).unwrap().unwrap();
        assert_eq!(request.target, "/a?b=c");
        assert_eq!(request.host.as_deref(), Some("go.example.com:8080"));
    }

    #[test]
    fn parse_request_rejects_bad_heads() {
        assert!(matches!(
            parse_request(b"GET / HTTP/1.1\r\nHost: a.test\r\nHost: b.test\r\n\r\n"),
            Err(ParseError::InvalidHost)
        ));
        assert!(matches!(
            parse_request(b"GET / HTTP/1.1\r\nHost: \xff\r\n\r\n"),
            Err(ParseError::InvalidHost)
        ));
        assert!(matches!(
            parse_request(b"NOT HTTP AT ALL\r\n\r\n"),
            Err(ParseError::Malformed(_))
        ));

        let mut head = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            head.extend_from_slice(format!("X-Filler-{}: x\r\n", i).as_bytes());
        }
        head.extend_from_slice(b"\r\n");
        assert!(matches!(
            parse_request(&head),
            Err(ParseError::Malformed(httparse::Error::TooManyHeaders))
        ));
    }

    #[test]
    fn write_response_works() {
        let response = Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(LOCATION, "https://example.com/")
            .body(b"moved".to_vec())
            .unwrap();
        let mut out = Vec::new();
        write_response(&mut out, &response).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "HTTP/1.1 301 Moved Permanently\r\n\
             location: https://example.com/\r\n\
             Content-Length: 5\r\n\
             Connection: close\r\n\
             \r\n\
             moved"
        );
    }
}
