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

//! The request-processing logic of the redirect service.
//!
//! The [`Server`] structure is the heart of this module; see its
//! documentation for details.

use std::time::{Duration, Instant};

use http::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use http::{HeaderValue, Method, Response, StatusCode};
use log::{debug, error, info};
use url::form_urlencoded;

use crate::lookup::{redirect_name, TxtLookup};
use crate::resolve::resolve;

pub mod wire;

pub use wire::Request;

/// The path of the health-check endpoint.
pub const HEALTH_CHECK_PATH: &str = "/healthz";

/// The fallback location used when none is configured.
pub const DEFAULT_FALLBACK_URL: &str = "http://redirect.name/";

/// The `Cache-Control` value sent with permanent (301) redirects.
const PERMANENT_CACHE_CONTROL: &str = "max-age=86400";

/// The HTTP redirect service, abstracted from any underlying network
/// I/O provider.
///
/// The `Server` receives parsed [`Request`]s through
/// [`Server::handle_request`] and produces complete responses. An I/O
/// provider (see [`crate::io`]) is responsible for reading requests off
/// the network and writing the responses back.
///
/// Every request other than a health check is answered with a
/// redirect. The target is determined from the TXT records at
/// `_redirect.<host>`, where `<host>` comes from the request's `Host`
/// header, using [`resolve`]. If the records cannot be fetched or no
/// rule matches, the client is sent (with a 302) to the fallback
/// location, with a `#reason=...` fragment describing what went wrong.
/// A lookup that outlasts the [lookup timeout](Server::with_lookup_timeout)
/// is treated as failed.
pub struct Server<L> {
    lookup: L,
    fallback: String,
    lookup_timeout: Option<Duration>,
}

impl<L> Server<L> {
    /// Creates a new `Server` that reads TXT records through `lookup`
    /// and sends unresolvable requests to `fallback`.
    pub fn new(lookup: L, fallback: impl Into<String>) -> Self {
        Self {
            lookup,
            fallback: fallback.into(),
            lookup_timeout: None,
        }
    }

    /// Bounds the time spent on each request's TXT lookup.
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = Some(timeout);
        self
    }

    /// Returns the fallback location.
    pub fn fallback(&self) -> &str {
        &self.fallback
    }
}

impl<L> Server<L>
where
    L: TxtLookup,
{
    /// Handles a request. This is the API through which I/O providers
    /// submit requests.
    pub fn handle_request(&self, request: &Request) -> Response<Vec<u8>> {
        if request.path() == HEALTH_CHECK_PATH {
            return plain_text_response(StatusCode::OK, "ok\n");
        }

        let host = match request.host.as_deref().map(host_without_port) {
            Some(host) if !host.is_empty() => host,
            _ => return self.fallback_response(request, "Missing Host header"),
        };

        let name = redirect_name(host);
        let records = match self.lookup_timeout {
            Some(timeout) => self
                .lookup
                .lookup_txt_with_deadline(&name, Instant::now() + timeout),
            None => self.lookup.lookup_txt(&name),
        };
        let records = match records {
            Ok(records) => records,
            Err(e) => {
                info!("TXT lookup for {} failed: {}", host, e);
                let reason = format!("Could not resolve hostname ({})", e);
                return self.fallback_response(request, &reason);
            }
        };

        match resolve(&records, &request.target) {
            Ok(redirect) => {
                debug!(
                    "{}{} -> {} {}",
                    host,
                    request.target,
                    redirect.status.as_u16(),
                    redirect.location,
                );
                let cache = redirect.status == StatusCode::MOVED_PERMANENTLY;
                redirect_response(request, &redirect.location, redirect.status, cache)
                    .unwrap_or_else(|| {
                        self.fallback_response(request, "Invalid redirect location")
                    })
            }
            Err(e) => {
                debug!("{}{} -> fallback ({})", host, request.target, e);
                self.fallback_response(request, &e.to_string())
            }
        }
    }

    /// Produces the redirect to the fallback location.
    fn fallback_response(&self, request: &Request, reason: &str) -> Response<Vec<u8>> {
        let mut location = self.fallback.clone();
        if !reason.is_empty() {
            location.push_str("#reason=");
            location.push_str(&query_escape(reason));
        }
        redirect_response(request, &location, StatusCode::FOUND, false).unwrap_or_else(|| {
            error!("Fallback location {:?} is not a valid header value.", location);
            plain_text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
        })
    }
}

/// Builds a redirect response. Returns [`None`] if `location` cannot be
/// sent in a header.
fn redirect_response(
    request: &Request,
    location: &str,
    status: StatusCode,
    cache: bool,
) -> Option<Response<Vec<u8>>> {
    let location_value = HeaderValue::from_bytes(location.as_bytes()).ok()?;
    let mut builder = Response::builder()
        .status(status)
        .header(LOCATION, location_value);
    if cache {
        builder = builder.header(CACHE_CONTROL, PERMANENT_CACHE_CONTROL);
    }

    // GET responses carry a short hypertext note for clients that do not
    // follow redirects. Other methods get an empty body.
    let body = if request.method == Method::GET {
        builder = builder.header(CONTENT_TYPE, "text/html; charset=utf-8");
        format!(
            "<a href=\"{}\">{}</a>.\n",
            escape_html(location),
            status.canonical_reason().unwrap_or("Redirect"),
        )
        .into_bytes()
    } else {
        Vec::new()
    };
    builder.body(body).ok()
}

/// Builds a response with a plain-text body.
pub(crate) fn plain_text_response(status: StatusCode, text: &str) -> Response<Vec<u8>> {
    let mut response = Response::new(text.as_bytes().to_vec());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Strips any port from a `Host` header value. Bracketed IPv6 literals
/// lose their brackets.
fn host_without_port(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(address, _)| address);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Escapes `text` for use in a query string or fragment. Letters,
/// digits, `-`, `_`, `.` and `~` are kept, spaces become `+`, and every
/// other byte is percent-encoded.
fn query_escape(text: &str) -> String {
    // form_urlencoded differs only in keeping `*` and encoding `~`. Any
    // `%` in its output starts an escape, so "%7E" can only be a `~`.
    form_urlencoded::byte_serialize(text.as_bytes())
        .collect::<String>()
        .replace('*', "%2A")
        .replace("%7E", "~")
}

/// Escapes the characters with special meaning in HTML.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::lookup;

    type Lookup = Box<dyn Fn(&str) -> Result<Vec<String>, lookup::Error>>;

    fn server_with(records: &[&str]) -> Server<Lookup> {
        let records: Vec<String> = records.iter().map(|&r| r.to_owned()).collect();
        let lookup: Lookup = Box::new(move |_: &str| -> Result<Vec<String>, lookup::Error> {
            Ok(records.clone())
        });
        Server::new(lookup, DEFAULT_FALLBACK_URL)
    }

    fn get(target: &str) -> Request {
        Request {
            method: Method::GET,
            target: target.to_owned(),
            host: Some("go.example.com".to_owned()),
        }
    }

    fn header<'a>(response: &'a Response<Vec<u8>>, name: &str) -> Option<&'a str> {
        response
            .headers()
            .get(name)
            .map(|value| value.to_str().unwrap())
    }

    #[test]
    fn permanent_redirect_is_cacheable() {
        let server = server_with(&["Redirects permanently to https://example.com/"]);
        let response = server.handle_request(&get("/"));
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(header(&response, "location"), Some("https://example.com/"));
        assert_eq!(header(&response, "cache-control"), Some("max-age=86400"));
    }

    #[test]
    fn temporary_redirect_is_not_cacheable() {
        let server = server_with(&["Redirects to https://example.com/landing"]);
        let response = server.handle_request(&get("/"));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            header(&response, "location"),
            Some("https://example.com/landing")
        );
        assert_eq!(header(&response, "cache-control"), None);
    }

    #[test]
    fn explicit_308_is_not_cacheable() {
        let server = server_with(&["Redirects to https://example.com/ with 308"]);
        let response = server.handle_request(&get("/"));
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(header(&response, "cache-control"), None);
    }

    #[test]
    fn path_rules_take_priority_over_catch_all() {
        let server = server_with(&[
            "Redirects from /docs/* to https://docs.example.com/*",
            "Redirects to https://example.com/",
        ]);
        let response = server.handle_request(&get("/docs/intro"));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            header(&response, "location"),
            Some("https://docs.example.com/intro")
        );

        let response = server.handle_request(&get("/other"));
        assert_eq!(header(&response, "location"), Some("https://example.com/"));
    }

    #[test]
    fn unmatched_requests_fall_back_with_reason() {
        let server = server_with(&["v=spf1 include:example.com ~all"]);
        let response = server.handle_request(&get("/"));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            header(&response, "location"),
            Some("http://redirect.name/#reason=No+paths+matched")
        );
        assert_eq!(header(&response, "cache-control"), None);
    }

    #[test]
    fn dns_failures_fall_back_with_reason() {
        let server = Server::new(
            |_: &str| -> Result<Vec<String>, lookup::Error> { Err(lookup::Error::NoRecords) },
            "https://fallback.test/",
        );
        let response = server.handle_request(&get("/"));
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            header(&response, "location"),
            Some("https://fallback.test/#reason=Could+not+resolve+hostname+%28no+such+host%29")
        );
    }

    #[test]
    fn lookup_uses_host_without_port() {
        let names = Mutex::new(Vec::new());
        let server = Server::new(
            |name: &str| -> Result<Vec<String>, lookup::Error> {
                names.lock().unwrap().push(name.to_owned());
                Ok(vec!["Redirects to https://example.com/".to_owned()])
            },
            DEFAULT_FALLBACK_URL,
        );
        for host in ["go.example.com:8081", "go.example.com", "[::1]:80"] {
            let mut request = get("/");
            request.host = Some(host.to_owned());
            server.handle_request(&request);
        }
        assert_eq!(
            *names.lock().unwrap(),
            [
                "_redirect.go.example.com",
                "_redirect.go.example.com",
                "_redirect.::1"
            ]
        );
    }

    #[test]
    fn missing_host_falls_back() {
        let server = server_with(&["Redirects to https://example.com/"]);
        let mut request = get("/");
        request.host = None;
        let response = server.handle_request(&request);
        assert_eq!(
            header(&response, "location"),
            Some("http://redirect.name/#reason=Missing+Host+header")
        );
    }

    #[test]
    fn unencodable_location_falls_back() {
        let server = server_with(&["Redirects to https://example.com/\u{1}"]);
        let response = server.handle_request(&get("/"));
        assert_eq!(
            header(&response, "location"),
            Some("http://redirect.name/#reason=Invalid+redirect+location")
        );
    }

    #[test]
    fn health_check_answers_ok() {
        let server = server_with(&[]);
        for target in ["/healthz", "/healthz?verbose=1"] {
            let response = server.handle_request(&get(target));
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.body(), b"ok\n");
        }
    }

    #[test]
    fn query_strings_are_part_of_the_matched_path() {
        let server = server_with(&["Redirects from /go/* to https://example.com/*"]);
        let response = server.handle_request(&get("/go/search?q=rust"));
        assert_eq!(
            header(&response, "location"),
            Some("https://example.com/search?q=rust")
        );
    }

    #[test]
    fn slow_lookups_fall_back_after_the_timeout() {
        let server = Server::new(
            |_: &str| -> Result<Vec<String>, lookup::Error> {
                std::thread::sleep(Duration::from_millis(50));
                Ok(vec!["Redirects to https://example.com/".to_owned()])
            },
            DEFAULT_FALLBACK_URL,
        )
        .with_lookup_timeout(Duration::from_millis(10));
        let response = server.handle_request(&get("/"));
        assert_eq!(
            header(&response, "location"),
            Some("http://redirect.name/#reason=Could+not+resolve+hostname+%28lookup+timed+out%29")
        );
    }

    #[test]
    fn fallback_reasons_are_query_escaped() {
        let server = Server::new(
            |_: &str| -> Result<Vec<String>, lookup::Error> {
                Err(lookup::Error::Failed("a*b ~c/d%7E".to_owned()))
            },
            DEFAULT_FALLBACK_URL,
        );
        let response = server.handle_request(&get("/"));
        assert_eq!(
            header(&response, "location"),
            Some("http://redirect.name/#reason=Could+not+resolve+hostname+%28a%2Ab+~c%2Fd%257E%29")
        );
    }

    #[test]
    fn query_escape_works() {
        assert_eq!(query_escape("AZaz09-_.~"), "AZaz09-_.~");
        assert_eq!(query_escape("a b"), "a+b");
        assert_eq!(query_escape("*+&=#"), "%2A%2B%26%3D%23");
        assert_eq!(query_escape("é"), "%C3%A9");
    }

    #[test]
    fn only_get_redirects_carry_a_note() {
        let server = server_with(&["Redirects to https://example.com/"]);
        for method in [Method::POST, Method::PUT, Method::HEAD] {
            let mut request = get("/");
            request.method = method.clone();
            let response = server.handle_request(&request);
            assert_eq!(response.status(), StatusCode::FOUND, "{}", method);
            assert_eq!(header(&response, "location"), Some("https://example.com/"));
            assert!(response.body().is_empty(), "{}", method);
            assert_eq!(header(&response, "content-type"), None);
        }
    }

    #[test]
    fn get_redirects_carry_a_note_but_head_redirects_do_not() {
        let server = server_with(&["Redirects to https://example.com/?a=1&b=2"]);
        let response = server.handle_request(&get("/"));
        assert_eq!(
            String::from_utf8(response.body().clone()).unwrap(),
            "<a href=\"https://example.com/?a=1&amp;b=2\">Found</a>.\n"
        );

        let mut request = get("/");
        request.method = Method::HEAD;
        let response = server.handle_request(&request);
        assert!(response.body().is_empty());
        assert_eq!(header(&response, "content-type"), None);
    }

    #[test]
    fn host_without_port_works() {
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("example.com:443"), "example.com");
        assert_eq!(host_without_port("[2001:db8::1]:8080"), "2001:db8::1");
        assert_eq!(host_without_port("[2001:db8::1]"), "2001:db8::1");
        assert_eq!(host_without_port(" example.com "), "example.com");
    }
}
