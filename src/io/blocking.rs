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

//! Implementation of the blocking I/O provider.

// NOTE: I/O errors end the task they occur in. For an accept loop this
// means the thread is respawned (after a delay if it last started
// recently), so a listener that keeps failing cannot burn CPU. For a
// connection handler it means the connection is dropped.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use http::{Response, StatusCode};
use log::{debug, error, info};

use super::socket::Listener;
use crate::lookup::TxtLookup;
use crate::server::wire::{self, ParseError, Request, MAX_HEAD_LEN};
use crate::server::{plain_text_response, Server};
use crate::thread::{self as threads, PoolConfig, ThreadGroup, WorkerPool};

/// A blocking I/O provider.
///
/// Each accepted connection is served by one thread from a worker
/// pool: the request head is read, the response written and the
/// connection closed. Keep-alive is not supported.
///
/// # Graceful shutdown
///
/// On targets where accepting with a timeout is possible (currently
/// **Unix**), shutting down the [`ThreadGroup`] passed to
/// [`BlockingIoProvider::start`] stops the accept loops within
/// [`CHECK_FOR_SHUTDOWN_TIMEOUT`]. Connections already accepted are
/// served to completion, which is bounded by the configured read and
/// write timeouts. Support can be probed through
/// [`BlockingIoProvider::SUPPORTS_GRACEFUL_SHUTDOWN`].
pub struct BlockingIoProvider {
    config: BlockingIoConfig,
    listeners: Vec<Listener>,
}

/// Configuration options for the [`BlockingIoProvider`].
#[derive(Clone, Debug)]
pub struct BlockingIoConfig {
    /// The number of long-lived connection workers.
    pub base_workers: usize,

    /// How many extra threads may be started to serve connections when
    /// every base worker is busy. Connections beyond that are answered
    /// with 503 Service Unavailable.
    pub max_auxiliary_workers: usize,

    /// How long a client has to send a complete request head.
    pub read_timeout: Duration,

    /// How long writing a response may take.
    pub write_timeout: Duration,
}

impl Default for BlockingIoConfig {
    fn default() -> Self {
        Self {
            base_workers: 8,
            max_auxiliary_workers: 256,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl BlockingIoProvider {
    /// Whether the `BlockingIoProvider` supports graceful shutdown on
    /// the target system.
    pub const SUPPORTS_GRACEFUL_SHUTDOWN: bool = Listener::POLL_ACCEPT_WORKS;

    /// Creates a new `BlockingIoProvider`, binding a listener to each
    /// address. Nothing is served until [`BlockingIoProvider::start`].
    pub fn bind<A>(config: BlockingIoConfig, addrs: A) -> io::Result<Self>
    where
        A: IntoIterator<Item = SocketAddr>,
    {
        let listeners = addrs
            .into_iter()
            .map(Listener::bind)
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { config, listeners })
    }

    /// Returns the addresses the listeners are actually bound to. This
    /// resolves port 0 to the port chosen by the system.
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(Listener::local_addr).collect()
    }

    /// Starts serving on the provided [`ThreadGroup`].
    pub fn start<L>(self, server: &Arc<Server<L>>, group: &Arc<ThreadGroup>) -> Result<(), threads::Error>
    where
        L: TxtLookup + Send + Sync + 'static,
    {
        let pool = group.start_pool(
            "http",
            PoolConfig {
                base_workers: self.config.base_workers,
                max_auxiliary: self.config.max_auxiliary_workers,
            },
        )?;
        let limits = Arc::new(self.config);
        for listener in self.listeners {
            let addr = listener.local_addr()?;
            info!("Listening for HTTP on {}", addr);
            let pool = pool.clone();
            let server = server.clone();
            let limits = limits.clone();
            let task = move || log_io_errors(run_listener(&pool, &server, &limits, &listener));
            group.start_respawnable(format!("http listener {}", addr), task)?;
        }
        Ok(())
    }
}

/// The maximum interval between checks for shutdown in the accept
/// loops, and so the longest a shutdown has to wait for them. Only
/// effective when [`BlockingIoProvider::SUPPORTS_GRACEFUL_SHUTDOWN`].
pub const CHECK_FOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// The accept loop.
fn run_listener<L>(
    pool: &Arc<WorkerPool>,
    server: &Arc<Server<L>>,
    limits: &Arc<BlockingIoConfig>,
    listener: &Listener,
) -> io::Result<()>
where
    L: TxtLookup + Send + Sync + 'static,
{
    loop {
        if pool.is_shutting_down() {
            return Ok(());
        }
        if !listener.poll_accept(CHECK_FOR_SHUTDOWN_TIMEOUT)? {
            continue;
        }

        // Drain every pending connection. Without accept polling this
        // blocks for the next one instead.
        loop {
            let (client, peer) = match retry_if_interrupted(|| listener.accept()) {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };

            let task = {
                let server = server.clone();
                let limits = limits.clone();
                let client = client.try_clone()?;
                move || log_io_errors(handle_connection(&server, &limits, client, peer))
            };
            match pool.execute(task) {
                Ok(()) => (),
                Err(threads::Error::Saturated) => {
                    threads::warn_saturated(pool);
                    log_io_errors(refuse_connection(limits, client));
                }
                // The connection is dropped, and so closed.
                Err(threads::Error::ShuttingDown) => return Ok(()),
                Err(threads::Error::Io(e)) => return Err(e),
            }
        }
    }
}

/// What came of reading a request head.
enum Incoming {
    Request(Request),
    Rejected(Response<Vec<u8>>),
    Abandoned,
}

/// Serves a single connection.
fn handle_connection<L>(
    server: &Server<L>,
    limits: &BlockingIoConfig,
    mut socket: TcpStream,
    peer: SocketAddr,
) -> io::Result<()>
where
    L: TxtLookup,
{
    socket.set_write_timeout(Some(limits.write_timeout))?;
    let response = match read_request(&mut socket, limits.read_timeout)? {
        Incoming::Request(request) => server.handle_request(&request),
        Incoming::Rejected(response) => {
            debug!("Rejected request from {}: {}", peer, response.status());
            response
        }
        Incoming::Abandoned => return Ok(()),
    };
    wire::write_response(&mut socket, &response)?;

    // The client may already be gone; there is nothing to do about it.
    let _ = socket.shutdown(Shutdown::Both);
    Ok(())
}

/// Answers a connection we have no worker for.
fn refuse_connection(limits: &BlockingIoConfig, socket: TcpStream) -> io::Result<()> {
    socket.set_write_timeout(Some(limits.write_timeout))?;
    let response = plain_text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable\n");
    wire::write_response(&socket, &response)
}

/// Reads a request head. The client gets `timeout` to send all of it,
/// which bounds Slowloris-style attacks. Returns
/// [`Incoming::Abandoned`] if the client closes the connection or runs
/// out of time.
fn read_request(socket: &mut TcpStream, timeout: Duration) -> io::Result<Incoming> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0; MAX_HEAD_LEN];
    let mut n_read = 0;

    loop {
        let remaining = match compute_timeout(deadline) {
            Some(t) => t,
            None => return Ok(Incoming::Abandoned),
        };
        socket.set_read_timeout(Some(remaining))?;
        let n = match socket.read(&mut buf[n_read..]) {
            Ok(0) => return Ok(Incoming::Abandoned),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Incoming::Abandoned),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(Incoming::Abandoned),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        n_read += n;

        match wire::parse_request(&buf[..n_read]) {
            Ok(Some(request)) => return Ok(Incoming::Request(request)),
            Ok(None) if n_read == buf.len() => {
                return Ok(Incoming::Rejected(plain_text_response(
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                    "Request Header Fields Too Large\n",
                )))
            }
            Ok(None) => (),
            Err(e) => return Ok(Incoming::Rejected(bad_request(&e))),
        }
    }
}

fn bad_request(error: &ParseError) -> Response<Vec<u8>> {
    let status = match error {
        ParseError::Malformed(httparse::Error::TooManyHeaders) => {
            StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
        }
        _ => StatusCode::BAD_REQUEST,
    };
    let reason = status.canonical_reason().unwrap_or("Bad Request");
    plain_text_response(status, &format!("{}\n", reason))
}

/// Computes the time until the deadline. Returns [`None`] if the
/// deadline has passed.
fn compute_timeout(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|t| !t.is_zero())
}

/// Executes `f`, retrying the operation if it is interrupted.
fn retry_if_interrupted<F, R>(mut f: F) -> io::Result<R>
where
    F: FnMut() -> io::Result<R>,
{
    loop {
        match f() {
            Ok(r) => return Ok(r),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Logs errors if a task exits with an I/O error.
fn log_io_errors<T>(result: io::Result<T>) {
    if let Err(e) = result {
        let current_thread = thread::current();
        let thread_name = current_thread.name().unwrap_or("anonymous thread");
        error!("I/O error in thread {}: {}", thread_name, e);
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::lookup;

    type Lookup = fn(&str) -> Result<Vec<String>, lookup::Error>;

    fn records(name: &str) -> Result<Vec<String>, lookup::Error> {
        match name {
            "_redirect.go.example.com" => Ok(vec![
                "Redirects from /docs/* to https://docs.example.com/*".to_owned(),
                "Redirects permanently to https://example.com/".to_owned(),
            ]),
            _ => Err(lookup::Error::NoRecords),
        }
    }

    struct Running {
        group: Arc<ThreadGroup>,
        addr: SocketAddr,
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.group.shut_down();
            if BlockingIoProvider::SUPPORTS_GRACEFUL_SHUTDOWN {
                self.group.await_shutdown();
            }
        }
    }

    fn start(config: BlockingIoConfig) -> Running {
        let loopback = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let provider = BlockingIoProvider::bind(config, [loopback]).unwrap();
        let addr = provider.local_addrs().unwrap()[0];
        let server = Arc::new(Server::new(records as Lookup, "https://fallback.test/"));
        let group = ThreadGroup::new();
        provider.start(&server, &group).unwrap();
        Running { group, addr }
    }

    fn exchange(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(request).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        String::from_utf8(response).unwrap()
    }

    #[test]
    fn serves_redirects_over_tcp() {
        let running = start(BlockingIoConfig::default());

        let response = exchange(
            running.addr,
            b"GET /docs/start HTTP/1.1\r\nHost: go.example.com\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(response.contains("\r\nlocation: https://docs.example.com/start\r\n"));
        assert!(response.contains("\r\nConnection: close\r\n"));

        let response = exchange(
            running.addr,
            b"HEAD / HTTP/1.1\r\nHost: go.example.com:80\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
        assert!(response.contains("\r\ncache-control: max-age=86400\r\n"));
        assert!(response.ends_with("Content-Length: 0\r\nConnection: close\r\n\r\n"));

        let response = exchange(
            running.addr,
            b"GET / HTTP/1.1\r\nHost: unknown.example.com\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 302 Found\r\n"));
        assert!(response.contains(
            "\r\nlocation: https://fallback.test/#reason=Could+not+resolve+hostname+%28no+such+host%29\r\n"
        ));
    }

    #[test]
    fn serves_health_checks() {
        let running = start(BlockingIoConfig::default());
        let response = exchange(running.addr, b"GET /healthz HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nok\n"));
    }

    #[test]
    fn rejects_malformed_requests() {
        let running = start(BlockingIoConfig::default());
        let response = exchange(running.addr, b"GARBAGE\0\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        let mut huge = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        huge.resize(MAX_HEAD_LEN, b'a');
        let response = exchange(running.addr, &huge);
        assert!(response.starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
    }

    #[test]
    fn drops_slow_clients() {
        let running = start(BlockingIoConfig {
            read_timeout: Duration::from_millis(100),
            ..BlockingIoConfig::default()
        });
        let response = exchange(running.addr, b"GET / HTTP/1.1\r\nHost: go.exa");
        assert_eq!(response, "");
    }
}
