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

//! TCP listening sockets with accept timeouts where the target allows.
//!
//! The standard library cannot wait for an incoming connection with a
//! timeout, which the accept loop needs in order to notice shutdown. On
//! Unix targets, [`Listener`] provides this through `poll(2)`. Elsewhere
//! [`Listener::poll_accept`] returns at once and the accept loop simply
//! blocks in `accept`, so graceful shutdown is unavailable.

use std::io;
use std::net::{self, SocketAddr, TcpStream};
use std::time::Duration;

/// A listening TCP socket.
pub(crate) struct Listener {
    inner: net::TcpListener,
}

impl Listener {
    /// Whether [`Listener::poll_accept`] actually waits on this target.
    pub const POLL_ACCEPT_WORKS: bool = imp::POLL_ACCEPT_WORKS;

    /// Binds a listener to `addr`. Where accept polling works, the
    /// socket is switched to non-blocking mode so that the accept loop
    /// can drain every pending connection after a wakeup.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = net::TcpListener::bind(addr)?;
        if Self::POLL_ACCEPT_WORKS {
            inner.set_nonblocking(true)?;
        }
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Waits until a connection can be accepted or `timeout` passes.
    /// Returns whether a connection is ready. An interrupted wait
    /// reports `false`.
    pub fn poll_accept(&self, timeout: Duration) -> io::Result<bool> {
        imp::poll_accept(&self.inner, timeout)
    }

    /// Accepts a connection. The returned stream is always in blocking
    /// mode, since some targets let it inherit the listener's mode.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept()?;
        if Self::POLL_ACCEPT_WORKS {
            stream.set_nonblocking(false)?;
        }
        Ok((stream, peer))
    }
}

#[cfg(unix)]
mod imp {
    use std::io;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags};

    pub const POLL_ACCEPT_WORKS: bool = true;

    pub fn poll_accept(listener: &TcpListener, timeout: Duration) -> io::Result<bool> {
        let millis = timeout.as_millis().try_into().unwrap_or(i32::MAX);
        let mut fds = [PollFd::new(listener.as_raw_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, millis) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::io;
    use std::net::TcpListener;
    use std::time::Duration;

    pub const POLL_ACCEPT_WORKS: bool = false;

    pub fn poll_accept(_listener: &TcpListener, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }
}
