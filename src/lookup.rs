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

//! DNS TXT lookups.
//!
//! Both the HTTP [`Server`](crate::server::Server) and the certificate
//! [`HostPolicy`](crate::policy::HostPolicy) read a hostname's
//! configuration from the TXT records at `_redirect.<hostname>`. They
//! do so through the [`TxtLookup`] trait, so that tests can substitute
//! canned responses. [`TxtLookup`] is implemented for closures with the
//! right signature, which is usually the most convenient test double.
//!
//! The production implementation is [`DnsLookup`], which queries the
//! DNS with [`hickory_resolver`]. Its record cache is disabled: every
//! call issues a fresh query, so configuration changes take effect as
//! soon as they are visible in the DNS.
//!
//! Callers with a time budget use
//! [`lookup_txt_with_deadline`](TxtLookup::lookup_txt_with_deadline).
//! A lookup that has not produced an answer by the deadline fails with
//! [`Error::TimedOut`], and any late answer is discarded.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::Resolver;

/// The label prepended to a hostname to find its redirect records.
pub const REDIRECT_LABEL: &str = "_redirect";

/// Returns the name at which the redirect records for `host` live.
pub fn redirect_name(host: &str) -> String {
    format!("{}.{}", REDIRECT_LABEL, host)
}

/// A source of TXT records.
pub trait TxtLookup {
    /// Looks up the TXT records at `name`. Each returned string is one
    /// record, with its character-strings concatenated. Records are
    /// returned in the order they appear in the DNS response.
    fn lookup_txt(&self, name: &str) -> Result<Vec<String>, Error>;

    /// Like [`lookup_txt`](TxtLookup::lookup_txt), but fails with
    /// [`Error::TimedOut`] if `deadline` passes before the answer is
    /// available.
    fn lookup_txt_with_deadline(&self, name: &str, deadline: Instant) -> Result<Vec<String>, Error> {
        if Instant::now() >= deadline {
            return Err(Error::TimedOut);
        }
        let result = self.lookup_txt(name);
        if Instant::now() > deadline {
            Err(Error::TimedOut)
        } else {
            result
        }
    }
}

impl<F> TxtLookup for F
where
    F: Fn(&str) -> Result<Vec<String>, Error>,
{
    fn lookup_txt(&self, name: &str) -> Result<Vec<String>, Error> {
        self(name)
    }
}

////////////////////////////////////////////////////////////////////////
// DNS-BACKED LOOKUPS                                                 //
////////////////////////////////////////////////////////////////////////

/// A [`TxtLookup`] that queries the DNS.
pub struct DnsLookup {
    resolver: Resolver,
}

/// Where a [`DnsLookup`] sends its queries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Upstream {
    /// The resolvers in the system configuration (e.g.
    /// `/etc/resolv.conf`).
    System,
    Cloudflare,
    Google,
    Quad9,
}

/// Options for a [`DnsLookup`].
#[derive(Clone, Debug)]
pub struct DnsLookupConfig {
    pub upstream: Upstream,

    /// How long to wait for a response to each query attempt.
    pub timeout: Duration,

    /// How many times to try each query before giving up.
    pub attempts: usize,
}

impl Default for DnsLookupConfig {
    fn default() -> Self {
        Self {
            upstream: Upstream::System,
            timeout: Duration::from_secs(2),
            attempts: 2,
        }
    }
}

impl DnsLookupConfig {
    /// Returns the longest a single lookup can take before failing. This
    /// is the time budget callers should give
    /// [`lookup_txt_with_deadline`](TxtLookup::lookup_txt_with_deadline).
    pub fn deadline(&self) -> Duration {
        self.timeout * self.attempts.max(1) as u32
    }
}

impl DnsLookup {
    /// Creates a new `DnsLookup`.
    pub fn new(config: &DnsLookupConfig) -> io::Result<Self> {
        let (resolver_config, mut opts) = match config.upstream {
            Upstream::System => hickory_resolver::system_conf::read_system_conf()?,
            Upstream::Cloudflare => (ResolverConfig::cloudflare(), ResolverOpts::default()),
            Upstream::Google => (ResolverConfig::google(), ResolverOpts::default()),
            Upstream::Quad9 => (ResolverConfig::quad9(), ResolverOpts::default()),
        };
        opts.timeout = config.timeout;
        opts.attempts = config.attempts.max(1);
        opts.cache_size = 0;
        let resolver = Resolver::new(resolver_config, opts)?;
        Ok(Self { resolver })
    }
}

impl TxtLookup for DnsLookup {
    fn lookup_txt(&self, name: &str) -> Result<Vec<String>, Error> {
        let lookup = self.resolver.txt_lookup(name)?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|chunk| String::from_utf8_lossy(chunk))
                    .collect()
            })
            .collect())
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error from a [`TxtLookup`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The name exists but has no TXT records, or does not exist.
    NoRecords,

    /// No response arrived before the deadline.
    TimedOut,

    /// Any other failure, described by the message.
    Failed(String),
}

impl From<ResolveError> for Error {
    fn from(err: ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => Self::NoRecords,
            ResolveErrorKind::Timeout => Self::TimedOut,
            _ => Self::Failed(err.to_string()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NoRecords => f.write_str("no such host"),
            Self::TimedOut => f.write_str("lookup timed out"),
            Self::Failed(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
