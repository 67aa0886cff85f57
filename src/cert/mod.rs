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

//! Certificate persistence.
//!
//! A certificate manager stores its account key, issued certificates,
//! and similar material through the [`Cache`] trait, a plain key/value
//! interface. Keys are either domain names (for certificates) or other
//! identifiers (for account keys and the like).
//!
//! [`DirCache`] stores each entry as a file in a directory.
//! [`RateLimitedCache`] wraps any other [`Cache`] and refuses to store
//! more than [`CERTIFICATES_PER_WEEK`] certificates per registrable
//! domain each week. Since a certificate manager stores every
//! certificate it obtains, this bounds how often it will come back to
//! the certificate authority for a domain, well inside the authority's
//! own rate limits.
//!
//! Every operation also has a `*_with_deadline` form. A caller that
//! must give up at some point passes an [`Instant`]; once it has passed,
//! the operation fails with [`Error::TimedOut`] and leaves the store as
//! it was.

use std::fmt;
use std::io;
use std::time::Instant;

mod dir;
mod rate_limit;

pub use dir::DirCache;
pub use rate_limit::{apex_domain, RateLimitedCache, CERTIFICATES_PER_WEEK};

/// A key/value store for certificate material.
pub trait Cache {
    /// Retrieves the data stored under `key`. Returns
    /// [`Error::CacheMiss`] if there is none.
    fn get(&self, key: &str) -> Result<Vec<u8>, Error>;

    /// Stores `data` under `key`, replacing any existing data.
    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error>;

    /// Removes the data stored under `key`, if any.
    fn delete(&self, key: &str) -> Result<(), Error>;

    /// Like [`get`](Cache::get), but fails with [`Error::TimedOut`] if
    /// `deadline` has passed.
    fn get_with_deadline(&self, key: &str, deadline: Instant) -> Result<Vec<u8>, Error> {
        check_deadline(deadline)?;
        self.get(key)
    }

    /// Like [`put`](Cache::put), but fails with [`Error::TimedOut`]
    /// without storing anything if `deadline` has passed.
    fn put_with_deadline(&self, key: &str, data: &[u8], deadline: Instant) -> Result<(), Error> {
        check_deadline(deadline)?;
        self.put(key, data)
    }

    /// Like [`delete`](Cache::delete), but fails with
    /// [`Error::TimedOut`] without removing anything if `deadline` has
    /// passed.
    fn delete_with_deadline(&self, key: &str, deadline: Instant) -> Result<(), Error> {
        check_deadline(deadline)?;
        self.delete(key)
    }
}

impl<C> Cache for &C
where
    C: Cache + ?Sized,
{
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        (**self).get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        (**self).put(key, data)
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        (**self).delete(key)
    }

    fn get_with_deadline(&self, key: &str, deadline: Instant) -> Result<Vec<u8>, Error> {
        (**self).get_with_deadline(key, deadline)
    }

    fn put_with_deadline(&self, key: &str, data: &[u8], deadline: Instant) -> Result<(), Error> {
        (**self).put_with_deadline(key, data, deadline)
    }

    fn delete_with_deadline(&self, key: &str, deadline: Instant) -> Result<(), Error> {
        (**self).delete_with_deadline(key, deadline)
    }
}

/// Returns [`Error::TimedOut`] if `deadline` has passed.
fn check_deadline(deadline: Instant) -> Result<(), Error> {
    if Instant::now() >= deadline {
        Err(Error::TimedOut)
    } else {
        Ok(())
    }
}

/// An error from a [`Cache`] operation.
#[derive(Debug)]
pub enum Error {
    /// Nothing is stored under the key.
    CacheMiss,

    /// The key cannot be used with this cache.
    InvalidKey(String),

    /// The underlying storage failed.
    Io(io::Error),

    /// The weekly certificate quota for the registrable domain `apex`
    /// is used up.
    RateLimited { apex: String },

    /// The caller's deadline passed before the operation completed.
    TimedOut,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CacheMiss => f.write_str("cache miss"),
            Self::InvalidKey(key) => write!(f, "invalid cache key {:?}", key),
            Self::Io(err) => err.fmt(f),
            Self::RateLimited { apex } => write!(
                f,
                "rate limit exceeded: {} certs already issued for {} this week",
                CERTIFICATES_PER_WEEK, apex,
            ),
            Self::TimedOut => f.write_str("deadline exceeded"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
