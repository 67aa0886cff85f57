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

//! Implementation of the [`RateLimitedCache`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use super::{Cache, Error};
use crate::clock::{Clock, SystemClock};

/// How many certificates may be stored per registrable domain each
/// week.
pub const CERTIFICATES_PER_WEEK: usize = 2;

/// The width of a quota period.
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Seconds from 0001-01-01 00:00:00 UTC, a Monday, to the Unix epoch.
/// Quota weeks are counted from there, so they begin on Mondays.
const WEEK_ORIGIN_TO_UNIX_EPOCH: u64 = 62_135_596_800;

/// A [`Cache`] wrapper enforcing a weekly certificate quota per
/// registrable domain.
///
/// Every [`put`](Cache::put) under a domain-name key counts against the
/// quota of the key's registrable domain (its "apex", i.e. the public
/// suffix plus one label, so `a.example.com` and `b.example.com` share
/// the quota of `example.com`). Once [`CERTIFICATES_PER_WEEK`] puts have
/// succeeded for an apex, further puts fail with
/// [`Error::RateLimited`] without reaching the wrapped cache. Keys that
/// are not domain names, such as account keys, are never limited.
/// [`get`](Cache::get) and [`delete`](Cache::delete) pass straight
/// through.
///
/// Weeks are consecutive seven-day periods beginning Monday 00:00 UTC,
/// not rolling windows. All counts are dropped when a new week begins.
///
/// [`put_with_deadline`](Cache::put_with_deadline) gives up with
/// [`Error::TimedOut`] if the deadline passes while it waits for other
/// puts or before the wrapped cache reports success. A timed-out put
/// never counts against the quota.
///
/// The counts live only in memory and are lost on restart. The
/// certificate authority enforces its own limits regardless; this is a
/// local margin below them.
pub struct RateLimitedCache<C, K = SystemClock> {
    inner: C,
    clock: K,
    quota: Mutex<Quota>,
}

/// The per-week certificate counts of a [`RateLimitedCache`].
struct Quota {
    week: u64,
    counts: HashMap<String, usize>,
}

impl<C> RateLimitedCache<C>
where
    C: Cache,
{
    /// Wraps `inner`, reading the time from the system clock.
    pub fn new(inner: C) -> Self {
        Self::with_clock(inner, SystemClock)
    }
}

impl<C, K> RateLimitedCache<C, K>
where
    C: Cache,
    K: Clock,
{
    /// Wraps `inner`, reading the time from `clock`.
    pub fn with_clock(inner: C, clock: K) -> Self {
        let week = week_of(clock.now());
        Self {
            inner,
            clock,
            quota: Mutex::new(Quota {
                week,
                counts: HashMap::new(),
            }),
        }
    }

    /// Returns the wrapped cache.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Returns how many certificates have been stored for `apex` in the
    /// current week.
    pub fn issued(&self, apex: &str) -> usize {
        let mut quota = self.quota.lock().unwrap();
        quota.roll_over(week_of(self.clock.now()));
        quota.counts.get(apex).copied().unwrap_or(0)
    }
}

impl Quota {
    /// Starts a fresh set of counts if `week` is not the current one.
    fn roll_over(&mut self, week: u64) {
        if week != self.week {
            if !self.counts.is_empty() {
                debug!("New certificate quota week; resetting counts.");
            }
            self.counts.clear();
            self.week = week;
        }
    }
}

impl<C, K> Cache for RateLimitedCache<C, K>
where
    C: Cache,
    K: Clock,
{
    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), Error> {
        self.put_limited(key, data, None)
    }

    fn put_with_deadline(&self, key: &str, data: &[u8], deadline: Instant) -> Result<(), Error> {
        self.put_limited(key, data, Some(deadline))
    }

    fn delete(&self, key: &str) -> Result<(), Error> {
        self.inner.delete(key)
    }

    fn get_with_deadline(&self, key: &str, deadline: Instant) -> Result<Vec<u8>, Error> {
        self.inner.get_with_deadline(key, deadline)
    }

    fn delete_with_deadline(&self, key: &str, deadline: Instant) -> Result<(), Error> {
        self.inner.delete_with_deadline(key, deadline)
    }
}

impl<C, K> RateLimitedCache<C, K>
where
    C: Cache,
    K: Clock,
{
    fn put_limited(&self, key: &str, data: &[u8], deadline: Option<Instant>) -> Result<(), Error> {
        let apex = match apex_domain(key) {
            Some(apex) => apex,
            None => {
                return match deadline {
                    Some(deadline) => self.inner.put_with_deadline(key, data, deadline),
                    None => self.inner.put(key, data),
                }
            }
        };

        // The lock is held across the inner put so that the check and
        // the increment cannot interleave with another put.
        let mut quota = self.quota.lock().unwrap();
        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            debug!("Deadline passed before storing a certificate for {}.", key);
            return Err(Error::TimedOut);
        }
        quota.roll_over(week_of(self.clock.now()));
        if quota.counts.get(apex).copied().unwrap_or(0) >= CERTIFICATES_PER_WEEK {
            warn!(
                "Refusing to store a certificate for {}: weekly quota for {} is used up.",
                key, apex,
            );
            return Err(Error::RateLimited {
                apex: apex.to_owned(),
            });
        }
        match deadline {
            Some(deadline) => self.inner.put_with_deadline(key, data, deadline)?,
            None => self.inner.put(key, data)?,
        }
        *quota.counts.entry(apex.to_owned()).or_insert(0) += 1;
        Ok(())
    }
}

/// Returns the registrable domain ("eTLD+1") of `key`, or [`None`] if
/// `key` is not a domain name with at least one label below a public
/// suffix.
pub fn apex_domain(key: &str) -> Option<&str> {
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return None;
    }
    psl::domain_str(key)
}

/// Returns the quota period containing `time`, as a count of weeks
/// since 0001-01-01.
fn week_of(time: SystemTime) -> u64 {
    let since_origin = match time.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => WEEK_ORIGIN_TO_UNIX_EPOCH + since_epoch.as_secs(),
        Err(e) => {
            let before_epoch = e.duration();
            let whole_secs = before_epoch.as_secs() + u64::from(before_epoch.subsec_nanos() > 0);
            WEEK_ORIGIN_TO_UNIX_EPOCH.saturating_sub(whole_secs)
        }
    };
    since_origin / WEEK.as_secs()
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
