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

//! The certificate admission gate.
//!
//! A certificate manager that issues certificates on demand (e.g. the
//! first time a client connects with a new SNI hostname) must not be
//! allowed to request certificates for arbitrary names: anyone can
//! point a hostname at the server. [`HostPolicy`] restricts issuance to
//! hostnames whose owners have published at least one redirect rule.

use std::fmt;
use std::time::Instant;

use log::debug;

use crate::lookup::{self, redirect_name, TxtLookup};
use crate::rule;

/// Decides whether a certificate may be issued for a hostname.
///
/// Issuance is allowed if and only if at least one of the hostname's
/// TXT records is a syntactically valid rule. Whether that rule would
/// ever match a request does not matter.
pub struct HostPolicy<L> {
    lookup: L,
}

impl<L> HostPolicy<L>
where
    L: TxtLookup,
{
    /// Creates a new `HostPolicy` that reads records through `lookup`.
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    /// Checks whether a certificate may be issued for `host`.
    pub fn check(&self, host: &str) -> Result<(), Denial> {
        self.check_inner(host, None)
    }

    /// Like [`check`](HostPolicy::check), but denies issuance with a
    /// [`lookup::Error::TimedOut`] if the records are not available
    /// before `deadline`.
    pub fn check_with_deadline(&self, host: &str, deadline: Instant) -> Result<(), Denial> {
        self.check_inner(host, Some(deadline))
    }

    fn check_inner(&self, host: &str, deadline: Option<Instant>) -> Result<(), Denial> {
        let name = redirect_name(host);
        let records = match deadline {
            Some(deadline) => self.lookup.lookup_txt_with_deadline(&name, deadline),
            None => self.lookup.lookup_txt(&name),
        };
        let records = records.map_err(|source| Denial::Lookup {
            name: name.clone(),
            source,
        })?;
        if records.iter().any(|record| rule::parse(record).is_some()) {
            debug!("Certificate issuance for {} allowed.", host);
            Ok(())
        } else {
            Err(Denial::NoValidRule { name })
        }
    }
}

/// The reason [`HostPolicy::check`] refused a hostname.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Denial {
    /// The TXT lookup itself failed.
    Lookup { name: String, source: lookup::Error },

    /// TXT records were found, but none of them is a redirect rule.
    NoValidRule { name: String },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Lookup { name, source } => write!(f, "DNS lookup failed for {}: {}", name, source),
            Self::NoValidRule { name } => {
                write!(f, "no valid redirect config in TXT records for {}", name)
            }
        }
    }
}

impl std::error::Error for Denial {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Lookup { source, .. } => Some(source),
            Self::NoValidRule { .. } => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with(
        response: Result<Vec<&'static str>, lookup::Error>,
    ) -> HostPolicy<impl Fn(&str) -> Result<Vec<String>, lookup::Error>> {
        HostPolicy::new(move |name: &str| {
            assert_eq!(name, "_redirect.foo.example.com");
            response
                .clone()
                .map(|records| records.into_iter().map(str::to_owned).collect())
        })
    }

    #[test]
    fn valid_rule_allows_issuance() {
        let policy = policy_with(Ok(vec!["Redirects to https://example.com"]));
        assert_eq!(policy.check("foo.example.com"), Ok(()));
    }

    #[test]
    fn rule_that_never_matches_still_allows_issuance() {
        let policy = policy_with(Ok(vec![
            "v=spf1 -all",
            "Redirects from /nothing/here to https://example.com/",
        ]));
        assert_eq!(policy.check("foo.example.com"), Ok(()));
    }

    #[test]
    fn lookup_failure_denies_issuance() {
        let policy = policy_with(Err(lookup::Error::NoRecords));
        assert_eq!(
            policy.check("foo.example.com"),
            Err(Denial::Lookup {
                name: "_redirect.foo.example.com".to_owned(),
                source: lookup::Error::NoRecords,
            })
        );
    }

    #[test]
    fn unrelated_records_deny_issuance() {
        let policy = policy_with(Ok(vec!["v=spf1 include:example.com ~all"]));
        let denial = policy.check("foo.example.com").unwrap_err();
        assert_eq!(
            denial,
            Denial::NoValidRule {
                name: "_redirect.foo.example.com".to_owned()
            }
        );
        assert_eq!(
            denial.to_string(),
            "no valid redirect config in TXT records for _redirect.foo.example.com"
        );
    }

    #[test]
    fn empty_record_set_denies_issuance() {
        let policy = policy_with(Ok(vec![]));
        assert!(matches!(
            policy.check("foo.example.com"),
            Err(Denial::NoValidRule { .. })
        ));
    }

    #[test]
    fn expired_deadline_denies_issuance() {
        let policy = policy_with(Ok(vec!["Redirects to https://example.com"]));
        assert_eq!(
            policy.check_with_deadline("foo.example.com", Instant::now()),
            Err(Denial::Lookup {
                name: "_redirect.foo.example.com".to_owned(),
                source: lookup::Error::TimedOut,
            })
        );
        let later = Instant::now() + std::time::Duration::from_secs(60);
        assert_eq!(policy.check_with_deadline("foo.example.com", later), Ok(()));
    }
}
