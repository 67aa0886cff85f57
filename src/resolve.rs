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

//! Choosing one redirect from the full set of a hostname's records.

use std::fmt;

use crate::rule::{self, Redirect, Rule};

/// Resolves the redirect for `path` given the TXT `records` published
/// for a hostname.
///
/// Records that are not valid rules are skipped. Scoped rules (those
/// with a `from` clause) are tried as they are encountered, in record
/// order, and the first one that matches wins. Catch-all rules are set
/// aside and only tried, in the order they were encountered, once every
/// record has been seen without a scoped match. Thus a specific rule
/// always beats a catch-all, wherever the two appear among the records.
pub fn resolve<I, S>(records: I, path: &str) -> Result<Redirect, NoMatchError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut catch_alls: Vec<Rule> = Vec::new();
    for record in records {
        let rule = match rule::parse(record.as_ref()) {
            Some(rule) => rule,
            None => continue,
        };
        if rule.is_catch_all() {
            catch_alls.push(rule);
        } else if let Some(redirect) = rule.translate(path) {
            return Ok(redirect);
        }
    }

    catch_alls
        .iter()
        .find_map(|rule| rule.translate(path))
        .ok_or(NoMatchError)
}

/// Returned by [`resolve`] when no record yields a redirect for the
/// path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NoMatchError;

impl fmt::Display for NoMatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("No paths matched")
    }
}

impl std::error::Error for NoMatchError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
