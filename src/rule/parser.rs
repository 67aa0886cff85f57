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

//! Parsing of redirect rules from TXT record text.

use std::str::SplitWhitespace;

use http::StatusCode;

use super::{Pattern, Rule};

/// The status codes that a `with <code>` clause may select. These are
/// the 3xx codes whose responses direct the client to `Location`.
const EXPLICIT_STATUSES: [StatusCode; 5] = [
    StatusCode::MOVED_PERMANENTLY,
    StatusCode::FOUND,
    StatusCode::SEE_OTHER,
    StatusCode::TEMPORARY_REDIRECT,
    StatusCode::PERMANENT_REDIRECT,
];

/// Parses a TXT record into a [`Rule`].
///
/// The accepted forms are
///
/// * `Redirects to <target>`
/// * `Redirects permanently to <target>`
/// * `Redirects from <path> to <target>`
/// * `Redirects permanently from <path> to <target>`
///
/// each optionally followed by `with <code>`. Keywords are
/// case-sensitive and tokens are separated by any amount of whitespace.
/// The status is 302 unless `permanently` (301) or an explicit code is
/// given; an explicit code wins over `permanently`.
///
/// Anything that does not fit the grammar, including records that are
/// not redirect rules at all (SPF, DKIM, site verification tokens, and
/// so on), yields [`None`]. This is expected and is not an error.
pub fn parse(record: &str) -> Option<Rule> {
    let mut tokens = Tokens(record.split_whitespace());

    tokens.expect("Redirects")?;
    let mut status = if tokens.accept("permanently") {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::FOUND
    };
    let from = if tokens.accept("from") {
        Some(Pattern::new(tokens.next()?)?)
    } else {
        None
    };
    tokens.expect("to")?;
    let to = Pattern::new(tokens.next()?)?;
    if tokens.accept("with") {
        status = parse_status(tokens.next()?)?;
    }
    tokens.end()?;

    // A wildcard target needs a capture to substitute, and a capture
    // needs a wildcard target to land in.
    let from_is_wildcard = from.as_ref().map_or(false, Pattern::is_wildcard);
    if from_is_wildcard != to.is_wildcard() {
        return None;
    }

    Some(Rule { from, to, status })
}

/// Parses the argument of a `with` clause.
fn parse_status(token: &str) -> Option<StatusCode> {
    if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let status = token.parse().ok().and_then(|n| StatusCode::from_u16(n).ok())?;
    EXPLICIT_STATUSES.contains(&status).then_some(status)
}

/// A whitespace tokenizer with the small set of operations the grammar
/// needs.
struct Tokens<'a>(SplitWhitespace<'a>);

impl<'a> Tokens<'a> {
    fn next(&mut self) -> Option<&'a str> {
        self.0.next()
    }

    /// Consumes the next token if it is `keyword`.
    fn accept(&mut self, keyword: &str) -> bool {
        let mut lookahead = self.0.clone();
        if lookahead.next() == Some(keyword) {
            self.0 = lookahead;
            true
        } else {
            false
        }
    }

    /// Consumes the next token, which must be `keyword`.
    fn expect(&mut self, keyword: &str) -> Option<()> {
        (self.next()? == keyword).then_some(())
    }

    /// Succeeds only if no tokens remain.
    fn end(&mut self) -> Option<()> {
        self.next().is_none().then_some(())
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
