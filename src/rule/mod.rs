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

//! The redirect-rule language.
//!
//! A hostname is configured by publishing TXT records at
//! `_redirect.<hostname>`. Each record is an English-like sentence
//! describing a single [`Rule`]:
//!
//! ```text
//! Redirects [permanently] [from <path>] to <target> [with <code>]
//! ```
//!
//! A rule without a `from` clause is a *catch-all*; it applies to every
//! request path. A rule with a `from` clause is *scoped* and applies
//! either to exactly one path or, if the path ends with `*`, to every
//! path sharing the text before the `*`. In the latter case, the target
//! must also end with `*`, and the part of the request path matched by
//! the wildcard replaces it.
//!
//! [`parse`] turns a record into a [`Rule`]; [`translate`] applies a
//! [`Rule`] to a request path to produce a [`Redirect`]. Precedence
//! across the records of one hostname is the business of
//! [`resolve`](crate::resolve).

use std::fmt;

use http::StatusCode;

mod parser;
mod translate;

pub use parser::parse;
pub use translate::{translate, Redirect};

/// The character marking a wildcard in a [`Pattern`].
pub const WILDCARD: char = '*';

/// A parsed redirect rule.
///
/// Rules are only ever produced by [`parse`], which guarantees the
/// wildcard invariants described in the [module documentation](self):
/// `to` is a [`Pattern::Wildcard`] if and only if `from` is present and
/// is a [`Pattern::Wildcard`] as well.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rule {
    from: Option<Pattern>,
    to: Pattern,
    status: StatusCode,
}

impl Rule {
    /// Returns the source path pattern, or [`None`] for a catch-all.
    pub fn from(&self) -> Option<&Pattern> {
        self.from.as_ref()
    }

    /// Returns the destination pattern.
    pub fn to(&self) -> &Pattern {
        &self.to
    }

    /// Returns the redirect status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns whether this is a catch-all rule.
    pub fn is_catch_all(&self) -> bool {
        self.from.is_none()
    }

    /// Applies this rule to a request path. See [`translate`].
    pub fn translate(&self, path: &str) -> Option<Redirect> {
        translate(path, self)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Redirects")?;
        if let Some(ref from) = self.from {
            write!(f, " from {}", from)?;
        }
        write!(f, " to {} with {}", self.to, self.status.as_u16())
    }
}

/// A path or URL pattern appearing in a [`Rule`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Pattern {
    /// A pattern without a wildcard, matched or used verbatim.
    Literal(String),

    /// A pattern ending in a wildcard. The string is the text preceding
    /// the wildcard.
    Wildcard(String),
}

impl Pattern {
    /// Parses a pattern. Returns [`None`] if the text contains a
    /// wildcard anywhere other than as its final character.
    fn new(text: &str) -> Option<Self> {
        match text.strip_suffix(WILDCARD) {
            Some(prefix) if !prefix.contains(WILDCARD) => Some(Self::Wildcard(prefix.to_owned())),
            Some(_) => None,
            None if text.contains(WILDCARD) => None,
            None => Some(Self::Literal(text.to_owned())),
        }
    }

    /// Returns whether the pattern ends with a wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard(_))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Literal(text) => f.write_str(text),
            Self::Wildcard(prefix) => write!(f, "{}{}", prefix, WILDCARD),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
