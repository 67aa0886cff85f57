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

//! Applying a [`Rule`] to a request path.

use http::StatusCode;

use super::{Pattern, Rule};

/// The outcome of applying a [`Rule`] to a request path: where to send
/// the client and with which status code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Redirect {
    pub location: String,
    pub status: StatusCode,
}

/// Applies `rule` to `path`, returning the resulting [`Redirect`] if
/// the rule matches.
///
/// * A catch-all rule matches every path, and its target is used
///   verbatim.
/// * A rule with a literal source matches only a path that is exactly
///   equal to it; its target is used verbatim.
/// * A rule with a wildcard source matches any path that starts with
///   the text before the wildcard. Whatever follows that prefix in the
///   path replaces the wildcard at the end of the target.
///
/// The prefix test is a plain string comparison that knows nothing of
/// path segments, so `/docs/*` matches `/docs/intro` but `/docs*` also
/// matches `/docsx`.
///
/// A [`None`] return is not an error; it just means the caller should
/// try another rule.
pub fn translate(path: &str, rule: &Rule) -> Option<Redirect> {
    let location = match (&rule.from, &rule.to) {
        (None, Pattern::Literal(target)) => target.clone(),
        (Some(Pattern::Literal(source)), Pattern::Literal(target)) if path == source => {
            target.clone()
        }
        (Some(Pattern::Wildcard(prefix)), Pattern::Wildcard(base)) => {
            let captured = path.strip_prefix(prefix.as_str())?;
            let mut location = String::with_capacity(base.len() + captured.len());
            location.push_str(base);
            location.push_str(captured);
            location
        }
        _ => return None,
    };
    Some(Redirect {
        location,
        status: rule.status,
    })
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::super::parse;
    use super::*;

    fn redirect(location: &str, status: StatusCode) -> Option<Redirect> {
        Some(Redirect {
            location: location.to_owned(),
            status,
        })
    }

    #[test]
    fn catch_all_matches_every_path() {
        let rule = parse("Redirects permanently to https://example.com/").unwrap();
        for path in ["/", "", "/a/b/c", "/?q=1"] {
            assert_eq!(
                translate(path, &rule),
                redirect("https://example.com/", StatusCode::MOVED_PERMANENTLY)
            );
        }
    }

    #[test]
    fn literal_source_requires_exact_match() {
        let rule = parse("Redirects from /noglob/ to https://github.com/holic/noglob").unwrap();
        assert_eq!(
            translate("/noglob/", &rule),
            redirect("https://github.com/holic/noglob", StatusCode::FOUND)
        );
        assert_eq!(translate("/noglob", &rule), None);
        assert_eq!(translate("/noglob/x", &rule), None);
        assert_eq!(translate("/noglob/?a=b", &rule), None);
    }

    #[test]
    fn wildcard_source_appends_captured_suffix() {
        let rule = parse("Redirects from /test/* to https://github.com/holic/*").unwrap();
        assert_eq!(
            translate("/test/success", &rule),
            redirect("https://github.com/holic/success", StatusCode::FOUND)
        );
        assert_eq!(
            translate("/test/", &rule),
            redirect("https://github.com/holic/", StatusCode::FOUND)
        );
        assert_eq!(
            translate("/test/a/b?c=d", &rule),
            redirect("https://github.com/holic/a/b?c=d", StatusCode::FOUND)
        );
        assert_eq!(translate("/should/fail", &rule), None);
        assert_eq!(translate("/test", &rule), None);
    }

    #[test]
    fn wildcard_prefix_is_not_segment_aware() {
        let rule = parse("Redirects from /docs* to https://docs.test/*").unwrap();
        assert_eq!(
            translate("/docsx", &rule),
            redirect("https://docs.test/x", StatusCode::FOUND)
        );
    }

    #[test]
    fn wildcard_translation_holds_for_every_prefixed_path() {
        let rule = parse("Redirects from /p/* to https://t.test/base/* with 307").unwrap();
        for suffix in ["", "x", "x/y", "%20", "*", "?a=b#c", "ü"] {
            let path = format!("/p/{}", suffix);
            assert_eq!(
                translate(&path, &rule),
                Some(Redirect {
                    location: format!("https://t.test/base/{}", suffix),
                    status: StatusCode::TEMPORARY_REDIRECT,
                })
            );
        }
    }
}
