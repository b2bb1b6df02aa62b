//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mirrormap.
//
// Mirrormap is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mirrormap is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mirrormap. If not, see <http://www.gnu.org/licenses/>.

use regex::Regex;

use crate::support::{error::Error, safe_name::is_safe_mailbox_component};

/// Given a raw mailbox path, emit the parts that comprise the actual path.
///
/// This accounts for the path delimiter, empty segments, and the required
/// case-insensitivity of the root `inbox` mailbox.
///
/// It does not check for name safety.
pub fn parse_mailbox_path(
    path: &str,
    delim: char,
) -> impl Iterator<Item = &str> + '_ {
    path.split(delim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(ix, s)| {
            if 0 == ix && "inbox".eq_ignore_ascii_case(s) {
                "INBOX"
            } else {
                s
            }
        })
}

/// Normalises `path` into the form mailbox names are stored in.
///
/// Fails with `UnsafeName` if the path has no components or any component is
/// unacceptable.
pub fn canonical_mailbox_name(path: &str, delim: char) -> Result<String, Error> {
    let parts = parse_mailbox_path(path, delim).collect::<Vec<_>>();
    if parts.is_empty()
        || !parts.iter().all(|part| is_safe_mailbox_component(part))
    {
        return Err(Error::UnsafeName);
    }

    Ok(parts.join(&delim.to_string()))
}

/// Split an already canonical mailbox name into its components.
pub fn split_mailbox_name(name: &str, delim: char) -> Vec<String> {
    name.split(delim).map(str::to_owned).collect()
}

/// Iterate the strict superiors of `name`, shallowest first.
///
/// E.g., `a/b/c` yields `a` and then `a/b`.
pub fn superiors(name: &str, delim: char) -> impl Iterator<Item = &str> + '_ {
    name.match_indices(delim).map(move |(ix, _)| &name[..ix])
}

/// Returns whether `candidate` is `ancestor` or lies somewhere beneath it.
pub fn is_self_or_descendant(candidate: &str, ancestor: &str, delim: char) -> bool {
    candidate == ancestor
        || (candidate.len() > ancestor.len()
            && candidate.starts_with(ancestor)
            && candidate[ancestor.len()..].starts_with(delim))
}

/// A compiled `LIST` pattern.
///
/// `*` matches anything, `%` matches anything but the delimiter. The pattern
/// is anchored at the start of the mailbox name, and at the end unless it
/// ends with `%`. In the latter case, the part of a name actually matched is
/// what gets reported, which is how `LIST "" "foo/%"` turns `foo/bar/baz`
/// into `foo/bar`.
#[derive(Debug)]
pub struct ListPattern {
    rx: Regex,
}

impl ListPattern {
    /// Builds the pattern for `reference` and `pattern` as given to `LIST`.
    ///
    /// If `reference` is non-empty, the delimiter is appended to it (if not
    /// there already) and it is prepended to the pattern.
    pub fn new(reference: &str, pattern: &str, delim: char) -> Self {
        let mut full = String::new();
        if !reference.is_empty() {
            full.push_str(reference);
            if !reference.ends_with(delim) && !pattern.starts_with(delim) {
                full.push(delim);
            }
        }
        full.push_str(pattern);

        let mut rx = "^".to_owned();
        for (part_ix, part) in parse_mailbox_path(&full, delim).enumerate() {
            if part_ix > 0 {
                rx.push_str(&regex::escape(&delim.to_string()));
            }

            let mut start = 0;
            for end in part
                .match_indices(|c| '%' == c || '*' == c)
                .map(|(ix, _)| ix)
                .chain(part.len()..=part.len())
            {
                let chunk = &part[start..end];
                start = (end + 1).min(part.len());

                rx.push_str(&regex::escape(chunk));
                match part.get(end..end + 1) {
                    Some("*") => rx.push_str(".*"),
                    Some("%") => {
                        rx.push_str("[^");
                        rx.push_str(&regex::escape(&delim.to_string()));
                        rx.push_str("]*");
                    },
                    _ => (),
                }
            }
        }

        if !full.ends_with('%') {
            rx.push('$');
        }

        // Every literal chunk is escaped, so this cannot fail; if it
        // somehow did, match nothing.
        let rx = Regex::new(&rx)
            .unwrap_or_else(|_| Regex::new("[^\\s\\S]").unwrap());
        Self { rx }
    }

    /// If `name` matches, returns the part of `name` that was matched.
    pub fn matched<'a>(&self, name: &'a str) -> Option<&'a str> {
        self.rx.find(name).map(|m| &name[..m.end()])
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.matched(name) == Some(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_mailbox_path() {
        fn p(p: &'static str) -> Vec<&'static str> {
            parse_mailbox_path(p, '/').collect()
        }

        assert_eq!(vec!["INBOX"], p("inbox"));
        assert_eq!(vec!["INBOX", "foo"], p("Inbox/foo"));
        assert_eq!(vec!["bar"], p("/bar"));
        assert_eq!(vec!["bar"], p("bar/"));
        assert_eq!(vec!["foo", "bar"], p("foo//bar"));
        assert_eq!(vec!["foo", "InBoX"], p("foo/InBoX"));

        assert_eq!(
            vec!["foo", "bar"],
            parse_mailbox_path("foo.bar", '.').collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_canonical_mailbox_name() {
        assert_eq!("INBOX", canonical_mailbox_name("inbox", '/').unwrap());
        assert_eq!("a/b", canonical_mailbox_name("a/b/", '/').unwrap());
        assert_matches!(
            Err(Error::UnsafeName),
            canonical_mailbox_name("/", '/')
        );
        assert_matches!(
            Err(Error::UnsafeName),
            canonical_mailbox_name("a/b*", '/')
        );
    }

    #[test]
    fn test_superiors() {
        assert_eq!(
            vec!["a", "a/b"],
            superiors("a/b/c", '/').collect::<Vec<_>>()
        );
        assert!(superiors("a", '/').next().is_none());

        assert!(is_self_or_descendant("a/b", "a", '/'));
        assert!(is_self_or_descendant("a", "a", '/'));
        assert!(!is_self_or_descendant("ab", "a", '/'));
        assert!(!is_self_or_descendant("a", "a/b", '/'));
    }

    #[test]
    fn test_list_patterns() {
        fn matches(pat: &str, mb: &str) -> bool {
            ListPattern::new("", pat, '/').is_match(mb)
        }

        assert!(matches("*", "INBOX"));
        assert!(matches("%", "INBOX"));

        assert!(matches("INB*X", "INBOX"));
        assert!(matches("INB*X", "INB/BOX"));
        assert!(!matches("INB*X", "INBOX/plugh"));
        assert!(!matches("INB*X", "foo/INBOX"));
        assert!(matches("INB%X", "INBOX"));
        assert!(!matches("INB%X", "INB/BOX"));
        assert!(!matches("INB%X", "INBOX/plugh"));

        assert!(matches("INB*", "INBOX"));
        assert!(matches("INB*", "INBOX/plugh"));
        assert!(matches("INB%", "INBOX"));
        assert!(!matches("INB%", "INBOX/plugh"));
        assert!(!matches("INB%", "foo/INBOX"));

        assert!(matches("foo/bar", "foo/bar"));
        assert!(!matches("foo/bar", "foo/bar/baz"));
        assert!(!matches("foo/*", "foo"));
        assert!(matches("foo/*", "foo/bar/baz"));
        assert!(matches("foo/%", "foo/bar"));
        assert!(!matches("foo/%", "foo/bar/baz"));

        assert!(matches("inbox", "INBOX"));
    }

    #[test]
    fn trailing_percent_reports_matched_prefix() {
        let pat = ListPattern::new("", "foo/%", '/');
        assert_eq!(Some("foo/bar"), pat.matched("foo/bar/baz"));
        assert_eq!(None, pat.matched("foo"));

        let pat = ListPattern::new("foo", "%", '/');
        assert_eq!(Some("foo/bar"), pat.matched("foo/bar"));
        assert!(pat.is_match("foo/bar"));

        let pat = ListPattern::new("", "a.%", '.');
        assert!(pat.is_match("a.b"));
        assert!(!pat.is_match("a.b.c"));
    }
}
