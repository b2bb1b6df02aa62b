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

//! Utilities for working with the raw header block of a message.
//!
//! Structured parsing is delegated to `mailparse`; what lives here is the
//! byte-level surgery the engine does on literals itself, which must leave
//! everything it doesn't understand exactly as it was.

use chrono::prelude::*;
use mailparse::MailHeaderMap as _;

use crate::account::model::MessageId;

/// The header carrying a message's internal ID inside its literal.
pub const GLUON_ID_HEADER: &str = "X-Pm-Gluon-Id";

/// Splits `literal` into its header block (including the blank line which
/// terminates it) and its body.
///
/// If there is no blank line, the whole literal is considered header.
pub fn split_header(literal: &[u8]) -> (&[u8], &[u8]) {
    // A message may start directly with the blank line
    if literal.starts_with(b"\r\n") {
        return literal.split_at(2);
    }
    if literal.starts_with(b"\n") {
        return literal.split_at(1);
    }

    for nl in memchr::memchr_iter(b'\n', literal) {
        let rest = &literal[nl + 1..];
        if rest.starts_with(b"\r\n") {
            return literal.split_at(nl + 3);
        }
        if rest.starts_with(b"\n") {
            return literal.split_at(nl + 2);
        }
    }

    (literal, &[])
}

/// Iterates over the raw fields of a header block.
///
/// Each item is the full text of one field, including its continuation
/// lines and final line ending. The terminating blank line is not yielded.
pub fn raw_fields(header: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    let mut rest = header;
    std::iter::from_fn(move || {
        if rest.is_empty() || rest.starts_with(b"\r\n") || rest.starts_with(b"\n")
        {
            return None;
        }

        let mut end = 0;
        loop {
            end = match memchr::memchr(b'\n', &rest[end..]) {
                Some(nl) => end + nl + 1,
                None => rest.len(),
            };
            if !rest[end..].starts_with(b" ") && !rest[end..].starts_with(b"\t")
            {
                break;
            }
        }

        let (field, tail) = rest.split_at(end);
        rest = tail;
        Some(field)
    })
}

/// Returns the name of a raw header field, if it has one.
pub fn field_name(field: &[u8]) -> Option<&str> {
    let colon = memchr::memchr(b':', field)?;
    std::str::from_utf8(&field[..colon]).ok().map(str::trim)
}

/// Extracts the internal message ID stamped into `literal`, if any.
pub fn extract_gluon_id(literal: &[u8]) -> Option<MessageId> {
    let (header, _) = split_header(literal);
    let (headers, _) = mailparse::parse_headers(header).ok()?;
    headers
        .get_first_value(GLUON_ID_HEADER)
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .map(MessageId)
}

/// Returns a copy of `literal` whose first header is the internal ID header
/// naming `id`.
///
/// Any existing internal ID headers are removed; all other bytes are kept
/// as they were.
pub fn set_gluon_id(literal: &[u8], id: &MessageId) -> Vec<u8> {
    let (header, body) = split_header(literal);
    let mut out = Vec::with_capacity(literal.len() + 64);
    out.extend_from_slice(GLUON_ID_HEADER.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(id.as_str().as_bytes());
    out.extend_from_slice(b"\r\n");

    let mut kept = 0;
    for field in raw_fields(header) {
        kept += field.len();
        if field_name(field)
            .is_some_and(|name| name.eq_ignore_ascii_case(GLUON_ID_HEADER))
        {
            continue;
        }
        out.extend_from_slice(field);
    }

    // The terminating blank line, or whatever trailing junk the header had
    out.extend_from_slice(&header[kept..]);
    if header[kept..].is_empty() && !body.is_empty() {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(body);
    out
}

/// Returns the raw fields of `header` whose names are (or, with `negate`,
/// are not) in `names`, followed by a blank line.
pub fn filter_fields(header: &[u8], names: &[String], negate: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for field in raw_fields(header) {
        let matches = field_name(field).is_some_and(|name| {
            names.iter().any(|n| n.eq_ignore_ascii_case(name))
        });
        if matches != negate {
            out.extend_from_slice(field);
            if !field.ends_with(b"\n") {
                out.extend_from_slice(b"\r\n");
            }
        }
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Returns the decoded values of every header named `name`.
pub fn header_values(literal: &[u8], name: &str) -> Vec<String> {
    let (header, _) = split_header(literal);
    match mailparse::parse_headers(header) {
        Ok((headers, _)) => headers.get_all_values(name),
        Err(_) => Vec::new(),
    }
}

/// Parses an RFC 5322 date, keeping its zone.
///
/// Dates chrono can't handle are given to `mailparse`, which is more
/// lenient but loses the zone, so those come back in UTC. It also accepts
/// nearly anything, so only strings naming a month and carrying a
/// plausible year get that far.
pub fn parse_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    DateTime::parse_from_rfc2822(s).ok().or_else(|| {
        if !looks_like_date(s) {
            return None;
        }

        // dateparse yields 0 when it never got past the day of month
        mailparse::dateparse(s)
            .ok()
            .filter(|&ts| ts != 0)
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|dt| dt.fixed_offset())
    })
}

fn looks_like_date(s: &str) -> bool {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct",
        "nov", "dec",
    ];

    let lower = s.to_ascii_lowercase();
    let has_month = lower
        .split(|c: char| !c.is_ascii_alphabetic())
        .any(|word| word.len() >= 3 && MONTHS.contains(&&word[..3]));
    let has_year = s
        .split(|c: char| !c.is_ascii_digit())
        .any(|digits| digits.len() == 4 || digits.len() == 2);
    has_month && has_year
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_header() {
        assert_eq!(
            (&b"A: b\r\n\r\n"[..], &b"body"[..]),
            split_header(b"A: b\r\n\r\nbody")
        );
        assert_eq!(
            (&b"A: b\n\n"[..], &b"body\n\nmore"[..]),
            split_header(b"A: b\n\nbody\n\nmore")
        );
        assert_eq!((&b"\r\n"[..], &b"body"[..]), split_header(b"\r\nbody"));
        assert_eq!((&b"A: b"[..], &b""[..]), split_header(b"A: b"));
    }

    #[test]
    fn test_raw_fields() {
        let header = b"A: b\r\nC: d\r\n  e\r\nF:g\r\n\r\n";
        assert_eq!(
            vec![&b"A: b\r\n"[..], &b"C: d\r\n  e\r\n"[..], &b"F:g\r\n"[..]],
            raw_fields(header).collect::<Vec<_>>()
        );
        assert_eq!(Some("C"), field_name(b"C: d\r\n"));
    }

    #[test]
    fn test_gluon_id() {
        let literal = b"Subject: foo\r\nX-Pm-Gluon-Id: old\r\n continued\r\n\
                        To: bar@baz.com\r\n\r\nbody\r\n";
        assert_eq!(
            Some(MessageId::from("abc")),
            extract_gluon_id(b"X-Pm-Gluon-Id: abc\r\nSubject: x\r\n\r\n")
        );

        let rewritten = set_gluon_id(literal, &MessageId::from("new"));
        assert_eq!(
            &b"X-Pm-Gluon-Id: new\r\nSubject: foo\r\n\
               To: bar@baz.com\r\n\r\nbody\r\n"[..],
            &rewritten[..]
        );
        assert_eq!(Some(MessageId::from("new")), extract_gluon_id(&rewritten));

        assert_eq!(None, extract_gluon_id(b"Subject: foo\r\n\r\nbody"));
        assert_eq!(
            &b"X-Pm-Gluon-Id: x\r\n\r\nbody"[..],
            &set_gluon_id(b"\r\nbody", &MessageId::from("x"))[..]
        );
    }

    #[test]
    fn test_filter_fields() {
        let header = b"From: a@b.c\r\nSubject: x\r\nto: d@e.f\r\n\r\n";
        assert_eq!(
            &b"From: a@b.c\r\nto: d@e.f\r\n\r\n"[..],
            &filter_fields(header, &["TO".to_owned(), "from".to_owned()], false)
                [..]
        );
        assert_eq!(
            &b"Subject: x\r\n\r\n"[..],
            &filter_fields(header, &["TO".to_owned(), "from".to_owned()], true)
                [..]
        );
    }

    #[test]
    fn test_parse_datetime() {
        let dt = parse_datetime("Tue, 1 Jul 2003 10:52:37 +0200").unwrap();
        assert_eq!(7200, dt.offset().local_minus_utc());
        assert_eq!(
            NaiveDate::from_ymd_opt(2003, 7, 1).unwrap(),
            dt.date_naive()
        );
        assert!(parse_datetime("not a date").is_none());
        assert!(parse_datetime("").is_none());
        assert!(parse_datetime("12345").is_none());
        assert!(parse_datetime("sometime in 15 Jul").is_none());

        // Lenient fallback for dates chrono rejects
        let dt = parse_datetime("1 Jul 2003 10:52:37").unwrap();
        assert_eq!(
            NaiveDate::from_ymd_opt(2003, 7, 1).unwrap(),
            dt.date_naive()
        );
    }
}
