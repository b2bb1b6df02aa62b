//-
// Copyright (c) 2020, 2024, Jason Lingle
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

//! Backend for evaluating search matches.
//!
//! A `SearchQuery` tree is compiled against a snapshot into a flat program
//! for a simple stack machine whose values are a false/true/unknown
//! tri-state. The maximum stack height is 32, after which old values are
//! forgotten. Stack underflow results in false.
//!
//! Before evaluation, `want` tells the caller which inputs the program
//! actually looks at, so that nothing more is loaded for each message than
//! needed. An input which was not loaded evaluates as unknown.

use std::cmp::{Ord, Ordering};

use bitflags::bitflags;
use chrono::prelude::*;

use super::model::*;
use super::snapshot::Snapshot;
use crate::mime::{header, parse};
use crate::support::error::Error;

/// A single operation on the stack machine.
///
/// String operands are already lowercased, and the data they are matched
/// against is lowercased too, so all string matching is a plain substring
/// test.
///
/// "Comparison" operations take 3 booleans indicating the results for
/// less-than, equals, and greater-than comparisons, respectively. Comparison
/// is performed as `<value-in-message> <op> <value-in-op>`.
#[derive(Debug)]
pub enum Op {
    True,
    And,
    Or,
    Not,
    Flag(Flag),
    /// Header name, substring of the value.
    Header(String, String),
    Body(String),
    Text(String),
    InternalDateCompare(NaiveDate, bool, bool, bool),
    SentDateCompare(NaiveDate, bool, bool, bool),
    SizeCompare(u32, bool, bool, bool),
    UidIn(SeqRange<Uid>),
    #[cfg(test)]
    _Const(u64),
}

bitflags! {
    /// The inputs a search program needs beyond what the snapshot has.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SearchNeeds: u32 {
        /// The message row: size and internal date.
        const METADATA = 1 << 0;
        /// The parsed header of the literal.
        const HEADERS = 1 << 1;
        /// The decoded text of the literal.
        const CONTENT = 1 << 2;
    }
}

/// The size and internal date of a message, from its database row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageMetadata {
    pub size: u32,
    pub internal_date: DateTime<FixedOffset>,
}

/// The inputs for evaluating a search program against one message.
///
/// A field is `None` if it was not loaded.
#[derive(Clone, Debug, Default)]
pub struct SearchData {
    pub uid: Option<Uid>,
    /// The flags as the session sees them, including `\Recent`.
    pub flags: Option<FlagSet>,
    pub metadata: Option<MessageMetadata>,
    /// Every header of the message as `(name, value)`, with encoded words
    /// decoded and both parts lowercased.
    pub headers: Option<Vec<(String, String)>>,
    /// The `Date` header. `Some(None)` if the message has no usable one.
    pub sent_date: Option<Option<DateTime<FixedOffset>>>,
    /// The decoded text parts of the body, lowercased.
    pub body: Option<String>,
    /// The headers followed by the body, lowercased.
    pub text: Option<String>,
}

impl SearchData {
    /// Fills in whatever of `needs` derives from the literal.
    pub fn load_literal(&mut self, needs: SearchNeeds, literal: &[u8]) {
        if needs.intersects(SearchNeeds::HEADERS | SearchNeeds::CONTENT) {
            let (header_block, _) = header::split_header(literal);
            let headers = mailparse::parse_headers(header_block)
                .map(|(headers, _)| {
                    headers
                        .iter()
                        .map(|h| {
                            (h.get_key().to_lowercase(), h.get_value())
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            self.sent_date = Some(
                headers
                    .iter()
                    .find(|&&(ref name, _)| "date" == name)
                    .and_then(|&(_, ref value)| header::parse_datetime(value)),
            );

            if needs.contains(SearchNeeds::CONTENT) {
                let body = String::from_utf8_lossy(&parse::body_text(literal))
                    .to_lowercase();
                let mut text = String::new();
                for &(ref name, ref value) in &headers {
                    text.push_str(name);
                    text.push_str(": ");
                    text.push_str(&value.to_lowercase());
                    text.push('\n');
                }
                text.push('\n');
                text.push_str(&body);
                self.body = Some(body);
                self.text = Some(text);
            }

            self.headers = Some(
                headers
                    .into_iter()
                    .map(|(name, value)| (name, value.to_lowercase()))
                    .collect(),
            );
        }
    }
}

const UNKNOWN: u64 = 2;
const TRUE: u64 = 1;

struct Stack(u64);

impl Stack {
    fn push(&mut self, val: u64) {
        self.0 <<= 2;
        self.0 |= val;
    }

    fn o(&mut self, val: Option<bool>) {
        self.push(val.map(|v| v as u64).unwrap_or(UNKNOWN));
    }

    fn and(&mut self) {
        let key = self.0 & 15;
        self.0 >>= 2;
        self.0 &= !3;
        const TABLE: u64 =
        // A: 11 11 11 11 10 10 10 10 01 01 01 01 00 00 00 00
        // B: 11 10 01 00 11 10 01 00 11 10 01 00 11 10 01 00
            0b11_11_11_00_11_11_11_00_11_11_01_00_00_00_00_00;
        self.0 |= (TABLE >> (2 * key)) & 3;
    }

    fn or(&mut self) {
        let key = self.0 & 15;
        self.0 >>= 2;
        self.0 &= !3;
        const TABLE: u64 =
        // A: 11 11 11 11 10 10 10 10 01 01 01 01 00 00 00 00
        // B: 11 10 01 00 11 10 01 00 11 10 01 00 11 10 01 00
            0b11_11_01_11_11_11_01_11_01_01_01_01_11_11_01_00;
        self.0 |= (TABLE >> (2 * key)) & 3;
    }

    fn not(&mut self) {
        self.0 ^= TRUE;
    }
}

/// Evaluate whether `data` is matched by the stack machine given in `ops`.
pub fn eval(ops: &[Op], data: &SearchData) -> Option<bool> {
    let mut s = Stack(0u64);

    for op in ops {
        match *op {
            Op::True => s.push(TRUE),
            Op::And => s.and(),
            Op::Or => s.or(),
            Op::Not => s.not(),
            #[cfg(test)]
            Op::_Const(v) => s.push(v),

            Op::Flag(ref flag) => {
                s.o(data.flags.as_ref().map(|f| f.contains(flag)))
            },

            Op::Header(ref name, ref needle) => {
                s.o(data.headers.as_ref().map(|headers| {
                    headers
                        .iter()
                        .any(|&(ref n, ref v)| n == name && v.contains(needle))
                }))
            },
            Op::Body(ref needle) => {
                s.o(data.body.as_ref().map(|b| b.contains(needle)))
            },
            Op::Text(ref needle) => {
                s.o(data.text.as_ref().map(|t| t.contains(needle)))
            },

            Op::InternalDateCompare(ref relative, lt, eq, gt) => {
                let date = data
                    .metadata
                    .as_ref()
                    .map(|md| md.internal_date.with_timezone(&Utc).date_naive());
                s.o(cmp(date.as_ref(), relative, lt, eq, gt));
            },
            Op::SentDateCompare(ref relative, lt, eq, gt) => {
                // Compared in the message's own zone, which is what RFC 3501
                // means by "disregarding time and timezone".
                s.o(match data.sent_date {
                    None => None,
                    Some(None) => Some(false),
                    Some(Some(ref date)) => {
                        cmp(Some(&date.date_naive()), relative, lt, eq, gt)
                    },
                });
            },
            Op::SizeCompare(ref relative, lt, eq, gt) => {
                s.o(cmp(
                    data.metadata.as_ref().map(|md| &md.size),
                    relative,
                    lt,
                    eq,
                    gt,
                ));
            },

            Op::UidIn(ref set) => s.o(data.uid.map(|u| set.contains(u))),
        }
    }

    if UNKNOWN == s.0 & UNKNOWN {
        None
    } else {
        Some(TRUE == s.0 & TRUE)
    }
}

fn cmp<T: Ord>(
    value: Option<&T>,
    relative: &T,
    lt: bool,
    eq: bool,
    gt: bool,
) -> Option<bool> {
    value.map(|value| match value.cmp(relative) {
        Ordering::Less => lt,
        Ordering::Equal => eq,
        Ordering::Greater => gt,
    })
}

/// Determine what `SearchNeeds` are needed to properly evaluate the given
/// stack matcher.
pub fn want(ops: &[Op]) -> SearchNeeds {
    let mut accum = SearchNeeds::empty();

    for op in ops {
        accum |= match *op {
            Op::True
            | Op::And
            | Op::Or
            | Op::Not
            | Op::Flag(..)
            | Op::UidIn(..) => SearchNeeds::empty(),

            #[cfg(test)]
            Op::_Const(..) => SearchNeeds::empty(),

            Op::InternalDateCompare(..) | Op::SizeCompare(..) => {
                SearchNeeds::METADATA
            },
            Op::Header(..) | Op::SentDateCompare(..) => SearchNeeds::HEADERS,
            Op::Body(..) | Op::Text(..) => SearchNeeds::CONTENT,
        }
    }

    accum
}

/// Compiles `request` into a program for `eval`.
///
/// Sequence sets and UID sets are resolved against `snapshot` now, so the
/// program must be evaluated against the same snapshot.
pub fn compile(
    request: &SearchRequest,
    snapshot: &Snapshot,
) -> Result<Vec<Op>, Error> {
    let mut compiler = Compiler {
        charset: request.charset.as_deref(),
        snapshot,
        ops: Vec::new(),
    };
    compiler.all(&request.queries)?;
    Ok(compiler.ops)
}

struct Compiler<'a> {
    charset: Option<&'a str>,
    snapshot: &'a Snapshot,
    ops: Vec<Op>,
}

impl Compiler<'_> {
    fn all(&mut self, queries: &[SearchQuery]) -> Result<(), Error> {
        let Some((first, rest)) = queries.split_first() else {
            self.ops.push(Op::True);
            return Ok(());
        };

        self.query(first)?;
        for query in rest {
            self.query(query)?;
            self.ops.push(Op::And);
        }
        Ok(())
    }

    fn flag(&mut self, flag: Flag, present: bool) {
        self.ops.push(Op::Flag(flag));
        if !present {
            self.ops.push(Op::Not);
        }
    }

    fn key(&self, raw: &[u8]) -> Result<String, Error> {
        Ok(decode_key(self.charset, raw)?.to_lowercase())
    }

    fn header(&mut self, name: &str, raw: &[u8]) -> Result<(), Error> {
        let needle = self.key(raw)?;
        self.ops.push(Op::Header(name.to_lowercase(), needle));
        Ok(())
    }

    fn query(&mut self, query: &SearchQuery) -> Result<(), Error> {
        match *query {
            SearchQuery::All => self.ops.push(Op::True),
            SearchQuery::SequenceSet(ref set) => {
                let len = self.snapshot.len() as u32;
                let mut uids = SeqRange::new();
                for (lo, hi) in set.resolve(len) {
                    for seqnum in lo.max(1)..=hi.min(len) {
                        if let Some(m) = Seqnum::of(seqnum)
                            .and_then(|s| self.snapshot.get_by_seq(s))
                        {
                            uids.insert(m.uid);
                        }
                    }
                }
                self.ops.push(Op::UidIn(uids));
            },
            SearchQuery::UidSet(ref set) => {
                let mut uids = SeqRange::new();
                for (_, m) in self.snapshot.messages_in_uid_range(set) {
                    uids.insert(m.uid);
                }
                self.ops.push(Op::UidIn(uids));
            },

            SearchQuery::Answered => self.flag(Flag::Answered, true),
            SearchQuery::Deleted => self.flag(Flag::Deleted, true),
            SearchQuery::Draft => self.flag(Flag::Draft, true),
            SearchQuery::Flagged => self.flag(Flag::Flagged, true),
            SearchQuery::Seen => self.flag(Flag::Seen, true),
            SearchQuery::Recent => self.flag(Flag::Recent, true),
            SearchQuery::Unanswered => self.flag(Flag::Answered, false),
            SearchQuery::Undeleted => self.flag(Flag::Deleted, false),
            SearchQuery::Undraft => self.flag(Flag::Draft, false),
            SearchQuery::Unflagged => self.flag(Flag::Flagged, false),
            SearchQuery::Unseen => self.flag(Flag::Seen, false),
            SearchQuery::Old => self.flag(Flag::Recent, false),
            SearchQuery::New => {
                self.flag(Flag::Recent, true);
                self.flag(Flag::Seen, false);
                self.ops.push(Op::And);
            },
            SearchQuery::Keyword(ref kw) | SearchQuery::Unkeyword(ref kw) => {
                let present = matches!(*query, SearchQuery::Keyword(..));
                match kw.parse::<Flag>() {
                    Ok(flag) => self.flag(flag, present),
                    // A keyword that can't exist is on no message
                    Err(_) => {
                        self.ops.push(Op::True);
                        if present {
                            self.ops.push(Op::Not);
                        }
                    },
                }
            },

            SearchQuery::Bcc(ref k) => self.header("Bcc", k)?,
            SearchQuery::Cc(ref k) => self.header("Cc", k)?,
            SearchQuery::From(ref k) => self.header("From", k)?,
            SearchQuery::To(ref k) => self.header("To", k)?,
            SearchQuery::Subject(ref k) => self.header("Subject", k)?,
            SearchQuery::Header(ref name, ref k) => self.header(name, k)?,

            SearchQuery::Body(ref k) => {
                let needle = self.key(k)?;
                self.ops.push(Op::Body(needle));
            },
            SearchQuery::Text(ref k) => {
                let needle = self.key(k)?;
                self.ops.push(Op::Text(needle));
            },

            SearchQuery::Before(d) => {
                self.ops.push(Op::InternalDateCompare(d, true, false, false))
            },
            SearchQuery::On(d) => {
                self.ops.push(Op::InternalDateCompare(d, false, true, false))
            },
            SearchQuery::Since(d) => {
                self.ops.push(Op::InternalDateCompare(d, false, true, true))
            },
            SearchQuery::SentBefore(d) => {
                self.ops.push(Op::SentDateCompare(d, true, false, false))
            },
            SearchQuery::SentOn(d) => {
                self.ops.push(Op::SentDateCompare(d, false, true, false))
            },
            SearchQuery::SentSince(d) => {
                self.ops.push(Op::SentDateCompare(d, false, true, true))
            },
            SearchQuery::Larger(n) => {
                self.ops.push(Op::SizeCompare(n, false, false, true))
            },
            SearchQuery::Smaller(n) => {
                self.ops.push(Op::SizeCompare(n, true, false, false))
            },

            SearchQuery::Not(ref q) => {
                self.query(q)?;
                self.ops.push(Op::Not);
            },
            SearchQuery::Or(ref a, ref b) => {
                self.query(a)?;
                self.query(b)?;
                self.ops.push(Op::Or);
            },
            SearchQuery::And(ref qs) => self.all(qs)?,
        }

        Ok(())
    }
}

/// Decodes a search key from the charset the client declared.
///
/// Without a declared charset the key is taken as UTF-8, which covers the
/// US-ASCII default of RFC 3501.
pub fn decode_key(charset: Option<&str>, raw: &[u8]) -> Result<String, Error> {
    match charset {
        None => Ok(String::from_utf8_lossy(raw).into_owned()),
        Some(label) => {
            let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
                .ok_or(Error::BadCharset)?;
            let (text, _, _) = encoding.decode(raw);
            Ok(text.into_owned())
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::account::snapshot::SnapshotMessage;

    fn flags(flags: &[Flag]) -> SearchData {
        SearchData {
            flags: Some(flags.iter().cloned().collect()),
            ..SearchData::default()
        }
    }

    #[test]
    fn tristate_logic() {
        // UNKNOWN AND FALSE is FALSE; UNKNOWN OR TRUE is TRUE
        let data = SearchData::default();
        assert_eq!(
            Some(false),
            eval(&[Op::_Const(UNKNOWN), Op::_Const(0), Op::And], &data)
        );
        assert_eq!(
            Some(true),
            eval(&[Op::_Const(UNKNOWN), Op::_Const(TRUE), Op::Or], &data)
        );
        assert_eq!(
            None,
            eval(&[Op::_Const(UNKNOWN), Op::_Const(TRUE), Op::And], &data)
        );
        assert_eq!(None, eval(&[Op::_Const(UNKNOWN), Op::Not], &data));
        assert_eq!(Some(false), eval(&[Op::True, Op::Not], &data));
    }

    #[test]
    fn flag_ops() {
        let ops = &[Op::Flag(Flag::Flagged)];
        assert_eq!(None, eval(ops, &SearchData::default()));
        assert_eq!(Some(true), eval(ops, &flags(&[Flag::Flagged])));
        assert_eq!(Some(false), eval(ops, &flags(&[Flag::Deleted])));

        let ops = &[Op::Flag(Flag::Keyword("$Junk".to_owned()))];
        assert_eq!(
            Some(true),
            eval(ops, &flags(&[Flag::Keyword("$junk".to_owned())]))
        );
    }

    #[test]
    fn header_and_content_ops() {
        let mut data = SearchData::default();
        data.load_literal(
            SearchNeeds::HEADERS | SearchNeeds::CONTENT,
            b"From: \"Foo Bar\" <foo@bar.com>\r\n\
              Subject: =?utf-8?q?Caf=C3=A9?= time\r\n\
              Date: Tue, 1 Jul 2003 23:52:37 -0200\r\n\
              \r\n\
              Hello World\r\n",
        );

        let from = |s: &str| [Op::Header("from".to_owned(), s.to_owned())];
        assert_eq!(Some(true), eval(&from("foo@bar"), &data));
        assert_eq!(Some(true), eval(&from("foo bar"), &data));
        assert_eq!(Some(false), eval(&from("baz"), &data));
        assert_eq!(
            Some(true),
            eval(&[Op::Header("subject".to_owned(), "café".to_owned())], &data)
        );
        assert_eq!(
            Some(false),
            eval(&[Op::Header("to".to_owned(), String::new())], &data)
        );

        assert_eq!(Some(true), eval(&[Op::Body("hello world".to_owned())], &data));
        assert_eq!(Some(false), eval(&[Op::Body("café".to_owned())], &data));
        assert_eq!(Some(true), eval(&[Op::Text("café".to_owned())], &data));

        // The sent date is compared in its own zone
        let day = NaiveDate::from_ymd_opt(2003, 7, 1).unwrap();
        assert_eq!(
            Some(true),
            eval(&[Op::SentDateCompare(day, false, true, false)], &data)
        );
    }

    #[test]
    fn date_and_size_ops() {
        let data = SearchData {
            metadata: Some(MessageMetadata {
                size: 100,
                // 2020-06-29 in UTC
                internal_date: DateTime::parse_from_rfc3339(
                    "2020-06-28T20:00:00-12:00",
                )
                .unwrap(),
            }),
            sent_date: Some(None),
            ..SearchData::default()
        };
        let day = NaiveDate::from_ymd_opt(2020, 6, 29).unwrap();

        assert_eq!(
            Some(true),
            eval(&[Op::InternalDateCompare(day, false, true, false)], &data)
        );
        assert_eq!(
            Some(false),
            eval(&[Op::InternalDateCompare(day, true, false, false)], &data)
        );
        assert_eq!(
            Some(true),
            eval(&[Op::SizeCompare(99, false, false, true)], &data)
        );
        assert_eq!(
            Some(false),
            eval(&[Op::SizeCompare(100, true, false, false)], &data)
        );
        // No usable Date header matches nothing
        assert_eq!(
            Some(false),
            eval(&[Op::SentDateCompare(day, true, true, true)], &data)
        );
    }

    fn snapshot() -> Snapshot {
        Snapshot::new(
            MailboxId::from("mb"),
            RemoteMailboxId::from("mb"),
            [2, 4, 6, 8]
                .iter()
                .map(|&uid| SnapshotMessage {
                    id: MessageId(format!("m{}", uid)),
                    remote_id: RemoteMessageId(format!("r{}", uid)),
                    uid: Uid::u(uid),
                    flags: if uid > 4 {
                        FlagSet::new().with(Flag::Seen)
                    } else {
                        FlagSet::new().with(Flag::Recent)
                    },
                })
                .collect(),
        )
    }

    fn run(request: &SearchRequest, snapshot: &Snapshot) -> Vec<u32> {
        let ops = compile(request, snapshot).unwrap();
        assert_eq!(SearchNeeds::empty(), want(&ops));
        snapshot
            .iter()
            .filter(|&(_, m)| {
                eval(
                    &ops,
                    &SearchData {
                        uid: Some(m.uid),
                        flags: Some(m.flags.clone()),
                        ..SearchData::default()
                    },
                ) == Some(true)
            })
            .map(|(_, m)| m.uid.into())
            .collect()
    }

    #[test]
    fn compile_against_snapshot() {
        let snapshot = snapshot();
        let request = |queries| SearchRequest {
            charset: None,
            queries,
        };

        assert_eq!(vec![2, 4, 6, 8], run(&request(vec![]), &snapshot));
        assert_eq!(
            vec![4, 6],
            run(
                &request(vec![SearchQuery::SequenceSet(
                    SequenceSet::range(2, 3)
                )]),
                &snapshot
            )
        );
        assert_eq!(
            vec![6, 8],
            run(
                &request(vec![SearchQuery::UidSet(
                    SequenceSet::parse("5:*").unwrap()
                )]),
                &snapshot
            )
        );
        assert_eq!(
            vec![2, 4],
            run(&request(vec![SearchQuery::New]), &snapshot)
        );
        assert_eq!(
            vec![4, 8],
            run(
                &request(vec![
                    SearchQuery::Or(
                        Box::new(SearchQuery::UidSet(SequenceSet::just(4))),
                        Box::new(SearchQuery::Seen),
                    ),
                    SearchQuery::Not(Box::new(SearchQuery::UidSet(
                        SequenceSet::just(6)
                    ))),
                ]),
                &snapshot
            )
        );
        assert!(run(
            &request(vec![SearchQuery::Keyword("\\Bogus".to_owned())]),
            &snapshot
        )
        .is_empty());
    }

    #[test]
    fn charset_handling() {
        assert_eq!("café", decode_key(Some("ISO-8859-1"), b"caf\xe9").unwrap());
        assert_eq!("café", decode_key(None, "café".as_bytes()).unwrap());
        assert_matches!(
            Err(Error::BadCharset),
            decode_key(Some("x-no-such-charset"), b"foo")
        );

        let request = SearchRequest {
            charset: Some("ISO-8859-1".to_owned()),
            queries: vec![SearchQuery::Subject(b"CAF\xc9".to_vec())],
        };
        let ops = compile(&request, &snapshot()).unwrap();
        assert_eq!(SearchNeeds::HEADERS, want(&ops));
        match ops[..] {
            [Op::Header(ref name, ref needle)] => {
                assert_eq!("subject", name);
                assert_eq!("café", needle);
            },
            ref ops => panic!("unexpected program: {:?}", ops),
        }
    }
}
