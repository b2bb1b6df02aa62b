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

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::str::FromStr;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

macro_rules! string_id {
    ($(#[$meta:meta])* $t:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $t(pub String);

        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $t {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($t), self.0)
            }
        }

        impl From<&str> for $t {
            fn from(s: &str) -> Self {
                $t(s.to_owned())
            }
        }
    };
}

string_id! {
    /// The engine's own identifier for a mailbox.
    ///
    /// This never changes over the life of the mailbox, even if the connector
    /// renames it or rewrites its remote id.
    MailboxId
}

string_id! {
    /// The engine's own identifier for a message.
    ///
    /// This is the value of the `X-Pm-Gluon-Id` header injected into every
    /// literal, and the key of the literal in the literal store.
    MessageId
}

string_id! {
    /// The connector's identifier for a mailbox.
    RemoteMailboxId
}

string_id! {
    /// The connector's identifier for a message.
    RemoteMessageId
}

impl MailboxId {
    pub fn generate() -> Self {
        MailboxId(uuid::Uuid::new_v4().to_string())
    }
}

impl MessageId {
    pub fn generate() -> Self {
        MessageId(uuid::Uuid::new_v4().to_string())
    }
}

/// A message UID.
///
/// UIDs start at 1 and increase monotonically as messages are linked into the
/// mailbox. UIDs are never reused, not even when a message is re-linked into a
/// mailbox it is already in; that assigns it a fresh UID.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

// Only here so that things containing SeqRange<Uid> can derive Default.
impl Default for Uid {
    fn default() -> Self {
        Uid::MIN
    }
}

impl Uid {
    pub const MIN: Self = match NonZeroU32::new(1) {
        Some(v) => Uid(v),
        None => unreachable!(),
    };
    pub const MAX: Self = match NonZeroU32::new(u32::MAX) {
        Some(v) => Uid(v),
        None => unreachable!(),
    };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        self.0.get().checked_add(1).and_then(Uid::of)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// A message sequence number.
///
/// The sequence number of a message is one plus the number of messages in the
/// session's snapshot with a lower UID. Every session has its own idea of what
/// the sequence numbers are, and they only shift when the session is told
/// about expunges.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Seqnum(pub NonZeroU32);

impl Default for Seqnum {
    fn default() -> Self {
        Seqnum::MIN
    }
}

impl Seqnum {
    pub const MIN: Self = match NonZeroU32::new(1) {
        Some(v) => Seqnum(v),
        None => unreachable!(),
    };

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }

    pub fn to_index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Panics if `ix + 1` does not fit in a `u32`. Snapshots never get that
    /// large since UIDs are themselves 32-bit.
    pub fn from_index(ix: usize) -> Self {
        u32::try_from(ix + 1)
            .ok()
            .and_then(Seqnum::of)
            .expect("sequence number out of range")
    }
}

impl TryFrom<u32> for Seqnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Seqnum> for u32 {
    fn from(seqnum: Seqnum) -> u32 {
        seqnum.0.get()
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

impl fmt::Display for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// A resolved set of sequence numbers or UIDs.
///
/// Internally, this is maintained as a minimal sorted set of inclusive ranges.
/// It does not maintain information on the original fragmentation, ordering,
/// or duplication.
///
/// The `Display` format puts this into minimal IMAP wire format, which is what
/// `COPYUID` needs.
#[derive(Clone, PartialEq, Eq)]
pub struct SeqRange<T> {
    parts: BTreeMap<u32, u32>,
    _t: PhantomData<T>,
}

impl<T> SeqRange<T> {
    pub fn new() -> Self {
        SeqRange {
            parts: BTreeMap::new(),
            _t: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl<T: TryFrom<u32> + Into<u32> + PartialOrd> SeqRange<T> {
    pub fn just(item: T) -> Self {
        let mut this = SeqRange::new();
        this.insert(item);
        this
    }

    /// Add a single item to this set, in any order.
    pub fn insert(&mut self, item: T) {
        let item: u32 = item.into();
        self.insert_raw(item, item);
    }

    fn insert_raw(&mut self, start_incl: u32, mut end_incl: u32) {
        // Fuse with any later ranges the new one overlaps or touches.
        while let Some((following_start, following_end)) = self
            .parts
            .range((Excluded(start_incl), Unbounded))
            .next()
            .map(|(&start, &end)| (start, end))
        {
            if following_start - 1 > end_incl {
                break;
            }

            end_incl = end_incl.max(following_end);
            self.parts.remove(&following_start);
        }

        let preceding = self
            .parts
            .range((Unbounded, Included(start_incl)))
            .next_back()
            .map(|(&start, &end)| (start, end));
        match preceding {
            Some((preceding_start, preceding_end))
                if preceding_end.saturating_add(1) >= start_incl =>
            {
                self.parts
                    .insert(preceding_start, end_incl.max(preceding_end));
            },
            _ => {
                self.parts.insert(start_incl, end_incl);
            },
        }
    }

    pub fn contains(&self, v: T) -> bool {
        let v: u32 = v.into();
        self.parts
            .range(..=v)
            .next_back()
            .filter(|&(_, &end)| end >= v)
            .is_some()
    }

    /// Iterate the items in this set in strictly ascending order.
    pub fn items(&self) -> impl Iterator<Item = T> + '_ {
        self.parts
            .iter()
            .flat_map(|(&start, &end)| start..=end)
            .filter_map(|v| T::try_from(v).ok())
    }

    pub fn len(&self) -> usize {
        self.parts
            .iter()
            .map(|(start, end)| (end - start) as usize + 1)
            .sum()
    }
}

impl<T> fmt::Display for SeqRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, (&start, &end)) in self.parts.iter().enumerate() {
            let delim = if 0 == ix { "" } else { "," };

            if start == end {
                write!(f, "{}{}", delim, start)?;
            } else {
                write!(f, "{}{}:{}", delim, start, end)?;
            }
        }

        Ok(())
    }
}

impl<T> fmt::Debug for SeqRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl<T> Default for SeqRange<T> {
    fn default() -> Self {
        SeqRange::new()
    }
}

impl<T: TryFrom<u32> + Into<u32> + PartialOrd> FromIterator<T>
    for SeqRange<T>
{
    fn from_iter<I: IntoIterator<Item = T>>(it: I) -> Self {
        let mut this = SeqRange::new();
        for item in it {
            this.insert(item);
        }
        this
    }
}

/// One end of a range in an unresolved sequence set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqBound {
    Value(u32),
    /// `*`: the last sequence number or the greatest UID in the mailbox.
    Last,
}

impl SeqBound {
    fn resolve(self, last: u32) -> u32 {
        match self {
            SeqBound::Value(v) => v,
            SeqBound::Last => last,
        }
    }
}

/// A sequence set as the client sent it, before `*` has been resolved
/// against a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceSet {
    pub ranges: Vec<(SeqBound, SeqBound)>,
}

impl SequenceSet {
    /// The set `1:*`.
    pub fn all() -> Self {
        SequenceSet {
            ranges: vec![(SeqBound::Value(1), SeqBound::Last)],
        }
    }

    pub fn just(v: u32) -> Self {
        SequenceSet::range(v, v)
    }

    pub fn range(lo: u32, hi: u32) -> Self {
        SequenceSet {
            ranges: vec![(SeqBound::Value(lo), SeqBound::Value(hi))],
        }
    }

    /// Parse the IMAP wire format of a sequence set.
    pub fn parse(raw: &str) -> Option<Self> {
        fn bound(r: &str) -> Option<SeqBound> {
            if "*" == r {
                Some(SeqBound::Last)
            } else {
                r.parse::<u32>()
                    .ok()
                    .filter(|&v| v > 0)
                    .map(SeqBound::Value)
            }
        }

        let mut ranges = Vec::new();
        for part in raw.split(',') {
            let mut subs = part.split(':');
            match (subs.next(), subs.next(), subs.next()) {
                (Some(only), None, None) => {
                    let only = bound(only)?;
                    ranges.push((only, only));
                },
                (Some(start), Some(end), None) => {
                    ranges.push((bound(start)?, bound(end)?));
                },
                _ => return None,
            }
        }

        Some(SequenceSet { ranges })
    }

    /// Resolve `*` to `last` and normalise each range so that `lo <= hi`.
    pub fn resolve(&self, last: u32) -> Vec<(u32, u32)> {
        self.ranges
            .iter()
            .map(|&(lo, hi)| {
                let (lo, hi) = (lo.resolve(last), hi.resolve(last));
                (lo.min(hi), lo.max(hi))
            })
            .collect()
    }
}

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in the
/// `Keyword` case.
///
/// The `Display` format of this type is the exact string value that would be
/// sent over the wire. `FromStr` does the reverse conversion, and also
/// understands non-standard casing of the system flags.
///
/// `\Recent` is included so that it can be reported in `FLAGS` responses and
/// tested by `SEARCH`, but it is never stored on a message and clients may
/// not set it.
#[derive(Clone, Serialize, Deserialize)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Recent,
    Keyword(String),
}

impl Flag {
    fn rank(&self) -> u8 {
        match *self {
            Flag::Answered => 0,
            Flag::Deleted => 1,
            Flag::Draft => 2,
            Flag::Flagged => 3,
            Flag::Seen => 4,
            Flag::Recent => 5,
            Flag::Keyword(..) => 6,
        }
    }

    fn sort_key(&self) -> (u8, String) {
        match *self {
            Flag::Keyword(ref kw) => (self.rank(), kw.to_ascii_lowercase()),
            _ => (self.rank(), String::new()),
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.eq_ignore_ascii_case("\\recent") {
            Ok(Flag::Recent)
        } else if !s.is_empty()
            && !s.starts_with('\\')
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::BadKeyword)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    !matches!(
        ch,
        0..=b' '
            | 127..=255
            | b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']'
    )
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        match (self, other) {
            // Keywords are compared ASCII case-insensitively, which is what
            // clients expect even though RFC 3501 doesn't say so.
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => {
                a.eq_ignore_ascii_case(b)
            },
            (a, b) => a.rank() == b.rank() && a.rank() != 6,
        }
    }
}

impl Eq for Flag {}

/// The operation a `STORE` (or a flag update) applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagOp {
    Add,
    Remove,
    Set,
}

/// A set of flags.
///
/// The set is kept in a canonical order (system flags first, then keywords
/// sorted case-insensitively) so that `Display` output is stable.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FlagSet(Vec<Flag>);

impl FlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> + '_ {
        self.0.iter()
    }

    pub fn contains(&self, flag: &Flag) -> bool {
        self.0.contains(flag)
    }

    /// Adds `flag`, returning whether it was not already present.
    pub fn insert(&mut self, flag: Flag) -> bool {
        if self.contains(&flag) {
            return false;
        }

        let key = flag.sort_key();
        let pos = self
            .0
            .iter()
            .position(|f| f.sort_key() > key)
            .unwrap_or(self.0.len());
        self.0.insert(pos, flag);
        true
    }

    /// Removes `flag`, returning whether it was present.
    pub fn remove(&mut self, flag: &Flag) -> bool {
        let len_before = self.0.len();
        self.0.retain(|f| f != flag);
        len_before != self.0.len()
    }

    pub fn with(mut self, flag: Flag) -> Self {
        self.insert(flag);
        self
    }

    pub fn without(mut self, flag: &Flag) -> Self {
        self.remove(flag);
        self
    }

    pub fn set(&mut self, flag: Flag, present: bool) {
        if present {
            self.insert(flag);
        } else {
            self.remove(&flag);
        }
    }

    /// Returns the result of applying `op` with `flags` to this set.
    pub fn apply(&self, op: FlagOp, flags: &FlagSet) -> FlagSet {
        match op {
            FlagOp::Add => {
                let mut result = self.clone();
                for flag in flags.iter() {
                    result.insert(flag.clone());
                }
                result
            },
            FlagOp::Remove => {
                FlagSet(self.0.iter().filter(|f| !flags.contains(f)).cloned().collect())
            },
            FlagOp::Set => flags.clone(),
        }
    }

    /// Serialises the set as space-separated text for the database.
    pub fn to_db(&self) -> String {
        let mut s = String::new();
        for (ix, flag) in self.0.iter().enumerate() {
            if ix > 0 {
                s.push(' ');
            }
            s.push_str(&flag.to_string());
        }
        s
    }

    /// Inverse of `to_db`. Unparsable entries are dropped.
    pub fn from_db(s: &str) -> Self {
        s.split(' ')
            .filter_map(|f| Flag::from_str(f).ok())
            .collect()
    }
}

impl PartialEq for FlagSet {
    fn eq(&self, other: &FlagSet) -> bool {
        self.len() == other.len() && self.iter().all(|f| other.contains(f))
    }
}

impl Eq for FlagSet {}

impl FromIterator<Flag> for FlagSet {
    fn from_iter<I: IntoIterator<Item = Flag>>(it: I) -> Self {
        let mut this = FlagSet::new();
        for flag in it {
            this.insert(flag);
        }
        this
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({})", self.to_db())
    }
}

impl fmt::Debug for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <FlagSet as fmt::Display>::fmt(self, f)
    }
}

pub const NOSELECT: &str = "\\Noselect";
pub const MARKED: &str = "\\Marked";
pub const UNMARKED: &str = "\\Unmarked";

/// The `SELECT` and `EXAMINE` commands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectResponse {
    /// The `FLAGS` response.
    pub flags: FlagSet,
    /// The `OK [PERMANENTFLAGS]` response.
    pub permanent_flags: FlagSet,
    /// The `EXISTS` response.
    pub exists: usize,
    /// The `RECENT` response.
    pub recent: usize,
    /// The `OK [UNSEEN]` response, if any message is unseen.
    pub unseen: Option<Seqnum>,
    /// The `OK [UIDNEXT]` response.
    pub uid_next: Uid,
    /// The `OK [UIDVALIDITY]` response.
    pub uid_validity: u32,
    /// Whether the tagged response says `READ-ONLY`.
    pub read_only: bool,
}

/// The `STATUS` command.
#[derive(Clone, Debug, Default)]
pub struct StatusRequest {
    pub name: String,
    pub messages: bool,
    pub recent: bool,
    pub uid_next: bool,
    pub uid_validity: bool,
    pub unseen: bool,
}

/// The response to `STATUS`.
///
/// Only the fields that were requested are populated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusResponse {
    pub name: String,
    pub messages: Option<usize>,
    pub recent: Option<usize>,
    pub uid_next: Option<Uid>,
    pub uid_validity: Option<u32>,
    pub unseen: Option<usize>,
}

/// The `LIST` and `LSUB` commands, the latter being `subscribed = true`.
#[derive(Clone, Debug, Default)]
pub struct ListRequest {
    pub reference: String,
    pub pattern: String,
    pub subscribed: bool,
}

/// A single `LIST` result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListResponse {
    pub name: String,
    pub delimiter: char,
    pub attributes: Vec<String>,
}

/// The `STORE` and `UID STORE` commands.
#[derive(Clone, Debug)]
pub struct StoreRequest<'a> {
    pub ids: &'a SequenceSet,
    pub is_uid: bool,
    pub op: FlagOp,
    pub flags: &'a [Flag],
    /// Whether `.SILENT` was given.
    pub silent: bool,
}

/// The `APPEND` command.
#[derive(Clone, Debug)]
pub struct AppendRequest {
    pub mailbox: String,
    pub literal: Vec<u8>,
    pub flags: Vec<Flag>,
    /// The `INTERNALDATE` to give the message; defaults to now.
    pub date: Option<DateTime<FixedOffset>>,
}

/// The response for the `APPEND` command, i.e., `APPENDUID` data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendResponse {
    pub uid_validity: u32,
    pub uid: Uid,
}

/// The response from `COPY`, `MOVE`, and their UID variants, i.e., `COPYUID`
/// data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyResponse {
    /// The UID validity value of the destination mailbox.
    pub uid_validity: u32,
    /// The UID(s) of any copied message.
    pub from_uids: SeqRange<Uid>,
    /// The UID(s) of the new messages, parallel to `from_uids`.
    pub to_uids: SeqRange<Uid>,
}

/// The `FETCH` and `UID FETCH` commands.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub ids: SequenceSet,
    pub is_uid: bool,
    pub attrs: Vec<FetchAttr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchAttr {
    Uid,
    Flags,
    InternalDate,
    Rfc822Size,
    Envelope,
    Body,
    BodyStructure,
    /// `BODY[section]<partial>` or `BODY.PEEK[section]<partial>`.
    BodySection {
        peek: bool,
        section: Section,
        /// `<origin.length>`
        partial: Option<(u32, u32)>,
    },
}

/// A `BODY[...]` section specifier.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Section {
    /// The part path, e.g. `[1, 2]` for `1.2`; empty for the whole message.
    pub part: Vec<u32>,
    pub text: SectionText,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SectionText {
    /// The whole part, headers included for the top level.
    #[default]
    Full,
    Header,
    Text,
    Mime,
    HeaderFields {
        negate: bool,
        fields: Vec<String>,
    },
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, part) in self.part.iter().enumerate() {
            if ix > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", part)?;
        }

        if !self.part.is_empty() && SectionText::Full != self.text {
            f.write_str(".")?;
        }

        match self.text {
            SectionText::Full => Ok(()),
            SectionText::Header => f.write_str("HEADER"),
            SectionText::Text => f.write_str("TEXT"),
            SectionText::Mime => f.write_str("MIME"),
            SectionText::HeaderFields { negate, ref fields } => {
                f.write_str("HEADER.FIELDS")?;
                if negate {
                    f.write_str(".NOT")?;
                }
                write!(f, " ({})", fields.join(" "))
            },
        }
    }
}

/// One message's worth of `FETCH` output.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchResponse {
    pub seqnum: Seqnum,
    pub items: Vec<FetchedItem>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FetchedItem {
    Uid(Uid),
    Flags(FlagSet),
    InternalDate(DateTime<FixedOffset>),
    Rfc822Size(u32),
    Envelope(String),
    Body(String),
    BodyStructure(String),
    BodySection {
        section: Section,
        /// The origin octet if a partial fetch was requested.
        origin: Option<u32>,
        data: Vec<u8>,
    },
}

/// The `SEARCH` and `UID SEARCH` commands.
#[derive(Clone, Debug, Default)]
pub struct SearchRequest {
    /// The `CHARSET` the string keys are in, if given.
    pub charset: Option<String>,
    /// The top-level queries, which get ANDed together.
    pub queries: Vec<SearchQuery>,
}

/// The query for the `SEARCH` command.
///
/// This is a very direct representation of the IMAP search query as an AST.
/// String keys are raw bytes in the request's charset.
#[derive(Clone, Debug)]
pub enum SearchQuery {
    SequenceSet(SequenceSet),
    All,
    Answered,
    Bcc(Vec<u8>),
    Before(NaiveDate),
    Body(Vec<u8>),
    Cc(Vec<u8>),
    Deleted,
    Draft,
    Flagged,
    From(Vec<u8>),
    Header(String, Vec<u8>),
    Keyword(String),
    Larger(u32),
    New,
    Not(Box<SearchQuery>),
    Old, // NB "NOT RECENT", not "NOT NEW"
    On(NaiveDate),
    Or(Box<SearchQuery>, Box<SearchQuery>),
    Recent,
    Seen,
    SentBefore(NaiveDate),
    SentOn(NaiveDate),
    SentSince(NaiveDate),
    Since(NaiveDate),
    Smaller(u32),
    Subject(Vec<u8>),
    Text(Vec<u8>),
    To(Vec<u8>),
    UidSet(SequenceSet),
    Unanswered,
    Undeleted,
    Undraft,
    Unflagged,
    Unkeyword(String),
    Unseen,
    And(Vec<SearchQuery>),
}

/// The response from `SEARCH` (sequence numbers) or `UID SEARCH` (UIDs).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchResponse {
    pub hits: Vec<u32>,
}

/// An untagged response produced by a session's responders.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UntaggedResponse {
    Exists(usize),
    Recent(usize),
    Expunge(Seqnum),
    Fetch {
        seqnum: Seqnum,
        flags: FlagSet,
        /// Included only when the originating command was a UID command.
        uid: Option<Uid>,
    },
}

impl fmt::Display for UntaggedResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            UntaggedResponse::Exists(n) => write!(f, "* {} EXISTS", n),
            UntaggedResponse::Recent(n) => write!(f, "* {} RECENT", n),
            UntaggedResponse::Expunge(seqnum) => {
                write!(f, "* {} EXPUNGE", seqnum)
            },
            UntaggedResponse::Fetch {
                seqnum,
                ref flags,
                uid,
            } => {
                write!(f, "* {} FETCH (FLAGS {}", seqnum, flags)?;
                if let Some(uid) = uid {
                    write!(f, " UID {}", uid)?;
                }
                write!(f, ")")
            },
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn seqrange_insert_and_display() {
        let mut range = SeqRange::<Uid>::new();
        assert!(range.is_empty());
        assert_eq!("", range.to_string());

        range.insert(Uid::u(5));
        range.insert(Uid::u(3));
        range.insert(Uid::u(4));
        range.insert(Uid::u(9));
        assert_eq!("3:5,9", range.to_string());
        assert_eq!(4, range.len());
        assert!(range.contains(Uid::u(4)));
        assert!(!range.contains(Uid::u(6)));

        range.insert(Uid::u(6));
        range.insert(Uid::u(8));
        range.insert(Uid::u(7));
        assert_eq!("3:9", range.to_string());
        assert_eq!(
            vec![3, 4, 5, 6, 7, 8, 9],
            range.items().map(u32::from).collect::<Vec<_>>()
        );
    }

    #[test]
    fn sequence_set_parse_and_resolve() {
        let set = SequenceSet::parse("1,3:5,*,7:*,9:2").unwrap();
        assert_eq!(
            vec![(1, 1), (3, 5), (8, 8), (7, 8), (2, 9)],
            set.resolve(8)
        );
        // Last below the lower bound swaps the ends.
        assert_eq!(vec![(3, 4)], SequenceSet::parse("4:*").unwrap().resolve(3));

        assert!(SequenceSet::parse("").is_none());
        assert!(SequenceSet::parse("0").is_none());
        assert!(SequenceSet::parse("1:2:3").is_none());
        assert!(SequenceSet::parse("a").is_none());
        assert_eq!(vec![(1, 5)], SequenceSet::all().resolve(5));
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(Flag::Seen, "\\SEEN".parse::<Flag>().unwrap());
        assert_eq!(Flag::Recent, "\\recent".parse::<Flag>().unwrap());
        assert_eq!(
            Flag::Keyword("$Forwarded".to_owned()),
            "$forwarded".parse::<Flag>().unwrap()
        );
        assert_matches!(Err(Error::BadKeyword), "\\Bogus".parse::<Flag>());
        assert_matches!(Err(Error::BadKeyword), "foo bar".parse::<Flag>());
        assert_matches!(Err(Error::BadKeyword), "".parse::<Flag>());
        assert_ne!(Flag::Keyword("a".to_owned()), Flag::Keyword("b".to_owned()));
    }

    #[test]
    fn flag_set_operations() {
        let base: FlagSet = vec![Flag::Seen, Flag::Keyword("foo".to_owned())]
            .into_iter()
            .collect();
        assert_eq!("(\\Seen foo)", base.to_string());

        let other: FlagSet = vec![Flag::Deleted, Flag::Keyword("FOO".to_owned())]
            .into_iter()
            .collect();

        assert_eq!(
            "(\\Deleted \\Seen foo)",
            base.apply(FlagOp::Add, &other).to_string()
        );
        assert_eq!("(\\Seen)", base.apply(FlagOp::Remove, &other).to_string());
        assert_eq!(other, base.apply(FlagOp::Set, &other));

        assert_eq!(base, FlagSet::from_db(&base.to_db()));
        assert!(FlagSet::from_db("").is_empty());

        let with_recent = base.clone().with(Flag::Recent);
        assert_eq!("(\\Seen \\Recent foo)", with_recent.to_string());
        assert_ne!(base, with_recent);
        assert_eq!(base, with_recent.without(&Flag::Recent));
    }

    #[test]
    fn untagged_response_display() {
        assert_eq!("* 3 EXISTS", UntaggedResponse::Exists(3).to_string());
        assert_eq!("* 1 RECENT", UntaggedResponse::Recent(1).to_string());
        assert_eq!(
            "* 2 EXPUNGE",
            UntaggedResponse::Expunge(Seqnum::u(2)).to_string()
        );
        assert_eq!(
            "* 3 FETCH (FLAGS (\\Seen) UID 7)",
            UntaggedResponse::Fetch {
                seqnum: Seqnum::u(3),
                flags: FlagSet::new().with(Flag::Seen),
                uid: Some(Uid::u(7)),
            }
            .to_string()
        );
        assert_eq!(
            "* 3 FETCH (FLAGS ())",
            UntaggedResponse::Fetch {
                seqnum: Seqnum::u(3),
                flags: FlagSet::new(),
                uid: None,
            }
            .to_string()
        );
    }

    #[test]
    fn section_display() {
        assert_eq!("", Section::default().to_string());
        assert_eq!(
            "1.2.HEADER.FIELDS.NOT (From To)",
            Section {
                part: vec![1, 2],
                text: SectionText::HeaderFields {
                    negate: true,
                    fields: vec!["From".to_owned(), "To".to_owned()],
                },
            }
            .to_string()
        );
        assert_eq!(
            "TEXT",
            Section {
                part: vec![],
                text: SectionText::Text,
            }
            .to_string()
        );
    }

    proptest! {
        #[test]
        fn seqrange_properties(
            ranges in prop::collection::vec((1u32..30, 0u32..5), 1..10)
        ) {
            let mut range = SeqRange::<Uid>::new();
            let mut expected = std::collections::BTreeSet::new();
            for &(start, len) in &ranges {
                for v in start..=start + len {
                    range.insert(Uid::u(v));
                    expected.insert(v);
                }
            }

            prop_assert_eq!(expected.len(), range.len());
            prop_assert_eq!(
                expected.iter().copied().collect::<Vec<_>>(),
                range.items().map(u32::from).collect::<Vec<_>>());
            for v in 1..40 {
                prop_assert_eq!(expected.contains(&v), range.contains(Uid::u(v)));
            }

            let reparsed = SequenceSet::parse(&range.to_string()).unwrap();
            let mut from_wire = std::collections::BTreeSet::new();
            for (lo, hi) in reparsed.resolve(u32::MAX) {
                from_wire.extend(lo..=hi);
            }
            prop_assert_eq!(expected, from_wire);
        }
    }
}
