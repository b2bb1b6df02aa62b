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

//! Bindings for our model types to `rusqlite`, plus model types specific to
//! the database itself.

use chrono::prelude::*;
use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef,
};

use crate::account::model::*;
use crate::mime::parse::Envelope;

macro_rules! string_id_sql {
    ($t:ident) => {
        impl ToSql for $t {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                self.0.to_sql()
            }
        }

        impl FromSql for $t {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                FromSql::column_result(value).map(Self)
            }
        }
    };
}

string_id_sql!(MailboxId);
string_id_sql!(MessageId);
string_id_sql!(RemoteMailboxId);
string_id_sql!(RemoteMessageId);

impl ToSql for Uid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(i64::from(u32::from(*self)).into()))
    }
}

impl FromSql for Uid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = u32::column_result(value)?;
        Self::of(inner).ok_or(FromSqlError::OutOfRange(inner.into()))
    }
}

impl ToSql for FlagSet {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(self.to_db().into()))
    }
}

impl FromSql for FlagSet {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Ok(FlagSet::from_db(s))
    }
}

/// A timestamp stored as RFC 3339 text so that the original zone survives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rfc3339(pub DateTime<FixedOffset>);

impl ToSql for Rfc3339 {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(self.0.to_rfc3339().into()))
    }
}

impl FromSql for Rfc3339 {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        DateTime::parse_from_rfc3339(value.as_str()?)
            .map(Self)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// A value stored as a CBOR blob.
#[derive(Clone, Debug, PartialEq)]
pub struct Cbor<T>(pub T);

impl<T: serde::Serialize> ToSql for Cbor<T> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        serde_cbor::to_vec(&self.0)
            .map(|v| ToSqlOutput::Owned(v.into()))
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    }
}

impl<T: serde::de::DeserializeOwned> FromSql for Cbor<T> {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        serde_cbor::from_slice(value.as_blob()?)
            .map(Self)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Mailbox attributes, stored space-separated.
fn split_attributes(s: &str) -> Vec<String> {
    s.split(' ')
        .filter(|a| !a.is_empty())
        .map(str::to_owned)
        .collect()
}

pub fn join_attributes(attributes: &[String]) -> String {
    attributes.join(" ")
}

/// All data pertaining to a particular mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub id: MailboxId,
    pub remote_id: RemoteMailboxId,
    pub name: String,
    pub uid_validity: u32,
    pub next_uid: Uid,
    pub subscribed: bool,
    pub flags: FlagSet,
    pub permanent_flags: FlagSet,
    pub attributes: Vec<String>,
}

impl FromRow for Mailbox {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            remote_id: row.get("remote_id")?,
            name: row.get("name")?,
            uid_validity: row.get("uid_validity")?,
            next_uid: row.get("next_uid")?,
            subscribed: row.get("subscribed")?,
            flags: row.get("flags")?,
            permanent_flags: row.get("permanent_flags")?,
            attributes: split_attributes(
                &row.get::<_, String>("attributes")?,
            ),
        })
    }
}

/// The data needed to insert a new mailbox.
#[derive(Debug, Clone)]
pub struct NewMailbox<'a> {
    pub remote_id: &'a RemoteMailboxId,
    pub name: &'a str,
    pub uid_validity: u32,
    pub subscribed: bool,
    pub flags: &'a FlagSet,
    pub permanent_flags: &'a FlagSet,
    pub attributes: &'a [String],
}

/// All data pertaining to a single message.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub remote_id: RemoteMessageId,
    pub date: DateTime<FixedOffset>,
    pub size: u32,
    /// The pre-rendered `BODY` response.
    pub body: String,
    /// The pre-rendered `BODYSTRUCTURE` response.
    pub body_structure: String,
    pub envelope: Envelope,
    /// The flags shared by all links of the message; never includes
    /// `\Deleted` or `\Recent`.
    pub flags: FlagSet,
    /// The tombstone bit.
    pub deleted: bool,
}

impl FromRow for Message {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            remote_id: row.get("remote_id")?,
            date: row.get::<_, Rfc3339>("date")?.0,
            size: row.get("size")?,
            body: row.get("body")?,
            body_structure: row.get("body_structure")?,
            envelope: row.get::<_, Cbor<Envelope>>("envelope")?.0,
            flags: row.get("flags")?,
            deleted: row.get("deleted")?,
        })
    }
}

/// A message as it appears in a particular mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMessage {
    pub id: MessageId,
    pub remote_id: RemoteMessageId,
    pub uid: Uid,
    pub recent: bool,
    pub deleted: bool,
    /// The shared flags of the message.
    pub flags: FlagSet,
}

impl MailboxMessage {
    /// The flags a session sees for this message, not counting `\Recent`.
    pub fn visible_flags(&self) -> FlagSet {
        if self.deleted {
            self.flags.clone().with(Flag::Deleted)
        } else {
            self.flags.clone()
        }
    }
}

impl FromRow for MailboxMessage {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            remote_id: row.get("remote_id")?,
            uid: row.get("uid")?,
            recent: row.get("recent")?,
            deleted: row.get("deleted")?,
            flags: row.get("flags")?,
        })
    }
}

pub fn from_row<T: FromRow>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    T::from_row(row)
}

pub fn from_single<T: FromSql>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    row.get(0)
}

pub trait FromRow: Sized {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

macro_rules! from_row_tuple {
    ($($ix:tt: $t:ident),*) => {
        impl<$($t: FromSql,)*> FromRow
        for ($($t,)*) {
            fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
                Ok(($(row.get($ix)?,)*))
            }
        }
    }
}

from_row_tuple!(0: A);
from_row_tuple!(0: A, 1: B);
from_row_tuple!(0: A, 1: B, 2: C);
