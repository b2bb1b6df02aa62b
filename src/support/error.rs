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

use std::io;

use thiserror::Error;

/// The error type returned by connector implementations.
///
/// These are carried through the engine untouched inside `Error::Connector`.
pub type ConnectorError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such mailbox")]
    NxMailbox,
    #[error("No such message")]
    NxMessage,
    #[error("No such snapshot")]
    NxSnapshot,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Mailbox already subscribed")]
    AlreadySubscribed,
    #[error("Mailbox already unsubscribed")]
    AlreadyUnsubscribed,
    #[error("No mailbox selected")]
    NotSelected,
    #[error("Mailbox is read-only")]
    MailboxReadOnly,
    #[error("Cannot rename mailbox into itself")]
    RenameIntoSelf,
    #[error("INBOX cannot be deleted")]
    DeleteInbox,
    #[error("Unsafe mailbox name or message id")]
    UnsafeName,
    #[error("Bad update: {0}")]
    BadUpdate(String),
    #[error("Bad keyword")]
    BadKeyword,
    #[error("Invalid section part")]
    InvalidSectionPart,
    #[error("Recent flag is read-only")]
    RecentFlagReadOnly,
    #[error("Unknown charset")]
    BadCharset,
    #[error("Too many login attempts")]
    LoginBlocked,
    #[error("Invalid credentials")]
    BadCredentials,
    #[error("UID validity exceeded limit")]
    UidValidityExceeded,
    #[error("Mailbox UIDs exhausted")]
    UidsExhausted,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Connector error: {0}")]
    Connector(#[source] ConnectorError),
    #[error("Logging setup failed: {0}")]
    Logging(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
    #[error(transparent)]
    MailParse(#[from] mailparse::MailParseError),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

/// The IMAP status condition an error should be reported to the client as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Condition {
    /// `NO`: the command failed for a reason the client could anticipate.
    No,
    /// `BAD`: the client asked for something nonsensical.
    Bad,
    /// `BYE`: the session cannot continue.
    Bye,
}

impl Error {
    /// Classifies this error as the condition the client layer should
    /// respond with.
    pub fn condition(&self) -> Condition {
        match *self {
            Error::NotSelected
            | Error::BadUpdate(..)
            | Error::BadKeyword
            | Error::InvalidSectionPart
            | Error::BadCharset => Condition::Bad,

            Error::LoginBlocked | Error::Cancelled | Error::NxSnapshot => {
                Condition::Bye
            },

            _ => Condition::No,
        }
    }
}
