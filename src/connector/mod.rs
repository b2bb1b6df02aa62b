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

//! The interface between the engine and the remote mail service.
//!
//! A connector is a black box from the engine's point of view. Calls return
//! synchronously with the remote result; if the remote service is offline,
//! it is the connector's business to queue the operation and answer as if it
//! had succeeded. Changes originating on the remote side are delivered
//! asynchronously through the channel returned by `Connector::updates`.
//!
//! Mailbox names are passed to the connector as their hierarchy components,
//! so the connector never needs to know the delimiter.

pub mod dummy;

use chrono::prelude::*;
use crossbeam::channel::{self, Receiver, Sender};

use crate::account::model::*;
pub use crate::support::error::ConnectorError;

/// A mailbox as the connector knows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteMailbox {
    pub id: RemoteMailboxId,
    pub name: Vec<String>,
    pub flags: FlagSet,
    pub permanent_flags: FlagSet,
    pub attributes: Vec<String>,
}

/// The flags and attributes the connector wants a new mailbox to have.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailboxFlags {
    pub flags: FlagSet,
    pub permanent_flags: FlagSet,
    pub attributes: Vec<String>,
}

impl MailboxFlags {
    /// What most mail services offer: the five writable system flags.
    pub fn standard() -> Self {
        let flags: FlagSet = vec![
            Flag::Answered,
            Flag::Deleted,
            Flag::Draft,
            Flag::Flagged,
            Flag::Seen,
        ]
        .into_iter()
        .collect();

        MailboxFlags {
            permanent_flags: flags.clone(),
            flags,
            attributes: Vec::new(),
        }
    }
}

/// A message as the connector knows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: RemoteMessageId,
    pub flags: FlagSet,
    pub date: DateTime<FixedOffset>,
    pub mailbox_ids: Vec<RemoteMailboxId>,
}

pub trait Connector: Send + Sync {
    /// Checks the credentials of `user`.
    fn authorize(&self, user: &str, password: &[u8]) -> bool;

    /// Checks whether a mailbox may be created under `name`, returning the
    /// flags it would have.
    fn validate_create(
        &self,
        name: &[String],
    ) -> Result<MailboxFlags, ConnectorError>;
    fn validate_update(
        &self,
        old_name: &[String],
        new_name: &[String],
    ) -> Result<(), ConnectorError>;
    fn validate_delete(&self, name: &[String]) -> Result<(), ConnectorError>;

    fn create_mailbox(
        &self,
        name: &[String],
    ) -> Result<RemoteMailbox, ConnectorError>;
    fn get_mailbox(
        &self,
        id: &RemoteMailboxId,
    ) -> Result<RemoteMailbox, ConnectorError>;
    fn update_mailbox_name(
        &self,
        id: &RemoteMailboxId,
        name: &[String],
    ) -> Result<(), ConnectorError>;
    fn delete_mailbox(&self, id: &RemoteMailboxId)
        -> Result<(), ConnectorError>;

    /// Creates a message in `mailbox`.
    ///
    /// Returns the remote message and the literal as the remote side will
    /// serve it, which may differ from what was given.
    fn create_message(
        &self,
        mailbox: &RemoteMailboxId,
        literal: &[u8],
        flags: &FlagSet,
        date: DateTime<FixedOffset>,
    ) -> Result<(RemoteMessage, Vec<u8>), ConnectorError>;
    fn get_message(
        &self,
        id: &RemoteMessageId,
    ) -> Result<RemoteMessage, ConnectorError>;

    fn add_messages_to_mailbox(
        &self,
        ids: &[RemoteMessageId],
        mailbox: &RemoteMailboxId,
    ) -> Result<(), ConnectorError>;
    fn remove_messages_from_mailbox(
        &self,
        ids: &[RemoteMessageId],
        mailbox: &RemoteMailboxId,
    ) -> Result<(), ConnectorError>;
    fn move_messages(
        &self,
        ids: &[RemoteMessageId],
        from: &RemoteMailboxId,
        to: &RemoteMailboxId,
    ) -> Result<(), ConnectorError>;

    fn mark_messages_seen(
        &self,
        ids: &[RemoteMessageId],
        seen: bool,
    ) -> Result<(), ConnectorError>;
    fn mark_messages_flagged(
        &self,
        ids: &[RemoteMessageId],
        flagged: bool,
    ) -> Result<(), ConnectorError>;

    /// Informs the connector that the engine raised the account's
    /// UIDVALIDITY.
    fn set_uid_validity(&self, uid_validity: u32)
        -> Result<(), ConnectorError>;

    /// Returns the feed of remote changes.
    ///
    /// This is called once per user, when the user is opened.
    fn updates(&self) -> Receiver<Update>;

    fn close(&self) -> Result<(), ConnectorError>;
}

/// A change made on the remote side.
///
/// Mailboxes and messages are always identified by their *current* remote
/// IDs; the connector never learns the engine's internal IDs.
#[derive(Clone, Debug)]
pub enum UpdateKind {
    MailboxCreated(RemoteMailbox),
    MailboxDeleted(RemoteMailboxId),
    MailboxUpdated {
        id: RemoteMailboxId,
        name: Vec<String>,
    },
    /// A provisional remote ID was replaced by the real one.
    MailboxIdChanged {
        old: RemoteMailboxId,
        new: RemoteMailboxId,
    },
    MessagesCreated(Vec<MessageCreated>),
    /// The full set of mailboxes the message is in changed.
    MessageMailboxesUpdated {
        id: RemoteMessageId,
        mailbox_ids: Vec<RemoteMailboxId>,
        seen: bool,
        flagged: bool,
    },
    MessageFlagsUpdated {
        id: RemoteMessageId,
        seen: bool,
        flagged: bool,
    },
    MessageIdChanged {
        old: RemoteMessageId,
        new: RemoteMessageId,
    },
    MessageDeleted(RemoteMessageId),
    Noop,
    /// Something the connector produced but the engine has no handling for.
    Unknown(String),
}

#[derive(Clone, Debug)]
pub struct MessageCreated {
    pub message: RemoteMessage,
    pub literal: Vec<u8>,
    pub mailbox_ids: Vec<RemoteMailboxId>,
}

/// An update together with its completion signal.
#[derive(Debug)]
pub struct Update {
    pub kind: UpdateKind,
    done: Option<Sender<Result<(), String>>>,
}

impl Update {
    /// Wraps `kind` with no completion signal.
    pub fn new(kind: UpdateKind) -> Self {
        Update { kind, done: None }
    }

    /// Wraps `kind`, returning a receiver which gets the outcome of applying
    /// it.
    pub fn with_done(kind: UpdateKind) -> (Self, Receiver<Result<(), String>>) {
        let (sender, receiver) = channel::bounded(1);
        (
            Update {
                kind,
                done: Some(sender),
            },
            receiver,
        )
    }

    /// Signals that the update has been applied (or failed to be).
    pub fn done(self, result: Result<(), String>) {
        if let Some(done) = self.done {
            // The connector may have stopped caring
            let _ = done.send(result);
        }
    }
}
