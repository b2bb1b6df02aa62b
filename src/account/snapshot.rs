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

use std::collections::HashMap;

use crate::account::model::*;
use crate::support::error::Error;

/// One message as a snapshot sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotMessage {
    pub id: MessageId,
    pub remote_id: RemoteMessageId,
    pub uid: Uid,
    /// The flags as this session last saw them, including `\Deleted` and
    /// `\Recent`.
    pub flags: FlagSet,
}

/// A session's view of its selected mailbox.
///
/// Messages are kept sorted strictly ascending by UID; the sequence number of
/// a message is always its index plus one.
#[derive(Clone, Debug)]
pub struct Snapshot {
    mailbox: MailboxId,
    remote_mailbox: RemoteMailboxId,
    messages: Vec<SnapshotMessage>,
    index: HashMap<MessageId, usize>,
}

impl Snapshot {
    pub fn new(
        mailbox: MailboxId,
        remote_mailbox: RemoteMailboxId,
        messages: Vec<SnapshotMessage>,
    ) -> Self {
        let mut this = Self {
            mailbox,
            remote_mailbox,
            messages,
            index: HashMap::new(),
        };
        this.messages.sort_by_key(|m| m.uid);
        this.reindex(0);
        this
    }

    fn reindex(&mut self, from: usize) {
        for (ix, message) in self.messages.iter().enumerate().skip(from) {
            self.index.insert(message.id.clone(), ix);
        }
    }

    pub fn mailbox(&self) -> &MailboxId {
        &self.mailbox
    }

    pub fn remote_mailbox(&self) -> &RemoteMailboxId {
        &self.remote_mailbox
    }

    pub fn set_remote_mailbox(&mut self, remote_id: RemoteMailboxId) {
        self.remote_mailbox = remote_id;
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn has(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Seqnum, &SnapshotMessage)> {
        self.messages
            .iter()
            .enumerate()
            .map(|(ix, m)| (Seqnum::from_index(ix), m))
    }

    pub fn get_by_id(
        &self,
        id: &MessageId,
    ) -> Option<(Seqnum, &SnapshotMessage)> {
        let &ix = self.index.get(id)?;
        Some((Seqnum::from_index(ix), &self.messages[ix]))
    }

    pub fn get_by_seq(&self, seqnum: Seqnum) -> Option<&SnapshotMessage> {
        self.messages.get(seqnum.to_index())
    }

    pub fn get_by_uid(&self, uid: Uid) -> Option<(Seqnum, &SnapshotMessage)> {
        let ix = self.messages.binary_search_by_key(&uid, |m| m.uid).ok()?;
        Some((Seqnum::from_index(ix), &self.messages[ix]))
    }

    /// The greatest UID in the snapshot, if any.
    pub fn max_uid(&self) -> Option<Uid> {
        self.messages.last().map(|m| m.uid)
    }

    /// Resolves a sequence set to the messages it names, in sequence order
    /// without duplicates.
    ///
    /// Sequence numbers past the end are clamped away, but a range entirely
    /// past the end (including any range at all in an empty mailbox) is an
    /// error.
    pub fn messages_in_seq_range(
        &self,
        set: &SequenceSet,
    ) -> Result<Vec<(Seqnum, &SnapshotMessage)>, Error> {
        let len = self.messages.len() as u32;
        let mut indices = Vec::new();
        for (lo, hi) in set.resolve(len) {
            if lo > len || 0 == lo {
                return Err(Error::NxMessage);
            }
            indices.extend((lo - 1) as usize..hi.min(len) as usize);
        }

        Ok(self.collect_indices(indices))
    }

    /// Resolves a UID set to the messages it names, in sequence order
    /// without duplicates.
    ///
    /// UIDs which don't exist are silently ignored.
    pub fn messages_in_uid_range(
        &self,
        set: &SequenceSet,
    ) -> Vec<(Seqnum, &SnapshotMessage)> {
        let Some(max) = self.max_uid() else {
            return Vec::new();
        };

        let mut indices = Vec::new();
        for (lo, hi) in set.resolve(max.into()) {
            let start = self
                .messages
                .partition_point(|m| u32::from(m.uid) < lo);
            let end = self
                .messages
                .partition_point(|m| u32::from(m.uid) <= hi);
            indices.extend(start..end);
        }

        self.collect_indices(indices)
    }

    /// Resolves either kind of set.
    pub fn messages_in_range(
        &self,
        set: &SequenceSet,
        is_uid: bool,
    ) -> Result<Vec<(Seqnum, &SnapshotMessage)>, Error> {
        if is_uid {
            Ok(self.messages_in_uid_range(set))
        } else {
            self.messages_in_seq_range(set)
        }
    }

    fn collect_indices(
        &self,
        mut indices: Vec<usize>,
    ) -> Vec<(Seqnum, &SnapshotMessage)> {
        indices.sort_unstable();
        indices.dedup();
        indices
            .into_iter()
            .map(|ix| (Seqnum::from_index(ix), &self.messages[ix]))
            .collect()
    }

    pub fn messages_with(
        &self,
        flag: &Flag,
    ) -> impl Iterator<Item = (Seqnum, &SnapshotMessage)> + '_ {
        let flag = flag.clone();
        self.iter().filter(move |(_, m)| m.flags.contains(&flag))
    }

    pub fn messages_without(
        &self,
        flag: &Flag,
    ) -> impl Iterator<Item = (Seqnum, &SnapshotMessage)> + '_ {
        let flag = flag.clone();
        self.iter().filter(move |(_, m)| !m.flags.contains(&flag))
    }

    /// Adds a message to the snapshot, returning its sequence number.
    ///
    /// Messages normally arrive in ascending UID order, but one which arrives
    /// late with a lower UID than the current maximum is slotted into place.
    pub fn append(&mut self, message: SnapshotMessage) -> Seqnum {
        debug_assert!(!self.has(&message.id));

        let ix = if self.max_uid().map_or(true, |max| message.uid > max) {
            self.messages.len()
        } else {
            self.messages.partition_point(|m| m.uid < message.uid)
        };

        self.messages.insert(ix, message);
        self.reindex(ix);
        Seqnum::from_index(ix)
    }

    /// Removes a message, returning the sequence number it had.
    pub fn expunge(&mut self, id: &MessageId) -> Option<Seqnum> {
        let ix = self.index.remove(id)?;
        self.messages.remove(ix);
        self.reindex(ix);
        Some(Seqnum::from_index(ix))
    }

    /// Replaces the flags of a message, keeping `\Recent` as it was.
    ///
    /// Returns the new flags, or `None` if the message isn't in the
    /// snapshot.
    pub fn set_flags(
        &mut self,
        id: &MessageId,
        flags: FlagSet,
    ) -> Option<(Seqnum, Uid, &FlagSet)> {
        let &ix = self.index.get(id)?;
        let message = &mut self.messages[ix];
        let recent = message.flags.contains(&Flag::Recent);
        let mut flags = flags.without(&Flag::Recent);
        if recent {
            flags.insert(Flag::Recent);
        }
        message.flags = flags;
        Some((Seqnum::from_index(ix), message.uid, &message.flags))
    }

    pub fn set_remote_id(&mut self, id: &MessageId, remote_id: RemoteMessageId) {
        if let Some(&ix) = self.index.get(id) {
            self.messages[ix].remote_id = remote_id;
        }
    }

    /// Returns the IDs of every message in the snapshot.
    pub fn ids(&self) -> impl Iterator<Item = &MessageId> + '_ {
        self.messages.iter().map(|m| &m.id)
    }
}
