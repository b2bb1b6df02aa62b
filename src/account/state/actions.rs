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

//! Actions: the local verbs which change anything.
//!
//! Each action calls the connector first. Only once the connector has
//! accepted the change is the database updated, and only once that
//! transaction has committed is the change published to the sessions. A
//! connector failure therefore leaves everything local untouched, while a
//! database failure after a successful connector call is left for a later
//! remote update to reconcile.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use itertools::Itertools;
use log::{debug, info};

use super::defs::*;
use crate::account::{
    model::*,
    state_update::StateUpdate,
    storage::{Mailbox, NewMailbox, Txn},
    uid_validity,
};
use crate::support::{error::Error, mailbox_paths::split_mailbox_name};

/// What relinking messages into a mailbox did.
#[derive(Default)]
struct Relinked {
    /// Messages which were already in the mailbox under an older UID.
    replaced: Vec<MessageId>,
    added: Vec<(MessageId, Uid)>,
}

impl State {
    pub(super) fn split_name(&self, name: &str) -> Vec<String> {
        split_mailbox_name(name, self.user.config.delimiter)
    }

    /// Creates `name` remotely and mirrors it locally, returning the local
    /// ID.
    ///
    /// If the database already knows the remote ID the connector returns
    /// (the injector got there first), the existing mailbox is used.
    pub(super) fn create_mailbox_action(
        &mut self,
        name: &str,
    ) -> Result<MailboxId, Error> {
        let parts = self.split_name(name);
        let connector = &self.user.connector;
        let mailbox_flags = connector
            .validate_create(&parts)
            .map_err(Error::Connector)?;
        let remote =
            connector.create_mailbox(&parts).map_err(Error::Connector)?;

        let user = &self.user;
        let id = user.db.write(&self.cancel, |txn| {
            if let Some(existing) = txn.mailbox_by_remote_id(&remote.id)? {
                return Ok(existing.id);
            }

            let uid_validity = uid_validity::allocate(
                txn,
                &*user.uid_validity,
                user.config.max_uid_validity,
            )?;
            txn.create_mailbox(&NewMailbox {
                remote_id: &remote.id,
                name,
                uid_validity,
                subscribed: true,
                flags: &mailbox_flags.flags,
                permanent_flags: &mailbox_flags.permanent_flags,
                attributes: &mailbox_flags.attributes,
            })
        })?;

        info!("{} Created mailbox {}", self.log_prefix, name);
        Ok(id)
    }

    /// Deletes `mailbox` remotely and locally.
    ///
    /// Returns whether it was the mailbox this session had selected, in
    /// which case the session is now invalid.
    pub(super) fn delete_mailbox_action(
        &mut self,
        mailbox: &Mailbox,
    ) -> Result<bool, Error> {
        let connector = &self.user.connector;
        connector
            .validate_delete(&self.split_name(&mailbox.name))
            .map_err(Error::Connector)?;
        connector
            .delete_mailbox(&mailbox.remote_id)
            .map_err(Error::Connector)?;

        self.user.db.write(&self.cancel, |txn| {
            // The injector may have already applied the remote deletion
            if let Some(current) = txn.mailbox_by_id(&mailbox.id)? {
                txn.delete_mailbox(&current, true)?;
            }
            Ok(())
        })?;

        let was_selected =
            self.selected_mailbox_id().ok().as_ref() == Some(&mailbox.id);
        self.publish(StateUpdate::MailboxDeleted(mailbox.id.clone()))?;
        if was_selected {
            self.shared.invalid.store(true, Ordering::SeqCst);
        }

        info!("{} Deleted mailbox {}", self.log_prefix, mailbox.name);
        Ok(was_selected)
    }

    /// Renames `mailbox` to `new_name` remotely and locally.
    ///
    /// The caller is responsible for checking the whole rename with
    /// `Connector::validate_update` first.
    pub(super) fn update_mailbox_action(
        &mut self,
        mailbox: &Mailbox,
        new_name: &str,
    ) -> Result<(), Error> {
        self.user
            .connector
            .update_mailbox_name(&mailbox.remote_id, &self.split_name(new_name))
            .map_err(Error::Connector)?;
        self.user.db.write(&self.cancel, |txn| {
            txn.rename_mailbox(&mailbox.id, new_name)
        })?;

        info!(
            "{} Renamed mailbox {} to {}",
            self.log_prefix, mailbox.name, new_name
        );
        Ok(())
    }

    /// Links `ids` into `mailbox`, returning the new UIDs in the same order.
    ///
    /// A message already in the mailbox is given a fresh UID at the end of
    /// the mailbox. Messages deleted remotely are brought back.
    pub(super) fn add_messages_action(
        &mut self,
        ids: &[MessageId],
        mailbox: &Mailbox,
    ) -> Result<Vec<(MessageId, Uid)>, Error> {
        let ids = ids.iter().unique().cloned().collect::<Vec<_>>();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let remote_ids = self.remote_message_ids(&ids)?;
        self.user
            .connector
            .add_messages_to_mailbox(&remote_ids, &mailbox.remote_id)
            .map_err(Error::Connector)?;

        let relinked = self
            .user
            .db
            .write(&self.cancel, |txn| relink(txn, &ids, &mailbox.id))?;
        self.publish_relinked(&mailbox.id, &relinked)?;

        debug!(
            "{} Added {} message(s) to {}",
            self.log_prefix,
            relinked.added.len(),
            mailbox.name
        );
        Ok(relinked.added)
    }

    /// Unlinks those of `ids` which are in `mailbox`, returning the ones
    /// that were.
    pub(super) fn remove_messages_action(
        &mut self,
        ids: &[MessageId],
        mailbox: &Mailbox,
    ) -> Result<Vec<MessageId>, Error> {
        let present = self.present_in(ids, &mailbox.id)?;
        if present.is_empty() {
            return Ok(Vec::new());
        }

        let remote_ids = self.remote_message_ids(&present)?;
        self.user
            .connector
            .remove_messages_from_mailbox(&remote_ids, &mailbox.remote_id)
            .map_err(Error::Connector)?;

        self.user.db.write(&self.cancel, |txn| {
            for id in &present {
                txn.remove_message_from_mailbox(&mailbox.id, id)?;
            }
            Ok(())
        })?;
        self.publish(StateUpdate::Expunge {
            mailbox: Some(mailbox.id.clone()),
            ids: present.clone(),
        })?;

        debug!(
            "{} Removed {} message(s) from {}",
            self.log_prefix,
            present.len(),
            mailbox.name
        );
        Ok(present)
    }

    /// Moves `ids` from `src` to `dst`, returning the UIDs the moved
    /// messages got in `dst`.
    ///
    /// Moving a mailbox's messages into itself just gives them new UIDs.
    pub(super) fn move_messages_action(
        &mut self,
        ids: &[MessageId],
        src: &Mailbox,
        dst: &Mailbox,
    ) -> Result<Vec<(MessageId, Uid)>, Error> {
        let present = self.present_in(ids, &src.id)?;
        if present.is_empty() {
            return Ok(Vec::new());
        }

        if src.id == dst.id {
            let relinked = self
                .user
                .db
                .write(&self.cancel, |txn| relink(txn, &present, &dst.id))?;
            self.publish_relinked(&dst.id, &relinked)?;
            return Ok(relinked.added);
        }

        let remote_ids = self.remote_message_ids(&present)?;
        self.user
            .connector
            .move_messages(&remote_ids, &src.remote_id, &dst.remote_id)
            .map_err(Error::Connector)?;

        let relinked = self.user.db.write(&self.cancel, |txn| {
            let relinked = relink(txn, &present, &dst.id)?;
            for id in &present {
                txn.remove_message_from_mailbox(&src.id, id)?;
            }
            Ok(relinked)
        })?;

        self.publish_relinked(&dst.id, &relinked)?;
        self.publish(StateUpdate::Expunge {
            mailbox: Some(src.id.clone()),
            ids: present,
        })?;

        debug!(
            "{} Moved {} message(s) from {} to {}",
            self.log_prefix,
            relinked.added.len(),
            src.name,
            dst.name
        );
        Ok(relinked.added)
    }

    /// Applies `op` with `flags` to `ids` as seen through `mailbox`.
    ///
    /// `\Seen` and `\Flagged` go to the connector, but only for messages
    /// where they actually change. `\Deleted` belongs to the link between
    /// the message and `mailbox`. Everything else lives only on the local
    /// message row. `flags` must not contain `\Recent`.
    pub(super) fn store_action(
        &mut self,
        mailbox: &MailboxId,
        ids: &[MessageId],
        op: FlagOp,
        flags: &FlagSet,
        is_uid: bool,
        is_silent: bool,
    ) -> Result<(), Error> {
        let shared_operand = flags.clone().without(&Flag::Deleted);
        let current = self.user.db.read(&self.cancel, |txn| {
            let mut current = Vec::new();
            for id in ids.iter().unique() {
                if let Some(message) = txn.message(id)? {
                    current.push((id.clone(), message.remote_id, message.flags));
                }
            }
            Ok(current)
        })?;

        let connector = &self.user.connector;
        for (value, remote_ids) in
            remote_changes(&current, op, &shared_operand, &Flag::Seen)
        {
            connector
                .mark_messages_seen(&remote_ids, value)
                .map_err(Error::Connector)?;
        }
        for (value, remote_ids) in
            remote_changes(&current, op, &shared_operand, &Flag::Flagged)
        {
            connector
                .mark_messages_flagged(&remote_ids, value)
                .map_err(Error::Connector)?;
        }

        let present = current
            .iter()
            .map(|&(ref id, _, _)| id.clone())
            .collect::<Vec<_>>();
        self.user.db.write(&self.cancel, |txn| {
            for id in &present {
                let Some(message) = txn.message(id)? else {
                    continue;
                };
                let new = message.flags.apply(op, &shared_operand);
                if new != message.flags {
                    txn.set_message_flags(id, &new)?;
                }

                let Some(row) = txn.uid_row(mailbox, id)? else {
                    continue;
                };
                let deleted = match op {
                    FlagOp::Set => flags.contains(&Flag::Deleted),
                    FlagOp::Add => row.deleted || flags.contains(&Flag::Deleted),
                    FlagOp::Remove => {
                        row.deleted && !flags.contains(&Flag::Deleted)
                    },
                };
                if deleted != row.deleted {
                    txn.set_deleted_flag(mailbox, id, deleted)?;
                }
            }
            Ok(())
        })?;

        if present.is_empty() {
            return Ok(());
        }

        self.publish(StateUpdate::Flags {
            mailbox: Some(mailbox.clone()),
            changes: present
                .into_iter()
                .map(|id| (id, flags.clone()))
                .collect(),
            op,
            is_uid,
            is_silent,
        })
    }

    /// Returns those of `ids` which are linked into `mailbox`.
    fn present_in(
        &self,
        ids: &[MessageId],
        mailbox: &MailboxId,
    ) -> Result<Vec<MessageId>, Error> {
        self.user.db.read(&self.cancel, |txn| {
            let mut present = Vec::new();
            let mut seen = HashSet::new();
            for id in ids {
                if seen.insert(id) && txn.uid_row(mailbox, id)?.is_some() {
                    present.push(id.clone());
                }
            }
            Ok(present)
        })
    }

    /// Maps `ids` to their remote IDs, failing with `NxMessage` if any is
    /// unknown.
    fn remote_message_ids(
        &self,
        ids: &[MessageId],
    ) -> Result<Vec<RemoteMessageId>, Error> {
        self.user.db.read(&self.cancel, |txn| {
            ids.iter()
                .map(|id| {
                    txn.message(id)?
                        .map(|m| m.remote_id)
                        .ok_or(Error::NxMessage)
                })
                .collect()
        })
    }

    fn publish_relinked(
        &mut self,
        mailbox: &MailboxId,
        relinked: &Relinked,
    ) -> Result<(), Error> {
        if !relinked.replaced.is_empty() {
            self.publish(StateUpdate::Expunge {
                mailbox: Some(mailbox.clone()),
                ids: relinked.replaced.clone(),
            })?;
        }
        if !relinked.added.is_empty() {
            self.publish(StateUpdate::Exists {
                mailbox: mailbox.clone(),
                messages: relinked.added.clone(),
            })?;
        }
        Ok(())
    }
}

/// Groups the remote IDs of the messages in `current` whose `flag` changes
/// when `op` is applied with `operand`, by the new value of `flag`.
fn remote_changes(
    current: &[(MessageId, RemoteMessageId, FlagSet)],
    op: FlagOp,
    operand: &FlagSet,
    flag: &Flag,
) -> Vec<(bool, Vec<RemoteMessageId>)> {
    current
        .iter()
        .filter_map(|&(_, ref remote_id, ref old)| {
            let new = old.apply(op, operand).contains(flag);
            (new != old.contains(flag)).then(|| (new, remote_id.clone()))
        })
        .into_group_map()
        .into_iter()
        .sorted_by_key(|&(value, _)| value)
        .collect()
}

/// Links every message in `ids` into `mailbox` under a fresh UID, dropping
/// any existing link first and lifting any tombstone.
fn relink(
    txn: &Txn<'_>,
    ids: &[MessageId],
    mailbox: &MailboxId,
) -> Result<Relinked, Error> {
    let mut relinked = Relinked::default();
    for id in ids {
        let message = txn.message(id)?.ok_or(Error::NxMessage)?;
        if message.deleted {
            txn.set_message_tombstone(id, false)?;
        }
        if txn.remove_message_from_mailbox(mailbox, id)? {
            relinked.replaced.push(id.clone());
        }

        let uid = txn.add_message_to_mailbox(mailbox, id, true, false)?;
        relinked.added.push((id.clone(), uid));
    }
    Ok(relinked)
}
