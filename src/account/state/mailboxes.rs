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

use std::iter;

use log::info;

use super::defs::*;
use crate::account::{model::*, storage::Mailbox};
use crate::support::{
    error::Error,
    mailbox_paths::{is_self_or_descendant, superiors},
};

impl State {
    /// The `CREATE` command.
    ///
    /// Any missing superiors are created first.
    pub fn create(&mut self, name: &str) -> Result<(), Error> {
        let name = self.canonical_name(name)?;
        let missing = self.missing_mailboxes(&name)?;
        if !missing.contains(&name) {
            return Err(Error::MailboxExists);
        }

        for name in missing {
            self.create_mailbox_action(&name)?;
        }
        Ok(())
    }

    /// The `DELETE` command.
    ///
    /// Returns whether the deleted mailbox was the selected one, in which
    /// case this session is now invalid and should be dropped once the
    /// response is sent.
    pub fn delete(&mut self, name: &str) -> Result<bool, Error> {
        let name = self.canonical_name(name)?;
        if "INBOX" == name {
            return Err(Error::DeleteInbox);
        }

        let mailbox = self
            .user
            .db
            .read(&self.cancel, |txn| txn.require_mailbox(&name))?;
        self.delete_mailbox_action(&mailbox)
    }

    /// The `RENAME` command.
    ///
    /// Renaming `INBOX` moves all its messages into a new mailbox and leaves
    /// `INBOX` itself (and its inferiors) alone. Any other rename carries the
    /// inferiors of the mailbox along with it.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), Error> {
        let old = self.canonical_name(old)?;
        let new = self.canonical_name(new)?;
        let delim = self.user.config.delimiter;

        let (mailbox, new_exists) = self.user.db.read(&self.cancel, |txn| {
            let mailbox = txn.require_mailbox(&old)?;
            Ok((mailbox, txn.mailbox_by_name(&new)?.is_some()))
        })?;
        if new_exists {
            return Err(Error::MailboxExists);
        }
        if is_self_or_descendant(&new, &old, delim) {
            return Err(Error::RenameIntoSelf);
        }

        if "INBOX" == old {
            return self.rename_inbox(&mailbox, &new);
        }

        let moving = self.user.db.read(&self.cancel, |txn| {
            let moving = txn
                .all_mailboxes()?
                .into_iter()
                .filter(|m| is_self_or_descendant(&m.name, &old, delim))
                .map(|m| {
                    let new_name = format!("{}{}", new, &m.name[old.len()..]);
                    (m, new_name)
                })
                .collect::<Vec<_>>();

            // An inferior may collide even when `new` itself is free
            for (_, new_name) in &moving {
                if txn.mailbox_by_name(new_name)?.is_some() {
                    return Err(Error::MailboxExists);
                }
            }
            Ok(moving)
        })?;

        // Either the connector accepts the whole rename or nothing is done
        for &(ref mailbox, ref new_name) in &moving {
            self.user
                .connector
                .validate_update(
                    &self.split_name(&mailbox.name),
                    &self.split_name(new_name),
                )
                .map_err(Error::Connector)?;
        }

        for superior in self.missing_superiors(&new)? {
            self.create_mailbox_action(&superior)?;
        }
        for (mailbox, new_name) in &moving {
            self.update_mailbox_action(mailbox, new_name)?;
        }
        Ok(())
    }

    fn rename_inbox(&mut self, inbox: &Mailbox, new: &str) -> Result<(), Error> {
        for superior in self.missing_superiors(new)? {
            self.create_mailbox_action(&superior)?;
        }

        let id = self.create_mailbox_action(new)?;
        let (dst, ids) = self.user.db.read(&self.cancel, |txn| {
            let dst = txn.mailbox_by_id(&id)?.ok_or(Error::NxMailbox)?;
            let ids = txn
                .mailbox_messages(&inbox.id)?
                .into_iter()
                .map(|m| m.id)
                .collect::<Vec<_>>();
            Ok((dst, ids))
        })?;

        let moved = self.move_messages_action(&ids, inbox, &dst)?;
        info!(
            "{} Moved {} message(s) out of INBOX into {}",
            self.log_prefix,
            moved.len(),
            new
        );
        Ok(())
    }

    /// The `SUBSCRIBE` command.
    pub fn subscribe(&mut self, name: &str) -> Result<(), Error> {
        let name = self.canonical_name(name)?;
        self.user.db.write(&self.cancel, |txn| {
            let mailbox = txn.require_mailbox(&name)?;
            if mailbox.subscribed {
                return Err(Error::AlreadySubscribed);
            }
            txn.set_mailbox_subscribed(&mailbox.id, true)
        })
    }

    /// The `UNSUBSCRIBE` command.
    ///
    /// This also removes the subscription left behind by a deleted mailbox.
    pub fn unsubscribe(&mut self, name: &str) -> Result<(), Error> {
        let name = self.canonical_name(name)?;
        self.user.db.write(&self.cancel, |txn| {
            match txn.mailbox_by_name(&name)? {
                Some(mailbox) if mailbox.subscribed => {
                    txn.set_mailbox_subscribed(&mailbox.id, false)
                },
                Some(_) => Err(Error::AlreadyUnsubscribed),
                None if txn.remove_deleted_subscription(&name)? => Ok(()),
                None => Err(Error::AlreadyUnsubscribed),
            }
        })
    }

    /// The `STATUS` command.
    pub fn status(
        &mut self,
        request: &StatusRequest,
    ) -> Result<StatusResponse, Error> {
        let name = self.canonical_name(&request.name)?;
        let (mailbox, (messages, recent, unseen)) =
            self.user.db.read(&self.cancel, |txn| {
                let mailbox = txn.require_mailbox(&name)?;
                let counts = txn.mailbox_counts(&mailbox.id)?;
                Ok((mailbox, counts))
            })?;

        Ok(StatusResponse {
            name: mailbox.name,
            messages: request.messages.then_some(messages),
            recent: request.recent.then_some(recent),
            uid_next: request.uid_next.then_some(mailbox.next_uid),
            uid_validity: request.uid_validity.then_some(mailbox.uid_validity),
            unseen: request.unseen.then_some(unseen),
        })
    }

    /// Returns `name` and those of its superiors which don't exist,
    /// shallowest first.
    fn missing_mailboxes(&self, name: &str) -> Result<Vec<String>, Error> {
        let delim = self.user.config.delimiter;
        self.user.db.read(&self.cancel, |txn| {
            let mut missing = Vec::new();
            for candidate in superiors(name, delim).chain(iter::once(name)) {
                if txn.mailbox_by_name(candidate)?.is_none() {
                    missing.push(candidate.to_owned());
                }
            }
            Ok(missing)
        })
    }

    fn missing_superiors(&self, name: &str) -> Result<Vec<String>, Error> {
        let mut missing = self.missing_mailboxes(name)?;
        missing.retain(|m| m != name);
        Ok(missing)
    }
}
