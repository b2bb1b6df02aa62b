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

use chrono::prelude::*;
use log::{info, warn};

use super::defs::*;
use crate::account::{model::*, state_update::StateUpdate, storage::Mailbox};
use crate::mime::{header, parse};
use crate::support::error::Error;

impl State {
    /// The `APPEND` command.
    ///
    /// A literal stamped with the internal ID of a message this user already
    /// has is not uploaded again; the existing message is linked into the
    /// mailbox instead.
    pub fn append(
        &mut self,
        request: AppendRequest,
    ) -> Result<AppendResponse, Error> {
        let mailbox = self.mailbox_named(&request.mailbox)?;

        if let Some(id) = header::extract_gluon_id(&request.literal) {
            let known = self
                .user
                .db
                .read(&self.cancel, |txn| Ok(txn.message(&id)?.is_some()))?;
            if known {
                info!("{} APPEND of known message {}", self.log_prefix, id);
                let added = self.add_messages_action(&[id], &mailbox)?;
                let &(_, uid) = added.first().ok_or(Error::NxMessage)?;
                return Ok(AppendResponse {
                    uid_validity: mailbox.uid_validity,
                    uid,
                });
            }
        }

        let date = request.date.unwrap_or_else(|| Utc::now().fixed_offset());
        let flags = request
            .flags
            .iter()
            .filter(|&f| Flag::Recent != *f)
            .cloned()
            .collect::<FlagSet>();
        let deleted = flags.contains(&Flag::Deleted);
        let shared_flags = flags.without(&Flag::Deleted);

        // Don't bother the connector with something that can't be stored
        parse::parse_message(&request.literal, Some(date))?;
        let (remote, literal) = self
            .user
            .connector
            .create_message(
                &mailbox.remote_id,
                &request.literal,
                &shared_flags,
                date,
            )
            .map_err(Error::Connector)?;

        let id = MessageId::generate();
        let literal = header::set_gluon_id(&literal, &id);
        let parsed = parse::parse_message(&literal, Some(date))?;
        self.user.literals.set(&id, &literal)?;

        let result = self.user.db.write(&self.cancel, |txn| {
            txn.create_message(&id, &remote.id, &parsed, &shared_flags)?;
            txn.add_message_to_mailbox(&mailbox.id, &id, true, deleted)
        });
        let uid = match result {
            Ok(uid) => uid,
            Err(e) => {
                if let Err(e2) = self.user.literals.delete(&[id]) {
                    warn!(
                        "{} Failed to clean up orphaned literal: {}",
                        self.log_prefix, e2
                    );
                }
                return Err(e);
            },
        };

        self.publish(StateUpdate::Exists {
            mailbox: mailbox.id.clone(),
            messages: vec![(id, uid)],
        })?;
        Ok(AppendResponse {
            uid_validity: mailbox.uid_validity,
            uid,
        })
    }

    /// The `COPY` and `UID COPY` commands.
    ///
    /// Copying a message into the mailbox it's already in gives it a new
    /// UID.
    pub fn copy(
        &mut self,
        ids: &SequenceSet,
        is_uid: bool,
        dest: &str,
    ) -> Result<CopyResponse, Error> {
        let resolved = self.resolve_ids(ids, is_uid)?;
        let dst = self.mailbox_named(dest)?;
        let ids = resolved
            .iter()
            .map(|&(_, ref id, _)| id.clone())
            .collect::<Vec<_>>();

        let added = self.add_messages_action(&ids, &dst)?;
        Ok(copy_response(&dst, &resolved, added))
    }

    /// The `MOVE` and `UID MOVE` commands.
    pub fn move_messages(
        &mut self,
        ids: &SequenceSet,
        is_uid: bool,
        dest: &str,
    ) -> Result<CopyResponse, Error> {
        if self.read_only {
            return Err(Error::MailboxReadOnly);
        }

        let resolved = self.resolve_ids(ids, is_uid)?;
        let src = self.selected_mailbox()?;
        let dst = self.mailbox_named(dest)?;
        let ids = resolved
            .iter()
            .map(|&(_, ref id, _)| id.clone())
            .collect::<Vec<_>>();

        let added = self.move_messages_action(&ids, &src, &dst)?;
        Ok(copy_response(&dst, &resolved, added))
    }

    fn mailbox_named(&self, name: &str) -> Result<Mailbox, Error> {
        let name = self.canonical_name(name)?;
        self.user
            .db
            .read(&self.cancel, |txn| txn.require_mailbox(&name))
    }
}

/// Builds the `COPYUID` data for the messages in `resolved` which made it
/// into `dst`.
fn copy_response(
    dst: &Mailbox,
    resolved: &[(Seqnum, MessageId, Uid)],
    added: Vec<(MessageId, Uid)>,
) -> CopyResponse {
    let added = added.into_iter().collect::<HashMap<_, _>>();
    let mut response = CopyResponse {
        uid_validity: dst.uid_validity,
        ..CopyResponse::default()
    };

    for &(_, ref id, from) in resolved {
        if let Some(&to) = added.get(id) {
            response.from_uids.insert(from);
            response.to_uids.insert(to);
        }
    }
    response
}
