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

use std::sync::atomic::Ordering;

use log::info;

use super::defs::*;
use crate::account::{
    model::*,
    responder::Responder,
    snapshot::{Snapshot, SnapshotMessage},
    storage::Txn,
};
use crate::support::error::Error;

impl State {
    /// The `SELECT` command.
    pub fn select(&mut self, name: &str) -> Result<SelectResponse, Error> {
        self.select_impl(name, false)
    }

    /// The `EXAMINE` command.
    pub fn examine(&mut self, name: &str) -> Result<SelectResponse, Error> {
        self.select_impl(name, true)
    }

    fn select_impl(
        &mut self,
        name: &str,
        read_only: bool,
    ) -> Result<SelectResponse, Error> {
        self.close_snapshot()?;
        let name = self.canonical_name(name)?;

        // Holding the states lock while the snapshot is built means every
        // change committed after the read is published to this session.
        let states = self.user.states.write().unwrap();
        let load = |txn: &Txn<'_>| {
            let mailbox = txn.require_mailbox(&name)?;
            let messages = txn.mailbox_messages(&mailbox.id)?;
            if !read_only {
                txn.clear_mailbox_recent(&mailbox.id)?;
            }
            Ok((mailbox, messages))
        };
        let (mailbox, messages) = if read_only {
            self.user.db.read(&self.cancel, load)?
        } else {
            self.user.db.write(&self.cancel, load)?
        };

        let snapshot = Snapshot::new(
            mailbox.id.clone(),
            mailbox.remote_id.clone(),
            messages
                .into_iter()
                .map(|m| {
                    let mut flags = m.visible_flags();
                    if m.recent {
                        flags.insert(Flag::Recent);
                    }
                    SnapshotMessage {
                        id: m.id,
                        remote_id: m.remote_id,
                        uid: m.uid,
                        flags,
                    }
                })
                .collect(),
        );

        let response = SelectResponse {
            flags: mailbox.flags,
            permanent_flags: mailbox.permanent_flags,
            exists: snapshot.len(),
            recent: snapshot.messages_with(&Flag::Recent).count(),
            unseen: snapshot
                .messages_without(&Flag::Seen)
                .next()
                .map(|(seqnum, _)| seqnum),
            uid_next: mailbox.next_uid,
            uid_validity: mailbox.uid_validity,
            read_only,
        };

        *self.shared.snapshot.lock().unwrap() = Some(snapshot);
        drop(states);

        self.read_only = read_only;
        self.shared.invalid.store(false, Ordering::SeqCst);
        self.log_prefix.set_mailbox(Some(name));
        info!(
            "{} {} mailbox",
            self.log_prefix,
            if read_only { "Examined" } else { "Selected" }
        );
        Ok(response)
    }

    /// The `CLOSE` command.
    ///
    /// Expunges every message marked `\Deleted` (unless the mailbox was
    /// opened read-only) without telling the client, then deselects.
    pub fn close(&mut self) -> Result<(), Error> {
        self.selected_mailbox_id()?;

        if !self.read_only {
            self.expunge()?;
            for responder in &mut self.responders {
                if let Responder::Expunge {
                    ref mut as_close, ..
                } = *responder
                {
                    *as_close = true;
                }
            }
            // Only the snapshot cares; the client is told nothing
            self.flush(true)?;
        }

        self.close_snapshot()
    }

    /// The `UNSELECT` command: deselect without expunging anything.
    pub fn unselect(&mut self) -> Result<(), Error> {
        self.selected_mailbox_id()?;
        self.close_snapshot()
    }
}
