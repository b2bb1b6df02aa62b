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

use std::collections::HashSet;

use log::info;

use super::defs::*;
use crate::account::model::*;
use crate::support::error::Error;

impl State {
    /// The `EXPUNGE` command.
    ///
    /// Every message in the selected mailbox marked `\Deleted` is removed
    /// from it. The `EXPUNGE` responses come out of the next flush.
    pub fn expunge(&mut self) -> Result<(), Error> {
        self.expunge_impl(None)
    }

    /// The `UID EXPUNGE` command: like `EXPUNGE`, but only for messages
    /// whose UID is in `uids`.
    pub fn uid_expunge(&mut self, uids: &SequenceSet) -> Result<(), Error> {
        self.expunge_impl(Some(uids))
    }

    fn expunge_impl(&mut self, uids: Option<&SequenceSet>) -> Result<(), Error> {
        let mailbox = self.selected_mailbox()?;
        if self.read_only {
            return Err(Error::MailboxReadOnly);
        }

        // Only messages this session can see are candidates; anything added
        // since the last flush is left alone
        let candidates = {
            let snapshot = self.shared.snapshot.lock().unwrap();
            let snapshot = snapshot.as_ref().ok_or(Error::NotSelected)?;
            match uids {
                Some(uids) => snapshot
                    .messages_in_uid_range(uids)
                    .into_iter()
                    .map(|(_, m)| m.id.clone())
                    .collect::<HashSet<_>>(),
                None => snapshot.ids().cloned().collect(),
            }
        };

        let doomed = self.user.db.read(&self.cancel, |txn| {
            Ok(txn
                .mailbox_messages(&mailbox.id)?
                .into_iter()
                .filter(|m| m.deleted && candidates.contains(&m.id))
                .map(|m| m.id)
                .collect::<Vec<_>>())
        })?;
        if doomed.is_empty() {
            return Ok(());
        }

        let removed = self.remove_messages_action(&doomed, &mailbox)?;
        info!(
            "{} Expunged {} message(s)",
            self.log_prefix,
            removed.len()
        );
        Ok(())
    }
}
