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

use super::defs::*;
use crate::account::model::*;
use crate::support::error::Error;

impl State {
    /// The `STORE` and `UID STORE` commands.
    ///
    /// Nothing is returned directly: the `FETCH` responses (unless the store
    /// is silent) come out of the next flush like any other change.
    pub fn store(&mut self, request: &StoreRequest<'_>) -> Result<(), Error> {
        let mailbox = self.selected_mailbox_id()?;
        if self.read_only {
            return Err(Error::MailboxReadOnly);
        }
        if request.flags.contains(&Flag::Recent) {
            return Err(Error::RecentFlagReadOnly);
        }

        let ids = self
            .resolve_ids(request.ids, request.is_uid)?
            .into_iter()
            .map(|(_, id, _)| id)
            .collect::<Vec<_>>();
        if ids.is_empty() {
            return Ok(());
        }

        let flags = request.flags.iter().cloned().collect::<FlagSet>();
        self.store_action(
            &mailbox,
            &ids,
            request.op,
            &flags,
            request.is_uid,
            request.silent,
        )
    }
}
