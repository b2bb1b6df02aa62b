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

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::channel::Receiver;
use log::{info, warn};

use crate::account::{
    model::*,
    responder::Responder,
    state_update::StateUpdate,
    storage::Mailbox,
    user::{OriginInbox, SharedState, StateId, User},
};
use crate::support::{
    cancel::CancelToken, error::Error, log_prefix::LogPrefix,
    mailbox_paths::canonical_mailbox_name,
};

/// One authenticated IMAP session.
pub struct State {
    pub(super) id: StateId,
    pub(super) user: Arc<User>,
    pub(super) log_prefix: LogPrefix,
    /// The snapshot of the selected mailbox and the invalid bit, both of
    /// which other sessions look at when publishing.
    pub(super) shared: Arc<SharedState>,
    /// Set by `EXAMINE`.
    pub(super) read_only: bool,
    pub(super) responders: VecDeque<Responder>,
    pub(super) inbox: Receiver<StateUpdate>,
    /// Updates pulled out of `inbox` while this session was itself blocked
    /// publishing, not yet turned into responders.
    pub(super) backlog: VecDeque<StateUpdate>,
    pub(super) cancel: CancelToken,
}

impl State {
    pub(crate) fn new(user: Arc<User>) -> Self {
        let (id, shared, inbox) = user.register();
        let log_prefix = user.log_prefix.deep_clone();
        log_prefix.set_session(id);
        info!("{} Session started", log_prefix);

        State {
            id,
            user,
            log_prefix,
            shared,
            read_only: false,
            responders: VecDeque::new(),
            inbox,
            backlog: VecDeque::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// Whether the selected mailbox was deleted out from under this session.
    ///
    /// An invalid session should be dropped at its next IO boundary.
    pub fn is_invalid(&self) -> bool {
        self.shared.invalid.load(Ordering::SeqCst)
    }

    /// Whether a mailbox is selected.
    pub fn is_selected(&self) -> bool {
        self.shared.snapshot.lock().unwrap().is_some()
    }

    /// Returns a token which, once cancelled, makes every operation of this
    /// session fail with `Error::Cancelled` at its next blocking point.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(super) fn canonical_name(&self, name: &str) -> Result<String, Error> {
        canonical_mailbox_name(name, self.user.config.delimiter)
    }

    /// Returns the ID of the selected mailbox, or `NotSelected`.
    pub(super) fn selected_mailbox_id(&self) -> Result<MailboxId, Error> {
        self.shared
            .snapshot
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.mailbox().clone())
            .ok_or(Error::NotSelected)
    }

    /// Returns the database row of the selected mailbox.
    pub(super) fn selected_mailbox(&self) -> Result<Mailbox, Error> {
        let id = self.selected_mailbox_id()?;
        self.user
            .db
            .read(&self.cancel, |txn| txn.mailbox_by_id(&id))?
            .ok_or(Error::NxMailbox)
    }

    /// Resolves `ids` against the snapshot to `(seqnum, id, uid)` triples in
    /// sequence order.
    pub(super) fn resolve_ids(
        &self,
        ids: &SequenceSet,
        is_uid: bool,
    ) -> Result<Vec<(Seqnum, MessageId, Uid)>, Error> {
        let snapshot = self.shared.snapshot.lock().unwrap();
        let snapshot = snapshot.as_ref().ok_or(Error::NotSelected)?;
        Ok(snapshot
            .messages_in_range(ids, is_uid)?
            .into_iter()
            .map(|(seqnum, m)| (seqnum, m.id.clone(), m.uid))
            .collect())
    }

    /// Turns every pending update into responders.
    pub(super) fn absorb_updates(&mut self) {
        let pending = self
            .backlog
            .drain(..)
            .chain(self.inbox.try_iter())
            .collect::<Vec<_>>();
        if pending.is_empty() {
            return;
        }

        let mut snapshot = self.shared.snapshot.lock().unwrap();
        let Some(ref mut snapshot) = *snapshot else {
            return;
        };
        for update in pending {
            update.apply(snapshot, &mut self.responders, false);
        }
    }

    /// Publishes `update` to every other interested session, then applies
    /// it to this one.
    ///
    /// Must be called after the transaction which made the change has
    /// committed.
    pub(super) fn publish(&mut self, update: StateUpdate) -> Result<(), Error> {
        let origin = OriginInbox {
            id: self.id,
            inbox: &self.inbox,
            backlog: &mut self.backlog,
        };
        self.user.publish(Some(origin), &update, &self.cancel)?;

        // Anything other sessions published before us comes first
        self.absorb_updates();

        let filter = update.filter();
        let mut snapshot = self.shared.snapshot.lock().unwrap();
        if let Some(ref mut snapshot) = *snapshot {
            if filter.matches(Some(snapshot)) {
                update.apply(snapshot, &mut self.responders, true);
            }
        }
        Ok(())
    }

    /// Drops the current snapshot, if any.
    ///
    /// Every `\Recent` bit of the mailbox is cleared (unless it was opened
    /// read-only), and any tombstoned message only this snapshot still held
    /// on to is reclaimed.
    pub(super) fn close_snapshot(&mut self) -> Result<(), Error> {
        let snapshot = self.shared.snapshot.lock().unwrap().take();
        self.responders.clear();
        self.backlog.clear();
        self.inbox.try_iter().for_each(drop);
        self.log_prefix.set_mailbox(None);

        let Some(snapshot) = snapshot else {
            return Ok(());
        };

        // Cleanup runs even if this session has been cancelled
        if !self.read_only {
            self.user.db.write(&self.user.cancel, |txn| {
                txn.clear_mailbox_recent(snapshot.mailbox())
            })?;
        }
        self.read_only = false;
        self.user.sweep()
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if let Err(e) = self.close_snapshot() {
            warn!("{} Failed to close snapshot: {}", self.log_prefix, e);
        }
        self.user.unregister(self.id);
        info!("{} Session ended", self.log_prefix);
    }
}

#[cfg(test)]
pub(super) struct TestFixture {
    pub(super) inner: crate::account::user::test::UserFixture,
}

#[cfg(test)]
impl TestFixture {
    pub(super) fn new() -> Self {
        Self {
            inner: crate::account::user::test::UserFixture::new(),
        }
    }

    pub(super) fn with_config(
        config: crate::support::system_config::EngineConfig,
    ) -> Self {
        Self {
            inner: crate::account::user::test::UserFixture::with_config(config),
        }
    }

    pub(super) fn user(&self) -> &Arc<User> {
        &self.inner.user
    }

    pub(super) fn connector(
        &self,
    ) -> &crate::connector::dummy::DummyConnector {
        &self.inner.connector
    }

    pub(super) fn state(&self) -> State {
        self.inner.user.new_state()
    }

    /// Creates the named mailboxes through a throwaway session.
    pub(super) fn create(&self, names: &[&str]) {
        let mut state = self.state();
        for &name in names {
            state.create(name).unwrap();
        }
    }

    /// Appends a message with the given subject and flags, returning its
    /// UID.
    pub(super) fn append(&self, mailbox: &str, subject: &str) -> Uid {
        self.append_with_flags(mailbox, subject, &[])
    }

    pub(super) fn append_with_flags(
        &self,
        mailbox: &str,
        subject: &str,
        flags: &[Flag],
    ) -> Uid {
        let mut state = self.state();
        state
            .append(AppendRequest {
                mailbox: mailbox.to_owned(),
                literal: literal(subject),
                flags: flags.to_vec(),
                date: None,
            })
            .unwrap()
            .uid
    }

    /// Returns the message ID the given snapshot-less view of `mailbox`
    /// has under `uid`.
    pub(super) fn message_id(&self, mailbox: &str, uid: Uid) -> MessageId {
        let user = self.user();
        user.db
            .read(&user.cancel, |txn| {
                let mailbox = txn.require_mailbox(mailbox)?;
                Ok(txn
                    .mailbox_messages(&mailbox.id)?
                    .into_iter()
                    .find(|m| m.uid == uid)
                    .map(|m| m.id))
            })
            .unwrap()
            .unwrap()
    }
}

#[cfg(test)]
pub(super) fn literal(subject: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@example.com>\r\n\
         To: Bob <bob@example.com>\r\n\
         Subject: {subject}\r\n\
         Date: Tue, 15 Nov 1994 08:12:31 -0800\r\n\
         \r\n\
         Hello about {subject}.\r\n"
    )
    .into_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drop_releases_session() {
        let fixture = TestFixture::new();
        fixture.create(&["A"]);
        let mut state = fixture.state();
        assert!(!state.is_selected());
        state.select("A").unwrap();
        assert!(state.is_selected());
        assert_eq!(1, fixture.user().state_count());
        drop(state);
        assert_eq!(0, fixture.user().state_count());
    }

    #[test]
    fn not_selected_errors() {
        let fixture = TestFixture::new();
        let state = fixture.state();
        assert_matches!(Err(Error::NotSelected), state.selected_mailbox_id());
        assert_matches!(
            Err(Error::NotSelected),
            state.resolve_ids(&SequenceSet::all(), false)
        );
    }
}
