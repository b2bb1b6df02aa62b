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

//! Fan-out of state updates, and application of connector updates to the
//! local mirror.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam::channel::{Receiver, SendTimeoutError};
use itertools::Itertools;
use log::{debug, info, warn};

use super::{StateId, User};
use crate::account::model::*;
use crate::account::state_update::StateUpdate;
use crate::account::storage::{NewMailbox, Txn};
use crate::account::uid_validity;
use crate::connector::{MessageCreated, RemoteMailbox, UpdateKind};
use crate::mime::{header, parse};
use crate::support::{cancel::CancelToken, error::Error};

/// How long a publisher blocks on a full queue before checking whether it
/// has been cancelled.
const SEND_POLL: Duration = Duration::from_millis(50);

/// The inbound queue of the session doing the publishing.
///
/// While the publisher waits on somebody else's full queue, it drains its own
/// into `backlog` so that two sessions publishing to each other can't
/// deadlock.
pub(crate) struct OriginInbox<'a> {
    pub(crate) id: StateId,
    pub(crate) inbox: &'a Receiver<StateUpdate>,
    pub(crate) backlog: &'a mut VecDeque<StateUpdate>,
}

impl User {
    /// Delivers `update` to every session its filter selects, other than
    /// `origin`.
    ///
    /// This must only be called after the transaction which made the change
    /// has committed, and without holding any lock.
    pub(crate) fn publish(
        &self,
        mut origin: Option<OriginInbox<'_>>,
        update: &StateUpdate,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let filter = update.filter();
        let origin_id = origin.as_ref().map(|o| o.id);

        let targets = {
            let states = self.states.read().unwrap();
            states
                .iter()
                .filter(|&(&id, _)| Some(id) != origin_id)
                .filter_map(|(_, handle)| {
                    let snapshot = handle.shared.snapshot.lock().unwrap();
                    if !filter.matches(snapshot.as_ref()) {
                        return None;
                    }

                    if snapshot.as_ref().is_some_and(|s| update.invalidates(s))
                    {
                        handle.shared.invalid.store(true, Ordering::SeqCst);
                    }
                    Some(handle.sender.clone())
                })
                .collect::<Vec<_>>()
        };

        for target in targets {
            let mut update = update.clone();
            loop {
                match target.send_timeout(update, SEND_POLL) {
                    Ok(()) => break,
                    // The session went away in the meantime
                    Err(SendTimeoutError::Disconnected(_)) => break,
                    Err(SendTimeoutError::Timeout(u)) => {
                        update = u;
                        if let Some(ref mut origin) = origin {
                            origin.backlog.extend(origin.inbox.try_iter());
                        }
                        cancel.check()?;
                    },
                }
            }
        }

        Ok(())
    }

    /// Applies one update from the connector to the local mirror.
    pub(crate) fn apply_update(&self, kind: &UpdateKind) -> Result<(), Error> {
        match *kind {
            UpdateKind::MailboxCreated(ref mailbox) => {
                self.apply_mailbox_created(mailbox)
            },
            UpdateKind::MailboxDeleted(ref id) => self.apply_mailbox_deleted(id),
            UpdateKind::MailboxUpdated { ref id, ref name } => {
                self.apply_mailbox_updated(id, name)
            },
            UpdateKind::MailboxIdChanged { ref old, ref new } => {
                self.apply_mailbox_id_changed(old, new)
            },
            UpdateKind::MessagesCreated(ref messages) => {
                for chunk in messages
                    .chunks(self.config.messages_created_chunk_size.max(1))
                {
                    self.apply_messages_created(chunk)?;
                }
                Ok(())
            },
            UpdateKind::MessageMailboxesUpdated {
                ref id,
                ref mailbox_ids,
                seen,
                flagged,
            } => self.apply_message_mailboxes_updated(
                id,
                Some(mailbox_ids),
                seen,
                flagged,
            ),
            UpdateKind::MessageFlagsUpdated {
                ref id,
                seen,
                flagged,
            } => self.apply_message_mailboxes_updated(id, None, seen, flagged),
            UpdateKind::MessageIdChanged { ref old, ref new } => {
                self.apply_message_id_changed(old, new)
            },
            UpdateKind::MessageDeleted(ref id) => self.apply_message_deleted(id),
            UpdateKind::Noop => Ok(()),
            UpdateKind::Unknown(ref what) => Err(Error::BadUpdate(what.clone())),
        }
    }

    fn remote_name(&self, name: &[String]) -> String {
        name.join(&self.config.delimiter.to_string())
    }

    fn create_remote_mailbox(
        &self,
        txn: &Txn<'_>,
        mailbox: &RemoteMailbox,
    ) -> Result<MailboxId, Error> {
        let uid_validity = uid_validity::allocate(
            txn,
            &*self.uid_validity,
            self.config.max_uid_validity,
        )?;
        txn.create_mailbox(&NewMailbox {
            remote_id: &mailbox.id,
            name: &self.remote_name(&mailbox.name),
            uid_validity,
            subscribed: true,
            flags: &mailbox.flags,
            permanent_flags: &mailbox.permanent_flags,
            attributes: &mailbox.attributes,
        })
    }

    fn apply_mailbox_created(&self, mailbox: &RemoteMailbox) -> Result<(), Error> {
        let created = self.db.write(&self.cancel, |txn| {
            if txn.mailbox_by_remote_id(&mailbox.id)?.is_some() {
                return Ok(false);
            }

            self.create_remote_mailbox(txn, mailbox)?;
            Ok(true)
        })?;

        if created {
            info!(
                "{} Remote created mailbox {:?}",
                self.log_prefix, mailbox.name
            );
        }
        Ok(())
    }

    fn apply_mailbox_deleted(
        &self,
        remote_id: &RemoteMailboxId,
    ) -> Result<(), Error> {
        let deleted = self.db.write(&self.cancel, |txn| {
            let Some(mailbox) = txn.mailbox_by_remote_id(remote_id)? else {
                return Ok(None);
            };

            txn.delete_mailbox(&mailbox, true)?;
            let uid_validity = uid_validity::allocate(
                txn,
                &*self.uid_validity,
                self.config.max_uid_validity,
            )?;
            Ok(Some((mailbox, uid_validity)))
        })?;

        let Some((mailbox, uid_validity)) = deleted else {
            return Ok(());
        };

        info!("{} Remote deleted mailbox {}", self.log_prefix, mailbox.name);
        self.publish(
            None,
            &StateUpdate::MailboxDeleted(mailbox.id),
            &self.cancel,
        )?;
        self.connector
            .set_uid_validity(uid_validity)
            .map_err(Error::Connector)
    }

    fn apply_mailbox_updated(
        &self,
        remote_id: &RemoteMailboxId,
        name: &[String],
    ) -> Result<(), Error> {
        let new_name = self.remote_name(name);
        self.db.write(&self.cancel, |txn| {
            let mailbox = txn
                .mailbox_by_remote_id(remote_id)?
                .ok_or(Error::NxMailbox)?;
            if mailbox.name != new_name {
                txn.rename_mailbox(&mailbox.id, &new_name)?;
            }
            Ok(())
        })
    }

    fn apply_mailbox_id_changed(
        &self,
        old: &RemoteMailboxId,
        new: &RemoteMailboxId,
    ) -> Result<(), Error> {
        let mailbox = self.db.write(&self.cancel, |txn| {
            let mailbox =
                txn.mailbox_by_remote_id(old)?.ok_or(Error::NxMailbox)?;
            txn.set_mailbox_remote_id(&mailbox.id, new)?;
            Ok(mailbox.id)
        })?;

        self.publish(
            None,
            &StateUpdate::MailboxRemoteIdChanged(mailbox, new.clone()),
            &self.cancel,
        )
    }

    /// Finds the local mailboxes for `remote_ids`, asking the connector
    /// about any the engine has never heard of.
    ///
    /// Mailboxes the connector doesn't know either are left out.
    fn discover_mailboxes(
        &self,
        remote_ids: &HashSet<&RemoteMailboxId>,
    ) -> Result<Vec<RemoteMailbox>, Error> {
        let unknown = self.db.read(&self.cancel, |txn| {
            let mut unknown = Vec::new();
            for &id in remote_ids {
                if txn.mailbox_by_remote_id(id)?.is_none() {
                    unknown.push(id.clone());
                }
            }
            Ok(unknown)
        })?;

        let mut discovered = Vec::new();
        for id in unknown {
            match self.connector.get_mailbox(&id) {
                Ok(mailbox) => discovered.push(mailbox),
                Err(e) => warn!(
                    "{} Ignoring unknown remote mailbox {}: {}",
                    self.log_prefix, id, e
                ),
            }
        }
        Ok(discovered)
    }

    fn apply_messages_created(
        &self,
        messages: &[MessageCreated],
    ) -> Result<(), Error> {
        let remote_mailboxes = messages
            .iter()
            .flat_map(|m| m.mailbox_ids.iter())
            .collect::<HashSet<_>>();
        let discovered = self.discover_mailboxes(&remote_mailboxes)?;

        let known = self.db.read(&self.cancel, |txn| {
            let mut known = HashSet::new();
            for m in messages {
                if txn.message_by_remote_id(&m.message.id)?.is_some() {
                    known.insert(&m.message.id);
                }
            }
            Ok(known)
        })?;

        // Literals go in first so that no committed row ever lacks one
        let mut novel = Vec::new();
        for m in messages.iter().filter(|m| !known.contains(&m.message.id)) {
            let id = MessageId::generate();
            let literal = header::set_gluon_id(&m.literal, &id);
            let parsed = parse::parse_message(&literal, Some(m.message.date))?;
            self.literals.set(&id, &literal)?;
            novel.push((id, m, parsed));
        }

        let result = self.db.write(&self.cancel, |txn| {
            for mailbox in &discovered {
                if txn.mailbox_by_remote_id(&mailbox.id)?.is_none() {
                    self.create_remote_mailbox(txn, mailbox)?;
                }
            }

            let mut links = Vec::new();
            let mut raced = Vec::new();
            for &(ref id, m, ref parsed) in &novel {
                if txn.message_by_remote_id(&m.message.id)?.is_some() {
                    raced.push(id.clone());
                    continue;
                }

                let flags = m
                    .message
                    .flags
                    .clone()
                    .without(&Flag::Deleted)
                    .without(&Flag::Recent);
                let deleted = m.message.flags.contains(&Flag::Deleted);
                txn.create_message(id, &m.message.id, parsed, &flags)?;

                for remote_mailbox in m.mailbox_ids.iter().unique() {
                    let Some(mailbox) =
                        txn.mailbox_by_remote_id(remote_mailbox)?
                    else {
                        continue;
                    };
                    let uid = txn
                        .add_message_to_mailbox(&mailbox.id, id, true, deleted)?;
                    links.push((mailbox.id, (id.clone(), uid)));
                }
            }

            Ok((links, raced))
        });

        let (links, raced) = match result {
            Ok(r) => r,
            Err(e) => {
                let ids = novel.into_iter().map(|(id, _, _)| id).collect_vec();
                if let Err(e2) = self.literals.delete(&ids) {
                    warn!(
                        "{} Failed to clean up orphaned literals: {}",
                        self.log_prefix, e2
                    );
                }
                return Err(e);
            },
        };

        if !raced.is_empty() {
            debug!(
                "{} {} message(s) were created concurrently",
                self.log_prefix,
                raced.len()
            );
            self.literals.delete(&raced)?;
        }

        for (mailbox, messages) in links.into_iter().into_group_map() {
            self.publish(
                None,
                &StateUpdate::Exists { mailbox, messages },
                &self.cancel,
            )?;
        }

        Ok(())
    }

    /// Handles both `MessageMailboxesUpdated` (`mailbox_ids` is `Some`) and
    /// `MessageFlagsUpdated` (`mailbox_ids` is `None`).
    fn apply_message_mailboxes_updated(
        &self,
        remote_id: &RemoteMessageId,
        mailbox_ids: Option<&[RemoteMailboxId]>,
        seen: bool,
        flagged: bool,
    ) -> Result<(), Error> {
        let mut updates = Vec::<StateUpdate>::new();

        self.db.write(&self.cancel, |txn| {
            let Some(message) = txn.message_by_remote_id(remote_id)? else {
                debug!(
                    "{} Ignoring update for unknown message {}",
                    self.log_prefix, remote_id
                );
                return Ok(());
            };

            if let Some(mailbox_ids) = mailbox_ids {
                let current = txn
                    .message_mailboxes(&message.id)?
                    .into_iter()
                    .collect::<HashSet<_>>();
                let mut wanted = HashSet::new();
                for remote in mailbox_ids {
                    match txn.mailbox_by_remote_id(remote)? {
                        Some(mailbox) => {
                            wanted.insert(mailbox.id);
                        },
                        None => warn!(
                            "{} Message {} is in unknown mailbox {}",
                            self.log_prefix, remote_id, remote
                        ),
                    }
                }

                if message.deleted && !wanted.is_empty() {
                    txn.set_message_tombstone(&message.id, false)?;
                }

                for mailbox in wanted.difference(&current).sorted() {
                    let uid = txn
                        .add_message_to_mailbox(mailbox, &message.id, true, false)?;
                    updates.push(StateUpdate::Exists {
                        mailbox: mailbox.clone(),
                        messages: vec![(message.id.clone(), uid)],
                    });
                }

                for mailbox in current.difference(&wanted).sorted() {
                    txn.remove_message_from_mailbox(mailbox, &message.id)?;
                    updates.push(StateUpdate::Expunge {
                        mailbox: Some(mailbox.clone()),
                        ids: vec![message.id.clone()],
                    });
                }
            }

            let mut flags = message.flags.clone();
            flags.set(Flag::Seen, seen);
            flags.set(Flag::Flagged, flagged);
            if flags != message.flags {
                txn.set_message_flags(&message.id, &flags)?;
                updates.push(StateUpdate::Flags {
                    mailbox: None,
                    changes: vec![(message.id.clone(), flags)],
                    op: FlagOp::Set,
                    is_uid: false,
                    is_silent: false,
                });
            }

            Ok(())
        })?;

        for update in &updates {
            self.publish(None, update, &self.cancel)?;
        }
        Ok(())
    }

    fn apply_message_id_changed(
        &self,
        old: &RemoteMessageId,
        new: &RemoteMessageId,
    ) -> Result<(), Error> {
        let id = self.db.write(&self.cancel, |txn| {
            let Some(message) = txn.message_by_remote_id(old)? else {
                return Ok(None);
            };
            txn.set_message_remote_id(&message.id, new)?;
            Ok(Some(message.id))
        })?;

        match id {
            Some(id) => self.publish(
                None,
                &StateUpdate::MessageRemoteIdChanged(id, new.clone()),
                &self.cancel,
            ),
            None => {
                debug!(
                    "{} Ignoring id change of unknown message {}",
                    self.log_prefix, old
                );
                Ok(())
            },
        }
    }

    fn apply_message_deleted(
        &self,
        remote_id: &RemoteMessageId,
    ) -> Result<(), Error> {
        let id = self.db.write(&self.cancel, |txn| {
            let Some(message) = txn.message_by_remote_id(remote_id)? else {
                return Ok(None);
            };

            txn.set_message_tombstone(&message.id, true)?;
            for mailbox in txn.message_mailboxes(&message.id)? {
                txn.remove_message_from_mailbox(&mailbox, &message.id)?;
            }
            Ok(Some(message.id))
        })?;

        if let Some(id) = id {
            self.publish(
                None,
                &StateUpdate::Expunge {
                    mailbox: None,
                    ids: vec![id],
                },
                &self.cancel,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{mailboxes_by_name, UserFixture};
    use super::*;
    use crate::account::storage::LiteralStore;
    use crate::support::system_config::EngineConfig;

    const LITERAL: &[u8] = b"From: foo@bar.com\r\nSubject: hi\r\n\r\nbody\r\n";

    #[test]
    fn mailbox_created_is_idempotent() {
        let fixture = UserFixture::new();
        let remote = fixture.connector.new_remote_mailbox(&["A", "B"]);

        fixture
            .inject(UpdateKind::MailboxCreated(remote.clone()))
            .unwrap();
        let before = mailboxes_by_name(&fixture.user, &["A/B"]);
        assert_eq!(1, before.len());
        assert_eq!(1, before["A/B"].uid_validity);

        fixture.inject(UpdateKind::MailboxCreated(remote)).unwrap();
        let after = mailboxes_by_name(&fixture.user, &["A/B"]);
        assert_eq!(before, after);
    }

    #[test]
    fn mailbox_deleted_raises_uid_validity() {
        let fixture = UserFixture::new();
        let remote = fixture.connector.new_remote_mailbox(&["A"]);
        fixture
            .inject(UpdateKind::MailboxCreated(remote.clone()))
            .unwrap();
        fixture
            .inject(UpdateKind::MailboxDeleted(remote.id.clone()))
            .unwrap();

        assert!(mailboxes_by_name(&fixture.user, &["A"]).is_empty());
        assert_eq!(Some(2), fixture.connector.uid_validity());
        // Subscribed, so a tombstone remains
        assert!(fixture
            .user
            .db
            .read(&fixture.user.cancel, |txn| txn
                .has_deleted_subscription("A"))
            .unwrap());

        // Deleting again is a no-op
        fixture
            .inject(UpdateKind::MailboxDeleted(remote.id.clone()))
            .unwrap();
    }

    #[test]
    fn mailbox_renamed_and_reidentified() {
        let fixture = UserFixture::new();
        let remote = fixture.connector.new_remote_mailbox(&["A"]);
        fixture
            .inject(UpdateKind::MailboxCreated(remote.clone()))
            .unwrap();
        fixture
            .inject(UpdateKind::MailboxUpdated {
                id: remote.id.clone(),
                name: vec!["B".to_owned()],
            })
            .unwrap();
        fixture
            .inject(UpdateKind::MailboxIdChanged {
                old: remote.id.clone(),
                new: RemoteMailboxId::from("real"),
            })
            .unwrap();

        let found = mailboxes_by_name(&fixture.user, &["A", "B"]);
        assert!(!found.contains_key("A"));
        assert_eq!(RemoteMailboxId::from("real"), found["B"].remote_id);

        assert!(fixture
            .inject(UpdateKind::MailboxUpdated {
                id: remote.id,
                name: vec!["C".to_owned()],
            })
            .is_err());
    }

    #[test]
    fn messages_created_lifecycle() {
        let fixture = UserFixture::with_config(EngineConfig {
            messages_created_chunk_size: 1,
            ..EngineConfig::default()
        });
        let a = fixture.connector.new_remote_mailbox(&["A"]);
        // B is never announced; the engine asks the connector about it
        let b = fixture.connector.new_remote_mailbox(&["B"]);
        fixture.inject(UpdateKind::MailboxCreated(a.clone())).unwrap();

        let m1 = fixture.connector.new_remote_message(
            LITERAL,
            FlagSet::new().with(Flag::Seen),
            vec![a.id.clone(), b.id.clone()],
        );
        let m2 = fixture.connector.new_remote_message(
            LITERAL,
            FlagSet::new(),
            vec![a.id.clone()],
        );
        fixture
            .inject(UpdateKind::MessagesCreated(vec![m1.clone(), m2.clone()]))
            .unwrap();
        // Duplicates are ignored
        fixture
            .inject(UpdateKind::MessagesCreated(vec![m1.clone()]))
            .unwrap();
        assert_eq!(1, fixture.connector.call_count("get_mailbox"));

        let mailboxes = mailboxes_by_name(&fixture.user, &["A", "B"]);
        let user = &fixture.user;
        let (a_messages, b_messages, message) = user
            .db
            .read(&user.cancel, |txn| {
                Ok((
                    txn.mailbox_messages(&mailboxes["A"].id)?,
                    txn.mailbox_messages(&mailboxes["B"].id)?,
                    txn.message_by_remote_id(&m1.message.id)?.unwrap(),
                ))
            })
            .unwrap();
        assert_eq!(2, a_messages.len());
        assert_eq!(1, b_messages.len());
        assert!(a_messages.iter().all(|m| m.recent));
        assert_eq!(FlagSet::new().with(Flag::Seen), message.flags);

        let literal = fixture.literals.get(&message.id).unwrap();
        assert_eq!(Some(message.id.clone()), header::extract_gluon_id(&literal));

        fixture
            .inject(UpdateKind::MessageMailboxesUpdated {
                id: m1.message.id.clone(),
                mailbox_ids: vec![b.id.clone()],
                seen: false,
                flagged: true,
            })
            .unwrap();
        let (a_messages, message) = user
            .db
            .read(&user.cancel, |txn| {
                Ok((
                    txn.mailbox_messages(&mailboxes["A"].id)?,
                    txn.message(&message.id)?.unwrap(),
                ))
            })
            .unwrap();
        assert_eq!(1, a_messages.len());
        assert_eq!(FlagSet::new().with(Flag::Flagged), message.flags);

        fixture
            .inject(UpdateKind::MessageIdChanged {
                old: m1.message.id.clone(),
                new: RemoteMessageId::from("final"),
            })
            .unwrap();
        fixture
            .inject(UpdateKind::MessageDeleted(RemoteMessageId::from("final")))
            .unwrap();
        let message = user
            .db
            .read(&user.cancel, |txn| txn.message(&message.id))
            .unwrap()
            .unwrap();
        assert!(message.deleted);

        // Nobody has it selected, so the sweep reclaims it
        user.sweep().unwrap();
        assert!(user
            .db
            .read(&user.cancel, |txn| txn.message(&message.id))
            .unwrap()
            .is_none());
        assert_matches!(
            Err(Error::NxMessage),
            fixture.literals.get(&message.id)
        );
    }

    #[test]
    fn unknown_messages_are_ignored() {
        let fixture = UserFixture::new();
        let unknown = RemoteMessageId::from("nope");
        fixture
            .inject(UpdateKind::MessageFlagsUpdated {
                id: unknown.clone(),
                seen: true,
                flagged: true,
            })
            .unwrap();
        fixture
            .inject(UpdateKind::MessageDeleted(unknown.clone()))
            .unwrap();
        fixture
            .inject(UpdateKind::MessageIdChanged {
                old: unknown,
                new: RemoteMessageId::from("other"),
            })
            .unwrap();
    }
}
