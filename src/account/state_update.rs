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

//! Changes fanned out from whoever made them to every interested session.
//!
//! A `StateUpdate` is published only after the database transaction which
//! made the change has committed. Its `Filter` decides which sessions get a
//! copy; each recipient then turns its copy into responders on its own
//! thread, against its own snapshot.

use std::collections::VecDeque;

use super::model::*;
use super::responder::Responder;
use super::snapshot::Snapshot;

/// Which sessions a `StateUpdate` is delivered to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Every session with a selected mailbox.
    AllSelected,
    /// Sessions which have the given mailbox selected.
    Mailbox(MailboxId),
    /// Sessions whose snapshot contains the message.
    Message(MessageId),
    /// Sessions whose snapshot contains any of the messages.
    AnyMessage(Vec<MessageId>),
    /// Sessions which have the mailbox selected, for a change to one message
    /// in it.
    MessageInMailbox(MailboxId, MessageId),
}

impl Filter {
    /// Decides whether a session with the given snapshot gets the update.
    ///
    /// Sessions with nothing selected never do. A message filter does not
    /// match a session which only has the message queued for `EXISTS`; such
    /// a session reads the message's state from the database when the
    /// `EXISTS` is emitted, and that read happens after the change being
    /// published was committed.
    pub fn matches(&self, snapshot: Option<&Snapshot>) -> bool {
        let Some(snapshot) = snapshot else {
            return false;
        };

        match *self {
            Filter::AllSelected => true,
            Filter::Mailbox(ref mailbox)
            | Filter::MessageInMailbox(ref mailbox, _) => {
                snapshot.mailbox() == mailbox
            },
            Filter::Message(ref id) => snapshot.has(id),
            Filter::AnyMessage(ref ids) => ids.iter().any(|id| snapshot.has(id)),
        }
    }
}

/// A change to be seen by every session it concerns.
#[derive(Clone, Debug)]
pub enum StateUpdate {
    /// Messages were linked into `mailbox` under the given UIDs.
    Exists {
        mailbox: MailboxId,
        messages: Vec<(MessageId, Uid)>,
    },
    /// Messages were unlinked from `mailbox`, or from every mailbox if
    /// `None`.
    Expunge {
        mailbox: Option<MailboxId>,
        ids: Vec<MessageId>,
    },
    /// Flags of messages changed.
    Flags {
        /// The mailbox the change was made through, if any.
        ///
        /// Changes made through one mailbox don't touch the `\Deleted` flag
        /// of the same message as seen through another.
        mailbox: Option<MailboxId>,
        changes: Vec<(MessageId, FlagSet)>,
        op: FlagOp,
        is_uid: bool,
        is_silent: bool,
    },
    /// The mailbox no longer exists.
    MailboxDeleted(MailboxId),
    MailboxRemoteIdChanged(MailboxId, RemoteMailboxId),
    MessageRemoteIdChanged(MessageId, RemoteMessageId),
}

impl StateUpdate {
    pub fn filter(&self) -> Filter {
        match *self {
            StateUpdate::Exists {
                ref mailbox,
                ref messages,
            } => match messages[..] {
                [(ref id, _)] => {
                    Filter::MessageInMailbox(mailbox.clone(), id.clone())
                },
                _ => Filter::Mailbox(mailbox.clone()),
            },
            StateUpdate::Expunge {
                mailbox: Some(ref mailbox),
                ..
            } => Filter::Mailbox(mailbox.clone()),
            StateUpdate::Expunge {
                mailbox: None,
                ref ids,
            } => Filter::AnyMessage(ids.clone()),
            // Connector flag changes tend to be bulk, so don't bother
            // checking every snapshot for every message.
            StateUpdate::Flags { mailbox: None, .. } => Filter::AllSelected,
            StateUpdate::Flags { ref changes, .. } => Filter::AnyMessage(
                changes.iter().map(|&(ref id, _)| id.clone()).collect(),
            ),
            StateUpdate::MailboxDeleted(ref mailbox)
            | StateUpdate::MailboxRemoteIdChanged(ref mailbox, _) => {
                Filter::Mailbox(mailbox.clone())
            },
            StateUpdate::MessageRemoteIdChanged(ref id, _) => {
                Filter::Message(id.clone())
            },
        }
    }

    /// Whether this update makes the session holding `snapshot` invalid.
    pub fn invalidates(&self, snapshot: &Snapshot) -> bool {
        matches!(*self, StateUpdate::MailboxDeleted(ref mailbox)
                 if snapshot.mailbox() == mailbox)
    }

    /// Applies this update to a recipient session.
    ///
    /// Changes to remote IDs take effect on the snapshot immediately; they
    /// are not visible to the client and so need no ordering. Everything
    /// else becomes responders appended to `responders`. `is_origin` is
    /// true only for the session that made the change, which is the only
    /// one to honour `is_uid` and `is_silent`.
    pub fn apply(
        self,
        snapshot: &mut Snapshot,
        responders: &mut VecDeque<Responder>,
        is_origin: bool,
    ) {
        match self {
            StateUpdate::Exists { mailbox, messages } => {
                if *snapshot.mailbox() != mailbox {
                    return;
                }

                responders.extend(
                    messages
                        .into_iter()
                        .map(|(id, uid)| Responder::Exists { id, uid }),
                );
            },

            StateUpdate::Expunge { mailbox, ids } => {
                if mailbox.is_some_and(|m| m != *snapshot.mailbox()) {
                    return;
                }

                responders.extend(ids.into_iter().map(|id| {
                    Responder::Expunge {
                        id,
                        as_close: false,
                    }
                }));
            },

            StateUpdate::Flags {
                mailbox,
                changes,
                op,
                is_uid,
                is_silent,
            } => {
                let cross_mailbox =
                    mailbox.as_ref() != Some(snapshot.mailbox());
                responders.extend(changes.into_iter().map(|(id, flags)| {
                    Responder::Fetch {
                        id,
                        flags,
                        is_uid: is_uid && is_origin,
                        is_silent: is_silent && is_origin,
                        cross_mailbox,
                        op,
                    }
                }));
            },

            // Handled by the publisher, which marks the session invalid
            StateUpdate::MailboxDeleted(_) => (),

            StateUpdate::MailboxRemoteIdChanged(mailbox, remote_id) => {
                if *snapshot.mailbox() == mailbox {
                    snapshot.set_remote_mailbox(remote_id);
                }
            },

            StateUpdate::MessageRemoteIdChanged(id, remote_id) => {
                snapshot.set_remote_id(&id, remote_id);
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::account::snapshot::SnapshotMessage;

    fn snapshot(mailbox: &str, ids: &[&str]) -> Snapshot {
        Snapshot::new(
            MailboxId::from(mailbox),
            RemoteMailboxId::from(mailbox),
            ids.iter()
                .enumerate()
                .map(|(ix, &id)| SnapshotMessage {
                    id: MessageId::from(id),
                    remote_id: RemoteMessageId::from(id),
                    uid: Uid::u(ix as u32 + 1),
                    flags: FlagSet::new(),
                })
                .collect(),
        )
    }

    fn flags_update(mailbox: Option<&str>) -> StateUpdate {
        StateUpdate::Flags {
            mailbox: mailbox.map(MailboxId::from),
            changes: vec![(
                MessageId::from("a"),
                FlagSet::new().with(Flag::Deleted),
            )],
            op: FlagOp::Add,
            is_uid: true,
            is_silent: true,
        }
    }

    #[test]
    fn routing() {
        let a = snapshot("A", &["a", "b"]);
        let b = snapshot("B", &["a"]);

        let exists = StateUpdate::Exists {
            mailbox: MailboxId::from("A"),
            messages: vec![(MessageId::from("c"), Uid::u(3))],
        };
        assert!(exists.filter().matches(Some(&a)));
        assert!(!exists.filter().matches(Some(&b)));
        assert!(!exists.filter().matches(None));

        let flags = flags_update(Some("A"));
        assert!(flags.filter().matches(Some(&a)));
        assert!(flags.filter().matches(Some(&b)));
        assert!(!flags.filter().matches(Some(&snapshot("C", &["x"]))));
        assert_eq!(Filter::AllSelected, flags_update(None).filter());

        let expunge = StateUpdate::Expunge {
            mailbox: None,
            ids: vec![MessageId::from("b")],
        };
        assert!(expunge.filter().matches(Some(&a)));
        assert!(!expunge.filter().matches(Some(&b)));

        let deleted = StateUpdate::MailboxDeleted(MailboxId::from("B"));
        assert!(deleted.invalidates(&b));
        assert!(!deleted.invalidates(&a));
    }

    #[test]
    fn flags_are_per_recipient() {
        let mut a = snapshot("A", &["a"]);
        let mut b = snapshot("B", &["a"]);

        let mut origin = VecDeque::new();
        flags_update(Some("A")).apply(&mut a, &mut origin, true);
        assert_eq!(
            vec![Responder::Fetch {
                id: MessageId::from("a"),
                flags: FlagSet::new().with(Flag::Deleted),
                is_uid: true,
                is_silent: true,
                cross_mailbox: false,
                op: FlagOp::Add,
            }],
            origin.into_iter().collect::<Vec<_>>()
        );

        let mut other = VecDeque::new();
        flags_update(Some("A")).apply(&mut b, &mut other, false);
        assert_eq!(
            vec![Responder::Fetch {
                id: MessageId::from("a"),
                flags: FlagSet::new().with(Flag::Deleted),
                is_uid: false,
                is_silent: false,
                cross_mailbox: true,
                op: FlagOp::Add,
            }],
            other.into_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn mailbox_scoped_updates_ignore_other_mailboxes() {
        let mut b = snapshot("B", &["a"]);
        let mut responders = VecDeque::new();

        StateUpdate::Exists {
            mailbox: MailboxId::from("A"),
            messages: vec![(MessageId::from("c"), Uid::u(3))],
        }
        .apply(&mut b, &mut responders, false);
        StateUpdate::Expunge {
            mailbox: Some(MailboxId::from("A")),
            ids: vec![MessageId::from("a")],
        }
        .apply(&mut b, &mut responders, false);
        assert!(responders.is_empty());

        StateUpdate::MessageRemoteIdChanged(
            MessageId::from("a"),
            RemoteMessageId::from("new"),
        )
        .apply(&mut b, &mut responders, false);
        assert!(responders.is_empty());
        assert_eq!(
            RemoteMessageId::from("new"),
            b.get_by_id(&MessageId::from("a")).unwrap().1.remote_id
        );
    }
}
