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

//! Deferred untagged responses.
//!
//! A session does not learn about changes to its mailbox by looking at the
//! database; instead, every change is turned into a `Responder` on the
//! session's queue, and the session only applies the change to its snapshot
//! when the responder is flushed. This is what lets a session keep showing
//! the client a message the client has not yet been told is expunged.

use std::collections::{HashSet, VecDeque};

use crate::account::model::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Responder {
    /// The message was linked into the selected mailbox.
    Exists { id: MessageId, uid: Uid },
    /// The message was unlinked from the selected mailbox.
    ///
    /// With `as_close`, the message is dropped from the snapshot silently.
    Expunge { id: MessageId, as_close: bool },
    /// The flags of the message changed by applying `op` with `flags`.
    Fetch {
        id: MessageId,
        flags: FlagSet,
        is_uid: bool,
        is_silent: bool,
        /// The change was made through a different mailbox, so this
        /// snapshot's own `\Deleted` flag is unaffected.
        cross_mailbox: bool,
        op: FlagOp,
    },
}

impl Responder {
    pub fn id(&self) -> &MessageId {
        match *self {
            Responder::Exists { ref id, .. }
            | Responder::Expunge { ref id, .. }
            | Responder::Fetch { ref id, .. } => id,
        }
    }
}

/// Removes from `queue` the responders which may be emitted now, returning
/// them in order.
///
/// If `permit_expunge` is true, everything is emitted. Otherwise, expunges
/// stay queued, as does any later `Exists` for a message with a queued
/// expunge ahead of it, since telling the client about the new instance
/// before the old one is gone would leave two copies in its view.
pub fn drain(
    queue: &mut VecDeque<Responder>,
    permit_expunge: bool,
) -> Vec<Responder> {
    if permit_expunge {
        return queue.drain(..).collect();
    }

    let mut emit = Vec::new();
    let mut keep = VecDeque::new();
    let mut skip = HashSet::new();

    for responder in queue.drain(..) {
        match responder {
            Responder::Expunge { ref id, .. } => {
                skip.insert(id.clone());
                keep.push_back(responder);
            },
            Responder::Exists { ref id, .. } if skip.remove(id) => {
                keep.push_back(responder);
            },
            responder => emit.push(responder),
        }
    }

    *queue = keep;
    emit
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn exists(id: &str, uid: u32) -> Responder {
        Responder::Exists {
            id: MessageId::from(id),
            uid: Uid::u(uid),
        }
    }

    fn expunge(id: &str) -> Responder {
        Responder::Expunge {
            id: MessageId::from(id),
            as_close: false,
        }
    }

    fn fetch(id: &str) -> Responder {
        Responder::Fetch {
            id: MessageId::from(id),
            flags: FlagSet::new().with(Flag::Seen),
            is_uid: false,
            is_silent: false,
            cross_mailbox: false,
            op: FlagOp::Add,
        }
    }

    #[test]
    fn permit_expunge_emits_everything() {
        let mut queue: VecDeque<_> =
            vec![expunge("a"), exists("a", 4), fetch("b")].into();
        assert_eq!(
            vec![expunge("a"), exists("a", 4), fetch("b")],
            drain(&mut queue, true)
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn readd_between_flushes_is_deferred() {
        let mut queue: VecDeque<_> = vec![
            exists("x", 3),
            expunge("a"),
            fetch("b"),
            exists("a", 4),
            exists("c", 5),
        ]
        .into();

        assert_eq!(
            vec![exists("x", 3), fetch("b"), exists("c", 5)],
            drain(&mut queue, false)
        );
        assert_eq!(
            vec![expunge("a"), exists("a", 4)],
            queue.iter().cloned().collect::<Vec<_>>()
        );

        // Nothing changes until expunges are permitted
        assert!(drain(&mut queue, false).is_empty());
        assert_eq!(2, queue.len());
        assert_eq!(vec![expunge("a"), exists("a", 4)], drain(&mut queue, true));
    }

    #[test]
    fn exists_before_expunge_is_not_deferred() {
        let mut queue: VecDeque<_> = vec![exists("a", 4), expunge("a")].into();
        assert_eq!(vec![exists("a", 4)], drain(&mut queue, false));
        assert_eq!(vec![expunge("a")], drain(&mut queue, true));
    }

    /// Builds a queue where every responder is distinct, so that positions
    /// can be recovered from values.
    fn build(kinds: &[(u8, u8)]) -> Vec<Responder> {
        kinds
            .iter()
            .enumerate()
            .map(|(ix, &(kind, id))| {
                let id = id.to_string();
                match kind {
                    0 => exists(&id, ix as u32 + 1),
                    1 => expunge(&id),
                    _ => Responder::Fetch {
                        id: MessageId::from(id.as_str()),
                        flags: FlagSet::new()
                            .with(Flag::Keyword(format!("k{}", ix))),
                        is_uid: false,
                        is_silent: false,
                        cross_mailbox: false,
                        op: FlagOp::Add,
                    },
                }
            })
            .collect()
    }

    proptest! {
        #[test]
        fn drain_without_expunge_properties(
            kinds in prop::collection::vec((0u8..3, 0u8..4), 0..32)
        ) {
            let responders = build(&kinds);
            let mut queue: VecDeque<_> = responders.clone().into();
            let emitted = drain(&mut queue, false);

            // Nothing is lost or duplicated, and relative order is kept
            prop_assert_eq!(responders.len(), emitted.len() + queue.len());
            let mut emitted_it = emitted.iter().peekable();
            let mut kept_it = queue.iter();
            for r in &responders {
                if emitted_it.peek() == Some(&r) {
                    emitted_it.next();
                } else {
                    prop_assert_eq!(Some(r), kept_it.next());
                }
            }

            let no_expunges = emitted
                .iter()
                .all(|r| !matches!(*r, Responder::Expunge { .. }));
            prop_assert!(no_expunges);

            // The first exists of a message after its expunge is held back
            for (ix, r) in responders.iter().enumerate() {
                if let Responder::Exists { ref id, .. } = *r {
                    let before = &responders[..ix];
                    let expunged = before.iter().any(|p| {
                        matches!(*p, Responder::Expunge { .. }) && p.id() == id
                    });
                    let seen_exists = before.iter().any(|p| {
                        matches!(*p, Responder::Exists { .. }) && p.id() == id
                    });
                    if expunged && !seen_exists {
                        prop_assert!(!emitted.contains(r));
                    }
                }
            }

            // Whatever was kept comes out once expunges are allowed
            let kept: Vec<_> = queue.iter().cloned().collect();
            prop_assert_eq!(kept, drain(&mut queue, true));
            prop_assert!(queue.is_empty());
        }
    }
}
