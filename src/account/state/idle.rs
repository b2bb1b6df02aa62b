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

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use log::{debug, info};

use super::defs::*;
use crate::account::{
    model::*,
    responder::{self, Responder},
    snapshot::{Snapshot, SnapshotMessage},
    storage::Txn,
};
use crate::support::error::Error;

/// How often an idling session checks whether it has been cancelled.
const IDLE_POLL: Duration = Duration::from_millis(100);

impl State {
    /// Applies pending changes to the snapshot, returning the untagged
    /// responses the client must be sent.
    ///
    /// With `permit_expunge` false (i.e., inside a command which is not
    /// allowed to send `EXPUNGE`), expunges stay queued along with anything
    /// that must not be reported before them.
    pub fn flush(
        &mut self,
        permit_expunge: bool,
    ) -> Result<Vec<UntaggedResponse>, Error> {
        self.absorb_updates();
        let ready = responder::drain(&mut self.responders, permit_expunge);
        if ready.is_empty() {
            return Ok(Vec::new());
        }

        let needs_db = ready
            .iter()
            .any(|r| matches!(*r, Responder::Exists { .. }));
        let read_only = self.read_only;
        let user = Arc::clone(&self.user);
        let shared = Arc::clone(&self.shared);

        let (output, deferred) = if needs_db {
            let apply = |txn: &Txn<'_>| {
                let mut snapshot = shared.snapshot.lock().unwrap();
                emit(Some(txn), snapshot.as_mut(), ready, read_only)
            };
            if read_only {
                user.db.read(&self.cancel, apply)?
            } else {
                user.db.write(&self.cancel, apply)?
            }
        } else {
            let mut snapshot = shared.snapshot.lock().unwrap();
            emit(None, snapshot.as_mut(), ready, read_only)?
        };

        for responder in deferred.into_iter().rev() {
            self.responders.push_front(responder);
        }
        Ok(output)
    }

    /// The `NOOP` command.
    pub fn noop(&mut self) -> Result<Vec<UntaggedResponse>, Error> {
        self.flush(true)
    }

    /// The `CHECK` command.
    ///
    /// Everything is durable as soon as it is done, so this is the same as
    /// `NOOP`.
    pub fn check(&mut self) -> Result<Vec<UntaggedResponse>, Error> {
        self.flush(true)
    }

    /// The `IDLE` command.
    ///
    /// Sends everything pending to `output` right away, then every batch of
    /// responses as changes arrive, until `done` receives a value or is
    /// disconnected (the client said `DONE`). Returns `NxSnapshot` if the
    /// selected mailbox is deleted in the meantime.
    pub fn idle(
        &mut self,
        done: &Receiver<()>,
        output: &Sender<Vec<UntaggedResponse>>,
    ) -> Result<(), Error> {
        info!("{} Start IDLE", self.log_prefix);
        let inbox = self.inbox.clone();

        loop {
            let responses = self.flush(true)?;
            if !responses.is_empty() && output.send(responses).is_err() {
                debug!("{} IDLE output closed", self.log_prefix);
                break;
            }

            if self.is_invalid() {
                return Err(Error::NxSnapshot);
            }

            crossbeam::select! {
                recv(done) -> _ => break,
                recv(inbox) -> update => {
                    let Ok(update) = update else {
                        break;
                    };
                    self.backlog.push_back(update);
                },
                default(IDLE_POLL) => self.cancel.check()?,
            }
        }

        info!("{} Stop IDLE", self.log_prefix);
        Ok(())
    }
}

/// Emits `ready` against `snapshot`, returning the untagged responses and
/// any `Exists` responders which have to wait for a later flush.
///
/// `txn` must be given if `ready` contains any `Exists`.
fn emit(
    txn: Option<&Txn<'_>>,
    snapshot: Option<&mut Snapshot>,
    ready: Vec<Responder>,
    read_only: bool,
) -> Result<(Vec<UntaggedResponse>, Vec<Responder>), Error> {
    // Nothing selected; everything that was queued is moot
    let Some(snapshot) = snapshot else {
        return Ok((Vec::new(), Vec::new()));
    };

    let mut emitter = Emitter {
        txn,
        snapshot,
        read_only,
        output: Vec::new(),
        exists_dirty: false,
    };

    let mut deferred = Vec::new();
    for responder in ready {
        deferred.extend(emitter.emit(responder)?);
    }

    // A re-linked message's EXISTS may have come before the EXPUNGE of its
    // old instance
    let mut still_deferred = Vec::new();
    for responder in deferred {
        still_deferred.extend(emitter.emit(responder)?);
    }

    emitter.report_exists();
    Ok((emitter.output, still_deferred))
}

struct Emitter<'a, 'b> {
    txn: Option<&'a Txn<'b>>,
    snapshot: &'a mut Snapshot,
    read_only: bool,
    output: Vec<UntaggedResponse>,
    /// Whether messages were added since the last `EXISTS`.
    exists_dirty: bool,
}

impl Emitter<'_, '_> {
    /// Emits one responder, returning it back if it must be deferred.
    fn emit(&mut self, responder: Responder) -> Result<Option<Responder>, Error> {
        match responder {
            Responder::Exists { id, uid } => self.exists(id, uid),

            Responder::Expunge { id, as_close } => {
                if !self.snapshot.has(&id) {
                    return Ok(None);
                }

                self.report_exists();
                if let Some(seqnum) = self.snapshot.expunge(&id) {
                    if !as_close {
                        self.output.push(UntaggedResponse::Expunge(seqnum));
                    }
                }
                Ok(None)
            },

            Responder::Fetch {
                id,
                flags,
                is_uid,
                is_silent,
                cross_mailbox,
                op,
            } => {
                let Some((_, current)) = self.snapshot.get_by_id(&id) else {
                    return Ok(None);
                };
                let current = current.flags.clone();
                let mut new = current.apply(op, &flags);
                new.set(Flag::Recent, current.contains(&Flag::Recent));
                if cross_mailbox {
                    new.set(Flag::Deleted, current.contains(&Flag::Deleted));
                }

                let Some((seqnum, uid, new)) = self.snapshot.set_flags(&id, new)
                else {
                    return Ok(None);
                };
                if *new == current || is_silent {
                    return Ok(None);
                }

                let flags = new.clone();
                self.report_exists();
                self.output.push(UntaggedResponse::Fetch {
                    seqnum,
                    flags,
                    uid: is_uid.then_some(uid),
                });
                Ok(None)
            },
        }
    }

    fn exists(
        &mut self,
        id: MessageId,
        uid: Uid,
    ) -> Result<Option<Responder>, Error> {
        let Some(txn) = self.txn else {
            return Ok(Some(Responder::Exists { id, uid }));
        };

        // If the link is gone or was replaced, a later responder accounts
        // for it
        let Some(row) = txn
            .uid_row(self.snapshot.mailbox(), &id)?
            .filter(|row| row.uid == uid)
        else {
            return Ok(None);
        };

        if let Some((_, existing)) = self.snapshot.get_by_id(&id) {
            if existing.uid == uid {
                return Ok(None);
            }
            // The old instance hasn't been expunged yet
            return Ok(Some(Responder::Exists { id, uid }));
        }

        let message = txn.message(&id)?.ok_or(Error::NxMessage)?;
        let mut flags = message.flags;
        if row.deleted {
            flags.insert(Flag::Deleted);
        }
        if row.recent {
            flags.insert(Flag::Recent);
            if !self.read_only {
                txn.clear_recent(self.snapshot.mailbox(), &id)?;
            }
        }

        self.snapshot.append(SnapshotMessage {
            id,
            remote_id: message.remote_id,
            uid,
            flags,
        });
        self.exists_dirty = true;
        Ok(None)
    }

    /// Reports the current `EXISTS` and `RECENT` counts if messages were
    /// added since they were last reported.
    fn report_exists(&mut self) {
        if !std::mem::take(&mut self.exists_dirty) {
            return;
        }

        self.output
            .push(UntaggedResponse::Exists(self.snapshot.len()));
        let recent = self.snapshot.messages_with(&Flag::Recent).count();
        if recent > 0 {
            self.output.push(UntaggedResponse::Recent(recent));
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use crossbeam::channel;

    use super::*;

    #[test]
    fn noop_reports_new_messages() {
        let fixture = TestFixture::new();
        fixture.create(&["A"]);
        fixture.append("A", "one");

        let mut state = fixture.state();
        let selected = state.select("A").unwrap();
        assert_eq!(1, selected.exists);
        assert!(state.noop().unwrap().is_empty());

        fixture.append("A", "two");
        fixture.append("A", "three");
        assert_eq!(
            vec![UntaggedResponse::Exists(3), UntaggedResponse::Recent(3)],
            state.noop().unwrap()
        );
        assert!(state.check().unwrap().is_empty());

        // Another session selecting now sees nothing recent
        let mut other = fixture.state();
        assert_eq!(0, other.select("A").unwrap().recent);
    }

    #[test]
    fn examine_does_not_consume_recent() {
        let fixture = TestFixture::new();
        fixture.create(&["A"]);

        let mut examiner = fixture.state();
        examiner.examine("A").unwrap();
        fixture.append("A", "one");
        assert_eq!(
            vec![UntaggedResponse::Exists(1), UntaggedResponse::Recent(1)],
            examiner.noop().unwrap()
        );

        let mut selector = fixture.state();
        assert_eq!(1, selector.select("A").unwrap().recent);
    }

    #[test]
    fn idle_delivers_changes_until_done() {
        let fixture = TestFixture::new();
        fixture.create(&["A"]);
        let mut state = fixture.state();
        state.select("A").unwrap();
        fixture.append("A", "before");

        let (done_tx, done_rx) = channel::bounded(1);
        let (out_tx, out_rx) = channel::unbounded();
        let user = Arc::clone(fixture.user());

        let idler = thread::spawn(move || {
            let result = state.idle(&done_rx, &out_tx);
            (state, result)
        });

        // Pending changes go out first
        assert_eq!(
            vec![UntaggedResponse::Exists(1), UntaggedResponse::Recent(1)],
            out_rx.recv_timeout(Duration::from_secs(10)).unwrap()
        );

        let mut other = user.new_state();
        other
            .append(AppendRequest {
                mailbox: "A".to_owned(),
                literal: literal("during"),
                flags: vec![],
                date: None,
            })
            .unwrap();
        assert_eq!(
            vec![UntaggedResponse::Exists(2), UntaggedResponse::Recent(2)],
            out_rx.recv_timeout(Duration::from_secs(10)).unwrap()
        );

        done_tx.send(()).unwrap();
        let (_state, result) = idler.join().unwrap();
        result.unwrap();
    }

    #[test]
    fn idle_honours_cancellation() {
        let fixture = TestFixture::new();
        let mut state = fixture.state();
        let (_done_tx, done_rx) = channel::bounded::<()>(1);
        let (out_tx, _out_rx) = channel::unbounded();

        state.cancel_token().cancel();
        assert_matches!(Err(Error::Cancelled), state.idle(&done_rx, &out_tx));
    }

    #[test]
    fn idle_ends_when_mailbox_deleted() {
        let fixture = TestFixture::new();
        fixture.create(&["A"]);
        let mut state = fixture.state();
        state.select("A").unwrap();

        let (_done_tx, done_rx) = channel::bounded::<()>(1);
        let (out_tx, _out_rx) = channel::unbounded();
        let user = Arc::clone(fixture.user());
        let idler = thread::spawn(move || {
            let result = state.idle(&done_rx, &out_tx);
            (state, result)
        });

        thread::sleep(Duration::from_millis(200));
        let mut other = user.new_state();
        assert!(!other.delete("A").unwrap());

        let (state, result) = idler.join().unwrap();
        assert_matches!(Err(Error::NxSnapshot), result);
        assert!(state.is_invalid());
    }
}
