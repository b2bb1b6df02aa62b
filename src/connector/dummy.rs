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

//! An in-memory connector.
//!
//! The dummy connector keeps its "remote" mailboxes and messages in memory,
//! records every call made to it, and can be told to fail the next call. It
//! is what the engine's own tests run against, and doubles as a reference for
//! embedders writing a real connector.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::prelude::*;
use crossbeam::channel::{self, Receiver, Sender};
use log::debug;

use super::*;

/// One call made to the connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub name: &'static str,
    pub detail: String,
}

pub struct DummyConnector {
    credentials: HashMap<String, Vec<u8>>,
    inner: Mutex<Inner>,
    fail_next: AtomicBool,
    mailbox_flags: Mutex<MailboxFlags>,
    update_tx: Sender<Update>,
    update_rx: Receiver<Update>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    mailboxes: BTreeMap<RemoteMailboxId, RemoteMailbox>,
    messages: BTreeMap<RemoteMessageId, (RemoteMessage, Vec<u8>)>,
    calls: Vec<Call>,
    uid_validity: Option<u32>,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

impl Default for DummyConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyConnector {
    pub fn new() -> Self {
        let (update_tx, update_rx) = channel::unbounded();
        DummyConnector {
            credentials: HashMap::new(),
            inner: Mutex::new(Inner::default()),
            fail_next: AtomicBool::new(false),
            mailbox_flags: Mutex::new(MailboxFlags::standard()),
            update_tx,
            update_rx,
        }
    }

    /// Adds a user which `authorize` accepts.
    pub fn with_user(mut self, user: &str, password: &[u8]) -> Self {
        self.credentials.insert(user.to_owned(), password.to_vec());
        self
    }

    /// Makes the next call (other than `authorize` and `updates`) fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Sets what `validate_create` reports for new mailboxes.
    pub fn set_mailbox_flags(&self, flags: MailboxFlags) {
        *self.mailbox_flags.lock().unwrap() = flags;
    }

    /// Returns every call made so far, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Counts the calls made to the named method.
    pub fn call_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.name == name)
            .count()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    /// The last UIDVALIDITY the engine reported.
    pub fn uid_validity(&self) -> Option<u32> {
        self.inner.lock().unwrap().uid_validity
    }

    /// Creates a mailbox on the "remote" side without telling the engine.
    ///
    /// The result is typically sent along in a `MailboxCreated` update.
    pub fn new_remote_mailbox(&self, name: &[&str]) -> RemoteMailbox {
        let mut inner = self.inner.lock().unwrap();
        let flags = MailboxFlags::standard();
        let mailbox = RemoteMailbox {
            id: RemoteMailboxId(inner.next_id("mb")),
            name: name.iter().map(|&s| s.to_owned()).collect(),
            flags: flags.flags,
            permanent_flags: flags.permanent_flags,
            attributes: flags.attributes,
        };
        inner
            .mailboxes
            .insert(mailbox.id.clone(), mailbox.clone());
        mailbox
    }

    /// Creates a message on the "remote" side without telling the engine.
    pub fn new_remote_message(
        &self,
        literal: &[u8],
        flags: FlagSet,
        mailbox_ids: Vec<RemoteMailboxId>,
    ) -> MessageCreated {
        let mut inner = self.inner.lock().unwrap();
        let message = RemoteMessage {
            id: RemoteMessageId(inner.next_id("msg")),
            flags,
            date: Utc::now().fixed_offset(),
            mailbox_ids: mailbox_ids.clone(),
        };
        inner
            .messages
            .insert(message.id.clone(), (message.clone(), literal.to_vec()));
        MessageCreated {
            message,
            literal: literal.to_vec(),
            mailbox_ids,
        }
    }

    /// Sends an update to the engine, returning the receiver of its
    /// completion signal.
    pub fn push_update(
        &self,
        kind: UpdateKind,
    ) -> Receiver<Result<(), String>> {
        let (update, done) = Update::with_done(kind);
        // The receiver half lives in `self`, so this cannot fail
        let _ = self.update_tx.send(update);
        done
    }

    fn record(
        &self,
        name: &'static str,
        detail: String,
    ) -> Result<std::sync::MutexGuard<'_, Inner>, ConnectorError> {
        debug!("dummy connector: {} {}", name, detail);
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call { name, detail });
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(format!("injected failure in {}", name).into());
        }
        Ok(inner)
    }

    fn require_mailbox<'a>(
        inner: &'a mut Inner,
        id: &RemoteMailboxId,
    ) -> Result<&'a mut RemoteMailbox, ConnectorError> {
        inner
            .mailboxes
            .get_mut(id)
            .ok_or_else(|| format!("no such remote mailbox: {}", id).into())
    }

    fn set_membership(
        inner: &mut Inner,
        ids: &[RemoteMessageId],
        mailbox: &RemoteMailboxId,
        member: bool,
    ) {
        for id in ids {
            if let Some(&mut (ref mut message, _)) = inner.messages.get_mut(id)
            {
                message.mailbox_ids.retain(|m| m != mailbox);
                if member {
                    message.mailbox_ids.push(mailbox.clone());
                }
            }
        }
    }

    fn set_flag(inner: &mut Inner, ids: &[RemoteMessageId], flag: Flag, on: bool) {
        for id in ids {
            if let Some(&mut (ref mut message, _)) = inner.messages.get_mut(id)
            {
                message.flags.set(flag.clone(), on);
            }
        }
    }
}

impl Connector for DummyConnector {
    fn authorize(&self, user: &str, password: &[u8]) -> bool {
        self.credentials
            .get(user)
            .is_some_and(|expected| expected[..] == *password)
    }

    fn validate_create(
        &self,
        name: &[String],
    ) -> Result<MailboxFlags, ConnectorError> {
        self.record("validate_create", format!("{:?}", name))?;
        Ok(self.mailbox_flags.lock().unwrap().clone())
    }

    fn validate_update(
        &self,
        old_name: &[String],
        new_name: &[String],
    ) -> Result<(), ConnectorError> {
        self.record(
            "validate_update",
            format!("{:?} -> {:?}", old_name, new_name),
        )?;
        Ok(())
    }

    fn validate_delete(&self, name: &[String]) -> Result<(), ConnectorError> {
        self.record("validate_delete", format!("{:?}", name))?;
        Ok(())
    }

    fn create_mailbox(
        &self,
        name: &[String],
    ) -> Result<RemoteMailbox, ConnectorError> {
        let mut inner = self.record("create_mailbox", format!("{:?}", name))?;
        let flags = MailboxFlags::standard();
        let mailbox = RemoteMailbox {
            id: RemoteMailboxId(inner.next_id("mb")),
            name: name.to_vec(),
            flags: flags.flags,
            permanent_flags: flags.permanent_flags,
            attributes: flags.attributes,
        };
        inner
            .mailboxes
            .insert(mailbox.id.clone(), mailbox.clone());
        Ok(mailbox)
    }

    fn get_mailbox(
        &self,
        id: &RemoteMailboxId,
    ) -> Result<RemoteMailbox, ConnectorError> {
        let mut inner = self.record("get_mailbox", id.to_string())?;
        Ok(Self::require_mailbox(&mut inner, id)?.clone())
    }

    fn update_mailbox_name(
        &self,
        id: &RemoteMailboxId,
        name: &[String],
    ) -> Result<(), ConnectorError> {
        let mut inner = self
            .record("update_mailbox_name", format!("{} {:?}", id, name))?;
        Self::require_mailbox(&mut inner, id)?.name = name.to_vec();
        Ok(())
    }

    fn delete_mailbox(
        &self,
        id: &RemoteMailboxId,
    ) -> Result<(), ConnectorError> {
        let mut inner = self.record("delete_mailbox", id.to_string())?;
        Self::require_mailbox(&mut inner, id)?;
        inner.mailboxes.remove(id);
        Ok(())
    }

    fn create_message(
        &self,
        mailbox: &RemoteMailboxId,
        literal: &[u8],
        flags: &FlagSet,
        date: DateTime<FixedOffset>,
    ) -> Result<(RemoteMessage, Vec<u8>), ConnectorError> {
        let mut inner = self.record(
            "create_message",
            format!("{} {} {} bytes", mailbox, flags, literal.len()),
        )?;
        Self::require_mailbox(&mut inner, mailbox)?;
        let message = RemoteMessage {
            id: RemoteMessageId(inner.next_id("msg")),
            flags: flags.clone(),
            date,
            mailbox_ids: vec![mailbox.clone()],
        };
        inner
            .messages
            .insert(message.id.clone(), (message.clone(), literal.to_vec()));
        Ok((message, literal.to_vec()))
    }

    fn get_message(
        &self,
        id: &RemoteMessageId,
    ) -> Result<RemoteMessage, ConnectorError> {
        let inner = self.record("get_message", id.to_string())?;
        inner
            .messages
            .get(id)
            .map(|(message, _)| message.clone())
            .ok_or_else(|| format!("no such remote message: {}", id).into())
    }

    fn add_messages_to_mailbox(
        &self,
        ids: &[RemoteMessageId],
        mailbox: &RemoteMailboxId,
    ) -> Result<(), ConnectorError> {
        let mut inner = self.record(
            "add_messages_to_mailbox",
            format!("{:?} {}", ids, mailbox),
        )?;
        Self::require_mailbox(&mut inner, mailbox)?;
        Self::set_membership(&mut inner, ids, mailbox, true);
        Ok(())
    }

    fn remove_messages_from_mailbox(
        &self,
        ids: &[RemoteMessageId],
        mailbox: &RemoteMailboxId,
    ) -> Result<(), ConnectorError> {
        let mut inner = self.record(
            "remove_messages_from_mailbox",
            format!("{:?} {}", ids, mailbox),
        )?;
        Self::require_mailbox(&mut inner, mailbox)?;
        Self::set_membership(&mut inner, ids, mailbox, false);
        Ok(())
    }

    fn move_messages(
        &self,
        ids: &[RemoteMessageId],
        from: &RemoteMailboxId,
        to: &RemoteMailboxId,
    ) -> Result<(), ConnectorError> {
        let mut inner = self.record(
            "move_messages",
            format!("{:?} {} -> {}", ids, from, to),
        )?;
        Self::require_mailbox(&mut inner, from)?;
        Self::require_mailbox(&mut inner, to)?;
        Self::set_membership(&mut inner, ids, from, false);
        Self::set_membership(&mut inner, ids, to, true);
        Ok(())
    }

    fn mark_messages_seen(
        &self,
        ids: &[RemoteMessageId],
        seen: bool,
    ) -> Result<(), ConnectorError> {
        let mut inner =
            self.record("mark_messages_seen", format!("{:?} {}", ids, seen))?;
        Self::set_flag(&mut inner, ids, Flag::Seen, seen);
        Ok(())
    }

    fn mark_messages_flagged(
        &self,
        ids: &[RemoteMessageId],
        flagged: bool,
    ) -> Result<(), ConnectorError> {
        let mut inner = self.record(
            "mark_messages_flagged",
            format!("{:?} {}", ids, flagged),
        )?;
        Self::set_flag(&mut inner, ids, Flag::Flagged, flagged);
        Ok(())
    }

    fn set_uid_validity(
        &self,
        uid_validity: u32,
    ) -> Result<(), ConnectorError> {
        let mut inner =
            self.record("set_uid_validity", uid_validity.to_string())?;
        inner.uid_validity = Some(uid_validity);
        Ok(())
    }

    fn updates(&self) -> Receiver<Update> {
        self.update_rx.clone()
    }

    fn close(&self) -> Result<(), ConnectorError> {
        self.record("close", String::new())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_calls_and_injects_failures() {
        let connector = DummyConnector::new().with_user("alice", b"hunter2");
        assert!(connector.authorize("alice", b"hunter2"));
        assert!(!connector.authorize("alice", b"hunter3"));
        assert!(!connector.authorize("bob", b"hunter2"));

        let mailbox = connector.create_mailbox(&["A".to_owned()]).unwrap();
        assert_eq!(vec!["A".to_owned()], mailbox.name);
        assert_eq!(mailbox, connector.get_mailbox(&mailbox.id).unwrap());

        connector.fail_next();
        assert!(connector.create_mailbox(&["B".to_owned()]).is_err());
        // Only the one call fails
        connector.create_mailbox(&["B".to_owned()]).unwrap();

        assert_eq!(3, connector.call_count("create_mailbox"));
        assert_eq!(1, connector.call_count("get_mailbox"));
        connector.clear_calls();
        assert!(connector.calls().is_empty());
    }

    #[test]
    fn message_membership_and_flags() {
        let connector = DummyConnector::new();
        let a = connector.new_remote_mailbox(&["A"]);
        let b = connector.new_remote_mailbox(&["B"]);

        let (message, literal) = connector
            .create_message(
                &a.id,
                b"Subject: x\r\n\r\nbody",
                &FlagSet::new(),
                Utc::now().fixed_offset(),
            )
            .unwrap();
        assert_eq!(b"Subject: x\r\n\r\nbody", &literal[..]);

        connector
            .move_messages(&[message.id.clone()], &a.id, &b.id)
            .unwrap();
        connector
            .mark_messages_seen(&[message.id.clone()], true)
            .unwrap();

        let fetched = connector.get_message(&message.id).unwrap();
        assert_eq!(vec![b.id.clone()], fetched.mailbox_ids);
        assert!(fetched.flags.contains(&Flag::Seen));

        assert!(connector
            .delete_mailbox(&RemoteMailboxId::from("nx"))
            .is_err());
    }

    #[test]
    fn pushed_updates_are_delivered() {
        let connector = DummyConnector::new();
        let updates = connector.updates();
        let done = connector.push_update(UpdateKind::Noop);

        let update = updates.try_recv().unwrap();
        assert_matches!(UpdateKind::Noop, update.kind);
        update.done(Ok(()));
        assert_eq!(Ok(()), done.try_recv().unwrap());
    }
}
