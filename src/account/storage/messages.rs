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

use rusqlite::OptionalExtension as _;

use super::{metadb::Txn, types::*};
use crate::account::model::*;
use crate::mime::parse::ParsedMessage;
use crate::support::error::Error;

/// The per-link state of a message in one mailbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UidRow {
    pub uid: Uid,
    pub recent: bool,
    pub deleted: bool,
}

impl FromRow for UidRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uid: row.get("uid")?,
            recent: row.get("recent")?,
            deleted: row.get("deleted")?,
        })
    }
}

impl Txn<'_> {
    /// Inserts a new message row.
    ///
    /// `flags` must already exclude `\Deleted` and `\Recent`.
    pub fn create_message(
        &self,
        id: &MessageId,
        remote_id: &RemoteMessageId,
        parsed: &ParsedMessage,
        flags: &FlagSet,
    ) -> Result<(), Error> {
        self.execute(
            "INSERT INTO `message` (\
               `id`, `remote_id`, `date`, `size`, `body`, `body_structure`, \
               `envelope`, `flags`, `deleted`\
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
            (
                id,
                remote_id,
                Rfc3339(parsed.internal_date),
                parsed.size,
                &parsed.body,
                &parsed.body_structure,
                Cbor(&parsed.envelope),
                flags,
            ),
        )?;
        Ok(())
    }

    /// Fetches a message, tombstoned or not.
    pub fn message(&self, id: &MessageId) -> Result<Option<Message>, Error> {
        Ok(self
            .query_row("SELECT * FROM `message` WHERE `id` = ?", (id,), from_row)
            .optional()?)
    }

    pub fn message_by_remote_id(
        &self,
        remote_id: &RemoteMessageId,
    ) -> Result<Option<Message>, Error> {
        Ok(self
            .query_row(
                "SELECT * FROM `message` WHERE `remote_id` = ?",
                (remote_id,),
                from_row,
            )
            .optional()?)
    }

    pub fn set_message_flags(
        &self,
        id: &MessageId,
        flags: &FlagSet,
    ) -> Result<(), Error> {
        self.execute(
            "UPDATE `message` SET `flags` = ? WHERE `id` = ?",
            (flags, id),
        )?;
        Ok(())
    }

    pub fn set_message_remote_id(
        &self,
        id: &MessageId,
        remote_id: &RemoteMessageId,
    ) -> Result<(), Error> {
        let updated = self.execute(
            "UPDATE `message` SET `remote_id` = ? WHERE `id` = ?",
            (remote_id, id),
        )?;
        if 0 == updated {
            return Err(Error::NxMessage);
        }
        Ok(())
    }

    pub fn set_message_tombstone(
        &self,
        id: &MessageId,
        deleted: bool,
    ) -> Result<(), Error> {
        self.execute(
            "UPDATE `message` SET `deleted` = ? WHERE `id` = ?",
            (deleted, id),
        )?;
        Ok(())
    }

    /// Returns the IDs of all tombstoned messages.
    pub fn tombstoned_messages(&self) -> Result<Vec<MessageId>, Error> {
        let mut stmt =
            self.prepare_cached("SELECT `id` FROM `message` WHERE `deleted`")?;
        let it = stmt.query_map((), from_single)?;
        Ok(it.collect::<Result<Vec<_>, _>>()?)
    }

    /// Physically deletes a message row and any links to it.
    pub fn delete_message(&self, id: &MessageId) -> Result<(), Error> {
        self.execute("DELETE FROM `message` WHERE `id` = ?", (id,))?;
        Ok(())
    }

    /// Links `message` into `mailbox` under a newly assigned UID, returning
    /// that UID.
    ///
    /// If the message is already in the mailbox, the old link is replaced,
    /// so the message moves to the end of the mailbox's UID order.
    pub fn add_message_to_mailbox(
        &self,
        mailbox: &MailboxId,
        message: &MessageId,
        recent: bool,
        deleted: bool,
    ) -> Result<Uid, Error> {
        let uid: Uid = self
            .query_row(
                "SELECT `next_uid` FROM `mailbox` WHERE `id` = ?",
                (mailbox,),
                from_single,
            )
            .optional()?
            .ok_or(Error::NxMailbox)?;
        let next_uid = uid.next().ok_or(Error::UidsExhausted)?;

        self.execute(
            "DELETE FROM `mailbox_message` \
             WHERE `mailbox_id` = ? AND `message_id` = ?",
            (mailbox, message),
        )?;
        self.execute(
            "INSERT INTO `mailbox_message` (\
               `mailbox_id`, `message_id`, `uid`, `recent`, `deleted`\
             ) VALUES (?, ?, ?, ?, ?)",
            (mailbox, message, uid, recent, deleted),
        )?;
        self.execute(
            "UPDATE `mailbox` SET `next_uid` = ? WHERE `id` = ?",
            (next_uid, mailbox),
        )?;

        Ok(uid)
    }

    /// Unlinks `message` from `mailbox`, returning whether it was there.
    pub fn remove_message_from_mailbox(
        &self,
        mailbox: &MailboxId,
        message: &MessageId,
    ) -> Result<bool, Error> {
        Ok(0 != self.execute(
            "DELETE FROM `mailbox_message` \
             WHERE `mailbox_id` = ? AND `message_id` = ?",
            (mailbox, message),
        )?)
    }

    pub fn uid_row(
        &self,
        mailbox: &MailboxId,
        message: &MessageId,
    ) -> Result<Option<UidRow>, Error> {
        Ok(self
            .query_row(
                "SELECT `uid`, `recent`, `deleted` FROM `mailbox_message` \
                 WHERE `mailbox_id` = ? AND `message_id` = ?",
                (mailbox, message),
                from_row,
            )
            .optional()?)
    }

    /// Returns every mailbox the message is linked into.
    pub fn message_mailboxes(
        &self,
        message: &MessageId,
    ) -> Result<Vec<MailboxId>, Error> {
        let mut stmt = self.prepare_cached(
            "SELECT `mailbox_id` FROM `mailbox_message` \
             WHERE `message_id` = ? ORDER BY `mailbox_id`",
        )?;
        let it = stmt.query_map((message,), from_single)?;
        Ok(it.collect::<Result<Vec<_>, _>>()?)
    }

    /// Returns every message in the mailbox, sorted ascending by UID.
    pub fn mailbox_messages(
        &self,
        mailbox: &MailboxId,
    ) -> Result<Vec<MailboxMessage>, Error> {
        let mut stmt = self.prepare_cached(
            "SELECT `message`.`id`, `message`.`remote_id`, \
                    `mailbox_message`.`uid`, `mailbox_message`.`recent`, \
                    `mailbox_message`.`deleted`, `message`.`flags` \
             FROM `mailbox_message` \
             JOIN `message` ON `message`.`id` = `mailbox_message`.`message_id` \
             WHERE `mailbox_message`.`mailbox_id` = ? \
             ORDER BY `mailbox_message`.`uid`",
        )?;
        let it = stmt.query_map((mailbox,), from_row)?;
        Ok(it.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn clear_recent(
        &self,
        mailbox: &MailboxId,
        message: &MessageId,
    ) -> Result<(), Error> {
        self.execute(
            "UPDATE `mailbox_message` SET `recent` = 0 \
             WHERE `mailbox_id` = ? AND `message_id` = ?",
            (mailbox, message),
        )?;
        Ok(())
    }

    pub fn clear_mailbox_recent(&self, mailbox: &MailboxId) -> Result<(), Error> {
        self.execute(
            "UPDATE `mailbox_message` SET `recent` = 0 \
             WHERE `mailbox_id` = ? AND `recent`",
            (mailbox,),
        )?;
        Ok(())
    }

    /// Sets the per-mailbox `\Deleted` flag.
    pub fn set_deleted_flag(
        &self,
        mailbox: &MailboxId,
        message: &MessageId,
        deleted: bool,
    ) -> Result<(), Error> {
        self.execute(
            "UPDATE `mailbox_message` SET `deleted` = ? \
             WHERE `mailbox_id` = ? AND `message_id` = ?",
            (deleted, mailbox, message),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::mailboxes::test::new_mailbox;
    use super::super::metadb::test::Fixture;
    use super::*;
    use crate::mime::parse::parse_message;

    fn parsed() -> ParsedMessage {
        parse_message(
            b"From: foo@bar.com\r\nSubject: hello\r\n\r\nbody\r\n",
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_message_links() {
        let fixture = Fixture::new();
        let remote = RemoteMailboxId::from("r-a");
        let flags = FlagSet::new();

        fixture
            .db
            .write(&fixture.cancel, |txn| {
                let a = txn.create_mailbox(&new_mailbox(&remote, "A", &flags))?;
                let m1 = MessageId::from("m1");
                let m2 = MessageId::from("m2");
                txn.create_message(
                    &m1,
                    &RemoteMessageId::from("r1"),
                    &parsed(),
                    &FlagSet::new().with(Flag::Seen),
                )?;
                txn.create_message(
                    &m2,
                    &RemoteMessageId::from("r2"),
                    &parsed(),
                    &FlagSet::new(),
                )?;

                assert_eq!(Uid::u(1), txn.add_message_to_mailbox(&a, &m1, true, false)?);
                assert_eq!(Uid::u(2), txn.add_message_to_mailbox(&a, &m2, true, true)?);
                // Re-linking bumps the UID
                assert_eq!(Uid::u(3), txn.add_message_to_mailbox(&a, &m1, false, false)?);
                assert_eq!(Uid::u(4), txn.require_mailbox("A")?.next_uid);

                let messages = txn.mailbox_messages(&a)?;
                assert_eq!(2, messages.len());
                assert_eq!(m2, messages[0].id);
                assert_eq!(Uid::u(2), messages[0].uid);
                assert!(messages[0].deleted);
                assert_eq!(
                    FlagSet::new().with(Flag::Deleted),
                    messages[0].visible_flags()
                );
                assert_eq!(m1, messages[1].id);
                assert_eq!(Uid::u(3), messages[1].uid);
                assert!(!messages[1].recent);

                assert_eq!((2, 1, 1), txn.mailbox_counts(&a)?);
                txn.clear_mailbox_recent(&a)?;
                assert_eq!((2, 0, 1), txn.mailbox_counts(&a)?);

                txn.set_deleted_flag(&a, &m2, false)?;
                assert_eq!(
                    Some(UidRow {
                        uid: Uid::u(2),
                        recent: false,
                        deleted: false,
                    }),
                    txn.uid_row(&a, &m2)?
                );

                assert_eq!(vec![a.clone()], txn.message_mailboxes(&m1)?);
                assert!(txn.remove_message_from_mailbox(&a, &m1)?);
                assert!(!txn.remove_message_from_mailbox(&a, &m1)?);
                assert!(txn.message_mailboxes(&m1)?.is_empty());
                assert!(txn.uid_row(&a, &m1)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_tombstones() {
        let fixture = Fixture::new();
        let m1 = MessageId::from("m1");

        fixture
            .db
            .write(&fixture.cancel, |txn| {
                txn.create_message(
                    &m1,
                    &RemoteMessageId::from("r1"),
                    &parsed(),
                    &FlagSet::new(),
                )?;
                assert!(!txn.message(&m1)?.unwrap().deleted);
                assert!(txn.tombstoned_messages()?.is_empty());

                txn.set_message_tombstone(&m1, true)?;
                assert!(txn.message(&m1)?.unwrap().deleted);
                assert_eq!(vec![m1.clone()], txn.tombstoned_messages()?);

                txn.set_message_remote_id(&m1, &RemoteMessageId::from("r9"))?;
                assert_eq!(
                    Some(m1.clone()),
                    txn.message_by_remote_id(&RemoteMessageId::from("r9"))?
                        .map(|m| m.id)
                );

                txn.delete_message(&m1)?;
                assert!(txn.message(&m1)?.is_none());
                Ok(())
            })
            .unwrap();
    }
}
