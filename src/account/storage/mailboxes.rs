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
use crate::support::error::Error;

impl Txn<'_> {
    /// Creates a mailbox, returning its new ID.
    ///
    /// Fails with `MailboxExists` if the name is taken. Any subscription
    /// tombstone under the same name is cleared.
    pub fn create_mailbox(
        &self,
        mailbox: &NewMailbox<'_>,
    ) -> Result<MailboxId, Error> {
        if self.mailbox_by_name(mailbox.name)?.is_some() {
            return Err(Error::MailboxExists);
        }

        let id = MailboxId::generate();
        self.execute(
            "INSERT INTO `mailbox` (\
               `id`, `remote_id`, `name`, `uid_validity`, `next_uid`, \
               `subscribed`, `flags`, `permanent_flags`, `attributes`\
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                mailbox.remote_id,
                mailbox.name,
                mailbox.uid_validity,
                Uid::MIN,
                mailbox.subscribed,
                mailbox.flags,
                mailbox.permanent_flags,
                join_attributes(mailbox.attributes),
            ),
        )?;
        self.remove_deleted_subscription(mailbox.name)?;

        Ok(id)
    }

    pub fn mailbox_by_id(
        &self,
        id: &MailboxId,
    ) -> Result<Option<Mailbox>, Error> {
        Ok(self
            .query_row("SELECT * FROM `mailbox` WHERE `id` = ?", (id,), from_row)
            .optional()?)
    }

    pub fn mailbox_by_name(&self, name: &str) -> Result<Option<Mailbox>, Error> {
        Ok(self
            .query_row(
                "SELECT * FROM `mailbox` WHERE `name` = ?",
                (name,),
                from_row,
            )
            .optional()?)
    }

    pub fn mailbox_by_remote_id(
        &self,
        remote_id: &RemoteMailboxId,
    ) -> Result<Option<Mailbox>, Error> {
        Ok(self
            .query_row(
                "SELECT * FROM `mailbox` WHERE `remote_id` = ?",
                (remote_id,),
                from_row,
            )
            .optional()?)
    }

    /// Like `mailbox_by_name`, but fails with `NxMailbox` if there is no
    /// such mailbox.
    pub fn require_mailbox(&self, name: &str) -> Result<Mailbox, Error> {
        self.mailbox_by_name(name)?.ok_or(Error::NxMailbox)
    }

    /// Returns every mailbox, sorted by name.
    pub fn all_mailboxes(&self) -> Result<Vec<Mailbox>, Error> {
        let mut stmt =
            self.prepare_cached("SELECT * FROM `mailbox` ORDER BY `name`")?;
        let it = stmt.query_map((), from_row)?;
        Ok(it.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn rename_mailbox(
        &self,
        id: &MailboxId,
        new_name: &str,
    ) -> Result<(), Error> {
        if let Some(existing) = self.mailbox_by_name(new_name)? {
            if existing.id != *id {
                return Err(Error::MailboxExists);
            }
            return Ok(());
        }

        let updated = self.execute(
            "UPDATE `mailbox` SET `name` = ? WHERE `id` = ?",
            (new_name, id),
        )?;
        if 0 == updated {
            return Err(Error::NxMailbox);
        }

        self.remove_deleted_subscription(new_name)?;
        Ok(())
    }

    pub fn set_mailbox_remote_id(
        &self,
        id: &MailboxId,
        remote_id: &RemoteMailboxId,
    ) -> Result<(), Error> {
        let updated = self.execute(
            "UPDATE `mailbox` SET `remote_id` = ? WHERE `id` = ?",
            (remote_id, id),
        )?;
        if 0 == updated {
            return Err(Error::NxMailbox);
        }
        Ok(())
    }

    pub fn set_mailbox_subscribed(
        &self,
        id: &MailboxId,
        subscribed: bool,
    ) -> Result<(), Error> {
        self.execute(
            "UPDATE `mailbox` SET `subscribed` = ? WHERE `id` = ?",
            (subscribed, id),
        )?;
        Ok(())
    }

    /// Deletes the given mailbox along with all its message links.
    ///
    /// If `keep_subscription` is set and the mailbox was subscribed, a
    /// subscription tombstone is left in its place. Messages themselves are
    /// untouched.
    pub fn delete_mailbox(
        &self,
        mailbox: &Mailbox,
        keep_subscription: bool,
    ) -> Result<(), Error> {
        if keep_subscription && mailbox.subscribed {
            self.execute(
                "INSERT OR REPLACE INTO `deleted_subscription` \
                 (`name`, `remote_id`) VALUES (?, ?)",
                (&mailbox.name, &mailbox.remote_id),
            )?;
        }

        self.execute("DELETE FROM `mailbox` WHERE `id` = ?", (&mailbox.id,))?;
        Ok(())
    }

    /// Removes the subscription tombstone for `name`, returning whether there
    /// was one.
    pub fn remove_deleted_subscription(&self, name: &str) -> Result<bool, Error> {
        Ok(0 != self.execute(
            "DELETE FROM `deleted_subscription` WHERE `name` = ?",
            (name,),
        )?)
    }

    pub fn has_deleted_subscription(&self, name: &str) -> Result<bool, Error> {
        Ok(0 != self.query_row(
            "SELECT COUNT(*) FROM `deleted_subscription` WHERE `name` = ?",
            (name,),
            from_single::<i64>,
        )?)
    }

    /// Returns the names and last remote IDs of all subscription tombstones.
    pub fn deleted_subscriptions(
        &self,
    ) -> Result<Vec<(String, RemoteMailboxId)>, Error> {
        let mut stmt = self.prepare_cached(
            "SELECT `name`, `remote_id` FROM `deleted_subscription` \
             ORDER BY `name`",
        )?;
        let it = stmt.query_map((), from_row)?;
        Ok(it.collect::<Result<Vec<_>, _>>()?)
    }

    /// Returns `(messages, recent, unseen)` for the given mailbox.
    pub fn mailbox_counts(
        &self,
        id: &MailboxId,
    ) -> Result<(usize, usize, usize), Error> {
        let (messages, recent) = self.query_row(
            "SELECT COUNT(*), COALESCE(SUM(`recent`), 0) \
             FROM `mailbox_message` WHERE `mailbox_id` = ?",
            (id,),
            from_row::<(usize, usize)>,
        )?;

        let mut stmt = self.prepare_cached(
            "SELECT `message`.`flags` FROM `mailbox_message` \
             JOIN `message` ON `message`.`id` = `mailbox_message`.`message_id` \
             WHERE `mailbox_message`.`mailbox_id` = ?",
        )?;
        let mut unseen = 0;
        for flags in stmt.query_map((id,), from_single::<FlagSet>)? {
            if !flags?.contains(&Flag::Seen) {
                unseen += 1;
            }
        }

        Ok((messages, recent, unseen))
    }
}

#[cfg(test)]
pub(super) mod test {
    use super::super::metadb::test::Fixture;
    use super::*;

    pub fn new_mailbox<'a>(
        remote_id: &'a RemoteMailboxId,
        name: &'a str,
        flags: &'a FlagSet,
    ) -> NewMailbox<'a> {
        NewMailbox {
            remote_id,
            name,
            uid_validity: 1,
            subscribed: true,
            flags,
            permanent_flags: flags,
            attributes: &[],
        }
    }

    #[test]
    fn test_mailbox_crud() {
        let fixture = Fixture::new();
        let flags = FlagSet::new().with(Flag::Seen);
        let foo_remote = RemoteMailboxId::from("r-foo");
        let bar_remote = RemoteMailboxId::from("r-bar");

        fixture
            .db
            .write(&fixture.cancel, |txn| {
                let foo = txn.create_mailbox(&new_mailbox(
                    &foo_remote,
                    "foo",
                    &flags,
                ))?;
                assert_matches!(
                    Err(Error::MailboxExists),
                    txn.create_mailbox(&new_mailbox(&bar_remote, "foo", &flags))
                );
                txn.create_mailbox(&new_mailbox(&bar_remote, "bar", &flags))?;

                let loaded = txn.require_mailbox("foo")?;
                assert_eq!(foo, loaded.id);
                assert_eq!(foo_remote, loaded.remote_id);
                assert_eq!(Uid::MIN, loaded.next_uid);
                assert_eq!(flags, loaded.flags);
                assert!(loaded.attributes.is_empty());

                assert_eq!(
                    Some(foo.clone()),
                    txn.mailbox_by_remote_id(&foo_remote)?.map(|m| m.id)
                );

                assert_matches!(
                    Err(Error::MailboxExists),
                    txn.rename_mailbox(&foo, "bar")
                );
                txn.rename_mailbox(&foo, "baz")?;
                assert!(txn.mailbox_by_name("foo")?.is_none());
                assert_eq!(
                    vec!["bar", "baz"],
                    txn.all_mailboxes()?
                        .into_iter()
                        .map(|m| m.name)
                        .collect::<Vec<_>>()
                );

                txn.set_mailbox_remote_id(&foo, &RemoteMailboxId::from("r2"))?;
                assert_eq!(
                    "r2",
                    txn.mailbox_by_id(&foo)?.unwrap().remote_id.as_str()
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_subscription_tombstones() {
        let fixture = Fixture::new();
        let flags = FlagSet::new();
        let remote = RemoteMailboxId::from("r-foo");

        fixture
            .db
            .write(&fixture.cancel, |txn| {
                let id =
                    txn.create_mailbox(&new_mailbox(&remote, "foo", &flags))?;
                let mailbox = txn.mailbox_by_id(&id)?.unwrap();
                txn.delete_mailbox(&mailbox, true)?;

                assert!(txn.mailbox_by_name("foo")?.is_none());
                assert!(txn.has_deleted_subscription("foo")?);
                assert_eq!(
                    vec![("foo".to_owned(), remote.clone())],
                    txn.deleted_subscriptions()?
                );

                // Recreating the mailbox clears the tombstone
                txn.create_mailbox(&new_mailbox(&remote, "foo", &flags))?;
                assert!(!txn.has_deleted_subscription("foo")?);

                // Unsubscribed mailboxes leave nothing behind
                let mailbox = txn.require_mailbox("foo")?;
                txn.set_mailbox_subscribed(&mailbox.id, false)?;
                let mailbox = txn.require_mailbox("foo")?;
                txn.delete_mailbox(&mailbox, true)?;
                assert!(txn.deleted_subscriptions()?.is_empty());

                // Nor do deletions which discard the subscription
                txn.create_mailbox(&new_mailbox(&remote, "foo", &flags))?;
                let mailbox = txn.require_mailbox("foo")?;
                txn.delete_mailbox(&mailbox, false)?;
                assert!(txn.deleted_subscriptions()?.is_empty());
                Ok(())
            })
            .unwrap();
    }
}
