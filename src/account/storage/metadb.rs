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

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use log::warn;
use rusqlite::OptionalExtension as _;

use super::{db_migrations::apply_migrations, types::*};
use crate::support::{
    cancel::CancelToken, error::Error, log_prefix::LogPrefix,
};

static MIGRATION_V1: &str = include_str!("metadb.v1.sql");

/// The per-user metadata database.
///
/// Writers are serialised through a single connection. Readers each get
/// their own connection from a small pool, so with the database in WAL mode
/// they neither block nor are blocked by the writer.
pub struct MetaDb {
    path: PathBuf,
    log_prefix: LogPrefix,
    writer: Mutex<rusqlite::Connection>,
    readers: Mutex<Vec<rusqlite::Connection>>,
}

/// A transaction on the metadata database.
///
/// The query methods are spread across the storage modules by entity.
pub struct Txn<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl Deref for Txn<'_> {
    type Target = rusqlite::Connection;

    fn deref(&self) -> &rusqlite::Connection {
        &self.tx
    }
}

/// The maximum number of idle reader connections kept around.
const MAX_IDLE_READERS: usize = 4;

impl MetaDb {
    /// Opens (creating if needed) the database at `path` and brings its
    /// schema up to date.
    pub fn open(path: &Path, log_prefix: &LogPrefix) -> Result<Self, Error> {
        let mut cxn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE,
        )?;

        cxn.pragma_update(None, "foreign_keys", true)?;
        cxn.pragma_update(None, "journal_mode", "WAL")?;
        cxn.pragma_update(None, "synchronous", "NORMAL")?;
        cxn.busy_timeout(Duration::from_secs(10))?;

        apply_migrations(log_prefix, &mut cxn, "meta", &[MIGRATION_V1])?;

        Ok(Self {
            path: path.to_owned(),
            log_prefix: log_prefix.clone(),
            writer: Mutex::new(cxn),
            readers: Mutex::new(Vec::new()),
        })
    }

    fn open_reader(&self) -> Result<rusqlite::Connection, Error> {
        let cxn = rusqlite::Connection::open_with_flags(
            &self.path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE,
        )?;
        cxn.pragma_update(None, "query_only", true)?;
        cxn.busy_timeout(Duration::from_secs(10))?;
        Ok(cxn)
    }

    /// Runs `f` inside a read-only transaction.
    pub fn read<T>(
        &self,
        cancel: &CancelToken,
        f: impl FnOnce(&Txn<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        cancel.check()?;

        let pooled = self.readers.lock().unwrap().pop();
        let mut cxn = match pooled {
            Some(cxn) => cxn,
            None => self.open_reader()?,
        };

        let result = {
            let tx = cxn.transaction_with_behavior(
                rusqlite::TransactionBehavior::Deferred,
            )?;
            f(&Txn { tx })
        };

        let mut readers = self.readers.lock().unwrap();
        if readers.len() < MAX_IDLE_READERS {
            readers.push(cxn);
        }

        result
    }

    /// Runs `f` inside a write transaction.
    ///
    /// The transaction commits if `f` succeeds and `cancel` has not been
    /// signalled by then; otherwise it is rolled back.
    pub fn write<T>(
        &self,
        cancel: &CancelToken,
        f: impl FnOnce(&Txn<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        cancel.check()?;

        let mut cxn = self.writer.lock().unwrap();
        let txn = Txn {
            tx: cxn.transaction_with_behavior(
                rusqlite::TransactionBehavior::Immediate,
            )?,
        };

        let result = f(&txn)?;
        if let Err(e) = cancel.check() {
            warn!("{} Rolling back cancelled transaction", self.log_prefix);
            return Err(e);
        }

        txn.tx.commit()?;
        Ok(result)
    }
}

impl Txn<'_> {
    /// Returns the last UIDVALIDITY value that was handed out.
    pub fn last_uid_validity(&self) -> Result<u32, Error> {
        Ok(self.query_row(
            "SELECT `uid_validity` FROM `account`",
            (),
            from_single,
        )?)
    }

    pub fn set_last_uid_validity(&self, uid_validity: u32) -> Result<(), Error> {
        self.execute("UPDATE `account` SET `uid_validity` = ?", (uid_validity,))?;
        Ok(())
    }

    pub fn connector_settings(&self) -> Result<Option<String>, Error> {
        Ok(self
            .query_row(
                "SELECT `connector_settings` FROM `account`",
                (),
                from_single::<Option<String>>,
            )
            .optional()?
            .flatten())
    }

    pub fn set_connector_settings(&self, settings: &str) -> Result<(), Error> {
        self.execute(
            "UPDATE `account` SET `connector_settings` = ?",
            (settings,),
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(super) mod test {
    use tempfile::TempDir;

    use super::*;

    pub struct Fixture {
        _tmpdir: TempDir,
        pub db: MetaDb,
        pub cancel: CancelToken,
    }

    impl Fixture {
        pub fn new() -> Self {
            let tmpdir = TempDir::new().unwrap();
            let db = MetaDb::open(
                &tmpdir.path().join("meta.sqlite"),
                &LogPrefix::new("test".to_owned()),
            )
            .unwrap();

            Self {
                _tmpdir: tmpdir,
                db,
                cancel: CancelToken::new(),
            }
        }
    }

    #[test]
    fn reopen_keeps_data() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("meta.sqlite");
        let prefix = LogPrefix::new("test".to_owned());
        let cancel = CancelToken::new();

        {
            let db = MetaDb::open(&path, &prefix).unwrap();
            db.write(&cancel, |txn| txn.set_connector_settings("hello"))
                .unwrap();
        }

        let db = MetaDb::open(&path, &prefix).unwrap();
        assert_eq!(
            Some("hello".to_owned()),
            db.read(&cancel, |txn| txn.connector_settings()).unwrap()
        );
    }

    #[test]
    fn failed_or_cancelled_write_rolls_back() {
        let fixture = Fixture::new();

        assert_matches!(
            Err(Error::NxMailbox),
            fixture.db.write(&fixture.cancel, |txn| {
                txn.set_last_uid_validity(42)?;
                Err::<(), _>(Error::NxMailbox)
            })
        );

        let cancel = CancelToken::new();
        assert_matches!(
            Err(Error::Cancelled),
            fixture.db.write(&cancel, |txn| {
                txn.set_last_uid_validity(43)?;
                cancel.cancel();
                Ok(())
            })
        );

        assert_eq!(
            0,
            fixture
                .db
                .read(&fixture.cancel, |txn| txn.last_uid_validity())
                .unwrap()
        );

        assert_matches!(
            Err(Error::Cancelled),
            fixture.db.read(&cancel, |txn| txn.last_uid_validity())
        );
    }

    #[test]
    fn readers_do_not_block_on_writer() {
        let fixture = Fixture::new();
        fixture
            .db
            .write(&fixture.cancel, |txn| {
                txn.set_last_uid_validity(7)?;
                // Uncommitted changes are invisible to a concurrent reader.
                let seen = fixture
                    .db
                    .read(&fixture.cancel, |r| r.last_uid_validity())?;
                assert_eq!(0, seen);
                Ok(())
            })
            .unwrap();

        assert_eq!(
            7,
            fixture
                .db
                .read(&fixture.cancel, |txn| txn.last_uid_validity())
                .unwrap()
        );
    }
}
