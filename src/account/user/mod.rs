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

//! The per-account aggregate.
//!
//! A `User` owns everything shared by the sessions of one account: the
//! metadata database, the literal store, the connector, the registry of live
//! sessions, and the injector thread that applies the connector's updates.
//!
//! Locks are always taken in the order
//!
//! 1. `User::states`
//! 2. the database writer
//! 3. a session's snapshot
//!
//! and a session's snapshot lock is never held across anything that can
//! block on another session.

mod injector;
mod updates;

pub(crate) use self::updates::OriginInbox;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::{info, warn};

use super::model::*;
use super::snapshot::Snapshot;
use super::state::State;
use super::state_update::StateUpdate;
use super::storage::{LiteralStore, MetaDb};
use super::uid_validity::UidValidityGenerator;
use crate::connector::Connector;
use crate::support::{
    cancel::CancelToken, error::Error, log_prefix::LogPrefix,
    system_config::EngineConfig,
};

pub(crate) type StateId = u64;

/// The part of a session other threads may look at.
#[derive(Default)]
pub(crate) struct SharedState {
    /// The snapshot of the selected mailbox, if any.
    pub(crate) snapshot: Mutex<Option<Snapshot>>,
    /// Set when the selected mailbox is deleted out from under the session.
    pub(crate) invalid: AtomicBool,
}

pub(crate) struct StateHandle {
    pub(crate) shared: Arc<SharedState>,
    pub(crate) sender: Sender<StateUpdate>,
}

pub struct User {
    pub(crate) id: String,
    pub(crate) log_prefix: LogPrefix,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) db: MetaDb,
    pub(crate) literals: Arc<dyn LiteralStore>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) uid_validity: Box<dyn UidValidityGenerator>,
    pub(crate) states: RwLock<HashMap<StateId, StateHandle>>,
    next_state_id: AtomicU64,
    pub(crate) active_searches: AtomicUsize,
    injector: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
    pub(crate) cancel: CancelToken,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User").field("id", &self.id).finish()
    }
}

impl User {
    /// Opens the user and starts its injector thread.
    pub fn new(
        id: String,
        config: Arc<EngineConfig>,
        db: MetaDb,
        literals: Arc<dyn LiteralStore>,
        connector: Arc<dyn Connector>,
        uid_validity: Box<dyn UidValidityGenerator>,
    ) -> Result<Arc<Self>, Error> {
        let log_prefix = LogPrefix::new("engine".to_owned());
        log_prefix.set_user(id.clone());

        let user = Arc::new(User {
            id,
            log_prefix,
            config,
            db,
            literals,
            connector,
            uid_validity,
            states: RwLock::new(HashMap::new()),
            next_state_id: AtomicU64::new(1),
            active_searches: AtomicUsize::new(0),
            injector: Mutex::new(None),
            cancel: CancelToken::new(),
        });

        let (stop_tx, stop_rx) = channel::bounded(1);
        let updates = user.connector.updates();
        let sweep_interval = user.config.sweep_interval();
        let weak = Arc::downgrade(&user);
        let handle = thread::Builder::new()
            .name(format!("injector-{}", user.id))
            .spawn(move || {
                injector::run(weak, updates, stop_rx, sweep_interval)
            })?;
        *user.injector.lock().unwrap() = Some((stop_tx, handle));

        info!("{} User opened", user.log_prefix);
        Ok(user)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts a new session for this user.
    pub fn new_state(self: &Arc<Self>) -> State {
        State::new(Arc::clone(self))
    }

    /// The number of live sessions.
    pub fn state_count(&self) -> usize {
        self.states.read().unwrap().len()
    }

    /// Returns the opaque settings blob the connector stored, if any.
    pub fn connector_settings(&self) -> Result<Option<String>, Error> {
        self.db.read(&self.cancel, |txn| txn.connector_settings())
    }

    pub fn set_connector_settings(&self, settings: &str) -> Result<(), Error> {
        self.db
            .write(&self.cancel, |txn| txn.set_connector_settings(settings))
    }

    pub(crate) fn register(
        &self,
    ) -> (StateId, Arc<SharedState>, Receiver<StateUpdate>) {
        let id = self.next_state_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SharedState::default());
        let (sender, receiver) =
            channel::bounded(self.config.update_queue_capacity.max(1));
        self.states.write().unwrap().insert(
            id,
            StateHandle {
                shared: Arc::clone(&shared),
                sender,
            },
        );
        (id, shared, receiver)
    }

    pub(crate) fn unregister(&self, id: StateId) {
        self.states.write().unwrap().remove(&id);
    }

    /// Physically deletes every tombstoned message which no live snapshot
    /// references and which is no longer linked into any mailbox.
    ///
    /// The states lock is held throughout, so no session can select a
    /// mailbox and pick up one of the doomed messages in the meantime.
    pub fn sweep(&self) -> Result<(), Error> {
        let states = self.states.write().unwrap();
        let referenced = states
            .values()
            .flat_map(|handle| {
                let snapshot = handle.shared.snapshot.lock().unwrap();
                snapshot
                    .iter()
                    .flat_map(|s| s.ids().cloned())
                    .collect::<Vec<_>>()
            })
            .collect::<HashSet<MessageId>>();

        let doomed = self.db.write(&self.cancel, |txn| {
            let mut doomed = Vec::new();
            for id in txn.tombstoned_messages()? {
                if referenced.contains(&id)
                    || !txn.message_mailboxes(&id)?.is_empty()
                {
                    continue;
                }

                txn.delete_message(&id)?;
                doomed.push(id);
            }
            Ok(doomed)
        })?;

        if !doomed.is_empty() {
            self.literals.delete(&doomed)?;
            info!(
                "{} Swept {} deleted message(s)",
                self.log_prefix,
                doomed.len()
            );
        }

        drop(states);
        Ok(())
    }

    fn stop_injector(&self) {
        let Some((stop, handle)) = self.injector.lock().unwrap().take() else {
            return;
        };

        let _ = stop.send(());
        // The injector may itself be dropping the last reference
        if handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!("{} Injector thread panicked", self.log_prefix);
        }
    }

    /// Stops the injector and releases the connector and literal store.
    ///
    /// Sessions still open keep working against the database, but no
    /// further remote updates are applied.
    pub fn close(&self) -> Result<(), Error> {
        self.stop_injector();
        self.connector.close().map_err(Error::Connector)?;
        self.literals.close()?;
        info!("{} User closed", self.log_prefix);
        Ok(())
    }
}

impl Drop for User {
    fn drop(&mut self) {
        self.stop_injector();
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::time::Duration;

    use super::*;
    use crate::account::storage::{Mailbox, MemoryLiteralStore};
    use crate::account::uid_validity::IncrementalGenerator;
    use crate::connector::dummy::DummyConnector;

    pub(crate) struct UserFixture {
        _root: tempfile::TempDir,
        pub(crate) user: Arc<User>,
        pub(crate) connector: Arc<DummyConnector>,
        pub(crate) literals: Arc<MemoryLiteralStore>,
    }

    impl UserFixture {
        pub(crate) fn new() -> Self {
            Self::with_config(EngineConfig::default())
        }

        pub(crate) fn with_config(config: EngineConfig) -> Self {
            crate::init_test_log();

            let root = tempfile::TempDir::new().unwrap();
            let log_prefix = LogPrefix::new("test".to_owned());
            let db =
                MetaDb::open(&root.path().join("meta.sqlite"), &log_prefix)
                    .unwrap();
            let connector = Arc::new(DummyConnector::new());
            let literals = Arc::new(MemoryLiteralStore::default());
            let user = User::new(
                "user".to_owned(),
                Arc::new(config),
                db,
                Arc::clone(&literals) as Arc<dyn LiteralStore>,
                Arc::clone(&connector) as Arc<dyn Connector>,
                Box::new(IncrementalGenerator),
            )
            .unwrap();

            Self {
                _root: root,
                user,
                connector,
                literals,
            }
        }

        /// Pushes an update through the connector and waits for the
        /// injector to finish applying it.
        pub(crate) fn inject(
            &self,
            kind: crate::connector::UpdateKind,
        ) -> Result<(), String> {
            self.connector
                .push_update(kind)
                .recv_timeout(Duration::from_secs(10))
                .unwrap()
        }
    }

    /// Looks up every mailbox in `names` by name.
    pub(crate) fn mailboxes_by_name(
        user: &User,
        names: &[&str],
    ) -> HashMap<String, Mailbox> {
        user.db
            .read(&user.cancel, |txn| {
                let mut found = HashMap::new();
                for &name in names {
                    if let Some(mailbox) = txn.mailbox_by_name(name)? {
                        found.insert(name.to_owned(), mailbox);
                    }
                }
                Ok(found)
            })
            .unwrap()
    }

    #[test]
    fn connector_settings_round_trip() {
        let fixture = UserFixture::new();
        assert_eq!(None, fixture.user.connector_settings().unwrap());
        fixture.user.set_connector_settings("{\"a\":1}").unwrap();
        assert_eq!(
            Some("{\"a\":1}".to_owned()),
            fixture.user.connector_settings().unwrap()
        );
    }

    #[test]
    fn states_register_and_unregister() {
        let fixture = UserFixture::new();
        let a = fixture.user.new_state();
        let b = fixture.user.new_state();
        assert_eq!(2, fixture.user.state_count());
        drop(a);
        assert_eq!(1, fixture.user.state_count());
        drop(b);
        assert_eq!(0, fixture.user.state_count());
    }

    #[test]
    fn close_stops_injector() {
        let fixture = UserFixture::new();
        fixture.user.close().unwrap();
        assert!(fixture.user.injector.lock().unwrap().is_none());
        assert_eq!(1, fixture.connector.call_count("close"));
    }
}
