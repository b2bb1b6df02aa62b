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

//! The multi-user registry.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use super::storage::{open_literal_store, MetaDb};
use super::uid_validity::{EpochGenerator, UidValidityGenerator};
use super::user::User;
use crate::connector::Connector;
use crate::support::{
    error::Error, file_ops::IgnoreKinds, log_prefix::LogPrefix,
    safe_name::is_safe_file_name, system_config::EngineConfig,
};

/// Owns every user of one embedding application.
///
/// Each user gets `<db_dir>/<id>.sqlite` for its metadata and
/// `<data_dir>/<id>/` for its literals.
pub struct Backend {
    config: Arc<EngineConfig>,
    log_prefix: LogPrefix,
    users: RwLock<HashMap<String, Arc<User>>>,
    /// Recent failed logins per user name, oldest first.
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Backend {
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        fs::create_dir_all(&config.db_dir)?;
        fs::create_dir_all(&config.data_dir)?;

        Ok(Backend {
            config: Arc::new(config),
            log_prefix: LogPrefix::new("backend".to_owned()),
            users: RwLock::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens the user `id`, creating its storage if needed.
    ///
    /// If the user is already open, the existing instance is returned and
    /// `connector` is dropped.
    pub fn add_user(
        &self,
        id: &str,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<User>, Error> {
        self.add_user_with_generator(id, connector, Box::new(EpochGenerator))
    }

    /// Like `add_user`, but with a custom UIDVALIDITY source.
    pub fn add_user_with_generator(
        &self,
        id: &str,
        connector: Arc<dyn Connector>,
        uid_validity: Box<dyn UidValidityGenerator>,
    ) -> Result<Arc<User>, Error> {
        if !is_safe_file_name(id) {
            return Err(Error::UnsafeName);
        }

        let mut users = self.users.write().unwrap();
        if let Some(user) = users.get(id) {
            return Ok(Arc::clone(user));
        }

        let db = MetaDb::open(&self.db_path(id), &self.log_prefix)?;
        let literals = open_literal_store(
            self.config.literal_store,
            &self.config.data_dir.join(id),
            self.config.compression_level,
        )?;
        let user = User::new(
            id.to_owned(),
            Arc::clone(&self.config),
            db,
            literals,
            connector,
            uid_validity,
        )?;

        users.insert(id.to_owned(), Arc::clone(&user));
        info!("{} Added user '{}'", self.log_prefix, id);
        Ok(user)
    }

    /// Returns the open user `id`, if any.
    pub fn user(&self, id: &str) -> Option<Arc<User>> {
        self.users.read().unwrap().get(id).cloned()
    }

    /// Closes and forgets the user `id`, returning whether it was open.
    ///
    /// With `with_data`, the user's database and literals are deleted too.
    /// Sessions still holding the user keep working until they end.
    pub fn remove_user(&self, id: &str, with_data: bool) -> Result<bool, Error> {
        let Some(user) = self.users.write().unwrap().remove(id) else {
            return Ok(false);
        };

        user.close()?;
        if with_data {
            let db = self.db_path(id);
            for suffix in ["", "-wal", "-shm"] {
                let mut path = db.clone().into_os_string();
                path.push(suffix);
                fs::remove_file(path).ignore_not_found()?;
            }
            fs::remove_dir_all(self.config.data_dir.join(id))
                .ignore_not_found()?;
        }

        info!("{} Removed user '{}'", self.log_prefix, id);
        Ok(true)
    }

    /// Checks `password` for `id` with the user's connector, returning the
    /// user on success.
    ///
    /// Too many failures for one user name within the login jail window
    /// make every further attempt fail with `LoginBlocked`, whether or not
    /// the password is right, until the oldest failure leaves the window.
    pub fn login(&self, id: &str, password: &[u8]) -> Result<Arc<User>, Error> {
        if self.is_jailed(id) {
            warn!("{} Blocked login for user '{}'", self.log_prefix, id);
            return Err(Error::LoginBlocked);
        }

        let user = self
            .user(id)
            .filter(|user| user.connector.authorize(id, password));
        let Some(user) = user else {
            // Empty passwords are usually a client probing, not an attack
            if !password.is_empty() {
                warn!("{} Rejected login for user '{}'", self.log_prefix, id);
            }
            self.record_failure(id);
            return Err(Error::BadCredentials);
        };

        self.failures.lock().unwrap().remove(id);
        info!("{} Login successful for user '{}'", self.log_prefix, id);
        Ok(user)
    }

    fn is_jailed(&self, id: &str) -> bool {
        let jail = self.config.login_jail;
        if 0 == jail.max_failures {
            return false;
        }

        let mut failures = self.failures.lock().unwrap();
        let Some(recent) = failures.get_mut(id) else {
            return false;
        };

        expire(recent, Instant::now(), jail.window());
        if recent.is_empty() {
            failures.remove(id);
            return false;
        }
        recent.len() >= jail.max_failures as usize
    }

    /// Notes a failed login for `id`, forgetting every failure of any name
    /// that has left the window.
    fn record_failure(&self, id: &str) {
        let jail = self.config.login_jail;
        if 0 == jail.max_failures {
            return;
        }

        let now = Instant::now();
        let mut failures = self.failures.lock().unwrap();
        failures.retain(|_, recent| {
            expire(recent, now, jail.window());
            !recent.is_empty()
        });
        failures.entry(id.to_owned()).or_default().push_back(now);
    }

    /// Closes every user.
    ///
    /// All users are closed even if some fail; the first error is returned.
    pub fn close(&self) -> Result<(), Error> {
        let users = std::mem::take(&mut *self.users.write().unwrap());
        let mut result = Ok(());
        for (id, user) in users {
            if let Err(e) = user.close() {
                error!(
                    "{} Failed to close user '{}': {}",
                    self.log_prefix, id, e
                );
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn db_path(&self, id: &str) -> PathBuf {
        self.config.db_dir.join(format!("{id}.sqlite"))
    }
}

fn expire(recent: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while recent
        .front()
        .is_some_and(|&t| now.duration_since(t) >= window)
    {
        recent.pop_front();
    }
}
