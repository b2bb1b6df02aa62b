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

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// The engine-wide configuration for Mirrormap.
///
/// This is typically stored in a file named `mirrormap.toml` next to the
/// embedding application's own configuration. Every section has usable
/// defaults, so an empty file is a valid configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The hierarchy delimiter used in mailbox names.
    pub delimiter: char,

    /// The directory holding one metadata database per user.
    pub db_dir: PathBuf,

    /// The directory under which each user's literal store lives.
    pub data_dir: PathBuf,

    /// Which literal store implementation new users get.
    pub literal_store: LiteralStoreKind,

    /// The zstd compression level used by the on-disk literal store.
    pub compression_level: i32,

    /// The capacity of each session's inbound update queue.
    ///
    /// A session whose queue is full exerts back-pressure on whoever is
    /// publishing to it.
    pub update_queue_capacity: usize,

    /// The maximum number of messages inserted per database transaction when
    /// applying a bulk `MessagesCreated` update from the connector.
    pub messages_created_chunk_size: usize,

    /// How often, in seconds, the per-user injector sweeps tombstoned
    /// messages. 0 disables the periodic sweep; sweeps still happen when
    /// sessions close or switch mailboxes.
    pub sweep_interval_secs: u64,

    /// If true, FETCH and SEARCH always run on the calling thread.
    pub disable_parallelism: bool,

    /// The greatest UIDVALIDITY value the engine will hand out.
    pub max_uid_validity: u32,

    pub login_jail: LoginJailConfig,

    /// If set, a log4rs configuration file `init_logging` installs.
    pub log_config: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            delimiter: '/',
            db_dir: PathBuf::from("mirrormap/db"),
            data_dir: PathBuf::from("mirrormap/data"),
            literal_store: LiteralStoreKind::File,
            compression_level: 3,
            update_queue_capacity: 4096,
            messages_created_chunk_size: 1000,
            sweep_interval_secs: 300,
            disable_parallelism: false,
            max_uid_validity: u32::MAX,
            login_jail: LoginJailConfig::default(),
            log_config: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteralStoreKind {
    /// zstd-compressed files under `data_dir`.
    File,
    /// Kept in memory and lost when the user is removed.
    Memory,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoginJailConfig {
    /// The number of failed logins for one user name after which further
    /// attempts are refused.
    pub max_failures: u32,
    /// The window, in seconds, over which failures are counted.
    pub window_secs: u64,
}

impl Default for LoginJailConfig {
    fn default() -> Self {
        LoginJailConfig {
            max_failures: 5,
            window_secs: 300,
        }
    }
}

impl LoginJailConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl EngineConfig {
    /// Parses the configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    /// Loads the configuration from the given file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        if 0 == self.sweep_interval_secs {
            None
        } else {
            Some(Duration::from_secs(self.sweep_interval_secs))
        }
    }

    /// If `log_config` is set, install it as the global logger.
    ///
    /// Returns whether a logger was installed. Embedders that set up logging
    /// themselves simply leave `log_config` unset.
    pub fn init_logging(&self) -> Result<bool, Error> {
        let Some(ref log_config) = self.log_config else {
            return Ok(false);
        };

        log4rs::init_file(log_config, log4rs::config::Deserializers::new())
            .map_err(|e| Error::Logging(e.to_string()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!('/', config.delimiter);
        assert_eq!(LiteralStoreKind::File, config.literal_store);
        assert_eq!(5, config.login_jail.max_failures);
        assert!(config.log_config.is_none());
        assert!(!config.init_logging().unwrap());
    }

    #[test]
    fn parse_partial_config() {
        let config = EngineConfig::parse(
            r#"
delimiter = "."
literal_store = "memory"
sweep_interval_secs = 0
max_uid_validity = 1000

[login_jail]
max_failures = 2
"#,
        )
        .unwrap();

        assert_eq!('.', config.delimiter);
        assert_eq!(LiteralStoreKind::Memory, config.literal_store);
        assert!(config.sweep_interval().is_none());
        assert_eq!(1000, config.max_uid_validity);
        assert_eq!(2, config.login_jail.max_failures);
        assert_eq!(300, config.login_jail.window_secs);
        assert_eq!(4096, config.update_queue_capacity);
    }

    #[test]
    fn bad_config_is_rejected() {
        assert_matches!(
            Err(Error::Config(..)),
            EngineConfig::parse("literal_store = \"tape\"")
        );
    }
}
