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

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::account::model::MessageId;
use crate::support::{
    error::Error,
    file_ops::{self, IgnoreKinds},
    safe_name::is_safe_file_name,
    system_config::LiteralStoreKind,
};

/// Storage for message literals, keyed by internal message ID.
///
/// Writes to one key exclude all other access to that key; reads of the same
/// key may proceed concurrently.
pub trait LiteralStore: Send + Sync {
    /// Fetches the literal for `id`, failing with `NxMessage` if there is
    /// none.
    fn get(&self, id: &MessageId) -> Result<Vec<u8>, Error>;
    /// Atomically stores `literal` under `id`, replacing any existing value.
    fn set(&self, id: &MessageId, literal: &[u8]) -> Result<(), Error>;
    /// Moves the literal stored under `old` to `new`.
    fn update(&self, old: &MessageId, new: &MessageId) -> Result<(), Error>;
    /// Deletes the literals of `ids`. Missing keys are ignored.
    fn delete(&self, ids: &[MessageId]) -> Result<(), Error>;
    /// Lists every key in the store, in no particular order.
    fn list(&self) -> Result<Vec<MessageId>, Error>;
    /// Releases any resources held by the store.
    fn close(&self) -> Result<(), Error>;
}

/// Opens the literal store of the given kind rooted at `dir`.
pub fn open_literal_store(
    kind: LiteralStoreKind,
    dir: &Path,
    compression_level: i32,
) -> Result<Arc<dyn LiteralStore>, Error> {
    Ok(match kind {
        LiteralStoreKind::File => {
            Arc::new(FileLiteralStore::open(dir, compression_level)?)
        },
        LiteralStoreKind::Memory => Arc::new(MemoryLiteralStore::default()),
    })
}

const STRIPES: usize = 16;

/// A literal store keeping one zstd-compressed file per message.
///
/// Writes go through a temporary file and a rename so that a crash never
/// leaves a partial literal behind.
pub struct FileLiteralStore {
    root: PathBuf,
    tmp: PathBuf,
    compression_level: i32,
    stripes: Vec<RwLock<()>>,
}

impl FileLiteralStore {
    pub fn open(root: &Path, compression_level: i32) -> Result<Self, Error> {
        let tmp = root.join("tmp");
        fs::create_dir_all(&tmp)?;
        Ok(Self {
            root: root.to_owned(),
            tmp,
            compression_level,
            stripes: (0..STRIPES).map(|_| RwLock::new(())).collect(),
        })
    }

    fn path(&self, id: &MessageId) -> Result<PathBuf, Error> {
        if !is_safe_file_name(id.as_str()) || "tmp" == id.as_str() {
            return Err(Error::UnsafeName);
        }
        Ok(self.root.join(id.as_str()))
    }

    fn stripe(&self, id: &MessageId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() as usize) % STRIPES
    }
}

impl LiteralStore for FileLiteralStore {
    fn get(&self, id: &MessageId) -> Result<Vec<u8>, Error> {
        let path = self.path(id)?;
        let _lock = self.stripes[self.stripe(id)].read().unwrap();
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                return Err(Error::NxMessage)
            },
            Err(e) => return Err(e.into()),
        };
        Ok(zstd::stream::decode_all(file)?)
    }

    fn set(&self, id: &MessageId, literal: &[u8]) -> Result<(), Error> {
        let path = self.path(id)?;
        let compressed =
            zstd::stream::encode_all(literal, self.compression_level)?;
        let _lock = self.stripes[self.stripe(id)].write().unwrap();
        file_ops::spit(&self.tmp, &path, true, 0o600, &compressed)?;
        Ok(())
    }

    fn update(&self, old: &MessageId, new: &MessageId) -> Result<(), Error> {
        let old_path = self.path(old)?;
        let new_path = self.path(new)?;

        // Always lock in stripe order to avoid deadlocking against a
        // concurrent update in the opposite direction.
        let (a, b) = (self.stripe(old), self.stripe(new));
        let _first = self.stripes[a.min(b)].write().unwrap();
        let _second = if a != b {
            Some(self.stripes[a.max(b)].write().unwrap())
        } else {
            None
        };

        match fs::rename(&old_path, &new_path) {
            Ok(()) => Ok(()),
            Err(e) if io::ErrorKind::NotFound == e.kind() => {
                Err(Error::NxMessage)
            },
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, ids: &[MessageId]) -> Result<(), Error> {
        for id in ids {
            let path = self.path(id)?;
            let _lock = self.stripes[self.stripe(id)].write().unwrap();
            fs::remove_file(&path).ignore_not_found()?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<MessageId>, Error> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(MessageId::from(name));
            }
        }
        Ok(ids)
    }

    fn close(&self) -> Result<(), Error> {
        // Stale temporary files are left by crashes mid-write
        for entry in fs::read_dir(&self.tmp)? {
            fs::remove_file(entry?.path()).ignore_not_found()?;
        }
        Ok(())
    }
}

/// A literal store which keeps everything in memory.
#[derive(Default)]
pub struct MemoryLiteralStore {
    literals: Mutex<HashMap<MessageId, Arc<Vec<u8>>>>,
}

impl LiteralStore for MemoryLiteralStore {
    fn get(&self, id: &MessageId) -> Result<Vec<u8>, Error> {
        let literal = self
            .literals
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or(Error::NxMessage)?;
        Ok(Vec::clone(&literal))
    }

    fn set(&self, id: &MessageId, literal: &[u8]) -> Result<(), Error> {
        self.literals
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::new(literal.to_vec()));
        Ok(())
    }

    fn update(&self, old: &MessageId, new: &MessageId) -> Result<(), Error> {
        let mut literals = self.literals.lock().unwrap();
        let literal = literals.remove(old).ok_or(Error::NxMessage)?;
        literals.insert(new.clone(), literal);
        Ok(())
    }

    fn delete(&self, ids: &[MessageId]) -> Result<(), Error> {
        let mut literals = self.literals.lock().unwrap();
        for id in ids {
            literals.remove(id);
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<MessageId>, Error> {
        Ok(self.literals.lock().unwrap().keys().cloned().collect())
    }

    fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
