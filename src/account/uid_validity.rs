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

use std::time::{SystemTime, UNIX_EPOCH};

use super::storage::Txn;
use crate::support::error::Error;

/// Produces UIDVALIDITY values.
///
/// Every value handed out for an account is strictly greater than the one
/// before it, so a mailbox which is deleted and recreated under the same name
/// never presents a UIDVALIDITY a client might have cached.
pub trait UidValidityGenerator: Send + Sync {
    /// Returns the value to use after `last`, or `None` if the space is
    /// exhausted.
    fn next(&self, last: u32) -> Option<u32>;
}

/// Counts up from 1. Mostly useful for tests, where predictable values make
/// for readable assertions.
#[derive(Clone, Copy, Debug, Default)]
pub struct IncrementalGenerator;

impl UidValidityGenerator for IncrementalGenerator {
    fn next(&self, last: u32) -> Option<u32> {
        last.checked_add(1)
    }
}

/// Uses the current UNIX time in seconds, or one more than the last value if
/// that is greater.
#[derive(Clone, Copy, Debug, Default)]
pub struct EpochGenerator;

impl UidValidityGenerator for EpochGenerator {
    fn next(&self, last: u32) -> Option<u32> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let now = u32::try_from(now).unwrap_or(u32::MAX);
        Some(now.max(last.checked_add(1)?))
    }
}

/// Allocates the next UIDVALIDITY value for the account, recording it in the
/// database.
pub fn allocate(
    txn: &Txn<'_>,
    generator: &dyn UidValidityGenerator,
    max: u32,
) -> Result<u32, Error> {
    let last = txn.last_uid_validity()?;
    let next = generator
        .next(last)
        .filter(|&v| v > last && v <= max)
        .ok_or(Error::UidValidityExceeded)?;
    txn.set_last_uid_validity(next)?;
    Ok(next)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::account::storage::MetaDb;
    use crate::support::{cancel::CancelToken, log_prefix::LogPrefix};

    #[test]
    fn generators_are_monotonic() {
        assert_eq!(Some(1), IncrementalGenerator.next(0));
        assert_eq!(None, IncrementalGenerator.next(u32::MAX));

        let now = EpochGenerator.next(0).unwrap();
        assert!(now > 1_600_000_000);
        assert_eq!(Some(u32::MAX - 1), EpochGenerator.next(u32::MAX - 2));
        assert_eq!(None, EpochGenerator.next(u32::MAX));
    }

    #[test]
    fn allocation_respects_cap() {
        let tmpdir = tempfile::TempDir::new().unwrap();
        let db = MetaDb::open(
            &tmpdir.path().join("meta.sqlite"),
            &LogPrefix::new("test".to_owned()),
        )
        .unwrap();
        let cancel = CancelToken::new();

        let allocate_one = || {
            db.write(&cancel, |txn| allocate(txn, &IncrementalGenerator, 2))
        };
        assert_eq!(1, allocate_one().unwrap());
        assert_eq!(2, allocate_one().unwrap());
        assert_matches!(Err(Error::UidValidityExceeded), allocate_one());
        assert_eq!(
            2,
            db.read(&cancel, |txn| txn.last_uid_validity()).unwrap()
        );
    }
}
