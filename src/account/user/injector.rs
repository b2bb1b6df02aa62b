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

use std::sync::Weak;
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use log::{debug, error, warn};

use super::User;
use crate::connector::Update;

/// The body of the injector thread.
///
/// Applies each update the connector sends, one at a time, and sweeps
/// tombstoned messages every `sweep_interval`. Exits when the connector's
/// channel closes, when told to stop, or when the user is gone.
pub(super) fn run(
    user: Weak<User>,
    updates: Receiver<Update>,
    stop: Receiver<()>,
    sweep_interval: Option<Duration>,
) {
    let ticker = match sweep_interval {
        Some(interval) => channel::tick(interval),
        None => channel::never(),
    };

    loop {
        crossbeam::select! {
            recv(updates) -> update => {
                let Ok(update) = update else {
                    return;
                };
                let Some(user) = user.upgrade() else {
                    return;
                };

                debug!("{} Applying {:?}", user.log_prefix, update.kind);
                let result = user.apply_update(&update.kind);
                if let Err(ref e) = result {
                    error!(
                        "{} Failed to apply connector update: {}",
                        user.log_prefix, e
                    );
                }
                update.done(result.map_err(|e| e.to_string()));
            },

            recv(ticker) -> _ => {
                let Some(user) = user.upgrade() else {
                    return;
                };

                if let Err(e) = user.sweep() {
                    warn!("{} Periodic sweep failed: {}", user.log_prefix, e);
                }
            },

            recv(stop) -> _ => return,
        }
    }
}
