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

//! The per-session state. This is the API used by the IMAP protocol layer.
//!
//! This module tree should be thought of as one large module, as it is very
//! tightly cross-coupled; the main type is `State`, whose very large
//! implementation is split across multiple files for manageability. The
//! actions in `actions` are the only code which talks to the connector on a
//! session's behalf.

mod actions;
mod defs;
mod expunge;
mod fetch;
mod flags;
mod idle;
mod list;
mod mailboxes;
mod messages;
mod search;
mod select;

pub use defs::State;
