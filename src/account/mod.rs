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

//! The per-user mailstore engine.
//!
//! `Backend` owns the users; each `User` owns its database, literal store,
//! connector, and the set of live `State`s, one per IMAP session.

pub mod backend;
pub mod model;
mod responder;
mod search_backend;
mod snapshot;
pub mod state;
mod state_update;
pub mod storage;
pub mod uid_validity;
pub mod user;
