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

//! The storage layer.
//!
//! Storage is stateless aside from the SQLite connections and the literal
//! files themselves, and provides the building blocks the state layer
//! composes into actions. The general guidelines are:
//!
//! 1. Every `Txn` method is a single statement or a short sequence of them
//!    which is only meaningful inside the caller's transaction.
//! 2. Nothing in here knows about sessions, snapshots, or the connector.

mod db_migrations;
mod literal_store;
mod mailboxes;
mod messages;
mod metadb;
mod types;

pub use literal_store::{
    open_literal_store, FileLiteralStore, LiteralStore, MemoryLiteralStore,
};
pub use messages::UidRow;
pub use metadb::{MetaDb, Txn};
pub use types::{Mailbox, MailboxMessage, Message, NewMailbox};
