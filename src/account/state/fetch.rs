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

use std::sync::Arc;

use super::defs::*;
use crate::account::{model::*, user::User};
use crate::mime::parse::fetch_section;
use crate::support::{
    cancel::CancelToken,
    error::Error,
    threading::{ScatterGather, FETCH_CONCURRENCY},
};

/// One message a `FETCH` is looking at.
struct Target {
    seqnum: Seqnum,
    id: MessageId,
    uid: Uid,
    /// The flags as the client will know them once this fetch is done.
    flags: FlagSet,
    /// Whether this fetch is what set `\Seen`.
    newly_seen: bool,
}

impl State {
    /// The `FETCH` and `UID FETCH` commands.
    ///
    /// Responses are in sequence order. Fetching a body section without
    /// `PEEK` sets `\Seen` (silently, since the change is reported as part
    /// of the response) unless the mailbox is read-only.
    pub fn fetch(
        &mut self,
        request: &FetchRequest,
    ) -> Result<Vec<FetchResponse>, Error> {
        let mailbox = self.selected_mailbox_id()?;
        let mut targets = {
            let snapshot = self.shared.snapshot.lock().unwrap();
            let snapshot = snapshot.as_ref().ok_or(Error::NotSelected)?;
            snapshot
                .messages_in_range(&request.ids, request.is_uid)?
                .into_iter()
                .map(|(seqnum, m)| Target {
                    seqnum,
                    id: m.id.clone(),
                    uid: m.uid,
                    flags: m.flags.clone(),
                    newly_seen: false,
                })
                .collect::<Vec<_>>()
        };
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let sets_seen = !self.read_only
            && request.attrs.iter().any(|attr| {
                matches!(*attr, FetchAttr::BodySection { peek: false, .. })
            });
        if sets_seen {
            let unseen = targets
                .iter()
                .filter(|t| !t.flags.contains(&Flag::Seen))
                .map(|t| t.id.clone())
                .collect::<Vec<_>>();
            if !unseen.is_empty() {
                self.store_action(
                    &mailbox,
                    &unseen,
                    FlagOp::Add,
                    &FlagSet::new().with(Flag::Seen),
                    request.is_uid,
                    true,
                )?;
                for target in &mut targets {
                    target.newly_seen = target.flags.insert(Flag::Seen);
                }
            }
        }

        let threads = if self.user.config.disable_parallelism {
            1
        } else {
            *FETCH_CONCURRENCY
        };
        let user = Arc::clone(&self.user);
        let cancel = &self.cancel;
        ScatterGather::with_threads(threads)
            .map(targets, |target| fetch_one(&user, cancel, request, target))
            .into_iter()
            .collect()
    }
}

fn fetch_one(
    user: &User,
    cancel: &CancelToken,
    request: &FetchRequest,
    target: Target,
) -> Result<FetchResponse, Error> {
    let attrs = &request.attrs;
    let needs_row = attrs.iter().any(|attr| {
        matches!(
            *attr,
            FetchAttr::InternalDate
                | FetchAttr::Rfc822Size
                | FetchAttr::Envelope
                | FetchAttr::Body
                | FetchAttr::BodyStructure
        )
    });
    let needs_literal = attrs
        .iter()
        .any(|attr| matches!(*attr, FetchAttr::BodySection { .. }));

    let message = if needs_row {
        Some(
            user.db
                .read(cancel, |txn| txn.message(&target.id))?
                .ok_or(Error::NxMessage)?,
        )
    } else {
        None
    };
    let literal = if needs_literal {
        Some(user.literals.get(&target.id)?)
    } else {
        None
    };
    let row = || message.as_ref().ok_or(Error::NxMessage);

    let mut items = Vec::with_capacity(attrs.len() + 2);
    if request.is_uid && !attrs.contains(&FetchAttr::Uid) {
        items.push(FetchedItem::Uid(target.uid));
    }

    for attr in attrs {
        items.push(match *attr {
            FetchAttr::Uid => FetchedItem::Uid(target.uid),
            FetchAttr::Flags => FetchedItem::Flags(target.flags.clone()),
            FetchAttr::InternalDate => FetchedItem::InternalDate(row()?.date),
            FetchAttr::Rfc822Size => FetchedItem::Rfc822Size(row()?.size),
            FetchAttr::Envelope => {
                FetchedItem::Envelope(row()?.envelope.to_imap())
            },
            FetchAttr::Body => FetchedItem::Body(row()?.body.clone()),
            FetchAttr::BodyStructure => {
                FetchedItem::BodyStructure(row()?.body_structure.clone())
            },
            FetchAttr::BodySection {
                ref section,
                partial,
                ..
            } => {
                let literal = literal.as_deref().ok_or(Error::NxMessage)?;
                body_section(literal, section, partial)?
            },
        });
    }

    if target.newly_seen && !attrs.contains(&FetchAttr::Flags) {
        items.push(FetchedItem::Flags(target.flags));
    }

    Ok(FetchResponse {
        seqnum: target.seqnum,
        items,
    })
}

fn body_section(
    literal: &[u8],
    section: &Section,
    partial: Option<(u32, u32)>,
) -> Result<FetchedItem, Error> {
    let data = fetch_section(literal, section)?;
    let Some((origin, length)) = partial else {
        return Ok(FetchedItem::BodySection {
            section: section.clone(),
            origin: None,
            data,
        });
    };

    let start = (origin as usize).min(data.len());
    let end = start.saturating_add(length as usize).min(data.len());
    Ok(FetchedItem::BodySection {
        section: section.clone(),
        origin: Some(origin),
        data: data[start..end].to_vec(),
    })
}
