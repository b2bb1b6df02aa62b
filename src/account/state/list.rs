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

use std::collections::BTreeMap;

use itertools::Itertools;

use super::defs::*;
use crate::account::model::*;
use crate::support::{
    error::Error,
    mailbox_paths::{superiors, ListPattern},
};

/// A name `LIST` can report.
#[derive(Debug)]
struct Entry {
    attributes: Vec<String>,
    subscribed: bool,
}

impl Entry {
    fn noselect(subscribed: bool) -> Self {
        Entry {
            attributes: vec![NOSELECT.to_owned()],
            subscribed,
        }
    }
}

impl State {
    /// The `LIST` and `LSUB` commands.
    ///
    /// An empty pattern asks for the hierarchy root of the reference.
    pub fn list(
        &mut self,
        request: &ListRequest,
    ) -> Result<Vec<ListResponse>, Error> {
        let delim = self.user.config.delimiter;
        if request.pattern.is_empty() {
            return Ok(vec![ListResponse {
                name: list_root(&request.reference, delim),
                delimiter: delim,
                attributes: vec![NOSELECT.to_owned()],
            }]);
        }

        let entries = self.list_entries()?;
        let pattern = ListPattern::new(&request.reference, &request.pattern, delim);
        let respond = |name: &str, attributes: &[String]| ListResponse {
            name: name.to_owned(),
            delimiter: delim,
            attributes: attributes.to_vec(),
        };

        if !request.subscribed {
            return Ok(entries
                .iter()
                .filter(|&(name, _)| pattern.is_match(name))
                .map(|(name, entry)| respond(name, &entry.attributes))
                .collect());
        }

        // A subscribed mailbox below a `%` wildcard shows up as its matched
        // superior, unless that superior is itself subscribed
        let mut found = BTreeMap::<&str, Vec<String>>::new();
        for (name, entry) in entries.iter().filter(|&(_, e)| e.subscribed) {
            match pattern.matched(name) {
                Some(matched) if matched == name => {
                    found.insert(name.as_str(), entry.attributes.clone());
                },
                Some(matched) => {
                    let superior_subscribed =
                        entries.get(matched).is_some_and(|e| e.subscribed);
                    if !superior_subscribed {
                        found
                            .entry(matched)
                            .or_insert_with(|| vec![NOSELECT.to_owned()]);
                    }
                },
                None => (),
            }
        }

        Ok(found
            .into_iter()
            .map(|(name, attributes)| respond(name, &attributes))
            .collect())
    }

    /// Gathers every mailbox, every implied superior, and every subscription
    /// outliving its mailbox.
    fn list_entries(&self) -> Result<BTreeMap<String, Entry>, Error> {
        let delim = self.user.config.delimiter;
        let (mailboxes, tombstones) = self.user.db.read(&self.cancel, |txn| {
            let mut mailboxes = Vec::new();
            for mailbox in txn.all_mailboxes()? {
                let (_, recent, _) = txn.mailbox_counts(&mailbox.id)?;
                mailboxes.push((mailbox, recent));
            }
            Ok((mailboxes, txn.deleted_subscriptions()?))
        })?;

        let mut entries = BTreeMap::new();
        for &(ref mailbox, recent) in &mailboxes {
            let mut attributes = mailbox.attributes.clone();
            attributes.push(
                if recent > 0 { MARKED } else { UNMARKED }.to_owned(),
            );
            entries.insert(
                mailbox.name.clone(),
                Entry {
                    attributes,
                    subscribed: mailbox.subscribed,
                },
            );
        }

        let implied = mailboxes
            .iter()
            .flat_map(|&(ref m, _)| superiors(&m.name, delim))
            .unique()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        for name in implied {
            entries.entry(name).or_insert_with(|| Entry::noselect(false));
        }

        for (name, _) in tombstones {
            entries
                .entry(name)
                .and_modify(|e| e.subscribed = true)
                .or_insert_with(|| Entry::noselect(true));
        }

        Ok(entries)
    }
}

/// The hierarchy root `LIST ref ""` reports.
fn list_root(reference: &str, delim: char) -> String {
    if reference.starts_with(delim) {
        return delim.to_string();
    }

    match reference.find(delim) {
        Some(ix) => reference[..ix + delim.len_utf8()].to_owned(),
        None => String::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn list(state: &mut State, pattern: &str, subscribed: bool) -> Vec<String> {
        state
            .list(&ListRequest {
                reference: String::new(),
                pattern: pattern.to_owned(),
                subscribed,
            })
            .unwrap()
            .into_iter()
            .map(|r| format!("{} {}", r.name, r.attributes.join(" ")))
            .collect()
    }

    #[test]
    fn root_discovery() {
        let fixture = TestFixture::new();
        fixture.create(&["A", "B/C", "B/D"]);
        let mut state = fixture.state();

        assert_eq!(
            vec![ListResponse {
                name: String::new(),
                delimiter: '/',
                attributes: vec![NOSELECT.to_owned()],
            }],
            state
                .list(&ListRequest {
                    reference: String::new(),
                    pattern: String::new(),
                    subscribed: false,
                })
                .unwrap()
        );

        assert_eq!("", list_root("", '/'));
        assert_eq!("/", list_root("/foo/bar", '/'));
        assert_eq!("foo/", list_root("foo/bar", '/'));
        assert_eq!("", list_root("foo", '/'));
    }

    #[test]
    fn wildcards_and_superiors() {
        let fixture = TestFixture::new();
        fixture.create(&["A", "B/C", "B/D"]);
        fixture.append("A", "new");
        let mut state = fixture.state();

        assert_eq!(
            vec![
                "A \\Marked",
                "B \\Unmarked",
                "B/C \\Unmarked",
                "B/D \\Unmarked",
            ],
            list(&mut state, "*", false)
        );
        assert_eq!(vec!["A \\Marked", "B \\Unmarked"], list(&mut state, "%", false));
        assert_eq!(vec!["B/C \\Unmarked"], list(&mut state, "B/%C", false));

        state
            .list(&ListRequest {
                reference: "B".to_owned(),
                pattern: "%".to_owned(),
                subscribed: false,
            })
            .unwrap()
            .iter()
            .for_each(|r| assert!(r.name.starts_with("B/")));
    }

    #[test]
    fn interior_nodes_are_noselect() {
        let fixture = TestFixture::new();
        fixture.create(&["X/Y"]);
        let mut state = fixture.state();
        // Creating X/Y made X too, so drop it to leave a gap
        state.delete("X").unwrap();

        assert_eq!(
            vec!["X \\Noselect", "X/Y \\Unmarked"],
            list(&mut state, "*", false)
        );
    }

    #[test]
    fn lsub_reports_partial_matches() {
        let fixture = TestFixture::new();
        fixture.create(&["A", "B/C", "B/D"]);
        let mut state = fixture.state();
        state.unsubscribe("B").unwrap();
        state.unsubscribe("B/D").unwrap();

        assert_eq!(
            vec!["A \\Unmarked", "B/C \\Unmarked"],
            list(&mut state, "*", true)
        );
        assert_eq!(
            vec!["A \\Unmarked", "B \\Noselect"],
            list(&mut state, "%", true)
        );

        state.unsubscribe("A").unwrap();
        state.subscribe("B").unwrap();
        assert_eq!(vec!["B \\Unmarked"], list(&mut state, "%", true));
    }

    #[test]
    fn deleted_subscribed_mailbox_stays_in_lsub() {
        let fixture = TestFixture::new();
        fixture.create(&["A", "B"]);
        let mut state = fixture.state();

        assert!(!state.delete("A").unwrap());
        assert_eq!(
            vec!["A \\Noselect", "B \\Unmarked"],
            list(&mut state, "*", true)
        );
        assert_eq!(
            vec!["A \\Noselect", "B \\Unmarked"],
            list(&mut state, "*", false)
        );

        state.unsubscribe("A").unwrap();
        assert_eq!(vec!["B \\Unmarked"], list(&mut state, "*", true));

        // Recreating the name clears the tombstone
        state.create("B/C").unwrap();
        state.delete("B/C").unwrap();
        state.create("B/C").unwrap();
        assert_eq!(
            vec!["B \\Unmarked", "B/C \\Unmarked"],
            list(&mut state, "*", true)
        );
    }
}
