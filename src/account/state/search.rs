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

use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use super::defs::*;
use crate::account::{
    model::*,
    search_backend::{self, MessageMetadata, Op, SearchData, SearchNeeds},
    user::User,
};
use crate::support::{
    cancel::CancelToken,
    error::Error,
    log_prefix::LogPrefix,
    threading::{search_parallelism, ScatterGather},
};

/// Counts a search as active for as long as it lives.
struct ActiveSearch<'a> {
    counter: &'a AtomicUsize,
    /// The number of active searches, this one included, when it started.
    concurrent: usize,
}

impl<'a> ActiveSearch<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        let concurrent = counter.fetch_add(1, Ordering::SeqCst) + 1;
        ActiveSearch {
            counter,
            concurrent,
        }
    }
}

impl Drop for ActiveSearch<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Candidate {
    seqnum: Seqnum,
    id: MessageId,
    uid: Uid,
    flags: FlagSet,
}

impl State {
    /// The `SEARCH` and `UID SEARCH` commands.
    ///
    /// Hits are sequence numbers, or UIDs if `is_uid`, in ascending order.
    pub fn search(
        &mut self,
        request: &SearchRequest,
        is_uid: bool,
    ) -> Result<SearchResponse, Error> {
        let (ops, candidates) = {
            let snapshot = self.shared.snapshot.lock().unwrap();
            let snapshot = snapshot.as_ref().ok_or(Error::NotSelected)?;
            let ops = search_backend::compile(request, snapshot)?;
            let candidates = snapshot
                .iter()
                .map(|(seqnum, m)| Candidate {
                    seqnum,
                    id: m.id.clone(),
                    uid: m.uid,
                    flags: m.flags.clone(),
                })
                .collect::<Vec<_>>();
            (ops, candidates)
        };
        let needs = search_backend::want(&ops);

        let active = ActiveSearch::start(&self.user.active_searches);
        let threads = search_parallelism(
            active.concurrent,
            self.user.config.disable_parallelism,
        );

        let user = &*self.user;
        let cancel = &self.cancel;
        let log_prefix = &self.log_prefix;
        let ops = &ops;
        let mut hits = ScatterGather::with_threads(threads)
            .map(candidates, |candidate| {
                search_one(user, cancel, log_prefix, ops, needs, &candidate)
                    .then_some((candidate.seqnum, candidate.uid))
            })
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        drop(active);
        cancel.check()?;

        hits.sort_unstable_by_key(|&(_, uid)| uid);
        Ok(SearchResponse {
            hits: hits
                .into_iter()
                .map(|(seqnum, uid)| {
                    if is_uid {
                        u32::from(uid)
                    } else {
                        u32::from(seqnum)
                    }
                })
                .collect(),
        })
    }
}

/// Evaluates `ops` against one message, loading only the inputs the
/// program needs, and only if the snapshot alone doesn't settle it.
fn search_one(
    user: &User,
    cancel: &CancelToken,
    log_prefix: &LogPrefix,
    ops: &[Op],
    needs: SearchNeeds,
    candidate: &Candidate,
) -> bool {
    let mut data = SearchData {
        uid: Some(candidate.uid),
        flags: Some(candidate.flags.clone()),
        ..SearchData::default()
    };
    if let Some(result) = search_backend::eval(ops, &data) {
        return result;
    }

    let result = load(user, cancel, needs, &candidate.id, &mut data)
        .map(|()| search_backend::eval(ops, &data).unwrap_or(false));
    match result {
        Ok(hit) => hit,
        // Gone since the snapshot was taken
        Err(Error::NxMessage) | Err(Error::Cancelled) => false,
        Err(e) => {
            warn!(
                "{} Error evaluating UID {} for search: {}",
                log_prefix,
                u32::from(candidate.uid),
                e
            );
            false
        },
    }
}

fn load(
    user: &User,
    cancel: &CancelToken,
    needs: SearchNeeds,
    id: &MessageId,
    data: &mut SearchData,
) -> Result<(), Error> {
    if needs.contains(SearchNeeds::METADATA) {
        let message = user
            .db
            .read(cancel, |txn| txn.message(id))?
            .ok_or(Error::NxMessage)?;
        data.metadata = Some(MessageMetadata {
            size: message.size,
            internal_date: message.date,
        });
    }

    if needs.intersects(SearchNeeds::HEADERS | SearchNeeds::CONTENT) {
        cancel.check()?;
        let literal = user.literals.get(id)?;
        data.load_literal(needs, &literal);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use chrono::NaiveDate;

    use super::*;

    fn search(
        state: &mut State,
        queries: Vec<SearchQuery>,
        is_uid: bool,
    ) -> Vec<u32> {
        state
            .search(
                &SearchRequest {
                    charset: None,
                    queries,
                },
                is_uid,
            )
            .unwrap()
            .hits
    }

    fn fixture() -> TestFixture {
        let fixture = TestFixture::new();
        fixture.create(&["A"]);
        fixture.append_with_flags("A", "one", &[Flag::Seen]);
        fixture.append("A", "two");
        fixture.append_with_flags("A", "three", &[Flag::Flagged]);
        fixture
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn search_flags() {
        let fixture = fixture();
        let mut state = fixture.state();
        state.select("A").unwrap();

        assert_eq!(vec![1, 2, 3], search(&mut state, vec![], false));
        assert_eq!(vec![1], search(&mut state, vec![SearchQuery::Seen], false));
        assert_eq!(
            vec![2, 3],
            search(&mut state, vec![SearchQuery::Unseen], false)
        );
        assert_eq!(
            vec![1, 3],
            search(
                &mut state,
                vec![SearchQuery::Or(
                    Box::new(SearchQuery::Seen),
                    Box::new(SearchQuery::Flagged),
                )],
                false
            )
        );
        assert_eq!(
            vec![2],
            search(
                &mut state,
                vec![SearchQuery::Unseen, SearchQuery::Unflagged],
                false
            )
        );
        assert_eq!(vec![2, 3], search(&mut state, vec![SearchQuery::New], true));
        assert!(search(&mut state, vec![SearchQuery::Old], false).is_empty());
        assert!(search(
            &mut state,
            vec![SearchQuery::Keyword("$Junk".to_owned())],
            false
        )
        .is_empty());
        assert_eq!(
            vec![1, 2, 3],
            search(
                &mut state,
                vec![SearchQuery::Unkeyword("$Junk".to_owned())],
                false
            )
        );
        // Not a keyword any message could have
        assert!(search(
            &mut state,
            vec![SearchQuery::Keyword("\\Bogus".to_owned())],
            false
        )
        .is_empty());
        assert_eq!(0, fixture.user().active_searches.load(Ordering::SeqCst));
    }

    #[test]
    fn search_content() {
        let fixture = fixture();
        let mut state = fixture.state();
        state.select("A").unwrap();

        assert_eq!(
            vec![2],
            search(&mut state, vec![SearchQuery::Subject(b"TWO".to_vec())], false)
        );
        assert_eq!(
            vec![1, 2, 3],
            search(&mut state, vec![SearchQuery::From(b"alice".to_vec())], false)
        );
        assert!(search(&mut state, vec![SearchQuery::Cc(b"alice".to_vec())], false)
            .is_empty());
        assert_eq!(
            vec![3],
            search(
                &mut state,
                vec![SearchQuery::Body(b"about three".to_vec())],
                false
            )
        );
        assert_eq!(
            vec![1, 2, 3],
            search(&mut state, vec![SearchQuery::Text(b"bob@example".to_vec())], false)
        );
        assert_eq!(
            vec![1],
            search(
                &mut state,
                vec![SearchQuery::Header(
                    "subject".to_owned(),
                    b"one".to_vec()
                )],
                false
            )
        );

        assert_eq!(
            vec![3],
            state
                .search(
                    &SearchRequest {
                        charset: Some("ISO-8859-1".to_owned()),
                        queries: vec![SearchQuery::Subject(b"thr".to_vec())],
                    },
                    true
                )
                .unwrap()
                .hits
        );
        assert_matches!(
            Err(Error::BadCharset),
            state.search(
                &SearchRequest {
                    charset: Some("no-such-charset".to_owned()),
                    queries: vec![SearchQuery::Subject(b"x".to_vec())],
                },
                false
            )
        );
    }

    #[test]
    fn search_dates_and_sizes() {
        let fixture = fixture();
        let mut state = fixture.state();
        state.select("A").unwrap();

        assert_eq!(
            vec![1, 2, 3],
            search(&mut state, vec![SearchQuery::SentOn(date(1994, 11, 15))], false)
        );
        assert!(search(
            &mut state,
            vec![SearchQuery::SentBefore(date(1994, 11, 15))],
            false
        )
        .is_empty());
        assert_eq!(
            vec![1, 2, 3],
            search(
                &mut state,
                vec![SearchQuery::SentSince(date(1994, 11, 15))],
                false
            )
        );

        // Appended without a date, so internally dated now
        assert!(search(&mut state, vec![SearchQuery::Before(date(2000, 1, 1))], false)
            .is_empty());
        assert_eq!(
            vec![1, 2, 3],
            search(&mut state, vec![SearchQuery::Since(date(2000, 1, 1))], false)
        );

        assert_eq!(
            vec![1, 2, 3],
            search(&mut state, vec![SearchQuery::Larger(10)], false)
        );
        assert!(search(&mut state, vec![SearchQuery::Smaller(10)], false)
            .is_empty());
    }

    #[test]
    fn search_sets_after_expunge() {
        let fixture = fixture();
        let mut state = fixture.state();
        state.select("A").unwrap();
        state
            .store(&StoreRequest {
                ids: &SequenceSet::just(1),
                is_uid: false,
                op: FlagOp::Add,
                flags: &[Flag::Deleted],
                silent: true,
            })
            .unwrap();
        state.expunge().unwrap();
        state.noop().unwrap();

        assert_eq!(
            vec![2],
            search(&mut state, vec![SearchQuery::UidSet(SequenceSet::just(3))], false)
        );
        assert_eq!(
            vec![3],
            search(&mut state, vec![SearchQuery::UidSet(SequenceSet::just(3))], true)
        );
        assert_eq!(
            vec![2, 3],
            search(
                &mut state,
                vec![SearchQuery::SequenceSet(SequenceSet::all())],
                true
            )
        );
        assert_eq!(
            vec![1],
            search(
                &mut state,
                vec![SearchQuery::Not(Box::new(SearchQuery::SequenceSet(
                    SequenceSet::just(2)
                )))],
                false
            )
        );
    }

    #[test]
    fn search_requires_selection() {
        let fixture = fixture();
        let mut state = fixture.state();
        assert_matches!(
            Err(Error::NotSelected),
            state.search(&SearchRequest::default(), false)
        );
    }
}
