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

//! Utilities for working with threads.
//!
//! Workers are spun up on demand inside a `crossbeam::scope` and torn down
//! before the call returns. Nothing keeps threads around between operations;
//! most of the time a session is idle and a FETCH or SEARCH touching a
//! handful of messages never leaves the calling thread.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

lazy_static! {
    /// The default per-FETCH parallelism.
    ///
    /// Read once from `MIRRORMAP_FETCH_CONCURRENCY`, falling back to the
    /// number of CPUs.
    pub static ref FETCH_CONCURRENCY: usize =
        std::env::var("MIRRORMAP_FETCH_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
            .unwrap_or_else(num_cpus::get);
}

/// The parallelism a search should use given how many searches are running
/// for the same user.
pub fn search_parallelism(active_searches: usize, disabled: bool) -> usize {
    if disabled {
        1
    } else {
        (num_cpus::get() / active_searches.max(1)).max(1)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScatterGather {
    /// The number of items processed at a time.
    ///
    /// This is used as a control to reduce the frequency at which the
    /// scatter-gather operation must check the system clock.
    pub batch_size: usize,
    /// Interval over which a scatter-gather operation will escalate the
    /// amount of resources dedicated to the operation.
    pub escalate: Duration,
    /// The maximum number of inputs to buffer.
    pub buffer_size: usize,
    /// The maximum number of worker threads.
    pub max_threads: usize,
}

impl ScatterGather {
    pub fn with_threads(max_threads: usize) -> Self {
        Self {
            batch_size: 4,
            escalate: Duration::from_millis(5),
            buffer_size: 64,
            max_threads: max_threads.max(1),
        }
    }

    /// Run a possibly concurrent "scatter gather" operation.
    ///
    /// Items are pulled from `items`, processed (possibly concurrently) by
    /// `mapper`, and finally reduced serially by `reduce`. The order in which
    /// `reduce` sees outputs is unspecified.
    ///
    /// This initially runs in single-threaded operation. If the `escalate`
    /// duration is exceeded, it switches to multi-threaded mode, and the host
    /// thread simply acts as a task distributor.
    ///
    /// Once this call returns, any threads that were spawned have been cleaned
    /// up.
    pub fn run<I: IntoIterator, O>(
        self,
        inputs: I,
        mapper: impl Fn(I::Item) -> O + Send + Sync,
        mut reduce: impl FnMut(O) + Send,
    ) where
        I::Item: Send,
    {
        let mut period_start = Instant::now();
        let mut inputs = inputs.into_iter();
        let max_threads = self.max_threads;

        // Single-threaded mode
        loop {
            for _ in 0..self.batch_size {
                match inputs.next() {
                    None => return,
                    Some(input) => reduce(mapper(input)),
                }
            }

            if max_threads > 1 {
                let now = Instant::now();
                if now.duration_since(period_start) > self.escalate {
                    period_start = now;
                    break;
                }
            }
        }

        // Enter multi-threaded mode
        let reduce = Mutex::new(reduce);
        let mut current_threads = 0;
        let mut target_threads = 2.min(max_threads);
        let (input_send, input_recv) =
            crossbeam::channel::bounded(self.buffer_size);

        let _ = crossbeam::scope(|s| loop {
            while current_threads < target_threads {
                let input_recv = input_recv.clone();
                let mapper = &mapper;
                let reduce = &reduce;
                s.spawn(move |_| {
                    for input in input_recv.iter() {
                        let output = mapper(input);
                        let mut reduce = reduce.lock().unwrap();
                        (*reduce)(output);
                    }
                });
                current_threads += 1;
            }

            for _ in 0..self.batch_size {
                match inputs.next() {
                    None => {
                        drop(input_send);
                        return;
                    },
                    Some(input) => {
                        if input_send.send(input).is_err() {
                            return;
                        }
                    },
                }
            }

            let now = Instant::now();
            if now.duration_since(period_start) > self.escalate {
                target_threads =
                    target_threads.saturating_mul(2).min(max_threads);
                period_start = now;
            }
        });
    }

    /// Map every input through `mapper`, returning the outputs in input
    /// order.
    pub fn map<T: Send, O: Send>(
        self,
        inputs: Vec<T>,
        mapper: impl Fn(T) -> O + Send + Sync,
    ) -> Vec<O> {
        let mut outputs = Vec::with_capacity(inputs.len());
        self.run(
            inputs.into_iter().enumerate(),
            |(ix, input)| (ix, mapper(input)),
            |output| outputs.push(output),
        );
        outputs.sort_unstable_by_key(|&(ix, _)| ix);
        outputs.into_iter().map(|(_, o)| o).collect()
    }
}
