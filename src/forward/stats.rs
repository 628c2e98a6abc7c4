// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Counters of forwarding outcomes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counts of what happened to upstream queries and responses.
#[derive(Debug, Default)]
pub struct Stats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    unmatched: AtomicU64,
    malformed: AtomicU64,
    timed_out: AtomicU64,
    upstream_errors: AtomicU64,
}

/// A point-in-time copy of [`Stats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Snapshot {
    pub delivered: u64,
    pub dropped: u64,
    pub unmatched: u64,
    pub malformed: u64,
    pub timed_out: u64,
    pub upstream_errors: u64,
}

impl Stats {
    pub(super) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_unmatched(&self) {
        self.unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_timed_out(&self, n: usize) {
        self.timed_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(super) fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "delivered={} dropped={} unmatched={} malformed={} timed_out={} upstream_errors={}",
            self.delivered,
            self.dropped,
            self.unmatched,
            self.malformed,
            self.timed_out,
            self.upstream_errors,
        )
    }
}
