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

//! The table of in-flight upstream queries.
//!
//! Every query the forwarder sends upstream is registered here as a
//! [`PendingQuery`] until a response is accepted for it, it times out,
//! or the task waiting for it goes away. Entries live in a [`Slab`]
//! arena and are indexed both by (transaction ID, upstream address) and
//! by transaction ID alone; the latter lets a response from the wrong
//! source still find the query it claims to answer, so that it can be
//! rejected rather than ignored.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::message::Question;
use crate::util::canonical_socket_addr;

////////////////////////////////////////////////////////////////////////
// PENDING QUERIES                                                    //
////////////////////////////////////////////////////////////////////////

/// A query that has been sent upstream and awaits a response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingQuery {
    /// The transaction ID used on the upstream query.
    pub id: u16,

    /// The question as sent upstream, including any case
    /// randomization of the QNAME.
    pub question: Question,

    /// Where the original query came from.
    pub client: SocketAddr,

    /// The upstream server the query was sent to.
    pub upstream: SocketAddr,

    pub sent_at: Instant,

    pub kind: QueryKind,
}

/// Why a query was sent upstream.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum QueryKind {
    /// The query is relayed on behalf of a client.
    Relay,

    /// The query probes whether a name is polluted.
    Probe,
}

/// Identifies a registered entry. Tokens are never reused: once the
/// entry is gone, the token no longer refers to anything, even if the
/// arena slot is occupied again.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Token {
    index: usize,
    serial: u64,
}

////////////////////////////////////////////////////////////////////////
// MATCHER                                                            //
////////////////////////////////////////////////////////////////////////

/// The synchronized table of [`PendingQuery`] entries.
///
/// Each entry carries a payload of type `P` alongside the query; the
/// forwarder uses it to hold the channel on which the waiting task
/// receives its response. All operations take the table lock for the
/// duration of the call only.
pub struct Matcher<P> {
    table: Mutex<Table<P>>,
    capacity: usize,
}

struct Table<P> {
    entries: Slab<Entry<P>>,
    by_key: HashMap<(u16, SocketAddr), usize>,
    by_id: HashMap<u16, Vec<usize>>,
    next_serial: u64,
}

struct Entry<P> {
    query: PendingQuery,
    payload: P,
    serial: u64,
}

impl<P> Matcher<P> {
    /// Creates an empty `Matcher` that holds at most `capacity`
    /// entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(Table {
                entries: Slab::new(),
                by_key: HashMap::new(),
                by_id: HashMap::new(),
                next_serial: 0,
            }),
            capacity,
        }
    }

    /// Registers `query`. This fails if a query with the same ID is
    /// already pending for the same upstream, or if the table is full.
    pub fn register(&self, mut query: PendingQuery, payload: P) -> Result<Token, RegisterError> {
        query.upstream = canonical_socket_addr(query.upstream);
        let key = (query.id, query.upstream);
        let mut table = self.lock();
        if table.by_key.contains_key(&key) {
            return Err(RegisterError::DuplicateId);
        } else if table.entries.len() >= self.capacity {
            return Err(RegisterError::Full);
        }

        let serial = table.next_serial;
        table.next_serial += 1;
        let index = table.entries.insert(Entry {
            query,
            payload,
            serial,
        });
        table.by_key.insert(key, index);
        table.by_id.entry(key.0).or_default().push(index);
        Ok(Token { index, serial })
    }

    /// Finds the pending query that a response with transaction ID `id`
    /// received from `source` claims to answer. The entry sent to
    /// `source` is preferred; failing that, any entry with the same ID
    /// is returned, so that validation can reject the response's
    /// source. The table is not modified.
    pub fn lookup(&self, id: u16, source: SocketAddr) -> Option<(Token, PendingQuery)> {
        let source = canonical_socket_addr(source);
        let table = self.lock();
        let index = match table.by_key.get(&(id, source)) {
            Some(index) => *index,
            None => *table.by_id.get(&id)?.first()?,
        };
        let entry = &table.entries[index];
        Some((
            Token {
                index,
                serial: entry.serial,
            },
            entry.query.clone(),
        ))
    }

    /// Removes the entry identified by `token`, returning it if it was
    /// still present. Clearing an entry twice is harmless.
    pub fn clear(&self, token: Token) -> Option<(PendingQuery, P)> {
        let mut table = self.lock();
        match table.entries.get(token.index) {
            Some(entry) if entry.serial == token.serial => Some(table.remove(token.index)),
            _ => None,
        }
    }

    /// Removes and returns every entry that was sent at least `max_age`
    /// before `now`.
    pub fn purge_expired(&self, now: Instant, max_age: Duration) -> Vec<(PendingQuery, P)> {
        let mut table = self.lock();
        let expired: Vec<usize> = table
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.query.sent_at) >= max_age)
            .map(|(index, _)| index)
            .collect();
        expired.into_iter().map(|index| table.remove(index)).collect()
    }

    /// Returns the number of pending queries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the maximum number of pending queries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<Table<P>> {
        // The table is consistent after every operation, so a panic
        // elsewhere while holding the lock leaves nothing half-done.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P> Table<P> {
    /// Removes the entry at `index` along with its index records.
    /// `index` must be occupied.
    fn remove(&mut self, index: usize) -> (PendingQuery, P) {
        let entry = self.entries.remove(index);
        let id = entry.query.id;
        self.by_key.remove(&(id, entry.query.upstream));
        if let Some(indices) = self.by_id.get_mut(&id) {
            indices.retain(|i| *i != index);
            if indices.is_empty() {
                self.by_id.remove(&id);
            }
        }
        (entry.query, entry.payload)
    }
}

impl<P> fmt::Debug for Matcher<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signaling that a query could not be registered.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RegisterError {
    /// A query with the same transaction ID is already pending for the
    /// same upstream. The caller should pick a new ID.
    DuplicateId,

    /// The table is at capacity.
    Full,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::DuplicateId => f.write_str("transaction ID already pending for upstream"),
            Self::Full => f.write_str("pending query table is full"),
        }
    }
}

impl std::error::Error for RegisterError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::class::Class;
    use crate::rr::Type;

    pub(crate) fn pending(id: u16, upstream: &str, sent_at: Instant) -> PendingQuery {
        PendingQuery {
            id,
            question: Question {
                qname: "example.test.".parse().unwrap(),
                qtype: Type::A,
                qclass: Class::IN,
            },
            client: "127.0.0.1:40000".parse().unwrap(),
            upstream: upstream.parse().unwrap(),
            sent_at,
            kind: QueryKind::Relay,
        }
    }

    #[test]
    fn register_rejects_duplicate_id_for_same_upstream() {
        let matcher = Matcher::new(8);
        let now = Instant::now();
        matcher.register(pending(1234, "192.0.2.1:53", now), ()).unwrap();
        assert_eq!(
            matcher.register(pending(1234, "192.0.2.1:53", now), ()),
            Err(RegisterError::DuplicateId),
        );
        assert!(matcher.register(pending(1234, "192.0.2.2:53", now), ()).is_ok());
        assert!(matcher.register(pending(1235, "192.0.2.1:53", now), ()).is_ok());
        assert_eq!(matcher.len(), 3);
    }

    #[test]
    fn register_treats_mapped_addresses_as_ipv4() {
        let matcher = Matcher::new(8);
        let now = Instant::now();
        matcher.register(pending(7, "192.0.2.1:53", now), ()).unwrap();
        assert_eq!(
            matcher.register(pending(7, "[::ffff:192.0.2.1]:53", now), ()),
            Err(RegisterError::DuplicateId),
        );
    }

    #[test]
    fn register_fails_when_full() {
        let matcher = Matcher::new(2);
        let now = Instant::now();
        matcher.register(pending(1, "192.0.2.1:53", now), ()).unwrap();
        matcher.register(pending(2, "192.0.2.1:53", now), ()).unwrap();
        assert_eq!(
            matcher.register(pending(3, "192.0.2.1:53", now), ()),
            Err(RegisterError::Full),
        );
        assert_eq!(matcher.capacity(), 2);
    }

    #[test]
    fn lookup_prefers_matching_source_and_falls_back_to_id() {
        let matcher = Matcher::new(8);
        let now = Instant::now();
        let a = matcher.register(pending(1234, "192.0.2.1:53", now), 'a').unwrap();
        let b = matcher.register(pending(1234, "192.0.2.2:53", now), 'b').unwrap();

        let (token, query) = matcher.lookup(1234, "192.0.2.2:53".parse().unwrap()).unwrap();
        assert_eq!(token, b);
        assert_eq!(query.upstream, "192.0.2.2:53".parse().unwrap());

        let (token, _) = matcher.lookup(1234, "198.51.100.9:53".parse().unwrap()).unwrap();
        assert_eq!(token, a);

        assert!(matcher.lookup(4321, "192.0.2.1:53".parse().unwrap()).is_none());
        assert_eq!(matcher.len(), 2);
    }

    #[test]
    fn clear_is_idempotent_and_ignores_stale_tokens() {
        let matcher = Matcher::new(8);
        let now = Instant::now();
        let token = matcher.register(pending(1, "192.0.2.1:53", now), "first").unwrap();
        let (query, payload) = matcher.clear(token).unwrap();
        assert_eq!(query.id, 1);
        assert_eq!(payload, "first");
        assert!(matcher.clear(token).is_none());

        // The slot is reused, but the old token must not remove the new
        // entry.
        let newer = matcher.register(pending(1, "192.0.2.1:53", now), "second").unwrap();
        assert!(matcher.clear(token).is_none());
        assert_eq!(matcher.len(), 1);
        assert!(matcher.clear(newer).is_some());
        assert!(matcher.is_empty());
        assert!(matcher.lookup(1, "192.0.2.1:53".parse().unwrap()).is_none());
    }

    #[test]
    fn purge_expired_removes_only_old_entries() {
        let matcher = Matcher::new(8);
        let start = Instant::now();
        matcher.register(pending(1, "192.0.2.1:53", start), ()).unwrap();
        let young = matcher
            .register(pending(2, "192.0.2.1:53", start + Duration::from_secs(5)), ())
            .unwrap();

        let purged = matcher.purge_expired(start + Duration::from_secs(6), Duration::from_secs(2));
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].0.id, 1);
        assert!(matcher.lookup(1, "192.0.2.1:53".parse().unwrap()).is_none());
        assert_eq!(matcher.lookup(2, "192.0.2.1:53".parse().unwrap()).unwrap().0, young);
    }
}
