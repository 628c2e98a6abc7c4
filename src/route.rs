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

//! Per-domain choice of upstream, learned by probing for pollution.
//!
//! Some networks answer queries for certain names with forged
//! responses. Such a name is detected by sending an SOA query for it
//! to a probe server: an honest server answers an SOA query with an
//! SOA record (or nothing), whereas a forger injects an A record. Names
//! found to be polluted are routed to a trusted upstream; all others go
//! to the direct upstream. Verdicts are cached in a [`RouteTable`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use log::warn;

use crate::class::Class;
use crate::message::{writer, Question, Reader, Writer};
use crate::name::Name;
use crate::rr::Type;

/// The default number of names a [`RouteTable`] remembers.
pub const DEFAULT_ROUTE_TABLE_SIZE: usize = 1031;

/// Which upstream a query should be sent to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Route {
    /// The name is clean; use the direct upstream.
    Direct,

    /// The name is polluted; use the trusted upstream.
    Trusted,
}

/// The result of [`RouteTable::decide`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Known(Route),

    /// Nothing is known about the name, so it must be probed.
    Probe,
}

/// A bounded cache of [`Route`] verdicts, keyed by name
/// (case-insensitively).
#[derive(Debug)]
pub struct RouteTable {
    routes: Mutex<HashMap<Name, Route>>,
    capacity: usize,
}

impl RouteTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Decides how to route `question`. Reverse lookups are always
    /// direct.
    pub fn decide(&self, question: &Question) -> Decision {
        if question.qtype == Type::PTR {
            Decision::Known(Route::Direct)
        } else {
            self.get(&question.qname)
                .map_or(Decision::Probe, Decision::Known)
        }
    }

    pub fn get(&self, name: &Name) -> Option<Route> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// Records the verdict for `name`. Returns `false` if the table is
    /// full and `name` was not already present.
    pub fn insert(&self, name: &Name, route: Route) -> bool {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        if routes.len() >= self.capacity && !routes.contains_key(name) {
            warn!("route table full; not remembering {name}");
            false
        } else {
            routes.insert(name.to_lowercase(), route);
            true
        }
    }

    pub fn len(&self) -> usize {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTE_TABLE_SIZE)
    }
}

/// Returns the probe question for `qname`.
pub fn probe_question(qname: &Name) -> Question {
    Question {
        qname: qname.clone(),
        qtype: Type::SOA,
        qclass: Class::IN,
    }
}

/// Serializes a probe query for `question`. The ID is left zero.
pub fn probe_message(question: &Question) -> Result<Vec<u8>, writer::Error> {
    let mut buf = vec![0; 512];
    let mut writer = Writer::try_from(buf.as_mut_slice())?;
    writer.set_rd(true);
    writer.add_question(question)?;
    let len = writer.finish();
    buf.truncate(len);
    Ok(buf)
}

/// Judges a reply to a probe: a reply whose first answer is an A
/// record is forged, so the name is polluted. Unreadable replies count
/// as clean.
pub fn route_from_probe_reply(octets: &[u8]) -> Route {
    let first_answer_type = || -> Result<Option<Type>, crate::message::reader::Error> {
        let mut reader = Reader::try_from(octets)?;
        if reader.ancount() == 0 {
            return Ok(None);
        }
        for _ in 0..reader.qdcount() {
            reader.read_question()?;
        }
        Ok(Some(reader.read_rr()?.rr_type))
    };
    match first_answer_type() {
        Ok(Some(Type::A)) => Route::Trusted,
        _ => Route::Direct,
    }
}
