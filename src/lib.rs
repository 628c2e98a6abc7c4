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

//! Sans is a DNS forwarder that refuses spoofed responses.
//!
//! Client queries arrive through an I/O provider ([`io`]) and are
//! handled by a [`Listener`](listener::Listener), which hands them to a
//! [`Forwarder`](forward::Forwarder). The forwarder sends each query
//! upstream under a fresh random transaction ID and accepts a response
//! only if it comes from the right server and echoes the question
//! exactly. Forged responses are dropped while the real one is still
//! awaited. Optionally, names are probed for pollution and routed to a
//! trusted upstream ([`route`]).

pub mod class;
pub mod forward;
pub mod io;
pub mod listener;
pub mod message;
pub mod name;
pub mod route;
pub mod rr;
mod util;
