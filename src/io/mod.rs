// Copyright 2021 Matthew Ingwersen.
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

//! I/O providers for running [`Listener`s](crate::listener::Listener).
//!
//! The [`Listener`](crate::listener::Listener) and
//! [`Forwarder`](crate::forward::Forwarder) implement the handling of
//! queries and responses abstracted from how client traffic is
//! received and how the supporting tasks are scheduled. An I/O provider
//! binds the client-facing sockets, receives queries and sends replies,
//! services the forwarder's upstream sockets, and periodically sweeps
//! its pending queries.

use std::time::Duration;

mod tokio;

pub use self::tokio::{TokioIoProvider, TokioShutdownController};

/// How long to wait for a TCP client to send a complete message.
const READ_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);
