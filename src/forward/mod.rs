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

//! Forwarding of queries to upstream servers with validation of their
//! responses.
//!
//! The [`Forwarder`] sends a query upstream under a fresh random
//! transaction ID, records it in its [`Matcher`], and hands back a
//! [`PendingHandle`] on which the caller waits. Responses arriving from
//! upstream are fed to [`Forwarder::on_response`], which finds the
//! pending query, runs the [`Validator`], and delivers the response to
//! the waiting task only if it passes. Queries that go unanswered are
//! purged by [`Forwarder::sweep`], which the I/O provider runs
//! periodically.

pub mod matcher;
mod stats;
pub mod validator;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::message::{self, Question};
use crate::util::canonical_socket_addr;

pub use matcher::{Matcher, PendingQuery, QueryKind, RegisterError, Token};
pub use stats::{Snapshot, Stats};
pub use validator::{
    AddressPredicate, Blocklist, ParseError, RejectReason, Response, Validator, Verdict,
};

/// How many random transaction IDs to try before giving up on
/// registering a query.
const MAX_ID_ATTEMPTS: usize = 16;

/// The channel on which a waiting task receives its response.
type Delivery = oneshot::Sender<Result<Vec<u8>, Error>>;

////////////////////////////////////////////////////////////////////////
// UPSTREAMS AND CONFIGURATION                                        //
////////////////////////////////////////////////////////////////////////

/// How an upstream server is reached.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Udp => f.write_str("udp"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

/// An upstream DNS server.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Upstream {
    pub address: SocketAddr,
    pub transport: Transport,
}

impl Upstream {
    pub fn udp(address: SocketAddr) -> Self {
        Self {
            address,
            transport: Transport::Udp,
        }
    }

    pub fn tcp(address: SocketAddr) -> Self {
        Self {
            address,
            transport: Transport::Tcp,
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.transport)
    }
}

impl FromStr for Upstream {
    type Err = ParseUpstreamError;

    /// Parses an upstream of the form `IP:PORT`, `IP:PORT/udp` or
    /// `IP:PORT/tcp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, transport) = match s.rsplit_once('/') {
            Some((address, "udp")) => (address, Transport::Udp),
            Some((address, "tcp")) => (address, Transport::Tcp),
            Some(_) => return Err(ParseUpstreamError::UnknownTransport),
            None => (s, Transport::Udp),
        };
        let address = address
            .parse()
            .or(Err(ParseUpstreamError::InvalidAddress))?;
        Ok(Self { address, transport })
    }
}

/// An error signaling that an [`Upstream`] could not be parsed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ParseUpstreamError {
    InvalidAddress,
    UnknownTransport,
}

impl fmt::Display for ParseUpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::InvalidAddress => f.write_str("invalid IP:PORT address"),
            Self::UnknownTransport => f.write_str("transport must be udp or tcp"),
        }
    }
}

impl std::error::Error for ParseUpstreamError {}

/// Configuration for a [`Forwarder`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    /// How long to wait for an upstream response.
    pub timeout: Duration,

    /// The maximum number of queries pending at once.
    pub max_pending: usize,

    /// Whether to randomize the case of query names sent upstream. Only
    /// enable this for upstreams known to echo the QNAME unchanged;
    /// responses from any other are rejected with
    /// [`RejectReason::CaseMismatch`].
    pub case_randomization: bool,

    /// Whether [`Forwarder::exchange`] retries against a secondary
    /// upstream.
    pub retry_secondary: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_pending: 1024,
            case_randomization: false,
            retry_secondary: true,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// FORWARDER                                                          //
////////////////////////////////////////////////////////////////////////

/// A query to be sent upstream.
#[derive(Clone, Copy, Debug)]
pub struct Outbound<'a> {
    /// The serialized query. Its ID is replaced before sending.
    pub message: &'a [u8],

    /// The (only) question of `message`.
    pub question: &'a Question,

    pub client: SocketAddr,
    pub kind: QueryKind,
}

/// What became of a response passed to [`Forwarder::on_response`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Delivered,
    Dropped(RejectReason),
    Unmatched,
    Malformed,
}

/// Relays queries upstream and validates the responses. See the
/// [module-level documentation](self).
pub struct Forwarder {
    config: Config,
    matcher: Matcher<Delivery>,
    validator: Validator,
    stats: Stats,
    udp_v4: Option<Arc<UdpSocket>>,
    udp_v6: Option<Arc<UdpSocket>>,
}

impl Forwarder {
    /// Creates a new `Forwarder`, binding the UDP sockets used to talk
    /// to upstream servers. An IPv6 socket is bound if the host
    /// supports it. This function requires that the Tokio runtime be
    /// active.
    pub async fn bind(config: Config, validator: Validator) -> io::Result<Arc<Self>> {
        let udp_v4 = UdpSocket::bind("0.0.0.0:0").await;
        let udp_v6 = UdpSocket::bind("[::]:0").await;
        let (udp_v4, udp_v6) = match (udp_v4, udp_v6) {
            (Err(e), Err(_)) => return Err(e),
            (v4, v6) => (v4.ok().map(Arc::new), v6.ok().map(Arc::new)),
        };
        if udp_v6.is_none() {
            debug!("IPv6 unavailable for upstream queries");
        }

        Ok(Arc::new(Self {
            config,
            matcher: Matcher::new(config.max_pending),
            validator,
            stats: Stats::default(),
            udp_v4,
            udp_v6,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Returns the number of queries awaiting a response.
    pub fn pending(&self) -> usize {
        self.matcher.len()
    }

    /// Returns the UDP sockets on which upstream responses arrive. Each
    /// must be serviced with [`Forwarder::receive`].
    pub fn upstream_sockets(&self) -> impl Iterator<Item = &Arc<UdpSocket>> {
        self.udp_v4.iter().chain(self.udp_v6.iter())
    }

    /// Sends `query` to `upstream`.
    ///
    /// The query goes out under a fresh random transaction ID and, if
    /// enabled, with the case of its QNAME randomized. Over UDP, the
    /// response arrives on one of the [upstream
    /// sockets](Forwarder::upstream_sockets); over TCP, a task is
    /// spawned that makes the exchange. Either way the response is
    /// validated by [`Forwarder::on_response`] and delivered through
    /// the returned [`PendingHandle`].
    pub async fn send(
        self: &Arc<Self>,
        query: Outbound<'_>,
        upstream: Upstream,
    ) -> Result<PendingHandle, Error> {
        let address = canonical_socket_addr(upstream.address);
        let mut octets = query.message.to_vec();
        let mut question = query.question.clone();
        if self.config.case_randomization {
            question.qname.randomize_case(&mut rand::thread_rng());
            if !message::overwrite_qname(&mut octets, &question.qname) {
                question.qname = query.question.qname.clone();
            }
        }

        let (token, id, receiver) = self.register(question, query.client, address, query.kind)?;
        message::set_id(&mut octets, id);
        let mut handle = PendingHandle {
            forwarder: self.clone(),
            token,
            id,
            receiver,
            tcp_task: None,
        };

        match upstream.transport {
            Transport::Udp => {
                let socket = match address {
                    SocketAddr::V4(_) => self.udp_v4.as_ref(),
                    SocketAddr::V6(_) => self.udp_v6.as_ref(),
                };
                let result = match socket {
                    Some(socket) => socket.send_to(&octets, address).await.map(|_| ()),
                    None => Err(io::ErrorKind::AddrNotAvailable.into()),
                };
                if let Err(e) = result {
                    self.stats.record_upstream_error();
                    debug!("failed to send query to {upstream}: {e}");
                    return Err(Error::Unreachable(e.kind()));
                }
            }
            Transport::Tcp => {
                let forwarder = self.clone();
                handle.tcp_task = Some(tokio::spawn(async move {
                    forwarder.exchange_over_tcp(token, octets, address).await
                }));
            }
        }

        debug!("sent query {id} for {} to {upstream}", query.question);
        Ok(handle)
    }

    /// Sends `query` to `primary` and waits for the response. If that
    /// times out or the upstream is unreachable, and a `secondary` is
    /// given and retries are enabled, the query is tried once more
    /// against `secondary`.
    pub async fn exchange(
        self: &Arc<Self>,
        query: Outbound<'_>,
        primary: Upstream,
        secondary: Option<Upstream>,
    ) -> Result<Vec<u8>, Error> {
        match (self.send_and_wait(query, primary).await, secondary) {
            (Err(e), Some(secondary)) if e.is_retryable() && self.config.retry_secondary => {
                debug!("retrying {} against {secondary} after: {e}", query.question);
                self.send_and_wait(query, secondary).await
            }
            (result, _) => result,
        }
    }

    async fn send_and_wait(
        self: &Arc<Self>,
        query: Outbound<'_>,
        upstream: Upstream,
    ) -> Result<Vec<u8>, Error> {
        self.send(query, upstream).await?.wait().await
    }

    /// Processes a response received from `source`. An accepted
    /// response is delivered to the task waiting for it and its entry
    /// is cleared, so that any later response with the same ID is
    /// unmatched.
    pub fn on_response(&self, octets: &[u8], source: SocketAddr) -> Outcome {
        let response = match Response::parse(octets, source) {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_malformed();
                debug!("malformed response from {source}: {e}");
                return Outcome::Malformed;
            }
        };

        let (token, pending) = match self.matcher.lookup(response.id, source) {
            Some(found) => found,
            None => {
                self.stats.record_unmatched();
                debug!("unmatched response {} from {source}", response.id);
                return Outcome::Unmatched;
            }
        };

        match self.validator.validate(&response, &pending) {
            Verdict::Reject(reason) => {
                self.stats.record_dropped();
                warn!(
                    "dropped response {} from {source} for {}: {reason}",
                    response.id, pending.question,
                );
                Outcome::Dropped(reason)
            }
            Verdict::Accept => match self.matcher.clear(token) {
                Some((pending, delivery)) => {
                    self.stats.record_delivered();
                    debug!("delivered response {} for {}", pending.id, pending.question);
                    let _ = delivery.send(Ok(octets.to_vec()));
                    Outcome::Delivered
                }
                None => {
                    self.stats.record_unmatched();
                    Outcome::Unmatched
                }
            },
        }
    }

    /// Receives one response on `socket` (one of the [upstream
    /// sockets](Forwarder::upstream_sockets)) and processes it.
    pub async fn receive(&self, socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Outcome> {
        let (len, source) = socket.recv_from(buf).await?;
        Ok(self.on_response(&buf[..len], source))
    }

    /// Purges queries sent at least the configured timeout before
    /// `now`. Tasks waiting on them observe [`Error::TimedOut`].
    /// Returns the number of queries purged.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired = self.matcher.purge_expired(now, self.config.timeout);
        for (pending, _) in &expired {
            debug!(
                "timed out waiting for {} from {} (query {})",
                pending.question, pending.upstream, pending.id,
            );
        }
        self.stats.record_timed_out(expired.len());
        expired.len()
    }

    /// Registers a query under a fresh random ID.
    fn register(
        &self,
        question: Question,
        client: SocketAddr,
        upstream: SocketAddr,
        kind: QueryKind,
    ) -> Result<(Token, u16, oneshot::Receiver<Result<Vec<u8>, Error>>), Error> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = rng.gen_range(1..=u16::MAX);
            let (sender, receiver) = oneshot::channel();
            let pending = PendingQuery {
                id,
                question: question.clone(),
                client,
                upstream,
                sent_at: Instant::now(),
                kind,
            };
            match self.matcher.register(pending, sender) {
                Ok(token) => return Ok((token, id, receiver)),
                Err(RegisterError::DuplicateId) => continue,
                Err(RegisterError::Full) => {
                    warn!("pending query table full; dropping query for {question}");
                    return Err(Error::QueueFull);
                }
            }
        }
        Err(Error::NoFreeId)
    }

    /// Makes a DNS-over-TCP exchange with `address` and processes the
    /// response. Connection failures are delivered to the waiting task
    /// right away; a server that never answers is left to the sweep.
    async fn exchange_over_tcp(&self, token: Token, message: Vec<u8>, address: SocketAddr) {
        let exchange = async {
            let len = u16::try_from(message.len())
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
            let mut stream = TcpStream::connect(address).await?;
            let mut framed = Vec::with_capacity(message.len() + 2);
            framed.extend_from_slice(&len.to_be_bytes());
            framed.extend_from_slice(&message);
            stream.write_all(&framed).await?;

            let mut len_buf = [0; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut response = vec![0; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut response).await?;
            Ok::<_, io::Error>(response)
        };

        match timeout(self.config.timeout, exchange).await {
            Ok(Ok(response)) => {
                self.on_response(&response, address);
            }
            Ok(Err(e)) => {
                if let Some((pending, delivery)) = self.matcher.clear(token) {
                    self.stats.record_upstream_error();
                    debug!("TCP exchange for {} with {address} failed: {e}", pending.question);
                    let _ = delivery.send(Err(Error::Unreachable(e.kind())));
                }
            }
            Err(_) => (),
        }
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("config", &self.config)
            .field("matcher", &self.matcher)
            .field("validator", &self.validator)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// PENDING HANDLES                                                    //
////////////////////////////////////////////////////////////////////////

/// A query in flight, returned by [`Forwarder::send`].
///
/// Dropping the handle before the response arrives cancels the query:
/// its entry is cleared, so a later response is unmatched.
#[must_use]
pub struct PendingHandle {
    forwarder: Arc<Forwarder>,
    token: Token,
    id: u16,
    receiver: oneshot::Receiver<Result<Vec<u8>, Error>>,
    tcp_task: Option<JoinHandle<()>>,
}

impl PendingHandle {
    /// Returns the correlation token of the query.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Returns the transaction ID the query was sent with.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Waits for the validated response.
    pub async fn wait(mut self) -> Result<Vec<u8>, Error> {
        // Normally the sweep ends the wait for a silent upstream. The
        // timeout here only matters if no sweep is running.
        let backstop = self.forwarder.config.timeout * 2;
        match timeout(backstop, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::TimedOut),
            Err(_) => {
                if self.forwarder.matcher.clear(self.token).is_some() {
                    self.forwarder.stats.record_timed_out(1);
                }
                Err(Error::TimedOut)
            }
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.forwarder.matcher.clear(self.token);
        if let Some(task) = self.tcp_task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for PendingHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendingHandle")
            .field("token", &self.token)
            .field("id", &self.id)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signaling that no valid response was obtained for a query.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// The pending query table is full.
    QueueFull,

    /// No unused transaction ID could be found.
    NoFreeId,

    /// The query could not be sent, or the connection to the upstream
    /// failed.
    Unreachable(io::ErrorKind),

    /// No valid response arrived in time.
    TimedOut,
}

impl Error {
    /// Returns whether another upstream might do better.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::TimedOut)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::QueueFull => f.write_str("query queue full"),
            Self::NoFreeId => f.write_str("no free transaction ID"),
            Self::Unreachable(kind) => write!(f, "upstream unreachable: {kind}"),
            Self::TimedOut => f.write_str("timed out"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
