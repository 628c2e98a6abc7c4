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

//! Handling of client queries.
//!
//! The [`Listener`] structure implements what happens to a query
//! received from a client, abstracted from the network I/O that
//! receives it (see [`crate::io`]). It checks the query, picks an
//! upstream, has the [`Forwarder`] obtain a validated response, and
//! turns that into the reply to the client.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info};

use crate::forward::{self, Forwarder, Outbound, QueryKind, Transport, Upstream};
use crate::message::{self, Opcode, Question, Rcode, Reader, Writer};
use crate::route::{self, Decision, Route, RouteTable};
use crate::rr::Type;
use crate::util::canonical_socket_addr;

/// The largest UDP reply to a client that did not advertise a larger
/// size with EDNS.
const DEFAULT_UDP_PAYLOAD_SIZE: usize = 512;

/// The upstream servers queries are forwarded to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Upstreams {
    /// The upstream used for ordinary queries.
    pub primary: Upstream,

    /// An optional second upstream. It is tried when the primary
    /// fails, and it is the trusted upstream for polluted names.
    pub secondary: Option<Upstream>,
}

/// Pollution probing: where probes go, and what has been learned.
#[derive(Debug)]
pub struct Probing {
    pub upstream: Upstream,
    pub routes: RouteTable,
}

/// What to tell a client whose query timed out upstream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeoutPolicy {
    ServFail,
    Silent,
}

/// The reply to a client query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    Message(Vec<u8>),

    /// Nothing is to be sent.
    None,
}

/// Handles client queries. See the [module-level
/// documentation](self).
#[derive(Debug)]
pub struct Listener {
    forwarder: Arc<Forwarder>,
    upstreams: Upstreams,
    probing: Option<Probing>,
    timeout_policy: TimeoutPolicy,
}

impl Listener {
    /// Creates a new `Listener` that forwards to `upstreams`. Probing
    /// is initially disabled, and timeouts are answered with SERVFAIL.
    pub fn new(forwarder: Arc<Forwarder>, upstreams: Upstreams) -> Self {
        Self {
            forwarder,
            upstreams,
            probing: None,
            timeout_policy: TimeoutPolicy::ServFail,
        }
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    pub fn set_probing(&mut self, probing: Probing) {
        self.probing = Some(probing);
    }

    pub fn probing(&self) -> Option<&Probing> {
        self.probing.as_ref()
    }

    pub fn set_timeout_policy(&mut self, policy: TimeoutPolicy) {
        self.timeout_policy = policy;
    }

    /// Handles a message received from `client` over `transport`,
    /// returning the reply to send back.
    ///
    /// Messages without a full header, responses, and queries whose
    /// question cannot be read get no reply at all. Non-QUERY opcodes
    /// get NOTIMP and queries without exactly one question get FORMERR.
    /// Otherwise the query is forwarded, and the upstream response is
    /// relayed with the client's ID and QNAME case restored, or
    /// SERVFAIL is returned if no valid response was obtained.
    pub async fn handle_query(
        &self,
        received_buf: &[u8],
        client: SocketAddr,
        transport: Transport,
    ) -> Reply {
        let client = canonical_socket_addr(client);
        let mut received = match Reader::try_from(received_buf) {
            Ok(r) => r,
            Err(_) => return Reply::None,
        };
        if received.qr() {
            return Reply::None;
        } else if received.opcode() != Opcode::Query {
            return short_reply(&received, None, Rcode::NotImp, false);
        } else if received.qdcount() != 1 {
            return short_reply(&received, None, Rcode::FormErr, false);
        }
        let question = match received.read_question() {
            Ok(question) => question,
            Err(e) => {
                debug!("unreadable question from {client}: {e}");
                return Reply::None;
            }
        };
        debug!("query for {question} from {client}");

        let (primary, secondary) = self.choose_upstreams(&question, client).await;
        let outbound = Outbound {
            message: received_buf,
            question: &question,
            client,
            kind: QueryKind::Relay,
        };
        match self.forwarder.exchange(outbound, primary, secondary).await {
            Ok(mut response) => {
                message::set_id(&mut response, received.id());
                message::overwrite_qname(&mut response, &question.qname);
                if transport == Transport::Udp && response.len() > udp_payload_size(received_buf) {
                    let rcode = Reader::try_from(response.as_slice())
                        .map_or(Rcode::ServFail, |r| r.rcode());
                    short_reply(&received, Some(&question), rcode, true)
                } else {
                    Reply::Message(response)
                }
            }
            Err(forward::Error::TimedOut) if self.timeout_policy == TimeoutPolicy::Silent => {
                debug!("no reply to {client} for {question}: timed out");
                Reply::None
            }
            Err(e) => {
                info!("SERVFAIL to {client} for {question}: {e}");
                short_reply(&received, Some(&question), Rcode::ServFail, false)
            }
        }
    }

    /// Picks the upstream to use for `question` and the one to retry
    /// with, probing the name first if necessary.
    async fn choose_upstreams(
        &self,
        question: &Question,
        client: SocketAddr,
    ) -> (Upstream, Option<Upstream>) {
        let Upstreams { primary, secondary } = self.upstreams;
        let probing = match self.probing {
            Some(ref probing) => probing,
            None => return (primary, secondary),
        };
        let route = match probing.routes.decide(question) {
            Decision::Known(route) => route,
            Decision::Probe => self.probe(probing, question, client).await,
        };
        match (route, secondary) {
            (Route::Trusted, Some(trusted)) => (trusted, None),
            _ => (primary, secondary),
        }
    }

    /// Probes `question`'s name for pollution and records the verdict.
    /// A probe that goes unanswered shows that the name is clean; other
    /// failures route the query directly without recording anything.
    async fn probe(&self, probing: &Probing, question: &Question, client: SocketAddr) -> Route {
        let probe = route::probe_question(&question.qname);
        let message = match route::probe_message(&probe) {
            Ok(message) => message,
            Err(_) => return Route::Direct,
        };
        let outbound = Outbound {
            message: &message,
            question: &probe,
            client,
            kind: QueryKind::Probe,
        };
        let route = match self.forwarder.exchange(outbound, probing.upstream, None).await {
            Ok(reply) => route::route_from_probe_reply(&reply),
            Err(forward::Error::TimedOut) => Route::Direct,
            Err(e) => {
                debug!("probe for {} failed: {e}", question.qname);
                return Route::Direct;
            }
        };
        debug!("{} routed {route:?}", question.qname);
        probing.routes.insert(&question.qname, route);
        route
    }
}

/// Produces a reply carrying only a header (and `question`, if
/// given) in response to `received`.
fn short_reply(received: &Reader, question: Option<&Question>, rcode: Rcode, tc: bool) -> Reply {
    let mut buf = vec![0; DEFAULT_UDP_PAYLOAD_SIZE];
    let mut writer = match Writer::try_from(buf.as_mut_slice()) {
        Ok(writer) => writer,
        Err(_) => return Reply::None,
    };
    writer.set_id(received.id());
    writer.set_qr(true);
    writer.set_opcode(received.opcode());
    if received.opcode() == Opcode::Query {
        writer.set_rd(received.rd());
    }
    writer.set_ra(true);
    writer.set_tc(tc);
    writer.set_rcode(rcode);
    if let Some(question) = question {
        if writer.add_question(question).is_err() {
            return Reply::None;
        }
    }
    let len = writer.finish();
    buf.truncate(len);
    Reply::Message(buf)
}

/// Returns the largest UDP reply the sender of `query` accepts, based
/// on the OPT record it may carry.
fn udp_payload_size(query: &[u8]) -> usize {
    let find_opt = || -> Result<Option<usize>, message::reader::Error> {
        let mut reader = Reader::try_from(query)?;
        for _ in 0..reader.qdcount() {
            reader.read_question()?;
        }
        let n_rrs = reader.ancount() as usize + reader.nscount() as usize + reader.arcount() as usize;
        for _ in 0..n_rrs {
            let rr = reader.read_rr()?;
            if rr.rr_type == Type::OPT {
                return Ok(Some(u16::from(rr.class) as usize));
            }
        }
        Ok(None)
    };
    match find_opt() {
        Ok(Some(size)) => size.max(DEFAULT_UDP_PAYLOAD_SIZE),
        _ => DEFAULT_UDP_PAYLOAD_SIZE,
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::class::Class;
    use crate::forward::{Config, Validator};
    use crate::name::Name;
    use crate::rr::Ttl;

    const CLIENT: &str = "127.0.0.1:40000";

    async fn forwarder(case_randomization: bool) -> Arc<Forwarder> {
        let config = Config {
            timeout: Duration::from_millis(200),
            max_pending: 16,
            case_randomization,
            retry_secondary: true,
        };
        let forwarder = Forwarder::bind(config, Validator::default()).await.unwrap();
        for socket in forwarder.upstream_sockets() {
            let socket = socket.clone();
            let forwarder = forwarder.clone();
            tokio::spawn(async move {
                let mut buf = vec![0; message::MAX_MESSAGE_SIZE];
                while forwarder.receive(&socket, &mut buf).await.is_ok() {}
            });
        }
        forwarder
    }

    /// Spawns a UDP server that answers each query with `n_answers`
    /// records of type `rr_type` for the QNAME.
    async fn spawn_upstream(rr_type: Type, n_answers: usize) -> Upstream {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0; 512];
            loop {
                let (len, source) = socket.recv_from(&mut buf).await.unwrap();
                let mut reader = Reader::try_from(&buf[..len]).unwrap();
                let question = reader.read_question().unwrap();
                let mut response_buf = vec![0; 4096];
                let mut writer = Writer::try_from(response_buf.as_mut_slice()).unwrap();
                writer.set_id(reader.id());
                writer.set_qr(true);
                writer.add_question(&question).unwrap();
                let rdata: &[u8] = if rr_type == Type::A { &[46, 82, 174, 68] } else { &[0; 22] };
                for _ in 0..n_answers {
                    writer
                        .add_answer_rr(&question.qname, rr_type, Class::IN, Ttl::from(60), rdata)
                        .unwrap();
                }
                let response_len = writer.finish();
                socket.send_to(&response_buf[..response_len], source).await.unwrap();
            }
        });
        Upstream::udp(address)
    }

    async fn silent_upstream() -> (UdpSocket, Upstream) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = Upstream::udp(socket.local_addr().unwrap());
        (socket, upstream)
    }

    fn query(id: u16, qname: &str, opcode: Opcode, qdcount: usize) -> Vec<u8> {
        let question = Question {
            qname: qname.parse().unwrap(),
            qtype: Type::A,
            qclass: Class::IN,
        };
        let mut buf = vec![0; 512];
        let mut writer = Writer::try_from(buf.as_mut_slice()).unwrap();
        writer.set_id(id);
        writer.set_opcode(opcode);
        writer.set_rd(true);
        for _ in 0..qdcount {
            writer.add_question(&question).unwrap();
        }
        let len = writer.finish();
        buf.truncate(len);
        buf
    }

    fn unwrap_message(reply: Reply) -> Vec<u8> {
        match reply {
            Reply::Message(message) => message,
            Reply::None => panic!("expected a reply"),
        }
    }

    async fn handle(listener: &Listener, query: &[u8]) -> Reply {
        listener
            .handle_query(query, CLIENT.parse().unwrap(), Transport::Udp)
            .await
    }

    #[tokio::test]
    async fn relayed_reply_has_client_id_and_case() {
        let upstreams = Upstreams {
            primary: spawn_upstream(Type::A, 1).await,
            secondary: None,
        };
        let listener = Listener::new(forwarder(true).await, upstreams);
        let query = query(0x4242, "WwW.ExAmPle.TEST.", Opcode::Query, 1);

        let reply = unwrap_message(handle(&listener, &query).await);
        let mut reader = Reader::try_from(reply.as_slice()).unwrap();
        assert_eq!(reader.id(), 0x4242);
        assert_eq!(reader.rcode(), Rcode::NoError);
        assert_eq!(reader.ancount(), 1);
        let question = reader.read_question().unwrap();
        assert_eq!(question.qname.wire_repr(), b"\x03WwW\x07ExAmPle\x04TEST\x00");
    }

    #[tokio::test]
    async fn malformed_queries_and_responses_get_no_reply() {
        let (_socket, primary) = silent_upstream().await;
        let listener = Listener::new(forwarder(false).await, Upstreams { primary, secondary: None });
        assert_eq!(handle(&listener, b"\x12\x34\x01").await, Reply::None);
        let mut response = query(1, "example.test.", Opcode::Query, 1);
        response[2] |= 0x80;
        assert_eq!(handle(&listener, &response).await, Reply::None);
        let mut truncated = query(1, "example.test.", Opcode::Query, 1);
        truncated.truncate(16);
        assert_eq!(handle(&listener, &truncated).await, Reply::None);
        assert_eq!(listener.forwarder().pending(), 0);
    }

    #[tokio::test]
    async fn unsupported_queries_get_error_replies() {
        let (_socket, primary) = silent_upstream().await;
        let listener = Listener::new(forwarder(false).await, Upstreams { primary, secondary: None });

        let notify = query(7, "example.test.", Opcode::Notify, 1);
        let reply = unwrap_message(handle(&listener, &notify).await);
        let reader = Reader::try_from(reply.as_slice()).unwrap();
        assert_eq!(reader.id(), 7);
        assert_eq!(reader.opcode(), Opcode::Notify);
        assert_eq!(reader.rcode(), Rcode::NotImp);

        for qdcount in [0, 2] {
            let query = query(8, "example.test.", Opcode::Query, qdcount);
            let reply = unwrap_message(handle(&listener, &query).await);
            let reader = Reader::try_from(reply.as_slice()).unwrap();
            assert_eq!(reader.rcode(), Rcode::FormErr);
            assert_eq!(reader.qdcount(), 0);
        }
    }

    #[tokio::test]
    async fn timeouts_follow_the_policy() {
        let (_socket, primary) = silent_upstream().await;
        let mut listener = Listener::new(forwarder(false).await, Upstreams { primary, secondary: None });
        let query = query(9, "slow.example.test.", Opcode::Query, 1);

        let reply = unwrap_message(handle(&listener, &query).await);
        let mut reader = Reader::try_from(reply.as_slice()).unwrap();
        assert_eq!(reader.id(), 9);
        assert_eq!(reader.rcode(), Rcode::ServFail);
        let qname: Name = "slow.example.test.".parse().unwrap();
        assert_eq!(reader.read_question().unwrap().qname, qname);

        listener.set_timeout_policy(TimeoutPolicy::Silent);
        assert_eq!(handle(&listener, &query).await, Reply::None);
    }

    #[tokio::test]
    async fn oversized_udp_replies_are_truncated() {
        let upstreams = Upstreams {
            primary: spawn_upstream(Type::A, 40).await,
            secondary: None,
        };
        let listener = Listener::new(forwarder(false).await, upstreams);
        let query = query(10, "big.example.test.", Opcode::Query, 1);

        let reply = unwrap_message(handle(&listener, &query).await);
        let reader = Reader::try_from(reply.as_slice()).unwrap();
        assert!(reader.tc());
        assert_eq!(reader.ancount(), 0);

        let reply = listener
            .handle_query(&query, CLIENT.parse().unwrap(), Transport::Tcp)
            .await;
        let reply = unwrap_message(reply);
        assert_eq!(Reader::try_from(reply.as_slice()).unwrap().ancount(), 40);
    }

    #[tokio::test]
    async fn polluted_names_go_to_the_trusted_upstream() {
        let (_socket, primary) = silent_upstream().await;
        let upstreams = Upstreams {
            primary,
            secondary: Some(spawn_upstream(Type::A, 1).await),
        };
        let mut listener = Listener::new(forwarder(false).await, upstreams);
        listener.set_probing(Probing {
            upstream: spawn_upstream(Type::A, 1).await,
            routes: RouteTable::default(),
        });
        let query = query(11, "polluted.example.test.", Opcode::Query, 1);

        let reply = unwrap_message(handle(&listener, &query).await);
        assert_eq!(Reader::try_from(reply.as_slice()).unwrap().rcode(), Rcode::NoError);
        let name: Name = "polluted.example.test.".parse().unwrap();
        assert_eq!(listener.probing().unwrap().routes.get(&name), Some(Route::Trusted));
    }

    #[tokio::test]
    async fn clean_names_go_direct() {
        let upstreams = Upstreams {
            primary: spawn_upstream(Type::A, 1).await,
            secondary: None,
        };
        let mut listener = Listener::new(forwarder(false).await, upstreams);
        listener.set_probing(Probing {
            upstream: spawn_upstream(Type::SOA, 1).await,
            routes: RouteTable::default(),
        });
        let query = query(12, "clean.example.test.", Opcode::Query, 1);

        let reply = unwrap_message(handle(&listener, &query).await);
        assert_eq!(Reader::try_from(reply.as_slice()).unwrap().ancount(), 1);
        let name: Name = "clean.example.test.".parse().unwrap();
        assert_eq!(listener.probing().unwrap().routes.get(&name), Some(Route::Direct));
    }

    #[test]
    fn udp_payload_size_reads_opt_record() {
        let mut query = query(1, "example.test.", Opcode::Query, 1);
        assert_eq!(udp_payload_size(&query), 512);
        query[11] = 1;
        query.extend_from_slice(b"\x00\x00\x29\x04\xd0\x00\x00\x00\x00\x00\x00");
        assert_eq!(udp_payload_size(&query), 1232);
    }
}
