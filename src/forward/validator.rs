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

//! Anti-spoofing checks for upstream responses.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use ipnetwork::IpNetwork;

use super::matcher::{PendingQuery, QueryKind};
use crate::class::Class;
use crate::message::{reader, Question, Rcode, Reader};
use crate::name::Name;
use crate::rr::{Ttl, Type};
use crate::util::canonical_socket_addr;

/// The default bound on the number of answer records.
pub const DEFAULT_MAX_ANSWERS: usize = 64;

////////////////////////////////////////////////////////////////////////
// PARSED RESPONSES                                                   //
////////////////////////////////////////////////////////////////////////

/// An upstream response, parsed far enough to be validated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub id: u16,
    pub rcode: Rcode,
    pub tc: bool,

    /// The question section. This is `None` unless the response
    /// carries exactly one question.
    pub question: Option<Question>,

    pub answers: Vec<AnswerRecord>,
    pub source: SocketAddr,
}

/// A record from the answer section of a [`Response`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AnswerRecord {
    pub owner: Name,
    pub rr_type: Type,
    pub class: Class,
    pub ttl: Ttl,
    pub rdata: Box<[u8]>,
}

impl AnswerRecord {
    /// Returns the address carried by an IN A or IN AAAA record.
    pub fn address(&self) -> Option<IpAddr> {
        if self.class != Class::IN {
            return None;
        }
        match self.rr_type {
            Type::A => <[u8; 4]>::try_from(&*self.rdata)
                .ok()
                .map(|octets| Ipv4Addr::from(octets).into()),
            Type::AAAA => <[u8; 16]>::try_from(&*self.rdata)
                .ok()
                .map(|octets| Ipv6Addr::from(octets).into()),
            _ => None,
        }
    }
}

impl Response {
    /// Parses the response message `octets` received from `source`.
    /// Only the header, question and answer sections are read.
    pub fn parse(octets: &[u8], source: SocketAddr) -> Result<Self, ParseError> {
        let mut reader = Reader::try_from(octets)?;
        if !reader.qr() {
            return Err(ParseError::NotResponse);
        }

        let qdcount = reader.qdcount();
        let mut questions = Vec::with_capacity(1);
        for _ in 0..qdcount {
            questions.push(reader.read_question()?);
        }
        let question = if questions.len() == 1 {
            questions.pop()
        } else {
            None
        };

        let ancount = reader.ancount() as usize;
        let mut answers = Vec::with_capacity(ancount.min(DEFAULT_MAX_ANSWERS));
        for _ in 0..ancount {
            let rr = reader.read_rr()?;
            answers.push(AnswerRecord {
                owner: rr.owner,
                rr_type: rr.rr_type,
                class: rr.class,
                ttl: rr.ttl,
                rdata: rr.rdata.into(),
            });
        }

        Ok(Self {
            id: reader.id(),
            rcode: reader.rcode(),
            tc: reader.tc(),
            question,
            answers,
            source,
        })
    }
}

/// An error signaling that a response could not be parsed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ParseError {
    Message(reader::Error),

    /// The QR bit is clear, so the message is a query.
    NotResponse,
}

impl From<reader::Error> for ParseError {
    fn from(err: reader::Error) -> Self {
        Self::Message(err)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Message(err) => fmt::Display::fmt(&err, f),
            Self::NotResponse => f.write_str("message is not a response"),
        }
    }
}

impl std::error::Error for ParseError {}

////////////////////////////////////////////////////////////////////////
// BLOCKLISTS                                                         //
////////////////////////////////////////////////////////////////////////

/// A predicate on answer addresses. Responses carrying any A or AAAA
/// answer for which the predicate holds are rejected.
///
/// Besides [`Blocklist`], any `Fn(IpAddr) -> bool` qualifies.
pub trait AddressPredicate {
    fn matches(&self, addr: IpAddr) -> bool;
}

impl<F> AddressPredicate for F
where
    F: Fn(IpAddr) -> bool,
{
    fn matches(&self, addr: IpAddr) -> bool {
        self(addr)
    }
}

/// A set of address ranges known to be used in forged answers.
///
/// Entries are CIDR ranges; a bare address is a range with a full-length
/// prefix. IPv4-mapped IPv6 answers are checked against IPv4 entries
/// too.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Blocklist {
    networks: Vec<IpNetwork>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, network: IpNetwork) {
        self.networks.push(network);
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

impl AddressPredicate for Blocklist {
    fn matches(&self, addr: IpAddr) -> bool {
        let mapped = match addr {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
            IpAddr::V4(_) => None,
        };
        self.networks.iter().any(|network| {
            network.contains(addr) || mapped.map_or(false, |v4| network.contains(v4))
        })
    }
}

impl FromIterator<IpNetwork> for Blocklist {
    fn from_iter<I: IntoIterator<Item = IpNetwork>>(iter: I) -> Self {
        Self {
            networks: iter.into_iter().collect(),
        }
    }
}

/// Parses a blocklist entry, which is either an address or a CIDR
/// range.
pub fn parse_blocklist_entry(s: &str) -> Result<IpNetwork, ipnetwork::IpNetworkError> {
    match IpAddr::from_str(s) {
        Ok(addr) => Ok(IpNetwork::from(addr)),
        Err(_) => s.parse(),
    }
}

////////////////////////////////////////////////////////////////////////
// VALIDATION                                                         //
////////////////////////////////////////////////////////////////////////

/// The result of validating a [`Response`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

/// Why a [`Response`] was rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    IdMismatch { expected: u16, received: u16 },
    SourceMismatch { expected: SocketAddr, received: SocketAddr },
    QuestionMismatch,

    /// The question was echoed with the QNAME's case changed. An
    /// upstream that does this cannot be used with case randomization.
    CaseMismatch,

    TooManyAnswers(usize),
    BlockedAddress(IpAddr),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::IdMismatch { expected, received } => {
                write!(f, "ID mismatch (expected {expected}, received {received})")
            }
            Self::SourceMismatch { expected, received } => {
                write!(f, "source mismatch (expected {expected}, received {received})")
            }
            Self::QuestionMismatch => f.write_str("question not echoed exactly"),
            Self::CaseMismatch => f.write_str("question echoed with its case changed"),
            Self::TooManyAnswers(n) => write!(f, "too many answers ({n})"),
            Self::BlockedAddress(addr) => write!(f, "answer address {addr} is blocklisted"),
        }
    }
}

/// Applies the anti-spoofing checks to responses.
///
/// The checks run in this order, stopping at the first failure:
///
/// 1. the transaction ID equals that of the pending query;
/// 2. the response came from the address and port the query was sent
///    to;
/// 3. the response has exactly one question, identical to the one sent
///    (including the case of every QNAME octet);
/// 4. there are no more answer records than the configured bound; and
/// 5. if a blocklist is configured, no A or AAAA answer matches it.
///
/// The blocklist does not apply to replies to pollution probes, since
/// a forged answer is exactly what a probe looks for.
pub struct Validator {
    max_answers: usize,
    blocklist: Option<Box<dyn AddressPredicate + Send + Sync>>,
}

impl Validator {
    pub fn new(max_answers: usize) -> Self {
        Self {
            max_answers,
            blocklist: None,
        }
    }

    /// Adds an address predicate; see [`AddressPredicate`].
    pub fn with_blocklist<B>(mut self, blocklist: B) -> Self
    where
        B: AddressPredicate + Send + Sync + 'static,
    {
        self.blocklist = Some(Box::new(blocklist));
        self
    }

    /// Checks `response` against `pending`. This has no side effects.
    pub fn validate(&self, response: &Response, pending: &PendingQuery) -> Verdict {
        match self.check(response, pending) {
            Ok(()) => Verdict::Accept,
            Err(reason) => Verdict::Reject(reason),
        }
    }

    fn check(&self, response: &Response, pending: &PendingQuery) -> Result<(), RejectReason> {
        if response.id != pending.id {
            return Err(RejectReason::IdMismatch {
                expected: pending.id,
                received: response.id,
            });
        }

        let expected = canonical_socket_addr(pending.upstream);
        let received = canonical_socket_addr(response.source);
        if expected != received {
            return Err(RejectReason::SourceMismatch { expected, received });
        }

        match response.question {
            Some(ref question) if question.eq_exact(&pending.question) => (),
            Some(ref question) if *question == pending.question => {
                return Err(RejectReason::CaseMismatch)
            }
            _ => return Err(RejectReason::QuestionMismatch),
        }

        if response.answers.len() > self.max_answers {
            return Err(RejectReason::TooManyAnswers(response.answers.len()));
        }

        if let (Some(blocklist), QueryKind::Relay) = (&self.blocklist, pending.kind) {
            for addr in response.answers.iter().filter_map(AnswerRecord::address) {
                if blocklist.matches(addr) {
                    return Err(RejectReason::BlockedAddress(addr));
                }
            }
        }

        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ANSWERS)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Validator")
            .field("max_answers", &self.max_answers)
            .field("blocklist", &self.blocklist.is_some())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Instant;

    use super::*;
    use crate::forward::matcher::tests::pending;
    use crate::message::Writer;

    /// Serializes a response to `question` with the given ID and A
    /// record answers.
    pub(crate) fn build_response(id: u16, question: &Question, answers: &[[u8; 4]]) -> Vec<u8> {
        let mut buf = vec![0; 4096];
        let mut writer = Writer::try_from(buf.as_mut_slice()).unwrap();
        writer.set_id(id);
        writer.set_qr(true);
        writer.set_rd(true);
        writer.set_ra(true);
        writer.add_question(question).unwrap();
        for answer in answers {
            writer
                .add_answer_rr(&question.qname, Type::A, Class::IN, Ttl::from(60), answer)
                .unwrap();
        }
        let len = writer.finish();
        buf.truncate(len);
        buf
    }

    fn setup() -> (PendingQuery, Validator) {
        let query = pending(1234, "192.0.2.1:53", Instant::now());
        (query, Validator::default())
    }

    fn parse(octets: &[u8], source: &str) -> Response {
        Response::parse(octets, source.parse().unwrap()).unwrap()
    }

    #[test]
    fn genuine_response_is_accepted() {
        let (query, validator) = setup();
        let raw = build_response(1234, &query.question, &[[93, 184, 216, 34]]);
        let response = parse(&raw, "192.0.2.1:53");
        assert_eq!(response.answers[0].address(), Some("93.184.216.34".parse().unwrap()));
        assert_eq!(validator.validate(&response, &query), Verdict::Accept);
    }

    #[test]
    fn mismatched_id_is_rejected_even_if_all_else_matches() {
        let (query, validator) = setup();
        let raw = build_response(1235, &query.question, &[]);
        assert_eq!(
            validator.validate(&parse(&raw, "192.0.2.1:53"), &query),
            Verdict::Reject(RejectReason::IdMismatch {
                expected: 1234,
                received: 1235,
            }),
        );
    }

    #[test]
    fn wrong_source_is_rejected() {
        let (query, validator) = setup();
        let raw = build_response(1234, &query.question, &[]);
        for source in ["192.0.2.2:53", "192.0.2.1:5353"] {
            assert!(matches!(
                validator.validate(&parse(&raw, source), &query),
                Verdict::Reject(RejectReason::SourceMismatch { .. }),
            ));
        }
        assert_eq!(
            validator.validate(&parse(&raw, "[::ffff:192.0.2.1]:53"), &query),
            Verdict::Accept,
        );
    }

    #[test]
    fn question_must_be_echoed_exactly() {
        let (mut query, validator) = setup();
        query.question.qname = "ExAmPle.TesT.".parse().unwrap();
        let lowercase = query.question.qname.to_lowercase();
        let mut echoed = query.question.clone();
        echoed.qname = lowercase;
        let raw = build_response(1234, &echoed, &[]);
        assert_eq!(
            validator.validate(&parse(&raw, "192.0.2.1:53"), &query),
            Verdict::Reject(RejectReason::CaseMismatch),
        );

        let mut other_type = query.question.clone();
        other_type.qtype = Type::AAAA;
        let raw = build_response(1234, &other_type, &[]);
        assert_eq!(
            validator.validate(&parse(&raw, "192.0.2.1:53"), &query),
            Verdict::Reject(RejectReason::QuestionMismatch),
        );
    }

    #[test]
    fn answer_count_is_bounded() {
        let (query, _) = setup();
        let validator = Validator::new(2);
        let raw = build_response(1234, &query.question, &[[192, 0, 2, 10]; 3]);
        assert_eq!(
            validator.validate(&parse(&raw, "192.0.2.1:53"), &query),
            Verdict::Reject(RejectReason::TooManyAnswers(3)),
        );
    }

    #[test]
    fn answer_count_at_the_bound_is_accepted() {
        let (query, _) = setup();
        let validator = Validator::new(2);
        let raw = build_response(1234, &query.question, &[[192, 0, 2, 10]; 2]);
        assert_eq!(
            validator.validate(&parse(&raw, "192.0.2.1:53"), &query),
            Verdict::Accept,
        );

        let validator = Validator::default();
        let raw = build_response(1234, &query.question, &[[192, 0, 2, 10]; DEFAULT_MAX_ANSWERS]);
        assert_eq!(
            validator.validate(&parse(&raw, "192.0.2.1:53"), &query),
            Verdict::Accept,
        );
    }

    #[test]
    fn blocklisted_answers_are_rejected() {
        let (query, validator) = setup();
        let blocklist: Blocklist = ["243.185.187.39", "46.82.174.0/24"]
            .into_iter()
            .map(|s| parse_blocklist_entry(s).unwrap())
            .collect();
        let validator = validator.with_blocklist(blocklist);

        let raw = build_response(1234, &query.question, &[[46, 82, 174, 68]]);
        assert_eq!(
            validator.validate(&parse(&raw, "192.0.2.1:53"), &query),
            Verdict::Reject(RejectReason::BlockedAddress("46.82.174.68".parse().unwrap())),
        );
        let raw = build_response(1234, &query.question, &[[243, 185, 187, 40]]);
        assert_eq!(validator.validate(&parse(&raw, "192.0.2.1:53"), &query), Verdict::Accept);
    }

    #[test]
    fn blocklist_does_not_apply_to_probes() {
        let (mut query, validator) = setup();
        query.kind = QueryKind::Probe;
        let validator = validator.with_blocklist(|_: IpAddr| true);
        let raw = build_response(1234, &query.question, &[[46, 82, 174, 68]]);
        assert_eq!(validator.validate(&parse(&raw, "192.0.2.1:53"), &query), Verdict::Accept);
    }

    #[test]
    fn closures_serve_as_blocklists() {
        let (query, validator) = setup();
        let validator = validator.with_blocklist(|addr: IpAddr| addr.is_loopback());
        let raw = build_response(1234, &query.question, &[[127, 0, 0, 1]]);
        assert!(matches!(
            validator.validate(&parse(&raw, "192.0.2.1:53"), &query),
            Verdict::Reject(RejectReason::BlockedAddress(_)),
        ));
    }

    #[test]
    fn blocklist_checks_mapped_addresses() {
        let blocklist: Blocklist = [parse_blocklist_entry("10.0.0.0/8").unwrap()].into_iter().collect();
        assert!(blocklist.matches("::ffff:10.1.2.3".parse().unwrap()));
        assert!(!blocklist.matches("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn parse_rejects_queries_and_garbage() {
        let (query, _) = setup();
        let mut raw = build_response(1234, &query.question, &[]);
        raw[2] &= 0x7f;
        assert_eq!(
            Response::parse(&raw, "192.0.2.1:53".parse().unwrap()),
            Err(ParseError::NotResponse),
        );
        assert!(Response::parse(b"\x04\xd2\x80", "192.0.2.1:53".parse().unwrap()).is_err());
    }
}
