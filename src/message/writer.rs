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

//! Implementation of the [`Writer`] type to serialize DNS messages.

use std::fmt;

use super::constants::*;
use super::{Opcode, Question, Rcode};
use crate::class::Class;
use crate::name::Name;
use crate::rr::{Ttl, Type};

////////////////////////////////////////////////////////////////////////
// WRITER                                                             //
////////////////////////////////////////////////////////////////////////

/// A "frame" around a buffer that serializes a DNS message into it.
///
/// A `Writer` is constructed using [`Writer::new`] (to set a message
/// size limit different from the underlying buffer size) or with its
/// [`TryFrom`] implementation (which sets the message size limit equal
/// to the buffer length). The limit must be long enough to accommodate
/// a full DNS message header of 12 octets. The message header is
/// initially zeroed.
///
/// Header fields can be written at any time. Questions and answer RRs
/// are written sequentially at a cursor, so all questions must be added
/// before the first answer; otherwise [`Error::OutOfOrder`] results.
/// An answer whose owner is exactly the first QNAME is compressed to a
/// pointer to it.
pub struct Writer<'a> {
    octets: &'a mut [u8],
    cursor: usize,
    limit: usize,
    section: Section,
    qdcount: u16,
    ancount: u16,
    qname: Option<Name>,
}

/// A type for recording which section of a DNS message a [`Writer`] is
/// currently serializing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Section {
    Question,
    Answer,
}

impl<'a> Writer<'a> {
    /// Creates a new `Writer` from the underlying buffer `octets`. The
    /// message size is limited to `limit` or `octets.len()`
    /// (whichever is smaller). If the smaller limit is too small to
    /// hold a full DNS message header of 12 octets, then this will
    /// fail.
    pub fn new(octets: &'a mut [u8], limit: usize) -> Result<Self> {
        let limit = limit.min(octets.len());
        if limit < HEADER_SIZE {
            Err(Error::Truncation)
        } else {
            octets[0..HEADER_SIZE].fill(0);
            Ok(Self {
                octets,
                cursor: HEADER_SIZE,
                limit,
                section: Section::Question,
                qdcount: 0,
                ancount: 0,
                qname: None,
            })
        }
    }

    /// Sets the 16-bit ID of the message.
    pub fn set_id(&mut self, id: u16) {
        self.write_u16(ID_START, id);
    }

    /// Sets or clears the QR (query response) bit.
    pub fn set_qr(&mut self, qr: bool) {
        self.set_flag(QR_BYTE, QR_MASK, qr);
    }

    /// Sets the message's opcode.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.octets[OPCODE_BYTE] &= !OPCODE_MASK;
        self.octets[OPCODE_BYTE] |= u8::from(opcode) << OPCODE_SHIFT;
    }

    /// Sets or clears the TC (truncation) bit.
    pub fn set_tc(&mut self, tc: bool) {
        self.set_flag(TC_BYTE, TC_MASK, tc);
    }

    /// Sets or clears the RD (recursion desired) bit.
    pub fn set_rd(&mut self, rd: bool) {
        self.set_flag(RD_BYTE, RD_MASK, rd);
    }

    /// Sets or clears the RA (recursion available) bit.
    pub fn set_ra(&mut self, ra: bool) {
        self.set_flag(RA_BYTE, RA_MASK, ra);
    }

    /// Sets the message's RCODE.
    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.octets[RCODE_BYTE] &= !RCODE_MASK;
        self.octets[RCODE_BYTE] |= u8::from(rcode) & RCODE_MASK;
    }

    /// Adds a question to message. This must be used before any
    /// resource records are added.
    pub fn add_question(&mut self, question: &Question) -> Result<()> {
        if self.section != Section::Question {
            return Err(Error::OutOfOrder);
        }
        let new_qdcount = self.qdcount.checked_add(1).ok_or(Error::CountOverflow)?;
        self.with_rollback(|this| {
            this.try_push(question.qname.wire_repr())?;
            this.try_push(&u16::from(question.qtype).to_be_bytes())?;
            this.try_push(&u16::from(question.qclass).to_be_bytes())
        })?;
        if self.qdcount == 0 {
            self.qname = Some(question.qname.clone());
        }
        self.qdcount = new_qdcount;
        self.write_u16(QDCOUNT_START, new_qdcount);
        Ok(())
    }

    /// Adds a resource record with the given uncompressed RDATA to the
    /// answer section of the message.
    pub fn add_answer_rr(
        &mut self,
        owner: &Name,
        rr_type: Type,
        class: Class,
        ttl: Ttl,
        rdata: &[u8],
    ) -> Result<()> {
        let new_ancount = self.ancount.checked_add(1).ok_or(Error::CountOverflow)?;
        let rdlength = u16::try_from(rdata.len()).or(Err(Error::Truncation))?;
        let compress = self.qname.as_ref().map_or(false, |q| q.eq_exact(owner));
        self.with_rollback(|this| {
            if compress {
                this.try_push(&(0xc000 | HEADER_SIZE as u16).to_be_bytes())?;
            } else {
                this.try_push(owner.wire_repr())?;
            }
            this.try_push(&u16::from(rr_type).to_be_bytes())?;
            this.try_push(&u16::from(class).to_be_bytes())?;
            this.try_push(&u32::from(ttl).to_be_bytes())?;
            this.try_push(&rdlength.to_be_bytes())?;
            this.try_push(rdata)
        })?;
        self.section = Section::Answer;
        self.ancount = new_ancount;
        self.write_u16(ANCOUNT_START, new_ancount);
        Ok(())
    }

    /// Consumes the `Writer` and returns the length of the serialized
    /// message.
    pub fn finish(self) -> usize {
        self.cursor
    }

    /// Runs `f`, restoring the cursor if it fails.
    fn with_rollback(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let saved_cursor = self.cursor;
        let result = f(self);
        if result.is_err() {
            self.cursor = saved_cursor;
        }
        result
    }

    /// Tries to write `data` to the underlying buffer at the current
    /// cursor, failing if there is not sufficient space.
    fn try_push(&mut self, data: &[u8]) -> Result<()> {
        if self.limit - self.cursor >= data.len() {
            self.octets[self.cursor..self.cursor + data.len()].copy_from_slice(data);
            self.cursor += data.len();
            Ok(())
        } else {
            Err(Error::Truncation)
        }
    }

    fn set_flag(&mut self, byte: usize, mask: u8, value: bool) {
        if value {
            self.octets[byte] |= mask;
        } else {
            self.octets[byte] &= !mask;
        }
    }

    /// Writes `data` in network byte order into the header. Note that
    /// this performs no bounds checking.
    fn write_u16(&mut self, position: usize, data: u16) {
        self.octets[position..position + 2].copy_from_slice(&data.to_be_bytes());
    }
}

impl<'a> TryFrom<&'a mut [u8]> for Writer<'a> {
    type Error = Error;

    fn try_from(octets: &'a mut [u8]) -> Result<Self> {
        let limit = octets.len();
        Self::new(octets, limit)
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signaling that a [`Writer`] operation could not be
/// completed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// Adding the question or resource record would overflow the
    /// corresponding 16-bit counter in the DNS header.
    CountOverflow,

    /// There is not enough room left in the buffer.
    Truncation,

    /// An attempt was made to add a question after an answer resource
    /// record had already been serialized.
    OutOfOrder,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::CountOverflow => f.write_str("record count would overflow"),
            Self::Truncation => f.write_str("message would be truncated"),
            Self::OutOfOrder => f.write_str("question or record serialized out of order"),
        }
    }
}

impl std::error::Error for Error {}

/// The type returned by fallible [`Writer`] methods.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn question() -> Question {
        Question {
            qname: "sans.test.".parse().unwrap(),
            qtype: Type::A,
            qclass: Class::IN,
        }
    }

    #[test]
    fn writer_works() {
        let mut buf = vec![0; 512];
        let mut writer = Writer::try_from(buf.as_mut_slice()).unwrap();
        let question = question();
        writer.set_id(0x0703);
        writer.set_opcode(Opcode::Query);
        writer.set_qr(true);
        writer.set_rd(true);
        writer.set_ra(true);
        writer.set_rcode(Rcode::NoError);
        writer.add_question(&question).unwrap();
        writer
            .add_answer_rr(&question.qname, Type::A, Class::IN, Ttl::from(3600), b"\x7f\x00\x00\x01")
            .unwrap();
        let len = writer.finish();
        assert_eq!(
            &buf[0..len],
            b"\x07\x03\x81\x80\x00\x01\x00\x01\x00\x00\x00\x00\
              \x04sans\x04test\x00\x00\x01\x00\x01\
              \xc0\x0c\x00\x01\x00\x01\x00\x00\x0e\x10\x00\x04\x7f\x00\x00\x01",
        );
    }

    #[test]
    fn writer_rejects_question_after_answer() {
        let mut buf = vec![0; 512];
        let mut writer = Writer::try_from(buf.as_mut_slice()).unwrap();
        let question = question();
        writer
            .add_answer_rr(&question.qname, Type::A, Class::IN, Ttl::from(0), b"\x7f\x00\x00\x01")
            .unwrap();
        assert_eq!(writer.add_question(&question), Err(Error::OutOfOrder));
    }

    #[test]
    fn writer_rolls_back_on_truncation() {
        let mut buf = vec![0; 20];
        let mut writer = Writer::try_from(buf.as_mut_slice()).unwrap();
        assert_eq!(writer.add_question(&question()), Err(Error::Truncation));
        assert_eq!(writer.finish(), HEADER_SIZE);
        assert_eq!(buf[QDCOUNT_START..QDCOUNT_START + 2], [0, 0]);
    }

    #[test]
    fn writer_constructor_rejects_short_limit() {
        let mut buf = vec![0; 512];
        assert!(Writer::new(&mut buf, HEADER_SIZE - 1).is_err());
    }
}
