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

//! Implementation of data structures related to domain names.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FusedIterator;
use std::str::FromStr;

use arrayvec::ArrayVec;
use rand::Rng;

mod error;
mod wire;
pub use error::Error;

/// The maximum number of labels in a domain name.
const MAX_N_LABELS: usize = 128;

/// The maximum length of the uncompressed on-the-wire representation of
/// a domain name.
const MAX_WIRE_LEN: usize = 255;

/// The maximum length of a label in a domain name (not including the
/// octet that provides the length).
const MAX_LABEL_LEN: usize = 63;

////////////////////////////////////////////////////////////////////////
// NAME STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// A domain name, stored in its uncompressed on-the-wire form as
/// defined in [RFC 1035 § 3.1].
///
/// `Name`s can be constructed
///
/// * through the [`FromStr`] implementation (the text must be fully
///   qualified, i.e. end in a `.`); and
/// * from possibly compressed on-the-wire names inside a DNS message
///   through [`Name::try_from_compressed`].
///
/// In accordance with [RFC 1034 § 3.1], the [`PartialEq`] and [`Hash`]
/// implementations are case-insensitive (assuming ASCII), while case
/// is preserved in the stored octets. Anti-spoofing checks that need to
/// see the case a name was written with (see
/// [`Name::randomize_case`]) use [`Name::eq_exact`] instead.
///
/// [RFC 1034 § 3.1]: https://datatracker.ietf.org/doc/html/rfc1034#section-3.1
/// [RFC 1035 § 3.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.1
#[derive(Clone)]
pub struct Name {
    wire: Box<[u8]>,
}

#[allow(clippy::len_without_is_empty)] // A domain name is never empty!
impl Name {
    /// Returns the DNS root `.`.
    pub fn root() -> Self {
        Self {
            wire: Box::new([0]),
        }
    }

    /// Returns whether the `Name` is the DNS root `.`.
    pub fn is_root(&self) -> bool {
        self.wire.len() == 1
    }

    /// Returns the number of labels in the `Name`, including the
    /// terminal null label.
    pub fn len(&self) -> usize {
        self.labels().count()
    }

    /// Returns an iterator over the labels of the `Name`, from left to
    /// right. The terminal null label is included.
    pub fn labels(&self) -> Labels {
        Labels {
            remaining: &self.wire,
        }
    }

    /// Returns the uncompressed on-the-wire representation of the name.
    pub fn wire_repr(&self) -> &[u8] {
        &self.wire
    }

    /// Returns whether `self` and `other` are octet-for-octet equal,
    /// i.e. equal including case.
    pub fn eq_exact(&self, other: &Name) -> bool {
        self.wire == other.wire
    }

    /// Converts the name to ASCII lowercase in place.
    pub fn make_ascii_lowercase(&mut self) {
        for_each_label_octet(&mut self.wire, |octet| octet.make_ascii_lowercase());
    }

    /// Returns an ASCII-lowercased copy of the name.
    pub fn to_lowercase(&self) -> Self {
        let mut copy = self.clone();
        copy.make_ascii_lowercase();
        copy
    }

    /// Randomly flips the case of each ASCII letter in the name.
    ///
    /// This implements the "DNS 0x20" technique: since servers echo the
    /// question name octet-for-octet, the case pattern acts as extra
    /// entropy that an off-path attacker must guess in addition to the
    /// transaction ID and port.
    pub fn randomize_case<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for_each_label_octet(&mut self.wire, |octet| {
            if octet.is_ascii_alphabetic() && rng.gen::<bool>() {
                *octet ^= 0x20;
            }
        });
    }

    /// Parses a possibly compressed on-the-wire domain name that starts
    /// at index `start` of the DNS message `octets`. On success, returns
    /// the name and the number of octets it occupies at `start` (which,
    /// because of compression, may be less than its uncompressed
    /// length).
    pub fn try_from_compressed(octets: &[u8], start: usize) -> Result<(Self, usize), Error> {
        wire::parse_compressed_name(octets, start)
    }
}

/// Applies `f` to every octet of `wire` that is part of a label's
/// content (as opposed to a length octet).
fn for_each_label_octet(wire: &mut [u8], mut f: impl FnMut(&mut u8)) {
    let mut index = 0;
    while index < wire.len() {
        let len = wire[index] as usize;
        for octet in &mut wire[index + 1..index + 1 + len] {
            f(octet);
        }
        index += len + 1;
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for label in self.labels().filter(|l| !l.is_empty()) {
            for &octet in label {
                match octet {
                    b'.' | b'\\' => write!(f, "\\{}", octet as char)?,
                    0x21..=0x7e => write!(f, "{}", octet as char)?,
                    _ => write!(f, "\\{:03}", octet)?,
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.wire.eq_ignore_ascii_case(&other.wire)
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for octet in self.wire.iter() {
            state.write_u8(octet.to_ascii_lowercase());
        }
    }
}

/// Parses a domain name from its textual form. The name must be fully
/// qualified. The escape sequences `\DDD` and `\X` from
/// [RFC 1035 § 5.1] are supported.
///
/// [RFC 1035 § 5.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-5.1
impl FromStr for Name {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::StrEmpty);
        } else if s == "." {
            return Ok(Self::root());
        }

        let mut wire = ArrayVec::<u8, MAX_WIRE_LEN>::new();
        let mut n_labels = 0;
        let mut label_start = 0;
        wire.push(0);

        let mut remaining_octets: &[u8] = s.as_ref();
        while let Some(&octet) = remaining_octets.first() {
            if octet == b'.' {
                let label_len = wire.len() - label_start - 1;
                if label_len == 0 {
                    return Err(Error::NullNonTerminal);
                }
                wire[label_start] = label_len as u8;
                n_labels += 1;
                if n_labels >= MAX_N_LABELS {
                    return Err(Error::NameTooLong);
                }
                label_start = wire.len();
                wire.try_push(0).or(Err(Error::NameTooLong))?;
                remaining_octets = &remaining_octets[1..];
                continue;
            }

            let (value, consumed) = if octet == b'\\' {
                let (value, consumed) = parse_escape(&remaining_octets[1..])?;
                (value, consumed + 1)
            } else if !octet.is_ascii() {
                return Err(Error::StrNotAscii);
            } else {
                (octet, 1)
            };
            if wire.len() - label_start > MAX_LABEL_LEN {
                return Err(Error::LabelTooLong);
            }
            wire.try_push(value).or(Err(Error::NameTooLong))?;
            remaining_octets = &remaining_octets[consumed..];
        }

        // The final octet pushed is the null label, unless the text
        // did not end with an (unescaped) dot.
        if label_start != wire.len() - 1 {
            return Err(Error::NonNullTerminal);
        }
        Ok(Self {
            wire: wire.as_slice().into(),
        })
    }
}

/// Parses an escape sequence. We expect `remaining_octets` to start
/// with the octet immediately *after* the backslash that introduces the
/// escape sequence.
fn parse_escape(remaining_octets: &[u8]) -> Result<(u8, usize), Error> {
    match remaining_octets {
        [] => Err(Error::InvalidEscape),
        [a, b, c, ..] if a.is_ascii_digit() && b.is_ascii_digit() && c.is_ascii_digit() => {
            let value = 100 * (a - b'0') as usize + 10 * (b - b'0') as usize + (c - b'0') as usize;
            u8::try_from(value)
                .map(|v| (v, 3))
                .or(Err(Error::InvalidEscape))
        }
        [first, ..] if first.is_ascii_digit() => Err(Error::InvalidEscape),
        [first, ..] => Ok((*first, 1)),
    }
}

////////////////////////////////////////////////////////////////////////
// ITERATION OVER A NAME'S LABELS                                     //
////////////////////////////////////////////////////////////////////////

/// An iterator over the labels of a [`Name`], yielding each label's
/// content octets. Construct one using [`Name::labels`].
#[derive(Clone, Debug)]
pub struct Labels<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for Labels<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.remaining.split_first()?;
        let (label, rest) = rest.split_at(len as usize);
        self.remaining = rest;
        Some(label)
    }
}

impl FusedIterator for Labels<'_> {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(name: &Name) -> u64 {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn root_has_expected_characteristics() {
        let root = Name::root();
        assert!(root.is_root());
        assert_eq!(root.len(), 1);
        assert_eq!(root.wire_repr(), b"\x00");
        assert_eq!(root.to_string(), ".");
    }

    #[test]
    fn fromstr_works() {
        let name: Name = "www.Example.com.".parse().unwrap();
        assert_eq!(name.wire_repr(), b"\x03www\x07Example\x03com\x00");
        assert_eq!(name.len(), 4);
        assert_eq!(name.to_string(), "www.Example.com.");
    }

    #[test]
    fn fromstr_handles_escapes() {
        let name: Name = "a\\.b.\\099om.".parse().unwrap();
        assert_eq!(name.wire_repr(), b"\x03a.b\x03com\x00");
        assert_eq!(name.to_string(), "a\\.b.com.");
    }

    #[test]
    fn fromstr_rejects_bad_input() {
        assert_eq!("".parse::<Name>(), Err(Error::StrEmpty));
        assert_eq!("example.com".parse::<Name>(), Err(Error::NonNullTerminal));
        assert_eq!("example..com.".parse::<Name>(), Err(Error::NullNonTerminal));
        assert_eq!("exämple.com.".parse::<Name>(), Err(Error::StrNotAscii));
        assert_eq!("\\256.".parse::<Name>(), Err(Error::InvalidEscape));
        let long_label = format!("{}.", "a".repeat(64));
        assert_eq!(long_label.parse::<Name>(), Err(Error::LabelTooLong));
        let long_name = "abcdefghi.".repeat(26);
        assert_eq!(long_name.parse::<Name>(), Err(Error::NameTooLong));
    }

    #[test]
    fn eq_and_hash_are_case_insensitive() {
        let upper: Name = "EXAMPLE.COM.".parse().unwrap();
        let lower: Name = "example.com.".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(hash_of(&upper), hash_of(&lower));
        assert!(!upper.eq_exact(&lower));
        assert!(upper.to_lowercase().eq_exact(&lower));
    }

    #[test]
    fn randomize_case_only_touches_letters() {
        let original: Name = "a1-b.example.".parse().unwrap();
        let mut randomized = original.clone();
        randomized.randomize_case(&mut rand::thread_rng());
        assert_eq!(randomized, original);
        assert_eq!(randomized.wire_repr().len(), original.wire_repr().len());
        for (a, b) in randomized.wire_repr().iter().zip(original.wire_repr()) {
            assert!(a == b || (a ^ 0x20 == *b && b.is_ascii_alphabetic()));
        }
    }

    #[test]
    fn labels_iterator_works() {
        let name: Name = "sans.test.".parse().unwrap();
        let labels: Vec<&[u8]> = name.labels().collect();
        assert_eq!(labels, vec![&b"sans"[..], &b"test"[..], &b""[..]]);
    }
}
