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

//! Implementation of reading and writing of DNS messages.

mod constants;
mod header;
mod question;
pub mod reader;
pub mod writer;
pub use header::{Opcode, Rcode};
pub use question::Question;
pub use reader::Reader;
pub use writer::Writer;

use constants::{HEADER_SIZE, ID_END, ID_START};

/// The largest DNS message that fits in a TCP length prefix, and the
/// receive buffer size used for UDP.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Rewrites the ID of the serialized message in `message`. Messages
/// shorter than a header are left alone.
pub fn set_id(message: &mut [u8], id: u16) {
    if let Some(field) = message.get_mut(ID_START..ID_END) {
        field.copy_from_slice(&id.to_be_bytes());
    }
}

/// Overwrites the QNAME of the first question of `message` with
/// `qname`, octet for octet. This is used to restore the case of a
/// name after case randomization, so it only succeeds if the name
/// present is the same (ignoring case) and uncompressed. Returns
/// whether the QNAME was overwritten.
pub fn overwrite_qname(message: &mut [u8], qname: &crate::name::Name) -> bool {
    let wire = qname.wire_repr();
    match message.get_mut(HEADER_SIZE..HEADER_SIZE + wire.len()) {
        Some(present) if present.eq_ignore_ascii_case(wire) => {
            present.copy_from_slice(wire);
            true
        }
        _ => false,
    }
}
