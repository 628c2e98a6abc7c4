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

//! Crate-private utilities.

use std::net::{IpAddr, SocketAddr};

/// Converts an IPv4-mapped IPv6 socket address (`::ffff:a.b.c.d`) into
/// the equivalent IPv4 socket address. Other addresses are returned
/// unchanged.
///
/// Dual-stack sockets report IPv4 peers in the mapped form, so
/// addresses must be canonicalized before they are compared.
pub fn canonical_socket_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_socket_addr_unmaps_ipv4() {
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:53".parse().unwrap();
        let plain: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();
        assert_eq!(canonical_socket_addr(mapped), plain);
        assert_eq!(canonical_socket_addr(plain), plain);
        assert_eq!(canonical_socket_addr(v6), v6);
    }
}
