// Copyright © 2021 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of gnet, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Host identity: an `(address, port)` pair.

use std::{
    fmt::{self, Display},
    net::IpAddr,
    str::FromStr,
};

use thiserror::Error;

/// A candidate peer, identified by address and port.
///
/// Port 0 is the canonical port inside address-only cache classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Host {
    addr: IpAddr,
    port: u16,
}

impl Host {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addr {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            IpAddr::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseHostError {
    #[error("missing port separator")]
    MissingPort,

    #[error("malformed address")]
    Addr,

    #[error("malformed port")]
    Port,
}

impl FromStr for Host {
    type Err = ParseHostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, port) = if let Some(rest) = s.strip_prefix('[') {
            // Bracketed v6 form: `[::1]:6346`.
            let end = rest.find(']').ok_or(ParseHostError::Addr)?;
            let port = rest[end + 1..]
                .strip_prefix(':')
                .ok_or(ParseHostError::MissingPort)?;
            (&rest[..end], port)
        } else {
            let colon = s.rfind(':').ok_or(ParseHostError::MissingPort)?;
            (&s[..colon], &s[colon + 1..])
        };
        Ok(Self {
            addr: addr.parse().map_err(|_| ParseHostError::Addr)?,
            port: port.parse().map_err(|_| ParseHostError::Port)?,
        })
    }
}

/// Is `port` usable as a Gnutella listening port?
pub fn port_is_valid(port: u16) -> bool {
    port != 0
}

/// Can `addr` be reached from the open internet?
///
/// Loopback, unspecified, link-local, multicast and the private ranges are
/// not routable; everything else is. Bogus and hostile address filtering is
/// an external concern (see [`crate::hcache::NetworkView`]).
pub fn is_routable(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast())
        },
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // fe80::/10 link-local and fc00::/7 unique-local.
                || (seg[0] & 0xffc0) == 0xfe80
                || (seg[0] & 0xfe00) == 0xfc00)
        },
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn host(s: &str) -> Host {
        s.parse().expect("test host parses")
    }

    #[test]
    fn display_round_trips() {
        for s in &["1.2.3.4:6346", "[::1]:6346", "[2001:db8::1]:0"] {
            assert_eq!(&host(s).to_string(), s);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("1.2.3.4".parse::<Host>(), Err(ParseHostError::MissingPort));
        assert_eq!("foo:123".parse::<Host>(), Err(ParseHostError::Addr));
        assert_eq!("1.2.3.4:bar".parse::<Host>(), Err(ParseHostError::Port));
        assert_eq!("[::1:6346".parse::<Host>(), Err(ParseHostError::Addr));
        assert_eq!("[::1]6346".parse::<Host>(), Err(ParseHostError::MissingPort));
    }

    #[test]
    fn routability() {
        assert!(is_routable(&"8.8.8.8".parse().unwrap()));
        assert!(is_routable(&"2001:db8::1".parse().unwrap()));
        for addr in &[
            "127.0.0.1",
            "0.0.0.0",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.0.1",
            "224.0.0.1",
            "::1",
            "fe80::1",
            "fc00::1",
            "ff02::1",
        ] {
            assert!(!is_routable(&addr.parse().unwrap()), "{}", addr);
        }
    }
}
