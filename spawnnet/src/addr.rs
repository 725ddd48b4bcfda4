/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Endpoint names. A [`ChannelAddr`] is the printable, parseable form of
//! a listener address; the transport kind is encoded in the name so that
//! `connect` can dispatch on it.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::ChannelError;

/// Types of channel transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelTransport {
    /// Transport over a TCP connection.
    Tcp,

    /// Transport over a Unix domain socket.
    Unix,
}

impl fmt::Display for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

impl FromStr for ChannelTransport {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            other => Err(ChannelError::InvalidName(other.to_string())),
        }
    }
}

/// The address of an endpoint. Displayed as `<kind>!<rest>`, e.g.
/// `tcp!10.1.2.3:4567` or `unix!/tmp/spawnnet-a1b2c3d4`. `Display` and
/// `FromStr` round-trip, so an address may be carried through
/// environment variables and parameter maps as an opaque string.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelAddr {
    /// A TCP socket address.
    Tcp(SocketAddr),

    /// A Unix domain socket path.
    Unix(PathBuf),
}

impl ChannelAddr {
    /// The transport kind this address dispatches to.
    pub fn transport(&self) -> ChannelTransport {
        match self {
            Self::Tcp(_) => ChannelTransport::Tcp,
            Self::Unix(_) => ChannelTransport::Unix,
        }
    }
}

impl fmt::Display for ChannelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp!{}", addr),
            Self::Unix(path) => write!(f, "unix!{}", path.display()),
        }
    }
}

impl FromStr for ChannelAddr {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once('!')
            .ok_or_else(|| ChannelError::InvalidName(s.to_string()))?;
        match kind.parse::<ChannelTransport>()? {
            ChannelTransport::Tcp => rest
                .parse::<SocketAddr>()
                .map(Self::Tcp)
                .map_err(|_| ChannelError::InvalidName(s.to_string())),
            ChannelTransport::Unix if !rest.is_empty() => {
                Ok(Self::Unix(PathBuf::from(rest)))
            }
            ChannelTransport::Unix => Err(ChannelError::InvalidName(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        for addr in [
            ChannelAddr::Tcp("127.0.0.1:8080".parse().unwrap()),
            ChannelAddr::Tcp("[::1]:1234".parse().unwrap()),
            ChannelAddr::Unix(PathBuf::from("/tmp/spawnnet-abcd1234")),
        ] {
            let parsed: ChannelAddr = addr.to_string().parse().unwrap();
            assert_eq!(parsed, addr);
            assert_eq!(parsed.transport(), addr.transport());
        }
    }

    #[test]
    fn test_invalid() {
        for name in ["", "tcp", "tcp!", "tcp!nonsense", "unix!", "ibud!0x1234", "!/tmp/x"] {
            assert!(
                name.parse::<ChannelAddr>().is_err(),
                "expected parse failure for {name:?}"
            );
        }
    }
}
