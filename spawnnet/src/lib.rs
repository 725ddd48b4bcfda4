/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reliable, connection-oriented byte-stream channels between launcher
//! processes, together with the ordered string-map that all launcher
//! protocols use as their wire currency.
//!
//! An [`Endpoint`] is a local listener with a printable name (its
//! [`ChannelAddr`]); peers connect to that name to obtain a [`Channel`],
//! an exclusively owned duplex byte stream. Reads and writes are exact:
//! a successful `read(n)` returns exactly `n` bytes, in order, with no
//! interleaving from any other channel.
//!
//! Three message kinds exist on the wire: raw bytes, length-prefixed
//! strings, and packed [`Strmap`]s. Every multi-byte integer is
//! big-endian.

mod addr;
mod channel;
mod endpoint;
mod strmap;

pub use addr::ChannelAddr;
pub use addr::ChannelTransport;
pub use channel::Channel;
pub use channel::MAX_FRAME_LENGTH;
pub use endpoint::Endpoint;
pub use strmap::Strmap;
pub use strmap::StrmapError;

/// The type of error produced by endpoint and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The peer's endpoint refused (or could not receive) the connection.
    #[error("connection refused: {0}")]
    ConnectRefused(ChannelAddr),

    /// The peer closed the channel mid-payload.
    #[error("peer closed channel")]
    PeerClosed,

    /// The underlying transport failed.
    #[error("transport: {0}")]
    Transport(#[source] std::io::Error),

    /// The endpoint name could not be parsed or dispatched.
    #[error("invalid endpoint name: {0}")]
    InvalidName(String),
}
