/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A hierarchical process launcher and bootstrap runtime.
//!
//! A single root launcher, given a list of target hosts, unfurls a
//! k-ary tree of launcher processes across them. Each launcher then
//! forks a configurable number of application processes locally and
//! participates in the collective operations those processes use to
//! discover one another: rank and size assignment, a key/value
//! directory (the PMI exchange), and nearest-neighbor address exchange
//! along a global ring.
//!
//! Layering, bottom up:
//!
//! - [`tree`]: pure k-ary rank arithmetic, and the [`tree::SpawnTree`]
//!   that owns the live parent/child channels.
//! - [`collective`]: signalling waves, broadcast, gather, allgather,
//!   ring-scan, and file broadcast over the tree.
//! - [`session`]: the launcher state machine (unfurl, measurement,
//!   group start, teardown).
//! - [`pmi`] and [`ring`]: the per-application-process bootstrap
//!   protocols.

pub mod collective;
pub mod group;
pub mod launch;
pub mod mpir;
pub mod pmi;
pub mod ring;
pub mod session;
pub mod telemetry;
pub mod tree;

pub use session::Session;

use spawnnet::ChannelError;

/// The error taxonomy for launcher operations. Every kind other than
/// [`SessionError::Config`] is raised after children may exist; the
/// policy for all of them is fail-stop of the whole job.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A parameter was missing, unparseable, or out of range.
    #[error("config: {0}")]
    Config(String),

    /// Forking or exec'ing a process failed.
    #[error("spawn {0}: {1}")]
    Spawn(String, #[source] std::io::Error),

    /// Channel I/O failed or a peer closed mid-protocol.
    #[error(transparent)]
    Transport(#[from] ChannelError),

    /// A peer sent a token other than the one its state machine owes.
    #[error("protocol: {0}")]
    Protocol(String),

    /// An allocation or resource limit failed.
    #[error("resource: {0}")]
    Resource(String),

    /// File I/O failed (file broadcast, launcher staging).
    #[error("io {0}: {1}")]
    Io(String, #[source] std::io::Error),
}
