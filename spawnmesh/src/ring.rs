/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The ring-exchange bootstrap: each application process contributes
//! one address and receives the addresses of its two nearest neighbors
//! on a job-wide ring.
//!
//! Locally the launcher collects one `ADDR` per forked process, in
//! accept order. The local processes are already ring-adjacent to one
//! another; only the two ends need outside addresses, which the
//! tree-wide [`ring_scan`] supplies. The launcher then hands each
//! process its rank assignment and `LEFT`/`RIGHT` addresses and
//! disconnects.

use spawnnet::Endpoint;
use spawnnet::Strmap;

use crate::collective::ring_scan;
use crate::collective::signal_from_root;
use crate::collective::signal_to_root;
use crate::telemetry::Phase;
use crate::tree::SpawnTree;
use crate::SessionError;

/// Run the ring exchange for `ppn` locally forked application
/// processes, accepting their connections on `ep`.
pub async fn ring_exchange(
    tree: &mut SpawnTree,
    ep: &Endpoint,
    ppn: usize,
) -> Result<(), SessionError> {
    let root = tree.is_root();
    let exchange = Phase::begin(root, "ring exchange");
    signal_from_root(tree).await?;

    let rank = tree.rank();
    let ranks = tree.ranks() * ppn;

    let phase = Phase::begin(root, "ring accept");
    signal_from_root(tree).await?;
    let mut channels = Vec::with_capacity(ppn);
    for _ in 0..ppn {
        channels.push(ep.accept().await?);
    }
    signal_to_root(tree).await?;
    phase.end();

    let phase = Phase::begin(root, "ring read children");
    signal_from_root(tree).await?;
    let mut maps = Vec::with_capacity(ppn);
    for channel in channels.iter_mut() {
        maps.push(channel.read_strmap().await?);
    }
    signal_to_root(tree).await?;
    phase.end();

    // The subtree scan. Our contribution is the first and last local
    // address; with no local processes the input is empty and the
    // empty slots propagate through the scan.
    let phase = Phase::begin(root, "ring scan");
    signal_from_root(tree).await?;
    let mut input = Strmap::new();
    if ppn > 0 {
        if let Some(leftmost) = maps[0].get("ADDR") {
            input.set("LEFT", leftmost);
        }
        if let Some(rightmost) = maps[ppn - 1].get("ADDR") {
            input.set("RIGHT", rightmost);
        }
    }
    let output = ring_scan(tree, &input).await?;
    signal_to_root(tree).await?;
    phase.end();

    let phase = Phase::begin(root, "ring write children");
    signal_from_root(tree).await?;
    for (i, channel) in channels.iter_mut().enumerate() {
        let mut init = Strmap::new();
        init.set("RANK", (rank * ppn + i).to_string());
        init.set("RANKS", ranks.to_string());
        let left = if i == 0 {
            output.get("LEFT")
        } else {
            maps[i - 1].get("ADDR")
        };
        init.set("LEFT", left.unwrap_or(""));
        let right = if i + 1 < ppn {
            maps[i + 1].get("ADDR")
        } else {
            output.get("RIGHT")
        };
        init.set("RIGHT", right.unwrap_or(""));
        channel.write_strmap(&init).await?;
    }
    signal_to_root(tree).await?;
    phase.end();

    let phase = Phase::begin(root, "ring disconnect");
    signal_from_root(tree).await?;
    for channel in channels.drain(..) {
        channel.disconnect().await?;
    }
    signal_to_root(tree).await?;
    phase.end();

    signal_to_root(tree).await?;
    exchange.end();
    Ok(())
}
