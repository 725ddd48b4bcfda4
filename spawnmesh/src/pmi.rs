/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The PMI-style key/value bootstrap between a launcher and the
//! application processes it forked.
//!
//! Each application process connects to the launcher's endpoint and
//! runs a fixed dialogue: it receives its rank assignment, commits a
//! key/value map, passes a job-wide barrier, performs two GET rounds
//! against the allgathered directory, and finalizes. The barrier is
//! where the launchers stitch their local maps into the job-wide view:
//! once every local process has committed, the launchers run an
//! allgather over the spawn tree, so a process may GET any key
//! committed anywhere in the job.
//!
//! A process must not issue GET before it has received BARRIER, and
//! the launcher never answers a GET before its allgather completed.
//! Any out-of-order token aborts the job.

use spawnnet::Channel;
use spawnnet::Endpoint;
use spawnnet::Strmap;

use crate::collective::allgather_strmap;
use crate::collective::signal_from_root;
use crate::collective::signal_to_root;
use crate::telemetry::Phase;
use crate::tree::SpawnTree;
use crate::SessionError;

/// The number of GET rounds every application process performs.
const GET_ROUNDS: usize = 2;

async fn expect_token(channel: &mut Channel, expected: &str) -> Result<(), SessionError> {
    let token = channel.read_str().await?;
    if token != expected {
        return Err(SessionError::Protocol(format!(
            "expected {expected}, got {token:?}"
        )));
    }
    Ok(())
}

/// Run the PMI exchange for `ppn` locally forked application
/// processes, accepting their connections on `ep`.
pub async fn pmi_exchange(
    tree: &mut SpawnTree,
    ep: &Endpoint,
    ppn: usize,
) -> Result<(), SessionError> {
    let root = tree.is_root();
    let exchange = Phase::begin(root, "pmi exchange");
    signal_from_root(tree).await?;

    let rank = tree.rank();
    let ranks = tree.ranks() * ppn;
    let jobid = 0;

    // Wait for every local process to connect.
    let phase = Phase::begin(root, "pmi accept");
    signal_from_root(tree).await?;
    let mut channels = Vec::with_capacity(ppn);
    for _ in 0..ppn {
        channels.push(ep.accept().await?);
    }
    signal_to_root(tree).await?;
    phase.end();

    // Hand each process its identity.
    let phase = Phase::begin(root, "pmi init info");
    signal_from_root(tree).await?;
    for (i, channel) in channels.iter_mut().enumerate() {
        let mut init = Strmap::new();
        init.set("RANK", (rank * ppn + i).to_string());
        init.set("RANKS", ranks.to_string());
        init.set("JOBID", jobid.to_string());
        channel.write_strmap(&init).await?;
    }
    signal_to_root(tree).await?;
    phase.end();

    // Collect the committed key/value pairs. A process announcing
    // anything but BARRIER here has run ahead of the protocol.
    let phase = Phase::begin(root, "pmi read children");
    signal_from_root(tree).await?;
    let mut directory = Strmap::new();
    for channel in channels.iter_mut() {
        expect_token(channel, "BARRIER").await?;
        let committed = channel.read_strmap().await?;
        directory.merge(&committed);
    }
    signal_to_root(tree).await?;
    phase.end();

    // The job-wide synchronization point.
    let phase = Phase::begin(root, "pmi allgather");
    signal_from_root(tree).await?;
    allgather_strmap(tree, &mut directory).await?;
    signal_to_root(tree).await?;
    phase.end();

    let phase = Phase::begin(root, "pmi write children");
    signal_from_root(tree).await?;
    for channel in channels.iter_mut() {
        channel.write_str("BARRIER").await?;
    }
    for _ in 0..GET_ROUNDS {
        for channel in channels.iter_mut() {
            expect_token(channel, "GET").await?;
            let key = channel.read_str().await?;
            let value = directory.get(&key).unwrap_or("");
            channel.write_str(value).await?;
        }
    }
    signal_to_root(tree).await?;
    phase.end();

    let phase = Phase::begin(root, "pmi finalize");
    signal_from_root(tree).await?;
    for mut channel in channels.drain(..) {
        expect_token(&mut channel, "FINALIZE").await?;
        channel.disconnect().await?;
    }
    signal_to_root(tree).await?;
    phase.end();

    signal_to_root(tree).await?;
    exchange.end();

    if root {
        tracing::info!("PMI directory:\n{directory}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use spawnnet::Channel;
    use spawnnet::ChannelAddr;
    use spawnnet::ChannelError;
    use spawnnet::ChannelTransport;
    use tokio::sync::oneshot;

    use super::*;
    use crate::tree::testing::build_tree;

    /// A well-behaved application process end of the protocol.
    async fn pmi_client(
        addr: ChannelAddr,
        commit: Strmap,
        gets: [String; GET_ROUNDS],
    ) -> (Strmap, Vec<String>) {
        let mut ch = Channel::connect(&addr).await.unwrap();
        let init = ch.read_strmap().await.unwrap();
        ch.write_str("BARRIER").await.unwrap();
        ch.write_strmap(&commit).await.unwrap();
        assert_eq!(ch.read_str().await.unwrap(), "BARRIER");
        let mut values = Vec::new();
        for key in gets {
            ch.write_str("GET").await.unwrap();
            ch.write_str(&key).await.unwrap();
            values.push(ch.read_str().await.unwrap());
        }
        ch.write_str("FINALIZE").await.unwrap();
        (init, values)
    }

    #[tokio::test]
    async fn test_pmi_exchange_job_wide() {
        let n = 4;
        let ppn = 1;
        let mut launchers = Vec::new();
        let mut apps = Vec::new();
        for mut tree in build_tree(n, 2) {
            let rank = tree.rank();
            let ep = Endpoint::open(ChannelTransport::Unix).await.unwrap();
            let commit: Strmap = [(format!("k{rank}"), format!("v{rank}"))]
                .into_iter()
                .collect();
            let gets = [format!("k{}", (rank + 1) % n), "no-such-key".to_string()];
            apps.push(tokio::spawn(pmi_client(ep.addr().clone(), commit, gets)));
            launchers.push(async move { pmi_exchange(&mut tree, &ep, ppn).await });
        }
        for result in join_all(launchers).await {
            result.unwrap();
        }
        for (rank, app) in apps.into_iter().enumerate() {
            let (init, values) = app.await.unwrap();
            assert_eq!(init.get("RANK"), Some(rank.to_string().as_str()));
            assert_eq!(init.get("RANKS"), Some(n.to_string().as_str()));
            assert_eq!(init.get("JOBID"), Some("0"));
            // The committed value of the owning rank, then the empty
            // string for the absent key.
            assert_eq!(values[0], format!("v{}", (rank + 1) % n));
            assert_eq!(values[1], "");
        }
    }

    #[tokio::test]
    async fn test_get_before_barrier_aborts() {
        let mut tree = build_tree(1, 2).remove(0);
        let ep = Endpoint::open(ChannelTransport::Unix).await.unwrap();
        let addr = ep.addr().clone();

        // The violator connects first so the launcher reads it first.
        let (connected_tx, connected_rx) = oneshot::channel();
        let violator = tokio::spawn({
            let addr = addr.clone();
            async move {
                let mut ch = Channel::connect(&addr).await.unwrap();
                connected_tx.send(()).unwrap();
                let _init = ch.read_strmap().await.unwrap();
                // GET before BARRIER. The launcher may tear the
                // channel down between these writes.
                ch.write_str("GET").await.unwrap();
                let _ = ch.write_str("some-key").await;
                ch.read_str().await
            }
        });
        let bystander = tokio::spawn(async move {
            connected_rx.await.unwrap();
            let mut ch = Channel::connect(&addr).await.unwrap();
            let _init = ch.read_strmap().await.unwrap();
            // The launcher may already be tearing down; only the
            // final read is load-bearing: BARRIER must never arrive.
            let _ = ch.write_str("BARRIER").await;
            let _ = ch.write_strmap(&Strmap::new()).await;
            ch.read_str().await
        });

        let err = pmi_exchange(&mut tree, &ep, 2).await.unwrap_err();
        assert!(
            matches!(&err, SessionError::Protocol(msg) if msg.contains("BARRIER")),
            "unexpected error: {err}"
        );
        drop(ep);
        drop(tree);

        assert!(matches!(
            violator.await.unwrap(),
            Err(ChannelError::PeerClosed)
        ));
        assert!(matches!(
            bystander.await.unwrap(),
            Err(ChannelError::PeerClosed)
        ));
    }
}
