/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use clap::Parser;
use spawnmesh::telemetry;
use spawnmesh::Session;

/// Hierarchical process launcher. Unfurls a k-ary tree of launchers
/// over the given hosts, forks application processes on each, and
/// bootstraps them. The launcher itself is always rank 0 on the local
/// host; configuration beyond the host list rides in `MV2_SPAWN_*`
/// environment variables.
#[derive(Parser)]
#[command(name = "mpispawn")]
struct Cli {
    /// Target host names, one launcher each (rank 1 onward).
    hosts: Vec<String>,
}

#[tokio::main]
async fn main() {
    telemetry::initialize();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!("session failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let session = Session::new(cli.hosts).await?;
    session.run().await?;
    Ok(())
}
