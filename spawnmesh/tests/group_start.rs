/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Group start under `MPIR=app`, run against a real two-launcher tree.
//!
//! This lives in its own test binary because publishing the debugger
//! process table is a once-per-process operation; the library tests
//! already publish a table of their own.

use std::os::unix::fs::PermissionsExt;
use std::ptr::addr_of;

use spawnmesh::group::process_group_start;
use spawnmesh::group::GroupRegistry;
use spawnmesh::launch::local_hostname;
use spawnmesh::mpir;
use spawnmesh::tree::ChildRecord;
use spawnmesh::tree::SpawnTree;
use spawnnet::Channel;
use spawnnet::ChannelTransport;
use spawnnet::Endpoint;
use spawnnet::Strmap;

/// Two launchers start one process each under `MPIR=app`: every rank
/// is released past the debugger gate, the forked processes see
/// `MV2_MPIR=1`, and rank 0 publishes a process table covering both
/// application ranks.
#[tokio::test]
async fn test_group_start_mpir_app_publishes_proctable() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("mpir-env");
    let script = dir.path().join("report-mpir");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho \"$MV2_MPIR\" > {}\n", marker.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let script = script.display().to_string();
    let params: Strmap = [("LOCAL", "direct"), ("MPIR", "app")].into_iter().collect();
    let appmap: Strmap = [
        ("NAME", "GROUP_0"),
        ("EXE", script.as_str()),
        ("CWD", "/"),
        ("PPN", "1"),
        ("PMI", "0"),
        ("RING", "0"),
        ("FIFO", "0"),
        ("BIN_BCAST", "0"),
    ]
    .into_iter()
    .collect();

    let (to_child, to_parent) = Channel::pair();
    let root_tree = SpawnTree::new(
        0,
        2,
        None,
        vec![ChildRecord {
            rank: 1,
            host: "localhost".to_string(),
            pid: None,
            channel: to_child,
        }],
    );
    let child_tree = SpawnTree::new(1, 2, Some(to_parent), Vec::new());

    let run = |mut tree: SpawnTree, params: Strmap, appmap: Strmap| async move {
        let mut registry = GroupRegistry::default();
        let ep = Endpoint::open(ChannelTransport::Unix).await.unwrap();
        process_group_start(&mut tree, &mut registry, &ep, &params, &appmap)
            .await
            .unwrap();
        registry
    };
    // Both group starts must complete: the gather reaches rank 0 and
    // the release after the publish reaches rank 1.
    let (root_registry, child_registry) = tokio::join!(
        run(root_tree, params.clone(), appmap.clone()),
        run(child_tree, params, appmap)
    );

    let mut pids = Vec::new();
    for mut registry in [root_registry, child_registry] {
        let group = registry.remove("GROUP_0").unwrap();
        assert_eq!(group.num(), 1);
        pids.push(group.pids[0]);
        for mut child in group.children {
            assert!(child.wait().await.unwrap().success());
        }
    }

    // The forked processes ran under the debugger convention.
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "1");

    // Rank 0 published one entry per application rank, in rank order.
    // SAFETY: reading back what publish_proctable wrote; the table is
    // leaked and no longer written.
    unsafe {
        assert_eq!(addr_of!(mpir::MPIR_proctable_size).read_volatile(), 2);
        assert_eq!(
            addr_of!(mpir::MPIR_debug_state).read_volatile(),
            mpir::MPIR_DEBUG_SPAWNED
        );
        let table = addr_of!(mpir::MPIR_proctable).read_volatile();
        let host = local_hostname();
        for (app_rank, &pid) in pids.iter().enumerate() {
            let desc = &*table.add(app_rank);
            assert_eq!(
                std::ffi::CStr::from_ptr(desc.host_name).to_str().unwrap(),
                host
            );
            assert_eq!(
                std::ffi::CStr::from_ptr(desc.executable_name)
                    .to_str()
                    .unwrap(),
                script
            );
            assert_eq!(desc.pid, pid as i32);
        }
    }
}
