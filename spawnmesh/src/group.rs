/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process groups: the application processes a launcher forks under
//! one name, and the session-wide bookkeeping that maps group names
//! and pids back to them.

use std::collections::HashMap;

use spawnnet::ChannelTransport;
use spawnnet::Endpoint;
use spawnnet::Strmap;
use tokio::process::Child;

use crate::collective::broadcast_file;
use crate::collective::gather_strmap;
use crate::collective::signal_from_root;
use crate::collective::signal_to_root;
use crate::launch::fork_proc;
use crate::launch::local_hostname;
use crate::mpir;
use crate::mpir::MpirMode;
use crate::pmi::pmi_exchange;
use crate::ring::ring_exchange;
use crate::session::MPIR_ENV;
use crate::session::PMI_ADDR_ENV;
use crate::telemetry::Phase;
use crate::tree::SpawnTree;
use crate::SessionError;

/// A group of application processes started together under one name.
#[derive(Debug)]
pub struct ProcessGroup {
    pub name: String,
    /// The group-start parameters the group was launched with.
    pub params: Strmap,
    /// Pids of the locally forked members, in launch order.
    pub pids: Vec<u32>,
    /// Join handles for the local members.
    pub children: Vec<Child>,
}

impl ProcessGroup {
    /// The number of locally forked members.
    pub fn num(&self) -> usize {
        self.pids.len()
    }
}

/// The session's two group indexes: name to group, and member pid back
/// to group name. A reaper handling SIGCHLD uses the pid index to find
/// the owning group. Both are written only from the launcher's single
/// task.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: HashMap<String, ProcessGroup>,
    pid_to_name: HashMap<u32, String>,
}

impl GroupRegistry {
    /// Register a group under its name, indexing every member pid.
    pub fn insert(&mut self, group: ProcessGroup) {
        for &pid in &group.pids {
            self.pid_to_name.insert(pid, group.name.clone());
        }
        self.groups.insert(group.name.clone(), group);
    }

    pub fn get(&self, name: &str) -> Option<&ProcessGroup> {
        self.groups.get(name)
    }

    /// The name of the group owning `pid`, if any.
    pub fn group_of_pid(&self, pid: u32) -> Option<&str> {
        self.pid_to_name.get(&pid).map(String::as_str)
    }

    /// Destroy a group, removing both its name mapping and every pid
    /// mapping.
    pub fn remove(&mut self, name: &str) -> Option<ProcessGroup> {
        let group = self.groups.remove(name)?;
        for pid in &group.pids {
            self.pid_to_name.remove(pid);
        }
        Some(group)
    }

    pub fn groups_mut(&mut self) -> impl Iterator<Item = &mut ProcessGroup> {
        self.groups.values_mut()
    }
}

fn required<'a>(map: &'a Strmap, key: &str) -> Result<&'a str, SessionError> {
    map.get(key)
        .ok_or_else(|| SessionError::Config(format!("missing group parameter {key}")))
}

fn flag(map: &Strmap, key: &str) -> Result<bool, SessionError> {
    match required(map, key)? {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(SessionError::Config(format!(
            "{key} must be 0 or 1, got {other:?}"
        ))),
    }
}

/// Start an application process group according to `appmap` (the
/// group-start parameters broadcast from the root): select the
/// bootstrap endpoint, optionally broadcast the application binary,
/// fork `PPN` local processes, and run the bootstrap exchanges they
/// were promised. The group is registered in `registry`; its members
/// are joined at session teardown.
pub async fn process_group_start(
    tree: &mut SpawnTree,
    registry: &mut GroupRegistry,
    session_ep: &Endpoint,
    params: &Strmap,
    appmap: &Strmap,
) -> Result<(), SessionError> {
    let root = tree.is_root();
    let name = required(appmap, "NAME")?.to_string();
    let mut exe = required(appmap, "EXE")?.to_string();
    let cwd = required(appmap, "CWD")?.to_string();
    let ppn: usize = required(appmap, "PPN")?
        .parse()
        .map_err(|_| SessionError::Config("PPN must be a non-negative integer".into()))?;

    let mpir_mode: MpirMode = match params.get("MPIR") {
        Some(value) => value.parse()?,
        None => MpirMode::Unset,
    };

    let use_pmi = flag(appmap, "PMI")?;
    let use_ring = flag(appmap, "RING")?;
    let use_fifo = flag(appmap, "FIFO")?;
    let use_bin_bcast = flag(appmap, "BIN_BCAST")?;

    // The bootstrap endpoint: the session endpoint by default, or a
    // fresh local-transport endpoint when FIFO is requested.
    let phase = Phase::begin(root, "open init endpoint");
    signal_from_root(tree).await?;
    let app_ep = if (use_pmi || use_ring) && use_fifo {
        Some(Endpoint::open(ChannelTransport::Unix).await?)
    } else {
        None
    };
    let ep = app_ep.as_ref().unwrap_or(session_ep);
    signal_to_root(tree).await?;
    phase.end();

    if use_bin_bcast {
        let phase = Phase::begin(root, "bcast app binary");
        signal_from_root(tree).await?;
        let staged =
            broadcast_file(tree, std::path::Path::new(&exe), &std::env::temp_dir()).await?;
        exe = staged.display().to_string();
        signal_to_root(tree).await?;
        phase.end();
    }

    let phase = Phase::begin(root, "launch app procs");
    signal_from_root(tree).await?;
    let mut pids = Vec::with_capacity(ppn);
    let mut children = Vec::with_capacity(ppn);
    for _ in 0..ppn {
        let mut envs = vec![(PMI_ADDR_ENV.to_string(), ep.name())];
        if mpir_mode == MpirMode::App {
            envs.push((MPIR_ENV.to_string(), "1".to_string()));
        }
        let child = fork_proc(params, None, &cwd, &exe, &[], &envs)?;
        let pid = child
            .id()
            .ok_or_else(|| SessionError::Resource("forked child has no pid".into()))?;
        pids.push(pid);
        children.push(child);
    }
    signal_to_root(tree).await?;
    phase.end();

    // Under MPIR=app, rank 0 needs (host, pid, exe) for every
    // application rank before the debugger may attach.
    if mpir_mode == MpirMode::App {
        let phase = Phase::begin(root, "gather app proc info");
        signal_from_root(tree).await?;
        let host = local_hostname();
        let mut procmap = Strmap::new();
        for (i, &pid) in pids.iter().enumerate() {
            let app_rank = tree.rank() * ppn + i;
            procmap.set(format!("H{app_rank}"), &host);
            procmap.set(format!("P{app_rank}"), pid.to_string());
            procmap.set(format!("E{app_rank}"), &exe);
        }
        gather_strmap(tree, &mut procmap).await?;
        signal_to_root(tree).await?;
        phase.end();

        if root {
            tracing::info!("app proc host, pid, exe map:\n{procmap}");
            let total = tree.ranks() * ppn;
            let mut entries = Vec::with_capacity(total);
            for app_rank in 0..total {
                let host = required(&procmap, &format!("H{app_rank}"))?;
                let exe = required(&procmap, &format!("E{app_rank}"))?;
                let pid: i32 = required(&procmap, &format!("P{app_rank}"))?
                    .parse()
                    .map_err(|_| {
                        SessionError::Protocol(format!("bad pid for app rank {app_rank}"))
                    })?;
                entries.push((host.to_string(), exe.to_string(), pid));
            }
            mpir::publish_proctable(&entries);
        }
        // Hold everyone until the debugger has been given its chance.
        signal_from_root(tree).await?;
    }

    if use_pmi {
        pmi_exchange(tree, ep, ppn).await?;
    }
    if use_ring {
        ring_exchange(tree, ep, ppn).await?;
    }

    let phase = Phase::begin(root, "close init endpoint");
    signal_from_root(tree).await?;
    if let Some(fifo_ep) = app_ep {
        fifo_ep.close()?;
    }
    signal_to_root(tree).await?;
    phase.end();

    registry.insert(ProcessGroup {
        name,
        params: appmap.clone(),
        pids,
        children,
    });
    Ok(())
}
