/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The launcher session: one per launcher process.
//!
//! The root builds the parameter map from its environment and argv and
//! owns host 0; every other launcher is told who it is through two
//! environment variables set by its parent ([`SPAWN_PARENT_ENV`] and
//! [`SPAWN_ID_ENV`]), connects back, and receives the full parameter
//! map over the wire. After the tree is unfurled the parameter map is
//! read-only: every collective that follows sees a stable view.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use spawnnet::Channel;
use spawnnet::ChannelAddr;
use spawnnet::ChannelTransport;
use spawnnet::Endpoint;
use spawnnet::Strmap;
use tokio::process::Child;

use crate::collective::allgather_strmap;
use crate::collective::broadcast_strmap;
use crate::collective::critical_path;
use crate::collective::gather_strmap;
use crate::collective::signal_from_root;
use crate::collective::signal_to_root;
use crate::group::process_group_start;
use crate::group::GroupRegistry;
use crate::launch::fork_copy;
use crate::launch::fork_proc;
use crate::launch::is_local_host;
use crate::launch::local_hostname;
use crate::launch::path_search;
use crate::launch::stage_to_scratch;
use crate::launch::LocalLaunch;
use crate::launch::RemoteShell;
use crate::mpir;
use crate::mpir::MpirMode;
use crate::telemetry::Phase;
use crate::tree::ChildRecord;
use crate::tree::KaryTree;
use crate::tree::SpawnTree;
use crate::SessionError;

/// Set on every forked non-root launcher: the parent's endpoint name.
pub const SPAWN_PARENT_ENV: &str = "MV2_SPAWN_PARENT";
/// Set on every forked non-root launcher: its launcher rank.
pub const SPAWN_ID_ENV: &str = "MV2_SPAWN_ID";

/// Root-only configuration.
pub const SPAWN_NET_ENV: &str = "MV2_SPAWN_NET";
pub const SPAWN_DEGREE_ENV: &str = "MV2_SPAWN_DEGREE";
pub const SPAWN_SH_ENV: &str = "MV2_SPAWN_SH";
pub const SPAWN_LOCAL_ENV: &str = "MV2_SPAWN_LOCAL";
pub const SPAWN_COPY_ENV: &str = "MV2_SPAWN_COPY";
pub const SPAWN_DBG_ENV: &str = "MV2_SPAWN_DBG";
pub const SPAWN_EXE_ENV: &str = "MV2_SPAWN_EXE";
pub const SPAWN_PPN_ENV: &str = "MV2_SPAWN_PPN";
pub const SPAWN_PMI_ENV: &str = "MV2_SPAWN_PMI";
pub const SPAWN_RING_ENV: &str = "MV2_SPAWN_RING";
pub const SPAWN_FIFO_ENV: &str = "MV2_SPAWN_FIFO";
pub const SPAWN_BCAST_BIN_ENV: &str = "MV2_SPAWN_BCAST_BIN";

/// Exported to every application process: the bootstrap endpoint name.
pub const PMI_ADDR_ENV: &str = "MV2_PMI_ADDR";
/// Exported to application processes running under the debugger.
pub const MPIR_ENV: &str = "MV2_MPIR";

/// Typed, parse-on-read accessors over the parameter strmap. All
/// configuration travels as strings for wire portability; bad values
/// surface here as [`SessionError::Config`].
struct Params<'a>(&'a Strmap);

impl<'a> Params<'a> {
    fn required(&self, key: &str) -> Result<&'a str, SessionError> {
        self.0
            .get(key)
            .ok_or_else(|| SessionError::Config(format!("missing parameter {key}")))
    }

    fn usize(&self, key: &str) -> Result<usize, SessionError> {
        self.required(key)?.parse().map_err(|_| {
            SessionError::Config(format!("parameter {key} must be a non-negative integer"))
        })
    }

    fn flag(&self, key: &str) -> Result<bool, SessionError> {
        match self.required(key)? {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(SessionError::Config(format!(
                "parameter {key} must be 0 or 1, got {other:?}"
            ))),
        }
    }

    /// The host name recorded for launcher rank `rank`.
    fn host(&self, rank: usize) -> Result<&'a str, SessionError> {
        self.0
            .get(&rank.to_string())
            .ok_or_else(|| SessionError::Config(format!("no host recorded for rank {rank}")))
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_flag(name: &str) -> Result<String, SessionError> {
    match env_or(name, "0").as_str() {
        value @ ("0" | "1") => Ok(value.to_string()),
        other => Err(SessionError::Config(format!(
            "{name} must be 0 or 1, got {other:?}"
        ))),
    }
}

/// The root of one launcher's live state: its endpoint, the parameter
/// map, and the process-group indexes. The spawn tree is materialized
/// by [`Session::run`] and owned by the unfurl.
pub struct Session {
    parent: Option<ChannelAddr>,
    spawn_id: usize,
    endpoint: Endpoint,
    params: Strmap,
    registry: GroupRegistry,
}

impl Session {
    /// Construct the session. At the root this parses argv hosts and
    /// the `MV2_SPAWN_*` environment into the parameter map, rejecting
    /// bad configuration before anything is forked, and opens the
    /// listening endpoint. On a non-root launcher it only
    /// opens the endpoint; parameters arrive from the parent during
    /// unfurl.
    pub async fn new(hosts: Vec<String>) -> Result<Self, SessionError> {
        let parent = match std::env::var(SPAWN_PARENT_ENV) {
            Ok(name) => Some(name.parse::<ChannelAddr>()?),
            Err(_) => None,
        };
        let spawn_id = match std::env::var(SPAWN_ID_ENV) {
            Ok(id) => id
                .parse()
                .map_err(|_| SessionError::Config(format!("bad {SPAWN_ID_ENV}: {id:?}")))?,
            Err(_) => 0,
        };
        if parent.is_some() != (spawn_id != 0) {
            return Err(SessionError::Config(format!(
                "{SPAWN_PARENT_ENV} and {SPAWN_ID_ENV} must be set together"
            )));
        }

        let mut params = Strmap::new();
        let endpoint = match &parent {
            Some(parent_addr) => {
                // Same transport family as the parent.
                Endpoint::open(parent_addr.transport()).await?
            }
            None => {
                Self::root_params(&mut params, &hosts).await?;
                let transport = match env_or(SPAWN_NET_ENV, "tcp").as_str() {
                    "tcp" => ChannelTransport::Tcp,
                    "ibud" => {
                        return Err(SessionError::Config(
                            "ibud transport is not supported in this build".into(),
                        ));
                    }
                    other => {
                        return Err(SessionError::Config(format!(
                            "{SPAWN_NET_ENV} must be \"tcp\" or \"ibud\", got {other:?}"
                        )));
                    }
                };
                let endpoint = Endpoint::open(transport).await?;
                tracing::info!("spawn parameters map:\n{params}");
                endpoint
            }
        };

        Ok(Self {
            parent,
            spawn_id,
            endpoint,
            params,
            registry: GroupRegistry::default(),
        })
    }

    /// Populate the root's parameter map from the environment and the
    /// host list.
    async fn root_params(params: &mut Strmap, hosts: &[String]) -> Result<(), SessionError> {
        // Debugger attach: opted in by the debugger itself or by
        // MV2_SPAWN_DBG.
        let dbg = std::env::var(SPAWN_DBG_ENV).ok();
        if mpir::being_debugged() || dbg.is_some() {
            mpir::mark_starter();
            let mode = dbg.as_deref().unwrap_or("spawn");
            // Surface bad values now, not at attach time.
            let _: MpirMode = mode.parse()?;
            params.set("MPIR", mode);
        }

        let copy = env_flag(SPAWN_COPY_ENV)?;
        params.set("COPY", &copy);

        // The launcher executable children will exec, optionally
        // staged into scratch first.
        let exe = std::env::current_exe()
            .map_err(|err| SessionError::Io("current_exe".into(), err))?;
        let exe = if copy == "1" {
            stage_to_scratch(&exe, &std::env::temp_dir()).await?
        } else {
            exe
        };
        params.set("EXE", exe.display().to_string());

        // This launcher is always rank 0 on its own host.
        params.set("N", (hosts.len() + 1).to_string());
        params.set("0", local_hostname());
        for (i, host) in hosts.iter().enumerate() {
            params.set((i + 1).to_string(), host);
        }

        let degree = env_or(SPAWN_DEGREE_ENV, "2");
        match degree.parse::<usize>() {
            Ok(d) if d >= 2 => params.set("DEG", &degree),
            _ => {
                return Err(SessionError::Config(format!(
                    "{SPAWN_DEGREE_ENV} must be an integer >= 2, got {degree:?}"
                )));
            }
        }

        let sh = env_or(SPAWN_SH_ENV, "rsh");
        let _: RemoteShell = sh.parse()?;
        params.set("SH", &sh);

        let local = env_or(SPAWN_LOCAL_ENV, "direct");
        let _: LocalLaunch = local.parse()?;
        params.set("LOCAL", &local);

        // Resolve helper commands once; children inherit the absolute
        // paths through the parameter map.
        for command in ["ssh", "scp", "rsh", "rcp", "sh", "env"] {
            match path_search(command) {
                Some(path) => params.set(command, path.display().to_string()),
                None => params.set(command, command),
            }
        }
        Ok(())
    }

    /// Run the session to completion: unfurl the tree, run the
    /// measurement collectives, start the application process group,
    /// and wait for every locally forked child.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let root = self.parent.is_none();
        let unfurl_phase = Phase::begin(root, "unfurl tree");
        let (mut tree, mut launcher_children, times) = self.unfurl().await?;
        signal_to_root(&mut tree).await?;
        unfurl_phase.end();

        self.measurement(&mut tree).await?;

        // Group-start parameters originate at the root and reach
        // every launcher by broadcast.
        let mut appmap = Strmap::new();
        if tree.is_root() {
            appmap = self.app_params()?;
            tracing::info!("application parameters map:\n{appmap}");
        }
        let phase = Phase::begin(root, "broadcast app params");
        broadcast_strmap(&mut tree, &mut appmap).await?;
        signal_to_root(&mut tree).await?;
        phase.end();

        process_group_start(
            &mut tree,
            &mut self.registry,
            &self.endpoint,
            &self.params,
            &appmap,
        )
        .await?;

        // Report the slowest root-to-leaf path of the timed unfurl
        // steps.
        let labels = [
            "parent connect",
            "parent params",
            "launcher copy",
            "children launch",
            "children connect",
            "children params",
        ];
        if let Some(totals) = critical_path(&mut tree, &times).await? {
            for (label, nanos) in labels.iter().zip(totals) {
                tracing::info!("{} = {:.6}", label, nanos as f64 / 1e9);
            }
        }

        // A staged launcher binary is no longer needed once the tree
        // is up and the group has started.
        if Params(&self.params).flag("COPY")? {
            let _ = std::fs::remove_file(Params(&self.params).required("EXE")?);
        }

        let phase = Phase::begin(root, "wait for completion");
        signal_from_root(&mut tree).await?;
        for child in &mut launcher_children {
            let status = child
                .wait()
                .await
                .map_err(|err| SessionError::Spawn("waitpid".into(), err))?;
            if !status.success() {
                tracing::warn!("child launcher exited with {status}");
            }
        }
        for group in self.registry.groups_mut() {
            for child in &mut group.children {
                let status = child
                    .wait()
                    .await
                    .map_err(|err| SessionError::Spawn("waitpid".into(), err))?;
                if !status.success() {
                    tracing::warn!("application process exited with {status}");
                }
            }
        }
        phase.end();
        Ok(())
    }

    /// Build the spawn tree: handshake with the parent, fork a
    /// launcher per child rank, accept the children's connect-backs,
    /// and install each channel in the slot its ID names. Returns the
    /// tree, the local fork handles, and the six timed step durations
    /// in nanoseconds.
    async fn unfurl(
        &mut self,
    ) -> Result<(SpawnTree, Vec<Child>, [u64; 6]), SessionError> {
        let mut times = [0u64; 6];
        let root = self.parent.is_none();

        let phase = Phase::begin(root, "connect back to parent");
        let parent_channel = match &self.parent {
            Some(addr) => {
                let started = Instant::now();
                let mut channel = Channel::connect(addr).await?;
                times[0] = started.elapsed().as_nanos() as u64;

                let started = Instant::now();
                let mut idmap = Strmap::new();
                idmap.set("ID", self.spawn_id.to_string());
                idmap.set("PID", std::process::id().to_string());
                channel.write_strmap(&idmap).await?;
                self.params = channel.read_strmap().await?;
                times[1] = started.elapsed().as_nanos() as u64;
                Some(channel)
            }
            None => None,
        };
        phase.end();

        let p = Params(&self.params);
        let ranks = p.usize("N")?;
        let degree = p.usize("DEG")?;
        if degree < 2 {
            return Err(SessionError::Config(format!(
                "DEG must be >= 2, got {degree}"
            )));
        }
        let rank = self.spawn_id;
        if rank >= ranks {
            return Err(SessionError::Config(format!(
                "rank {rank} out of range for {ranks} launchers"
            )));
        }
        let kary = KaryTree::new(rank, ranks, degree);

        let copy = p.flag("COPY")?;
        let exe = p.required("EXE")?.to_string();
        let cwd = std::env::current_dir()
            .map_err(|err| SessionError::Io("getcwd".into(), err))?
            .display()
            .to_string();

        // Stage the launcher onto remote child hosts before forking
        // anything there; all copies are joined first.
        let started = Instant::now();
        if copy {
            let phase = Phase::begin(root, "copy launcher exe");
            let mut helpers = Vec::new();
            for &child_rank in &kary.child_ranks {
                let host = p.host(child_rank)?;
                if !is_local_host(host) {
                    helpers.push(fork_copy(&self.params, host, &exe)?);
                }
            }
            let statuses =
                futures::future::try_join_all(helpers.iter_mut().map(|child| child.wait()))
                    .await
                    .map_err(|err| SessionError::Spawn("remote copy".into(), err))?;
            for status in statuses {
                if !status.success() {
                    tracing::warn!("remote copy helper exited with {status}");
                }
            }
            phase.end();
        }
        times[2] = started.elapsed().as_nanos() as u64;

        let started = Instant::now();
        let phase = Phase::begin(root, "launch children");
        let mut slot_of = HashMap::new();
        let mut child_hosts = Vec::with_capacity(kary.child_ranks.len());
        let mut launcher_children = Vec::with_capacity(kary.child_ranks.len());
        for (slot, &child_rank) in kary.child_ranks.iter().enumerate() {
            slot_of.insert(child_rank, slot);
            let host = p.host(child_rank)?.to_string();
            let envs = vec![
                (SPAWN_PARENT_ENV.to_string(), self.endpoint.name()),
                (SPAWN_ID_ENV.to_string(), child_rank.to_string()),
            ];
            let child = fork_proc(&self.params, Some(&host), &cwd, &exe, &[], &envs)?;
            child_hosts.push(host);
            launcher_children.push(child);
        }
        phase.end();
        times[3] = started.elapsed().as_nanos() as u64;

        // Accept as fast as possible; identification happens after.
        let started = Instant::now();
        let phase = Phase::begin(root, "accept children");
        let mut accepted = Vec::with_capacity(kary.child_ranks.len());
        for _ in 0..kary.child_ranks.len() {
            accepted.push(self.endpoint.accept().await?);
        }
        phase.end();
        times[4] = started.elapsed().as_nanos() as u64;

        // Children may connect in any order; the ID each one sends is
        // the sole authority on which slot its channel fills.
        let started = Instant::now();
        let phase = Phase::begin(root, "send params to children");
        let mut slots: Vec<Option<(Channel, Option<u32>)>> =
            (0..kary.child_ranks.len()).map(|_| None).collect();
        for mut channel in accepted {
            let idmap = channel.read_strmap().await?;
            let id: usize = idmap
                .get("ID")
                .ok_or_else(|| SessionError::Protocol("connect-back without ID".into()))?
                .parse()
                .map_err(|_| SessionError::Protocol("connect-back with bad ID".into()))?;
            let slot = *slot_of.get(&id).ok_or_else(|| {
                SessionError::Protocol(format!("connect-back from unexpected rank {id}"))
            })?;
            let pid = idmap.get("PID").and_then(|pid| pid.parse().ok());
            channel.write_strmap(&self.params).await?;
            if slots[slot].replace((channel, pid)).is_some() {
                return Err(SessionError::Protocol(format!(
                    "duplicate connect-back from rank {id}"
                )));
            }
        }
        phase.end();
        times[5] = started.elapsed().as_nanos() as u64;

        let mut records = Vec::with_capacity(slots.len());
        for (slot, entry) in slots.into_iter().enumerate() {
            let (channel, pid) = entry.expect("every accepted channel fills one slot");
            records.push(ChildRecord {
                rank: kary.child_ranks[slot],
                host: child_hosts[slot].clone(),
                pid,
                channel,
            });
        }
        Ok((
            SpawnTree::new(rank, ranks, parent_channel, records),
            launcher_children,
            times,
        ))
    }

    /// The optional measurement collectives: launcher pid gather (and
    /// the MPIR table under `MPIR=spawn`), endpoint allgather, a
    /// pack/unpack microbench at the root, and the signal round-trip
    /// cost. None of it changes state observable to application
    /// processes.
    async fn measurement(&mut self, tree: &mut SpawnTree) -> Result<(), SessionError> {
        let root = tree.is_root();

        let phase = Phase::begin(root, "gather spawn pids");
        signal_from_root(tree).await?;
        let mut pidmap = Strmap::new();
        pidmap.set(tree.rank().to_string(), std::process::id().to_string());
        gather_strmap(tree, &mut pidmap).await?;
        signal_to_root(tree).await?;
        phase.end();
        if root {
            tracing::info!("launcher pid map:\n{pidmap}");
        }

        if self.params.get("MPIR") == Some("spawn") {
            if root {
                let p = Params(&self.params);
                let exe = p.required("EXE")?;
                let mut entries = Vec::with_capacity(tree.ranks());
                for i in 0..tree.ranks() {
                    let host = p.host(i)?;
                    let pid: i32 = Params(&pidmap).usize(&i.to_string())? as i32;
                    entries.push((host.to_string(), exe.to_string(), pid));
                }
                mpir::publish_proctable(&entries);
            }
            // Hold the tree until the debugger has attached.
            signal_from_root(tree).await?;
        }

        let phase = Phase::begin(root, "spawn endpoint exchange");
        signal_from_root(tree).await?;
        let mut epmap = Strmap::new();
        epmap.set(tree.rank().to_string(), self.endpoint.name());
        allgather_strmap(tree, &mut epmap).await?;
        signal_to_root(tree).await?;
        phase.end();
        if root {
            tracing::info!("launcher endpoint map:\n{epmap}");
        }

        if root {
            let phase = Phase::begin(root, "pack/unpack strmap x1000");
            for _ in 0..1000 {
                let packed = epmap.pack();
                Strmap::unpack(&packed).map_err(|err| {
                    SessionError::Resource(format!("pack/unpack roundtrip failed: {err}"))
                })?;
            }
            phase.end();
        }

        signal_from_root(tree).await?;
        let phase = Phase::begin(root, "signal costs x1000");
        for _ in 0..1000 {
            signal_to_root(tree).await?;
            signal_from_root(tree).await?;
        }
        phase.end();
        Ok(())
    }

    /// Build the group-start parameter map at the root.
    fn app_params(&self) -> Result<Strmap, SessionError> {
        let mut appmap = Strmap::new();
        appmap.set("NAME", "GROUP_0");

        let exe = match std::env::var(SPAWN_EXE_ENV) {
            Ok(value) => path_search(&value).ok_or_else(|| {
                SessionError::Config(format!("application executable {value:?} not found"))
            })?,
            Err(_) => PathBuf::from("/bin/hostname"),
        };
        appmap.set("EXE", exe.display().to_string());

        let cwd = std::env::current_dir()
            .map_err(|err| SessionError::Io("getcwd".into(), err))?;
        appmap.set("CWD", cwd.display().to_string());

        let ppn = env_or(SPAWN_PPN_ENV, "1");
        if ppn.parse::<usize>().is_err() {
            return Err(SessionError::Config(format!(
                "{SPAWN_PPN_ENV} must be a non-negative integer, got {ppn:?}"
            )));
        }
        appmap.set("PPN", ppn);

        appmap.set("PMI", env_flag(SPAWN_PMI_ENV)?);
        appmap.set("RING", env_flag(SPAWN_RING_ENV)?);
        appmap.set("FIFO", env_flag(SPAWN_FIFO_ENV)?);
        appmap.set("BIN_BCAST", env_flag(SPAWN_BCAST_BIN_ENV)?);
        Ok(appmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_typed_accessors() {
        let map: Strmap = [("N", "4"), ("DEG", "2"), ("COPY", "0"), ("0", "hostA")]
            .into_iter()
            .collect();
        let p = Params(&map);
        assert_eq!(p.usize("N").unwrap(), 4);
        assert!(!p.flag("COPY").unwrap());
        assert_eq!(p.host(0).unwrap(), "hostA");

        assert!(matches!(p.usize("DEGREES"), Err(SessionError::Config(_))));
        assert!(matches!(p.host(7), Err(SessionError::Config(_))));

        let bad: Strmap = [("N", "four"), ("COPY", "yes")].into_iter().collect();
        let p = Params(&bad);
        assert!(matches!(p.usize("N"), Err(SessionError::Config(_))));
        assert!(matches!(p.flag("COPY"), Err(SessionError::Config(_))));
    }
}
