/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Collective operations over the spawn tree.
//!
//! Every collective is synchronous message passing over the tree's own
//! channels: a launcher reads from its parent and writes to its
//! children (or the reverse), always iterating children in list order.
//! No background tasks, no callbacks. The signalling waves are the
//! one-byte primitives the launcher uses to serialize phases and to
//! gate timed sections from the root.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use spawnnet::Strmap;

use crate::tree::SpawnTree;
use crate::SessionError;

/// Send a synchronization wave up the tree: read one byte from every
/// child, then write one byte to the parent. After this returns at the
/// root, every launcher has passed the point of its own contribution.
pub async fn signal_to_root(tree: &mut SpawnTree) -> Result<(), SessionError> {
    // The byte value carries no data.
    let mut signal = [b'A'];
    for child in tree.children_mut() {
        child.channel.read_into(&mut signal).await?;
    }
    if let Some(parent) = tree.parent_mut() {
        parent.write(&signal).await?;
    }
    Ok(())
}

/// Send a synchronization wave down the tree: read one byte from the
/// parent, then write one byte to every child. After this returns at a
/// leaf, every launcher above it has released the gate.
pub async fn signal_from_root(tree: &mut SpawnTree) -> Result<(), SessionError> {
    let mut signal = [b'A'];
    if let Some(parent) = tree.parent_mut() {
        parent.read_into(&mut signal).await?;
    }
    for child in tree.children_mut() {
        child.channel.write(&signal).await?;
    }
    Ok(())
}

/// Broadcast raw bytes from the root. Every launcher must supply a
/// buffer of the agreed size: non-roots fill it from their parent
/// before forwarding, the root forwards its contents as given.
pub async fn broadcast(tree: &mut SpawnTree, buf: &mut [u8]) -> Result<(), SessionError> {
    if let Some(parent) = tree.parent_mut() {
        parent.read_into(buf).await?;
    }
    for child in tree.children_mut() {
        child.channel.write(buf).await?;
    }
    Ok(())
}

/// Broadcast a strmap from the root. On return every launcher's `map`
/// equals the root's, entry for entry.
pub async fn broadcast_strmap(
    tree: &mut SpawnTree,
    map: &mut Strmap,
) -> Result<(), SessionError> {
    if let Some(parent) = tree.parent_mut() {
        *map = parent.read_strmap().await?;
    }
    for child in tree.children_mut() {
        child.channel.write_strmap(map).await?;
    }
    Ok(())
}

/// Gather strmaps toward the root: merge each child's map into `map`
/// in child order (overwriting on key conflict), then forward the
/// merged result to the parent. The root ends with the complete map.
pub async fn gather_strmap(tree: &mut SpawnTree, map: &mut Strmap) -> Result<(), SessionError> {
    for i in 0..tree.num_children() {
        let child_map = tree.children_mut()[i].channel.read_strmap().await?;
        map.merge(&child_map);
    }
    if let Some(parent) = tree.parent_mut() {
        parent.write_strmap(map).await?;
    }
    Ok(())
}

/// Allgather: gather to the root, then broadcast the complete map.
/// Afterwards every launcher holds the same map in the same order.
pub async fn allgather_strmap(
    tree: &mut SpawnTree,
    map: &mut Strmap,
) -> Result<(), SessionError> {
    gather_strmap(tree, map).await?;
    broadcast_strmap(tree, map).await?;
    Ok(())
}

/// A double scan over the tree that computes, for each launcher, the
/// addresses of its nearest neighbors along a logical ring.
///
/// The ring orders launchers as (launcher, child₀'s subtree, child₁'s
/// subtree, …), depth first. Each launcher contributes the leftmost and
/// rightmost addresses of its locally forked application processes as
/// `LEFT`/`RIGHT` in `input`; a launcher with none contributes an empty
/// map, and its slot simply drops out of the ring.
///
/// Going up, a launcher summarizes its whole subtree: `LEFT` is the
/// first non-empty `LEFT` of (itself, children left to right), `RIGHT`
/// the first non-empty `RIGHT` of (children right to left, itself).
/// The root closes the ring by crossing the ends: its downward `LEFT`
/// is the subtree's rightmost, its downward `RIGHT` the subtree's
/// leftmost. Going down, each child i is handed `LEFT` from its left
/// sibling's summary (or the local `input.RIGHT` for child 0) and
/// `RIGHT` from its right sibling's summary (or the parent's downward
/// `RIGHT` for the last child).
///
/// The returned map holds this launcher's own `LEFT`/`RIGHT`: the ring
/// neighbors just outside its local application processes.
pub async fn ring_scan(tree: &mut SpawnTree, input: &Strmap) -> Result<Strmap, SessionError> {
    let children = tree.num_children();

    // Summaries from each child's subtree, in child order.
    let mut maps = Vec::with_capacity(children);
    for i in 0..children {
        maps.push(tree.children_mut()[i].channel.read_strmap().await?);
    }

    let mut leftmost = nonempty(input, "LEFT");
    for map in &maps {
        if leftmost.is_some() {
            break;
        }
        leftmost = nonempty(map, "LEFT");
    }
    let mut rightmost = None;
    for map in maps.iter().rev() {
        rightmost = nonempty(map, "RIGHT");
        if rightmost.is_some() {
            break;
        }
    }
    if rightmost.is_none() {
        rightmost = nonempty(input, "RIGHT");
    }

    let recv = if tree.is_root() {
        // Wrap the ends of the subtree around to form the ring.
        let mut recv = Strmap::new();
        if let (Some(left), Some(right)) = (leftmost, rightmost) {
            recv.set("LEFT", right);
            recv.set("RIGHT", left);
        }
        recv
    } else {
        let mut send = Strmap::new();
        if let (Some(left), Some(right)) = (leftmost, rightmost) {
            send.set("LEFT", left);
            send.set("RIGHT", right);
        }
        let parent = tree.parent_mut().expect("non-root has a parent");
        parent.write_strmap(&send).await?;
        parent.read_strmap().await?
    };

    for i in 0..children {
        let mut send = Strmap::new();
        let left = if i == 0 {
            nonempty(input, "RIGHT")
        } else {
            nonempty(&maps[i - 1], "RIGHT")
        };
        if let Some(left) = left {
            send.set("LEFT", left);
        }
        let right = if i + 1 < children {
            nonempty(&maps[i + 1], "LEFT")
        } else {
            nonempty(&recv, "RIGHT")
        };
        if let Some(right) = right {
            send.set("RIGHT", right);
        }
        tree.children_mut()[i].channel.write_strmap(&send).await?;
    }

    let mut output = Strmap::new();
    if let Some(left) = nonempty(&recv, "LEFT") {
        output.set("LEFT", left);
    }
    let right = if children > 0 {
        nonempty(&maps[0], "LEFT")
    } else {
        nonempty(&recv, "RIGHT")
    };
    if let Some(right) = right {
        output.set("RIGHT", right);
    }
    Ok(output)
}

fn nonempty(map: &Strmap, key: &str) -> Option<String> {
    map.get(key).filter(|v| !v.is_empty()).map(str::to_owned)
}

/// A max-reduction toward the root: each launcher takes the
/// element-wise maximum over its children's vectors, adds its own
/// values, and forwards the sums. The root returns the totals, which
/// are the cost of the slowest root-to-leaf path per element. Returns
/// `None` everywhere else.
pub async fn critical_path(
    tree: &mut SpawnTree,
    values: &[u64],
) -> Result<Option<Vec<u64>>, SessionError> {
    let count = values.len();
    let mut max = vec![0u64; count];
    let mut buf = vec![0u8; count * 8];
    for i in 0..tree.num_children() {
        tree.children_mut()[i].channel.read_into(&mut buf).await?;
        for (j, m) in max.iter_mut().enumerate() {
            let v = u64::from_be_bytes(buf[j * 8..(j + 1) * 8].try_into().unwrap());
            if i == 0 || v > *m {
                *m = v;
            }
        }
    }
    if tree.num_children() > 0 {
        for (m, v) in max.iter_mut().zip(values) {
            *m += v;
        }
    } else {
        max.copy_from_slice(values);
    }

    if tree.is_root() {
        return Ok(Some(max));
    }
    for (j, m) in max.iter().enumerate() {
        buf[j * 8..(j + 1) * 8].copy_from_slice(&m.to_be_bytes());
    }
    tree.parent_mut()
        .expect("non-root has a parent")
        .write(&buf)
        .await?;
    Ok(None)
}

/// Broadcast a file from the root's file system and materialize it on
/// every launcher under `scratch_dir`, named by the file's basename.
/// The root reads the whole file into memory; the broadcast is a u64
/// size followed by the raw bytes. Returns the scratch path.
pub async fn broadcast_file(
    tree: &mut SpawnTree,
    path: &Path,
    scratch_dir: &Path,
) -> Result<PathBuf, SessionError> {
    let mut size_buf = [0u8; 8];
    let mut data = Vec::new();
    if tree.is_root() {
        data = tokio::fs::read(path)
            .await
            .map_err(|err| SessionError::Io(path.display().to_string(), err))?;
        size_buf = (data.len() as u64).to_be_bytes();
    }
    broadcast(tree, &mut size_buf).await?;
    if !tree.is_root() {
        data = vec![0u8; u64::from_be_bytes(size_buf) as usize];
    }
    broadcast(tree, &mut data).await?;

    let base = path
        .file_name()
        .ok_or_else(|| SessionError::Config(format!("no basename in {}", path.display())))?;
    let dest = scratch_dir.join(base);
    tokio::fs::write(&dest, &data)
        .await
        .map_err(|err| SessionError::Io(dest.display().to_string(), err))?;
    // The payload may be an executable about to be exec'd.
    tokio::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|err| SessionError::Io(dest.display().to_string(), err))?;
    Ok(dest)
}
