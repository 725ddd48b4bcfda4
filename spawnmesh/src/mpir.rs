/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The MPIR debugger-attach interface.
//!
//! An external debugger locates these symbols by name in the launcher
//! binary, reads the process table, and sets a breakpoint on
//! [`MPIR_Breakpoint`]. The table therefore lives at fixed, unmangled
//! addresses, its strings are NUL-terminated C strings, and the whole
//! structure is deliberately leaked once published. Publication happens
//! at most once, at rank 0, guarded by a [`OnceLock`].

// Symbol names follow the debugger convention, not Rust casing.
#![allow(non_snake_case, non_upper_case_globals)]

use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::CString;
use std::ptr::addr_of;
use std::ptr::addr_of_mut;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::SessionError;

/// Which processes the debugger attaches to, carried in the `MPIR`
/// parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpirMode {
    /// No debugger attach.
    Unset,
    /// Attach to the launcher tree itself.
    Spawn,
    /// Attach to the first application group.
    App,
}

impl FromStr for MpirMode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unset" => Ok(Self::Unset),
            "spawn" => Ok(Self::Spawn),
            "app" => Ok(Self::App),
            other => Err(SessionError::Config(format!(
                "MPIR must be \"spawn\" or \"app\", got {other:?}"
            ))),
        }
    }
}

/// One entry of the debugger's process table.
#[repr(C)]
pub struct MpirProcdesc {
    pub host_name: *const c_char,
    pub executable_name: *const c_char,
    pub pid: c_int,
}

pub const MPIR_NULL: c_int = 0;
pub const MPIR_DEBUG_SPAWNED: c_int = 1;
pub const MPIR_DEBUG_ABORTING: c_int = 2;

// The debugger reads and writes these externally; nothing else may
// touch them except through the helpers below.
#[no_mangle]
pub static mut MPIR_proctable: *mut MpirProcdesc = std::ptr::null_mut();
#[no_mangle]
pub static mut MPIR_proctable_size: c_int = 0;
#[no_mangle]
pub static mut MPIR_debug_state: c_int = MPIR_NULL;
#[no_mangle]
pub static mut MPIR_being_debugged: c_int = 0;
#[no_mangle]
pub static mut MPIR_i_am_starter: c_int = 0;
#[no_mangle]
pub static mut MPIR_ignore_queues: c_int = 1;

/// The quiescent function the debugger breaks on. Must survive in the
/// binary with its exact name and a real call site.
#[no_mangle]
#[inline(never)]
pub extern "C" fn MPIR_Breakpoint() {
    std::hint::black_box(());
}

static PUBLISHED: OnceLock<()> = OnceLock::new();

/// Whether a debugger launched this process (it sets
/// `MPIR_being_debugged` before `main` runs).
pub fn being_debugged() -> bool {
    // SAFETY: plain load of a process-global the debugger may write.
    unsafe { addr_of!(MPIR_being_debugged).read_volatile() != 0 }
}

/// Mark this process as the starter the debugger should coordinate
/// with. Called at the root before any child exists.
pub fn mark_starter() {
    // SAFETY: single-threaded at startup; see module docs.
    unsafe {
        addr_of_mut!(MPIR_i_am_starter).write_volatile(1);
    }
}

/// Publish the process table and signal the debugger that the
/// processes it asked for have been spawned. Entries are `(host,
/// executable, pid)`. Idempotent: only the first call publishes.
pub fn publish_proctable(entries: &[(String, String, i32)]) {
    PUBLISHED.get_or_init(|| {
        let mut table = Vec::with_capacity(entries.len());
        for (host, exe, pid) in entries {
            table.push(MpirProcdesc {
                host_name: leak_cstr(host),
                executable_name: leak_cstr(exe),
                pid: *pid,
            });
        }
        let size = table.len() as c_int;
        let table = Box::leak(table.into_boxed_slice());
        // SAFETY: the table is leaked, so the pointers stay valid for
        // the life of the process; written once, before the debugger
        // is told to look.
        unsafe {
            addr_of_mut!(MPIR_proctable).write_volatile(table.as_mut_ptr());
            addr_of_mut!(MPIR_proctable_size).write_volatile(size);
            addr_of_mut!(MPIR_debug_state).write_volatile(MPIR_DEBUG_SPAWNED);
        }
        MPIR_Breakpoint();
    });
}

fn leak_cstr(s: &str) -> *const c_char {
    // NULs cannot appear in hostnames or paths that got this far.
    let cstr = CString::new(s).unwrap_or_default();
    let leaked: &'static std::ffi::CStr = Box::leak(cstr.into_boxed_c_str());
    leaked.as_ptr()
}
