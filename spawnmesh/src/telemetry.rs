/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Diagnostics. Every launcher writes to its own stderr; lines are
//! tagged with program name, host, pid, timestamp, message, and source
//! location so interleaved output from thousands of launchers stays
//! attributable:
//!
//! ```text
//! ERROR: mpispawn on node17:4242 at 2024-05-02T18:03:11Z: accept failed @ session.rs:301
//! ```

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;
use std::time::SystemTime;

use tracing::Level;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::registry::LookupSpan;

const PROGRAM: &str = "mpispawn";

struct SpawnFormat {
    host: String,
    pid: u32,
}

impl<S, N> FormatEvent<S, N> for SpawnFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        write!(
            writer,
            "{}: {} on {}:{} at {}: ",
            meta.level(),
            PROGRAM,
            self.host,
            self.pid,
            humantime::format_rfc3339_seconds(SystemTime::now()),
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        write!(
            writer,
            " @ {}:{}",
            meta.file().unwrap_or("<unknown>"),
            meta.line().unwrap_or(0),
        )?;
        writeln!(writer)
    }
}

/// Install the diagnostic subscriber. Idempotent; called once from the
/// binary before any other work. `RUST_LOG` overrides the default
/// `info` level.
pub fn initialize() {
    static INITIALIZED: OnceLock<()> = OnceLock::new();
    INITIALIZED.get_or_init(|| {
        let format = SpawnFormat {
            host: crate::launch::local_hostname(),
            pid: std::process::id(),
        };
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string())),
            )
            .with_writer(std::io::stderr)
            .event_format(format)
            .init();
    });
}

/// Times one named phase of a collective schedule. Only the root
/// launcher reports; everyone else constructs and drops these for
/// free. The reported value is the wall time between construction and
/// [`Phase::end`].
pub struct Phase {
    label: &'static str,
    start: Instant,
    enabled: bool,
}

impl Phase {
    pub fn begin(enabled: bool, label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
            enabled,
        }
    }

    pub fn end(self) {
        if self.enabled {
            tracing::info!("{} = {:.6}", self.label, self.start.elapsed().as_secs_f64());
        }
    }
}
