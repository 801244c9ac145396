// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later
// Copyright Contributors to the inquiline project.

#![deny(missing_docs)]

//! # Tracing support
//!
//! Trace items cover the manager subsystems and are disabled by default;
//! embedders enable them individually through [`TracingGuard`].
//!
//! See [`TraceItem`] variants.

use std::{
    cell::Cell,
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

pub use ::tracing::{error, event, event_enabled, info, trace, warn, Level};
pub use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{prelude::*, reload, EnvFilter, Layer, Registry};

#[derive(Copy, Clone, Ord, PartialOrd, PartialEq, Eq, Debug)]
/// Trace item targets
pub enum TraceItem {
    /// Logs instruction analysis cache activity.
    Analysis,
    /// Logs sequence and instruction lookups, including splits.
    CacheLookup,
    /// Logs sequence writes inside executable slabs.
    ExecBlock,
    /// Logs cache invalidation and flush commits.
    Invalidate,
    /// Logs region search, admission and statistics updates.
    Region,
    /// Logs basic block writes.
    WriteBlock,
}

impl TraceItem {
    /// All [`TraceItem`] variants.
    pub const POSSIBLE_VALUES: &[Self] = &[
        Self::Analysis,
        Self::CacheLookup,
        Self::ExecBlock,
        Self::Invalidate,
        Self::Region,
        Self::WriteBlock,
    ];

    /// Target path of item.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "inquiline::analysis",
            Self::CacheLookup => "inquiline::cache_lookup",
            Self::ExecBlock => "inquiline::exec_block",
            Self::Invalidate => "inquiline::invalidate",
            Self::Region => "inquiline::region",
            Self::WriteBlock => "inquiline::write_block",
        }
    }

    /// Snake case representation of item.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::CacheLookup => "cache_lookup",
            Self::ExecBlock => "exec_block",
            Self::Invalidate => "invalidate",
            Self::Region => "region",
            Self::WriteBlock => "write_block",
        }
    }
}

impl std::fmt::Display for TraceItem {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.name())
    }
}

impl std::str::FromStr for TraceItem {
    type Err = Box<dyn std::error::Error>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for i in Self::POSSIBLE_VALUES.iter() {
            if i.name() == s {
                return Ok(*i);
            }
        }
        Err(Box::<dyn std::error::Error>::from(format!(
            "Expected one of {}",
            Self::POSSIBLE_VALUES
                .iter()
                .map(|s| s.name())
                .collect::<Vec<&str>>()
                .join(", ")
        )))
    }
}

impl std::ops::Deref for TraceItem {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

#[derive(Debug)]
/// Output of trace logs.
pub enum Output {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// File.
    File(std::fs::File),
}

impl std::io::Write for Output {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Stdout => {
                let mut lck = std::io::stdout().lock();
                lck.write(buf)
            }
            Self::Stderr => {
                let mut lck = std::io::stderr().lock();
                lck.write(buf)
            }
            Self::File(ref mut f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                let mut lck = std::io::stdout().lock();
                lck.flush()
            }
            Self::Stderr => {
                let mut lck = std::io::stderr().lock();
                lck.flush()
            }
            Self::File(ref mut f) => f.flush(),
        }
    }
}

/// Runtime control over the installed trace subscriber.
///
/// Embedders toggle [`TraceItem`]s while the engine runs to watch one
/// manager subsystem at a time without paying for the rest. Dropping the
/// guard flushes and stops the background writer.
pub struct TracingGuard {
    level: Cell<LevelFilter>,
    items: Arc<Mutex<BTreeSet<TraceItem>>>,
    reload_handle: reload::Handle<EnvFilter, Registry>,
    _worker_guard: tracing_appender::non_blocking::WorkerGuard,
}

impl TracingGuard {
    #[must_use]
    /// Installs the global subscriber writing to `output` and returns the
    /// guard controlling it. `items` start enabled at trace level; all
    /// other targets are filtered at `level`.
    pub fn init(
        level: LevelFilter,
        output: Output,
        ansi: bool,
        items: BTreeSet<TraceItem>,
    ) -> Self {
        let (filter, reload_handle) = reload::Layer::new(item_filter(level, &items));
        let ansi = ansi && matches!(output, Output::Stdout);
        let (writer, worker_guard) = tracing_appender::non_blocking(output);
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .and_then(filter),
            )
            .init();
        Self {
            level: Cell::new(level),
            items: Arc::new(Mutex::new(items)),
            reload_handle,
            _worker_guard: worker_guard,
        }
    }

    /// Level applied to targets outside the enabled trace items.
    pub fn level(&self) -> LevelFilter {
        self.level.get()
    }

    /// The trace items currently enabled.
    pub fn items(&self) -> BTreeSet<TraceItem> {
        self.items.lock().unwrap().clone()
    }

    /// Enables `item`, leaving the other items untouched.
    pub fn enable(&self, item: TraceItem) -> Result<(), Box<dyn std::error::Error>> {
        let mut items = self.items.lock().unwrap();
        items.insert(item);
        self.reload(self.level.get(), &items)
    }

    /// Disables `item`.
    pub fn disable(&self, item: TraceItem) -> Result<(), Box<dyn std::error::Error>> {
        let mut items = self.items.lock().unwrap();
        items.remove(&item);
        self.reload(self.level.get(), &items)
    }

    /// Replaces the level applied outside the enabled trace items.
    pub fn set_level(&self, level: LevelFilter) -> Result<(), Box<dyn std::error::Error>> {
        self.level.set(level);
        self.reload(level, &self.items.lock().unwrap())
    }

    fn reload(
        &self,
        level: LevelFilter,
        items: &BTreeSet<TraceItem>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.reload_handle.modify(|filter| {
            *filter = item_filter(level, items);
        })?;
        Ok(())
    }
}

/// Filter enabling `items` at trace level on top of the default `level`.
fn item_filter(level: LevelFilter, items: &BTreeSet<TraceItem>) -> EnvFilter {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()
        .unwrap_or_default();
    for item in TraceItem::POSSIBLE_VALUES {
        let directive = if items.contains(item) {
            format!("{}=trace", item.as_str())
        } else {
            format!("{}=off", item.as_str())
        };
        filter = filter.add_directive(directive.parse().unwrap());
    }
    filter
}
