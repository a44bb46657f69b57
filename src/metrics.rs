//! Per-method call statistics.
//!
//! [`MetricsStore`] maps each [`Signature`] to its counters in a sharded
//! [`DashMap`]. Every update is a single read-modify-write under the shard
//! lock of that key, so concurrent probes never lose a call and a reader
//! never sees a count without its matching total and max.
//!
//! Durations are milliseconds.

use crate::signature::Signature;
use dashmap::DashMap;
use serde::Deserialize;
use std::cmp::Ordering;
use std::io::{self, Write};
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Which probe the transformer inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Counts calls only.
    Count,
    /// Counts calls and times them from entry to each normal return.
    #[default]
    Timing,
}

impl ProbeMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "count" => Some(ProbeMode::Count),
            "timing" => Some(ProbeMode::Timing),
            _ => None,
        }
    }
}

/// One probe report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A call with no timing (count probe).
    Hit,
    /// A call that took this many milliseconds.
    Elapsed(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    calls: u64,
    total: u64,
    max: u64,
}

impl Counters {
    fn observe(&mut self, observation: Observation) {
        self.calls = self.calls.saturating_add(1);
        if let Observation::Elapsed(elapsed) = observation {
            self.total = self.total.saturating_add(elapsed);
            self.max = self.max.max(elapsed);
        }
    }

    fn first(observation: Observation) -> Self {
        let mut counters = Self::default();
        counters.observe(observation);
        counters
    }
}

/// Point-in-time copy of one metric record.
///
/// Ordered by call count, then signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub signature: Signature,
    pub call_count: u64,
    pub total: u64,
    pub max: u64,
}

impl MetricSnapshot {
    /// `total / call_count`, or 0 before the first call.
    pub fn average(&self) -> u64 {
        if self.call_count == 0 {
            0
        } else {
            self.total / self.call_count
        }
    }
}

impl Ord for MetricSnapshot {
    fn cmp(&self, other: &Self) -> Ordering {
        self.call_count
            .cmp(&other.call_count)
            .then_with(|| self.signature.cmp(&other.signature))
            .then_with(|| self.total.cmp(&other.total))
            .then_with(|| self.max.cmp(&other.max))
    }
}

impl PartialOrd for MetricSnapshot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub const REPORT_HEADER: &str =
    "Call count;Max (ms);Average (ms);Total (ms);Modifiers;Returntype;Classname;Methodname";

static GLOBAL_STORE: OnceLock<Arc<MetricsStore>> = OnceLock::new();

#[derive(Debug, Default)]
pub struct MetricsStore {
    entries: DashMap<Signature, Counters>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide store, created on first use.
    pub fn global() -> Arc<MetricsStore> {
        GLOBAL_STORE.get_or_init(|| Arc::new(MetricsStore::new())).clone()
    }

    /// Makes `store` the process-wide store. Fails, handing the store back,
    /// once a global store exists.
    pub fn install(store: Arc<MetricsStore>) -> Result<(), Arc<MetricsStore>> {
        GLOBAL_STORE.set(store)
    }

    fn observe(&self, signature: &Signature, observation: Observation) {
        if let Some(mut counters) = self.entries.get_mut(signature.rendered()) {
            counters.observe(observation);
            return;
        }
        self.entries
            .entry(signature.clone())
            .and_modify(|c| c.observe(observation))
            .or_insert_with(|| Counters::first(observation));
    }

    /// Records one call that ran from `start` to `end` (milliseconds).
    /// A clock that went backwards counts as zero elapsed.
    pub fn record_call(&self, signature: &Signature, start: u64, end: u64) {
        self.observe(signature, Observation::Elapsed(end.saturating_sub(start)));
    }

    /// Records one call without timing.
    pub fn record_hit(&self, signature: &Signature) {
        self.observe(signature, Observation::Hit);
    }

    /// Records a probe report keyed by the rendered signature. Known keys
    /// are updated without parsing; unknown ones are parsed and created.
    pub fn record_rendered(&self, rendered: &str, observation: Observation) {
        if let Some(mut counters) = self.entries.get_mut(rendered) {
            counters.observe(observation);
            return;
        }
        match Signature::parse(rendered) {
            Ok(signature) => self.observe(&signature, observation),
            Err(e) => warn!(error = %e, "dropping probe report"),
        }
    }

    /// Ensures `signature` is present. Existing counts are left alone.
    pub fn register_known_zero(&self, signature: &Signature) {
        if self.entries.contains_key(signature.rendered()) {
            return;
        }
        self.entries.entry(signature.clone()).or_default();
    }

    pub fn get(&self, signature: &str) -> Option<MetricSnapshot> {
        self.entries.get(signature).map(|entry| MetricSnapshot {
            signature: entry.key().clone(),
            call_count: entry.calls,
            total: entry.total,
            max: entry.max,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies every record. Each entry is consistent with itself; entries
    /// are read shard by shard, not as one cut.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        self.entries
            .iter()
            .map(|entry| MetricSnapshot {
                signature: entry.key().clone(),
                call_count: entry.calls,
                total: entry.total,
                max: entry.max,
            })
            .collect()
    }

    pub fn total_call_count(&self) -> u64 {
        self.snapshot()
            .iter()
            .fold(0u64, |sum, s| sum.saturating_add(s.call_count))
    }

    /// Writes every record, zero-call ones included, one line each in
    /// ascending call count order.
    pub fn write_report<W: Write>(&self, sink: &mut W, include_header: bool) -> io::Result<()> {
        let mut rows = self.snapshot();
        rows.sort();
        if include_header {
            writeln!(sink, "{REPORT_HEADER}")?;
        }
        for row in &rows {
            writeln!(
                sink,
                "{};{};{};{};{}",
                row.call_count,
                row.max,
                row.average(),
                row.total,
                row.signature
            )?;
        }
        sink.flush()
    }
}
