//! Periodic snapshot export.
//!
//! One background thread wakes after an initial delay and then once per
//! period, and appends the records that have been called at least once to
//! `delver-<yyyy-MM-dd>.json` as a single JSON line:
//!
//! ```json
//! {"timestamp":1700000000000,"res":[{"className":"com.example.Foo","method":"bar()","callCount":3,"average":20,"max":30,"total":60}]}
//! ```
//!
//! A failed tick is logged and the next one still runs.

use crate::metrics::{MetricSnapshot, MetricsStore};
use chrono::{DateTime, Local};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

pub const THREAD_NAME: &str = "delver-snapshot-0";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no home directory to place snapshots in")]
    NoHomeDirectory,
    #[error("cannot write snapshot to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot serialize snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    pub initial_delay: Duration,
    pub period: Duration,
    /// Defaults to `<home>/.rattler/delver`.
    pub directory: Option<PathBuf>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(60),
            period: Duration::from_secs(300),
            directory: None,
        }
    }
}

impl SnapshotConfig {
    pub fn resolve_directory(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(dir) => Ok(dir.clone()),
            None => default_directory(),
        }
    }
}

pub fn default_directory() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".rattler").join("delver"))
        .ok_or(SnapshotError::NoHomeDirectory)
}

/// One exported record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureCalls {
    pub class_name: String,
    /// Method name followed by its parameter list, e.g. `bar(int)`.
    pub method: String,
    pub call_count: u64,
    pub average: u64,
    pub max: u64,
    pub total: u64,
}

impl From<&MetricSnapshot> for SignatureCalls {
    fn from(s: &MetricSnapshot) -> Self {
        Self {
            class_name: s.signature.declaring_type().to_string(),
            method: format!("{}{}", s.signature.method_name(), s.signature.descriptor()),
            call_count: s.call_count,
            average: s.average(),
            max: s.max,
            total: s.total,
        }
    }
}

/// One line of a snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub res: Vec<SignatureCalls>,
}

pub fn file_name(date: &DateTime<Local>) -> String {
    format!("delver-{}.json", date.format("%Y-%m-%d"))
}

pub struct SnapshotScheduler;

impl SnapshotScheduler {
    /// Spawns the snapshot thread.
    pub fn start(store: Arc<MetricsStore>, config: SnapshotConfig) -> io::Result<SnapshotHandle> {
        // Never sent on; dropping the sender wakes and stops the thread.
        let (stop, stopped) = channel::bounded::<()>(0);
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let mut wait = config.initial_delay;
                loop {
                    match stopped.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    Self::run_tick(&store, &config);
                    wait = config.period;
                }
                debug!("snapshot thread stopped");
            })?;
        Ok(SnapshotHandle { stop: Some(stop), thread: Some(thread) })
    }

    fn run_tick(store: &MetricsStore, config: &SnapshotConfig) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<PathBuf> {
            let dir = config.resolve_directory()?;
            Self::tick(store, &dir, Local::now())
        }));
        match outcome {
            Ok(Ok(path)) => debug!(path = %path.display(), "snapshot written"),
            Ok(Err(e)) => error!(error = %e, "snapshot tick failed"),
            Err(_) => error!("snapshot tick panicked"),
        }
    }

    /// Appends one snapshot of `store` to the dated file in `dir` and
    /// returns that file's path.
    pub fn tick(store: &MetricsStore, dir: &Path, now: DateTime<Local>) -> Result<PathBuf> {
        let mut rows = store.snapshot();
        rows.retain(|s| s.call_count > 0);
        rows.sort();
        let document = SnapshotDocument {
            timestamp: now.timestamp_millis(),
            res: rows.iter().map(SignatureCalls::from).collect(),
        };
        let mut line = serde_json::to_vec(&document)?;
        line.push(b'\n');

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| SnapshotError::Io { path, source }
        };
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let path = dir.join(file_name(&now));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        file.write_all(&line).map_err(io_err(&path))?;
        Ok(path)
    }
}

/// Stops the snapshot thread when shut down or dropped.
pub struct SnapshotHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SnapshotHandle {
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("snapshot thread panicked");
            }
        }
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
