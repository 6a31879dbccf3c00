//! Durable node state: the metadata file and the append-only log file.
//!
//! Storage runs on its own thread and consumes [`StoreOrder`]s from the node
//! loop. A `Meta` order rewrites the metadata file wholesale, a `Flush` order
//! appends the committed range read from the shared [`LogStore`]. Failures
//! are logged; they never stop the node.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::log::{LogEntry, LogStore};
use crate::message::StoreOrder;
use crate::meta::Meta;

/// Where the bytes go.
pub trait Medium: Send + 'static {
    /// File contents, or `None` when the file does not exist.
    fn read(&self, path: &Path) -> io::Result<Option<String>>;
    fn write(&mut self, path: &Path, contents: &str) -> io::Result<()>;
    fn append(&mut self, path: &Path, contents: &str) -> io::Result<()>;
}

/// The local file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileMedium;

impl Medium for FileMedium {
    fn read(&self, path: &Path) -> io::Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write(&mut self, path: &Path, contents: &str) -> io::Result<()> {
        // Written beside the target, then renamed over it.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)
    }

    fn append(&mut self, path: &Path, contents: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_data()
    }
}

/// Files held in memory, for simulated clusters. Clones share contents.
#[derive(Debug, Default, Clone)]
pub struct MemoryMedium {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.lock().insert(path.into(), contents.into());
        self
    }

    pub fn contents(&self, path: &Path) -> Option<String> {
        self.lock().get(path).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, String>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Medium for MemoryMedium {
    fn read(&self, path: &Path) -> io::Result<Option<String>> {
        Ok(self.contents(path))
    }

    fn write(&mut self, path: &Path, contents: &str) -> io::Result<()> {
        self.lock().insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn append(&mut self, path: &Path, contents: &str) -> io::Result<()> {
        self.lock()
            .entry(path.to_path_buf())
            .or_default()
            .push_str(contents);
        Ok(())
    }
}

/// What storage hands back at startup.
#[derive(Debug)]
pub struct Recovered {
    pub meta: Meta,
    pub entries: Vec<LogEntry>,
}

pub struct Storage<M> {
    medium: M,
    meta_path: PathBuf,
    log_path: PathBuf,
}

impl<M: Medium> Storage<M> {
    pub fn new(medium: M, meta_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            medium,
            meta_path: meta_path.into(),
            log_path: log_path.into(),
        }
    }

    /// Reads the metadata (required) and the log (optional).
    ///
    /// Malformed log lines are skipped with a warning.
    pub fn load(&self) -> Result<Recovered> {
        let json = self
            .medium
            .read(&self.meta_path)
            .with_context(|| format!("failed to read meta file {}", self.meta_path.display()))?
            .with_context(|| format!("meta file {} does not exist", self.meta_path.display()))?;
        let meta = Meta::from_json(&json)
            .with_context(|| format!("invalid meta file {}", self.meta_path.display()))?;

        let log = self
            .medium
            .read(&self.log_path)
            .with_context(|| format!("failed to read log file {}", self.log_path.display()))?
            .unwrap_or_default();

        let mut entries = Vec::new();
        for (number, line) in log.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match LogEntry::decode(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(line = number + 1, error = %err, "skipping log line"),
            }
        }
        debug!(node = meta.id, entries = entries.len(), "storage loaded");
        Ok(Recovered { meta, entries })
    }

    pub fn write_meta(&mut self, json: &str) -> io::Result<()> {
        self.medium.write(&self.meta_path, json)
    }

    pub fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut lines = String::new();
        for entry in entries {
            lines.push_str(&entry.encode());
            lines.push('\n');
        }
        self.medium.append(&self.log_path, &lines)
    }

    /// Carries out one order; failures are logged.
    pub fn execute(&mut self, order: StoreOrder, log: &LogStore) {
        match order {
            StoreOrder::Meta(json) => {
                if let Err(err) = self.write_meta(&json) {
                    warn!(path = %self.meta_path.display(), error = %err, "failed to write meta");
                }
            }
            StoreOrder::Flush { start, end } => {
                let entries = log.range(start, end);
                if entries.is_empty() {
                    warn!(start = %start, end = %end, "flush range not in log");
                    return;
                }
                match self.append_entries(&entries) {
                    Ok(()) => debug!(start = %start, end = %end, count = entries.len(), "flushed"),
                    Err(err) => {
                        warn!(path = %self.log_path.display(), error = %err, "failed to flush log")
                    }
                }
            }
        }
    }

    /// Serves orders on a dedicated thread until the node loop drops its sender.
    pub fn spawn(
        mut self,
        name: String,
        log: Arc<LogStore>,
        mut orders: UnboundedReceiver<StoreOrder>,
    ) -> Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Some(order) = orders.blocking_recv() {
                    self.execute(order, &log);
                }
            })
            .context("failed to spawn storage thread")
    }
}
