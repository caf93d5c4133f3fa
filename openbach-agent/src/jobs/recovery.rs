//! On-disk records of pending schedules, replayed after an agent restart.
//!
//! A start order with a future date or an interval leaves
//! `<instances-dir>/<name><id>.start`; a stop order with a future date
//! leaves `<name><id>.stop`. Each file holds the JSON of the order.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use openbach_shared::protocol::{OrderDate, StartOrder, StopOrder};

/// Which kind of order a recovery file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Start,
    Stop,
}

impl RecordKind {
    pub fn extension(&self) -> &'static str {
        match self {
            RecordKind::Start => "start",
            RecordKind::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRecord {
    pub name: String,
    pub instance_id: i64,
    pub scenario_id: u64,
    pub owner_id: u64,
    pub date: Option<u64>,
    pub interval: Option<u64>,
    pub arguments: Vec<String>,
}

impl StartRecord {
    pub fn into_order(self) -> StartOrder {
        StartOrder {
            name: self.name,
            instance_id: self.instance_id,
            scenario_id: self.scenario_id,
            owner_id: self.owner_id,
            arguments: self.arguments,
            date: self.date.map_or(OrderDate::Now, OrderDate::At),
            interval: self.interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRecord {
    pub name: String,
    pub instance_id: i64,
    pub date: Option<u64>,
}

impl StopRecord {
    pub fn into_order(self) -> StopOrder {
        StopOrder {
            name: self.name,
            instance_id: self.instance_id,
            date: self.date.map_or(OrderDate::Now, OrderDate::At),
        }
    }
}

/// A record found while scanning the instances directory.
#[derive(Debug)]
pub enum Recovered<T> {
    Record { path: PathBuf, record: T },
    Corrupted { path: PathBuf, reason: String },
}

/// Directory holding the recovery files.
#[derive(Debug, Clone)]
pub struct RecoveryStore {
    directory: PathBuf,
}

impl RecoveryStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn path(&self, name: &str, instance_id: i64, kind: RecordKind) -> PathBuf {
        self.directory
            .join(format!("{}{}.{}", name, instance_id, kind.extension()))
    }

    fn write<T: Serialize>(&self, path: &Path, record: &T) -> io::Result<()> {
        fs::create_dir_all(&self.directory)?;
        let content = serde_json::to_vec(record).map_err(io::Error::other)?;
        fs::write(path, content)
    }

    pub fn write_start(&self, record: &StartRecord) -> io::Result<()> {
        let path = self.path(&record.name, record.instance_id, RecordKind::Start);
        debug!("Writing recovery file {}", path.display());
        self.write(&path, record)
    }

    pub fn write_stop(&self, record: &StopRecord) -> io::Result<()> {
        let path = self.path(&record.name, record.instance_id, RecordKind::Stop);
        debug!("Writing recovery file {}", path.display());
        self.write(&path, record)
    }

    /// Remove a record; a missing file is not an error.
    pub fn remove(&self, name: &str, instance_id: i64, kind: RecordKind) {
        let path = self.path(name, instance_id, kind);
        Self::remove_path(&path);
    }

    pub fn remove_path(path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed recovery file {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Cannot remove recovery file {}: {}", path.display(), e),
        }
    }

    fn scan<T: for<'de> Deserialize<'de>>(&self, kind: RecordKind) -> Vec<Recovered<T>> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(
                        "Cannot read instances directory {}: {}",
                        self.directory.display(),
                        e
                    );
                }
                return Vec::new();
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(kind.extension()))
            .collect();
        paths.sort();

        paths
            .into_iter()
            .map(|path| {
                let parsed = fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|content| {
                        serde_json::from_slice::<T>(&content).map_err(|e| e.to_string())
                    });
                match parsed {
                    Ok(record) => Recovered::Record { path, record },
                    Err(reason) => Recovered::Corrupted { path, reason },
                }
            })
            .collect()
    }

    pub fn scan_starts(&self) -> Vec<Recovered<StartRecord>> {
        self.scan(RecordKind::Start)
    }

    pub fn scan_stops(&self) -> Vec<Recovered<StopRecord>> {
        self.scan(RecordKind::Stop)
    }
}
