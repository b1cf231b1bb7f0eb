//! Persistent counter of empty fetches.
//!
//! One JSON map at `{root}/Logs/trials.json`, keyed by
//! `{operation}/{ticker}/{date}/{kind}`. Counts only grow. The file is
//! re-read before every lookup and update so several gateways sharing a
//! root see each other's failures; writes are temp + rename.

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::cache::ticker_dir_name;

pub const TRIALS_DIR: &str = "Logs";
pub const TRIALS_FILE: &str = "trials.json";

/// Identity of a throttled unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialKey {
    pub operation: String,
    pub ticker: String,
    pub date: NaiveDate,
    pub kind: String,
}

impl TrialKey {
    pub fn new(
        operation: impl Into<String>,
        ticker: impl Into<String>,
        date: NaiveDate,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            ticker: ticker.into(),
            date,
            kind: kind.into(),
        }
    }

    pub fn storage_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.operation,
            ticker_dir_name(&self.ticker),
            self.date.format("%Y-%m-%d"),
            self.kind
        )
    }
}

#[derive(Debug)]
pub struct TrialTracker {
    path: Option<PathBuf>,
    counts: Mutex<BTreeMap<String, u32>>,
}

impl TrialTracker {
    /// Tracker rooted at `{root}/Logs/trials.json`; `None` disables it.
    pub fn new(root: Option<&Path>) -> Self {
        Self {
            path: root.map(|r| r.join(TRIALS_DIR).join(TRIALS_FILE)),
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Recorded empty fetches for `key`.
    pub fn count(&self, key: &TrialKey) -> u32 {
        let Some(path) = &self.path else {
            return 0;
        };
        let mut counts = self.counts.lock();
        merge_from_disk(path, &mut counts);
        counts.get(&key.storage_key()).copied().unwrap_or(0)
    }

    /// Add one empty fetch for `key`; returns the new count.
    pub fn record_failure(&self, key: &TrialKey) -> u32 {
        let Some(path) = &self.path else {
            return 0;
        };
        let mut counts = self.counts.lock();
        merge_from_disk(path, &mut counts);
        let entry = counts.entry(key.storage_key()).or_insert(0);
        *entry = entry.saturating_add(1);
        let count = *entry;

        if let Err(e) = persist(path, &counts) {
            warn!(path = %path.display(), error = %e, "trial store unavailable");
        }
        debug!(key = %key.storage_key(), count, "recorded empty fetch");
        count
    }
}

/// Fold the on-disk counts into `counts`, keeping the larger of the two.
fn merge_from_disk(path: &Path, counts: &mut BTreeMap<String, u32>) {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "trial store unavailable");
            return;
        }
    };
    match serde_json::from_slice::<BTreeMap<String, u32>>(&bytes) {
        Ok(stored) => {
            for (key, n) in stored {
                let entry = counts.entry(key).or_insert(0);
                *entry = (*entry).max(n);
            }
        }
        Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable trial store"),
    }
}

fn persist(path: &Path, counts: &BTreeMap<String, u32>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(counts).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e
    })
}
