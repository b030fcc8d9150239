use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::config::ArtifactConfig;

/// File names present in the download directory before a retrieval.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot(HashSet<OsString>);

/// Watches the download directory for a newly completed artifact.
///
/// Complete means: a file absent from the snapshot, not hidden, without an
/// in-progress suffix, non-empty and with the same size on two consecutive
/// polls.
#[derive(Debug, Clone)]
pub struct ArtifactWatcher {
    dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    partial_suffixes: Vec<String>,
}

impl ArtifactWatcher {
    pub fn new(dir: impl Into<PathBuf>, config: &ArtifactConfig) -> Self {
        Self {
            dir: dir.into(),
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            partial_suffixes: config
                .partial_suffixes
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn snapshot(&self) -> std::io::Result<DirSnapshot> {
        std::fs::create_dir_all(&self.dir)?;
        let mut names = HashSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            names.insert(entry?.file_name());
        }
        Ok(DirSnapshot(names))
    }

    /// Polls until a new complete file appears or the timeout elapses.
    pub async fn wait_for_new(&self, before: &DirSnapshot) -> Option<PathBuf> {
        let deadline = Instant::now() + self.timeout;
        let mut previous: HashMap<OsString, u64> = HashMap::new();

        loop {
            let current = self.candidates(before);
            let mut stable: Vec<&OsString> = current
                .iter()
                .filter(|(name, size)| **size > 0 && previous.get(*name) == Some(*size))
                .map(|(name, _)| name)
                .collect();
            stable.sort();
            if let Some(name) = stable.first() {
                let path = self.dir.join(name);
                debug!(path = %path.display(), "artifact completed");
                return Some(path);
            }

            if Instant::now() >= deadline {
                return None;
            }
            previous = current;
            sleep(self.poll_interval).await;
        }
    }

    fn candidates(&self, before: &DirSnapshot) -> HashMap<OsString, u64> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return HashMap::new();
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| !before.0.contains(&entry.file_name()))
            .filter(|entry| !self.is_in_progress(&entry.file_name()))
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                meta.is_file().then(|| (entry.file_name(), meta.len()))
            })
            .collect()
    }

    fn is_in_progress(&self, name: &OsString) -> bool {
        let name = name.to_string_lossy().to_lowercase();
        name.starts_with('.') || self.partial_suffixes.iter().any(|s| name.ends_with(s))
    }
}
