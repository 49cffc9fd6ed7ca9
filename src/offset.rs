//! Durable set of already-delivered recipient addresses, used to skip work
//! when a run is resumed after a restart or crash.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::error::OffsetError;

const FLUSH_THRESHOLD: usize = 10;

struct State {
    sent: HashSet<String>,
    pending: Vec<String>,
    legacy_next_index: Option<u64>,
    job_id: Option<String>,
}

/// Tracks which addresses have already been successfully delivered in this
/// (or a previous, crashed) run. Address comparisons are case-insensitive;
/// addresses are stored lowercased.
pub struct OffsetTracker {
    path: PathBuf,
    state: Mutex<State>,
}

impl OffsetTracker {
    /// Loads existing state from `path` if present, tolerating a corrupted
    /// tail line and the legacy single-integer format.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OffsetError> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read_to_string(&path) {
            Ok(contents) => Self::parse(&contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => State {
                sent: HashSet::new(),
                pending: Vec::new(),
                legacy_next_index: None,
                job_id: None,
            },
            Err(source) => {
                return Err(OffsetError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    fn parse(contents: &str) -> State {
        let trimmed = Self::truncate_at_last_newline(contents);

        // Legacy format: the entire (trimmed) file is a single decimal integer.
        if let Ok(index) = trimmed.trim().parse::<u64>() {
            if !trimmed.trim().is_empty() && trimmed.lines().count() <= 1 {
                return State {
                    sent: HashSet::new(),
                    pending: Vec::new(),
                    legacy_next_index: Some(index),
                    job_id: None,
                };
            }
        }

        let mut sent = HashSet::new();
        let mut job_id = None;
        for line in trimmed.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Tolerate an optional legacy header line `jobID:nextIndex`.
            if let Some((id, rest)) = line.split_once(':') {
                if rest.parse::<u64>().is_ok() && !rest.contains('@') {
                    job_id = Some(id.to_string());
                    continue;
                }
            }
            sent.insert(line.to_lowercase());
        }

        State {
            sent,
            pending: Vec::new(),
            legacy_next_index: None,
            job_id,
        }
    }

    /// Drops any bytes after the last complete line, tolerating a truncated
    /// tail from a crash mid-write.
    fn truncate_at_last_newline(contents: &str) -> &str {
        match contents.rfind('\n') {
            Some(idx) => &contents[..=idx],
            None => contents,
        }
    }

    pub fn is_sent(&self, addr: &str) -> bool {
        self.state.lock().unwrap().sent.contains(&addr.to_lowercase())
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    /// Hint carried over from the legacy integer-offset format, if the file
    /// was in that format at load time. Exposed purely as a read-compat shim;
    /// it is never written back out.
    pub fn legacy_next_index(&self) -> Option<u64> {
        self.state.lock().unwrap().legacy_next_index
    }

    /// Job id carried by the legacy `jobID:nextIndex` header line, if the
    /// loaded file had one. Read-compat only, like `legacy_next_index`; never
    /// written back out.
    pub fn job_id(&self) -> Option<String> {
        self.state.lock().unwrap().job_id.clone()
    }

    /// Idempotent: marking the same address twice leaves `sent_count`
    /// unchanged.
    pub fn mark_sent(&self, addr: &str) {
        let addr = addr.to_lowercase();
        let mut state = self.state.lock().unwrap();
        if state.sent.insert(addr.clone()) {
            state.pending.push(addr);
            if state.pending.len() >= FLUSH_THRESHOLD {
                self.append_pending(&mut state);
            }
        }
    }

    fn append_pending(&self, state: &mut State) {
        if state.pending.is_empty() {
            return;
        }
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            for addr in &state.pending {
                writeln!(file, "{addr}")?;
            }
            file.flush()
        })();

        match result {
            Ok(()) => state.pending.clear(),
            Err(source) => warn!(
                path = %self.path.display(),
                error = %source,
                "failed to append offset file, state remains authoritative in memory"
            ),
        }
    }

    /// Forces any buffered marks to disk.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        self.append_pending(&mut state);
    }

    /// Deletes all state, including the on-disk file, via an atomic
    /// write-temp-then-rename so a crash mid-reset never exposes a partial
    /// file.
    pub fn reset(&self) -> Result<(), OffsetError> {
        let mut state = self.state.lock().unwrap();
        state.sent.clear();
        state.pending.clear();
        state.legacy_next_index = None;
        state.job_id = None;

        let tmp_path = self.path.with_extension("tmp");
        fs::File::create(&tmp_path).map_err(|source| OffsetError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| OffsetError::Write {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(())
    }
}
