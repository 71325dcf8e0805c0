//! Append-only trial journal shared by orchestrator workers.
//!
//! The journal is an arena of finalized trials with a monotonic index. Each
//! worker keeps a cursor into it and replays every entry it has not seen
//! before proposing, so all sampler views converge on the same history.
//! Trial numbers and budget slots are handed out under the same lock that
//! serializes appends.
//!
//! A journal may be mirrored to a JSON-lines file (one trial per line,
//! flushed per entry). A run that is cancelled must call
//! [`TrialJournal::discard`] so no partial study is left on disk.

use crate::error::{OptimizeError, Result};
use crate::space::ParamSet;
use crate::study::Trial;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Permission to run one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub number: u64,
    /// Pre-assigned parameters for enqueued (coverage) points.
    pub params: Option<ParamSet>,
}

#[derive(Debug, Default)]
struct JournalState {
    entries: Vec<Trial>,
    pending: VecDeque<(u64, ParamSet)>,
    next_number: u64,
    started: usize,
    writer: Option<BufWriter<File>>,
}

/// Shared, append-only log of finalized trials.
#[derive(Debug)]
pub struct TrialJournal {
    state: Mutex<JournalState>,
    path: Option<PathBuf>,
}

impl Default for TrialJournal {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl TrialJournal {
    /// A journal that lives only for the duration of the run.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(JournalState::default()),
            path: None,
        }
    }

    /// Create (or truncate) a journal mirrored to a JSON-lines file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            state: Mutex::new(JournalState {
                writer: Some(BufWriter::new(file)),
                ..Default::default()
            }),
            path: Some(path),
        })
    }

    /// Open an existing JSON-lines journal, replaying its entries.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = BufReader::new(File::open(&path)?);
        let mut entries: Vec<Trial> = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let trial: Trial = serde_json::from_str(&line).map_err(|e| {
                OptimizeError::JournalError(format!("{}:{}: {}", path.display(), line_no + 1, e))
            })?;
            entries.push(trial);
        }
        let next_number = entries.iter().map(|t| t.number + 1).max().unwrap_or(0);
        let file = OpenOptions::new().append(true).open(&path)?;
        debug!("Opened journal {} with {} entries", path.display(), entries.len());
        Ok(Self {
            state: Mutex::new(JournalState {
                started: entries.len(),
                entries,
                next_number,
                writer: Some(BufWriter::new(file)),
                ..Default::default()
            }),
            path: Some(path),
        })
    }

    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Register points that must run before any adaptive proposal. Numbers
    /// are assigned in enqueue order.
    pub fn enqueue(&self, points: impl IntoIterator<Item = ParamSet>) {
        let mut state = self.lock();
        for params in points {
            let number = state.next_number;
            state.next_number += 1;
            state.pending.push_back((number, params));
        }
    }

    /// Enqueued points not yet claimed.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Claim the next trial slot, honouring an optional trial budget.
    /// Enqueued points are always handed out first.
    pub fn next_ticket(&self, max_trials: Option<usize>) -> Option<Ticket> {
        let mut state = self.lock();
        if max_trials.map(|max| state.started >= max).unwrap_or(false) {
            return None;
        }
        state.started += 1;
        if let Some((number, params)) = state.pending.pop_front() {
            return Some(Ticket {
                number,
                params: Some(params),
            });
        }
        let number = state.next_number;
        state.next_number += 1;
        Some(Ticket { number, params: None })
    }

    /// Slots handed out so far (finished or in flight).
    pub fn started(&self) -> usize {
        self.lock().started
    }

    /// Append a finalized trial, returning its journal index.
    pub fn append(&self, trial: Trial) -> Result<usize> {
        let mut state = self.lock();
        if let Some(writer) = state.writer.as_mut() {
            let line = serde_json::to_string(&trial)?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        state.entries.push(trial);
        Ok(state.entries.len() - 1)
    }

    /// Entries appended at or after `cursor`.
    pub fn read_from(&self, cursor: usize) -> Vec<Trial> {
        let state = self.lock();
        state.entries.get(cursor..).map(<[Trial]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries in append order.
    pub fn snapshot(&self) -> Vec<Trial> {
        self.lock().entries.clone()
    }

    /// Consume the journal, deleting its backing file if any.
    pub fn discard(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        if let Some(path) = path {
            if path.exists() {
                fs::remove_file(&path)?;
                debug!("Discarded journal {}", path.display());
            }
        }
        Ok(())
    }
}
