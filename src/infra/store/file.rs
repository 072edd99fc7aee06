//! File-backed store using a JSON lines journal.
//!
//! Every change is appended to `resources.jsonl` before it is applied. On
//! open the journal is replayed, then compacted to one entry per record.

use std::fs::{self, create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{Journal, JournalEntry, RecordIndex, Store};
use crate::core::error::StoreError;

const JOURNAL_FILE: &str = "resources.jsonl";

/// Append-only JSONL journal.
#[derive(Debug)]
pub struct JsonlJournal {
    path: PathBuf,
    file: File,
}

impl JsonlJournal {
    /// Journal file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> Result<RecordIndex, StoreError> {
        let mut index = RecordIndex::default();
        if !path.exists() {
            return Ok(index);
        }
        let reader = BufReader::new(File::open(path)?);
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(&line) {
                Ok(entry) => index.apply(entry),
                // A torn last line is what a crash mid-append leaves behind.
                Err(e) => warn!(path = %path.display(), line = number + 1, error = %e, "skipping unreadable journal entry"),
            }
        }
        Ok(index)
    }

    fn compact(path: &Path, index: &RecordIndex) -> Result<(), StoreError> {
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp)?;
            for entry in index.snapshot() {
                let line = serde_json::to_string(&entry)?;
                writeln!(out, "{line}")?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl Journal for JsonlJournal {
    fn append(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Store persisted under a directory.
pub type FileStore = Store<JsonlJournal>;

impl Store<JsonlJournal> {
    /// Open (or create) the store under `dir`.
    ///
    /// # Errors
    ///
    /// I/O failures reading, compacting or reopening the journal.
    pub fn open(dir: impl AsRef<Path>, cache_capacity: usize) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let index = JsonlJournal::replay(&path)?;
        JsonlJournal::compact(&path, &index)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), records = index.len(), "file store opened");
        Ok(Self::with_index(index, JsonlJournal { path, file }, cache_capacity))
    }
}
