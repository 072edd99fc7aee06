//! File-backed lock registry.
//!
//! Each key is a `<root>/<locator>.state` file with one `owner code` line per
//! holder. Every read-modify-write runs under an exclusive advisory lock on a
//! `<locator>.state.lock` file, so several schedulers sharing the root
//! serialize on it. The guard file itself is never removed; the operating
//! system drops the lock with the process that held it. Records are rewritten
//! through a temp file and rename, so readers never see a partial record and
//! need no guard.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::Holders;
use crate::core::error::LockError;
use crate::core::ids::{Locator, OwnerId};
use crate::core::lock::{LockCounts, LockMode, LockRegistry};

/// What identifies one version of a record file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

impl FileStamp {
    fn of(metadata: &fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        }
    }
}

/// Registry persisted as one record file per key.
#[derive(Debug)]
pub struct FileLockRegistry {
    root: PathBuf,
    retries: u32,
    backoff: Duration,
    seen: Mutex<HashMap<PathBuf, (FileStamp, LockCounts)>>,
}

/// Held advisory lock on a guard file.
struct Guard {
    file: File,
    path: PathBuf,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(guard = %self.path.display(), error = %e, "cannot unlock lock guard");
        }
    }
}

impl FileLockRegistry {
    /// Registry rooted at `root`, retrying a busy guard `retries` times.
    pub fn new(root: impl Into<PathBuf>, retries: u32, backoff_ms: u64) -> Self {
        Self {
            root: root.into(),
            retries: retries.max(1),
            backoff: Duration::from_millis(backoff_ms),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record file of `key`.
    #[must_use]
    pub fn record_path(&self, key: &Locator) -> PathBuf {
        key.with_suffix(&self.root, "state")
    }

    fn guard(&self, key: &Locator) -> Result<Guard, LockError> {
        let path = key.with_suffix(&self.root, "state.lock");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let contended = fs2::lock_contended_error().kind();
        for attempt in 0..self.retries {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Guard { file, path }),
                Err(e) if e.kind() == contended => {
                    if attempt + 1 < self.retries {
                        thread::sleep(self.backoff);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        debug!(key = %key, retries = self.retries, "lock record guard busy");
        Err(LockError::WouldBlock)
    }

    fn read(key: &Locator, path: &Path) -> Result<Holders, LockError> {
        match fs::read_to_string(path) {
            Ok(text) => Holders::parse(key, &text),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Holders::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, path: &Path, holders: &Holders) -> Result<(), LockError> {
        self.seen.lock().remove(path);
        if holders.is_empty() {
            return match fs::remove_file(path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        let tmp = path.with_extension("state.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(holders.render().as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Read-modify-write of one record under its guard.
    fn update<T>(
        &self,
        key: &Locator,
        op: impl FnOnce(&mut Holders) -> Result<(T, bool), LockError>,
    ) -> Result<T, LockError> {
        let _guard = self.guard(key)?;
        let path = self.record_path(key);
        let mut holders = Self::read(key, &path)?;
        let (value, changed) = op(&mut holders)?;
        if changed {
            self.write(&path, &holders)?;
        }
        Ok(value)
    }
}

impl LockRegistry for FileLockRegistry {
    fn acquire(&self, key: &Locator, owner: &OwnerId, mode: LockMode) -> Result<(), LockError> {
        self.update(key, |holders| {
            let changed = holders.acquire(key, owner, mode)?;
            Ok(((), changed))
        })
    }

    fn release(&self, key: &Locator, owner: &OwnerId) -> Result<(), LockError> {
        self.update(key, |holders| Ok(((), holders.release(owner))))
    }

    fn change_owner(&self, key: &Locator, from: &OwnerId, to: &OwnerId) -> Result<(), LockError> {
        self.update(key, |holders| {
            holders.transfer(key, from, to)?;
            Ok(((), from != to))
        })
    }

    fn reconcile(&self, key: &Locator) -> Result<LockCounts, LockError> {
        let path = self.record_path(key);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.seen.lock().remove(&path);
                return Ok(LockCounts::default());
            }
            Err(e) => return Err(e.into()),
        };
        let stamp = FileStamp::of(&metadata);
        if let Some((seen, counts)) = self.seen.lock().get(&path) {
            if *seen == stamp {
                return Ok(*counts);
            }
        }
        let counts = Self::read(key, &path)?.counts();
        debug!(key = %key, readers = counts.readers, writers = counts.writers, exclusive = counts.exclusive, "lock record reloaded");
        self.seen.lock().insert(path, (stamp, counts));
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &Path) -> FileLockRegistry {
        FileLockRegistry::new(dir, 3, 1)
    }

    #[test]
    fn test_two_registries_share_records() {
        let dir = tempfile::tempdir().unwrap();
        let a = registry(dir.path());
        let b = registry(dir.path());
        let key = Locator::new("/exp/data");

        a.acquire(&key, &OwnerId::new("a"), LockMode::Read).unwrap();
        b.acquire(&key, &OwnerId::new("b"), LockMode::Read).unwrap();
        assert!(matches!(
            b.acquire(&key, &OwnerId::new("c"), LockMode::Write),
            Err(LockError::Denied(_))
        ));
        assert_eq!(a.reconcile(&key).unwrap().readers, 2);

        a.release(&key, &OwnerId::new("a")).unwrap();
        b.release(&key, &OwnerId::new("b")).unwrap();
        assert!(!a.record_path(&key).exists());
        assert!(a.reconcile(&key).unwrap().is_free());
    }

    #[test]
    fn test_busy_guard_would_block() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let key = Locator::new("/busy");
        let guard_path = key.with_suffix(dir.path(), "state.lock");
        let holder = File::create(&guard_path).unwrap();
        holder.try_lock_exclusive().unwrap();
        assert!(matches!(
            registry.acquire(&key, &OwnerId::new("a"), LockMode::Exclusive),
            Err(LockError::WouldBlock)
        ));
        holder.unlock().unwrap();
        registry.acquire(&key, &OwnerId::new("a"), LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_leftover_guard_file_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let key = Locator::new("/crashed");
        // A holder that died keeps the file but not the lock.
        let guard_path = key.with_suffix(dir.path(), "state.lock");
        fs::create_dir_all(guard_path.parent().unwrap()).unwrap();
        fs::write(&guard_path, b"").unwrap();

        registry.acquire(&key, &OwnerId::new("a"), LockMode::Write).unwrap();
        registry.change_owner(&key, &OwnerId::new("a"), &OwnerId::new("b")).unwrap();
        registry.release(&key, &OwnerId::new("b")).unwrap();
        assert!(guard_path.exists());
        assert!(registry.reconcile(&key).unwrap().is_free());
    }

    #[test]
    fn test_change_owner_rewrites_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let key = Locator::new("/job.job");
        registry.acquire(&key, &OwnerId::new("s/R1"), LockMode::Exclusive).unwrap();
        registry.change_owner(&key, &OwnerId::new("s/R1"), &OwnerId::process(9)).unwrap();
        let text = fs::read_to_string(registry.record_path(&key)).unwrap();
        assert_eq!(text, "pid:9 x\n");
    }
}
