//! Job completion markers.

use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use crate::core::ids::Locator;
use crate::core::process::JobMarkers;

/// Markers kept in a map.
#[derive(Debug, Default)]
pub struct InMemoryMarkers {
    codes: Mutex<HashMap<Locator, i32>>,
}

impl InMemoryMarkers {
    /// Create an empty marker set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobMarkers for InMemoryMarkers {
    fn exit_code(&self, locator: &Locator) -> io::Result<Option<i32>> {
        Ok(self.codes.lock().get(locator).copied())
    }

    fn record_exit(&self, locator: &Locator, code: i32) -> io::Result<()> {
        self.codes.lock().insert(locator.clone(), code);
        Ok(())
    }

    fn clear(&self, locator: &Locator) -> io::Result<()> {
        self.codes.lock().remove(locator);
        Ok(())
    }
}

/// Markers stored as `<root>/<locator>.code` files.
#[derive(Debug, Clone)]
pub struct FileMarkers {
    root: PathBuf,
}

impl FileMarkers {
    /// Markers rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Marker file of a job.
    #[must_use]
    pub fn path(&self, locator: &Locator) -> PathBuf {
        locator.with_suffix(&self.root, "code")
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl JobMarkers for FileMarkers {
    fn exit_code(&self, locator: &Locator) -> io::Result<Option<i32>> {
        let path = self.path(locator);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match text.trim().parse() {
            Ok(code) => Ok(Some(code)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable exit code; treating as failure");
                Ok(Some(1))
            }
        }
    }

    fn record_exit(&self, locator: &Locator, code: i32) -> io::Result<()> {
        let path = self.path(locator);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{code}\n"))
    }

    fn clear(&self, locator: &Locator) -> io::Result<()> {
        match fs::remove_file(self.path(locator)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
