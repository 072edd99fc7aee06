//! Identifiers shared by resources, locks and collaborators.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Stable numeric identity assigned by the store on first save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Path-like, globally unique name of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    /// Create a locator from any string-like value.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Raw locator string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Locator with leading separators stripped, suitable for joining under a root.
    #[must_use]
    pub fn relative_path(&self) -> &str {
        self.0.trim_start_matches('/')
    }

    /// File path of a sidecar record for this locator under `root`.
    ///
    /// `Locator::new("/exp/a").with_suffix("/var/xpm", "code")` is `/var/xpm/exp/a.code`.
    #[must_use]
    pub fn with_suffix(&self, root: &Path, suffix: &str) -> PathBuf {
        root.join(format!("{}.{suffix}", self.relative_path()))
    }

    /// Key of the exclusive lock a job takes on itself while it runs.
    #[must_use]
    pub fn ownership_key(&self) -> Self {
        Self(format!("{}.job", self.0))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Locator {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity recorded next to every granted lock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Wrap an explicit owner name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Fresh random owner, used when the configuration names none.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Owner used by this scheduler while acquiring locks on behalf of a job.
    #[must_use]
    pub fn for_job(&self, id: ResourceId) -> Self {
        Self(format!("{}/{id}", self.0))
    }

    /// Owner of locks adopted by a running process.
    #[must_use]
    pub fn process(pid: u32) -> Self {
        Self(format!("pid:{pid}"))
    }

    /// Raw owner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
