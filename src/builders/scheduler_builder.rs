//! Builders to wire configuration into a scheduler.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::core::process::ProcessLauncher;
use crate::core::scheduler::{Collaborators, Scheduler, SchedulerHandle};
use crate::core::AppResult;
use crate::infra::{FileLockRegistry, FileMarkers, FileStore, InMemoryLockRegistry, InMemoryMarkers, InMemoryStore};

fn log_eviction(id: crate::core::ids::ResourceId) {
    debug!(resource = %id, "resource unpinned from cache");
}

fn file_collaborators(
    cfg: &SchedulerConfig,
    root: &Path,
    launcher: Arc<dyn ProcessLauncher>,
) -> AppResult<Collaborators> {
    for sub in ["store", "locks", "jobs"] {
        fs::create_dir_all(root.join(sub)).with_context(|| format!("creating {}", root.join(sub).display()))?;
    }
    let store = FileStore::open(root.join("store"), cfg.cache_capacity)
        .with_context(|| format!("opening store under {}", root.display()))?
        .with_eviction_callback(Arc::new(log_eviction));
    info!(state_dir = %root.display(), "using file-backed collaborators");
    Ok(Collaborators {
        store: Arc::new(store),
        registry: Arc::new(FileLockRegistry::new(
            root.join("locks"),
            cfg.lock_guard_retries,
            cfg.lock_guard_backoff_ms,
        )),
        markers: Arc::new(FileMarkers::new(root.join("jobs"))),
        launcher,
    })
}

/// Collaborators selected by the configuration: file-backed under
/// `state_dir` when set, in memory otherwise.
///
/// # Errors
///
/// Invalid configuration or an unreadable state directory.
pub fn build_collaborators(cfg: &SchedulerConfig, launcher: Arc<dyn ProcessLauncher>) -> AppResult<Collaborators> {
    cfg.validate().map_err(|e| anyhow!("config invalid: {e}"))?;
    if let Some(root) = &cfg.state_dir {
        return file_collaborators(cfg, root, launcher);
    }
    Ok(Collaborators {
        store: Arc::new(InMemoryStore::new(cfg.cache_capacity).with_eviction_callback(Arc::new(log_eviction))),
        registry: Arc::new(InMemoryLockRegistry::new()),
        markers: Arc::new(InMemoryMarkers::new()),
        launcher,
    })
}

/// Handle over the configured collaborators, without starting any loop.
///
/// # Errors
///
/// See [`build_collaborators`].
pub fn build_handle(cfg: SchedulerConfig, launcher: Arc<dyn ProcessLauncher>) -> AppResult<SchedulerHandle> {
    let collaborators = build_collaborators(&cfg, launcher)?;
    SchedulerHandle::new(cfg, collaborators).context("creating scheduler handle")
}

/// Build and start a scheduler.
///
/// # Errors
///
/// Configuration, recovery or thread spawn failures.
pub fn build_scheduler(cfg: SchedulerConfig, launcher: Arc<dyn ProcessLauncher>) -> AppResult<Scheduler> {
    let handle = build_handle(cfg, launcher)?;
    Scheduler::start(handle).context("starting scheduler")
}
