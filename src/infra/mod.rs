//! Collaborator implementations: stores, lock registries, markers and launchers.

pub mod markers;
pub mod process;
pub mod registry;
pub mod store;

pub use markers::{FileMarkers, InMemoryMarkers};
pub use process::{InMemoryLauncher, SimulatedProcess};
pub use registry::{FileLockRegistry, InMemoryLockRegistry};
pub use store::{FileStore, InMemoryStore};
