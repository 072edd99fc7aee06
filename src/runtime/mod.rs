//! Listener adapters and the query surface offered to front ends.

pub mod api;
pub mod listeners;

pub use api::{health, list_resources, Health, ResourceSnapshot};
#[cfg(feature = "tokio-runtime")]
pub use listeners::TokioListener;
pub use listeners::{ChannelListener, CollectingListener};
