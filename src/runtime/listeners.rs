//! Listener adapters that forward scheduler events elsewhere.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::core::message::{Listener, Message};

/// Forwards every message into a crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: Sender<Message>,
}

impl ChannelListener {
    /// Listener plus the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, Receiver<Message>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl Listener for ChannelListener {
    fn notify(&self, message: &Message) {
        if self.sender.send(message.clone()).is_err() {
            debug!(kind = message.kind(), "channel listener receiver dropped");
        }
    }
}

/// Records every message, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingListener {
    messages: Mutex<Vec<Message>>,
}

impl CollectingListener {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Number of messages of `kind` (see [`Message::kind`]).
    pub fn count(&self, kind: &str) -> usize {
        self.messages.lock().iter().filter(|m| m.kind() == kind).count()
    }

    /// Forget everything received.
    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl Listener for CollectingListener {
    fn notify(&self, message: &Message) {
        self.messages.lock().push(message.clone());
    }
}

/// Forwards every message into a tokio unbounded channel.
#[cfg(feature = "tokio-runtime")]
#[derive(Debug, Clone)]
pub struct TokioListener {
    sender: tokio::sync::mpsc::UnboundedSender<Message>,
}

#[cfg(feature = "tokio-runtime")]
impl TokioListener {
    /// Listener plus the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[cfg(feature = "tokio-runtime")]
impl Listener for TokioListener {
    fn notify(&self, message: &Message) {
        if self.sender.send(message.clone()).is_err() {
            debug!(kind = message.kind(), "tokio listener receiver dropped");
        }
    }
}
