//! Publish/subscribe topics for advisory state
//!
//! The only topic the engine publishes to is [`REBUILD_REQUIRED`]: build
//! tooling either subscribes for a channel or polls with [`Topic::drain`].
//!
//! ```rust
//! use perfcfg::notify::{RebuildRequired, Topic};
//! use serde_json::json;
//!
//! let topic: Topic<RebuildRequired> = Topic::new("rebuild_required");
//! let rx = topic.subscribe();
//! topic.publish(RebuildRequired {
//!     model: "target".into(),
//!     record: "targ1".into(),
//!     attribute: "host_os".into(),
//!     value: json!("Darwin"),
//! });
//! assert_eq!(rx.try_recv().unwrap().attribute, "host_os");
//! assert_eq!(topic.drain().len(), 1);
//! ```

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Name of the rebuild notification topic.
pub const REBUILD_REQUIRED: &str = "rebuild_required";

/// A rebuild-relevant attribute changed on a selected configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildRequired {
    /// Model of the changed record
    pub model: String,
    /// Name of the changed record
    pub record: String,
    /// Changed attribute
    pub attribute: String,
    /// New value (`null` when unset)
    pub value: Value,
}

/// In-process topic with a poll queue and channel subscribers.
#[derive(Debug)]
pub struct Topic<T> {
    name: &'static str,
    pending: Mutex<Vec<T>>,
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Topic<T> {
    /// Empty topic
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            pending: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Topic name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Queue `message` for polling and send it to live subscribers.
    pub fn publish(&self, message: T) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(message.clone()).is_ok());
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(message);
        }
        debug!(topic = self.name, "published notification");
    }

    /// Receive every message published from now on.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Take all queued messages.
    pub fn drain(&self) -> Vec<T> {
        self.pending
            .lock()
            .map(|mut pending| std::mem::take(&mut *pending))
            .unwrap_or_default()
    }

    /// Number of queued messages
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().map_or(0, |p| p.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let topic: Topic<u32> = Topic::new("t");
        let rx = topic.subscribe();
        drop(rx);
        topic.publish(1);
        assert_eq!(topic.subscribers.lock().unwrap().len(), 0);
        assert_eq!(topic.pending(), 1);
    }

    #[test]
    fn test_drain_empties_queue() {
        let topic: Topic<u32> = Topic::new("t");
        topic.publish(1);
        topic.publish(2);
        assert_eq!(topic.drain(), vec![1, 2]);
        assert!(topic.drain().is_empty());
    }
}
