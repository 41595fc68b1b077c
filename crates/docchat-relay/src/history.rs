//! Per-user, per-document chat history with live subscriptions.
//!
//! Entries are kept in memory, keyed by `(user, file)`. Every `record` publishes
//! a fresh snapshot to all subscribers of that key, oldest entry first.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::{Mutex, watch};
use tracing::debug;

/// Author of a history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub id: uuid::Uuid,
    pub file_name: String,
    pub message: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl ChatEntry {
    pub fn new(file_name: impl Into<String>, message: impl Into<String>, sender: Sender) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            file_name: file_name.into(),
            message: message.into(),
            sender,
            timestamp: Utc::now(),
        }
    }
}

type HistoryKey = (String, String);

/// Shared, cloneable history store.
#[derive(Clone, Debug, Default)]
pub struct ChatHistory {
    channels: Arc<Mutex<HashMap<HistoryKey, watch::Sender<Vec<ChatEntry>>>>>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry for `user` and notifies subscribers.
    pub async fn record(&self, user: &str, entry: ChatEntry) {
        let key = (user.to_owned(), entry.file_name.clone());
        let mut channels = self.channels.lock().await;
        let tx = channels
            .entry(key)
            .or_insert_with(|| watch::channel(Vec::new()).0);
        tx.send_modify(|entries| entries.push(entry));
        debug!(user, entries = tx.borrow().len(), "history entry recorded");
    }

    /// Entries recorded so far for `(user, file)`, oldest first.
    pub async fn snapshot(&self, user: &str, file: &str) -> Vec<ChatEntry> {
        let channels = self.channels.lock().await;
        channels
            .get(&(user.to_owned(), file.to_owned()))
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }

    /// Subscribes to `(user, file)`. The first `next_snapshot` yields the
    /// current entries; later ones wait for a change.
    pub async fn subscribe(&self, user: &str, file: &str) -> HistorySubscription {
        let mut channels = self.channels.lock().await;
        prune(&mut channels);
        let tx = channels
            .entry((user.to_owned(), file.to_owned()))
            .or_insert_with(|| watch::channel(Vec::new()).0);
        let mut rx = tx.subscribe();
        rx.mark_changed();
        HistorySubscription { rx }
    }
}

// Drops conversations that were only ever watched: no entries and no live
// subscribers. Recorded conversations are kept.
fn prune(channels: &mut HashMap<HistoryKey, watch::Sender<Vec<ChatEntry>>>) {
    let before = channels.len();
    channels.retain(|_, tx| tx.receiver_count() > 0 || !tx.borrow().is_empty());
    if channels.len() < before {
        debug!(removed = before - channels.len(), "pruned idle history channels");
    }
}

/// Live view of one conversation. Dropping it unsubscribes.
#[derive(Debug)]
pub struct HistorySubscription {
    rx: watch::Receiver<Vec<ChatEntry>>,
}

impl HistorySubscription {
    /// Current entries without waiting.
    pub fn current(&self) -> Vec<ChatEntry> {
        self.rx.borrow().clone()
    }

    /// Waits for the next snapshot. `None` once the store has been dropped.
    pub async fn next_snapshot(&mut self) -> Option<Vec<ChatEntry>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn unsubscribe(self) {}

    pub fn into_stream(self) -> impl Stream<Item = Vec<ChatEntry>> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let snapshot = sub.next_snapshot().await?;
            Some((snapshot, sub))
        })
    }
}
