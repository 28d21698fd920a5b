//! In-memory fan-out of per-run log and step events.
//!
//! One broadcast channel per `run_id`, created lazily on first publish or
//! first subscribe and dropped once its last sender/receiver goes away.
//! There is no replay: a subscriber only sees events published after it
//! subscribed. Clients that need history first read persisted entries then
//! subscribe, deduplicating on seq/idx.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{LogEntry, RunStep};

/// Bounded backlog per subscriber. A subscriber that falls this far behind
/// is disconnected (`broadcast::error::RecvError::Lagged`) rather than
/// allowed to block publishers.
pub const SUBSCRIBER_BACKLOG: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogBusEvent {
    Log(LogEntry),
    Step(RunStep),
}

struct RunChannel {
    sender: broadcast::Sender<LogBusEvent>,
}

/// Shared, per-process event bus. Cloning is cheap (`Arc` inside); every
/// clone sees the same underlying channel map.
#[derive(Clone, Default)]
pub struct LogBus {
    channels: std::sync::Arc<Mutex<HashMap<Uuid, RunChannel>>>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish never blocks: `broadcast::Sender::send` only fails when
    /// there are zero subscribers, which we treat as "nobody cared" rather
    /// than an error — durability of the event already happened in the
    /// Store before this is called.
    pub fn publish(&self, run_id: Uuid, event: LogBusEvent) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let channel = channels.entry(run_id).or_insert_with(|| RunChannel {
            sender: broadcast::channel(SUBSCRIBER_BACKLOG).0,
        });
        let _ = channel.sender.send(event);
    }

    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<LogBusEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let channel = channels.entry(run_id).or_insert_with(|| RunChannel {
            sender: broadcast::channel(SUBSCRIBER_BACKLOG).0,
        });
        channel.sender.subscribe()
    }

    /// Drop the channel for a run once it reaches a terminal state and has
    /// no subscribers left, so the map doesn't grow unbounded over the
    /// process lifetime.
    pub fn sweep(&self, run_id: Uuid) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(channel) = channels.get(&run_id) {
            if channel.sender.receiver_count() == 0 {
                channels.remove(&run_id);
            }
        }
    }
}
