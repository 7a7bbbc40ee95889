//! Typed event feed for uploads and transforms.
//!
//! The bus is owned by the service instances, not ambient global state:
//! one broadcast channel per upload session plus a single wildcard channel
//! that sees every event. Delivery beyond these channels (webhooks,
//! sockets) belongs to the external notification layer.

use crate::models::session::ProgressSnapshot;
use serde::Serialize;
use std::{collections::HashMap, sync::Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

const SESSION_CHANNEL_CAPACITY: usize = 64;
const GLOBAL_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the data plane.
///
/// Per-session ordering follows emission order; there is no ordering
/// guarantee across sessions.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    Progress(ProgressSnapshot),
    ChunkUploaded {
        upload_id: Uuid,
        chunk_index: u32,
        etag: String,
    },
    Paused {
        upload_id: Uuid,
    },
    Resumed {
        upload_id: Uuid,
    },
    Completed(ProgressSnapshot),
    Failed {
        upload_id: Uuid,
        error: String,
    },
    Cancelled {
        upload_id: Uuid,
    },
    Retry {
        upload_id: Uuid,
        chunk_index: u32,
        attempt: u32,
        delay_ms: u64,
    },
    FileTransformed {
        job_id: Uuid,
        source_key: String,
        result_key: String,
    },
}

/// Publish/subscribe registry for data-plane events.
pub struct EventBus {
    global: broadcast::Sender<Event>,
    sessions: Mutex<HashMap<Uuid, broadcast::Sender<Event>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(GLOBAL_CHANNEL_CAPACITY);
        Self {
            global,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to events for one upload session.
    pub fn subscribe(&self, upload_id: Uuid) -> broadcast::Receiver<Event> {
        self.sessions
            .lock()
            .unwrap()
            .entry(upload_id)
            .or_insert_with(|| broadcast::channel(SESSION_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to every event on the plane.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.global.subscribe()
    }

    /// Publish to the session channel (if anyone created one) and the
    /// wildcard channel. Lagging or absent receivers are not an error.
    pub fn emit(&self, upload_id: Option<Uuid>, event: Event) {
        if let Some(id) = upload_id {
            if let Some(tx) = self.sessions.lock().unwrap().get(&id) {
                let _ = tx.send(event.clone());
            }
        }
        let _ = self.global.send(event);
    }

    /// Drop the per-session channel once the session is garbage-collected.
    pub fn remove_session(&self, upload_id: Uuid) {
        self.sessions.lock().unwrap().remove(&upload_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_events_also_reach_the_wildcard_channel() {
        let bus = EventBus::new();
        let id = Uuid::new_v4();
        let mut session_rx = bus.subscribe(id);
        let mut global_rx = bus.subscribe_all();

        bus.emit(Some(id), Event::Paused { upload_id: id });

        assert!(matches!(
            session_rx.recv().await.unwrap(),
            Event::Paused { upload_id } if upload_id == id
        ));
        assert!(matches!(
            global_rx.recv().await.unwrap(),
            Event::Paused { upload_id } if upload_id == id
        ));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit(
            None,
            Event::FileTransformed {
                job_id: Uuid::new_v4(),
                source_key: "a".into(),
                result_key: "b".into(),
            },
        );
    }
}
