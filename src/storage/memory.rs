//! In-process document store.
//!
//! Writes can be held back as pending: they show up in snapshots without a
//! server timestamp (like a latency-compensated local write) until
//! [`MemoryStore::commit_pending`] stamps them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::common::{EventId, RoomKey, RoomSummary};
use crate::error::StoreError;

use super::models::{ListenerId, NewRecord, RemoteRecord, StoreDelivery, SummaryPatch};
use super::{DocumentStore, SnapshotSink, server_now};

#[derive(Default)]
struct Inner {
    logs: HashMap<RoomKey, Vec<RemoteRecord>>,
    summaries: HashMap<RoomKey, serde_json::Map<String, serde_json::Value>>,
    listeners: HashMap<ListenerId, (RoomKey, SnapshotSink)>,
    next_listener: u64,
    last_ts: i64,
    hold_writes: bool,
    fail_next_append: Option<String>,
    fail_next_merge: Option<String>,
}

impl Inner {
    fn snapshot(&self, room: &RoomKey) -> Vec<RemoteRecord> {
        let mut records = self.logs.get(room).cloned().unwrap_or_default();
        // Accepted records by server time, pending ones after them.
        records.sort_by_key(|record| (record.server_ts.is_none(), record.server_ts));
        records
    }

    fn deliver(&mut self, room: &RoomKey) {
        let records = self.snapshot(room);
        self.listeners.retain(|id, (listening_room, sink)| {
            if listening_room != room {
                return true;
            }
            sink.send(StoreDelivery {
                room: room.clone(),
                listener: *id,
                result: Ok(records.clone()),
            })
            .is_ok()
        });
    }

    fn stamp(&mut self) -> i64 {
        self.last_ts = server_now(self.last_ts);
        self.last_ts
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While set, appends are accepted into the log without a timestamp.
    pub fn hold_writes(&self, hold: bool) {
        self.lock().hold_writes = hold;
    }

    /// Stamp every pending record, oldest first, and notify listeners.
    pub fn commit_pending(&self) -> usize {
        let mut inner = self.lock();
        let mut touched = Vec::new();
        let rooms: Vec<RoomKey> = inner.logs.keys().cloned().collect();
        let mut committed = 0;
        for room in rooms {
            let pending = inner
                .logs
                .get(&room)
                .map(|log| log.iter().filter(|r| r.server_ts.is_none()).count())
                .unwrap_or(0);
            if pending == 0 {
                continue;
            }
            for _ in 0..pending {
                let ts = inner.stamp();
                if let Some(record) = inner
                    .logs
                    .get_mut(&room)
                    .and_then(|log| log.iter_mut().find(|r| r.server_ts.is_none()))
                {
                    record.server_ts = Some(ts);
                    committed += 1;
                }
            }
            touched.push(room);
        }
        for room in touched {
            inner.deliver(&room);
        }
        committed
    }

    pub fn fail_next_append(&self, reason: &str) {
        self.lock().fail_next_append = Some(reason.to_string());
    }

    pub fn fail_next_merge(&self, reason: &str) {
        self.lock().fail_next_merge = Some(reason.to_string());
    }

    /// Report `reason` to every listener on `room`.
    pub fn fail_listeners(&self, room: &RoomKey, reason: &str) {
        let inner = self.lock();
        for (id, (listening_room, sink)) in &inner.listeners {
            if listening_room == room {
                let _ = sink.send(StoreDelivery {
                    room: room.clone(),
                    listener: *id,
                    result: Err(reason.to_string()),
                });
            }
        }
    }

    /// Write one summary field directly, as an unrelated client would.
    pub fn set_summary_field(&self, room: &RoomKey, key: &str, value: serde_json::Value) {
        self.lock()
            .summaries
            .entry(room.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn listener_count(&self, room: &RoomKey) -> usize {
        self.lock()
            .listeners
            .values()
            .filter(|(listening_room, _)| listening_room == room)
            .count()
    }

    pub fn records(&self, room: &RoomKey) -> Vec<RemoteRecord> {
        self.lock().snapshot(room)
    }

    fn append_now(&self, room: &RoomKey, record: NewRecord) -> Result<EventId, StoreError> {
        let mut inner = self.lock();
        if let Some(reason) = inner.fail_next_append.take() {
            return Err(StoreError::Rejected(reason));
        }
        let server_ts = if inner.hold_writes {
            None
        } else {
            Some(inner.stamp())
        };
        let id = EventId(Uuid::new_v4().to_string());
        inner.logs.entry(room.clone()).or_default().push(RemoteRecord {
            id: id.clone(),
            sender_id: record.sender_id,
            sender_role: record.sender_role,
            content: record.content,
            server_ts,
        });
        inner.deliver(room);
        Ok(id)
    }

    fn merge_now(&self, room: &RoomKey, patch: SummaryPatch) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(reason) = inner.fail_next_merge.take() {
            return Err(StoreError::Rejected(reason));
        }
        let now = inner.stamp();
        inner
            .summaries
            .entry(room.clone())
            .or_default()
            .extend(patch.into_fields(now));
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn listen(&self, room: &RoomKey, sink: SnapshotSink) -> Result<ListenerId, StoreError> {
        let mut inner = self.lock();
        inner.next_listener += 1;
        let id = ListenerId(inner.next_listener);
        let initial = StoreDelivery {
            room: room.clone(),
            listener: id,
            result: Ok(inner.snapshot(room)),
        };
        if sink.send(initial).is_err() {
            return Err(StoreError::Unavailable("listener sink closed".to_string()));
        }
        inner.listeners.insert(id, (room.clone(), sink));
        Ok(id)
    }

    fn unlisten(&self, listener: ListenerId) {
        self.lock().listeners.remove(&listener);
    }

    async fn append(&self, room: &RoomKey, record: NewRecord) -> Result<EventId, StoreError> {
        self.append_now(room, record)
    }

    async fn merge_summary(&self, room: &RoomKey, patch: SummaryPatch) -> Result<(), StoreError> {
        self.merge_now(room, patch)
    }

    fn summary(&self, room: &RoomKey) -> Result<Option<RoomSummary>, StoreError> {
        match self.lock().summaries.get(room) {
            Some(fields) => Ok(Some(serde_json::from_value(serde_json::Value::Object(
                fields.clone(),
            ))?)),
            None => Ok(None),
        }
    }
}
