use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{OptionalExtension, Result as SqlResult, params};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common::{EventId, Payload, RoomKey, RoomSummary, SenderRole};
use crate::error::StoreError;

use super::database::RoomDatabase;
use super::models::{ListenerId, NewRecord, RemoteRecord, StoreDelivery, SummaryPatch};
use super::{DocumentStore, SnapshotSink, server_now};

struct Listeners {
    next: u64,
    sinks: HashMap<ListenerId, (RoomKey, SnapshotSink)>,
    /// `PRAGMA data_version` as of the last external-change check.
    data_version: i64,
}

/// Document store persisted in SQLite.
///
/// Writes made through this handle (or its clones) reach listeners at once.
/// Commits from other processes sharing the file are picked up by
/// [`SqliteStore::poll_external_changes`], usually driven by
/// [`SqliteStore::watch_external_writes`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<RoomDatabase>>,
    listeners: Arc<Mutex<Listeners>>,
}

impl SqliteStore {
    /// Open (or create) the store file at `path`.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_database(RoomDatabase::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_database(RoomDatabase::in_memory()?)
    }

    fn from_database(db: RoomDatabase) -> Result<Self, StoreError> {
        let data_version = data_version(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            listeners: Arc::new(Mutex::new(Listeners {
                next: 0,
                sinks: HashMap::new(),
                data_version,
            })),
        })
    }

    fn db(&self) -> MutexGuard<'_, RoomDatabase> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, room: &RoomKey) -> Result<Vec<RemoteRecord>, StoreError> {
        let db = self.db();
        let mut stmt = db.connection().prepare(
            "SELECT id, sender_id, sender_role, content, server_ts
             FROM room_events
             WHERE room = ?1
             ORDER BY server_ts ASC, seq ASC",
        )?;

        let rows = stmt
            .query_map(params![room.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, sender_id, role, content, server_ts)| -> Result<_, StoreError> {
                let sender_role = role.parse::<SenderRole>().map_err(|err| {
                    StoreError::Corrupt(format!("event {id}: {err}"))
                })?;
                let content: Payload = serde_json::from_str(&content)?;
                Ok(RemoteRecord {
                    id: EventId(id),
                    sender_id,
                    sender_role,
                    content,
                    server_ts: Some(server_ts),
                })
            })
            .collect()
    }

    fn deliver(&self, room: &RoomKey) {
        let result = self.snapshot(room).map_err(|err| err.to_string());
        let mut listeners = self.listeners();
        listeners.sinks.retain(|id, (listening_room, sink)| {
            if listening_room != room {
                return true;
            }
            sink.send(StoreDelivery {
                room: room.clone(),
                listener: *id,
                result: result.clone(),
            })
            .is_ok()
        });
    }

    /// Re-deliver every listened room if another connection committed since
    /// the last check. Returns how many rooms were refreshed.
    pub fn poll_external_changes(&self) -> Result<usize, StoreError> {
        let current = data_version(&self.db())?;
        let rooms: HashSet<RoomKey> = {
            let mut listeners = self.listeners();
            if listeners.data_version == current {
                return Ok(0);
            }
            listeners.data_version = current;
            listeners
                .sinks
                .values()
                .map(|(room, _)| room.clone())
                .collect()
        };
        for room in &rooms {
            self.deliver(room);
        }
        if !rooms.is_empty() {
            log::debug!("External commit seen; refreshed {} room(s)", rooms.len());
        }
        Ok(rooms.len())
    }

    /// Poll for external commits every `every` until the guard is dropped.
    /// Must be called inside a tokio runtime.
    pub fn watch_external_writes(&self, every: Duration) -> ExternalWrites {
        let store = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = store.poll_external_changes() {
                    log::warn!("Failed to check the room store for external writes: {err}");
                }
            }
        });
        ExternalWrites { task }
    }

    fn append_now(&self, room: &RoomKey, record: NewRecord) -> Result<EventId, StoreError> {
        let id = EventId(Uuid::new_v4().to_string());
        let content = serde_json::to_string(&record.content)?;
        {
            let db = self.db();
            let conn = db.connection();
            let last: Option<i64> = conn.query_row(
                "SELECT MAX(server_ts) FROM room_events WHERE room = ?1",
                params![room.to_string()],
                |row| row.get(0),
            )?;
            let server_ts = server_now(last.unwrap_or(0));
            conn.execute(
                "INSERT INTO room_events (id, room, sender_id, sender_role, content, server_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.0,
                    room.to_string(),
                    record.sender_id,
                    record.sender_role.as_str(),
                    content,
                    server_ts
                ],
            )?;
        }
        self.deliver(room);
        Ok(id)
    }

    fn merge_now(&self, room: &RoomKey, patch: SummaryPatch) -> Result<(), StoreError> {
        let mut db = self.db();
        let tx = db.connection_mut().transaction()?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT doc FROM room_summaries WHERE room = ?1",
                params![room.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let mut doc: serde_json::Map<String, serde_json::Value> = match existing {
            Some(json) => serde_json::from_str(&json)?,
            None => serde_json::Map::new(),
        };
        doc.extend(patch.into_fields(server_now(0)));

        tx.execute(
            "INSERT INTO room_summaries (room, doc) VALUES (?1, ?2)
             ON CONFLICT(room) DO UPDATE SET doc = excluded.doc",
            params![room.to_string(), serde_json::to_string(&doc)?],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Write one summary field directly, bypassing the send path.
    pub fn set_summary_field(
        &self,
        room: &RoomKey,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let db = self.db();
        db.connection().execute(
            "INSERT INTO room_summaries (room, doc) VALUES (?1, json_object(?2, json(?3)))
             ON CONFLICT(room) DO UPDATE SET doc = json_set(doc, '$.' || ?2, json(?3))",
            params![room.to_string(), key, value.to_string()],
        )?;
        Ok(())
    }
}

fn data_version(db: &RoomDatabase) -> Result<i64, StoreError> {
    Ok(db
        .connection()
        .pragma_query_value(None, "data_version", |row| row.get(0))?)
}

/// Background poller started by [`SqliteStore::watch_external_writes`].
/// Stops when dropped.
pub struct ExternalWrites {
    task: JoinHandle<()>,
}

impl Drop for ExternalWrites {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl DocumentStore for SqliteStore {
    fn listen(&self, room: &RoomKey, sink: SnapshotSink) -> Result<ListenerId, StoreError> {
        let records = self.snapshot(room)?;
        let mut listeners = self.listeners();
        listeners.next += 1;
        let id = ListenerId(listeners.next);
        sink.send(StoreDelivery {
            room: room.clone(),
            listener: id,
            result: Ok(records),
        })
        .map_err(|_| StoreError::Unavailable("listener sink closed".to_string()))?;
        listeners.sinks.insert(id, (room.clone(), sink));
        Ok(id)
    }

    fn unlisten(&self, listener: ListenerId) {
        self.listeners().sinks.remove(&listener);
    }

    async fn append(&self, room: &RoomKey, record: NewRecord) -> Result<EventId, StoreError> {
        self.append_now(room, record)
    }

    async fn merge_summary(&self, room: &RoomKey, patch: SummaryPatch) -> Result<(), StoreError> {
        self.merge_now(room, patch)
    }

    fn summary(&self, room: &RoomKey) -> Result<Option<RoomSummary>, StoreError> {
        let db = self.db();
        let doc: Option<String> = db
            .connection()
            .query_row(
                "SELECT doc FROM room_summaries WHERE room = ?1",
                params![room.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn room() -> RoomKey {
        RoomKey::new("t1", "p7", "d3").unwrap()
    }

    fn record(sender: &str, role: SenderRole, text: &str) -> NewRecord {
        NewRecord {
            sender_id: sender.to_string(),
            sender_role: role,
            content: Payload::text(text),
        }
    }

    #[tokio::test]
    async fn appends_come_back_ordered_by_server_time() {
        let store = SqliteStore::in_memory().unwrap();
        let first = store
            .append(&room(), record("p7", SenderRole::Patient, "hello"))
            .await
            .unwrap();
        let second = store
            .append(&room(), record("d3", SenderRole::Clinician, "hi there"))
            .await
            .unwrap();

        let records = store.snapshot(&room()).unwrap();
        let ids: Vec<&EventId> = records.iter().map(|r| &r.id).collect();
        assert_eq!(ids, vec![&first, &second]);
        assert!(records[0].server_ts < records[1].server_ts);
        assert_eq!(records[1].sender_role, SenderRole::Clinician);
    }

    #[tokio::test]
    async fn listeners_see_writes_for_their_room_only() {
        let store = SqliteStore::in_memory().unwrap();
        let other = RoomKey::new("t1", "p8", "d3").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.listen(&room(), tx).unwrap();
        assert!(rx.try_recv().unwrap().result.unwrap().is_empty());

        store
            .append(&other, record("p8", SenderRole::Patient, "elsewhere"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        store
            .append(&room(), record("p7", SenderRole::Patient, "here"))
            .await
            .unwrap();
        let delivered = rx.try_recv().unwrap().result.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].content.text, "here");
    }

    #[tokio::test]
    async fn merge_keeps_fields_from_other_writers() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .set_summary_field(&room(), "assignedNurse", serde_json::json!("n4"))
            .unwrap();
        store
            .merge_summary(
                &room(),
                SummaryPatch {
                    last_message: "results are in".to_string(),
                    last_message_sender_type: SenderRole::Clinician,
                    last_message_time: Some(42),
                },
            )
            .await
            .unwrap();

        let summary = store.summary(&room()).unwrap().unwrap();
        assert_eq!(summary.last_message.as_deref(), Some("results are in"));
        assert_eq!(summary.last_message_sender_type, Some(SenderRole::Clinician));
        assert_eq!(summary.last_message_time, Some(42));
        assert_eq!(summary.extra["assignedNurse"], serde_json::json!("n4"));
    }

    #[test]
    fn reopening_a_file_keeps_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = SqliteStore::with_path(&path).unwrap();
            store
                .append_now(&room(), record("p7", SenderRole::Patient, "persisted"))
                .unwrap();
        }
        let store = SqliteStore::with_path(&path).unwrap();
        assert_eq!(store.snapshot(&room()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commits_from_another_handle_are_picked_up_by_polling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let writer = SqliteStore::with_path(&path).unwrap();
        let reader = SqliteStore::with_path(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.listen(&room(), tx).unwrap();
        assert!(rx.try_recv().unwrap().result.unwrap().is_empty());
        assert_eq!(reader.poll_external_changes().unwrap(), 0);

        writer
            .append(&room(), record("p7", SenderRole::Patient, "from the other terminal"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());

        assert_eq!(reader.poll_external_changes().unwrap(), 1);
        let delivered = rx.try_recv().unwrap().result.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].content.text, "from the other terminal");
        assert_eq!(reader.poll_external_changes().unwrap(), 0);
    }

    #[tokio::test]
    async fn own_writes_do_not_trigger_a_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::with_path(dir.path().join("own.db")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.listen(&room(), tx).unwrap();
        store
            .append(&room(), record("p7", SenderRole::Patient, "mine"))
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().result.unwrap().len(), 0);
        assert_eq!(rx.try_recv().unwrap().result.unwrap().len(), 1);

        assert_eq!(store.poll_external_changes().unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn watcher_delivers_external_commits_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched.db");
        let writer = SqliteStore::with_path(&path).unwrap();
        let reader = SqliteStore::with_path(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reader.listen(&room(), tx).unwrap();
        rx.recv().await.unwrap();

        let watcher = reader.watch_external_writes(Duration::from_millis(5));
        writer
            .append_now(&room(), record("d3", SenderRole::Clinician, "see you at 3"))
            .unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.result.unwrap().len(), 1);

        drop(watcher);
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer
            .append_now(&room(), record("d3", SenderRole::Clinician, "unseen"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unknown_sender_role_is_reported_as_corrupt() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .db()
            .connection()
            .execute(
                "INSERT INTO room_events (id, room, sender_id, sender_role, content, server_ts)
                 VALUES ('e1', ?1, 'n4', 'NURSE', '{\"text\":\"hello\"}', 1)",
                params![room().to_string()],
            )
            .unwrap();

        match store.snapshot(&room()) {
            Err(StoreError::Corrupt(reason)) => assert!(reason.contains("e1")),
            other => panic!("expected a corrupt-record error, got {other:?}"),
        }
    }
}
