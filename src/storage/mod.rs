pub mod database;
pub mod memory;
pub mod models;
pub mod sqlite;

use std::future::Future;

use tokio::sync::mpsc;

use crate::common::{EventId, RoomKey, RoomSummary};
use crate::error::StoreError;

pub use memory::MemoryStore;
pub use models::{ListenerId, NewRecord, RemoteRecord, StoreDelivery, SummaryPatch};
pub use sqlite::{ExternalWrites, SqliteStore};

pub type SnapshotSink = mpsc::UnboundedSender<StoreDelivery>;

/// Realtime document store holding per-room event logs and summaries.
///
/// Listeners get the whole ordered result set of their room on
/// registration and again after every change.
pub trait DocumentStore {
    fn listen(&self, room: &RoomKey, sink: SnapshotSink) -> Result<ListenerId, StoreError>;

    fn unlisten(&self, listener: ListenerId);

    fn append(
        &self,
        room: &RoomKey,
        record: NewRecord,
    ) -> impl Future<Output = Result<EventId, StoreError>> + Send;

    /// Merge-upsert: only the patched fields change.
    fn merge_summary(
        &self,
        room: &RoomKey,
        patch: SummaryPatch,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn summary(&self, room: &RoomKey) -> Result<Option<RoomSummary>, StoreError>;
}

/// Server clock in epoch milliseconds, never going backwards past `last`.
pub(crate) fn server_now(last: i64) -> i64 {
    chrono::Utc::now().timestamp_millis().max(last + 1)
}
