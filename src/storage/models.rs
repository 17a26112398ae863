use serde::{Deserialize, Serialize};

use crate::common::{EventId, Payload, RoomKey, SenderRole};

/// A record as the store reports it. `server_ts` stays `None` until the
/// store has accepted the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: EventId,
    pub sender_id: String,
    pub sender_role: SenderRole,
    pub content: Payload,
    pub server_ts: Option<i64>,
}

/// Body of an append request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub sender_id: String,
    pub sender_role: SenderRole,
    pub content: Payload,
}

/// Fields a send touches on the room summary. Everything else in the
/// summary document is left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryPatch {
    pub last_message: String,
    pub last_message_sender_type: SenderRole,
    /// `None` asks the store to stamp its own acceptance time.
    pub last_message_time: Option<i64>,
}

impl SummaryPatch {
    /// Patch as document fields, with the server time filled in when unset.
    pub fn into_fields(self, server_now: i64) -> serde_json::Map<String, serde_json::Value> {
        let mut fields = serde_json::Map::new();
        fields.insert("lastMessage".into(), self.last_message.into());
        fields.insert(
            "lastMessageSenderType".into(),
            self.last_message_sender_type.as_str().into(),
        );
        fields.insert(
            "lastMessageTime".into(),
            self.last_message_time.unwrap_or(server_now).into(),
        );
        fields
    }
}

/// One listener callback: the full ordered result set of a room, or the
/// error the listener hit.
#[derive(Debug)]
pub struct StoreDelivery {
    pub room: RoomKey,
    pub listener: ListenerId,
    pub result: Result<Vec<RemoteRecord>, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);
