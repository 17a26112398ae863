use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

static SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("room key segment pattern is valid"));

/// Deterministic room address built from `(tenant, participant A, participant B)`.
///
/// Rendered as `tenant_a_b`, so the segments themselves may not contain `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    tenant: String,
    participant_a: String,
    participant_b: String,
}

impl RoomKey {
    pub fn new(
        tenant: impl Into<String>,
        participant_a: impl Into<String>,
        participant_b: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let key = Self {
            tenant: tenant.into(),
            participant_a: participant_a.into(),
            participant_b: participant_b.into(),
        };
        let valid = [&key.tenant, &key.participant_a, &key.participant_b]
            .iter()
            .all(|segment| SEGMENT.is_match(segment));
        if valid {
            Ok(key)
        } else {
            Err(SyncError::InvalidRoomKey(key.to_string()))
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.participant_a, &self.participant_b)
    }

    /// The participant that is not `sender_id`, if `sender_id` is one of the two.
    pub fn other_participant(&self, sender_id: &str) -> Option<&str> {
        if sender_id == self.participant_a {
            Some(&self.participant_b)
        } else if sender_id == self.participant_b {
            Some(&self.participant_a)
        } else {
            None
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.tenant, self.participant_a, self.participant_b
        )
    }
}

impl FromStr for RoomKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(tenant), Some(a), Some(b), None) => RoomKey::new(tenant, a, b),
            _ => Err(SyncError::InvalidRoomKey(s.to_string())),
        }
    }
}

/// Log-position identity of an event, assigned by the store on append.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderRole {
    #[serde(rename = "PATIENT")]
    Patient,
    #[serde(rename = "CLINICIAN", alias = "DOCTOR")]
    Clinician,
    #[serde(rename = "SYSTEM")]
    System,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Patient => "PATIENT",
            SenderRole::Clinician => "CLINICIAN",
            SenderRole::System => "SYSTEM",
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SenderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PATIENT" => Ok(SenderRole::Patient),
            "CLINICIAN" | "DOCTOR" => Ok(SenderRole::Clinician),
            "SYSTEM" => Ok(SenderRole::System),
            other => Err(format!("unknown sender role `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }

    pub fn has_attachment(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// One entry of a room's reconciled log.
///
/// `timestamp` is milliseconds since the epoch. While `provisional` is set it
/// is a local ordering placeholder and will be replaced by the store's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub sender_id: String,
    pub sender_role: SenderRole,
    pub content: Payload,
    pub timestamp: i64,
    pub provisional: bool,
}

/// A message the local viewer wants to append to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub sender_id: String,
    pub sender_role: SenderRole,
    pub content: Payload,
}

impl OutboundEvent {
    pub fn text(sender_id: impl Into<String>, role: SenderRole, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_role: role,
            content: Payload::text(text),
        }
    }
}

/// Who is looking at the rooms on this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub id: String,
    pub role: SenderRole,
}

impl Viewer {
    pub fn new(id: impl Into<String>, role: SenderRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn authored(&self, event: &Event) -> bool {
        event.sender_id == self.id || event.sender_role == self.role
    }
}

/// Listing-view summary of a room. Unknown fields written by other clients
/// are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_sender_type: Option<SenderRole>,
    #[serde(default)]
    pub last_message_time: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Broadcast queue state carried on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    pub tenant_id: String,
    #[serde(default)]
    pub now_serving: Option<u32>,
    #[serde(default)]
    pub waiting: Vec<QueueTicket>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTicket {
    pub number: u32,
    pub patient_id: String,
    #[serde(default)]
    pub triage_level: Option<u8>,
}
