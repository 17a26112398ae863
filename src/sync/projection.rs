use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::common::{Event, EventId, RoomKey};
use crate::storage::RemoteRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Loading,
    Ready,
}

/// Ordered, deduplicated view of one room's log as handed to presentation
/// code. Events are non-decreasing in `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomProjection {
    #[serde(skip)]
    pub room: RoomKey,
    pub phase: RoomPhase,
    pub events: Vec<Event>,
    /// Last listener error, cleared by the next good snapshot.
    pub error: Option<String>,
}

impl RoomProjection {
    pub fn loading(room: RoomKey) -> Self {
        Self {
            room,
            phase: RoomPhase::Loading,
            events: Vec::new(),
            error: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == RoomPhase::Ready
    }

    pub fn get(&self, id: &EventId) -> Option<&Event> {
        self.events.iter().find(|event| &event.id == id)
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.get(id).is_some()
    }
}

/// Per-room memory carried between snapshots.
#[derive(Debug, Default)]
pub(crate) struct RoomLedger {
    /// First-seen order, the tie-break for equal timestamps.
    arrivals: HashMap<EventId, u64>,
    /// Placeholder times handed to events the store has not stamped yet.
    provisional: HashMap<EventId, i64>,
    next_arrival: u64,
}

impl RoomLedger {
    fn arrival(&mut self, id: &EventId) -> u64 {
        if let Some(seq) = self.arrivals.get(id) {
            return *seq;
        }
        let seq = self.next_arrival;
        self.next_arrival += 1;
        self.arrivals.insert(id.clone(), seq);
        seq
    }
}

/// Fold a full snapshot into the previous projection.
///
/// Accepted events keep their content and timestamp forever. Events the
/// store has not stamped yet sort after every accepted event, in arrival
/// order, with a placeholder time clamped so the sequence never goes
/// backwards. Events missing from `records` are kept.
pub(crate) fn reconcile(
    previous: &[Event],
    records: Vec<RemoteRecord>,
    ledger: &mut RoomLedger,
    now: i64,
) -> Vec<Event> {
    let mut merged: HashMap<EventId, Event> = previous
        .iter()
        .map(|event| (event.id.clone(), event.clone()))
        .collect();
    let mut in_snapshot = HashSet::with_capacity(records.len());

    for record in records {
        if !in_snapshot.insert(record.id.clone()) {
            log::debug!("Duplicate record {} in snapshot ignored", record.id);
            continue;
        }
        ledger.arrival(&record.id);

        if let Some(existing) = merged.get(&record.id) {
            if !existing.provisional {
                continue;
            }
        }

        let event = match record.server_ts {
            Some(ts) => {
                ledger.provisional.remove(&record.id);
                Event {
                    id: record.id,
                    sender_id: record.sender_id,
                    sender_role: record.sender_role,
                    content: record.content,
                    timestamp: ts,
                    provisional: false,
                }
            }
            None => {
                let placeholder = *ledger.provisional.entry(record.id.clone()).or_insert(now);
                Event {
                    id: record.id,
                    sender_id: record.sender_id,
                    sender_role: record.sender_role,
                    content: record.content,
                    timestamp: placeholder,
                    provisional: true,
                }
            }
        };
        merged.insert(event.id.clone(), event);
    }

    let missing = previous
        .iter()
        .filter(|event| !in_snapshot.contains(&event.id))
        .count();
    if missing > 0 {
        log::warn!("Snapshot omitted {missing} previously delivered events; keeping them");
    }

    let (mut accepted, mut pending): (Vec<Event>, Vec<Event>) = merged
        .into_values()
        .partition(|event| !event.provisional);

    accepted.sort_by_key(|event| (event.timestamp, ledger.arrival(&event.id)));
    pending.sort_by_key(|event| ledger.arrival(&event.id));

    let mut floor = accepted.last().map(|event| event.timestamp).unwrap_or(i64::MIN);
    for event in &mut pending {
        let placeholder = ledger
            .provisional
            .get(&event.id)
            .copied()
            .unwrap_or(event.timestamp);
        event.timestamp = placeholder.max(floor);
        floor = event.timestamp;
    }

    accepted.extend(pending);
    accepted
}
