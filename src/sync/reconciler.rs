use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::common::{EventId, OutboundEvent, RoomKey};
use crate::error::{Result, StoreError, SyncError};
use crate::storage::{DocumentStore, ListenerId, NewRecord, StoreDelivery, SummaryPatch};

use super::notify::{
    NotificationSink, ParticipantResolver, RecipientResolver, SideEffectDispatcher, preview,
};
use super::projection::{RoomLedger, RoomPhase, RoomProjection, reconcile};

type Release = (RoomKey, u64);

/// A caller's registration on one room. Hand it back to
/// [`EventStreamReconciler::unobserve`] to detach, or drop it and the
/// reconciler detaches it on its next `drain`, `observe` or `process_next`.
#[derive(Debug)]
pub struct StreamHandle {
    room: RoomKey,
    observer: u64,
    projection: watch::Receiver<Arc<RoomProjection>>,
    release: mpsc::UnboundedSender<Release>,
}

impl StreamHandle {
    pub fn room(&self) -> &RoomKey {
        &self.room
    }

    /// Latest projection. Read-only; the reconciler replaces it wholesale.
    pub fn current(&self) -> Arc<RoomProjection> {
        Arc::clone(&*self.projection.borrow())
    }

    /// Wait until the projection changes. `false` once the room is released.
    pub async fn changed(&mut self) -> bool {
        self.projection.changed().await.is_ok()
    }

    pub fn receiver(&self) -> watch::Receiver<Arc<RoomProjection>> {
        self.projection.clone()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        // Already detached or reconciler gone: nothing to release.
        let _ = self.release.send((self.room.clone(), self.observer));
    }
}

/// Outcome of a successful [`EventStreamReconciler::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub event_id: EventId,
    /// `false` if the summary upsert failed; the event itself was appended.
    pub summary_updated: bool,
}

struct RoomState {
    listener: ListenerId,
    observers: HashSet<u64>,
    ledger: RoomLedger,
    projection: Arc<RoomProjection>,
    publisher: watch::Sender<Arc<RoomProjection>>,
}

/// Keeps one projection per observed room in step with the store's
/// listener snapshots and hands new inbound events to the notifier.
///
/// Rooms move `unattached -> loading -> ready` and are dropped entirely
/// once their last observer detaches.
pub struct EventStreamReconciler<S, N> {
    store: S,
    notifier: SideEffectDispatcher<N>,
    resolver: Box<dyn RecipientResolver>,
    rooms: HashMap<RoomKey, RoomState>,
    deliveries_tx: mpsc::UnboundedSender<StoreDelivery>,
    deliveries_rx: mpsc::UnboundedReceiver<StoreDelivery>,
    releases_tx: mpsc::UnboundedSender<Release>,
    releases_rx: mpsc::UnboundedReceiver<Release>,
    next_observer: u64,
}

impl<S: DocumentStore, N: NotificationSink> EventStreamReconciler<S, N> {
    pub fn new(store: S, notifier: SideEffectDispatcher<N>) -> Self {
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let (releases_tx, releases_rx) = mpsc::unbounded_channel();
        Self {
            store,
            notifier,
            resolver: Box::new(ParticipantResolver),
            rooms: HashMap::new(),
            deliveries_tx,
            deliveries_rx,
            releases_tx,
            releases_rx,
            next_observer: 1,
        }
    }

    pub fn with_resolver(mut self, resolver: impl RecipientResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Start (or join) observation of `room`. The first observer attaches
    /// the store listener; later ones share it.
    pub fn observe(&mut self, room: &RoomKey) -> Result<StreamHandle> {
        self.collect_dropped();
        let observer = self.next_observer;
        self.next_observer += 1;

        let state = match self.rooms.entry(room.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let listener = self.store.listen(room, self.deliveries_tx.clone())?;
                let projection = Arc::new(RoomProjection::loading(room.clone()));
                let (publisher, _) = watch::channel(Arc::clone(&projection));
                log::info!("Observing room {room}");
                entry.insert(RoomState {
                    listener,
                    observers: HashSet::new(),
                    ledger: RoomLedger::default(),
                    projection,
                    publisher,
                })
            }
        };
        state.observers.insert(observer);

        Ok(StreamHandle {
            room: room.clone(),
            observer,
            projection: state.publisher.subscribe(),
            release: self.releases_tx.clone(),
        })
    }

    /// Detach `handle`. The last observer releases the listener and the
    /// projection. Returns `false` for a handle that was already detached.
    pub fn unobserve(&mut self, handle: StreamHandle) -> bool {
        self.release(&handle.room, handle.observer)
    }

    fn release(&mut self, room: &RoomKey, observer: u64) -> bool {
        let Some(state) = self.rooms.get_mut(room) else {
            return false;
        };
        if !state.observers.remove(&observer) {
            return false;
        }
        if state.observers.is_empty() {
            self.store.unlisten(state.listener);
            self.rooms.remove(room);
            log::info!("Released room {room}");
        }
        true
    }

    /// Detach every handle dropped since the last call.
    fn collect_dropped(&mut self) {
        while let Ok((room, observer)) = self.releases_rx.try_recv() {
            self.release(&room, observer);
        }
    }

    pub fn is_observed(&self, room: &RoomKey) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn observer_count(&self, room: &RoomKey) -> usize {
        self.rooms
            .get(room)
            .map(|state| state.observers.len())
            .unwrap_or(0)
    }

    pub fn projection(&self, room: &RoomKey) -> Option<Arc<RoomProjection>> {
        self.rooms
            .get(room)
            .map(|state| Arc::clone(&state.projection))
    }

    /// Write `event`: merge the room summary, then append to the log. The
    /// event comes back through the listener like any other.
    pub async fn send(&self, room: &RoomKey, event: OutboundEvent) -> Result<SendReceipt> {
        if event.content.is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let patch = SummaryPatch {
            last_message: preview(&event.content, usize::MAX),
            last_message_sender_type: event.sender_role,
            last_message_time: None,
        };
        let summary_updated = match self.store.merge_summary(room, patch).await {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Summary upsert for {room} failed: {err}");
                false
            }
        };

        let record = NewRecord {
            sender_id: event.sender_id,
            sender_role: event.sender_role,
            content: event.content,
        };
        let event_id = self
            .store
            .append(room, record)
            .await
            .inspect_err(|err: &StoreError| log::warn!("Append to {room} failed: {err}"))?;

        Ok(SendReceipt {
            event_id,
            summary_updated,
        })
    }

    /// Fold one listener delivery into its room. Returns the number of
    /// notifications dispatched for it.
    pub fn apply(&mut self, delivery: StoreDelivery) -> usize {
        let Some(state) = self.rooms.get_mut(&delivery.room) else {
            log::debug!("Dropping delivery for unobserved room {}", delivery.room);
            return 0;
        };
        if state.listener != delivery.listener {
            log::debug!("Dropping delivery from stale listener {:?}", delivery.listener);
            return 0;
        }

        let previous = Arc::clone(&state.projection);
        let records = match delivery.result {
            Ok(records) => records,
            Err(reason) => {
                log::warn!("Listener for {} reported: {reason}", delivery.room);
                let mut errored = (*previous).clone();
                errored.error = Some(reason);
                publish(state, errored);
                return 0;
            }
        };

        let events = reconcile(
            &previous.events,
            records,
            &mut state.ledger,
            chrono::Utc::now().timestamp_millis(),
        );
        log::debug!("Room {} now holds {} events", delivery.room, events.len());

        let next = publish(
            state,
            RoomProjection {
                room: delivery.room,
                phase: RoomPhase::Ready,
                events,
                error: None,
            },
        );

        // The first snapshot is the room's history, not news.
        if previous.phase == RoomPhase::Loading {
            return 0;
        }
        self.notifier
            .notify_on_new_events(&previous, &next, self.resolver.as_ref())
    }

    /// Apply every delivery already queued without waiting.
    pub fn drain(&mut self) -> usize {
        self.collect_dropped();
        let mut applied = 0;
        while let Ok(delivery) = self.deliveries_rx.try_recv() {
            self.apply(delivery);
            applied += 1;
        }
        applied
    }

    /// Wait for the next delivery (or dropped handle) and act on it;
    /// cancel-safe.
    pub async fn process_next(&mut self) -> usize {
        tokio::select! {
            biased;
            Some((room, observer)) = self.releases_rx.recv() => {
                self.release(&room, observer);
                0
            }
            delivery = self.deliveries_rx.recv() => match delivery {
                Some(delivery) => self.apply(delivery),
                None => 0,
            },
        }
    }
}

fn publish(state: &mut RoomState, projection: RoomProjection) -> Arc<RoomProjection> {
    let projection = Arc::new(projection);
    state.projection = Arc::clone(&projection);
    state.publisher.send_replace(Arc::clone(&projection));
    projection
}
