use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::common::{Event, EventId, Payload, RoomKey, SenderRole, Viewer};
use crate::error::NotifyError;

use super::projection::RoomProjection;

pub const DEFAULT_PREVIEW_CHARS: usize = 100;

/// Body sent to the notification endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub room_id: String,
    pub sender_role: SenderRole,
    pub recipient_id: String,
    pub content: String,
    pub has_attachment: bool,
}

pub trait NotificationSink: Send + Sync + 'static {
    fn deliver(
        &self,
        notification: Notification,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Picks who should be told about an event.
pub trait RecipientResolver {
    fn resolve(&self, room: &RoomKey, event: &Event) -> Option<String>;
}

/// The room participant who did not send the event.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParticipantResolver;

impl RecipientResolver for ParticipantResolver {
    fn resolve(&self, room: &RoomKey, event: &Event) -> Option<String> {
        room.other_participant(&event.sender_id).map(str::to_string)
    }
}

impl<F> RecipientResolver for F
where
    F: Fn(&RoomKey, &Event) -> Option<String>,
{
    fn resolve(&self, room: &RoomKey, event: &Event) -> Option<String> {
        self(room, event)
    }
}

/// Turns "new since the last projection" into fire-and-forget notifications.
pub struct SideEffectDispatcher<N> {
    sink: Arc<N>,
    viewer: Viewer,
    preview_chars: usize,
}

impl<N: NotificationSink> SideEffectDispatcher<N> {
    pub fn new(sink: N, viewer: Viewer) -> Self {
        Self {
            sink: Arc::new(sink),
            viewer,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }

    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    /// Notify once for every event in `next` whose id is absent from
    /// `previous` and that the local viewer did not write. Returns how many
    /// notifications were handed off.
    pub fn notify_on_new_events(
        &self,
        previous: &RoomProjection,
        next: &RoomProjection,
        resolver: &dyn RecipientResolver,
    ) -> usize {
        let seen: HashSet<&EventId> = previous.events.iter().map(|event| &event.id).collect();
        let mut dispatched = 0;

        for event in next.events.iter().filter(|event| !seen.contains(&event.id)) {
            if self.viewer.authored(event) {
                log::debug!("Not notifying for own event {}", event.id);
                continue;
            }
            let Some(recipient_id) = resolver.resolve(&next.room, event) else {
                log::debug!("No recipient for event {} in {}", event.id, next.room);
                continue;
            };
            if recipient_id == event.sender_id {
                continue;
            }

            self.fire(Notification {
                room_id: next.room.to_string(),
                sender_role: event.sender_role,
                recipient_id,
                content: preview(&event.content, self.preview_chars),
                has_attachment: event.content.has_attachment(),
            });
            dispatched += 1;
        }
        dispatched
    }

    fn fire(&self, notification: Notification) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!(
                "No runtime to deliver notification for {}; dropped",
                notification.room_id
            );
            return;
        };
        let sink = Arc::clone(&self.sink);
        runtime.spawn(async move {
            let room_id = notification.room_id.clone();
            if let Err(err) = sink.deliver(notification).await {
                log::warn!("Notification for {room_id} not delivered: {err}");
            }
        });
    }
}

/// Short text for a notification body.
pub fn preview(content: &Payload, max_chars: usize) -> String {
    let text = content.text.trim();
    if text.is_empty() {
        return if content.has_attachment() {
            "[attachment]".to_string()
        } else {
            String::new()
        };
    }
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

/// Logs notifications instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    async fn deliver(&self, notification: Notification) -> Result<(), NotifyError> {
        log::info!(
            "Notify {} in {} ({}): {}",
            notification.recipient_id,
            notification.room_id,
            notification.sender_role,
            notification.content
        );
        Ok(())
    }
}

/// Forwards every notification into a channel. Used by tests and by callers
/// that want to observe dispatches.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Notification>,
    fail: bool,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                fail: false,
            },
            receiver,
        )
    }

    /// Record the notification, then report the delivery as failed.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl NotificationSink for ChannelNotifier {
    async fn deliver(&self, notification: Notification) -> Result<(), NotifyError> {
        let _ = self.sender.send(notification);
        if self.fail {
            Err(NotifyError::Status(503))
        } else {
            Ok(())
        }
    }
}
