pub mod http;
pub mod notify;
pub mod projection;
pub mod reconciler;

pub use http::HttpNotifier;
pub use notify::{
    ChannelNotifier, LogNotifier, Notification, NotificationSink, ParticipantResolver,
    RecipientResolver, SideEffectDispatcher,
};
pub use projection::{RoomPhase, RoomProjection};
pub use reconciler::{EventStreamReconciler, SendReceipt, StreamHandle};
