pub mod commands;
pub mod events;
pub mod types;

pub use commands::SessionCommand;
pub use events::{ConnectionState, Frame, TransportEvent};
pub use types::{
    Attachment, Event, EventId, OutboundEvent, Payload, QueueTicket, QueueUpdate, RoomKey,
    RoomSummary, SenderRole, Viewer,
};
