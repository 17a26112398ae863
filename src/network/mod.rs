pub mod behavior;
pub mod channel;
pub mod client;
pub mod dispatcher;
pub mod session;
pub mod testing;
pub mod transport;

pub use channel::ChannelManager;
pub use client::{GossipSession, GossipTransport, load_or_generate_key, parse_bootstrap_peers};
pub use dispatcher::{Handler, HandlerError, SubscriptionHandle, TopicDispatcher};
pub use session::{PushTransport, TransportSession};
