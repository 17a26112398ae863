use std::future::Future;

use tokio::sync::mpsc;

use crate::common::TransportEvent;
use crate::error::TransportError;

/// Opens push-channel sessions. One implementation talks libp2p gossipsub,
/// tests use [`super::testing::MockTransport`].
pub trait PushTransport {
    type Session: TransportSession;

    /// Open a fresh session. Everything the session observes afterwards is
    /// reported through `events`.
    fn open(
        &mut self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> impl Future<Output = Result<Self::Session, TransportError>>;
}

/// A live session. Dropped or closed wholesale on teardown; subscriptions
/// never outlive it.
pub trait TransportSession {
    fn subscribe(&mut self, topic: &str) -> impl Future<Output = Result<(), TransportError>>;

    fn unsubscribe(&mut self, topic: &str);

    fn close(self);
}
