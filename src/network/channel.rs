use tokio::sync::{mpsc, watch};

use crate::common::{ConnectionState, Frame, TransportEvent};
use crate::error::TransportError;

use super::session::{PushTransport, TransportSession};

/// One physical session plus what it has been asked to listen on.
struct ChannelConnection<S> {
    session: S,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Owns the single push-channel session.
///
/// Topic interest outlives sessions: every topic retained here is subscribed
/// again, in first-registration order, each time a new session comes up.
pub struct ChannelManager<T: PushTransport> {
    transport: T,
    connection: Option<ChannelConnection<T::Session>>,
    /// Distinct topics with their holder count, in registration order.
    topics: Vec<(String, usize)>,
    state: watch::Sender<ConnectionState>,
}

impl<T: PushTransport> ChannelManager<T> {
    pub fn new(transport: T) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            connection: None,
            topics: Vec::new(),
            state,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Read-only view of the connection state for presentation code.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|(topic, _)| topic.clone()).collect()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Open a session and re-establish every retained topic.
    ///
    /// No-op while a session is live. Does not retry on failure; the state
    /// moves to `Failing` and the caller decides when to try again. A
    /// `Connecting` state with no session can only be left behind by a
    /// cancelled `connect`, so it is retried like `Failing`.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connection.is_some() && self.state() == ConnectionState::Connected {
            return Ok(());
        }
        if self.state() == ConnectionState::Connecting {
            log::debug!("Previous connect attempt was abandoned; retrying");
        }
        self.teardown_session();
        self.set_state(ConnectionState::Connecting);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = match self.transport.open(events_tx).await {
            Ok(session) => session,
            Err(err) => {
                log::warn!("Push channel failed to open: {err}");
                self.set_state(ConnectionState::Failing);
                return Err(err);
            }
        };

        for (topic, _) in &self.topics {
            if let Err(err) = session.subscribe(topic).await {
                log::warn!("Failed to re-establish topic `{topic}`: {err}");
                session.close();
                self.set_state(ConnectionState::Failing);
                return Err(err);
            }
            log::debug!("Subscribed to topic `{topic}`");
        }

        self.connection = Some(ChannelConnection {
            session,
            events: events_rx,
        });
        self.set_state(ConnectionState::Connected);
        log::info!(
            "Push channel connected ({} topics re-established)",
            self.topics.len()
        );
        Ok(())
    }

    /// Close the session if there is one. Safe from any state. Retained
    /// topics are kept for the next `connect`.
    pub fn disconnect(&mut self) {
        if self.teardown_session() {
            log::info!("Push channel disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Register interest in `topic`, subscribing the live session the first
    /// time the topic is seen.
    ///
    /// Interest is recorded only once the live session (if any) accepted the
    /// subscription. On error nothing is retained; a closed session also
    /// moves the manager to `Failing`.
    pub async fn retain_topic(&mut self, topic: &str) -> Result<(), TransportError> {
        if let Some((_, holders)) = self.topics.iter_mut().find(|(t, _)| t == topic) {
            *holders += 1;
            return Ok(());
        }

        if let Some(connection) = self.connection.as_mut() {
            if let Err(err) = connection.session.subscribe(topic).await {
                log::warn!("Subscribe to `{topic}` failed on live session: {err}");
                if matches!(err, TransportError::Closed) {
                    self.fail("session closed during subscribe");
                }
                return Err(err);
            }
        }
        self.topics.push((topic.to_string(), 1));
        Ok(())
    }

    /// Drop one holder of `topic`; the last holder unsubscribes the session.
    pub fn release_topic(&mut self, topic: &str) {
        let Some(index) = self.topics.iter().position(|(t, _)| t == topic) else {
            return;
        };
        let holders = &mut self.topics[index].1;
        *holders -= 1;
        if *holders > 0 {
            return;
        }
        self.topics.remove(index);
        if let Some(connection) = self.connection.as_mut() {
            connection.session.unsubscribe(topic);
        }
    }

    /// Forget all topics and close the session.
    pub fn shutdown(&mut self) {
        self.topics.clear();
        self.disconnect();
    }

    /// Wait for the next frame of the live session.
    ///
    /// Diagnostics are logged and skipped. Returns `None` when there is no
    /// session or the session failed while waiting; cancel-safe.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let event = self.connection.as_mut()?.events.recv().await;
            match event {
                Some(TransportEvent::Frame(frame)) => return Some(frame),
                Some(TransportEvent::Diagnostic(message)) => {
                    log::warn!("Broker diagnostic: {message}");
                }
                Some(TransportEvent::Failed(reason)) => {
                    self.fail(&reason);
                    return None;
                }
                None => {
                    self.fail("transport event stream ended");
                    return None;
                }
            }
        }
    }

    fn fail(&mut self, reason: &str) {
        log::warn!("Push channel failing: {reason}");
        self.teardown_session();
        self.set_state(ConnectionState::Failing);
    }

    fn teardown_session(&mut self) -> bool {
        match self.connection.take() {
            Some(connection) => {
                connection.session.close();
                true
            }
            None => false,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                log::debug!("Push channel state {current:?} -> {next:?}");
                *current = next;
                true
            }
        });
    }
}

impl<T: PushTransport> Drop for ChannelManager<T> {
    fn drop(&mut self) {
        self.teardown_session();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::network::testing::MockTransport;

    #[tokio::test]
    async fn connect_is_idempotent() {
        let transport = MockTransport::new();
        let mut manager = ChannelManager::new(transport.clone());

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(transport.opened(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_is_safe_when_never_connected() {
        let mut manager = ChannelManager::new(MockTransport::new());
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn open_failure_moves_to_failing_and_retry_succeeds() {
        let transport = MockTransport::new();
        transport.fail_next_open();
        let mut manager = ChannelManager::new(transport.clone());

        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Failing);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn reconnect_resubscribes_in_registration_order() {
        let transport = MockTransport::new();
        let mut manager = ChannelManager::new(transport.clone());
        manager.retain_topic("queue-b").await.unwrap();
        manager.retain_topic("queue-a").await.unwrap();
        manager.retain_topic("queue-b").await.unwrap();

        manager.connect().await.unwrap();
        assert_eq!(transport.subscribed(), vec!["queue-b", "queue-a"]);

        manager.disconnect();
        assert!(transport.subscribed().is_empty());

        manager.connect().await.unwrap();
        assert_eq!(transport.subscribed(), vec!["queue-b", "queue-a"]);
        assert_eq!(transport.opened(), 2);
    }

    #[tokio::test]
    async fn dropped_session_reports_failing() {
        let transport = MockTransport::new();
        let mut manager = ChannelManager::new(transport.clone());
        let mut state = manager.watch_state();
        manager.connect().await.unwrap();

        transport.drop_connection("peer reset");
        assert!(manager.next_frame().await.is_none());
        assert_eq!(manager.state(), ConnectionState::Failing);
        assert_eq!(*state.borrow_and_update(), ConnectionState::Failing);
    }

    #[tokio::test]
    async fn diagnostics_do_not_end_the_session() {
        let transport = MockTransport::new();
        let mut manager = ChannelManager::new(transport.clone());
        manager.retain_topic("queue").await.unwrap();
        manager.connect().await.unwrap();

        assert!(transport.push_diagnostic("slow consumer"));
        assert!(transport.push_frame("queue", b"{}".to_vec()));

        let frame = manager.next_frame().await.unwrap();
        assert_eq!(frame.topic, "queue");
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn releasing_last_holder_unsubscribes() {
        let transport = MockTransport::new();
        let mut manager = ChannelManager::new(transport.clone());
        manager.connect().await.unwrap();
        manager.retain_topic("queue").await.unwrap();
        manager.retain_topic("queue").await.unwrap();

        manager.release_topic("queue");
        assert_eq!(transport.subscribed(), vec!["queue"]);
        manager.release_topic("queue");
        assert!(transport.subscribed().is_empty());
        assert!(manager.topics().is_empty());
    }

    #[tokio::test]
    async fn abandoned_connect_can_be_retried() {
        let transport = MockTransport::new();
        transport.stall_next_open();
        let mut manager = ChannelManager::new(transport.clone());

        let attempt = tokio::time::timeout(Duration::from_millis(10), manager.connect()).await;
        assert!(attempt.is_err());
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.transport().opened(), 1);
    }

    #[tokio::test]
    async fn rejected_live_subscribe_is_reported_and_not_retained() {
        let transport = MockTransport::new();
        let mut manager = ChannelManager::new(transport.clone());
        manager.connect().await.unwrap();
        transport.reject_topic("queue");

        let result = manager.retain_topic("queue").await;
        assert!(matches!(result, Err(TransportError::Subscribe { .. })));
        assert!(manager.topics().is_empty());
        assert!(transport.subscribed().is_empty());
        assert_eq!(manager.state(), ConnectionState::Connected);

        transport.accept_all_topics();
        manager.retain_topic("queue").await.unwrap();
        assert_eq!(transport.subscribed(), vec!["queue"]);
    }

    #[tokio::test]
    async fn cancelled_subscribe_leaves_no_hold() {
        let transport = MockTransport::new();
        let mut manager = ChannelManager::new(transport.clone());
        manager.connect().await.unwrap();
        transport.stall_topic("queue");

        let attempt =
            tokio::time::timeout(Duration::from_millis(10), manager.retain_topic("queue")).await;
        assert!(attempt.is_err());
        assert!(manager.topics().is_empty());
    }

    #[tokio::test]
    async fn failed_replay_closes_session_and_next_connect_replays_all() {
        let transport = MockTransport::new();
        let mut manager = ChannelManager::new(transport.clone());
        manager.retain_topic("queue-t1").await.unwrap();
        manager.retain_topic("queue-t2").await.unwrap();
        manager.connect().await.unwrap();

        transport.drop_connection("broker restarted");
        assert!(manager.next_frame().await.is_none());
        transport.reject_topic("queue-t2");

        let result = manager.connect().await;
        assert!(matches!(result, Err(TransportError::Subscribe { ref topic, .. }) if topic == "queue-t2"));
        assert_eq!(manager.state(), ConnectionState::Failing);
        assert!(transport.subscribed().is_empty());
        assert!(manager.next_frame().await.is_none());
        assert_eq!(manager.topics(), vec!["queue-t1", "queue-t2"]);

        transport.accept_all_topics();
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.subscribed(), vec!["queue-t1", "queue-t2"]);
        assert_eq!(transport.opened(), 3);
        assert_eq!(
            transport.subscribe_log(),
            vec!["queue-t1", "queue-t2", "queue-t1", "queue-t2", "queue-t1", "queue-t2"]
        );
    }
}
