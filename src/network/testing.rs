//! In-process push transport used by tests and local demos.
//!
//! Behaves like a broker: frames pushed with [`MockTransport::push_frame`]
//! only reach the live session if it is subscribed to the topic.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::common::{Frame, TransportEvent};
use crate::error::TransportError;

use super::session::{PushTransport, TransportSession};

#[derive(Default)]
struct MockState {
    opened: usize,
    fail_next_open: bool,
    stall_next_open: bool,
    reject_topics: Vec<String>,
    stall_topics: Vec<String>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    subscribed: Vec<String>,
    subscribe_log: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a frame if the live session listens on `topic`.
    pub fn push_frame(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let state = self.lock();
        if !state.subscribed.iter().any(|t| t == topic) {
            return false;
        }
        match &state.events {
            Some(events) => events
                .send(TransportEvent::Frame(Frame {
                    topic: topic.to_string(),
                    payload: payload.into(),
                }))
                .is_ok(),
            None => false,
        }
    }

    pub fn push_diagnostic(&self, message: &str) -> bool {
        match &self.lock().events {
            Some(events) => events
                .send(TransportEvent::Diagnostic(message.to_string()))
                .is_ok(),
            None => false,
        }
    }

    /// Simulate the network dropping the session.
    pub fn drop_connection(&self, reason: &str) {
        let mut state = self.lock();
        if let Some(events) = state.events.take() {
            let _ = events.send(TransportEvent::Failed(reason.to_string()));
        }
        state.subscribed.clear();
    }

    pub fn fail_next_open(&self) {
        self.lock().fail_next_open = true;
    }

    /// The next `open` never resolves.
    pub fn stall_next_open(&self) {
        self.lock().stall_next_open = true;
    }

    pub fn reject_topic(&self, topic: &str) {
        self.lock().reject_topics.push(topic.to_string());
    }

    pub fn accept_all_topics(&self) {
        self.lock().reject_topics.clear();
    }

    /// Subscribing to `topic` never resolves.
    pub fn stall_topic(&self, topic: &str) {
        self.lock().stall_topics.push(topic.to_string());
    }

    pub fn opened(&self) -> usize {
        self.lock().opened
    }

    /// Topics the live session is subscribed to, in subscription order.
    pub fn subscribed(&self) -> Vec<String> {
        self.lock().subscribed.clone()
    }

    /// Every subscribe call ever made, across sessions.
    pub fn subscribe_log(&self) -> Vec<String> {
        self.lock().subscribe_log.clone()
    }
}

impl PushTransport for MockTransport {
    type Session = MockSession;

    async fn open(
        &mut self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<MockSession, TransportError> {
        let stall = std::mem::take(&mut self.lock().stall_next_open);
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_open) {
            return Err(TransportError::Dial {
                addr: "mock".to_string(),
                reason: "refused".to_string(),
            });
        }
        state.opened += 1;
        state.events = Some(events);
        state.subscribed.clear();
        Ok(MockSession {
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MockSession {
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransportSession for MockSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let stall = self.lock().stall_topics.iter().any(|t| t == topic);
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        state.subscribe_log.push(topic.to_string());
        if state.reject_topics.iter().any(|t| t == topic) {
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "rejected by mock broker".to_string(),
            });
        }
        if !state.subscribed.iter().any(|t| t == topic) {
            state.subscribed.push(topic.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) {
        self.lock().subscribed.retain(|t| t != topic);
    }

    fn close(self) {
        let mut state = self.lock();
        state.events = None;
        state.subscribed.clear();
    }
}
