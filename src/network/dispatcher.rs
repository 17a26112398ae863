use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};

use serde::de::DeserializeOwned;

use crate::common::{Frame, QueueUpdate};
use crate::error::{DecodeError, TransportError};

use super::channel::ChannelManager;
use super::session::PushTransport;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type Handler<M> = Box<dyn FnMut(&M) -> Result<(), HandlerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct TopicSubscription<M> {
    handle: SubscriptionHandle,
    topic: String,
    handler: Handler<M>,
    active: bool,
}

/// Routes decoded channel frames to the handlers bound to their topic.
pub struct TopicDispatcher<T: PushTransport, M = QueueUpdate> {
    channel: ChannelManager<T>,
    subscriptions: Vec<TopicSubscription<M>>,
    next_handle: u64,
    _message: PhantomData<fn() -> M>,
}

impl<T: PushTransport, M: DeserializeOwned> TopicDispatcher<T, M> {
    pub fn new(channel: ChannelManager<T>) -> Self {
        Self {
            channel,
            subscriptions: Vec::new(),
            next_handle: 1,
            _message: PhantomData,
        }
    }

    pub fn channel(&self) -> &ChannelManager<T> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut ChannelManager<T> {
        &mut self.channel
    }

    /// Bind `handler` to `topic`. The handler is registered only after the
    /// live session (if any) accepted the topic.
    pub async fn subscribe<F>(
        &mut self,
        topic: &str,
        handler: F,
    ) -> Result<SubscriptionHandle, TransportError>
    where
        F: FnMut(&M) -> Result<(), HandlerError> + 'static,
    {
        self.channel.retain_topic(topic).await?;

        let handle = SubscriptionHandle(self.next_handle);
        self.next_handle += 1;
        self.subscriptions.push(TopicSubscription {
            handle,
            topic: topic.to_string(),
            handler: Box::new(handler),
            active: true,
        });
        log::debug!("Registered handler {handle:?} on `{topic}`");
        Ok(handle)
    }

    /// Returns `false` if the handle was already released.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        let Some(index) = self
            .subscriptions
            .iter()
            .position(|sub| sub.handle == handle && sub.active)
        else {
            return false;
        };
        let mut subscription = self.subscriptions.remove(index);
        subscription.active = false;
        self.channel.release_topic(&subscription.topic);
        true
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.subscriptions
            .iter()
            .filter(|sub| sub.active && sub.topic == topic)
            .count()
    }

    /// Decode `frame` and run every matching handler in registration order.
    /// Returns how many handlers completed successfully.
    pub fn dispatch(&mut self, frame: &Frame) -> usize {
        let message: M = match serde_json::from_slice(&frame.payload) {
            Ok(message) => message,
            Err(source) => {
                let err = DecodeError {
                    topic: frame.topic.clone(),
                    source,
                };
                log::warn!("Dropping frame: {err}");
                return 0;
            }
        };

        let mut delivered = 0;
        for sub in self
            .subscriptions
            .iter_mut()
            .filter(|sub| sub.active && sub.topic == frame.topic)
        {
            let handler = &mut sub.handler;
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    log::warn!("Handler {:?} on `{}` failed: {err}", sub.handle, sub.topic);
                }
                Err(_) => {
                    log::error!("Handler {:?} on `{}` panicked", sub.handle, sub.topic);
                }
            }
        }
        if delivered == 0 {
            log::debug!("No handler accepted frame on `{}`", frame.topic);
        }
        delivered
    }

    /// Wait for one frame and dispatch it. `false` once the session is gone.
    pub async fn process_next(&mut self) -> bool {
        match self.channel.next_frame().await {
            Some(frame) => {
                self.dispatch(&frame);
                true
            }
            None => false,
        }
    }

    /// Drop every handler and close the channel.
    pub fn teardown(&mut self) {
        self.subscriptions.clear();
        self.channel.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::network::testing::MockTransport;

    fn queue_frame(topic: &str, serving: u32) -> Frame {
        Frame {
            topic: topic.to_string(),
            payload: serde_json::to_vec(&serde_json::json!({
                "tenantId": "t1",
                "nowServing": serving,
                "updatedAt": 1,
            }))
            .unwrap(),
        }
    }

    fn recorder(log: &Rc<RefCell<Vec<String>>>, name: &'static str) -> Handler<QueueUpdate> {
        let log = Rc::clone(log);
        Box::new(move |update: &QueueUpdate| {
            log.borrow_mut()
                .push(format!("{name}:{}", update.now_serving.unwrap_or_default()));
            Ok(())
        })
    }

    async fn connected() -> (MockTransport, TopicDispatcher<MockTransport>) {
        let transport = MockTransport::new();
        let mut dispatcher = TopicDispatcher::new(ChannelManager::new(transport.clone()));
        dispatcher.channel_mut().connect().await.unwrap();
        (transport, dispatcher)
    }

    #[tokio::test]
    async fn dispatch_runs_handlers_in_registration_order() {
        let (_, mut dispatcher) = connected().await;
        let log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.subscribe("queue", recorder(&log, "first")).await.unwrap();
        dispatcher.subscribe("other", recorder(&log, "other")).await.unwrap();
        dispatcher.subscribe("queue", recorder(&log, "second")).await.unwrap();

        assert_eq!(dispatcher.dispatch(&queue_frame("queue", 4)), 2);
        assert_eq!(*log.borrow(), vec!["first:4", "second:4"]);
    }

    #[tokio::test]
    async fn malformed_payload_never_reaches_handlers() {
        let (_, mut dispatcher) = connected().await;
        let log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.subscribe("queue", recorder(&log, "h")).await.unwrap();

        let frame = Frame {
            topic: "queue".to_string(),
            payload: b"{not json".to_vec(),
        };
        assert_eq!(dispatcher.dispatch(&frame), 0);
        assert!(log.borrow().is_empty());
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_rest() {
        let (_, mut dispatcher) = connected().await;
        let log = Rc::new(RefCell::new(Vec::new()));
        dispatcher
            .subscribe("queue", |_: &QueueUpdate| Err("boom".into()))
            .await
            .unwrap();
        dispatcher
            .subscribe("queue", |_: &QueueUpdate| -> Result<(), HandlerError> {
                panic!("handler bug")
            })
            .await
            .unwrap();
        dispatcher.subscribe("queue", recorder(&log, "last")).await.unwrap();

        assert_eq!(dispatcher.dispatch(&queue_frame("queue", 9)), 1);
        assert_eq!(*log.borrow(), vec!["last:9"]);
    }

    #[tokio::test]
    async fn unsubscribe_keeps_topic_while_other_handlers_remain() {
        let (transport, mut dispatcher) = connected().await;
        let log = Rc::new(RefCell::new(Vec::new()));
        let first = dispatcher.subscribe("queue", recorder(&log, "a")).await.unwrap();
        let second = dispatcher.subscribe("queue", recorder(&log, "b")).await.unwrap();

        assert!(dispatcher.unsubscribe(first));
        assert!(!dispatcher.unsubscribe(first));
        assert_eq!(transport.subscribed(), vec!["queue"]);

        dispatcher.dispatch(&queue_frame("queue", 1));
        assert_eq!(*log.borrow(), vec!["b:1"]);

        assert!(dispatcher.unsubscribe(second));
        assert!(transport.subscribed().is_empty());
    }

    #[tokio::test]
    async fn process_next_routes_pushed_frames() {
        let (transport, mut dispatcher) = connected().await;
        let log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.subscribe("queue", recorder(&log, "h")).await.unwrap();

        let frame = queue_frame("queue", 2);
        assert!(transport.push_frame("queue", frame.payload));
        assert!(dispatcher.process_next().await);
        assert_eq!(*log.borrow(), vec!["h:2"]);
    }

    #[tokio::test]
    async fn teardown_drops_handlers_and_topics() {
        let (transport, mut dispatcher) = connected().await;
        let log = Rc::new(RefCell::new(Vec::new()));
        dispatcher.subscribe("queue", recorder(&log, "h")).await.unwrap();

        dispatcher.teardown();
        assert_eq!(dispatcher.handler_count("queue"), 0);
        assert!(transport.subscribed().is_empty());
        assert!(dispatcher.channel().topics().is_empty());
    }

    #[tokio::test]
    async fn rejected_topic_registers_no_handler() {
        let (transport, mut dispatcher) = connected().await;
        let log = Rc::new(RefCell::new(Vec::new()));
        transport.reject_topic("queue");

        assert!(dispatcher.subscribe("queue", recorder(&log, "h")).await.is_err());
        assert_eq!(dispatcher.handler_count("queue"), 0);
        assert!(dispatcher.channel().topics().is_empty());
    }

    #[tokio::test]
    async fn cancelled_subscribe_does_not_strand_a_handler() {
        let (transport, mut dispatcher) = connected().await;
        let log = Rc::new(RefCell::new(Vec::new()));
        transport.stall_topic("slow");

        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            dispatcher.subscribe("slow", recorder(&log, "stuck")),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(dispatcher.handler_count("slow"), 0);
        assert!(dispatcher.channel().topics().is_empty());
    }
}
