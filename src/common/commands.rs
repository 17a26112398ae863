use tokio::sync::oneshot;

/// Commands sent from a gossip session handle to its swarm task.
#[derive(Debug)]
pub enum SessionCommand {
    Subscribe {
        topic: String,
        /// Receives `Err(reason)` when the swarm rejects the subscription.
        ack: oneshot::Sender<Result<(), String>>,
    },
    Unsubscribe {
        topic: String,
    },
    Shutdown,
}
