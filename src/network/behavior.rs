use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use libp2p::gossipsub;
use libp2p::identify;
use libp2p::identity;
use libp2p::swarm::NetworkBehaviour;

use crate::error::TransportError;

const IDENTIFY_PROTOCOL: &str = "/clinic-sync/1.0.0";

#[derive(NetworkBehaviour)]
pub struct ChannelBehavior {
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
}

pub fn build_behavior(local_key: &identity::Keypair) -> Result<ChannelBehavior, TransportError> {
    // Queue snapshots are idempotent state; identical payloads share an id.
    let message_id_fn = |message: &gossipsub::Message| {
        let mut hasher = DefaultHasher::new();
        message.topic.hash(&mut hasher);
        message.data.hash(&mut hasher);
        gossipsub::MessageId::from(hasher.finish().to_string())
    };

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(10))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .message_id_fn(message_id_fn)
        .build()
        .map_err(|err| TransportError::Setup(err.to_string()))?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(local_key.clone()),
        gossipsub_config,
    )
    .map_err(|err| TransportError::Setup(err.to_string()))?;

    let identify = identify::Behaviour::new(identify::Config::new(
        IDENTIFY_PROTOCOL.to_string(),
        local_key.public(),
    ));

    Ok(ChannelBehavior {
        gossipsub,
        identify,
    })
}
