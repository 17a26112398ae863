use std::fs;
use std::path::Path;

use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::identify;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{Config as SwarmConfig, SwarmEvent};
use libp2p::{Multiaddr, PeerId, Swarm, identity};
use tokio::sync::{mpsc, oneshot};

use crate::common::{Frame, SessionCommand, TransportEvent};
use crate::error::TransportError;

use super::behavior::{ChannelBehavior, ChannelBehaviorEvent, build_behavior};
use super::session::{PushTransport, TransportSession};
use super::transport::build_transport;

/// Push channel over libp2p gossipsub. Each `open` builds a fresh swarm that
/// dials the broker peers and runs on its own tokio task.
pub struct GossipTransport {
    local_key: identity::Keypair,
    listen_addr: Multiaddr,
    bootstrap_peers: Vec<(PeerId, Multiaddr)>,
}

impl GossipTransport {
    pub fn new(
        local_key: identity::Keypair,
        listen_addr: Multiaddr,
        bootstrap_peers: Vec<(PeerId, Multiaddr)>,
    ) -> Self {
        Self {
            local_key,
            listen_addr,
            bootstrap_peers,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        PeerId::from(self.local_key.public())
    }
}

impl PushTransport for GossipTransport {
    type Session = GossipSession;

    async fn open(
        &mut self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<GossipSession, TransportError> {
        let local_peer_id = self.local_peer_id();
        let transport = build_transport(&self.local_key)?;
        let behavior = build_behavior(&self.local_key)?;

        let mut swarm = Swarm::new(
            transport,
            behavior,
            local_peer_id,
            SwarmConfig::with_tokio_executor(),
        );

        swarm
            .listen_on(self.listen_addr.clone())
            .map_err(|err| TransportError::Setup(err.to_string()))?;

        if self.bootstrap_peers.is_empty() {
            log::warn!("No broker peers configured; queue topics will stay silent");
        }
        let mut dialed = 0;
        for (peer_id, addr) in &self.bootstrap_peers {
            log::info!("Dialing broker peer {peer_id} at {addr}");
            match swarm.dial(addr.clone()) {
                Ok(()) => dialed += 1,
                Err(err) => log::warn!("Failed to dial broker peer {peer_id}: {err}"),
            }
        }
        if dialed == 0 {
            if let Some((_, addr)) = self.bootstrap_peers.first() {
                return Err(TransportError::Dial {
                    addr: addr.to_string(),
                    reason: "no broker peer could be dialed".to_string(),
                });
            }
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let expects_brokers = !self.bootstrap_peers.is_empty();
        tokio::spawn(drive_swarm(swarm, commands_rx, events, expects_brokers));
        log::info!("Gossip session opened as {local_peer_id}");

        Ok(GossipSession {
            commands: commands_tx,
        })
    }
}

pub struct GossipSession {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl TransportSession for GossipSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Subscribe {
                topic: topic.to_string(),
                ack,
            })
            .map_err(|_| TransportError::Closed)?;

        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason,
            }),
            Err(_) => Err(TransportError::Closed),
        }
    }

    fn unsubscribe(&mut self, topic: &str) {
        let _ = self.commands.send(SessionCommand::Unsubscribe {
            topic: topic.to_string(),
        });
    }

    fn close(self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }
}

async fn drive_swarm(
    mut swarm: Swarm<ChannelBehavior>,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    expects_brokers: bool,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(SessionCommand::Subscribe { topic, ack }) => {
                        let result = swarm
                            .behaviour_mut()
                            .gossipsub
                            .subscribe(&IdentTopic::new(topic.clone()))
                            .map(|_| ())
                            .map_err(|err| format!("{err:?}"));
                        let _ = ack.send(result);
                    }
                    Some(SessionCommand::Unsubscribe { topic }) => {
                        let _ = swarm
                            .behaviour_mut()
                            .gossipsub
                            .unsubscribe(&IdentTopic::new(topic));
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                }
            }
            event = swarm.select_next_some() => {
                if !handle_swarm_event(event, &mut swarm, &events, expects_brokers) {
                    break;
                }
            }
        }
    }
    log::info!("Gossip session stopped");
}

/// Returns `false` once the session should stop.
fn handle_swarm_event(
    event: SwarmEvent<ChannelBehaviorEvent>,
    swarm: &mut Swarm<ChannelBehavior>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    expects_brokers: bool,
) -> bool {
    match event {
        SwarmEvent::Behaviour(ChannelBehaviorEvent::Gossipsub(gossipsub::Event::Message {
            message,
            ..
        })) => {
            let frame = Frame {
                topic: message.topic.into_string(),
                payload: message.data,
            };
            return events.send(TransportEvent::Frame(frame)).is_ok();
        }
        SwarmEvent::Behaviour(ChannelBehaviorEvent::Gossipsub(
            gossipsub::Event::GossipsubNotSupported { peer_id },
        )) => {
            let _ = events.send(TransportEvent::Diagnostic(format!(
                "peer {peer_id} does not support gossipsub"
            )));
        }
        SwarmEvent::Behaviour(ChannelBehaviorEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            log::debug!("Identify info from {peer_id}: agent={}", info.agent_version);
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            log::info!("Connected to broker peer {peer_id}");
            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            ..
        } => {
            log::info!("Connection to {peer_id} closed");
            if num_established == 0 {
                swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
            }
            if expects_brokers && swarm.network_info().num_peers() == 0 {
                let _ = events.send(TransportEvent::Failed(
                    "lost every broker connection".to_string(),
                ));
                return false;
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            let _ = events.send(TransportEvent::Diagnostic(format!(
                "dial to {peer_id:?} failed: {error}"
            )));
        }
        SwarmEvent::ListenerError { error, .. } => {
            let _ = events.send(TransportEvent::Failed(format!("listener error: {error}")));
            return false;
        }
        SwarmEvent::NewListenAddr { address, .. } => {
            log::info!("Listening on {address}");
        }
        _ => {}
    }
    true
}

/// Load the persisted identity key, generating and saving one on first use.
pub fn load_or_generate_key(path: &Path) -> Result<identity::Keypair, TransportError> {
    let setup = |err: String| TransportError::Setup(format!("{}: {err}", path.display()));

    if path.exists() {
        let bytes = fs::read(path).map_err(|err| setup(err.to_string()))?;
        let keypair = identity::Keypair::from_protobuf_encoding(&bytes)
            .map_err(|err| setup(format!("failed to decode identity key: {err}")))?;
        log::info!("Loaded channel identity key from {}", path.display());
        return Ok(keypair);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|err| setup(err.to_string()))?;
        }
    }
    let keypair = identity::Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|err| setup(format!("failed to encode identity key: {err}")))?;
    fs::write(path, encoded).map_err(|err| setup(err.to_string()))?;
    log::info!("Generated channel identity key at {}", path.display());
    Ok(keypair)
}

/// Parse `/ip4/.../tcp/.../p2p/<peer>` entries, skipping malformed ones.
pub fn parse_bootstrap_peers(entries: &[String]) -> Vec<(PeerId, Multiaddr)> {
    entries
        .iter()
        .filter_map(|entry| {
            let mut addr: Multiaddr = match entry.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    log::warn!("Invalid multiaddr `{entry}`: {err}");
                    return None;
                }
            };

            let peer_id = match addr.pop() {
                Some(Protocol::P2p(peer)) => peer,
                _ => {
                    log::warn!("Multiaddr `{entry}` missing /p2p/PeerId suffix");
                    return None;
                }
            };

            Some((peer_id, addr))
        })
        .collect()
}
