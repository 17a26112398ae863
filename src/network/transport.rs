use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::Boxed;
use libp2p::core::upgrade::Version;
use libp2p::{PeerId, Transport, dns, identity, noise, tcp, yamux};

use crate::error::TransportError;

/// tcp + noise + yamux, with `/dns4` and `/dns6` broker addresses resolved
/// through the system resolver.
pub fn build_transport(
    local_key: &identity::Keypair,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, TransportError> {
    let noise_config =
        noise::Config::new(local_key).map_err(|err| TransportError::Setup(err.to_string()))?;

    let tcp = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
    let resolving = dns::tokio::Transport::system(tcp)
        .map_err(|err| TransportError::Setup(format!("dns resolver: {err}")))?;

    let transport = resolving
        .upgrade(Version::V1)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .boxed();

    Ok(transport)
}
