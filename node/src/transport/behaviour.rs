use libp2p::gossipsub::{ self, IdentTopic, MessageAuthenticity };
use libp2p::identity::Keypair;
use libp2p::request_response::{ self, ProtocolSupport };
use libp2p::swarm::NetworkBehaviour;
use libp2p::{ identify, ping, StreamProtocol };
use serde::{ Deserialize, Serialize };
use shared::envelope::EncryptedEnvelope;
use shared::sync::{ OperationSyncData, SyncAck };
use std::hash::{ DefaultHasher, Hash, Hasher };
use std::time::Duration;

pub const TSS_PROTOCOL: &str = "/dknet/tss/1.0.0";
pub const OPSYNC_PROTOCOL: &str = "/dknet/opsync/1.0.0";
pub const BROADCAST_TOPIC: &str = "dknet-tss-broadcast";
pub const PROTOCOL_VERSION: &str = "dknet/1.0.0";

/// A point-to-point protocol frame: the ECIES-sealed envelope plus the
/// sender's identity key, so the receiver can run static ECDH without
/// waiting for identify to complete. The key must match the authenticated
/// connection peer or the frame is dropped.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TssRequest {
    pub sender_key: Vec<u8>,
    pub envelope: EncryptedEnvelope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TssAck {
    pub ok: bool,
}

#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub tss: request_response::cbor::Behaviour<TssRequest, TssAck>,
    pub opsync: request_response::cbor::Behaviour<OperationSyncData, SyncAck>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

impl Behaviour {
    pub fn new(keypair: &Keypair) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let gossip_config = gossipsub::ConfigBuilder
            ::default()
            // dedup messages by content
            .message_id_fn(|msg| {
                let mut hasher = DefaultHasher::new();
                msg.data.hash(&mut hasher);
                gossipsub::MessageId::from(hasher.finish().to_be_bytes())
            })
            .build()
            .map_err(|err| format!("gossipsub config: {}", err))?;
        let mut gossipsub = gossipsub::Behaviour
            ::new(MessageAuthenticity::Signed(keypair.clone()), gossip_config)
            .map_err(|err| format!("gossipsub behaviour: {}", err))?;
        gossipsub.subscribe(&broadcast_topic())?;

        let rr_config = request_response::Config::default().with_request_timeout(
            Duration::from_secs(10)
        );
        let tss = request_response::cbor::Behaviour::new(
            [(StreamProtocol::new(TSS_PROTOCOL), ProtocolSupport::Full)],
            rr_config.clone()
        );
        let opsync = request_response::cbor::Behaviour::new(
            [(StreamProtocol::new(OPSYNC_PROTOCOL), ProtocolSupport::Full)],
            rr_config
        );

        let identify = identify::Behaviour::new(
            identify::Config::new(PROTOCOL_VERSION.to_string(), keypair.public())
        );

        Ok(Self {
            gossipsub,
            tss,
            opsync,
            identify,
            ping: ping::Behaviour::default(),
        })
    }
}

pub fn broadcast_topic() -> IdentTopic {
    IdentTopic::new(BROADCAST_TOPIC)
}
