use crate::error::{ Error, Result };
use crate::transport::behaviour::{ broadcast_topic, Behaviour, BehaviourEvent, TssAck, TssRequest };
use crate::transport::ecies::{ cipher_for_identity, PeerCipher };
use crate::transport::{ Command, TransportConfig, TransportEvent };
use futures::future::BoxFuture;
use futures::stream::{ FuturesUnordered, StreamExt };
use libp2p::core::transport::MemoryTransport;
use libp2p::core::upgrade;
use libp2p::identity::PublicKey;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{ self, OutboundRequestId, ResponseChannel };
use libp2p::swarm::{ Config as SwarmConfig, SwarmEvent };
use libp2p::{
    gossipsub,
    identify,
    noise,
    ping,
    tcp,
    yamux,
    Multiaddr,
    PeerId,
    Swarm,
    SwarmBuilder,
};
use libp2p::Transport as _;
use shared::envelope::ProtocolEnvelope;
use shared::sync::SyncAck;
use std::collections::{ HashMap, HashSet };
use std::time::{ Duration, Instant };
use tokio::sync::{ mpsc, oneshot };
use tracing::{ debug, info, warn };

const ACCESS_VIOLATION_LIMIT: u32 = 3;
const BOOTSTRAP_TICK: Duration = Duration::from_secs(5);
const BOOTSTRAP_BACKOFF_MAX: Duration = Duration::from_secs(60);

pub struct EventLoop {
    swarm: Swarm<Behaviour>,
    cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<TransportEvent>,
    cipher: Box<dyn PeerCipher>,
    local_key_protobuf: Vec<u8>,
    /// Identity keys learned from identify and inbound frames; required for
    /// outbound ECIES.
    peer_keys: HashMap<PeerId, PublicKey>,
    pending_tss: HashMap<OutboundRequestId, oneshot::Sender<Result<()>>>,
    pending_sync: HashMap<OutboundRequestId, oneshot::Sender<Result<SyncAck>>>,
    sync_replies: FuturesUnordered<BoxFuture<'static, (ResponseChannel<SyncAck>, SyncAck)>>,
    allowed_peers: Option<HashSet<PeerId>>,
    violations: HashMap<PeerId, u32>,
    bootstrap: Vec<Multiaddr>,
    bootstrap_backoff: HashMap<Multiaddr, (Duration, Instant)>,
}

impl EventLoop {
    pub fn new(
        config: TransportConfig,
        cmd_rx: mpsc::Receiver<Command>,
        event_tx: mpsc::Sender<TransportEvent>
    ) -> Result<Self> {
        let cipher = cipher_for_identity(&config.identity)?;
        let local_key_protobuf = config.identity.public().encode_protobuf();
        let mut swarm = create_swarm(&config)?;

        for addr in &config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|err| Error::Transport(format!("listen on {}: {}", addr, err)))?;
        }
        for addr in &config.bootstrap_addrs {
            if let Err(err) = swarm.dial(addr.clone()) {
                warn!("Initial dial of bootstrap {} failed: {}", addr, err);
            }
        }

        Ok(Self {
            swarm,
            cmd_rx,
            event_tx,
            cipher,
            local_key_protobuf,
            peer_keys: HashMap::new(),
            pending_tss: HashMap::new(),
            pending_sync: HashMap::new(),
            sync_replies: FuturesUnordered::new(),
            allowed_peers: config.allowed_peers,
            violations: HashMap::new(),
            bootstrap: config.bootstrap_addrs,
            bootstrap_backoff: HashMap::new(),
        })
    }

    pub async fn run(mut self) {
        let mut bootstrap_tick = tokio::time::interval(BOOTSTRAP_TICK);
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event).await;
                }
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            info!("Transport shutting down");
                            break;
                        }
                        Some(command) => self.handle_command(command),
                    }
                }
                Some((channel, ack)) = self.sync_replies.next(), if !self.sync_replies.is_empty() => {
                    let _ = self.swarm.behaviour_mut().opsync.send_response(channel, ack);
                }
                _ = bootstrap_tick.tick() => {
                    self.redial_bootstrap();
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendProtocol { peer, envelope, reply } => {
                let result = self.start_protocol_send(peer, &envelope);
                match result {
                    Ok(request_id) => {
                        self.pending_tss.insert(request_id, reply);
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            Command::Broadcast { envelope, reply } => {
                let result = serde_json
                    ::to_vec(&envelope)
                    .map_err(Error::from)
                    .and_then(|data| {
                        self.swarm
                            .behaviour_mut()
                            .gossipsub.publish(broadcast_topic(), data)
                            .map(|_| ())
                            .map_err(|err| Error::Transport(format!("gossip publish: {}", err)))
                    });
                let _ = reply.send(result);
            }
            Command::SendSync { peer, data, reply } => {
                let request_id = self.swarm.behaviour_mut().opsync.send_request(&peer, data);
                self.pending_sync.insert(request_id, reply);
            }
            Command::Dial { addr } => {
                if let Err(err) = self.swarm.dial(addr.clone()) {
                    warn!("Dial of {} failed: {}", addr, err);
                }
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
            Command::Shutdown => {}
        }
    }

    fn start_protocol_send(
        &mut self,
        peer: PeerId,
        envelope: &ProtocolEnvelope
    ) -> Result<OutboundRequestId> {
        let peer_key = self.peer_keys
            .get(&peer)
            .cloned()
            .ok_or_else(|| {
                Error::Transport(format!("identity key for {} not learned yet", peer))
            })?;
        let plaintext = serde_json::to_vec(envelope)?;
        let sealed = self.cipher.encrypt_for(&peer_key, &plaintext)?;
        let request = TssRequest {
            sender_key: self.local_key_protobuf.clone(),
            envelope: sealed,
        };
        Ok(self.swarm.behaviour_mut().tss.send_request(&peer, request))
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event).await,
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("Connected to {}", peer_id);
                self.bootstrap_backoff.retain(|addr, _| peer_id_from_addr(addr) != Some(peer_id));
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("Connection to {} closed: {:?}", peer_id, cause);
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                debug!("Outgoing connection error (peer {:?}): {}", peer_id, error);
            }
            _ => {}
        }
    }

    async fn handle_behaviour_event(&mut self, event: BehaviourEvent) {
        match event {
            BehaviourEvent::Tss(request_response::Event::Message { peer, message, .. }) => {
                match message {
                    request_response::Message::Request { request, channel, .. } => {
                        let ok = self.accept_protocol_frame(peer, request).await;
                        let _ = self.swarm
                            .behaviour_mut()
                            .tss.send_response(channel, TssAck { ok });
                    }
                    request_response::Message::Response { request_id, response } => {
                        if let Some(reply) = self.pending_tss.remove(&request_id) {
                            let result = if response.ok {
                                Ok(())
                            } else {
                                Err(Error::Transport("peer refused the frame".to_string()))
                            };
                            let _ = reply.send(result);
                        }
                    }
                }
            }
            BehaviourEvent::Tss(request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            }) => {
                if let Some(reply) = self.pending_tss.remove(&request_id) {
                    let _ = reply.send(
                        Err(Error::Transport(format!("send to {} failed: {}", peer, error)))
                    );
                }
            }
            BehaviourEvent::Opsync(request_response::Event::Message { peer, message, .. }) => {
                match message {
                    request_response::Message::Request { request, channel, .. } => {
                        if !self.peer_allowed(peer) {
                            let _ = self.swarm
                                .behaviour_mut()
                                .opsync.send_response(channel, SyncAck::reject("access denied"));
                            return;
                        }
                        let (ack_tx, ack_rx) = oneshot::channel();
                        self.sync_replies.push(
                            Box::pin(async move {
                                let ack = ack_rx.await.unwrap_or_else(|_| {
                                    SyncAck::reject("sync handler dropped")
                                });
                                (channel, ack)
                            })
                        );
                        let _ = self.event_tx.send(TransportEvent::Sync {
                            from: peer,
                            data: request,
                            reply: ack_tx,
                        }).await;
                    }
                    request_response::Message::Response { request_id, response } => {
                        if let Some(reply) = self.pending_sync.remove(&request_id) {
                            let _ = reply.send(Ok(response));
                        }
                    }
                }
            }
            BehaviourEvent::Opsync(request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            }) => {
                if let Some(reply) = self.pending_sync.remove(&request_id) {
                    let _ = reply.send(
                        Err(Error::Transport(format!("sync to {} failed: {}", peer, error)))
                    );
                }
            }
            BehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. }) => {
                let Some(source) = message.source else {
                    debug!("Dropping unsigned gossip message");
                    return;
                };
                if !self.peer_allowed(source) {
                    self.record_violation(source);
                    return;
                }
                match serde_json::from_slice::<ProtocolEnvelope>(&message.data) {
                    Ok(envelope) => {
                        let _ = self.event_tx.send(TransportEvent::Protocol {
                            from: source,
                            envelope,
                        }).await;
                    }
                    Err(err) => {
                        debug!("Unparseable gossip payload from {}: {}", source, err);
                    }
                }
            }
            BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                self.peer_keys.insert(peer_id, info.public_key);
            }
            BehaviourEvent::Ping(ping::Event { peer, result, .. }) => {
                if let Err(err) = result {
                    debug!("Ping to {} failed: {}", peer, err);
                }
            }
            _ => {}
        }
    }

    /// Validate, decrypt and forward one inbound point-to-point frame.
    async fn accept_protocol_frame(&mut self, peer: PeerId, request: TssRequest) -> bool {
        if !self.peer_allowed(peer) {
            self.record_violation(peer);
            return false;
        }
        let sender_key = match PublicKey::try_decode_protobuf(&request.sender_key) {
            Ok(key) => key,
            Err(err) => {
                warn!("Undecodable sender key from {}: {}", peer, err);
                return false;
            }
        };
        if sender_key.to_peer_id() != peer {
            warn!("Sender key from {} does not match the connection peer", peer);
            self.record_violation(peer);
            return false;
        }
        self.peer_keys.insert(peer, sender_key.clone());

        let plaintext = match self.cipher.decrypt_from(&sender_key, &request.envelope) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!("Failed to decrypt frame from {}: {}", peer, err);
                return false;
            }
        };
        match serde_json::from_slice::<ProtocolEnvelope>(&plaintext) {
            Ok(envelope) => {
                let _ = self.event_tx.send(TransportEvent::Protocol { from: peer, envelope }).await;
                true
            }
            Err(err) => {
                warn!("Unparseable frame from {}: {}", peer, err);
                false
            }
        }
    }

    fn peer_allowed(&self, peer: PeerId) -> bool {
        match &self.allowed_peers {
            Some(allowed) => allowed.contains(&peer),
            None => true,
        }
    }

    fn record_violation(&mut self, peer: PeerId) {
        let count = self.violations.entry(peer).or_insert(0);
        *count += 1;
        warn!("Access violation {} from {}", count, peer);
        if *count >= ACCESS_VIOLATION_LIMIT {
            let _ = self.swarm.disconnect_peer_id(peer);
            self.violations.remove(&peer);
        }
    }

    /// Keep bootstrap peers dialed, with exponential backoff per address.
    fn redial_bootstrap(&mut self) {
        let now = Instant::now();
        for addr in self.bootstrap.clone() {
            if let Some(peer) = peer_id_from_addr(&addr) {
                if self.swarm.is_connected(&peer) {
                    continue;
                }
            } else if self.swarm.network_info().num_peers() > 0 {
                continue;
            }
            let entry = self.bootstrap_backoff
                .entry(addr.clone())
                .or_insert((Duration::from_secs(1), now));
            if entry.1 > now {
                continue;
            }
            let (backoff, _) = *entry;
            let next = (backoff * 2).min(BOOTSTRAP_BACKOFF_MAX);
            *entry = (next, now + backoff);
            debug!("Redialing bootstrap {}", addr);
            if let Err(err) = self.swarm.dial(addr.clone()) {
                debug!("Bootstrap dial {} failed: {}", addr, err);
            }
        }
    }
}

fn peer_id_from_addr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|protocol| {
        if let Protocol::P2p(peer_id) = protocol { Some(peer_id) } else { None }
    })
}

fn create_swarm(config: &TransportConfig) -> Result<Swarm<Behaviour>> {
    if config.memory_transport {
        let keypair = config.identity.clone();
        let noise_config = noise::Config
            ::new(&keypair)
            .map_err(|err| Error::Transport(format!("noise config: {}", err)))?;
        let transport = MemoryTransport::default()
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_config)
            .multiplex(yamux::Config::default())
            .boxed();
        let behaviour = Behaviour::new(&keypair).map_err(|err|
            Error::Transport(err.to_string())
        )?;
        let swarm_config = SwarmConfig::with_tokio_executor().with_idle_connection_timeout(
            Duration::from_secs(600)
        );
        Ok(Swarm::new(transport, behaviour, keypair.public().to_peer_id(), swarm_config))
    } else {
        SwarmBuilder::with_existing_identity(config.identity.clone())
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)
            .map_err(|err| Error::Transport(format!("tcp transport: {}", err)))?
            .with_behaviour(Behaviour::new)
            .map_err(|err| Error::Transport(format!("behaviour: {}", err)))
            .map(|builder| {
                builder
                    .with_swarm_config(|cfg| {
                        cfg.with_idle_connection_timeout(Duration::from_secs(600))
                    })
                    .build()
            })
    }
}
