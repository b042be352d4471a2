use crate::config::NodeConfig;
use crate::driver::{ run_operation, DriverContext };
use crate::error::{ Error, Result };
use crate::identity::NodeIdentity;
use crate::protocol::ecdsa::EcdsaPartyFactory;
use crate::protocol::PartyFactory;
use crate::registry::{ CreateOutcome, OperationRegistry };
use crate::router::Router;
use crate::storage::{ EncryptedKv, FileKv, KeyStore, KvStore };
use crate::sync;
use crate::transport::{ start_transport, TransportConfig, TransportEvent, TransportHandle };
use crate::validation::ValidationClient;
use libp2p::{ Multiaddr, PeerId };
use shared::key_info::KeyMetadata;
use shared::operation::{
    decode_message_hex,
    KeygenRequest,
    OperationData,
    OperationRequest,
    ResharingRequest,
    SigningRequest,
    StartOperationResponse,
};
use shared::sync::{ OperationSyncData, SyncAck };
use std::collections::HashSet;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;
use tokio::sync::{ mpsc, watch };
use tracing::{ info, warn };

/// A running DKNet node: encrypted storage, the libp2p host, and the
/// coordinator core wired together.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Thin handle external surfaces (HTTP/gRPC bindings, tests) talk to.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    identity: NodeIdentity,
    local_peer: String,
    storage: Arc<EncryptedKv>,
    keys: KeyStore,
    registry: OperationRegistry,
    router: Arc<Router>,
    transport: TransportHandle,
    factory: Arc<dyn PartyFactory>,
    validator: Option<Arc<ValidationClient>>,
    accepting: AtomicBool,
}

impl Node {
    /// Start with the production ECDSA factory and the password from the
    /// environment.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        let password = crate::config::encryption_password()?;
        Self::start_with(config, &password, Arc::new(EcdsaPartyFactory)).await
    }

    /// Full-control start used by tests and embedders.
    pub async fn start_with(
        config: NodeConfig,
        password: &str,
        factory: Arc<dyn PartyFactory>
    ) -> Result<Self> {
        config.create_data_dirs()?;
        let identity = NodeIdentity::load_or_generate(&config)?;
        identity.announce();

        let raw: Arc<dyn KvStore> = Arc::new(FileKv::open(config.store_dir())?);
        let storage = Arc::new(EncryptedKv::open(raw, password)?);
        // A wrong password must stop the node before it accepts any work.
        storage.probe()?;

        let keys = KeyStore::new(storage.clone());
        let registry = OperationRegistry::new(storage.clone());
        registry.recover_on_startup()?;

        let router = Arc::new(Router::new(config.router_grace));
        let validator = config.validation
            .as_ref()
            .map(ValidationClient::new)
            .transpose()?
            .map(Arc::new);

        let (transport, events) = start_transport(TransportConfig {
            identity: identity.keypair.clone(),
            listen_addrs: config.listen_addrs.clone(),
            bootstrap_addrs: config.bootstrap_addrs.clone(),
            allowed_peers: config.allowed_peers.clone(),
            send_timeout: config.send_timeout,
            send_retries: config.send_retries,
            memory_transport: config.memory_transport,
        }).await?;

        let local_peer = identity.peer_id.to_base58();
        let inner = Arc::new(NodeInner {
            config,
            identity,
            local_peer,
            storage,
            keys,
            registry,
            router,
            transport,
            factory,
            validator,
            accepting: AtomicBool::new(true),
        });
        tokio::spawn(event_pump(inner.clone(), events));

        info!("Node {} is ready", inner.identity.name);
        Ok(Self { inner })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle { inner: self.inner.clone() }
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.identity.peer_id
    }

    /// Stop accepting work, ask live drivers to cancel, stop the host.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.registry.cancel_all();
        self.inner.transport.shutdown().await;
        if let Err(err) = self.inner.storage.close() {
            warn!("Closing storage failed: {}", err);
        }
    }
}

async fn event_pump(inner: Arc<NodeInner>, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Protocol { from: _, envelope } => {
                inner.router.route(envelope);
            }
            TransportEvent::Sync { from, data, reply } => {
                let ack = inner.handle_sync(from, data);
                let _ = reply.send(ack);
            }
        }
    }
}

impl NodeInner {
    /// Participant side of operation sync: validate, idempotently create,
    /// spawn the matching driver. Duplicate announcements are no-ops.
    fn handle_sync(&self, from: PeerId, data: OperationSyncData) -> SyncAck {
        if !self.accepting.load(Ordering::SeqCst) {
            return SyncAck::reject("node is shutting down");
        }
        info!("Received sync for operation {} from {}", data.operation_id, from);
        if let Err(err) = sync::validate_sync(&data, &self.local_peer, &self.keys) {
            warn!("Rejecting sync for operation {}: {}", data.operation_id, err);
            return SyncAck::reject(err.to_string());
        }
        match self.registry.create(Some(data.operation_id.clone()), data.request.clone()) {
            Ok(CreateOutcome::Created(operation, cancel)) => {
                self.spawn_driver(operation, cancel);
                SyncAck::accept()
            }
            Ok(CreateOutcome::Existing(operation)) => {
                if operation.session_id == data.session_id {
                    SyncAck::accept()
                } else {
                    SyncAck::reject("operation id exists with a different session")
                }
            }
            Err(err) => SyncAck::reject(err.to_string()),
        }
    }

    fn spawn_driver(&self, operation: OperationData, cancel: watch::Receiver<bool>) {
        let ctx = DriverContext {
            deadline: self.config.deadlines.for_type(operation.op_type),
            queue_size: self.config.inbound_queue_size,
            local_peer: self.local_peer.clone(),
            registry: self.registry.clone(),
            router: self.router.clone(),
            transport: self.transport.clone(),
            keys: self.keys.clone(),
            factory: self.factory.clone(),
            validator: self.validator.clone(),
            operation,
        };
        tokio::spawn(run_operation(ctx, cancel));
    }
}

impl NodeHandle {
    pub fn local_peer_id(&self) -> String {
        self.inner.local_peer.clone()
    }

    pub fn moniker(&self) -> String {
        self.inner.identity.name.clone()
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.inner.transport.listen_addrs().await
    }

    pub async fn dial(&self, addr: Multiaddr) -> Result<()> {
        self.inner.transport.dial(addr).await
    }

    pub async fn start_keygen(
        &self,
        operation_id: Option<String>,
        request: KeygenRequest
    ) -> Result<StartOperationResponse> {
        validate_keygen(&request, &self.inner.local_peer)?;
        self.start_operation(operation_id, OperationRequest::Keygen(request)).await
    }

    pub async fn start_signing(
        &self,
        operation_id: Option<String>,
        request: SigningRequest
    ) -> Result<StartOperationResponse> {
        validate_signing(&request, &self.inner.local_peer, &self.inner.keys)?;
        self.start_operation(operation_id, OperationRequest::Signing(request)).await
    }

    pub async fn start_resharing(
        &self,
        operation_id: Option<String>,
        request: ResharingRequest
    ) -> Result<StartOperationResponse> {
        validate_resharing(&request, &self.inner.local_peer, &self.inner.keys)?;
        self.start_operation(operation_id, OperationRequest::Resharing(request)).await
    }

    pub fn get_operation(&self, operation_id: &str) -> Result<OperationData> {
        self.inner.registry.get(operation_id)
    }

    pub fn list_operations(&self) -> Vec<String> {
        self.inner.registry.list_active()
    }

    pub fn cancel_operation(&self, operation_id: &str) -> Result<()> {
        self.inner.registry.cancel(operation_id)
    }

    pub fn get_key_metadata(&self, key_id: &str) -> Result<KeyMetadata> {
        self.inner.keys.metadata(key_id)
    }

    pub fn list_keys(&self) -> Result<Vec<String>> {
        self.inner.keys.list()
    }

    async fn start_operation(
        &self,
        operation_id: Option<String>,
        request: OperationRequest
    ) -> Result<StartOperationResponse> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::invalid("node is shutting down"));
        }
        match self.inner.registry.create(operation_id, request)? {
            CreateOutcome::Created(operation, cancel) => {
                self.inner.spawn_driver(operation.clone(), cancel);

                // Announce to the other participants in the background; the
                // caller gets the pending operation immediately.
                let transport = self.inner.transport.clone();
                let local_peer = self.inner.local_peer.clone();
                let announced = operation.clone();
                let attempts = self.inner.config.sync_retries;
                tokio::spawn(async move {
                    sync::announce_operation(&transport, &local_peer, &announced, attempts).await;
                });

                Ok(StartOperationResponse {
                    operation_id: operation.id,
                    status: operation.status,
                    created_at: operation.created_at,
                })
            }
            CreateOutcome::Existing(operation) => {
                Ok(StartOperationResponse {
                    operation_id: operation.id,
                    status: operation.status,
                    created_at: operation.created_at,
                })
            }
        }
    }
}

fn validate_participant_list(participants: &[String], local_peer: &str) -> Result<()> {
    if participants.is_empty() {
        return Err(Error::invalid("participants must not be empty"));
    }
    let mut unique = HashSet::new();
    for participant in participants {
        participant
            .parse::<PeerId>()
            .map_err(|_| Error::invalid(format!("{} is not a valid peer id", participant)))?;
        if !unique.insert(participant.as_str()) {
            return Err(Error::invalid(format!("duplicate participant {}", participant)));
        }
    }
    if !participants.iter().any(|participant| participant == local_peer) {
        return Err(Error::invalid("local node must be one of the participants"));
    }
    Ok(())
}

fn validate_keygen(request: &KeygenRequest, local_peer: &str) -> Result<()> {
    validate_participant_list(&request.participants, local_peer)?;
    let parties = request.participants.len() as u16;
    if request.threshold == 0 || request.threshold >= parties {
        return Err(
            Error::invalid(
                format!("threshold {} must be within 1..{} for {} parties", request.threshold, parties, parties)
            )
        );
    }
    Ok(())
}

fn validate_signing(request: &SigningRequest, local_peer: &str, keys: &KeyStore) -> Result<()> {
    validate_participant_list(&request.participants, local_peer)?;
    decode_message_hex(&request.message).map_err(|err| {
        Error::invalid(format!("message is not valid hex: {}", err))
    })?;

    let bundle = keys.get(&request.key_id)?;
    for participant in &request.participants {
        if !bundle.participants.contains(participant) {
            return Err(
                Error::invalid(
                    format!("{} did not take part in keygen for key {}", participant, request.key_id)
                )
            );
        }
    }
    let required = (bundle.threshold as usize) + 1;
    if request.participants.len() < required {
        return Err(
            Error::invalid(
                format!(
                    "key {} requires at least {} signers, got {}",
                    request.key_id,
                    required,
                    request.participants.len()
                )
            )
        );
    }
    Ok(())
}

fn validate_resharing(request: &ResharingRequest, local_peer: &str, keys: &KeyStore) -> Result<()> {
    validate_participant_list(&request.new_participants, local_peer)?;
    let parties = request.new_participants.len() as u16;
    if request.new_threshold == 0 || request.new_threshold >= parties {
        return Err(
            Error::invalid(
                format!(
                    "new threshold {} must be within 1..{} for {} parties",
                    request.new_threshold,
                    parties,
                    parties
                )
            )
        );
    }
    // The initiator must hold the share being replaced.
    keys.get(&request.key_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;
    use libp2p::identity::Keypair;

    fn peer() -> String {
        Keypair::generate_secp256k1().public().to_peer_id().to_base58()
    }

    fn keys() -> KeyStore {
        let inner: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        KeyStore::new(Arc::new(EncryptedKv::open(inner, "pw").unwrap()))
    }

    #[test]
    fn keygen_validation_checks_threshold_and_membership() {
        let me = peer();
        let others = [peer(), peer()];
        let request = KeygenRequest {
            threshold: 1,
            participants: vec![me.clone(), others[0].clone(), others[1].clone()],
            moniker: None,
        };
        assert!(validate_keygen(&request, &me).is_ok());

        let too_high = KeygenRequest { threshold: 3, ..request.clone() };
        assert!(matches!(validate_keygen(&too_high, &me), Err(Error::InvalidArgument(_))));

        assert!(matches!(validate_keygen(&request, &peer()), Err(Error::InvalidArgument(_))));

        let garbled = KeygenRequest {
            threshold: 1,
            participants: vec![me.clone(), "not-a-peer-id!".into(), others[1].clone()],
            moniker: None,
        };
        assert!(matches!(validate_keygen(&garbled, &me), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn signing_validation_requires_a_known_key() {
        let me = peer();
        let request = SigningRequest {
            key_id: "missing".into(),
            message: "0xdead".into(),
            participants: vec![me.clone()],
        };
        assert!(matches!(validate_signing(&request, &me, &keys()), Err(Error::UnknownKey(_))));
    }
}
