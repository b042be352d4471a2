//! In-process cluster plumbing and a lightweight mock protocol, so the
//! coordinator path (registry, sync, router, driver, transport) can be
//! exercised end-to-end without paying for Paillier key generation in every
//! test run. The mock party plays the same rounds-and-broadcasts game as
//! the real machines and produces deterministic outcomes, so every node in
//! a session derives the same key id without coordination.

use crate::config::{ NodeConfig, OperationDeadlines };
use crate::error::{ Error, Result };
use crate::node::{ Node, NodeHandle };
use crate::protocol::{
    IncomingFrame,
    KeygenOutcome,
    OutgoingFrame,
    Party,
    PartyFactory,
    PartyMap,
    PartyOutcome,
};
use crate::storage::KeyStore;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use sha2::{ Digest, Sha256 };
use shared::operation::{
    sorted_participants,
    OperationData,
    OperationRequest,
    OperationStatus,
    SigningResult,
};
use std::collections::{ HashMap, HashSet };
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
enum MockOutcome {
    Key { seed: String },
    Signature { message: String },
}

/// A party that broadcasts one message per round and advances once every
/// other participant's message for the round arrived.
pub struct MockParty {
    parties: u16,
    total_rounds: u16,
    round: u16,
    sent: bool,
    received: HashMap<u16, HashSet<u16>>,
    queue: Vec<OutgoingFrame>,
    outcome_spec: MockOutcome,
    outcome: Option<Result<PartyOutcome>>,
    finished: bool,
}

impl MockParty {
    fn new(parties: u16, rounds: u16, outcome_spec: MockOutcome) -> Self {
        Self {
            parties,
            total_rounds: rounds.max(1),
            round: 1,
            sent: false,
            received: HashMap::new(),
            queue: Vec::new(),
            outcome_spec,
            outcome: None,
            finished: false,
        }
    }

    fn received_current_round(&self) -> usize {
        self.received
            .get(&self.round)
            .map(|senders| senders.len())
            .unwrap_or(0)
    }

    fn make_outcome(&self) -> PartyOutcome {
        match &self.outcome_spec {
            MockOutcome::Key { seed } => {
                let key_id = hex::encode(Sha256::digest(format!("mock-key|{}", seed).as_bytes()));
                let public_key_hex = hex::encode(
                    Sha256::digest(format!("mock-pub|{}", seed).as_bytes())
                );
                PartyOutcome::Key(KeygenOutcome {
                    key_id,
                    public_key_hex,
                    share_blob: format!("mock-share|{}", seed).into_bytes(),
                })
            }
            MockOutcome::Signature { message } => {
                let r_hex = hex::encode(Sha256::digest(format!("r|{}", message).as_bytes()));
                let s_hex = hex::encode(Sha256::digest(format!("s|{}", message).as_bytes()));
                PartyOutcome::Signature(SigningResult {
                    signature_hex: format!("{}{}00", r_hex, s_hex),
                    r_hex,
                    s_hex,
                    v: 0,
                })
            }
        }
    }
}

impl Party for MockParty {
    fn handle_incoming(&mut self, frame: IncomingFrame) -> Result<()> {
        self.received.entry(frame.round).or_default().insert(frame.from);
        Ok(())
    }

    fn wants_to_proceed(&self) -> bool {
        if self.finished {
            return false;
        }
        !self.sent || self.received_current_round() >= (self.parties as usize) - 1
    }

    fn proceed(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.sent {
            self.queue.push(OutgoingFrame {
                to: None,
                round: self.round,
                payload: self.round.to_be_bytes().to_vec(),
            });
            self.sent = true;
            return Ok(());
        }
        if self.received_current_round() >= (self.parties as usize) - 1 {
            self.round += 1;
            self.sent = false;
            if self.round > self.total_rounds {
                self.finished = true;
                self.outcome = Some(Ok(self.make_outcome()));
            }
        }
        Ok(())
    }

    fn drain_outgoing(&mut self) -> Result<Vec<OutgoingFrame>> {
        Ok(std::mem::take(&mut self.queue))
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn take_outcome(&mut self) -> Option<Result<PartyOutcome>> {
        self.outcome.take()
    }

    fn current_round(&self) -> u16 {
        self.round
    }
}

/// Factory producing mock parties with outcomes every session participant
/// derives identically.
pub struct MockPartyFactory {
    pub rounds: u16,
}

impl PartyFactory for MockPartyFactory {
    fn create(
        &self,
        operation: &OperationData,
        local_peer: &str,
        keys: &KeyStore
    ) -> Result<Box<dyn Party>> {
        let map = PartyMap::new(operation.request.session_participants());
        map
            .index_of(local_peer)
            .ok_or_else(|| Error::invalid("local peer is not a session participant"))?;

        let outcome = match &operation.request {
            OperationRequest::Keygen(req) => {
                let seed = format!(
                    "{}|{}",
                    sorted_participants(&req.participants).join(","),
                    req.threshold
                );
                MockOutcome::Key { seed }
            }
            OperationRequest::Resharing(req) => {
                let seed = format!(
                    "reshare|{}|{}|{}",
                    req.key_id,
                    sorted_participants(&req.new_participants).join(","),
                    req.new_threshold
                );
                MockOutcome::Key { seed }
            }
            OperationRequest::Signing(req) => {
                // mirror the real factory: the local share must exist
                keys.get(&req.key_id)?;
                MockOutcome::Signature {
                    message: format!("{}|{}", req.key_id, req.message),
                }
            }
        };
        Ok(Box::new(MockParty::new(map.len(), self.rounds, outcome)))
    }
}

pub fn mock_factory(rounds: u16) -> Arc<dyn PartyFactory> {
    Arc::new(MockPartyFactory { rounds })
}

pub const TEST_PASSWORD: &str = "test-cluster-password";

pub struct TestCluster {
    pub nodes: Vec<Node>,
    pub handles: Vec<NodeHandle>,
    pub peer_ids: Vec<String>,
}

impl TestCluster {
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

/// Spawn `size` nodes on the in-process memory transport, each later node
/// bootstrapped to every earlier one so the mesh is complete.
pub async fn spawn_cluster(base: &Path, size: usize) -> Result<TestCluster> {
    spawn_cluster_with(base, size, |_| mock_factory(2), |_, _| {}).await
}

pub async fn spawn_cluster_with(
    base: &Path,
    size: usize,
    factory: impl Fn(usize) -> Arc<dyn PartyFactory>,
    configure: impl Fn(usize, &mut NodeConfig)
) -> Result<TestCluster> {
    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    let mut peer_ids = Vec::new();
    let mut addrs: Vec<Multiaddr> = Vec::new();

    for index in 0..size {
        let mut config = NodeConfig::new(base.join(format!("node{}", index)));
        config.memory_transport = true;
        config.listen_addrs = vec!["/memory/0".parse().expect("valid multiaddr")];
        config.bootstrap_addrs = addrs.clone();
        config.deadlines = OperationDeadlines {
            keygen: Duration::from_secs(20),
            signing: Duration::from_secs(20),
            resharing: Duration::from_secs(20),
        };
        configure(index, &mut config);

        let node = Node::start_with(config, TEST_PASSWORD, factory(index)).await?;
        let handle = node.handle();
        let listen = wait_for_listen_addr(&handle).await?;
        addrs.push(listen.with(Protocol::P2p(node.peer_id())));
        peer_ids.push(handle.local_peer_id());
        handles.push(handle);
        nodes.push(node);
    }

    // let identify and the gossip mesh settle
    tokio::time::sleep(Duration::from_millis(1500)).await;

    Ok(TestCluster { nodes, handles, peer_ids })
}

async fn wait_for_listen_addr(handle: &NodeHandle) -> Result<Multiaddr> {
    for _ in 0..100 {
        if let Some(addr) = handle.listen_addrs().await?.into_iter().next() {
            return Ok(addr);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Err(Error::Transport("node never started listening".to_string()))
}

/// Poll until the operation reaches the wanted status. Reaching a different
/// terminal status is an immediate failure, so tests report what actually
/// happened instead of timing out.
pub async fn wait_for_status(
    handle: &NodeHandle,
    operation_id: &str,
    wanted: OperationStatus,
    timeout: Duration
) -> Result<OperationData> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match handle.get_operation(operation_id) {
            Ok(data) => {
                if data.status == wanted {
                    return Ok(data);
                }
                if data.status.is_terminal() {
                    return Err(
                        Error::Protocol(
                            format!(
                                "operation {} ended {} ({})",
                                operation_id,
                                data.status,
                                data.error.unwrap_or_default()
                            )
                        )
                    );
                }
            }
            Err(Error::NotFound(_)) => {}
            Err(err) => {
                return Err(err);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!("waiting for {} to become {}", operation_id, wanted)));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
