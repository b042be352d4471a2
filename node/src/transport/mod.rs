pub mod behaviour;
pub mod ecies;
pub mod event_loop;

use crate::error::{ Error, Result };
use libp2p::identity::Keypair;
use libp2p::{ Multiaddr, PeerId };
use shared::envelope::ProtocolEnvelope;
use shared::sync::{ OperationSyncData, SyncAck };
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{ mpsc, oneshot };
use tracing::warn;

pub use behaviour::{ broadcast_topic, TssRequest };

#[derive(Clone)]
pub struct TransportConfig {
    pub identity: Keypair,
    pub listen_addrs: Vec<Multiaddr>,
    pub bootstrap_addrs: Vec<Multiaddr>,
    /// `None` admits every peer; `Some` drops frames from unlisted peers.
    pub allowed_peers: Option<HashSet<PeerId>>,
    pub send_timeout: Duration,
    pub send_retries: u32,
    /// In-process memory transport instead of TCP, for tests.
    pub memory_transport: bool,
}

/// Frames the swarm hands up to the node, tagged with the sender.
#[derive(Debug)]
pub enum TransportEvent {
    Protocol {
        from: PeerId,
        envelope: ProtocolEnvelope,
    },
    Sync {
        from: PeerId,
        data: OperationSyncData,
        reply: oneshot::Sender<SyncAck>,
    },
}

#[derive(Debug)]
pub enum Command {
    SendProtocol {
        peer: PeerId,
        envelope: ProtocolEnvelope,
        reply: oneshot::Sender<Result<()>>,
    },
    Broadcast {
        envelope: ProtocolEnvelope,
        reply: oneshot::Sender<Result<()>>,
    },
    SendSync {
        peer: PeerId,
        data: OperationSyncData,
        reply: oneshot::Sender<Result<SyncAck>>,
    },
    Dial {
        addr: Multiaddr,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Shutdown,
}

/// Cloneable handle to the swarm task. Transient send failures are retried
/// here with backoff; whatever still fails after that is reported as
/// peer-unreachable and left to the operation deadline.
#[derive(Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::Sender<Command>,
    local_peer_id: PeerId,
    send_timeout: Duration,
    send_retries: u32,
}

impl TransportHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub async fn send_protocol(&self, peer: PeerId, envelope: ProtocolEnvelope) -> Result<()> {
        let retries = self.send_retries;
        let mut backoff = Duration::from_millis(250);
        let mut last_err = None;
        for attempt in 0..=retries {
            let (reply_tx, reply_rx) = oneshot::channel();
            self
                .send_command(Command::SendProtocol {
                    peer,
                    envelope: envelope.clone(),
                    reply: reply_tx,
                }).await?;
            match tokio::time::timeout(self.send_timeout, reply_rx).await {
                Ok(Ok(Ok(()))) => {
                    return Ok(());
                }
                Ok(Ok(Err(err))) if err.is_permanent() => {
                    return Err(err);
                }
                Ok(Ok(Err(err))) => {
                    last_err = Some(err);
                }
                Ok(Err(_)) => {
                    return Err(Error::Transport("transport task stopped".to_string()));
                }
                Err(_) => {
                    last_err = Some(Error::Timeout(format!("send to {} timed out", peer)));
                }
            }
            if attempt < retries {
                warn!("Send to {} failed, retrying in {:?}", peer, backoff);
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(
            Error::PeerUnreachable(
                format!(
                    "{} after {} attempts: {}",
                    peer,
                    retries + 1,
                    last_err.map(|err| err.to_string()).unwrap_or_else(|| "unknown".to_string())
                )
            )
        )
    }

    /// Publish to the gossip topic. Retried briefly: right after startup a
    /// publish can race the gossip mesh formation.
    pub async fn broadcast(&self, envelope: ProtocolEnvelope) -> Result<()> {
        let mut backoff = Duration::from_millis(250);
        let mut last_err = None;
        for attempt in 0..=self.send_retries {
            let (reply_tx, reply_rx) = oneshot::channel();
            self
                .send_command(Command::Broadcast {
                    envelope: envelope.clone(),
                    reply: reply_tx,
                }).await?;
            match reply_rx.await {
                Ok(Ok(())) => {
                    return Ok(());
                }
                Ok(Err(err)) if err.is_permanent() => {
                    return Err(err);
                }
                Ok(Err(err)) => {
                    last_err = Some(err);
                }
                Err(_) => {
                    return Err(Error::Transport("transport task stopped".to_string()));
                }
            }
            if attempt < self.send_retries {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Transport("broadcast failed".to_string())))
    }

    pub async fn send_sync(&self, peer: PeerId, data: OperationSyncData) -> Result<SyncAck> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::SendSync { peer, data, reply: reply_tx }).await?;
        match tokio::time::timeout(self.send_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport("transport task stopped".to_string())),
            Err(_) => Err(Error::Timeout(format!("sync to {} timed out", peer))),
        }
    }

    pub async fn dial(&self, addr: Multiaddr) -> Result<()> {
        self.send_command(Command::Dial { addr }).await
    }

    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::ListenAddrs { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| Error::Transport("transport task stopped".to_string()))
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        self.cmd_tx
            .send(command).await
            .map_err(|_| Error::Transport("transport task stopped".to_string()))
    }
}

/// Start the libp2p host: build the swarm, start listening, dial bootstrap
/// peers, and spawn the event loop.
pub async fn start_transport(
    config: TransportConfig
) -> Result<(TransportHandle, mpsc::Receiver<TransportEvent>)> {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(1024);

    let handle = TransportHandle {
        cmd_tx: cmd_tx.clone(),
        local_peer_id: config.identity.public().to_peer_id(),
        send_timeout: config.send_timeout,
        send_retries: config.send_retries,
    };

    let event_loop = event_loop::EventLoop::new(config, cmd_rx, event_tx)?;
    tokio::spawn(event_loop.run());

    Ok((handle, event_rx))
}
