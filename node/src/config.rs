use crate::error::{ Error, Result };
use libp2p::Multiaddr;
use shared::operation::OperationType;
use std::collections::{ HashMap, HashSet };
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const ENCRYPTION_PASSWORD_ENV: &str = "TSS_ENCRYPTION_PASSWORD";

/// Curve of the long-lived node identity key. Secp256k1 is the default
/// because it matches the TSS signing curve; Ed25519 identities are
/// supported but every peer in an operation must use the same curve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityKeyType {
    Secp256k1,
    Ed25519,
}

#[derive(Clone, Debug)]
pub struct ValidationHookConfig {
    pub url: String,
    pub timeout_seconds: u64,
    pub headers: HashMap<String, String>,
    pub insecure_skip_verify: bool,
}

/// Per-operation completion deadlines. A driver that has not reached a
/// terminal state when its deadline fires fails with a timeout.
#[derive(Clone, Copy, Debug)]
pub struct OperationDeadlines {
    pub keygen: Duration,
    pub signing: Duration,
    pub resharing: Duration,
}

impl Default for OperationDeadlines {
    fn default() -> Self {
        Self {
            keygen: Duration::from_secs(300),
            signing: Duration::from_secs(120),
            resharing: Duration::from_secs(600),
        }
    }
}

impl OperationDeadlines {
    pub fn for_type(&self, op_type: OperationType) -> Duration {
        match op_type {
            OperationType::Keygen => self.keygen,
            OperationType::Signing => self.signing,
            OperationType::Resharing => self.resharing,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub identity_file: PathBuf,
    pub key_type: IdentityKeyType,
    pub listen_addrs: Vec<Multiaddr>,
    pub bootstrap_addrs: Vec<Multiaddr>,
    /// `None` disables access control and admits every peer.
    pub allowed_peers: Option<HashSet<libp2p::PeerId>>,
    pub deadlines: OperationDeadlines,
    /// How long the router buffers frames for sessions it has not seen an
    /// operation for yet.
    pub router_grace: Duration,
    pub inbound_queue_size: usize,
    pub send_timeout: Duration,
    pub send_retries: u32,
    pub sync_retries: u32,
    pub validation: Option<ValidationHookConfig>,
    /// In-process memory transport instead of TCP; used by tests.
    pub memory_transport: bool,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let identity_file = data_dir.join("identity.key");
        Self {
            data_dir,
            identity_file,
            key_type: IdentityKeyType::Secp256k1,
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/0".parse().expect("valid multiaddr")],
            bootstrap_addrs: Vec::new(),
            allowed_peers: None,
            deadlines: OperationDeadlines::default(),
            router_grace: Duration::from_secs(30),
            inbound_queue_size: 1024,
            send_timeout: Duration::from_secs(10),
            send_retries: 3,
            sync_retries: 5,
            validation: None,
            memory_transport: false,
        }
    }

    pub fn create_data_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(self.data_dir.join("store"))?;
        Ok(())
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

/// The storage encryption password. Read from the environment; prompting on
/// a TTY belongs to the CLI surface, which lives outside the core.
pub fn encryption_password() -> Result<String> {
    let password = env
        ::var(ENCRYPTION_PASSWORD_ENV)
        .map_err(|_| {
            Error::invalid(format!("{} environment variable is not set", ENCRYPTION_PASSWORD_ENV))
        })?;
    if password.is_empty() {
        return Err(Error::invalid("encryption password must not be empty"));
    }
    Ok(password)
}
