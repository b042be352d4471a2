use crate::config::{ IdentityKeyType, NodeConfig };
use crate::error::{ Error, Result };
use libp2p::identity::{ self, Keypair };
use libp2p::PeerId;
use sha2::{ Digest, Sha256 };
use std::fs;
use tracing::{ info, warn };

const NODE_NAMES: &[&str] = &[
    "Quorum",
    "Beacon",
    "Ledger",
    "Cipher",
    "Relay",
    "Vertex",
    "Anchor",
    "Signet",
    "Harbor",
    "Keeper",
    "Vault",
    "Sentry",
    "Compass",
    "Lantern",
    "Bastion",
    "Meridian",
];

/// Long-lived node identity. One keypair serves three roles: the libp2p
/// peer id, the TSS party identity (by deterministic hashing of the peer
/// id) and the ECIES encryption identity.
#[derive(Clone)]
pub struct NodeIdentity {
    pub keypair: Keypair,
    pub peer_id: PeerId,
    pub name: String,
}

impl NodeIdentity {
    /// Load the identity key from disk or generate and persist a fresh one.
    /// The key file holds the raw libp2p protobuf encoding, mode 0600.
    pub fn load_or_generate(config: &NodeConfig) -> Result<Self> {
        let keypair = if config.identity_file.exists() {
            let bytes = fs::read(&config.identity_file)?;
            let keypair = Keypair::from_protobuf_encoding(&bytes).map_err(|err| {
                Error::invalid(format!("unreadable identity key file: {}", err))
            })?;
            let loaded = key_type_of(&keypair);
            if loaded != Some(config.key_type) {
                warn!(
                    "Identity file holds a {:?} key, configured type is {:?}; keeping the file",
                    loaded,
                    config.key_type
                );
            }
            keypair
        } else {
            info!("No pre-existing identity, generating a new node identity");
            let keypair = match config.key_type {
                IdentityKeyType::Secp256k1 => Keypair::generate_secp256k1(),
                IdentityKeyType::Ed25519 => Keypair::generate_ed25519(),
            };
            let bytes = keypair
                .to_protobuf_encoding()
                .map_err(|err| Error::invalid(format!("identity key encoding: {}", err)))?;
            fs::write(&config.identity_file, bytes)?;
            restrict_permissions(&config.identity_file)?;
            keypair
        };

        let peer_id = keypair.public().to_peer_id();
        let name = moniker_for(&peer_id);
        Ok(Self { keypair, peer_id, name })
    }

    pub fn announce(&self) {
        info!("-----------------------------------");
        info!("Hello, you can call me \x1b[34m\x1b[1m{}\x1b[0m", self.name);
        info!("Peer ID: \x1b[34m\x1b[1m{}\x1b[0m", self.peer_id);
        info!("-----------------------------------");
    }
}

fn key_type_of(keypair: &Keypair) -> Option<IdentityKeyType> {
    match keypair.key_type() {
        identity::KeyType::Secp256k1 => Some(IdentityKeyType::Secp256k1),
        identity::KeyType::Ed25519 => Some(IdentityKeyType::Ed25519),
        _ => None,
    }
}

/// Stable human-readable moniker derived from the peer id, so restarts and
/// log lines agree without persisting anything extra.
fn moniker_for(peer_id: &PeerId) -> String {
    let digest = Sha256::digest(peer_id.to_bytes().as_slice());
    let index = (digest[0] as usize) % NODE_NAMES.len();
    let b58 = peer_id.to_base58();
    let tail = &b58[b58.len().saturating_sub(4)..];
    format!("{}-{}", NODE_NAMES[index], tail)
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> Result<()> {
    Ok(())
}
