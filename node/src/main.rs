use anyhow::{ Context, Result };
use dknet_node::config::{ NodeConfig, ValidationHookConfig };
use dknet_node::logging::DkNetLogInitializer;
use dknet_node::Node;
use libp2p::PeerId;
use std::collections::{ HashMap, HashSet };
use std::env;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = config_from_env()?;
    config.create_data_dirs().context("Failed to create application data directories")?;
    DkNetLogInitializer::init(&config.data_dir);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let node = Node::start(config).await.context("Node failed to start")?;

    tokio::signal::ctrl_c().await.context("Waiting for shutdown signal")?;
    info!("Shutdown signal received");
    node.shutdown().await;
    Ok(())
}

fn config_from_env() -> Result<NodeConfig> {
    let data_dir = env::var("DKNET_DATA_DIR").unwrap_or_else(|_| "./dknet-data".to_string());
    let mut config = NodeConfig::new(data_dir);

    if let Ok(listen) = env::var("DKNET_LISTEN_ADDRS") {
        config.listen_addrs = parse_multiaddrs(&listen)?;
    }
    if let Ok(bootstrap) = env::var("DKNET_BOOTSTRAP_ADDRS") {
        config.bootstrap_addrs = parse_multiaddrs(&bootstrap)?;
    }
    if let Ok(allowed) = env::var("DKNET_ALLOWED_PEERS") {
        let mut peers = HashSet::new();
        for entry in allowed.split(',').filter(|entry| !entry.trim().is_empty()) {
            let peer: PeerId = entry
                .trim()
                .parse()
                .with_context(|| format!("Invalid peer id in DKNET_ALLOWED_PEERS: {}", entry))?;
            peers.insert(peer);
        }
        config.allowed_peers = Some(peers);
    }
    if let Ok(url) = env::var("DKNET_VALIDATION_URL") {
        let timeout_seconds = env
            ::var("DKNET_VALIDATION_TIMEOUT_SECONDS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(5);
        let insecure_skip_verify = env
            ::var("DKNET_VALIDATION_INSECURE_SKIP_VERIFY")
            .map(|raw| raw == "1" || raw.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        config.validation = Some(ValidationHookConfig {
            url,
            timeout_seconds,
            headers: HashMap::new(),
            insecure_skip_verify,
        });
    }

    Ok(config)
}

fn parse_multiaddrs(raw: &str) -> Result<Vec<libp2p::Multiaddr>> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            entry
                .trim()
                .parse()
                .with_context(|| format!("Invalid multiaddr: {}", entry))
        })
        .collect()
}
