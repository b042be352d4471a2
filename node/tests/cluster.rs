//! End-to-end scenarios on in-process clusters: memory transport, real
//! swarms, real sync/routing/drivers, mock parties for the round math.

use dknet_node::api;
use dknet_node::config::ValidationHookConfig;
use dknet_node::error::Error;
use dknet_node::test_utils::{
    mock_factory,
    spawn_cluster,
    spawn_cluster_with,
    wait_for_status,
    TEST_PASSWORD,
};
use dknet_node::Node;
use shared::operation::{
    KeygenRequest,
    OperationResult,
    OperationStatus,
    ResharingRequest,
    SigningRequest,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{ AsyncReadExt, AsyncWriteExt };

const WAIT: Duration = Duration::from_secs(15);

fn keygen_request(peers: &[String], threshold: u16) -> KeygenRequest {
    KeygenRequest {
        threshold,
        participants: peers.to_vec(),
        moniker: Some("treasury".to_string()),
    }
}

#[tokio::test]
async fn two_of_three_keygen_completes_on_every_node() {
    let base = tempfile::tempdir().unwrap();
    let cluster = spawn_cluster(base.path(), 3).await.unwrap();

    let response = cluster.handles[0]
        .start_keygen(Some("k1".into()), keygen_request(&cluster.peer_ids, 1)).await
        .unwrap();
    assert_eq!(response.operation_id, "k1");

    let mut key_id = None;
    for handle in &cluster.handles {
        let data = wait_for_status(handle, "k1", OperationStatus::Completed, WAIT).await.unwrap();
        let Some(OperationResult::Keygen(result)) = data.result else {
            panic!("keygen must produce a key result");
        };
        match &key_id {
            None => key_id = Some(result.key_id.clone()),
            Some(previous) => assert_eq!(previous, &result.key_id, "key ids must agree"),
        }
    }
    let key_id = key_id.unwrap();

    for handle in &cluster.handles {
        let metadata = handle.get_key_metadata(&key_id).unwrap();
        assert_eq!(metadata.threshold, 1);
        assert_eq!(metadata.participants.len(), 3);
        assert_eq!(metadata.moniker, "treasury");
        assert_eq!(handle.list_keys().unwrap(), vec![key_id.clone()]);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn signing_with_a_subset_leaves_the_rest_idle() {
    let base = tempfile::tempdir().unwrap();
    let cluster = spawn_cluster(base.path(), 3).await.unwrap();

    cluster.handles[0]
        .start_keygen(Some("k1".into()), keygen_request(&cluster.peer_ids, 1)).await
        .unwrap();
    let data = wait_for_status(&cluster.handles[0], "k1", OperationStatus::Completed, WAIT).await.unwrap();
    let Some(OperationResult::Keygen(key)) = data.result else {
        panic!("keygen result expected");
    };
    wait_for_status(&cluster.handles[1], "k1", OperationStatus::Completed, WAIT).await.unwrap();
    wait_for_status(&cluster.handles[2], "k1", OperationStatus::Completed, WAIT).await.unwrap();

    let signers = vec![cluster.peer_ids[0].clone(), cluster.peer_ids[1].clone()];
    cluster.handles[0]
        .start_signing(Some("s1".into()), SigningRequest {
            key_id: key.key_id.clone(),
            message: "0x48656c6c6f".into(),
            participants: signers,
        }).await
        .unwrap();

    for index in [0usize, 1] {
        let data = wait_for_status(
            &cluster.handles[index],
            "s1",
            OperationStatus::Completed,
            WAIT
        ).await.unwrap();
        let Some(OperationResult::Signing(signature)) = data.result else {
            panic!("signing must produce a signature");
        };
        assert_eq!(signature.r_hex.len(), 64);
        assert_eq!(signature.s_hex.len(), 64);
        assert!(signature.v <= 1);
    }

    // the third node never saw a sync for s1
    assert!(matches!(cluster.handles[2].get_operation("s1"), Err(Error::NotFound(_))));

    cluster.shutdown().await;
}

#[tokio::test]
async fn resubmission_is_idempotent_and_conflicts_are_rejected() {
    let base = tempfile::tempdir().unwrap();
    let cluster = spawn_cluster(base.path(), 3).await.unwrap();

    cluster.handles[0]
        .start_keygen(Some("k1".into()), keygen_request(&cluster.peer_ids, 1)).await
        .unwrap();
    let data = wait_for_status(&cluster.handles[0], "k1", OperationStatus::Completed, WAIT).await.unwrap();
    let Some(OperationResult::Keygen(key)) = data.result else {
        panic!("keygen result expected");
    };

    let request = SigningRequest {
        key_id: key.key_id.clone(),
        message: "0x48656c6c6f".into(),
        participants: vec![cluster.peer_ids[0].clone(), cluster.peer_ids[1].clone()],
    };
    let first = cluster.handles[0].start_signing(Some("s1".into()), request.clone()).await.unwrap();
    let second = cluster.handles[0].start_signing(Some("s1".into()), request.clone()).await.unwrap();
    assert_eq!(first.operation_id, second.operation_id);

    let conflicting = SigningRequest {
        message: "0x646966666572656e74".into(),
        ..request
    };
    let result = cluster.handles[0].start_signing(Some("s1".into()), conflicting).await;
    assert!(matches!(result, Err(Error::Conflict(_))));

    cluster.shutdown().await;
}

async fn spawn_hook_server(approved: bool, reason: &str) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = format!("{{\"approved\":{},\"reason\":\"{}\"}}", approved, reason);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buffer = [0u8; 8192];
                let _ = socket.read(&mut buffer).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn rejected_validation_fails_signing_before_any_round() {
    let base = tempfile::tempdir().unwrap();
    let hook_url = spawn_hook_server(false, "blocked").await;

    let cluster = spawn_cluster_with(
        base.path(),
        2,
        |_| mock_factory(2),
        |index, config| {
            if index == 0 {
                config.validation = Some(ValidationHookConfig {
                    url: hook_url.clone(),
                    timeout_seconds: 3,
                    headers: HashMap::new(),
                    insecure_skip_verify: false,
                });
            }
        }
    ).await.unwrap();

    cluster.handles[0]
        .start_keygen(Some("k1".into()), keygen_request(&cluster.peer_ids, 1)).await
        .unwrap();
    let data = wait_for_status(&cluster.handles[0], "k1", OperationStatus::Completed, WAIT).await.unwrap();
    let Some(OperationResult::Keygen(key)) = data.result else {
        panic!("keygen result expected");
    };

    cluster.handles[0]
        .start_signing(Some("s4".into()), SigningRequest {
            key_id: key.key_id,
            message: "0x48656c6c6f".into(),
            participants: cluster.peer_ids.clone(),
        }).await
        .unwrap();

    let failed = wait_for_status(
        &cluster.handles[0],
        "s4",
        OperationStatus::Failed,
        WAIT
    ).await.unwrap();
    let error = failed.error.unwrap_or_default();
    assert!(error.contains("validation-rejected"), "unexpected error: {}", error);
    assert!(error.contains("blocked"), "reason must be surfaced: {}", error);
    assert!(failed.result.is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn approving_validation_lets_signing_complete() {
    let base = tempfile::tempdir().unwrap();
    let hook_url = spawn_hook_server(true, "fine").await;

    let cluster = spawn_cluster_with(
        base.path(),
        2,
        |_| mock_factory(2),
        |_, config| {
            config.validation = Some(ValidationHookConfig {
                url: hook_url.clone(),
                timeout_seconds: 3,
                headers: HashMap::new(),
                insecure_skip_verify: false,
            });
        }
    ).await.unwrap();

    cluster.handles[0]
        .start_keygen(Some("k1".into()), keygen_request(&cluster.peer_ids, 1)).await
        .unwrap();
    let data = wait_for_status(&cluster.handles[0], "k1", OperationStatus::Completed, WAIT).await.unwrap();
    let Some(OperationResult::Keygen(key)) = data.result else {
        panic!("keygen result expected");
    };

    cluster.handles[0]
        .start_signing(Some("s1".into()), SigningRequest {
            key_id: key.key_id,
            message: "0x01".into(),
            participants: cluster.peer_ids.clone(),
        }).await
        .unwrap();
    wait_for_status(&cluster.handles[0], "s1", OperationStatus::Completed, WAIT).await.unwrap();
    wait_for_status(&cluster.handles[1], "s1", OperationStatus::Completed, WAIT).await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn wrong_password_on_restart_refuses_to_start() {
    let base = tempfile::tempdir().unwrap();
    let dir = base.path().join("node0");

    {
        let mut config = dknet_node::config::NodeConfig::new(&dir);
        config.memory_transport = true;
        config.listen_addrs = vec!["/memory/0".parse().unwrap()];
        let node = Node::start_with(config, "first-password", mock_factory(2)).await.unwrap();
        node.shutdown().await;
    }

    let mut config = dknet_node::config::NodeConfig::new(&dir);
    config.memory_transport = true;
    config.listen_addrs = vec!["/memory/0".parse().unwrap()];
    let result = Node::start_with(config, "second-password", mock_factory(2)).await;
    assert!(matches!(result, Err(Error::DecryptionFailed)));
}

#[tokio::test]
async fn resharing_produces_a_new_key_and_keeps_the_old_one_usable() {
    let base = tempfile::tempdir().unwrap();
    let cluster = spawn_cluster(base.path(), 4).await.unwrap();

    let old_holders: Vec<String> = cluster.peer_ids[..3].to_vec();
    cluster.handles[0]
        .start_keygen(Some("k1".into()), keygen_request(&old_holders, 1)).await
        .unwrap();
    let data = wait_for_status(&cluster.handles[0], "k1", OperationStatus::Completed, WAIT).await.unwrap();
    let Some(OperationResult::Keygen(old_key)) = data.result else {
        panic!("keygen result expected");
    };
    for index in 0..3 {
        wait_for_status(&cluster.handles[index], "k1", OperationStatus::Completed, WAIT).await.unwrap();
    }

    cluster.handles[0]
        .start_resharing(Some("r1".into()), ResharingRequest {
            key_id: old_key.key_id.clone(),
            new_threshold: 2,
            new_participants: cluster.peer_ids.clone(),
        }).await
        .unwrap();

    let mut new_key_id = None;
    for handle in &cluster.handles {
        let data = wait_for_status(handle, "r1", OperationStatus::Completed, WAIT).await.unwrap();
        let Some(OperationResult::Keygen(new_key)) = data.result else {
            panic!("resharing must produce a key result");
        };
        assert_ne!(new_key.key_id, old_key.key_id);
        new_key_id = Some(new_key.key_id);
    }
    let new_key_id = new_key_id.unwrap();

    // old holders keep both bundles, the newcomer has only the new one
    for index in 0..3 {
        let keys = cluster.handles[index].list_keys().unwrap();
        assert!(keys.contains(&old_key.key_id));
        assert!(keys.contains(&new_key_id));
    }
    assert_eq!(cluster.handles[3].list_keys().unwrap(), vec![new_key_id.clone()]);

    // signing still works under the old key...
    cluster.handles[0]
        .start_signing(Some("s-old".into()), SigningRequest {
            key_id: old_key.key_id.clone(),
            message: "0x01".into(),
            participants: old_holders[..2].to_vec(),
        }).await
        .unwrap();
    wait_for_status(&cluster.handles[0], "s-old", OperationStatus::Completed, WAIT).await.unwrap();

    // ...and under the new one, now requiring three signers
    cluster.handles[1]
        .start_signing(Some("s-new".into()), SigningRequest {
            key_id: new_key_id,
            message: "0x02".into(),
            participants: cluster.peer_ids[..3].to_vec(),
        }).await
        .unwrap();
    wait_for_status(&cluster.handles[1], "s-new", OperationStatus::Completed, WAIT).await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn unreachable_peers_time_the_operation_out() {
    let base = tempfile::tempdir().unwrap();
    let cluster = spawn_cluster_with(
        base.path(),
        1,
        |_| mock_factory(2),
        |_, config| {
            config.deadlines.keygen = Duration::from_secs(2);
            config.sync_retries = 1;
        }
    ).await.unwrap();

    let ghost = libp2p::identity::Keypair
        ::generate_secp256k1()
        .public()
        .to_peer_id()
        .to_base58();
    cluster.handles[0]
        .start_keygen(
            Some("k-ghost".into()),
            keygen_request(&[cluster.peer_ids[0].clone(), ghost], 1)
        ).await
        .unwrap();

    let failed = wait_for_status(
        &cluster.handles[0],
        "k-ghost",
        OperationStatus::Failed,
        WAIT
    ).await.unwrap();
    assert!(failed.error.unwrap_or_default().contains("deadline"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn cancellation_reaches_the_driver() {
    let base = tempfile::tempdir().unwrap();
    let cluster = spawn_cluster(base.path(), 1).await.unwrap();

    let ghost = libp2p::identity::Keypair
        ::generate_secp256k1()
        .public()
        .to_peer_id()
        .to_base58();
    cluster.handles[0]
        .start_keygen(
            Some("k-cancel".into()),
            keygen_request(&[cluster.peer_ids[0].clone(), ghost], 1)
        ).await
        .unwrap();
    wait_for_status(&cluster.handles[0], "k-cancel", OperationStatus::InProgress, WAIT).await.unwrap();

    cluster.handles[0].cancel_operation("k-cancel").unwrap();
    wait_for_status(&cluster.handles[0], "k-cancel", OperationStatus::Canceled, WAIT).await.unwrap();

    cluster.shutdown().await;
}

#[tokio::test]
async fn json_api_round_trip() {
    let base = tempfile::tempdir().unwrap();
    let cluster = spawn_cluster(base.path(), 3).await.unwrap();

    let request = serde_json
        ::json!({
            "type": "start_keygen",
            "operation_id": "k-json",
            "threshold": 1,
            "participants": cluster.peer_ids,
        })
        .to_string();
    let response = api::handle_json_request(&cluster.handles[0], &request).await;
    let parsed: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["operation_id"], "k-json");
    assert_eq!(parsed["status"], "pending");

    wait_for_status(&cluster.handles[0], "k-json", OperationStatus::Completed, WAIT).await.unwrap();

    let get = serde_json
        ::json!({ "type": "get_operation", "operation_id": "k-json" })
        .to_string();
    let response = api::handle_json_request(&cluster.handles[0], &get).await;
    let parsed: serde_json::Value = serde_json::from_str(&response).unwrap();
    assert_eq!(parsed["status"], "completed");
    assert!(parsed["result"]["key_id"].is_string());

    let bad = api::handle_json_request(&cluster.handles[0], "{\"type\": \"nonsense\"}").await;
    let parsed: serde_json::Value = serde_json::from_str(&bad).unwrap();
    assert!(parsed["error"].is_string());

    cluster.shutdown().await;
}

#[tokio::test]
async fn access_control_drops_unlisted_peers() {
    let base = tempfile::tempdir().unwrap();
    let stranger = libp2p::identity::Keypair::generate_secp256k1().public().to_peer_id();

    let cluster = spawn_cluster_with(
        base.path(),
        2,
        |_| mock_factory(2),
        |index, config| {
            config.deadlines.keygen = Duration::from_secs(3);
            config.sync_retries = 1;
            if index == 1 {
                // the second node only admits a peer that does not exist
                config.allowed_peers = Some([stranger].into_iter().collect());
            }
        }
    ).await.unwrap();

    cluster.handles[0]
        .start_keygen(Some("k-denied".into()), keygen_request(&cluster.peer_ids, 1)).await
        .unwrap();

    let failed = wait_for_status(
        &cluster.handles[0],
        "k-denied",
        OperationStatus::Failed,
        WAIT
    ).await.unwrap();
    assert!(failed.error.unwrap_or_default().contains("deadline"));
    assert!(matches!(cluster.handles[1].get_operation("k-denied"), Err(Error::NotFound(_))));

    cluster.shutdown().await;
}

// TEST_PASSWORD is part of the public testing surface; keep it referenced.
#[test]
fn test_password_is_nonempty() {
    assert!(!TEST_PASSWORD.is_empty());
}
