use crate::error::{ Error, Result };
use crate::storage::KeyStore;
use crate::transport::TransportHandle;
use libp2p::PeerId;
use shared::operation::{ OperationData, OperationRequest };
use shared::session::derive_session_id;
use shared::sync::OperationSyncData;
use std::time::Duration;
use tracing::{ info, warn };

/// Push the operation announcement to every other participant over the
/// opsync protocol, each peer retried with backoff up to a bounded attempt
/// count. A peer that explicitly rejects is not retried; its absence either
/// leaves enough parties to finish or the session times out.
pub async fn announce_operation(
    transport: &TransportHandle,
    local_peer: &str,
    operation: &OperationData,
    attempts: u32
) {
    let data = OperationSyncData {
        operation_id: operation.id.clone(),
        session_id: operation.session_id.clone(),
        initiator: local_peer.to_string(),
        request: operation.request.clone(),
    };

    for participant in &operation.participants {
        if participant == local_peer {
            continue;
        }
        let peer: PeerId = match participant.parse() {
            Ok(peer) => peer,
            Err(err) => {
                warn!("Skipping sync to unparseable peer id {}: {}", participant, err);
                continue;
            }
        };

        let mut backoff = Duration::from_millis(500);
        let mut delivered = false;
        for attempt in 1..=attempts.max(1) {
            match transport.send_sync(peer, data.clone()).await {
                Ok(ack) if ack.accepted => {
                    info!("Peer {} accepted sync for operation {}", peer, operation.id);
                    delivered = true;
                    break;
                }
                Ok(ack) => {
                    warn!(
                        "Peer {} rejected sync for operation {}: {}",
                        peer,
                        operation.id,
                        ack.reason.unwrap_or_else(|| "no reason given".to_string())
                    );
                    delivered = true; // final answer, do not retry
                    break;
                }
                Err(err) => {
                    warn!(
                        "Sync attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        peer,
                        err
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(8));
                }
            }
        }
        if !delivered {
            warn!(
                "Could not deliver sync for operation {} to {}; the session may time out",
                operation.id,
                peer
            );
        }
    }
}

/// Validate an inbound announcement before the matching operation is
/// created locally. Checks, in order: the session id is honestly derived
/// from the request, this node is actually a session participant, and for
/// signing the referenced key exists locally and the announced signer set
/// is a large-enough subset of the keygen participants. The signer checks
/// mirror the initiator-side ones: a lying initiator must not be able to
/// push a signer set the local party constructor cannot map onto
/// keygen-time indices.
pub fn validate_sync(data: &OperationSyncData, local_peer: &str, keys: &KeyStore) -> Result<()> {
    let derived = derive_session_id(&data.request);
    if derived != data.session_id {
        return Err(
            Error::invalid(
                format!("session id mismatch: announced {} derived {}", data.session_id, derived)
            )
        );
    }

    let participants = data.request.session_participants();
    if !participants.iter().any(|participant| participant == local_peer) {
        return Err(Error::invalid("local peer is not a participant of this operation"));
    }

    if let OperationRequest::Signing(request) = &data.request {
        let bundle = keys.get(&request.key_id)?;
        for participant in &request.participants {
            if !bundle.participants.contains(participant) {
                return Err(
                    Error::invalid(
                        format!(
                            "{} did not take part in keygen for key {}",
                            participant,
                            request.key_id
                        )
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
    }

    Ok(())
}
