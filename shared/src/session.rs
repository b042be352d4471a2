use crate::operation::{ decode_message_hex, sorted_participants, OperationRequest };
use sha2::{ Digest, Sha256 };

/// Derive the deterministic session id for an operation request.
///
/// Any two honest nodes that create an operation with the same logical
/// intent must land on the same session id, because protocol frames are
/// routed by it and may arrive before the operation-sync does. The digest
/// binds the operation type, the sorted participant set and the
/// type-specific payload.
pub fn derive_session_id(request: &OperationRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.op_type().to_string().as_bytes());
    for participant in sorted_participants(request.session_participants()) {
        hasher.update(b"|");
        hasher.update(participant.as_bytes());
    }
    hasher.update(b"|");
    match request {
        OperationRequest::Keygen(req) => {
            hasher.update(req.threshold.to_be_bytes());
        }
        OperationRequest::Signing(req) => {
            hasher.update(req.key_id.as_bytes());
            hasher.update(b"|");
            hasher.update(normalized_message_hex(&req.message).as_bytes());
        }
        OperationRequest::Resharing(req) => {
            hasher.update(req.key_id.as_bytes());
            hasher.update(b"|");
            hasher.update(req.new_threshold.to_be_bytes());
            for participant in sorted_participants(&req.new_participants) {
                hasher.update(b"|");
                hasher.update(participant.as_bytes());
            }
        }
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint used for idempotent resubmission: the same operation id with
/// a different fingerprint is a conflict, an identical one is a no-op.
pub fn request_fingerprint(request: &OperationRequest) -> String {
    let encoded = serde_json::to_vec(request).expect("operation request serializes");
    hex::encode(Sha256::digest(&encoded))
}

/// Canonical lowercase hex without the optional `0x` prefix. Falls back to
/// the raw input when it is not valid hex; invalid messages are rejected at
/// the API boundary before anything is derived from them.
fn normalized_message_hex(message: &str) -> String {
    match decode_message_hex(message) {
        Ok(bytes) => hex::encode(bytes),
        Err(_) => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ KeygenRequest, SigningRequest };

    fn keygen(participants: &[&str], threshold: u16) -> OperationRequest {
        OperationRequest::Keygen(KeygenRequest {
            threshold,
            participants: participants.iter().map(|p| p.to_string()).collect(),
            moniker: None,
        })
    }

    #[test]
    fn session_id_ignores_participant_order() {
        let a = derive_session_id(&keygen(&["p1", "p2", "p3"], 1));
        let b = derive_session_id(&keygen(&["p3", "p1", "p2"], 1));
        assert_eq!(a, b);
    }

    #[test]
    fn session_id_binds_threshold() {
        let a = derive_session_id(&keygen(&["p1", "p2", "p3"], 1));
        let b = derive_session_id(&keygen(&["p1", "p2", "p3"], 2));
        assert_ne!(a, b);
    }

    #[test]
    fn signing_session_id_normalizes_message_prefix() {
        let mk = |message: &str| {
            derive_session_id(
                &OperationRequest::Signing(SigningRequest {
                    key_id: "k".into(),
                    message: message.into(),
                    participants: vec!["p1".into(), "p2".into()],
                })
            )
        };
        assert_eq!(mk("0x48656c6c6f"), mk("48656C6C6F"));
        assert_ne!(mk("0x48656c6c6f"), mk("0x48656c6c6e"));
    }

    #[test]
    fn fingerprint_differs_on_payload() {
        let a = request_fingerprint(&keygen(&["p1", "p2"], 1));
        let b = request_fingerprint(&keygen(&["p1", "p2"], 2));
        assert_ne!(a, b);
        assert_eq!(a, request_fingerprint(&keygen(&["p1", "p2"], 1)));
    }
}
