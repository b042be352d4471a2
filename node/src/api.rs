use crate::error::Result;
use crate::node::NodeHandle;
use serde::{ Deserialize, Serialize };
use serde_json::{ json, Value };
use shared::operation::{ KeygenRequest, ResharingRequest, SigningRequest };
use tracing::error;

/// The JSON command surface external bindings (HTTP, gRPC gateways, local
/// tooling) marshal into. Every Start* returns the operation's current
/// status immediately; the work itself proceeds asynchronously.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiRequest {
    StartKeygen {
        #[serde(default)]
        operation_id: Option<String>,
        threshold: u16,
        participants: Vec<String>,
        #[serde(default)]
        moniker: Option<String>,
    },
    StartSigning {
        #[serde(default)]
        operation_id: Option<String>,
        message: String,
        key_id: String,
        participants: Vec<String>,
    },
    StartResharing {
        #[serde(default)]
        operation_id: Option<String>,
        key_id: String,
        new_threshold: u16,
        new_participants: Vec<String>,
    },
    GetOperation {
        operation_id: String,
    },
    CancelOperation {
        operation_id: String,
    },
    ListOperations,
    GetKeyMetadata {
        key_id: String,
    },
    ListKeys,
    NodeInfo,
}

/// Process one JSON request and always hand back a JSON string; failures
/// become `{"error": ...}` rather than a transport-level error.
pub async fn handle_json_request(handle: &NodeHandle, request: &str) -> String {
    match process_request(handle, request).await {
        Ok(value) => value.to_string(),
        Err(err) => {
            error!("Could not process API request: {}", err);
            json!({ "error": err.to_string() }).to_string()
        }
    }
}

async fn process_request(handle: &NodeHandle, request: &str) -> Result<Value> {
    let request: ApiRequest = serde_json::from_str(request)?;
    dispatch(handle, request).await
}

pub async fn dispatch(handle: &NodeHandle, request: ApiRequest) -> Result<Value> {
    match request {
        ApiRequest::StartKeygen { operation_id, threshold, participants, moniker } => {
            let response = handle.start_keygen(operation_id, KeygenRequest {
                threshold,
                participants,
                moniker,
            }).await?;
            Ok(serde_json::to_value(response)?)
        }
        ApiRequest::StartSigning { operation_id, message, key_id, participants } => {
            let response = handle.start_signing(operation_id, SigningRequest {
                key_id,
                message,
                participants,
            }).await?;
            Ok(serde_json::to_value(response)?)
        }
        ApiRequest::StartResharing { operation_id, key_id, new_threshold, new_participants } => {
            let response = handle.start_resharing(operation_id, ResharingRequest {
                key_id,
                new_threshold,
                new_participants,
            }).await?;
            Ok(serde_json::to_value(response)?)
        }
        ApiRequest::GetOperation { operation_id } => {
            Ok(serde_json::to_value(handle.get_operation(&operation_id)?)?)
        }
        ApiRequest::CancelOperation { operation_id } => {
            handle.cancel_operation(&operation_id)?;
            Ok(json!({ "canceled": operation_id }))
        }
        ApiRequest::ListOperations => { Ok(json!({ "operations": handle.list_operations() })) }
        ApiRequest::GetKeyMetadata { key_id } => {
            Ok(serde_json::to_value(handle.get_key_metadata(&key_id)?)?)
        }
        ApiRequest::ListKeys => { Ok(json!({ "keys": handle.list_keys()? })) }
        ApiRequest::NodeInfo => {
            Ok(
                json!({
                "peer_id": handle.local_peer_id(),
                "moniker": handle.moniker(),
            })
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_requests_parse_from_snake_case_json() {
        let parsed: ApiRequest = serde_json
            ::from_str(
                r#"{
                "type": "start_keygen",
                "operation_id": "k1",
                "threshold": 1,
                "participants": ["p1", "p2", "p3"]
            }"#
            )
            .unwrap();
        match parsed {
            ApiRequest::StartKeygen { operation_id, threshold, participants, moniker } => {
                assert_eq!(operation_id.as_deref(), Some("k1"));
                assert_eq!(threshold, 1);
                assert_eq!(participants.len(), 3);
                assert!(moniker.is_none());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn unit_variants_parse_without_payload() {
        let parsed: ApiRequest = serde_json::from_str(r#"{"type": "list_keys"}"#).unwrap();
        assert!(matches!(parsed, ApiRequest::ListKeys));
    }
}
