use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };
use std::collections::HashMap;

/// Payload POSTed to the operator's validation endpoint before a signing
/// session is allowed to start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationRequest {
    /// Hex-encoded message that was requested to be signed.
    pub message: String,
    pub key_id: String,
    pub participants: Vec<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// The endpoint's verdict. Anything other than an explicit approval,
/// including transport failures, rejects the signing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
