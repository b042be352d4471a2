use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };
use strum_macros::Display;

/// The three multi-party computations a node can coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationType {
    Keygen,
    Signing,
    Resharing,
}

/// Status of an operation. Transitions are monotonic:
/// pending -> in_progress -> { completed | failed | canceled },
/// with pending also allowed to jump straight to failed/canceled
/// (e.g. a rejected validation hook).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        match (self, next) {
            (Pending, InProgress) => true,
            (Pending, Failed) | (Pending, Canceled) => true,
            (InProgress, Completed) | (InProgress, Failed) | (InProgress, Canceled) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenRequest {
    pub threshold: u16,
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moniker: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub key_id: String,
    /// Hex-encoded message bytes, with or without a `0x` prefix.
    pub message: String,
    pub participants: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResharingRequest {
    pub key_id: String,
    pub new_threshold: u16,
    pub new_participants: Vec<String>,
}

/// Typed payload of an operation. The enum tag doubles as the operation type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationRequest {
    Keygen(KeygenRequest),
    Signing(SigningRequest),
    Resharing(ResharingRequest),
}

impl OperationRequest {
    pub fn op_type(&self) -> OperationType {
        match self {
            Self::Keygen(_) => OperationType::Keygen,
            Self::Signing(_) => OperationType::Signing,
            Self::Resharing(_) => OperationType::Resharing,
        }
    }

    /// The peers that actually run the session. For resharing that is the
    /// new participant set; holders of the old key that are not re-elected
    /// keep their old share but take no part in the protocol.
    pub fn session_participants(&self) -> &[String] {
        match self {
            Self::Keygen(req) => &req.participants,
            Self::Signing(req) => &req.participants,
            Self::Resharing(req) => &req.new_participants,
        }
    }
}

/// Result of a successful keygen. Resharing reports the same shape for the
/// replacement key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeygenResult {
    pub public_key_hex: String,
    pub key_id: String,
}

/// An Ethereum-compatible recoverable ECDSA signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningResult {
    pub signature_hex: String,
    pub r_hex: String,
    pub s_hex: String,
    pub v: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationResult {
    Keygen(KeygenResult),
    Signing(SigningResult),
}

/// The serializable form of an operation, persisted on every status
/// transition. The live form additionally owns channels and a party handle;
/// those never leave the node process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationData {
    pub id: String,
    pub op_type: OperationType,
    pub session_id: String,
    pub participants: Vec<String>,
    pub request: OperationRequest,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immediate response to any Start* call; work continues asynchronously.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartOperationResponse {
    pub operation_id: String,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
}

/// Sorted copy of a participant list. Session identity and party indexing
/// both rely on this ordering being applied consistently on every node.
pub fn sorted_participants(participants: &[String]) -> Vec<String> {
    let mut sorted = participants.to_vec();
    sorted.sort();
    sorted
}

/// Decode a hex message, tolerating an optional `0x` prefix.
pub fn decode_message_hex(message: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let trimmed = message.strip_prefix("0x").unwrap_or(message);
    hex::decode(trimmed)
}
