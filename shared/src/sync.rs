use crate::operation::OperationRequest;
use serde::{ Deserialize, Serialize };

/// Announcement an initiator pushes to every other participant so they can
/// spawn a matching driver before the first protocol round lands.
///
/// Recipients re-derive the session id from the request and refuse the sync
/// when it does not match: a lying initiator cannot splice two groups of
/// honest nodes into one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSyncData {
    pub operation_id: String,
    pub session_id: String,
    pub initiator: String,
    pub request: OperationRequest,
}

/// Receipt for an operation sync. A rejection is final for that peer; the
/// initiator only logs it, the session either reaches threshold without the
/// peer or times out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SyncAck {
    pub fn accept() -> Self {
        Self { accepted: true, reason: None }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self { accepted: false, reason: Some(reason.into()) }
    }
}
