use chrono::{ DateTime, Utc };
use serde::{ Deserialize, Serialize };

/// Everything a node persists about one of its key shares. `share_blob` is
/// the TSS library's serialized local state and stays opaque to the
/// coordinator; the surrounding fields exist so membership and thresholds
/// can be checked without hydrating the share.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyShareBundle {
    pub key_id: String,
    pub moniker: String,
    pub threshold: u16,
    pub participants: Vec<String>,
    pub public_key_hex: String,
    pub created_at: DateTime<Utc>,
    /// Base64 of the serialized library share.
    pub share_blob: String,
}

impl KeyShareBundle {
    pub fn share_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::decode(&self.share_blob)
    }

    pub fn metadata(&self) -> KeyMetadata {
        KeyMetadata {
            key_id: self.key_id.clone(),
            moniker: self.moniker.clone(),
            threshold: self.threshold,
            participants: self.participants.clone(),
            public_key_hex: self.public_key_hex.clone(),
            created_at: self.created_at,
        }
    }
}

/// Projection of a bundle that is safe to hand to API callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: String,
    pub moniker: String,
    pub threshold: u16,
    pub participants: Vec<String>,
    pub public_key_hex: String,
    pub created_at: DateTime<Utc>,
}
