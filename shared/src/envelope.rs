use serde::{ Deserialize, Serialize };

/// One framed protocol message as it travels between peers, either inside
/// an encrypted direct stream or in the clear over gossip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolEnvelope {
    pub session_id: String,
    pub from_party: u16,
    pub round: u16,
    pub is_broadcast: bool,
    /// Base64 of the serialized party message body.
    pub payload: String,
}

impl ProtocolEnvelope {
    pub fn new(
        session_id: impl Into<String>,
        from_party: u16,
        round: u16,
        is_broadcast: bool,
        payload: &[u8]
    ) -> Self {
        Self {
            session_id: session_id.into(),
            from_party,
            round,
            is_broadcast,
            payload: base64::encode(payload),
        }
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::decode(&self.payload)
    }
}

/// At-rest and on-the-wire ciphertext shape. `epk` carries the per-message
/// ephemeral public key on the Ed25519 path and stays empty for static
/// Secp256k1 ECDH.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epk: Option<String>,
    pub nonce: String,
    pub ciphertext: String,
}

impl EncryptedEnvelope {
    pub fn new(epk: Option<Vec<u8>>, nonce: &[u8], ciphertext: &[u8]) -> Self {
        Self {
            epk: epk.map(|bytes| base64::encode(bytes)),
            nonce: base64::encode(nonce),
            ciphertext: base64::encode(ciphertext),
        }
    }

    pub fn epk_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.epk.as_deref().map(base64::decode).transpose()
    }

    pub fn nonce_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::decode(&self.nonce)
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::decode(&self.ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_payload_round_trips() {
        let env = ProtocolEnvelope::new("sess", 2, 1, true, b"round-one");
        let parsed: ProtocolEnvelope = serde_json
            ::from_str(&serde_json::to_string(&env).unwrap())
            .unwrap();
        assert_eq!(parsed.payload_bytes().unwrap(), b"round-one");
        assert_eq!(parsed.from_party, 2);
        assert!(parsed.is_broadcast);
    }
}
