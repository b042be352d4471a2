use curv::arithmetic::Converter;
use multi_party_ecdsa::protocols::multi_party_ecdsa::gg_2020::party_i::SignatureRecid;
use sha3::{ Digest, Keccak256 };
use shared::operation::SigningResult;

/// Hash a message the way `personal_sign` does, so the resulting signature
/// is directly usable with `ecrecover`.
pub fn ethereum_prefixed_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n");
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Encode a recoverable signature as `{r, s, v}` with `v` the raw recovery
/// id (0 or 1) and `signature_hex` the 65-byte `r || s || v` concatenation.
pub fn encode_signature(sig: &SignatureRecid) -> SigningResult {
    let r = pad32(&sig.r.to_bigint().to_bytes());
    let s = pad32(&sig.s.to_bigint().to_bytes());
    let v = sig.recid & 1;

    let mut packed = Vec::with_capacity(65);
    packed.extend_from_slice(&r);
    packed.extend_from_slice(&s);
    packed.push(v);

    SigningResult {
        signature_hex: hex::encode(&packed),
        r_hex: hex::encode(r),
        s_hex: hex::encode(s),
        v,
    }
}

fn pad32(bytes: &[u8]) -> [u8; 32] {
    let mut padded = [0u8; 32];
    let offset = 32usize.saturating_sub(bytes.len());
    padded[offset..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_hash_matches_known_vector() {
        // keccak256("\x19Ethereum Signed Message:\n5Hello")
        let digest = ethereum_prefixed_hash(b"Hello");
        assert_eq!(
            hex::encode(digest),
            "aa744ba2ca576ec62ca0045eca00ad3917fdf7ffa34fbbae50828a5a69c1580e"
        );
    }

    #[test]
    fn pad32_left_pads_short_values() {
        let padded = pad32(&[0xab, 0xcd]);
        assert_eq!(padded[30..], [0xab, 0xcd]);
        assert!(padded[..30].iter().all(|b| *b == 0));
    }
}
