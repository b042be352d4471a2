use crate::encryption::{ aes_decrypt, aes_encrypt, AES_KEY_BYTES_LEN };
use crate::error::{ Error, Result };
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use hkdf::Hkdf;
use libp2p::identity::{ Keypair, PublicKey };
use sha2::{ Digest, Sha256, Sha512 };
use shared::envelope::EncryptedEnvelope;

const HKDF_SALT: &[u8] = b"DKNet-E2E-Salt";
const HKDF_INFO: &[u8] = b"DKNet-E2E-v1";

/// End-to-end encryption between peers, keyed by their libp2p identities.
/// The backend is chosen once at host start from the local key's curve;
/// peers on a different curve are rejected at the first send.
pub trait PeerCipher: Send + Sync {
    fn encrypt_for(&self, peer: &PublicKey, plaintext: &[u8]) -> Result<EncryptedEnvelope>;
    fn decrypt_from(&self, peer: &PublicKey, envelope: &EncryptedEnvelope) -> Result<Vec<u8>>;
}

/// Pick the cipher backend matching the identity key.
pub fn cipher_for_identity(keypair: &Keypair) -> Result<Box<dyn PeerCipher>> {
    if let Ok(kp) = keypair.clone().try_into_secp256k1() {
        return Ok(Box::new(Secp256k1Cipher::new(&kp)?));
    }
    if let Ok(kp) = keypair.clone().try_into_ed25519() {
        return Ok(Box::new(Ed25519Cipher::new(&kp)));
    }
    Err(Error::invalid("unsupported-key-type: identity must be Secp256k1 or Ed25519"))
}

fn derive_aes_key(shared_secret: &[u8]) -> Result<[u8; AES_KEY_BYTES_LEN]> {
    let hkdf = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut key = [0u8; AES_KEY_BYTES_LEN];
    hkdf
        .expand(HKDF_INFO, &mut key)
        .map_err(|_| Error::Transport("key derivation failed".to_string()))?;
    Ok(key)
}

fn mismatched_curve(peer: &PublicKey) -> Error {
    Error::invalid(
        format!("unsupported-key-type: peer identity curve {:?} does not match ours", peer.key_type())
    )
}

/// Static-static ECDH on secp256k1: both sides multiply the other's public
/// point by their own secret scalar, so no ephemeral key travels.
pub struct Secp256k1Cipher {
    secret: libsecp256k1::SecretKey,
}

impl Secp256k1Cipher {
    pub fn new(keypair: &libp2p::identity::secp256k1::Keypair) -> Result<Self> {
        let secret = libsecp256k1::SecretKey
            ::parse(&keypair.secret().to_bytes())
            .map_err(|err| Error::invalid(format!("invalid secp256k1 secret: {}", err)))?;
        Ok(Self { secret })
    }

    fn shared_secret(&self, peer: &PublicKey) -> Result<Vec<u8>> {
        let peer_key = peer
            .clone()
            .try_into_secp256k1()
            .map_err(|_| mismatched_curve(peer))?;
        let mut point = libsecp256k1::PublicKey
            ::parse_compressed(&peer_key.to_bytes())
            .map_err(|err| Error::Transport(format!("invalid peer public key: {}", err)))?;
        point
            .tweak_mul_assign(&self.secret)
            .map_err(|err| Error::Transport(format!("ecdh failed: {}", err)))?;
        Ok(point.serialize_compressed().to_vec())
    }
}

impl PeerCipher for Secp256k1Cipher {
    fn encrypt_for(&self, peer: &PublicKey, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        let key = derive_aes_key(&self.shared_secret(peer)?)?;
        let (nonce, ciphertext) = aes_encrypt(plaintext, &key)?;
        Ok(EncryptedEnvelope::new(None, &nonce, &ciphertext))
    }

    fn decrypt_from(&self, peer: &PublicKey, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        let key = derive_aes_key(&self.shared_secret(peer)?)?;
        let nonce = envelope.nonce_bytes().map_err(|_| Error::DecryptionFailed)?;
        let ciphertext = envelope.ciphertext_bytes().map_err(|_| Error::DecryptionFailed)?;
        aes_decrypt(&nonce, &ciphertext, &key)
    }
}

/// Ed25519 identities do ECDH on the birationally equivalent Montgomery
/// curve with a per-message ephemeral key, NaCl-box style: the envelope
/// carries the ephemeral public key alongside nonce and ciphertext.
pub struct Ed25519Cipher {
    x25519_secret: Scalar,
}

impl Ed25519Cipher {
    pub fn new(keypair: &libp2p::identity::ed25519::Keypair) -> Self {
        let bytes = keypair.to_bytes();
        Self { x25519_secret: ed25519_seed_to_x25519(&bytes[..32]) }
    }

    fn peer_montgomery(&self, peer: &PublicKey) -> Result<MontgomeryPoint> {
        let peer_key = peer
            .clone()
            .try_into_ed25519()
            .map_err(|_| mismatched_curve(peer))?;
        let compressed = CompressedEdwardsY::from_slice(&peer_key.to_bytes());
        let point = compressed
            .decompress()
            .ok_or_else(|| Error::Transport("invalid peer public key".to_string()))?;
        Ok(point.to_montgomery())
    }
}

impl PeerCipher for Ed25519Cipher {
    fn encrypt_for(&self, peer: &PublicKey, plaintext: &[u8]) -> Result<EncryptedEnvelope> {
        let peer_point = self.peer_montgomery(peer)?;

        let mut seed = [0u8; 32];
        crate::encryption::fill_secure_random(&mut seed);
        let ephemeral = clamp_scalar(seed);
        let ephemeral_public = (&ED25519_BASEPOINT_TABLE * &ephemeral).to_montgomery();

        let shared = &peer_point * &ephemeral;
        let key = derive_aes_key(shared.as_bytes())?;
        let (nonce, ciphertext) = aes_encrypt(plaintext, &key)?;
        Ok(EncryptedEnvelope::new(Some(ephemeral_public.to_bytes().to_vec()), &nonce, &ciphertext))
    }

    fn decrypt_from(&self, _peer: &PublicKey, envelope: &EncryptedEnvelope) -> Result<Vec<u8>> {
        let epk = envelope
            .epk_bytes()
            .map_err(|_| Error::DecryptionFailed)?
            .ok_or(Error::DecryptionFailed)?;
        if epk.len() != 32 {
            return Err(Error::DecryptionFailed);
        }
        let mut epk_bytes = [0u8; 32];
        epk_bytes.copy_from_slice(&epk);

        let shared = &MontgomeryPoint(epk_bytes) * &self.x25519_secret;
        let key = derive_aes_key(shared.as_bytes())?;
        let nonce = envelope.nonce_bytes().map_err(|_| Error::DecryptionFailed)?;
        let ciphertext = envelope.ciphertext_bytes().map_err(|_| Error::DecryptionFailed)?;
        aes_decrypt(&nonce, &ciphertext, &key)
    }
}

fn ed25519_seed_to_x25519(seed: &[u8]) -> Scalar {
    let hash = Sha512::digest(seed);
    let mut output = [0u8; 32];
    output.copy_from_slice(&hash[..32]);
    clamp_scalar(output)
}

//ensures the scalar stays on the main prime-order subgroup
fn clamp_scalar(mut scalar: [u8; 32]) -> Scalar {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;

    Scalar::from_bits(scalar)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secp256k1_round_trip_both_directions() {
        let a = Keypair::generate_secp256k1();
        let b = Keypair::generate_secp256k1();
        let cipher_a = cipher_for_identity(&a).unwrap();
        let cipher_b = cipher_for_identity(&b).unwrap();

        let envelope = cipher_a.encrypt_for(&b.public(), b"round one").unwrap();
        assert_eq!(cipher_b.decrypt_from(&a.public(), &envelope).unwrap(), b"round one");

        let reply = cipher_b.encrypt_for(&a.public(), b"round two").unwrap();
        assert_eq!(cipher_a.decrypt_from(&b.public(), &reply).unwrap(), b"round two");
    }

    #[test]
    fn ed25519_round_trip_with_ephemeral_key() {
        let a = Keypair::generate_ed25519();
        let b = Keypair::generate_ed25519();
        let cipher_a = cipher_for_identity(&a).unwrap();
        let cipher_b = cipher_for_identity(&b).unwrap();

        let envelope = cipher_a.encrypt_for(&b.public(), b"sealed").unwrap();
        assert!(envelope.epk.is_some());
        assert_eq!(cipher_b.decrypt_from(&a.public(), &envelope).unwrap(), b"sealed");
    }

    #[test]
    fn mixed_key_types_rejected_at_encrypt() {
        let secp = Keypair::generate_secp256k1();
        let ed = Keypair::generate_ed25519();
        let cipher = cipher_for_identity(&secp).unwrap();
        assert!(matches!(
            cipher.encrypt_for(&ed.public(), b"nope"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn tampering_breaks_decryption() {
        let a = Keypair::generate_secp256k1();
        let b = Keypair::generate_secp256k1();
        let cipher_a = cipher_for_identity(&a).unwrap();
        let cipher_b = cipher_for_identity(&b).unwrap();

        let mut envelope = cipher_a.encrypt_for(&b.public(), b"payload").unwrap();
        envelope.ciphertext = base64::encode(b"garbage");
        assert!(matches!(
            cipher_b.decrypt_from(&a.public(), &envelope),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn third_party_cannot_decrypt() {
        let a = Keypair::generate_secp256k1();
        let b = Keypair::generate_secp256k1();
        let eve = Keypair::generate_secp256k1();
        let cipher_a = cipher_for_identity(&a).unwrap();
        let cipher_eve = cipher_for_identity(&eve).unwrap();

        let envelope = cipher_a.encrypt_for(&b.public(), b"for b only").unwrap();
        assert!(cipher_eve.decrypt_from(&a.public(), &envelope).is_err());
    }
}
