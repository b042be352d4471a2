use crate::error::{ Error, Result };
use aes_gcm::aead::{ generic_array::GenericArray, Aead, KeyInit };
use aes_gcm::Aes256Gcm;

pub const AES_KEY_BYTES_LEN: usize = 32;
pub const NONCE_BYTES_LEN: usize = 12;

/// Seal with AES-256-GCM under a fresh random nonce. Returns the nonce and
/// ciphertext separately; callers decide the framing.
pub fn aes_encrypt(plaintext: &[u8], encryption_key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if encryption_key.len() != AES_KEY_BYTES_LEN {
        return Err(
            Error::invalid(
                format!(
                    "encryption key has length {}, rather than the required {}",
                    encryption_key.len(),
                    AES_KEY_BYTES_LEN
                )
            )
        );
    }
    let mut nonce = vec![0u8; NONCE_BYTES_LEN];
    fill_secure_random(&mut nonce);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(encryption_key));
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|err| {
            Error::Storage(format!("encryption algorithm failed with an opaque error: {}", err))
        })?;
    Ok((nonce, ciphertext))
}

/// Open an AES-256-GCM sealed value. A bad key or tampered ciphertext is a
/// `DecryptionFailed`, never aliased with missing data.
pub fn aes_decrypt(nonce: &[u8], ciphertext: &[u8], encryption_key: &[u8]) -> Result<Vec<u8>> {
    if encryption_key.len() != AES_KEY_BYTES_LEN || nonce.len() != NONCE_BYTES_LEN {
        return Err(Error::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(GenericArray::from_slice(encryption_key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| Error::DecryptionFailed)
}

/// Fills the provided buffer with secure random bytes.
pub fn fill_secure_random(buffer: &mut [u8]) {
    use rand::prelude::*;
    rand::thread_rng().fill_bytes(buffer);
}

/// Returns a vector filled with random bytes.
pub fn get_secure_random_bytes(bytes: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes];
    fill_secure_random(&mut buffer);
    buffer
}
