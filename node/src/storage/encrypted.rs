use crate::encryption::{ aes_decrypt, aes_encrypt, AES_KEY_BYTES_LEN, NONCE_BYTES_LEN };
use crate::error::{ Error, Result };
use crate::storage::kv::KvStore;
use crate::storage::SYSTEM_PREFIX;
use hmac::Hmac;
use sha2::Sha256;
use std::sync::Arc;

/// Fixed key-derivation salt. Deterministic derivation is the accepted
/// tradeoff: the same password always opens the same store and there is no
/// per-install rotation step.
pub const KEY_DERIVATION_SALT: &[u8] = b"dknet-tss-key-salt-v1";
const PBKDF2_ROUNDS: u32 = 100_000;

const PROBE_PLAINTEXT: &[u8] = b"dknet-storage-probe-v1";

/// Transparent AES-256-GCM layer over a raw byte store. Every value on disk
/// is `nonce || ciphertext` with a fresh random nonce per write, so no
/// stored value ever equals its plaintext and identical writes never
/// produce identical ciphertexts.
pub struct EncryptedKv {
    inner: Arc<dyn KvStore>,
    master_key: [u8; AES_KEY_BYTES_LEN],
}

impl EncryptedKv {
    pub fn open(inner: Arc<dyn KvStore>, password: &str) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::invalid("encryption password must not be empty"));
        }
        let mut master_key = [0u8; AES_KEY_BYTES_LEN];
        pbkdf2::pbkdf2::<Hmac<Sha256>>(
            password.as_bytes(),
            KEY_DERIVATION_SALT,
            PBKDF2_ROUNDS,
            &mut master_key
        );
        Ok(Self { inner, master_key })
    }

    /// Detect a wrong password before the node accepts any work. The first
    /// open writes a sentinel value; every later open must decrypt it.
    pub fn probe(&self) -> Result<()> {
        let probe_key = format!("{}probe", SYSTEM_PREFIX);
        if self.inner.exists(&probe_key)? {
            let plaintext = self.load(&probe_key)?;
            if plaintext != PROBE_PLAINTEXT {
                return Err(Error::DecryptionFailed);
            }
            Ok(())
        } else {
            self.save(&probe_key, PROBE_PLAINTEXT)
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (mut stored, ciphertext) = aes_encrypt(plaintext, &self.master_key)?;
        stored.extend_from_slice(&ciphertext);
        Ok(stored)
    }

    fn unseal(&self, stored: &[u8]) -> Result<Vec<u8>> {
        if stored.len() <= NONCE_BYTES_LEN {
            return Err(Error::DecryptionFailed);
        }
        let (nonce, ciphertext) = stored.split_at(NONCE_BYTES_LEN);
        aes_decrypt(nonce, ciphertext, &self.master_key)
    }
}

impl KvStore for EncryptedKv {
    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let sealed = self.seal(value)?;
        self.inner.save(key, &sealed)
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        let stored = self.inner.load(key)?;
        self.unseal(&stored)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}
