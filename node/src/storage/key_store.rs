use crate::error::{ Error, Result };
use crate::storage::encrypted::EncryptedKv;
use crate::storage::kv::KvStore;
use crate::storage::{ KEY_PREFIX, META_PREFIX };
use shared::key_info::{ KeyMetadata, KeyShareBundle };
use std::sync::Arc;
use tracing::info;

/// Store for TSS key share bundles, keyed by key id. Bundles are JSON under
/// `key/<key_id>` with a metadata projection under `meta/<key_id>`, both
/// encrypted at rest by the underlying store. Bundles are created by keygen
/// or resharing and never deleted by the core.
#[derive(Clone)]
pub struct KeyStore {
    store: Arc<EncryptedKv>,
}

impl KeyStore {
    pub fn new(store: Arc<EncryptedKv>) -> Self {
        Self { store }
    }

    /// Write a freshly generated bundle. Writing over an existing key id is
    /// a conflict: a key share is produced at most once.
    pub fn put(&self, bundle: &KeyShareBundle) -> Result<()> {
        let key = format!("{}{}", KEY_PREFIX, bundle.key_id);
        if self.store.exists(&key)? {
            return Err(
                Error::Conflict(format!("key share already exists for key id {}", bundle.key_id))
            );
        }
        self.store.save(&key, &serde_json::to_vec(bundle)?)?;
        let meta_key = format!("{}{}", META_PREFIX, bundle.key_id);
        self.store.save(&meta_key, &serde_json::to_vec(&bundle.metadata())?)?;
        info!("Stored key share bundle for key id {}", bundle.key_id);
        Ok(())
    }

    pub fn get(&self, key_id: &str) -> Result<KeyShareBundle> {
        let key = format!("{}{}", KEY_PREFIX, key_id);
        let bytes = self.store.load(&key).map_err(|err| {
            match err {
                Error::NotFound(_) => Error::UnknownKey(key_id.to_string()),
                other => other,
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn exists(&self, key_id: &str) -> Result<bool> {
        self.store.exists(&format!("{}{}", KEY_PREFIX, key_id))
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let keys = self.store.list(KEY_PREFIX)?;
        Ok(
            keys.into_iter()
                .map(|key| key[KEY_PREFIX.len()..].to_string())
                .collect()
        )
    }

    /// Metadata projection. Falls back to the bundle itself when the
    /// projection record is missing, so stores written by older nodes stay
    /// readable.
    pub fn metadata(&self, key_id: &str) -> Result<KeyMetadata> {
        let meta_key = format!("{}{}", META_PREFIX, key_id);
        match self.store.load(&meta_key) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(Error::NotFound(_)) => Ok(self.get(key_id)?.metadata()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::MemoryKv;
    use chrono::Utc;

    fn key_store() -> KeyStore {
        let inner: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        KeyStore::new(Arc::new(EncryptedKv::open(inner, "password").unwrap()))
    }

    fn bundle(key_id: &str) -> KeyShareBundle {
        KeyShareBundle {
            key_id: key_id.to_string(),
            moniker: "treasury".to_string(),
            threshold: 1,
            participants: vec!["p1".into(), "p2".into(), "p3".into()],
            public_key_hex: "04deadbeef".to_string(),
            created_at: Utc::now(),
            share_blob: base64::encode(b"opaque library state"),
        }
    }

    #[test]
    fn put_get_round_trip() {
        let store = key_store();
        store.put(&bundle("k1")).unwrap();
        let loaded = store.get("k1").unwrap();
        assert_eq!(loaded.threshold, 1);
        assert_eq!(loaded.share_bytes().unwrap(), b"opaque library state");
    }

    #[test]
    fn missing_key_is_unknown_key() {
        let store = key_store();
        assert!(matches!(store.get("absent"), Err(Error::UnknownKey(_))));
    }

    #[test]
    fn second_write_for_same_key_id_conflicts() {
        let store = key_store();
        store.put(&bundle("k1")).unwrap();
        assert!(matches!(store.put(&bundle("k1")), Err(Error::Conflict(_))));
    }

    #[test]
    fn lists_key_ids_and_serves_metadata() {
        let store = key_store();
        store.put(&bundle("aaa")).unwrap();
        store.put(&bundle("bbb")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["aaa".to_string(), "bbb".to_string()]);

        let meta = store.metadata("aaa").unwrap();
        assert_eq!(meta.moniker, "treasury");
        assert_eq!(meta.participants.len(), 3);
    }
}
