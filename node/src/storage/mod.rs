pub mod encrypted;
pub mod key_store;
pub mod kv;

pub use encrypted::EncryptedKv;
pub use key_store::KeyStore;
pub use kv::{ FileKv, KvStore, MemoryKv };

/// Persisted layout prefixes under the encrypted store.
pub const OPERATION_PREFIX: &str = "op/";
pub const KEY_PREFIX: &str = "key/";
pub const META_PREFIX: &str = "meta/";
pub const SYSTEM_PREFIX: &str = "sys/";
