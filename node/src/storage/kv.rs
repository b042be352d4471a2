use crate::error::{ Error, Result };
use std::collections::BTreeMap;
use std::fs;
use std::path::{ Path, PathBuf };
use std::sync::RwLock;

/// Interface to the raw byte store underneath the encryption layer. The
/// production deployment backs this with an embedded key-value database;
/// the implementations here cover single-node installs and tests. Keys are
/// printable strings, values arbitrary bytes, and `list` is a prefix scan.
pub trait KvStore: Send + Sync {
    fn save(&self, key: &str, value: &[u8]) -> Result<()>;
    fn load(&self, key: &str) -> Result<Vec<u8>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
    fn exists(&self, key: &str) -> Result<bool>;
    fn close(&self) -> Result<()>;
}

/// In-memory store for tests and recovery drills.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().expect("kv lock");
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.entries.read().expect("kv lock");
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().expect("kv lock");
        entries.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().expect("kv lock");
        Ok(
            entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect()
        )
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let entries = self.entries.read().expect("kv lock");
        Ok(entries.contains_key(key))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One-file-per-key store. Key strings are hex-encoded into file names so
/// slashes and other separators in logical keys never touch the directory
/// structure.
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.kv", hex::encode(key.as_bytes())))
    }

    fn key_from_path(path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

impl KvStore for FileKv {
    fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        fs::write(self.path_for(key), value)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Vec<u8>> {
        match fs::read(self.path_for(key)) {
            Ok(value) => Ok(value),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(key) = Self::key_from_path(&entry.path()) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key).exists())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
