use crate::storage::StorageManager;

use super::{CacheEntry, CacheError};

const ENTRY_EXT: &str = ".json";

/// One JSON record per query key on a `StorageManager`.
pub struct DurableTier {
    storage: Box<dyn StorageManager>,
}

impl DurableTier {
    pub fn new(storage: Box<dyn StorageManager>) -> Self {
        Self { storage }
    }

    fn ident(key: &str) -> String {
        format!("{key}{ENTRY_EXT}")
    }

    /// Read an entry. Unreadable records are dropped and reported as a miss.
    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let ident = Self::ident(key);
        if !self.storage.exists(&ident) {
            return Ok(None);
        }

        let data = match self.storage.read(&ident) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<CacheEntry>(&data) {
            Ok(entry) if entry.key == key => Ok(Some(entry)),
            Ok(_) | Err(_) => {
                log::warn!("dropping unreadable cache record {ident}");
                self.storage.delete(&ident)?;
                Ok(None)
            }
        }
    }

    pub fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let data = serde_json::to_vec(entry)?;
        self.storage.write(&Self::ident(&entry.key), &data)?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.storage.delete(&Self::ident(key))?;
        Ok(())
    }

    /// Every readable record; used to rebuild the item index on startup.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.storage
            .list()
            .into_iter()
            .filter_map(|ident| ident.strip_suffix(ENTRY_EXT).map(str::to_string))
            .filter_map(|key| match self.get(&key) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("failed to read cache record key={key}: {e}");
                    None
                }
            })
            .collect()
    }
}
