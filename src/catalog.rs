use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::storage::StorageManager;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog item {0} not found")]
    NotFound(u64),

    #[error("catalog item {0} has no image")]
    NoImage(u64),

    #[error("catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed catalog record: {0}")]
    Malformed(String),

    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// A cataloged release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: u64,
    /// Artist or collection this item belongs to
    pub parent_id: Option<u64>,
    pub title: String,
    /// File name under the media directory
    pub image: Option<String>,
    /// Unix millis
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CatalogItemCreate {
    pub parent_id: Option<u64>,
    pub title: String,
    pub image: Option<String>,
}

pub trait CatalogManager: Send + Sync {
    fn get(&self, id: u64) -> Result<Option<CatalogItem>, CatalogError>;
    fn list(&self) -> Result<Vec<CatalogItem>, CatalogError>;
    fn create(&self, item: CatalogItemCreate) -> Result<CatalogItem, CatalogError>;
    /// Point an item at a new image; returns the updated item.
    fn set_image(&self, id: u64, image: &str) -> Result<CatalogItem, CatalogError>;
    /// Returns whether the item existed.
    fn delete(&self, id: u64) -> Result<bool, CatalogError>;
    /// Run `f` on an item while it is held against deletion. Returns
    /// whether the item exists; `f` only runs if it does.
    fn with_item(&self, id: u64, f: &mut dyn FnMut(&CatalogItem)) -> Result<bool, CatalogError>;
    /// Current image bytes of an item.
    fn image_bytes(&self, id: u64) -> Result<Vec<u8>, CatalogError>;
}

const CSV_HEADERS: [&str; 6] = ["id", "parent_id", "title", "image", "created_at", "updated_at"];

/// Catalog kept in a CSV file, images in a media store.
pub struct BackendCsv {
    list: Arc<RwLock<Vec<CatalogItem>>>,
    path: PathBuf,
    media: Box<dyn StorageManager>,
}

impl BackendCsv {
    pub fn load(path: &Path, media: Box<dyn StorageManager>) -> Result<Self, CatalogError> {
        if let Err(err) = std::fs::metadata(path) {
            match err.kind() {
                ErrorKind::NotFound => {
                    log::info!("Creating new catalog at {}", path.display());
                    let mut csv_wrt = csv::Writer::from_path(path)?;
                    csv_wrt.write_record(CSV_HEADERS)?;
                    csv_wrt.flush()?;
                }
                _ => Err(err)?,
            }
        }

        let now = Instant::now();
        let mut csv_reader = csv::Reader::from_path(path)?;

        let mut items = vec![];
        for record in csv_reader.records() {
            let record = record?;

            let id = field(&record, 0, "id")?
                .parse::<u64>()
                .map_err(|e| CatalogError::Malformed(format!("id: {e}")))?;
            let parent_id = match field(&record, 1, "parent_id")? {
                "" => None,
                s => Some(
                    s.parse::<u64>()
                        .map_err(|e| CatalogError::Malformed(format!("parent_id of {id}: {e}")))?,
                ),
            };
            let title = field(&record, 2, "title")?.to_string();
            let image = match field(&record, 3, "image")? {
                "" => None,
                s => Some(s.to_string()),
            };
            let created_at = field(&record, 4, "created_at")?.parse::<i64>().unwrap_or_default();
            let updated_at = field(&record, 5, "updated_at")?.parse::<i64>().unwrap_or(created_at);

            items.push(CatalogItem {
                id,
                parent_id,
                title,
                image,
                created_at,
                updated_at,
            });
        }

        log::debug!(
            "took {}ms to read catalog csv",
            now.elapsed().as_micros() as f64 / 1000.0
        );

        Ok(BackendCsv {
            list: Arc::new(RwLock::new(items)),
            path: path.to_path_buf(),
            media,
        })
    }

    fn read_list(&self) -> Result<RwLockReadGuard<'_, Vec<CatalogItem>>, CatalogError> {
        self.list
            .read()
            .map_err(|e| CatalogError::Unavailable(e.to_string()))
    }

    fn write_list(&self) -> Result<RwLockWriteGuard<'_, Vec<CatalogItem>>, CatalogError> {
        self.list
            .write()
            .map_err(|e| CatalogError::Unavailable(e.to_string()))
    }

    fn save(&self, items: &[CatalogItem]) -> Result<(), CatalogError> {
        let temp_path = self.path.with_extension("csv-tmp");
        let mut csv_wrt = csv::Writer::from_path(&temp_path)?;
        csv_wrt.write_record(CSV_HEADERS)?;
        for item in items {
            csv_wrt.write_record([
                item.id.to_string(),
                item.parent_id.map(|p| p.to_string()).unwrap_or_default(),
                item.title.clone(),
                item.image.clone().unwrap_or_default(),
                item.created_at.to_string(),
                item.updated_at.to_string(),
            ])?;
        }
        csv_wrt.flush()?;
        drop(csv_wrt);
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    pub fn media(&self) -> &dyn StorageManager {
        self.media.as_ref()
    }
}

fn field<'r>(
    record: &'r csv::StringRecord,
    idx: usize,
    name: &str,
) -> Result<&'r str, CatalogError> {
    record
        .get(idx)
        .ok_or_else(|| CatalogError::Malformed(format!("missing {name}")))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl CatalogManager for BackendCsv {
    fn get(&self, id: u64) -> Result<Option<CatalogItem>, CatalogError> {
        Ok(self.read_list()?.iter().find(|i| i.id == id).cloned())
    }

    fn list(&self) -> Result<Vec<CatalogItem>, CatalogError> {
        Ok(self.read_list()?.clone())
    }

    fn create(&self, create: CatalogItemCreate) -> Result<CatalogItem, CatalogError> {
        let mut items = self.write_list()?;
        let id = items.iter().map(|i| i.id + 1).max().unwrap_or(0);
        let now = now_ms();

        let item = CatalogItem {
            id,
            parent_id: create.parent_id,
            title: create.title,
            image: create.image,
            created_at: now,
            updated_at: now,
        };

        items.push(item.clone());
        self.save(&items)?;

        Ok(item)
    }

    fn set_image(&self, id: u64, image: &str) -> Result<CatalogItem, CatalogError> {
        let mut items = self.write_list()?;
        let item = items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(CatalogError::NotFound(id))?;

        item.image = Some(image.to_string());
        item.updated_at = now_ms();
        let updated = item.clone();

        self.save(&items)?;
        Ok(updated)
    }

    fn delete(&self, id: u64) -> Result<bool, CatalogError> {
        let mut items = self.write_list()?;
        let Some(idx) = items.iter().position(|i| i.id == id) else {
            return Ok(false);
        };

        items.remove(idx);
        self.save(&items)?;
        Ok(true)
    }

    fn with_item(&self, id: u64, f: &mut dyn FnMut(&CatalogItem)) -> Result<bool, CatalogError> {
        let items = self.read_list()?;
        match items.iter().find(|i| i.id == id) {
            Some(item) => {
                f(item);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn image_bytes(&self, id: u64) -> Result<Vec<u8>, CatalogError> {
        let item = self.get(id)?.ok_or(CatalogError::NotFound(id))?;
        let image = item.image.ok_or(CatalogError::NoImage(id))?;
        Ok(self.media.read(&image)?)
    }
}
