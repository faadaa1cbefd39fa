use std::path::{Path, PathBuf};

/// Flat key -> bytes storage. Writes are atomic: readers see either the old
/// or the new contents of a key, never a partial write.
pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> std::io::Result<()>;
    fn list(&self) -> Vec<String>;
}

#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }

    fn path_of(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.path_of(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path_of(ident))
    }

    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.path_of(ident);
        let temp_path = self.base_dir.join(format!(
            ".{}-{ident}.tmp",
            rusty_ulid::generate_ulid_string()
        ));

        if let Err(e) = std::fs::write(&temp_path, data) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &path)
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.path_of(ident)) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn list(&self) -> Vec<String> {
        std::fs::read_dir(&self.base_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        let path = entry.path();
                        if path.is_file() {
                            path.file_name()
                                .and_then(|name| name.to_str())
                                .filter(|name| !name.starts_with('.'))
                                .map(|s| s.to_string())
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(dir.path().join("nested")).unwrap();

        assert!(!store.exists("a.json"));
        store.write("a.json", b"one").unwrap();
        store.write("a.json", b"two").unwrap();
        assert_eq!(store.read("a.json").unwrap(), b"two");

        store.delete("a.json").unwrap();
        assert!(!store.exists("a.json"));
        // deleting a missing key is not an error
        store.delete("a.json").unwrap();
    }

    #[test]
    fn test_list_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(dir.path()).unwrap();

        store.write("x", b"1").unwrap();
        store.write("y", b"2").unwrap();
        std::fs::write(dir.path().join(".partial.tmp"), b"junk").unwrap();

        let mut names = store.list();
        names.sort();
        assert_eq!(names, vec!["x".to_string(), "y".to_string()]);
    }
}
