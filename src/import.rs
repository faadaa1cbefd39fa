//! Bulk import of releases from a CSV that lists one cover file per row.
//!
//! Expected columns are `Ground Truth` (cover file, relative to the CSV),
//! `Release` and `Artist`. Other columns are ignored.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ingest::IngestReport;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("malformed import file: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImportRow {
    #[serde(rename = "Ground Truth", default)]
    pub image: String,
    #[serde(rename = "Release", default)]
    pub release: String,
    #[serde(rename = "Artist", default)]
    pub artist: String,
}

impl ImportRow {
    /// Name of the first required column left blank.
    pub fn missing_column(&self) -> Option<&'static str> {
        if self.image.is_empty() {
            Some("Ground Truth")
        } else if self.release.is_empty() {
            Some("Release")
        } else if self.artist.is_empty() {
            Some("Artist")
        } else {
            None
        }
    }
}

/// A parsed import file. Rows carry their line number in the file.
#[derive(Debug)]
pub struct ImportFile {
    pub base_dir: PathBuf,
    pub rows: Vec<(u64, ImportRow)>,
}

impl ImportFile {
    pub fn read(path: &Path) -> Result<Self, ImportError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)?;
        let headers = reader.headers()?.clone();

        let mut rows = vec![];
        for record in reader.records() {
            let record = record?;
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            let row: ImportRow = record.deserialize(Some(&headers))?;
            rows.push((line, row));
        }

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Ok(Self { base_dir, rows })
    }

    pub fn image_path(&self, row: &ImportRow) -> PathBuf {
        self.base_dir.join(&row.image)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RowStatus {
    Created { item_id: u64 },
    /// The artist already has a release with this title
    Exists { item_id: u64 },
    Skipped { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowReport {
    pub line: u64,
    pub artist: String,
    pub release: String,
    #[serde(flatten)]
    pub status: RowStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub rows: Vec<RowReport>,
    pub ingest: IngestReport,
}

impl ImportReport {
    pub fn created(&self) -> impl Iterator<Item = u64> + '_ {
        self.rows.iter().filter_map(|row| match row.status {
            RowStatus::Created { item_id } => Some(item_id),
            _ => None,
        })
    }

    pub fn skipped(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| matches!(row.status, RowStatus::Skipped { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_rows_with_extra_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("releases.csv");
        std::fs::write(
            &path,
            "Ground Truth,Release,Artist,Released\n\
             covers/kob.jpg, Kind of Blue ,Miles Davis,1959-08\n\
             covers/gs.jpg,Giant Steps,,1960-01\n",
        )
        .unwrap();

        let file = ImportFile::read(&path).unwrap();

        assert_eq!(file.rows.len(), 2);
        let (line, row) = &file.rows[0];
        assert_eq!(*line, 2);
        assert_eq!(row.release, "Kind of Blue");
        assert_eq!(row.missing_column(), None);
        assert_eq!(file.image_path(row), dir.path().join("covers/kob.jpg"));
        assert_eq!(file.rows[1].1.missing_column(), Some("Artist"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ImportFile::read(&dir.path().join("absent.csv"));
        assert!(matches!(result, Err(ImportError::Csv(_))));
    }
}
