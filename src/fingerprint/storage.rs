//! Binary storage for catalog fingerprints.
//!
//! File format: vectors.bin
//!
//! Header (48 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - metric: u8 (see `Metric::code`)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - item_id: u64 (little-endian)
//! - image_hash: u64 (little-endian)
//! - fingerprint: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::fingerprint::embeddings::Fingerprint;
use crate::fingerprint::index::{Metric, VectorEntry, VectorIndex};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + metric(1) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 48;

/// Offset of the checksum field
const CHECKSUM_OFFSET: usize = 44;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Metric mismatch: expected {expected}, file has code {got}")]
    MetricMismatch { expected: &'static str, got: u8 },

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Storage manager for catalog fingerprints.
pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the fingerprint index from storage.
    ///
    /// Fails if the file was written for another model, metric or
    /// dimensionality, or if the header checksum does not match.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_metric: Metric,
        expected_dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = self.read_header(&mut reader)?;
        self.validate_header(&header, expected_model_id, expected_metric, expected_dimensions)?;

        let mut index = VectorIndex::with_capacity(
            header.dimensions as usize,
            expected_metric,
            header.entry_count as usize,
        );

        for _ in 0..header.entry_count {
            let (id, image_hash, values) =
                self.read_entry(&mut reader, header.dimensions as usize)?;
            if let Err(e) = index.insert(id, image_hash, Fingerprint::new(values)) {
                log::warn!("skipping stored fingerprint item={id}: {e}");
            }
        }

        Ok(index)
    }

    /// Save the fingerprint index to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, index, model_id);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Delete the storage file if it exists.
    pub fn delete(&self) -> Result<(), VectorStorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the header",
                index.dimensions()
            ))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            metric: index.metric().code(),
            dimensions,
            entry_count: index.len() as u64,
        };
        self.write_header(&mut writer, &header)?;

        // sorted so identical indexes produce identical files
        let mut entries: Vec<(u64, &VectorEntry)> = index.iter().collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        for (id, entry) in entries {
            self.write_entry(&mut writer, id, entry)?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(&self, reader: &mut impl Read) -> Result<Header, VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];
        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(
            header_bytes[CHECKSUM_OFFSET..HEADER_SIZE]
                .try_into()
                .map_err(|_| VectorStorageError::InvalidFormat("short checksum".to_string()))?,
        );
        let computed_checksum = crc32fast::hash(&header_bytes[0..CHECKSUM_OFFSET]);
        if stored_checksum != computed_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        let metric = header_bytes[33];
        let dimensions = u16::from_le_bytes([header_bytes[34], header_bytes[35]]);
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&header_bytes[36..44]);
        let entry_count = u64::from_le_bytes(count_bytes);

        Ok(Header {
            version,
            model_id,
            metric,
            dimensions,
            entry_count,
        })
    }

    fn validate_header(
        &self,
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_metric: Metric,
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        if Metric::from_code(header.metric) != Some(expected_metric) {
            return Err(VectorStorageError::MetricMismatch {
                expected: expected_metric.name(),
                got: header.metric,
            });
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    fn write_header(&self, writer: &mut impl Write, header: &Header) -> Result<(), VectorStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33] = header.metric;
        header_bytes[34..36].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[36..44].copy_from_slice(&header.entry_count.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..CHECKSUM_OFFSET]);
        header_bytes[CHECKSUM_OFFSET..HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_entry(
        &self,
        reader: &mut impl Read,
        dimensions: usize,
    ) -> Result<(u64, u64, Vec<f32>), VectorStorageError> {
        let mut word = [0u8; 8];
        reader.read_exact(&mut word)?;
        let id = u64::from_le_bytes(word);

        reader.read_exact(&mut word)?;
        let image_hash = u64::from_le_bytes(word);

        let mut values = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            let mut float_bytes = [0u8; 4];
            reader.read_exact(&mut float_bytes)?;
            values.push(f32::from_le_bytes(float_bytes));
        }

        Ok((id, image_hash, values))
    }

    fn write_entry(
        &self,
        writer: &mut impl Write,
        id: u64,
        entry: &VectorEntry,
    ) -> Result<(), VectorStorageError> {
        writer.write_all(&id.to_le_bytes())?;
        writer.write_all(&entry.image_hash.to_le_bytes())?;

        for &value in entry.fingerprint.as_slice() {
            writer.write_all(&value.to_le_bytes())?;
        }

        Ok(())
    }
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    metric: u8,
    dimensions: u16,
    entry_count: u64,
}
