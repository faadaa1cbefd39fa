//! In-memory fingerprint index with exact nearest-neighbor search.
//!
//! Stores one fingerprint per catalog item and ranks items by distance to a
//! query fingerprint.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::fingerprint::embeddings::Fingerprint;

/// Distance metric, fixed for the life of a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// 1 - cosine similarity, in [0.0, 2.0]
    #[default]
    Cosine,
}

impl Metric {
    /// Stable on-disk code
    pub fn code(self) -> u8 {
        match self {
            Metric::Cosine => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Metric::Cosine),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
        }
    }

    /// Largest distance the metric can produce
    pub fn max_distance(self) -> f32 {
        match self {
            Metric::Cosine => 2.0,
        }
    }
}

/// An entry in the fingerprint index.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    /// Hash of the image the fingerprint was computed from
    pub image_hash: u64,
    pub fingerprint: Fingerprint,
    norm: f32,
}

/// A ranked search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub item_id: u64,
    pub distance: f32,
}

/// Item ID -> fingerprint, searched by exhaustive scan.
pub struct VectorIndex {
    entries: HashMap<u64, VectorEntry>,
    dimensions: usize,
    metric: Metric,
}

impl VectorIndex {
    pub fn new(dimensions: usize, metric: Metric) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
            metric,
        }
    }

    pub fn with_capacity(dimensions: usize, metric: Metric, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
            metric,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the fingerprint of an item.
    ///
    /// Rejects wrong dimensionality, non-finite values and zero-norm vectors.
    pub fn insert(
        &mut self,
        item_id: u64,
        image_hash: u64,
        fingerprint: Fingerprint,
    ) -> Result<(), IndexError> {
        let norm = self.check_vector(fingerprint.as_slice())?;

        self.entries.insert(
            item_id,
            VectorEntry {
                image_hash,
                fingerprint,
                norm,
            },
        );

        Ok(())
    }

    pub fn remove(&mut self, item_id: u64) -> Option<VectorEntry> {
        self.entries.remove(&item_id)
    }

    /// Put back an entry previously taken out with `remove`.
    pub fn restore(&mut self, item_id: u64, entry: VectorEntry) {
        self.entries.insert(item_id, entry);
    }

    pub fn get(&self, item_id: u64) -> Option<&VectorEntry> {
        self.entries.get(&item_id)
    }

    pub fn contains(&self, item_id: u64) -> bool {
        self.entries.contains_key(&item_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &VectorEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Return the `k` nearest items to `query`.
    ///
    /// Results are ordered by ascending distance, ties broken by ascending
    /// item id. Fewer than `k` results come back only when the index holds
    /// fewer than `k` items.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, IndexError> {
        let query_norm = self.check_vector(query)?;

        if k == 0 || self.entries.is_empty() {
            return Ok(vec![]);
        }

        let mut results: Vec<Neighbor> = self
            .entries
            .iter()
            .map(|(id, entry)| Neighbor {
                item_id: *id,
                distance: self.distance(query, query_norm, entry),
            })
            .collect();

        if k < results.len() {
            results.select_nth_unstable_by(k - 1, rank);
            results.truncate(k);
        }
        results.sort_unstable_by(rank);

        Ok(results)
    }

    fn distance(&self, query: &[f32], query_norm: f32, entry: &VectorEntry) -> f32 {
        match self.metric {
            Metric::Cosine => {
                let dot: f32 = query
                    .iter()
                    .zip(entry.fingerprint.as_slice())
                    .map(|(a, b)| a * b)
                    .sum();
                let similarity = dot / (query_norm * entry.norm);
                (1.0 - similarity).clamp(0.0, self.metric.max_distance())
            }
        }
    }

    /// Validate a vector and return its L2 norm.
    fn check_vector(&self, v: &[f32]) -> Result<f32, IndexError> {
        if v.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: v.len(),
            });
        }

        if v.iter().any(|x| !x.is_finite()) {
            return Err(IndexError::NonFinite);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        Ok(norm)
    }

    /// Clear all entries from the index.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Ascending distance, then ascending item id.
fn rank(a: &Neighbor, b: &Neighbor) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.item_id.cmp(&b.item_id))
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Vector contains NaN or infinite values")]
    NonFinite,
}
