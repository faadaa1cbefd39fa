//! Turning ranked neighbors into a match decision.
//!
//! Distances are compared against two thresholds (`high` < `low`, smaller
//! is closer):
//! - best <= `high`: definite, one candidate
//! - best <= `low`: ambiguous, the first `ambiguous_set_size` candidates
//! - otherwise: none, empty or weak suggestions depending on config

use serde::{Deserialize, Serialize};

use crate::config::MatchingConfig;
use crate::fingerprint::Neighbor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Definite,
    Ambiguous,
    None,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Definite => "definite",
            Decision::Ambiguous => "ambiguous",
            Decision::None => "none",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub item_id: u64,
    pub distance: f32,
}

impl From<Neighbor> for Candidate {
    fn from(n: Neighbor) -> Self {
        Self {
            item_id: n.item_id,
            distance: n.distance,
        }
    }
}

/// Parameters a decision was made with; stored alongside every result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub high: f32,
    pub low: f32,
    pub ambiguous_set_size: usize,
    pub weak_suggestions: bool,
}

impl From<&MatchingConfig> for Thresholds {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            high: config.high,
            low: config.low,
            ambiguous_set_size: config.ambiguous_set_size,
            weak_suggestions: config.weak_suggestions,
        }
    }
}

/// Hashable form of `Thresholds`, with the cut-offs compared bit for bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThresholdsKey {
    high: u32,
    low: u32,
    ambiguous_set_size: usize,
    weak_suggestions: bool,
}

impl Thresholds {
    pub fn key(&self) -> ThresholdsKey {
        ThresholdsKey {
            high: self.high.to_bits(),
            low: self.low.to_bits(),
            ambiguous_set_size: self.ambiguous_set_size,
            weak_suggestions: self.weak_suggestions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub decision: Decision,
    /// Ascending by distance, ties by item id
    pub candidates: Vec<Candidate>,
    pub thresholds: Thresholds,
}

impl MatchResult {
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn references(&self, item_id: u64) -> bool {
        self.candidates.iter().any(|c| c.item_id == item_id)
    }

    pub fn item_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.candidates.iter().map(|c| c.item_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    thresholds: Thresholds,
}

impl MatchPolicy {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        Self::new(config.into())
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Decide on neighbors ranked ascending by (distance, item id).
    ///
    /// An empty list (empty catalog) is always `none`.
    pub fn decide(&self, ranked: &[Neighbor]) -> MatchResult {
        let t = self.thresholds;
        let top = |n: usize| -> Vec<Candidate> {
            ranked.iter().take(n).copied().map(Candidate::from).collect()
        };

        let (decision, candidates) = match ranked.first() {
            None => (Decision::None, vec![]),
            Some(best) if best.distance <= t.high => (Decision::Definite, top(1)),
            Some(best) if best.distance <= t.low => {
                (Decision::Ambiguous, top(t.ambiguous_set_size))
            }
            Some(_) if t.weak_suggestions => (Decision::None, top(t.ambiguous_set_size)),
            Some(_) => (Decision::None, vec![]),
        };

        MatchResult {
            decision,
            candidates,
            thresholds: t,
        }
    }
}
