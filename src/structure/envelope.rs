//! Price envelopes and their overlap relation

use super::consolidator::ConsolidatedBar;
use crate::types::PRICE_EPSILON;
use serde::{Deserialize, Serialize};

/// Closed price interval [low, high]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub high: f64,
    pub low: f64,
}

/// How two envelopes relate on the price axis.
///
/// Touching (a shared boundary with zero overlap) is distinct from
/// Intersecting and the two are never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeRelation {
    Disjoint,
    Touching,
    Intersecting,
}

impl EnvelopeRelation {
    /// Structural quality weight used by zone derivation and scoring
    pub fn weight(&self) -> f64 {
        match self {
            EnvelopeRelation::Disjoint => 1.0,
            EnvelopeRelation::Touching => 0.75,
            EnvelopeRelation::Intersecting => 0.5,
        }
    }
}

impl std::fmt::Display for EnvelopeRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeRelation::Disjoint => write!(f, "disjoint"),
            EnvelopeRelation::Touching => write!(f, "touching"),
            EnvelopeRelation::Intersecting => write!(f, "intersecting"),
        }
    }
}

impl Envelope {
    pub fn new(high: f64, low: f64) -> Self {
        Self { high, low }
    }

    /// Three-bar envelope around consolidated bar `index`
    pub fn around(bars: &[ConsolidatedBar], index: usize) -> Self {
        let from = index.saturating_sub(1);
        let to = (index + 1).min(bars.len().saturating_sub(1));
        Self::spanning(&bars[from..=to])
    }

    /// Envelope of a run of consolidated bars. An empty slice gives an empty interval.
    pub fn spanning(bars: &[ConsolidatedBar]) -> Self {
        bars.iter().fold(
            Envelope::new(f64::NEG_INFINITY, f64::INFINITY),
            |acc, b| Envelope::new(acc.high.max(b.high), acc.low.min(b.low)),
        )
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    /// Signed overlap: positive when intersecting, zero when touching
    pub fn overlap(&self, other: &Envelope) -> f64 {
        self.high.min(other.high) - self.low.max(other.low)
    }

    pub fn relation(&self, other: &Envelope) -> EnvelopeRelation {
        let overlap = self.overlap(other);
        if overlap > PRICE_EPSILON {
            EnvelopeRelation::Intersecting
        } else if overlap >= -PRICE_EPSILON {
            EnvelopeRelation::Touching
        } else {
            EnvelopeRelation::Disjoint
        }
    }
}
