//! Commit notifications

use crate::error::Stage;
use crate::scoring::SupplyDemandResult;
use crate::structure::keyzone::ZoneSignal;
use crate::types::{ConsolidatedBarId, ContextKey, KeyZoneId, RawBarId, SwingId, TrendId};
use serde::{Deserialize, Serialize};

/// Earliest entity a commit revised instead of appending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backtrack {
    pub stage: Stage,
    pub from_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDelta {
    pub appended: Vec<u64>,
    pub revised: Vec<u64>,
}

impl StageDelta {
    pub fn is_empty(&self) -> bool {
        self.appended.is_empty() && self.revised.is_empty()
    }
}

/// Emitted once per committed raw bar, in commit order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeEvent {
    pub key: ContextKey,
    pub commit_seq: u64,
    pub raw_id: RawBarId,
    /// Consolidated bars opened or extended
    pub consolidated: StageDelta,
    /// Fractals confirmed, tentative labels revised
    pub fractals: StageDelta,
    /// Swings sealed, swing under construction changed
    pub swings: StageDelta,
    /// Trends started, trends extended
    pub trends: StageDelta,
    pub completed_trends: Vec<TrendId>,
    /// Zones created, zones touched
    pub zones: StageDelta,
    pub backtrack: Option<Backtrack>,
    pub signal: Option<ZoneSignal>,
    pub score: SupplyDemandResult,
}

impl CascadeEvent {
    pub fn new_consolidated(&self) -> Option<ConsolidatedBarId> {
        self.consolidated.appended.first().copied()
    }

    pub fn sealed_swings(&self) -> &[SwingId] {
        &self.swings.appended
    }

    pub fn created_zones(&self) -> &[KeyZoneId] {
        &self.zones.appended
    }
}
