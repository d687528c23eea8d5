//! Scoring - layered supply/demand score over the structural state
//!
//! - Nine bounded factors in three layers
//! - Profile documents with timeframe/symbol overlays
//! - Stage classification

pub mod config;
pub mod factors;
pub mod scorer;

pub use config::{
    FactorPatch, FactorSetting, LayerWeights, ProfileDocument, ProfileStore, ScoringConfig, ScoringPatch,
    StageThresholds,
};
pub use factors::{FactorId, Layer, StructuralWindow};
pub use scorer::{score, FactorContribution, LayerScores, StructureStage, SupplyDemandResult};
