// Library crate - exports the structure stages, scoring and the context engine

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod structure;
pub mod scoring;
pub mod engine;

// Re-export commonly used types
pub use types::*;
pub use error::{Result, Stage, StructureError};
pub use config::StructureConfig;
pub use engine::{CascadeEvent, ContextRegistry, PipelineContext, StructureSnapshot};
pub use scoring::{ProfileStore, ScoringConfig, StructureStage, SupplyDemandResult};
