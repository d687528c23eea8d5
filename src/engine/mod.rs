//! Engine - per-context orchestration of the structure cascade

pub mod context;
pub mod events;
pub mod registry;

pub use context::{PipelineContext, StructureSnapshot, TimeframeAnalysis};
pub use events::{Backtrack, CascadeEvent, StageDelta};
pub use registry::{ContextRegistry, MultiTimeframeSnapshot};
