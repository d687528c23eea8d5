//! Structure - the layered market structure stages
//!
//! Each stage consumes the output of the one before it:
//! - Bar consolidation by containment
//! - Fractal (turning point) detection
//! - Swing construction with delayed confirmation
//! - Trend aggregation
//! - Key zone derivation and interaction classification

pub mod consolidator;
pub mod envelope;
pub mod fractal;
pub mod swing;
pub mod trend;
pub mod keyzone;
pub mod invariants;

// Re-export commonly used types
pub use consolidator::{BarConsolidator, ConsolidatedBar, ConsolidationChange};
pub use envelope::{Envelope, EnvelopeRelation};
pub use fractal::{Fractal, FractalCandidate, FractalDetector, FractalKind, FractalLabel, LabelStatus};
pub use swing::{Swing, SwingBuilder, SwingState, SwingUpdate};
pub use trend::{Trend, TrendAggregator, TrendCompletion, TrendUpdate};
pub use keyzone::{KeyZone, KeyZoneDeriver, ZoneBehavior, ZoneRole, ZoneSignal, ZoneSource, ZoneTouch, ZoneUpdate};
