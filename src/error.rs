//! Error types for the structure pipeline

use crate::types::{ContextKey, RawBarId};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Pipeline stage that owns an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Stage {
    Consolidation,
    Fractal,
    Swing,
    Trend,
    KeyZone,
    Scoring,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Consolidation => write!(f, "consolidation"),
            Stage::Fractal => write!(f, "fractal"),
            Stage::Swing => write!(f, "swing"),
            Stage::Trend => write!(f, "trend"),
            Stage::KeyZone => write!(f, "keyzone"),
            Stage::Scoring => write!(f, "scoring"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StructureError {
    #[error(
        "input ordering violation on {key}: bar #{sequence} at {timestamp} follows bar #{previous_sequence} at {previous_timestamp}"
    )]
    InputOrdering {
        key: ContextKey,
        sequence: RawBarId,
        timestamp: DateTime<Utc>,
        previous_sequence: RawBarId,
        previous_timestamp: DateTime<Utc>,
    },

    #[error("invalid bar #{sequence} on {key}: {detail}")]
    InvalidBar {
        key: ContextKey,
        sequence: RawBarId,
        detail: String,
    },

    #[error("configuration rejected at {parameter}{}: {reason}", overlay_suffix(.overlay))]
    ConfigValidation {
        parameter: String,
        overlay: Option<String>,
        reason: String,
    },

    #[error("{stage} invariant violated on entities {entity_ids:?}: {detail}")]
    StateInvariant {
        stage: Stage,
        entity_ids: Vec<u64>,
        detail: String,
    },

    #[error("context {key} is halted: {cause}")]
    ContextHalted { key: ContextKey, cause: String },

    #[error("context {key} is not registered")]
    UnknownContext { key: ContextKey },
}

impl StructureError {
    pub fn invariant(stage: Stage, entity_ids: Vec<u64>, detail: impl Into<String>) -> Self {
        StructureError::StateInvariant {
            stage,
            entity_ids,
            detail: detail.into(),
        }
    }

    pub fn config(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        StructureError::ConfigValidation {
            parameter: parameter.into(),
            overlay: None,
            reason: reason.into(),
        }
    }

    /// Attach the overlay key a configuration error came from
    pub fn in_overlay(self, overlay: &str) -> Self {
        match self {
            StructureError::ConfigValidation {
                parameter, reason, ..
            } => StructureError::ConfigValidation {
                parameter,
                overlay: Some(overlay.to_string()),
                reason,
            },
            other => other,
        }
    }

    /// Invariant violations are fatal for the context that raised them
    pub fn is_fatal(&self) -> bool {
        matches!(self, StructureError::StateInvariant { .. })
    }
}

fn overlay_suffix(overlay: &Option<String>) -> String {
    overlay
        .as_ref()
        .map(|o| format!(" (overlay '{}')", o))
        .unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, StructureError>;
