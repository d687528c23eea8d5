//! Structural parameters for swings, trends and key zones
//!
//! Scoring weights live in `scoring::config` because they are resolved per
//! context through profile overlays; these parameters apply to a whole registry.

use crate::error::{Result, StructureError};
use serde::{Deserialize, Serialize};

/// Swing leg validation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwingConfig {
    /// Minimum consolidated-bar distance between the two fractals of a leg (default: 4)
    pub min_fractal_gap: usize,
    /// Distance required when the fractal envelopes intersect (default: 5)
    pub overlap_fractal_gap: usize,
    /// Leg range relative to the previous swing required when envelopes intersect (default: 0.6)
    pub overlap_distance_ratio: f64,
}

impl Default for SwingConfig {
    fn default() -> Self {
        Self {
            min_fractal_gap: 4,
            overlap_fractal_gap: 5,
            overlap_distance_ratio: 0.6,
        }
    }
}

/// Trend aggregation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrendConfig {
    /// Max countertrend retracement of the trend range still treated as a pullback (default: 0.618)
    pub retracement_threshold: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            retracement_threshold: 0.618,
        }
    }
}

/// How far a candidate zone extends from its structural extremum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneOffset {
    /// Fraction of the source swing/trend range
    RangeFraction(f64),
    /// Fixed price distance
    Absolute(f64),
}

impl ZoneOffset {
    pub fn width_for(&self, source_range: f64) -> f64 {
        match *self {
            ZoneOffset::RangeFraction(fraction) => fraction * source_range,
            ZoneOffset::Absolute(points) => points,
        }
    }
}

/// Key zone derivation and interaction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZoneConfig {
    /// Candidate zone width basis (default: 15% of the source range)
    pub offset: ZoneOffset,
    /// Number of most recent zones evaluated against new bars (default: 10)
    pub max_active_zones: usize,
    /// Close distance beyond the far side, in zone widths, for a strong accept (default: 0.5)
    pub strong_margin: f64,
    /// Penetration depth, in zone widths, for a strong reject (default: 0.5)
    pub strong_penetration: f64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            offset: ZoneOffset::RangeFraction(0.15),
            max_active_zones: 10,
            strong_margin: 0.5,
            strong_penetration: 0.5,
        }
    }
}

/// Parameters for every structural stage of a context
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StructureConfig {
    pub swing: SwingConfig,
    pub trend: TrendConfig,
    pub zones: ZoneConfig,
}

impl StructureConfig {
    /// Parse and validate a JSON document; missing sections take defaults
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: StructureConfig = serde_json::from_str(text)
            .map_err(|e| StructureError::config("structure", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.swing.min_fractal_gap < 2 {
            return Err(StructureError::config(
                "swing.min_fractal_gap",
                "must be at least 2",
            ));
        }
        if self.swing.overlap_fractal_gap < self.swing.min_fractal_gap {
            return Err(StructureError::config(
                "swing.overlap_fractal_gap",
                "must not be below swing.min_fractal_gap",
            ));
        }
        check_ratio("swing.overlap_distance_ratio", self.swing.overlap_distance_ratio, 0.0, 10.0)?;
        check_ratio("trend.retracement_threshold", self.trend.retracement_threshold, 0.0, 1.0)?;
        match self.zones.offset {
            ZoneOffset::RangeFraction(f) => check_ratio("zones.offset.range_fraction", f, 0.0, 1.0)?,
            ZoneOffset::Absolute(p) => {
                if !p.is_finite() || p <= 0.0 {
                    return Err(StructureError::config(
                        "zones.offset.absolute",
                        "must be a positive price distance",
                    ));
                }
            }
        }
        if self.zones.max_active_zones == 0 {
            return Err(StructureError::config(
                "zones.max_active_zones",
                "must be at least 1",
            ));
        }
        check_ratio("zones.strong_margin", self.zones.strong_margin, 0.0, 10.0)?;
        check_ratio("zones.strong_penetration", self.zones.strong_penetration, 0.0, 10.0)?;
        Ok(())
    }
}

fn check_ratio(parameter: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value <= min || value > max {
        return Err(StructureError::config(
            parameter,
            format!("{} is outside ({}, {}]", value, min, max),
        ));
    }
    Ok(())
}
