//! Supply/demand scoring
//!
//! A pure function of the structural window and the resolved configuration.
//! Identical inputs always produce identical results.

use super::config::ScoringConfig;
use super::factors::{FactorId, Layer, StructuralWindow};
use crate::types::{Direction, RawBarId, PRICE_EPSILON};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StructureStage {
    /// No swing has been confirmed yet
    Unformed,
    Stable,
    Weakening,
    Critical,
    Failed,
}

impl std::fmt::Display for StructureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructureStage::Unformed => write!(f, "UNFORMED"),
            StructureStage::Stable => write!(f, "STABLE"),
            StructureStage::Weakening => write!(f, "WEAKENING"),
            StructureStage::Critical => write!(f, "CRITICAL"),
            StructureStage::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorContribution {
    pub factor: FactorId,
    pub layer: Layer,
    pub value: f64,
    pub weight: f64,
    pub enabled: bool,
    /// layer weight x factor weight x value, zero when disabled
    pub contribution: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerScores {
    pub price_action: f64,
    pub structure: f64,
    pub location: f64,
}

impl LayerScores {
    fn add(&mut self, layer: Layer, value: f64) {
        match layer {
            Layer::PriceAction => self.price_action += value,
            Layer::Structure => self.structure += value,
            Layer::Location => self.location += value,
        }
    }

    pub fn get(&self, layer: Layer) -> f64 {
        match layer {
            Layer::PriceAction => self.price_action,
            Layer::Structure => self.structure,
            Layer::Location => self.location,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyDemandResult {
    pub score: f64,
    pub stage: StructureStage,
    pub bias: Option<Direction>,
    pub layers: LayerScores,
    pub factors: Vec<FactorContribution>,
    /// Zone signal term added to the layered score
    pub keyzone_bias: f64,
    pub window_start_raw_id: Option<RawBarId>,
    pub window_end_raw_id: Option<RawBarId>,
    /// One-line summary: stage, bias, layer scores and the leading factor
    pub explanation: String,
}

pub fn stage_for(score: f64, formed: bool, config: &ScoringConfig) -> StructureStage {
    if !formed {
        return StructureStage::Unformed;
    }
    let magnitude = score.abs();
    let t = &config.thresholds;
    if magnitude >= t.stable {
        StructureStage::Stable
    } else if magnitude >= t.weakening {
        StructureStage::Weakening
    } else if magnitude >= t.critical {
        StructureStage::Critical
    } else {
        StructureStage::Failed
    }
}

fn explain(
    stage: StructureStage,
    bias: Option<Direction>,
    layers: &LayerScores,
    factors: &[FactorContribution],
    keyzone_bias: f64,
) -> String {
    let bias = bias.map_or_else(|| "FLAT".to_string(), |d| d.to_string());
    let mut text = format!("{} {}:", stage, bias);
    for layer in Layer::ALL {
        text.push_str(&format!(" {}={:+.3}", layer, layers.get(layer)));
    }
    text.push_str(&format!(" keyzone={:+.3}", keyzone_bias));
    let leader = factors
        .iter()
        .filter(|f| f.contribution != 0.0)
        .fold(None::<&FactorContribution>, |best, f| match best {
            Some(b) if b.contribution.abs() >= f.contribution.abs() => Some(b),
            _ => Some(f),
        });
    match leader {
        Some(f) => text.push_str(&format!("; led by {} ({:+.3})", f.factor.as_str(), f.contribution)),
        None => text.push_str("; no factor contributes"),
    }
    text
}

pub fn score(window: &StructuralWindow<'_>, config: &ScoringConfig) -> SupplyDemandResult {
    let mut layers = LayerScores::default();
    let mut factors = Vec::with_capacity(FactorId::ALL.len());
    for factor in FactorId::ALL {
        let layer = factor.layer();
        let setting = config.factor(factor);
        let value = factor.evaluate(window);
        let weighted = if setting.enabled {
            setting.weight * value
        } else {
            0.0
        };
        layers.add(layer, weighted);
        factors.push(FactorContribution {
            factor,
            layer,
            value,
            weight: setting.weight,
            enabled: setting.enabled,
            contribution: config.layers.get(layer) * weighted,
        });
    }

    let layered: f64 = Layer::ALL
        .iter()
        .map(|&layer| config.layers.get(layer) * layers.get(layer))
        .sum();
    let keyzone_bias = window
        .signal_in_window()
        .map(|s| config.keyzone_bias_scale * s.signed_strength())
        .unwrap_or(0.0);
    let score = layered + keyzone_bias;

    let bias = if score > PRICE_EPSILON {
        Some(Direction::Up)
    } else if score < -PRICE_EPSILON {
        Some(Direction::Down)
    } else {
        None
    };

    let stage = stage_for(score, !window.sealed_swings.is_empty(), config);
    let explanation = explain(stage, bias, &layers, &factors, keyzone_bias);
    SupplyDemandResult {
        score,
        stage,
        bias,
        layers,
        factors,
        keyzone_bias,
        window_start_raw_id: window.bars.first().map(|b| b.sequence),
        window_end_raw_id: window.bars.last().map(|b| b.sequence),
        explanation,
    }
}
