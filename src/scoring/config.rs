//! Scoring configuration and profile overlays
//!
//! A profile document holds a required `default` patch plus optional overlays
//! keyed by timeframe, symbol and `symbol.timeframe`. Resolution applies them
//! in precedence order, so the most specific value present wins per parameter:
//!
//! default -> timeframe -> symbol -> `*.tf` -> `sym.*` -> `sym.tf`

use super::factors::{FactorId, Layer};
use crate::error::{Result, StructureError};
use crate::types::{ContextKey, Timeframe};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Upper bound for any weight or scale
pub const MAX_WEIGHT: f64 = 10.0;
pub const MIN_WINDOW_BARS: usize = 3;
pub const MAX_WINDOW_BARS: usize = 10_000;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerWeights {
    pub price_action: f64,
    pub structure: f64,
    pub location: f64,
}

impl LayerWeights {
    pub fn get(&self, layer: Layer) -> f64 {
        match layer {
            Layer::PriceAction => self.price_action,
            Layer::Structure => self.structure,
            Layer::Location => self.location,
        }
    }
}

impl Default for LayerWeights {
    fn default() -> Self {
        Self {
            price_action: 0.3,
            structure: 0.4,
            location: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorSetting {
    pub weight: f64,
    pub enabled: bool,
}

/// Minimum |score| for each stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageThresholds {
    pub stable: f64,
    pub weakening: f64,
    pub critical: f64,
}

impl Default for StageThresholds {
    fn default() -> Self {
        Self {
            stable: 0.5,
            weakening: 0.3,
            critical: 0.1,
        }
    }
}

/// Fully resolved scoring parameters for one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub layers: LayerWeights,
    pub factors: BTreeMap<FactorId, FactorSetting>,
    pub thresholds: StageThresholds,
    /// Scale applied to the signed strength of the latest zone signal
    pub keyzone_bias_scale: f64,
    /// Raw bars in the scoring window
    pub window_bars: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let factors = FactorId::ALL
            .iter()
            .map(|&factor| {
                let weight = match factor {
                    FactorId::DirectionalEfficiency => 0.4,
                    FactorId::BodyDominance => 0.3,
                    FactorId::CloseConsistency => 0.3,
                    FactorId::SwingStrength => 0.35,
                    FactorId::TrendPosition => 0.35,
                    FactorId::ExtremumProgress => 0.3,
                    FactorId::ZoneProximity => 0.4,
                    FactorId::ZoneBalance => 0.3,
                    FactorId::ReactionBreadth => 0.3,
                };
                (factor, FactorSetting { weight, enabled: true })
            })
            .collect();
        Self {
            layers: LayerWeights::default(),
            factors,
            thresholds: StageThresholds::default(),
            keyzone_bias_scale: 0.2,
            window_bars: 50,
        }
    }
}

impl ScoringConfig {
    pub fn factor(&self, factor: FactorId) -> FactorSetting {
        self.factors.get(&factor).copied().unwrap_or(FactorSetting {
            weight: 0.0,
            enabled: false,
        })
    }

    pub fn validate(&self) -> Result<()> {
        for layer in Layer::ALL {
            check_weight(&format!("layers.{}", layer), self.layers.get(layer))?;
        }
        for factor in FactorId::ALL {
            let Some(setting) = self.factors.get(&factor) else {
                return Err(StructureError::config(
                    format!("factors.{}", factor),
                    "factor missing from resolved configuration",
                ));
            };
            check_weight(&format!("factors.{}.weight", factor), setting.weight)?;
        }
        check_weight("keyzone_bias_scale", self.keyzone_bias_scale)?;

        let t = &self.thresholds;
        for (name, value) in [("stable", t.stable), ("weakening", t.weakening), ("critical", t.critical)] {
            check_weight(&format!("thresholds.{}", name), value)?;
        }
        if !(t.critical <= t.weakening && t.weakening <= t.stable) {
            return Err(StructureError::config(
                "thresholds",
                format!(
                    "must satisfy critical <= weakening <= stable, got {} / {} / {}",
                    t.critical, t.weakening, t.stable
                ),
            ));
        }
        if !(MIN_WINDOW_BARS..=MAX_WINDOW_BARS).contains(&self.window_bars) {
            return Err(StructureError::config(
                "window_bars",
                format!(
                    "{} is outside [{}, {}]",
                    self.window_bars, MIN_WINDOW_BARS, MAX_WINDOW_BARS
                ),
            ));
        }
        Ok(())
    }
}

fn check_weight(parameter: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=MAX_WEIGHT).contains(&value) {
        return Err(StructureError::config(
            parameter,
            format!("{} is outside [0, {}]", value, MAX_WEIGHT),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerPatch {
    pub price_action: Option<f64>,
    pub structure: Option<f64>,
    pub location: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FactorPatch {
    pub weight: Option<f64>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdPatch {
    pub stable: Option<f64>,
    pub weakening: Option<f64>,
    pub critical: Option<f64>,
}

/// Partial scoring configuration; absent values leave the lower layer in place
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringPatch {
    pub layers: Option<LayerPatch>,
    #[serde(default)]
    pub factors: BTreeMap<FactorId, FactorPatch>,
    pub thresholds: Option<ThresholdPatch>,
    pub keyzone_bias_scale: Option<f64>,
    pub window_bars: Option<usize>,
}

impl ScoringPatch {
    pub fn apply(&self, config: &mut ScoringConfig) {
        if let Some(layers) = &self.layers {
            if let Some(v) = layers.price_action {
                config.layers.price_action = v;
            }
            if let Some(v) = layers.structure {
                config.layers.structure = v;
            }
            if let Some(v) = layers.location {
                config.layers.location = v;
            }
        }
        for (factor, patch) in &self.factors {
            let setting = config.factors.entry(*factor).or_insert(FactorSetting {
                weight: 0.0,
                enabled: true,
            });
            if let Some(weight) = patch.weight {
                setting.weight = weight;
            }
            if let Some(enabled) = patch.enabled {
                setting.enabled = enabled;
            }
        }
        if let Some(thresholds) = &self.thresholds {
            if let Some(v) = thresholds.stable {
                config.thresholds.stable = v;
            }
            if let Some(v) = thresholds.weakening {
                config.thresholds.weakening = v;
            }
            if let Some(v) = thresholds.critical {
                config.thresholds.critical = v;
            }
        }
        if let Some(v) = self.keyzone_bias_scale {
            config.keyzone_bias_scale = v;
        }
        if let Some(v) = self.window_bars {
            config.window_bars = v;
        }
    }

    /// Range checks on the values present in this patch alone
    fn check(&self) -> Result<()> {
        if let Some(layers) = &self.layers {
            for (name, value) in [
                ("price_action", layers.price_action),
                ("structure", layers.structure),
                ("location", layers.location),
            ] {
                if let Some(v) = value {
                    check_weight(&format!("layers.{}", name), v)?;
                }
            }
        }
        for (factor, patch) in &self.factors {
            if let Some(weight) = patch.weight {
                check_weight(&format!("factors.{}.weight", factor), weight)?;
            }
        }
        if let Some(v) = self.keyzone_bias_scale {
            check_weight("keyzone_bias_scale", v)?;
        }
        Ok(())
    }
}

/// Scoring profile document with overlays
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileDocument {
    pub default: ScoringPatch,
    #[serde(default)]
    pub timeframe: BTreeMap<String, ScoringPatch>,
    #[serde(default)]
    pub symbol: BTreeMap<String, ScoringPatch>,
    #[serde(default)]
    pub symbol_timeframe: BTreeMap<String, ScoringPatch>,
}

fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

fn overlay_key(section: &str, key: &str) -> String {
    format!("{}.{}", section, key)
}

impl ProfileDocument {
    /// Parse, normalize keys and validate every combination the document mentions
    pub fn from_json_str(text: &str) -> Result<Self> {
        let document: ProfileDocument = serde_json::from_str(text)
            .map_err(|e| StructureError::config("profile", e.to_string()))?;
        let document = document.normalized()?;
        document.validate()?;
        Ok(document)
    }

    /// Rewrite overlay keys to canonical lowercase form, rejecting keys that can never match
    pub fn normalized(self) -> Result<Self> {
        let mut timeframe = BTreeMap::new();
        for (key, patch) in self.timeframe {
            let tf: Timeframe = key.parse().map_err(|reason: String| {
                StructureError::config("timeframe", reason).in_overlay(&overlay_key("timeframe", &key))
            })?;
            insert_unique(&mut timeframe, "timeframe", tf.as_str().to_string(), patch)?;
        }

        let mut symbol = BTreeMap::new();
        for (key, patch) in self.symbol {
            let normalized = normalize_symbol(&key);
            if normalized.is_empty() || normalized == WILDCARD {
                return Err(StructureError::config("symbol", "not a plain symbol name")
                    .in_overlay(&overlay_key("symbol", &key)));
            }
            insert_unique(&mut symbol, "symbol", normalized, patch)?;
        }

        let mut symbol_timeframe = BTreeMap::new();
        for (key, patch) in self.symbol_timeframe {
            let unresolvable = |reason: &str| {
                StructureError::config("symbol_timeframe", reason)
                    .in_overlay(&overlay_key("symbol_timeframe", &key))
            };
            let Some((sym, tf)) = key.rsplit_once('.') else {
                return Err(unresolvable("expected <symbol>.<timeframe>"));
            };
            let sym = normalize_symbol(sym);
            let tf = tf.trim().to_ascii_lowercase();
            if sym.is_empty() {
                return Err(unresolvable("empty symbol"));
            }
            if sym == WILDCARD && tf == WILDCARD {
                return Err(unresolvable("symbol and timeframe cannot both be wildcards"));
            }
            let tf = if tf == WILDCARD {
                tf
            } else {
                let parsed: Timeframe = tf.parse().map_err(|reason: String| unresolvable(&reason))?;
                parsed.as_str().to_string()
            };
            insert_unique(&mut symbol_timeframe, "symbol_timeframe", format!("{}.{}", sym, tf), patch)?;
        }

        Ok(Self {
            default: self.default,
            timeframe,
            symbol,
            symbol_timeframe,
        })
    }

    /// Overlays applying to `symbol` (None for a symbol without overlays) on `timeframe`,
    /// lowest precedence first
    fn layers(&self, symbol: Option<&str>, timeframe: Timeframe) -> Vec<(String, &ScoringPatch)> {
        let tf = timeframe.as_str();
        let mut layers = vec![("default".to_string(), &self.default)];
        if let Some(patch) = self.timeframe.get(tf) {
            layers.push((overlay_key("timeframe", tf), patch));
        }
        if let Some(sym) = symbol {
            if let Some(patch) = self.symbol.get(sym) {
                layers.push((overlay_key("symbol", sym), patch));
            }
        }
        let mut keys = vec![format!("{}.{}", WILDCARD, tf)];
        if let Some(sym) = symbol {
            keys.push(format!("{}.{}", sym, WILDCARD));
            keys.push(format!("{}.{}", sym, tf));
        }
        for key in keys {
            if let Some(patch) = self.symbol_timeframe.get(&key) {
                layers.push((overlay_key("symbol_timeframe", &key), patch));
            }
        }
        layers
    }

    fn resolve_parts(&self, symbol: Option<&str>, timeframe: Timeframe) -> Result<ScoringConfig> {
        let mut config = ScoringConfig::default();
        let mut applied = "default".to_string();
        for (name, patch) in self.layers(symbol, timeframe) {
            patch.check().map_err(|e| e.in_overlay(&name))?;
            patch.apply(&mut config);
            applied = name;
        }
        config.validate().map_err(|e| e.in_overlay(&applied))?;
        Ok(config)
    }

    /// Resolved configuration for one context
    pub fn resolve(&self, symbol: &str, timeframe: Timeframe) -> Result<ScoringConfig> {
        let sym = normalize_symbol(symbol);
        self.resolve_parts(Some(&sym), timeframe)
    }

    /// Symbols named anywhere in the document
    pub fn symbols(&self) -> BTreeSet<String> {
        let mut symbols: BTreeSet<String> = self.symbol.keys().cloned().collect();
        for key in self.symbol_timeframe.keys() {
            if let Some((sym, _)) = key.rsplit_once('.') {
                if sym != WILDCARD {
                    symbols.insert(sym.to_string());
                }
            }
        }
        symbols
    }

    /// Resolve every symbol the document names, plus an unnamed one, on every timeframe
    pub fn validate(&self) -> Result<()> {
        let symbols = self.symbols();
        for timeframe in Timeframe::ALL {
            self.resolve_parts(None, timeframe)?;
            for symbol in &symbols {
                self.resolve_parts(Some(symbol), timeframe)?;
            }
        }
        Ok(())
    }
}

fn insert_unique(
    map: &mut BTreeMap<String, ScoringPatch>,
    section: &str,
    key: String,
    patch: ScoringPatch,
) -> Result<()> {
    if map.contains_key(&key) {
        return Err(StructureError::config(section, "duplicate overlay key after normalization")
            .in_overlay(&overlay_key(section, &key)));
    }
    map.insert(key, patch);
    Ok(())
}

/// Active profile document shared by every context.
/// A replacement is swapped in only after it validates.
#[derive(Debug, Default)]
pub struct ProfileStore {
    active: RwLock<Arc<ProfileDocument>>,
}

impl ProfileStore {
    pub fn new(document: ProfileDocument) -> Result<Self> {
        let document = document.normalized()?;
        document.validate()?;
        Ok(Self {
            active: RwLock::new(Arc::new(document)),
        })
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let document = ProfileDocument::from_json_str(text)?;
        Ok(Self {
            active: RwLock::new(Arc::new(document)),
        })
    }

    pub fn current(&self) -> Arc<ProfileDocument> {
        self.active.read().clone()
    }

    pub fn resolve(&self, key: &ContextKey) -> Result<ScoringConfig> {
        self.current().resolve(&key.symbol, key.timeframe)
    }

    /// Replace the active document. On error the previous document stays active.
    pub fn reload(&self, text: &str) -> Result<()> {
        match ProfileDocument::from_json_str(text) {
            Ok(document) => {
                *self.active.write() = Arc::new(document);
                info!("scoring profile reloaded");
                Ok(())
            }
            Err(e) => {
                warn!("scoring profile rejected, keeping previous: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRECEDENCE: &str = r#"{
        "default": {"layers": {"structure": 1.0}},
        "timeframe": {"5m": {"layers": {"structure": 1.2}}},
        "symbol": {"I2601": {"layers": {"structure": 1.5}}},
        "symbol_timeframe": {"I2601.5m": {"layers": {"structure": 2.0}}}
    }"#;

    #[test]
    fn test_defaults_validate() {
        assert!(ScoringConfig::default().validate().is_ok());
        assert!(ProfileDocument::default().validate().is_ok());
    }

    #[test]
    fn test_overlay_precedence() {
        let doc = ProfileDocument::from_json_str(PRECEDENCE).unwrap();
        assert_eq!(doc.resolve("I2601", Timeframe::M5).unwrap().layers.structure, 2.0);
        assert_eq!(doc.resolve("I2601", Timeframe::M15).unwrap().layers.structure, 1.5);
        assert_eq!(doc.resolve("RB2605", Timeframe::M5).unwrap().layers.structure, 1.2);
        assert_eq!(doc.resolve("RB2605", Timeframe::H1).unwrap().layers.structure, 1.0);
    }

    #[test]
    fn test_wildcards_sit_between_symbol_and_exact() {
        let doc = ProfileDocument::from_json_str(
            r#"{
                "default": {},
                "symbol": {"i2601": {"window_bars": 30}},
                "symbol_timeframe": {
                    "*.5m": {"window_bars": 40, "keyzone_bias_scale": 0.5},
                    "I2601.*": {"window_bars": 60}
                }
            }"#,
        )
        .unwrap();
        let resolved = doc.resolve("I2601", Timeframe::M5).unwrap();
        assert_eq!(resolved.window_bars, 60);
        assert_eq!(resolved.keyzone_bias_scale, 0.5);
        assert_eq!(doc.resolve("RB2605", Timeframe::M5).unwrap().window_bars, 40);
    }

    #[test]
    fn test_per_parameter_merge() {
        let doc = ProfileDocument::from_json_str(
            r#"{
                "default": {"factors": {"body_dominance": {"weight": 0.9}}},
                "timeframe": {"1h": {"factors": {"body_dominance": {"enabled": false}}}}
            }"#,
        )
        .unwrap();
        let setting = doc.resolve("X", Timeframe::H1).unwrap().factor(FactorId::BodyDominance);
        assert_eq!(setting.weight, 0.9);
        assert!(!setting.enabled);
    }

    #[test]
    fn test_missing_default_rejected() {
        let err = ProfileDocument::from_json_str(r#"{"timeframe": {}}"#).unwrap_err();
        assert!(matches!(err, StructureError::ConfigValidation { .. }));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        assert!(ProfileDocument::from_json_str(r#"{"default": {"weights": {}}}"#).is_err());
        assert!(ProfileDocument::from_json_str(r#"{"default": {"factors": {"momentum": {"weight": 1.0}}}}"#).is_err());
    }

    #[test]
    fn test_out_of_range_weight_names_overlay() {
        let err = ProfileDocument::from_json_str(
            r#"{"default": {}, "symbol": {"I2601": {"keyzone_bias_scale": 11.0}}}"#,
        )
        .unwrap_err();
        match err {
            StructureError::ConfigValidation { parameter, overlay, .. } => {
                assert_eq!(parameter, "keyzone_bias_scale");
                assert_eq!(overlay.as_deref(), Some("symbol.i2601"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let err = ProfileDocument::from_json_str(
            r#"{"default": {}, "timeframe": {"1d": {"thresholds": {"critical": 0.8}}}}"#,
        )
        .unwrap_err();
        match err {
            StructureError::ConfigValidation { parameter, overlay, .. } => {
                assert_eq!(parameter, "thresholds");
                assert_eq!(overlay.as_deref(), Some("timeframe.1d"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unresolvable_keys_rejected() {
        assert!(ProfileDocument::from_json_str(r#"{"default": {}, "timeframe": {"7m": {}}}"#).is_err());
        assert!(ProfileDocument::from_json_str(r#"{"default": {}, "symbol_timeframe": {"I2601": {}}}"#).is_err());
        assert!(ProfileDocument::from_json_str(r#"{"default": {}, "symbol_timeframe": {"*.*": {}}}"#).is_err());
        assert!(ProfileDocument::from_json_str(r#"{"default": {}, "symbol": {"I2601": {}, "i2601": {}}}"#).is_err());
    }

    #[test]
    fn test_exchange_suffixed_symbols() {
        let doc = ProfileDocument::from_json_str(
            r#"{
                "default": {},
                "symbol": {"I8888.XDCE": {"window_bars": 30}},
                "symbol_timeframe": {
                    "i8888.xdce.15m": {"window_bars": 80},
                    "RB8888.XSGE.*": {"window_bars": 70}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(doc.resolve("I8888.XDCE", Timeframe::M5).unwrap().window_bars, 30);
        assert_eq!(doc.resolve("i8888.xdce", Timeframe::M15).unwrap().window_bars, 80);
        assert_eq!(doc.resolve("RB8888.XSGE", Timeframe::H1).unwrap().window_bars, 70);
        assert_eq!(doc.resolve("I8888", Timeframe::M5).unwrap().window_bars, 50);
        assert!(doc.symbols().contains("rb8888.xsge"));
    }

    #[test]
    fn test_window_bounds() {
        assert!(ProfileDocument::from_json_str(r#"{"default": {"window_bars": 2}}"#).is_err());
        assert!(ProfileDocument::from_json_str(r#"{"default": {"window_bars": 10000}}"#).is_ok());
    }

    #[test]
    fn test_rejected_reload_keeps_previous() {
        let store = ProfileStore::from_json_str(PRECEDENCE).unwrap();
        let key = ContextKey::new("I2601", Timeframe::M5);
        assert!(store.reload(r#"{"default": {"window_bars": 1}}"#).is_err());
        assert_eq!(store.resolve(&key).unwrap().layers.structure, 2.0);

        store.reload(r#"{"default": {"window_bars": 20}}"#).unwrap();
        let resolved = store.resolve(&key).unwrap();
        assert_eq!(resolved.window_bars, 20);
        assert_eq!(resolved.layers.structure, 0.4);
    }
}
