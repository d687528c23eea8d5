//! The nine scoring factors
//!
//! Every factor maps the structural window to [-1, 1], positive meaning demand
//! (bullish) and negative meaning supply. Missing structure yields 0.

use crate::structure::keyzone::{KeyZone, ZoneSignal};
use crate::structure::swing::Swing;
use crate::structure::trend::Trend;
use crate::types::{Direction, RawBar, PRICE_EPSILON};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    PriceAction,
    Structure,
    Location,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::PriceAction, Layer::Structure, Layer::Location];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::PriceAction => "price_action",
            Layer::Structure => "structure",
            Layer::Location => "location",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorId {
    DirectionalEfficiency,
    BodyDominance,
    CloseConsistency,
    SwingStrength,
    TrendPosition,
    ExtremumProgress,
    ZoneProximity,
    ZoneBalance,
    ReactionBreadth,
}

impl FactorId {
    /// Reporting order
    pub const ALL: [FactorId; 9] = [
        FactorId::DirectionalEfficiency,
        FactorId::BodyDominance,
        FactorId::CloseConsistency,
        FactorId::SwingStrength,
        FactorId::TrendPosition,
        FactorId::ExtremumProgress,
        FactorId::ZoneProximity,
        FactorId::ZoneBalance,
        FactorId::ReactionBreadth,
    ];

    pub fn layer(&self) -> Layer {
        match self {
            FactorId::DirectionalEfficiency | FactorId::BodyDominance | FactorId::CloseConsistency => {
                Layer::PriceAction
            }
            FactorId::SwingStrength | FactorId::TrendPosition | FactorId::ExtremumProgress => Layer::Structure,
            FactorId::ZoneProximity | FactorId::ZoneBalance | FactorId::ReactionBreadth => Layer::Location,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FactorId::DirectionalEfficiency => "directional_efficiency",
            FactorId::BodyDominance => "body_dominance",
            FactorId::CloseConsistency => "close_consistency",
            FactorId::SwingStrength => "swing_strength",
            FactorId::TrendPosition => "trend_position",
            FactorId::ExtremumProgress => "extremum_progress",
            FactorId::ZoneProximity => "zone_proximity",
            FactorId::ZoneBalance => "zone_balance",
            FactorId::ReactionBreadth => "reaction_breadth",
        }
    }

    pub fn evaluate(&self, window: &StructuralWindow<'_>) -> f64 {
        let value = match self {
            FactorId::DirectionalEfficiency => directional_efficiency(window.bars),
            FactorId::BodyDominance => body_dominance(window.bars),
            FactorId::CloseConsistency => close_consistency(window.bars),
            FactorId::SwingStrength => swing_strength(window.sealed_swings),
            FactorId::TrendPosition => trend_position(window.trend, window.last_close()),
            FactorId::ExtremumProgress => extremum_progress(window.active_swing, window.sealed_swings),
            FactorId::ZoneProximity => zone_proximity(window.zones, window.last_close()),
            FactorId::ZoneBalance => zone_balance(window.zones, window.last_close()),
            FactorId::ReactionBreadth => reaction_breadth(window.zones, window.bars),
        };
        if value.is_finite() {
            value.clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for FactorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Read-only view of the structure a score is computed from
#[derive(Debug, Clone, Copy)]
pub struct StructuralWindow<'a> {
    /// Most recent raw bars, oldest first
    pub bars: &'a [RawBar],
    pub sealed_swings: &'a [Swing],
    pub active_swing: Option<&'a Swing>,
    /// Latest trend, completed or not
    pub trend: Option<&'a Trend>,
    /// Zones currently evaluated against price
    pub zones: &'a [KeyZone],
    pub signal: Option<&'a ZoneSignal>,
}

impl<'a> StructuralWindow<'a> {
    pub fn last_close(&self) -> Option<f64> {
        self.bars.last().map(|b| b.close)
    }

    /// Signal generated by a bar inside the window
    pub fn signal_in_window(&self) -> Option<&'a ZoneSignal> {
        let first = self.bars.first()?;
        self.signal.filter(|s| s.raw_id >= first.sequence)
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator.abs() <= PRICE_EPSILON {
        0.0
    } else {
        numerator / denominator
    }
}

fn directional_efficiency(bars: &[RawBar]) -> f64 {
    let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
        return 0.0;
    };
    let travelled: f64 = bars.iter().map(|b| b.range()).sum();
    ratio(last.close - first.open, travelled)
}

fn body_dominance(bars: &[RawBar]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }
    let total: f64 = bars.iter().map(|b| ratio(b.close - b.open, b.range())).sum();
    total / bars.len() as f64
}

fn close_consistency(bars: &[RawBar]) -> f64 {
    if bars.len() < 2 {
        return 0.0;
    }
    let net: i64 = bars
        .windows(2)
        .map(|w| {
            if w[1].close > w[0].close {
                1
            } else if w[1].close < w[0].close {
                -1
            } else {
                0
            }
        })
        .sum();
    net as f64 / (bars.len() - 1) as f64
}

fn swing_strength(sealed: &[Swing]) -> f64 {
    let [.., previous, last] = sealed else {
        return 0.0;
    };
    ratio(last.range() - previous.range(), last.range() + previous.range()) * last.direction.sign()
}

fn trend_position(trend: Option<&Trend>, close: Option<f64>) -> f64 {
    let (Some(trend), Some(close)) = (trend, close) else {
        return 0.0;
    };
    let position = if trend.range() <= PRICE_EPSILON {
        0.5
    } else {
        ((close - trend.low) / trend.range()).clamp(0.0, 1.0)
    };
    0.5 * trend.direction.sign() + 0.5 * (2.0 * position - 1.0)
}

fn extremum_progress(active: Option<&Swing>, sealed: &[Swing]) -> f64 {
    let Some(active) = active else {
        return 0.0;
    };
    let Some(previous) = sealed.iter().rev().find(|s| s.direction == active.direction) else {
        return 0.0;
    };
    let beyond = match active.direction {
        Direction::Up => active.high - previous.high,
        Direction::Down => previous.low - active.low,
    };
    ratio(beyond, previous.range()) * active.direction.sign()
}

/// Zones strictly above and below the close. Zones containing the close take no side.
fn split_zones(zones: &[KeyZone], close: f64) -> (Vec<&KeyZone>, Vec<&KeyZone>) {
    let above = zones.iter().filter(|z| z.lower > close).collect();
    let below = zones.iter().filter(|z| z.upper < close).collect();
    (above, below)
}

fn zone_proximity(zones: &[KeyZone], close: Option<f64>) -> f64 {
    let Some(close) = close else {
        return 0.0;
    };
    let (above, below) = split_zones(zones, close);
    let resistance = above.iter().map(|z| z.lower - close).fold(f64::INFINITY, f64::min);
    let support = below.iter().map(|z| close - z.upper).fold(f64::INFINITY, f64::min);
    match (resistance.is_finite(), support.is_finite()) {
        (true, true) => ratio(resistance - support, resistance + support),
        (false, true) => 1.0,
        (true, false) => -1.0,
        (false, false) => 0.0,
    }
}

fn zone_balance(zones: &[KeyZone], close: Option<f64>) -> f64 {
    let Some(close) = close else {
        return 0.0;
    };
    let (above, below) = split_zones(zones, close);
    let weight_above: f64 = above.iter().map(|z| z.quality()).sum();
    let weight_below: f64 = below.iter().map(|z| z.quality()).sum();
    ratio(weight_below - weight_above, weight_below + weight_above)
}

fn reaction_breadth(zones: &[KeyZone], bars: &[RawBar]) -> f64 {
    let Some(first) = bars.first() else {
        return 0.0;
    };
    let (mut bullish, mut bearish) = (0usize, 0usize);
    for touch in zones.iter().flat_map(|z| z.touches.iter()) {
        if touch.raw_id < first.sequence {
            continue;
        }
        match touch.direction {
            Direction::Up => bullish += 1,
            Direction::Down => bearish += 1,
        }
    }
    ratio(bullish as f64 - bearish as f64, (bullish + bearish) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::envelope::EnvelopeRelation;
    use crate::structure::fractal::FractalKind;
    use crate::structure::keyzone::{ZoneBehavior, ZoneRole, ZoneSource, ZoneTouch};
    use crate::structure::swing::SwingState;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(seq: u64, open: f64, high: f64, low: f64, close: f64) -> RawBar {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap();
        RawBar::new(seq, t0 + Duration::minutes(seq as i64), open, high, low, close)
    }

    fn swing(id: u64, direction: Direction, high: f64, low: f64) -> Swing {
        let (start_kind, end_kind) = match direction {
            Direction::Up => (FractalKind::Bottom, FractalKind::Top),
            Direction::Down => (FractalKind::Top, FractalKind::Bottom),
        };
        Swing {
            id,
            direction,
            state: SwingState::Confirmed,
            start_cbar_id: id * 5,
            end_cbar_id: id * 5 + 5,
            start_raw_id: id * 5,
            end_raw_id: id * 5 + 5,
            start_kind,
            end_kind,
            high,
            low,
            relation: Some(EnvelopeRelation::Disjoint),
            confirmed_at: Some(id * 5 + 7),
            transitions: vec![SwingState::Forming, SwingState::PendingReverse, SwingState::Confirmed],
        }
    }

    fn zone(id: u64, lower: f64, upper: f64, relation: EnvelopeRelation) -> KeyZone {
        KeyZone {
            id,
            source: ZoneSource::Swing(id),
            role: ZoneRole::Support,
            upper,
            lower,
            candidate_upper: upper,
            candidate_lower: lower,
            relation: Some(relation),
            source_start_raw_id: 0,
            source_end_raw_id: 1,
            created_at: 1,
            created_index: 1,
            touches: Vec::new(),
            behavior: None,
        }
    }

    fn window<'a>(bars: &'a [RawBar], swings: &'a [Swing], zones: &'a [KeyZone]) -> StructuralWindow<'a> {
        StructuralWindow {
            bars,
            sealed_swings: swings,
            active_swing: None,
            trend: None,
            zones,
            signal: None,
        }
    }

    #[test]
    fn test_layers_cover_three_factors_each() {
        for layer in Layer::ALL {
            assert_eq!(FactorId::ALL.iter().filter(|f| f.layer() == layer).count(), 3);
        }
    }

    #[test]
    fn test_price_action_factors_on_steady_rise() {
        let bars: Vec<RawBar> = (0..5)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(i, base, base + 1.0, base, base + 1.0)
            })
            .collect();
        let w = window(&bars, &[], &[]);
        assert_eq!(FactorId::DirectionalEfficiency.evaluate(&w), 1.0);
        assert_eq!(FactorId::BodyDominance.evaluate(&w), 1.0);
        assert_eq!(FactorId::CloseConsistency.evaluate(&w), 1.0);
    }

    #[test]
    fn test_swing_strength_sign_follows_last_swing() {
        let swings = vec![swing(0, Direction::Up, 20.0, 10.0), swing(1, Direction::Down, 20.0, 5.0)];
        let w = window(&[], &swings, &[]);
        // 15 vs 10 with a Down last swing
        assert!((FactorId::SwingStrength.evaluate(&w) + 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_extremum_progress() {
        let sealed = vec![swing(0, Direction::Up, 20.0, 10.0), swing(1, Direction::Down, 20.0, 15.0)];
        let active = swing(2, Direction::Up, 25.0, 15.0);
        let mut w = window(&[], &sealed, &[]);
        w.active_swing = Some(&active);
        assert!((FactorId::ExtremumProgress.evaluate(&w) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_zone_location_factors() {
        let bars = vec![bar(10, 50.0, 51.0, 49.0, 50.0)];
        let zones = vec![
            zone(0, 46.0, 48.0, EnvelopeRelation::Disjoint),
            zone(1, 56.0, 58.0, EnvelopeRelation::Intersecting),
        ];
        let w = window(&bars, &[], &zones);
        // support 2 below, resistance 6 above
        assert!((FactorId::ZoneProximity.evaluate(&w) - 0.5).abs() < 1e-12);
        // 1.0 below vs 0.5 above
        assert!((FactorId::ZoneBalance.evaluate(&w) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_reaction_breadth_counts_touches_in_window() {
        let bars = vec![bar(10, 50.0, 51.0, 49.0, 50.0), bar(11, 50.0, 51.0, 49.0, 50.5)];
        let mut z = zone(0, 46.0, 48.0, EnvelopeRelation::Disjoint);
        for (raw_id, direction) in [(5, Direction::Down), (10, Direction::Up), (11, Direction::Up)] {
            z.touches.push(ZoneTouch {
                raw_id,
                raw_index: raw_id as usize,
                behavior: ZoneBehavior::WeakReject,
                direction,
                strength: 0.5,
                penetration: 0.2,
            });
        }
        let zones = vec![z];
        let w = window(&bars, &[], &zones);
        assert_eq!(FactorId::ReactionBreadth.evaluate(&w), 1.0);
    }

    #[test]
    fn test_empty_window_is_neutral() {
        let w = window(&[], &[], &[]);
        for factor in FactorId::ALL {
            assert_eq!(factor.evaluate(&w), 0.0, "{}", factor);
        }
    }
}
