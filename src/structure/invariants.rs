//! Structural invariant checks
//!
//! Each stage checks its own local invariants while it runs. These checks
//! work over a complete set of entities and back the `verify` audit and the
//! property tests.

use super::consolidator::ConsolidatedBar;
use super::fractal::{FractalKind, FractalLabel, LabelStatus};
use super::keyzone::KeyZone;
use super::swing::Swing;
use super::trend::Trend;
use crate::error::{Result, Stage, StructureError};
use crate::types::{Direction, RawBar, PRICE_EPSILON};

/// Consolidated spans cover the raw sequence exactly, in order
pub fn check_coverage(raw: &[RawBar], bars: &[ConsolidatedBar]) -> Result<()> {
    let mut cursor = 0usize;
    for (position, bar) in bars.iter().enumerate() {
        if bar.id as usize != position {
            return Err(StructureError::invariant(
                Stage::Consolidation,
                vec![bar.id],
                format!("consolidated bar at position {} carries id {}", position, bar.id),
            ));
        }
        let end = cursor + bar.raw_count;
        let (Some(first), Some(last)) = (raw.get(cursor), end.checked_sub(1).and_then(|i| raw.get(i))) else {
            return Err(StructureError::invariant(
                Stage::Consolidation,
                vec![bar.id],
                "span runs past the raw sequence",
            ));
        };
        if bar.raw_count == 0 || first.sequence != bar.raw_start_id || last.sequence != bar.raw_end_id {
            return Err(StructureError::invariant(
                Stage::Consolidation,
                vec![bar.id, bar.raw_start_id, bar.raw_end_id],
                "span leaves a gap or overlaps its neighbour",
            ));
        }
        cursor = end;
    }
    if cursor != raw.len() {
        return Err(StructureError::invariant(
            Stage::Consolidation,
            bars.last().map(|b| vec![b.id]).unwrap_or_default(),
            format!("{} raw bars not covered", raw.len() - cursor),
        ));
    }
    Ok(())
}

/// No two adjacent consolidated bars contain one another
pub fn check_containment(bars: &[ConsolidatedBar]) -> Result<()> {
    for pair in bars.windows(2) {
        if pair[0].is_inclusive(pair[1].high, pair[1].low) {
            return Err(StructureError::invariant(
                Stage::Consolidation,
                vec![pair[0].id, pair[1].id],
                "adjacent consolidated bars in containment",
            ));
        }
    }
    Ok(())
}

/// Coverage and containment for the trailing consolidated bar only.
///
/// Runs after every raw bar; together with the previous calls it proves the
/// same as `check_coverage` and `check_containment` over the whole sequence.
pub fn check_tail(raw: &[RawBar], bars: &[ConsolidatedBar]) -> Result<()> {
    let Some(last) = bars.last() else {
        if raw.is_empty() {
            return Ok(());
        }
        return Err(StructureError::invariant(
            Stage::Consolidation,
            Vec::new(),
            format!("{} raw bars not covered", raw.len()),
        ));
    };
    let position = bars.len() - 1;
    if last.id as usize != position {
        return Err(StructureError::invariant(
            Stage::Consolidation,
            vec![last.id],
            format!("consolidated bar at position {} carries id {}", position, last.id),
        ));
    }
    let start = raw.len().checked_sub(last.raw_count).filter(|_| last.raw_count > 0);
    let (Some(start), Some(newest)) = (start, raw.last()) else {
        return Err(StructureError::invariant(
            Stage::Consolidation,
            vec![last.id],
            "span runs past the raw sequence",
        ));
    };
    if raw[start].sequence != last.raw_start_id || newest.sequence != last.raw_end_id {
        return Err(StructureError::invariant(
            Stage::Consolidation,
            vec![last.id, last.raw_start_id, last.raw_end_id],
            "span leaves a gap or overlaps its neighbour",
        ));
    }

    let Some(previous) = position.checked_sub(1).map(|i| &bars[i]) else {
        if start != 0 {
            return Err(StructureError::invariant(
                Stage::Consolidation,
                vec![last.id],
                format!("{} raw bars not covered", start),
            ));
        }
        return Ok(());
    };
    let boundary = start.checked_sub(1).map(|i| raw[i].sequence);
    if boundary != Some(previous.raw_end_id) {
        return Err(StructureError::invariant(
            Stage::Consolidation,
            vec![previous.id, last.id],
            "span leaves a gap or overlaps its neighbour",
        ));
    }
    if previous.is_inclusive(last.high, last.low) {
        return Err(StructureError::invariant(
            Stage::Consolidation,
            vec![previous.id, last.id],
            "adjacent consolidated bars in containment",
        ));
    }
    Ok(())
}

/// One label per consolidated bar; only the trailing two may still be tentative
pub fn check_labels(labels: &[FractalLabel], bars: &[ConsolidatedBar]) -> Result<()> {
    if labels.len() != bars.len() {
        return Err(StructureError::invariant(
            Stage::Fractal,
            Vec::new(),
            format!("{} labels for {} consolidated bars", labels.len(), bars.len()),
        ));
    }
    let frozen = bars.len().saturating_sub(2);
    for (index, label) in labels.iter().enumerate() {
        let expected = if index < frozen {
            LabelStatus::Confirmed
        } else {
            LabelStatus::Tentative
        };
        if label.status != expected {
            return Err(StructureError::invariant(
                Stage::Fractal,
                vec![label.cbar_id],
                format!("label status {:?} at position {}", label.status, index),
            ));
        }
    }
    Ok(())
}

/// Anchor kinds match direction, swings chain end to start and alternate
pub fn check_swings(swings: &[Swing]) -> Result<()> {
    for swing in swings {
        let expected = match swing.direction {
            Direction::Up => (FractalKind::Bottom, FractalKind::Top),
            Direction::Down => (FractalKind::Top, FractalKind::Bottom),
        };
        let end_matches = swing.end_kind == expected.1 || (!swing.is_confirmed() && swing.end_kind == FractalKind::None);
        if swing.start_kind != expected.0 || !end_matches {
            return Err(StructureError::invariant(
                Stage::Swing,
                vec![swing.id],
                format!(
                    "{} swing anchored {} -> {}",
                    swing.direction, swing.start_kind, swing.end_kind
                ),
            ));
        }
        if swing.high + PRICE_EPSILON < swing.low || swing.start_cbar_id > swing.end_cbar_id {
            return Err(StructureError::invariant(
                Stage::Swing,
                vec![swing.id],
                "swing span is inverted",
            ));
        }
    }
    for pair in swings.windows(2) {
        if pair[0].end_cbar_id != pair[1].start_cbar_id || pair[0].direction == pair[1].direction {
            return Err(StructureError::invariant(
                Stage::Swing,
                vec![pair[0].id, pair[1].id],
                "consecutive swings do not chain",
            ));
        }
    }
    Ok(())
}

/// Trends take their first swing's direction and partition the swing sequence
pub fn check_trends(trends: &[Trend], swings: &[Swing]) -> Result<()> {
    for trend in trends {
        let Some(first) = swings.iter().find(|s| s.id == trend.start_swing_id) else {
            return Err(StructureError::invariant(
                Stage::Trend,
                vec![trend.id, trend.start_swing_id],
                "trend starts at an unknown swing",
            ));
        };
        if first.direction != trend.direction {
            return Err(StructureError::invariant(
                Stage::Trend,
                vec![trend.id, first.id],
                format!("{} trend opened by a {} swing", trend.direction, first.direction),
            ));
        }
        let contiguous = trend.swing_ids.windows(2).all(|w| w[1] == w[0] + 1);
        if !contiguous || !trend.swing_ids.contains(&trend.extremum_swing_id) {
            return Err(StructureError::invariant(
                Stage::Trend,
                vec![trend.id],
                "trend members are not a contiguous run holding the extremum",
            ));
        }
    }
    for pair in trends.windows(2) {
        if !pair[0].completed || pair[1].start_swing_id != pair[0].end_swing_id + 1 {
            return Err(StructureError::invariant(
                Stage::Trend,
                vec![pair[0].id, pair[1].id],
                "trend followed by another before completing",
            ));
        }
    }
    Ok(())
}

/// Zones are non-empty intervals inside their candidate bounds
pub fn check_zones(zones: &[KeyZone]) -> Result<()> {
    for zone in zones {
        let inside = zone.lower + PRICE_EPSILON >= zone.candidate_lower
            && zone.upper <= zone.candidate_upper + PRICE_EPSILON;
        if zone.upper + PRICE_EPSILON < zone.lower || !inside {
            return Err(StructureError::invariant(
                Stage::KeyZone,
                vec![zone.id],
                format!(
                    "zone [{}, {}] outside candidate [{}, {}]",
                    zone.lower, zone.upper, zone.candidate_lower, zone.candidate_upper
                ),
            ));
        }
    }
    Ok(())
}

/// Full audit over every entity set of one context
pub fn audit(
    raw: &[RawBar],
    bars: &[ConsolidatedBar],
    labels: &[FractalLabel],
    swings: &[Swing],
    trends: &[Trend],
    zones: &[KeyZone],
) -> Result<()> {
    check_coverage(raw, bars)?;
    check_containment(bars)?;
    check_labels(labels, bars)?;
    check_swings(swings)?;
    check_trends(trends, swings)?;
    check_zones(zones)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::consolidator::BarConsolidator;
    use crate::structure::fractal::FractalDetector;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(seq: u64, high: f64, low: f64) -> RawBar {
        let ts = Utc.with_ymd_and_hms(2025, 4, 1, 9, 30, 0).unwrap() + Duration::minutes(seq as i64);
        RawBar::new(seq, ts, low, high, low, high)
    }

    fn zigzag() -> Vec<RawBar> {
        let lows = [10.0, 11.0, 12.0, 13.0, 12.5, 11.0, 9.0, 10.5, 11.5, 12.0, 11.0, 10.0];
        lows.iter()
            .enumerate()
            .map(|(i, low)| bar(i as u64 + 1, low + 1.0, *low))
            .collect()
    }

    #[test]
    fn test_consolidated_sequence_passes() {
        let mut raw = zigzag();
        // inside bar merged into its neighbour
        raw.insert(4, bar(100, 13.8, 13.2));
        for (i, b) in raw.iter_mut().enumerate() {
            b.sequence = i as u64 + 1;
        }
        let bars = BarConsolidator::consolidate(&raw);
        assert!(bars.len() < raw.len());
        check_coverage(&raw, &bars).unwrap();
        check_containment(&bars).unwrap();
        let detector = FractalDetector::detect(&bars);
        check_labels(detector.labels(), &bars).unwrap();
    }

    #[test]
    fn test_tail_check_holds_after_every_bar() {
        let raw = zigzag();
        let mut consolidator = BarConsolidator::new();
        for (i, b) in raw.iter().enumerate() {
            consolidator.push(b);
            check_tail(&raw[..=i], consolidator.bars()).unwrap();
        }
    }

    #[test]
    fn test_tail_check_catches_broken_boundary() {
        let raw = zigzag();
        let mut bars = BarConsolidator::consolidate(&raw);
        let n = bars.len();
        bars[n - 2].raw_end_id += 1;
        assert!(matches!(
            check_tail(&raw, &bars),
            Err(StructureError::StateInvariant { .. })
        ));

        let mut bars = BarConsolidator::consolidate(&raw);
        let (high, low) = (bars[n - 2].high, bars[n - 2].low);
        bars[n - 1].high = high + 1.0;
        bars[n - 1].low = low - 1.0;
        assert!(check_tail(&raw, &bars).is_err());
    }

    #[test]
    fn test_coverage_gap_detected() {
        let raw = zigzag();
        let mut bars = BarConsolidator::consolidate(&raw);
        bars[2].raw_start_id += 1;
        let err = check_coverage(&raw, &bars).unwrap_err();
        assert!(matches!(err, StructureError::StateInvariant { stage: Stage::Consolidation, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_adjacent_containment_detected() {
        let raw = zigzag();
        let mut bars = BarConsolidator::consolidate(&raw);
        bars[1].high = bars[0].high + 5.0;
        bars[1].low = bars[0].low - 5.0;
        assert!(check_containment(&bars).is_err());
    }

    #[test]
    fn test_uncovered_tail_detected() {
        let raw = zigzag();
        let bars = BarConsolidator::consolidate(&raw[..raw.len() - 1]);
        assert!(check_coverage(&raw, &bars).is_err());
    }
}
