//! Property-based tests for the structure cascade
//!
//! Invariants checked over generated bar sequences:
//! 1. Incremental processing equals batch processing for every entity set
//! 2. No lookahead: anything confirmed on a prefix is unchanged by later bars
//! 3. A rejected bar leaves the context untouched
//! 4. Structural invariants hold after every run

use chrono::{Duration, TimeZone, Utc};
use market_structure::scoring::StructureStage;
use market_structure::structure::{FractalKind, LabelStatus};
use market_structure::{ContextKey, PipelineContext, RawBar, ScoringConfig, StructureConfig, Timeframe};
use proptest::prelude::*;

const TICK: f64 = 0.25;

fn key() -> ContextKey {
    ContextKey::new("I2601", Timeframe::M5)
}

fn incremental(bars: &[RawBar]) -> PipelineContext {
    let mut context = PipelineContext::new(key(), StructureConfig::default(), ScoringConfig::default())
        .expect("default configuration is valid");
    context.extend(bars.iter().cloned()).expect("generated bars are ordered");
    context
}

fn batch(bars: &[RawBar]) -> PipelineContext {
    PipelineContext::from_batch(key(), StructureConfig::default(), ScoringConfig::default(), bars.to_vec())
        .expect("generated bars are ordered")
}

/// Random walk on a tick grid so that shared edges and containment are common
fn bars_strategy() -> impl Strategy<Value = Vec<RawBar>> {
    prop::collection::vec((-6i32..=6, 1u32..=6, 0u32..=4, 0u32..=4), 5..160).prop_map(|steps| {
        let t0 = Utc.with_ymd_and_hms(2025, 10, 6, 9, 30, 0).unwrap();
        let mut mid = 4000.0;
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (delta, half_width, open_q, close_q))| {
                mid += delta as f64 * TICK;
                let high = mid + half_width as f64 * TICK;
                let low = mid - half_width as f64 * TICK;
                let open = low + (high - low) * open_q as f64 / 4.0;
                let close = low + (high - low) * close_q as f64 / 4.0;
                RawBar::new(i as u64 + 1, t0 + Duration::minutes(5 * i as i64), open, high, low, close)
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Proves: feeding bars one at a time gives the same structure as one batch
    #[test]
    fn incremental_equals_batch(bars in bars_strategy()) {
        let inc = incremental(&bars);
        let bat = batch(&bars);

        prop_assert_eq!(inc.consolidated(), bat.consolidated());
        prop_assert_eq!(inc.labels(), bat.labels());
        prop_assert_eq!(inc.fractals(), bat.fractals());
        prop_assert_eq!(inc.sealed_swings(), bat.sealed_swings());
        prop_assert_eq!(inc.active_swing(), bat.active_swing());
        prop_assert_eq!(inc.trends(), bat.trends());
        prop_assert_eq!(inc.zones(), bat.zones());
        prop_assert_eq!(inc.latest_signal(), bat.latest_signal());
        prop_assert_eq!(inc.latest_result(), bat.latest_result());
        prop_assert!(inc.audit().is_ok(), "audit failed: {:?}", inc.audit());
    }

    /// Proves: confirmed structure on a prefix survives every later bar
    #[test]
    fn confirmed_structure_has_no_lookahead(bars in bars_strategy(), cut in 0.0f64..1.0) {
        let k = ((bars.len() as f64 * cut) as usize).max(1);
        let prefix = batch(&bars[..k]);
        let full = incremental(&bars);

        let confirmed = prefix.labels().iter().filter(|l| l.status == LabelStatus::Confirmed).count();
        prop_assert_eq!(&full.labels()[..confirmed], &prefix.labels()[..confirmed]);
        prop_assert_eq!(&full.fractals()[..prefix.fractals().len()], prefix.fractals());
        prop_assert_eq!(&full.sealed_swings()[..prefix.sealed_swings().len()], prefix.sealed_swings());
        for trend in prefix.trends().iter().filter(|t| t.completed) {
            prop_assert_eq!(Some(trend), full.trends().iter().find(|t| t.id == trend.id));
        }
        for zone in prefix.zones() {
            let later = full.zones().iter().find(|z| z.id == zone.id);
            prop_assert!(later.is_some());
            if let Some(later) = later {
                prop_assert_eq!((later.lower, later.upper, later.created_at), (zone.lower, zone.upper, zone.created_at));
                prop_assert_eq!(&later.touches[..zone.touches.len()], &zone.touches[..]);
            }
        }
    }

    /// Proves: a duplicate sequence id is rejected without touching state
    #[test]
    fn rejected_bar_is_atomic(bars in bars_strategy(), cut in 0.0f64..1.0) {
        let k = ((bars.len() as f64 * cut) as usize).max(1);
        let mut context = incremental(&bars[..k]);
        let before = context.snapshot(usize::MAX);
        let mut duplicate = bars[k - 1].clone();
        duplicate.close = duplicate.low;
        prop_assert!(context.push(duplicate).is_err());
        prop_assert_eq!(context.snapshot(usize::MAX), before);
        prop_assert!(!context.is_halted());
    }
}

#[test]
fn test_ten_rising_bars_stay_unformed() {
    let t0 = Utc.with_ymd_and_hms(2025, 10, 6, 9, 30, 0).unwrap();
    let bars: Vec<RawBar> = (0..10)
        .map(|i| {
            let low = 4000.0 + i as f64;
            RawBar::new(i + 1, t0 + Duration::minutes(5 * i as i64), low, low + 1.5, low, low + 1.25)
        })
        .collect();
    let context = incremental(&bars);

    assert_eq!(context.consolidated().len(), 10);
    assert!(context.labels().iter().all(|l| l.kind != FractalKind::Top));
    let candidate = context.pending_candidate().expect("one pending turning point");
    assert_eq!(candidate.kind, FractalKind::Bottom);
    assert!(context.sealed_swings().is_empty());
    assert_eq!(context.latest_result().map(|r| r.stage), Some(StructureStage::Unformed));
}

#[test]
fn test_scores_are_reproducible() {
    let t0 = Utc.with_ymd_and_hms(2025, 10, 6, 9, 30, 0).unwrap();
    let lows = [10.0, 12.0, 14.0, 16.0, 18.0, 16.0, 14.0, 12.0, 10.0, 8.0, 10.0, 12.0, 14.0, 16.0, 18.0, 20.0, 18.0];
    let bars: Vec<RawBar> = lows
        .iter()
        .enumerate()
        .map(|(i, low)| RawBar::new(i as u64 + 1, t0 + Duration::minutes(i as i64), low + 0.5, low + 1.5, *low, low + 1.0))
        .collect();
    let a = incremental(&bars);
    let b = incremental(&bars);
    let (ra, rb) = (a.latest_result().unwrap(), b.latest_result().unwrap());
    assert_eq!(ra.score.to_bits(), rb.score.to_bits());
    assert_eq!(ra.factors, rb.factors);
    assert_eq!(ra.stage, rb.stage);
}
