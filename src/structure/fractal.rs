//! Fractal (turning point) detection on consolidated bars
//!
//! A Top at bar i has a high and low strictly above both neighbours; a Bottom is
//! the mirror. The label at i is only confirmed once bar i+1 is closed, which
//! means bar i+2 has opened. Appending re-evaluates the trailing window only;
//! everything before it is frozen.

use super::consolidator::ConsolidatedBar;
use super::envelope::Envelope;
use crate::error::{Result, Stage, StructureError};
use crate::types::{ConsolidatedBarId, RawBarId};
use serde::{Deserialize, Serialize};

/// Number of trailing labels re-evaluated per update
pub const REVISION_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FractalKind {
    Top,
    Bottom,
    None,
}

impl FractalKind {
    pub fn opposite(self) -> Self {
        match self {
            FractalKind::Top => FractalKind::Bottom,
            FractalKind::Bottom => FractalKind::Top,
            FractalKind::None => FractalKind::None,
        }
    }
}

impl std::fmt::Display for FractalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FractalKind::Top => write!(f, "TOP"),
            FractalKind::Bottom => write!(f, "BOTTOM"),
            FractalKind::None => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelStatus {
    Tentative,
    Confirmed,
}

/// Label attached to one consolidated bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FractalLabel {
    pub cbar_id: ConsolidatedBarId,
    pub kind: FractalKind,
    pub status: LabelStatus,
}

/// A confirmed turning point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fractal {
    pub cbar_id: ConsolidatedBarId,
    pub kind: FractalKind,
    /// High of a Top, low of a Bottom
    pub price: f64,
    /// Three-bar envelope around the fractal bar
    pub envelope: Envelope,
    /// Raw bar supplying `price`
    pub extreme_raw_id: RawBarId,
    /// Raw bar whose arrival confirmed the label
    pub confirmed_at: RawBarId,
}

impl Fractal {
    /// Higher Top or lower Bottom than `other` (same kind assumed)
    pub fn is_more_extreme_than(&self, other: &Fractal) -> bool {
        match self.kind {
            FractalKind::Top => self.price > other.price,
            FractalKind::Bottom => self.price < other.price,
            FractalKind::None => false,
        }
    }
}

/// Unconfirmed turning point exposed for display and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FractalCandidate {
    pub cbar_id: ConsolidatedBarId,
    pub kind: FractalKind,
    /// True when the candidate is the origin of the first move rather than a 3-bar pattern
    pub origin: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FractalUpdate {
    /// Fractals confirmed by this update, in bar order
    pub confirmed: Vec<Fractal>,
    /// Previously reported tentative labels that changed
    pub revised: Vec<ConsolidatedBarId>,
    /// Earliest revised label, if any
    pub backtrack_from: Option<ConsolidatedBarId>,
}

/// Three-bar fractal rule
pub fn classify(left: &ConsolidatedBar, mid: &ConsolidatedBar, right: &ConsolidatedBar) -> FractalKind {
    if mid.high > left.high && mid.high > right.high && mid.low > left.low && mid.low > right.low {
        FractalKind::Top
    } else if mid.low < left.low && mid.low < right.low && mid.high < left.high && mid.high < right.high {
        FractalKind::Bottom
    } else {
        FractalKind::None
    }
}

fn label_at(bars: &[ConsolidatedBar], index: usize) -> FractalLabel {
    let len = bars.len();
    let kind = if index > 0 && index + 1 < len {
        classify(&bars[index - 1], &bars[index], &bars[index + 1])
    } else {
        FractalKind::None
    };
    let status = if index + 2 < len {
        LabelStatus::Confirmed
    } else {
        LabelStatus::Tentative
    };
    FractalLabel {
        cbar_id: bars[index].id,
        kind,
        status,
    }
}

fn build_fractal(bars: &[ConsolidatedBar], index: usize, kind: FractalKind) -> Fractal {
    let bar = &bars[index];
    let (price, extreme_raw_id) = match kind {
        FractalKind::Top => (bar.high, bar.high_raw_id),
        _ => (bar.low, bar.low_raw_id),
    };
    Fractal {
        cbar_id: bar.id,
        kind,
        price,
        envelope: Envelope::around(bars, index),
        extreme_raw_id,
        confirmed_at: bars[index + 2].raw_start_id,
    }
}

#[derive(Debug, Clone)]
pub struct FractalCheckpoint {
    labels_len: usize,
    tail: Vec<FractalLabel>,
    fractals_len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FractalDetector {
    labels: Vec<FractalLabel>,
    fractals: Vec<Fractal>,
}

impl FractalDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch path: label a complete consolidated sequence
    pub fn detect(bars: &[ConsolidatedBar]) -> Self {
        let labels: Vec<FractalLabel> = (0..bars.len()).map(|i| label_at(bars, i)).collect();
        let fractals = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.status == LabelStatus::Confirmed && l.kind != FractalKind::None)
            .map(|(i, l)| build_fractal(bars, i, l.kind))
            .collect();
        Self { labels, fractals }
    }

    /// Re-evaluate the trailing window after the consolidated sequence changed
    pub fn update(&mut self, bars: &[ConsolidatedBar]) -> Result<FractalUpdate> {
        if bars.len() < self.labels.len() {
            return Err(StructureError::invariant(
                Stage::Fractal,
                vec![bars.len() as u64],
                "consolidated sequence shrank",
            ));
        }

        let first_new = self.labels.len();
        while self.labels.len() < bars.len() {
            let id = bars[self.labels.len()].id;
            self.labels.push(FractalLabel {
                cbar_id: id,
                kind: FractalKind::None,
                status: LabelStatus::Tentative,
            });
        }

        let mut update = FractalUpdate::default();
        let start = first_new.min(bars.len().saturating_sub(REVISION_WINDOW));
        for i in start..bars.len() {
            let previous = self.labels[i];
            let next = label_at(bars, i);
            if previous == next {
                continue;
            }
            if previous.status == LabelStatus::Confirmed {
                return Err(StructureError::invariant(
                    Stage::Fractal,
                    vec![previous.cbar_id],
                    format!("confirmed label {} changed to {}", previous.kind, next.kind),
                ));
            }
            if previous.kind != FractalKind::None && previous.kind != next.kind {
                update.revised.push(previous.cbar_id);
                update.backtrack_from.get_or_insert(previous.cbar_id);
            }
            if next.status == LabelStatus::Confirmed && next.kind != FractalKind::None {
                let fractal = build_fractal(bars, i, next.kind);
                self.fractals.push(fractal.clone());
                update.confirmed.push(fractal);
            }
            self.labels[i] = next;
        }
        Ok(update)
    }

    pub fn labels(&self) -> &[FractalLabel] {
        &self.labels
    }

    pub fn fractals(&self) -> &[Fractal] {
        &self.fractals
    }

    pub fn latest_fractal(&self) -> Option<&Fractal> {
        self.fractals.last()
    }

    /// Confirmed fractal on the given consolidated bar
    pub fn fractal_at(&self, cbar_id: ConsolidatedBarId) -> Option<&Fractal> {
        self.fractals
            .binary_search_by_key(&cbar_id, |f| f.cbar_id)
            .ok()
            .map(|i| &self.fractals[i])
    }

    /// Nearest confirmed fractal strictly before `cbar_id`
    pub fn prev_fractal(&self, cbar_id: ConsolidatedBarId) -> Option<&Fractal> {
        let i = self.fractals.partition_point(|f| f.cbar_id < cbar_id);
        i.checked_sub(1).map(|i| &self.fractals[i])
    }

    /// Nearest confirmed fractal strictly after `cbar_id`
    pub fn next_fractal(&self, cbar_id: ConsolidatedBarId) -> Option<&Fractal> {
        let i = self.fractals.partition_point(|f| f.cbar_id <= cbar_id);
        self.fractals.get(i)
    }

    /// At most one unconfirmed turning point: the tentative label next to the
    /// open bar, or the origin of the first move while nothing is confirmed
    pub fn pending_candidate(&self, bars: &[ConsolidatedBar]) -> Option<FractalCandidate> {
        let len = bars.len().min(self.labels.len());
        if len >= 2 {
            let label = self.labels[len - 2];
            if label.status == LabelStatus::Tentative && label.kind != FractalKind::None {
                return Some(FractalCandidate {
                    cbar_id: label.cbar_id,
                    kind: label.kind,
                    origin: false,
                });
            }
        }
        if self.fractals.is_empty() && len >= 2 {
            let kind = match bars[1].direction {
                Some(crate::types::Direction::Up) => FractalKind::Bottom,
                _ => FractalKind::Top,
            };
            return Some(FractalCandidate {
                cbar_id: bars[0].id,
                kind,
                origin: true,
            });
        }
        None
    }

    pub fn checkpoint(&self) -> FractalCheckpoint {
        let from = self.labels.len().saturating_sub(REVISION_WINDOW);
        FractalCheckpoint {
            labels_len: self.labels.len(),
            tail: self.labels[from..].to_vec(),
            fractals_len: self.fractals.len(),
        }
    }

    pub fn restore(&mut self, checkpoint: FractalCheckpoint) {
        self.labels
            .truncate(checkpoint.labels_len - checkpoint.tail.len());
        self.labels.extend(checkpoint.tail);
        self.fractals.truncate(checkpoint.fractals_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::consolidator::BarConsolidator;
    use crate::types::RawBar;
    use chrono::{Duration, TimeZone, Utc};

    fn raw(points: &[(f64, f64)]) -> Vec<RawBar> {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
        points
            .iter()
            .enumerate()
            .map(|(i, (h, l))| {
                RawBar::new(i as u64 + 1, t0 + Duration::minutes(i as i64), *l, *h, *l, *h)
            })
            .collect()
    }

    #[test]
    fn test_rising_run_has_no_fractal() {
        let bars: Vec<(f64, f64)> = (0..10).map(|i| (101.5 + i as f64, 100.0 + i as f64)).collect();
        let cbars = BarConsolidator::consolidate(&raw(&bars));
        let detector = FractalDetector::detect(&cbars);
        assert!(detector.fractals().is_empty());
        let candidate = detector.pending_candidate(&cbars).unwrap();
        assert_eq!(candidate.kind, FractalKind::Bottom);
        assert!(candidate.origin);
        assert_eq!(candidate.cbar_id, 0);
    }

    #[test]
    fn test_top_confirms_only_after_next_bar_closes() {
        let points = [(10.0, 8.0), (12.0, 10.0), (11.0, 9.0), (10.0, 7.5), (9.0, 6.0)];
        let raw = raw(&points);
        let mut consolidator = BarConsolidator::new();
        let mut detector = FractalDetector::new();

        consolidator.push(&raw[0]);
        consolidator.push(&raw[1]);
        consolidator.push(&raw[2]);
        let update = detector.update(consolidator.bars()).unwrap();
        assert!(update.confirmed.is_empty());
        assert_eq!(detector.labels()[1].kind, FractalKind::Top);
        assert_eq!(detector.labels()[1].status, LabelStatus::Tentative);

        consolidator.push(&raw[3]);
        let update = detector.update(consolidator.bars()).unwrap();
        assert_eq!(update.confirmed.len(), 1);
        let top = &update.confirmed[0];
        assert_eq!(top.kind, FractalKind::Top);
        assert_eq!(top.cbar_id, 1);
        assert_eq!(top.price, 12.0);
        assert_eq!(top.confirmed_at, 4);
    }

    fn cbar(id: u64, high: f64, low: f64) -> ConsolidatedBar {
        ConsolidatedBar {
            id,
            raw_start_id: id + 1,
            raw_end_id: id + 1,
            high,
            low,
            high_raw_id: id + 1,
            low_raw_id: id + 1,
            raw_count: 1,
            direction: None,
        }
    }

    #[test]
    fn test_tentative_revision_reports_backtrack() {
        let mut detector = FractalDetector::new();
        let first = vec![cbar(0, 10.0, 8.0), cbar(1, 12.0, 10.0), cbar(2, 11.0, 9.0)];
        detector.update(&first).unwrap();
        assert_eq!(detector.labels()[1].kind, FractalKind::Top);

        // The open bar is revised so that it takes out the tentative high
        let revised = vec![cbar(0, 10.0, 8.0), cbar(1, 12.0, 10.0), cbar(2, 13.0, 11.0)];
        let update = detector.update(&revised).unwrap();
        assert_eq!(update.revised, vec![1]);
        assert_eq!(update.backtrack_from, Some(1));
        assert_eq!(detector.labels()[1].kind, FractalKind::None);
    }

    #[test]
    fn test_confirmed_label_change_is_invariant_violation() {
        let mut detector = FractalDetector::new();
        let bars = vec![
            cbar(0, 10.0, 8.0),
            cbar(1, 12.0, 10.0),
            cbar(2, 11.0, 9.0),
            cbar(3, 10.0, 7.5),
        ];
        detector.update(&bars).unwrap();
        let mut tampered = bars.clone();
        tampered[2] = cbar(2, 12.5, 10.5);
        let err = detector.update(&tampered).unwrap_err();
        assert!(matches!(err, StructureError::StateInvariant { stage: Stage::Fractal, .. }));
    }

    #[test]
    fn test_incremental_matches_batch() {
        let points = [
            (10.0, 8.0),
            (12.0, 10.0),
            (11.0, 9.0),
            (10.0, 7.5),
            (9.0, 6.0),
            (9.5, 6.5),
            (11.0, 8.0),
            (10.5, 7.0),
            (12.5, 9.0),
            (11.5, 8.5),
        ];
        let raw = raw(&points);
        let mut consolidator = BarConsolidator::new();
        let mut detector = FractalDetector::new();
        for bar in &raw {
            consolidator.push(bar);
            detector.update(consolidator.bars()).unwrap();
        }
        let batch = FractalDetector::detect(consolidator.bars());
        assert_eq!(detector.labels(), batch.labels());
        assert_eq!(detector.fractals(), batch.fractals());
    }

    #[test]
    fn test_navigation_follows_confirmed_order() {
        let points = [
            (10.0, 8.0),
            (12.0, 10.0),
            (11.0, 9.0),
            (10.0, 7.5),
            (9.0, 6.0),
            (9.5, 6.5),
            (11.0, 8.0),
            (10.5, 7.0),
            (12.5, 9.0),
            (11.5, 8.5),
        ];
        let mut consolidator = BarConsolidator::new();
        for bar in &raw(&points) {
            consolidator.push(bar);
        }
        let detector = FractalDetector::detect(consolidator.bars());
        let fractals = detector.fractals();
        assert!(fractals.len() >= 3);
        assert_eq!(detector.latest_fractal(), fractals.last());

        for (i, fractal) in fractals.iter().enumerate() {
            assert_eq!(detector.fractal_at(fractal.cbar_id), Some(fractal));
            assert_eq!(detector.prev_fractal(fractal.cbar_id), i.checked_sub(1).map(|j| &fractals[j]));
            assert_eq!(detector.next_fractal(fractal.cbar_id), fractals.get(i + 1));
        }

        // a bar between two fractals navigates to both neighbours
        let (a, b) = (&fractals[0], &fractals[1]);
        let between = a.cbar_id + 1;
        assert!(between < b.cbar_id);
        assert_eq!(detector.fractal_at(between), None);
        assert_eq!(detector.prev_fractal(between), Some(a));
        assert_eq!(detector.next_fractal(between), Some(b));
        assert_eq!(detector.prev_fractal(0), None);
        assert_eq!(detector.next_fractal(u64::MAX), None);
    }

    #[test]
    fn test_restore_discards_confirmation() {
        let points = [(10.0, 8.0), (12.0, 10.0), (11.0, 9.0), (10.0, 7.5)];
        let raw = raw(&points);
        let mut consolidator = BarConsolidator::new();
        let mut detector = FractalDetector::new();
        for bar in &raw[..3] {
            consolidator.push(bar);
            detector.update(consolidator.bars()).unwrap();
        }
        let cp = detector.checkpoint();
        consolidator.push(&raw[3]);
        detector.update(consolidator.bars()).unwrap();
        assert_eq!(detector.fractals().len(), 1);
        detector.restore(cp);
        assert!(detector.fractals().is_empty());
        assert_eq!(detector.labels().len(), 3);
        assert_eq!(detector.labels()[1].status, LabelStatus::Tentative);
    }
}
