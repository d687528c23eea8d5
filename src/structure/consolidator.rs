//! Bar consolidation by containment
//!
//! Raw bars whose range contains, or is contained by, the current consolidated
//! bar are merged into it. The merge follows the direction of the current bar
//! relative to its predecessor:
//! - Up: keep the higher high and the higher low
//! - Down: keep the lower high and the lower low
//! - no direction yet (first bar): union of both ranges
//!
//! A directional merge never makes the merged bar contain its predecessor, so
//! only the last consolidated bar is ever revised.

use crate::types::{ConsolidatedBarId, Direction, RawBar, RawBarId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedBar {
    /// Position in the consolidated sequence
    pub id: ConsolidatedBarId,
    pub raw_start_id: RawBarId,
    pub raw_end_id: RawBarId,
    pub high: f64,
    pub low: f64,
    /// Raw bar that supplies `high`
    pub high_raw_id: RawBarId,
    /// Raw bar that supplies `low`
    pub low_raw_id: RawBarId,
    pub raw_count: usize,
    /// Direction relative to the previous consolidated bar (None for the first)
    pub direction: Option<Direction>,
}

impl ConsolidatedBar {
    fn open(id: ConsolidatedBarId, bar: &RawBar, direction: Option<Direction>) -> Self {
        Self {
            id,
            raw_start_id: bar.sequence,
            raw_end_id: bar.sequence,
            high: bar.high,
            low: bar.low,
            high_raw_id: bar.sequence,
            low_raw_id: bar.sequence,
            raw_count: 1,
            direction,
        }
    }

    /// Either range contains the other (shared edges count)
    pub fn is_inclusive(&self, high: f64, low: f64) -> bool {
        (self.high >= high && self.low <= low) || (high >= self.high && low <= self.low)
    }

    fn merge(&mut self, bar: &RawBar) {
        match self.direction {
            Some(Direction::Up) => {
                if bar.high > self.high {
                    self.high = bar.high;
                    self.high_raw_id = bar.sequence;
                }
                if bar.low > self.low {
                    self.low = bar.low;
                    self.low_raw_id = bar.sequence;
                }
            }
            Some(Direction::Down) => {
                if bar.high < self.high {
                    self.high = bar.high;
                    self.high_raw_id = bar.sequence;
                }
                if bar.low < self.low {
                    self.low = bar.low;
                    self.low_raw_id = bar.sequence;
                }
            }
            None => {
                if bar.high > self.high {
                    self.high = bar.high;
                    self.high_raw_id = bar.sequence;
                }
                if bar.low < self.low {
                    self.low = bar.low;
                    self.low_raw_id = bar.sequence;
                }
            }
        }
        self.raw_end_id = bar.sequence;
        self.raw_count += 1;
    }
}

/// What a single raw bar did to the consolidated sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsolidationChange {
    /// A new consolidated bar was opened (the previous one is now closed)
    Opened(ConsolidatedBarId),
    /// The last consolidated bar absorbed the raw bar
    Extended(ConsolidatedBarId),
}

impl ConsolidationChange {
    pub fn id(&self) -> ConsolidatedBarId {
        match *self {
            ConsolidationChange::Opened(id) | ConsolidationChange::Extended(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsolidatorCheckpoint {
    len: usize,
    last: Option<ConsolidatedBar>,
}

/// Incremental bar consolidator
#[derive(Debug, Clone, Default)]
pub struct BarConsolidator {
    bars: Vec<ConsolidatedBar>,
}

impl BarConsolidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch path: consolidate a complete raw sequence
    pub fn consolidate(raw: &[RawBar]) -> Vec<ConsolidatedBar> {
        let mut consolidator = Self::new();
        for bar in raw {
            consolidator.push(bar);
        }
        consolidator.bars
    }

    pub fn push(&mut self, bar: &RawBar) -> ConsolidationChange {
        let next_id = self.bars.len() as ConsolidatedBarId;
        let Some(last) = self.bars.last_mut() else {
            self.bars.push(ConsolidatedBar::open(next_id, bar, None));
            return ConsolidationChange::Opened(next_id);
        };

        if last.is_inclusive(bar.high, bar.low) {
            last.merge(bar);
            return ConsolidationChange::Extended(last.id);
        }

        // Not inclusive, so highs and lows move the same way
        let direction = if bar.high > last.high {
            Direction::Up
        } else {
            Direction::Down
        };
        self.bars
            .push(ConsolidatedBar::open(next_id, bar, Some(direction)));
        ConsolidationChange::Opened(next_id)
    }

    pub fn bars(&self) -> &[ConsolidatedBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Every consolidated bar except the last is closed
    pub fn is_closed(&self, id: ConsolidatedBarId) -> bool {
        (id as usize) + 1 < self.bars.len()
    }

    #[cfg(test)]
    pub(crate) fn bars_mut(&mut self) -> &mut [ConsolidatedBar] {
        &mut self.bars
    }

    pub fn checkpoint(&self) -> ConsolidatorCheckpoint {
        ConsolidatorCheckpoint {
            len: self.bars.len(),
            last: self.bars.last().cloned(),
        }
    }

    pub fn restore(&mut self, checkpoint: ConsolidatorCheckpoint) {
        self.bars.truncate(checkpoint.len);
        if let (Some(slot), Some(last)) = (self.bars.last_mut(), checkpoint.last) {
            *slot = last;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(seq: u64, high: f64, low: f64) -> RawBar {
        let ts = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap() + Duration::minutes(seq as i64);
        RawBar::new(seq, ts, low, high, low, high)
    }

    #[test]
    fn test_first_merge_is_union() {
        let mut c = BarConsolidator::new();
        c.push(&bar(1, 10.0, 8.0));
        let change = c.push(&bar(2, 11.0, 8.5));
        // 11/8.5 is not contained by 10/8; opens a new bar
        assert_eq!(change, ConsolidationChange::Opened(1));

        let mut c = BarConsolidator::new();
        c.push(&bar(1, 10.0, 8.0));
        c.push(&bar(2, 12.0, 7.0));
        assert_eq!(c.len(), 1);
        assert_eq!(c.bars()[0].high, 12.0);
        assert_eq!(c.bars()[0].low, 7.0);
        assert_eq!(c.bars()[0].raw_end_id, 2);
    }

    #[test]
    fn test_up_merge_keeps_higher_range() {
        let mut c = BarConsolidator::new();
        c.push(&bar(1, 10.0, 8.0));
        c.push(&bar(2, 12.0, 9.0));
        // contained inside bar 2 while moving up
        c.push(&bar(3, 11.5, 9.5));
        assert_eq!(c.len(), 2);
        let last = &c.bars()[1];
        assert_eq!(last.high, 12.0);
        assert_eq!(last.low, 9.5);
        assert_eq!(last.low_raw_id, 3);
        assert_eq!(last.raw_count, 2);
    }

    #[test]
    fn test_down_merge_keeps_lower_range() {
        let mut c = BarConsolidator::new();
        c.push(&bar(1, 12.0, 10.0));
        c.push(&bar(2, 11.0, 9.0));
        // contains bar 2 while moving down
        c.push(&bar(3, 11.5, 8.0));
        let last = &c.bars()[1];
        assert_eq!(last.high, 11.0);
        assert_eq!(last.low, 8.0);
        assert_eq!(last.direction, Some(Direction::Down));
    }

    #[test]
    fn test_equal_high_uses_direction() {
        let mut c = BarConsolidator::new();
        c.push(&bar(1, 10.0, 8.0));
        c.push(&bar(2, 12.0, 9.0));
        c.push(&bar(3, 12.0, 9.8));
        assert_eq!(c.len(), 2);
        assert_eq!(c.bars()[1].low, 9.8);
    }

    #[test]
    fn test_no_adjacent_containment() {
        let highs = [10.0, 11.0, 10.5, 12.0, 11.0, 11.2, 9.0, 9.5, 9.4, 13.0];
        let lows = [9.0, 9.5, 9.8, 10.0, 10.5, 10.4, 8.0, 8.8, 8.5, 9.0];
        let raw: Vec<RawBar> = highs
            .iter()
            .zip(lows.iter())
            .enumerate()
            .map(|(i, (h, l))| bar(i as u64 + 1, *h, *l))
            .collect();
        let bars = BarConsolidator::consolidate(&raw);
        for pair in bars.windows(2) {
            assert!(!pair[0].is_inclusive(pair[1].high, pair[1].low));
            assert_eq!(pair[0].raw_end_id + 1, pair[1].raw_start_id);
        }
        assert_eq!(bars.first().unwrap().raw_start_id, 1);
        assert_eq!(bars.last().unwrap().raw_end_id, 10);
    }

    #[test]
    fn test_restore_checkpoint() {
        let mut c = BarConsolidator::new();
        c.push(&bar(1, 10.0, 8.0));
        c.push(&bar(2, 12.0, 9.0));
        let cp = c.checkpoint();
        c.push(&bar(3, 11.5, 9.5));
        c.push(&bar(4, 14.0, 11.0));
        c.restore(cp);
        assert_eq!(c.len(), 2);
        assert_eq!(c.bars()[1].low, 9.0);
        assert_eq!(c.bars()[1].raw_end_id, 2);
    }
}
