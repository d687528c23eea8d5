//! Trend aggregation over confirmed swings
//!
//! A trend takes the direction of its first swing. Dominant swings that make a
//! new extremum extend it; countertrend swings are pullbacks while their
//! retracement of the trend range stays within the threshold. A trend completes
//! on an excessive retracement or when a dominant swing fails to make a new
//! extremum. Completed trends end at their extremum swing and the swings after
//! it are replayed into the next trend.

use super::swing::Swing;
use crate::config::TrendConfig;
use crate::error::{Result, Stage, StructureError};
use crate::types::{Direction, RawBarId, SwingId, TrendId, PRICE_EPSILON};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendCompletion {
    /// A countertrend swing retraced past the threshold
    Retracement,
    /// A dominant swing failed to make a new extremum
    Exhaustion,
}

impl std::fmt::Display for TrendCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrendCompletion::Retracement => write!(f, "retracement"),
            TrendCompletion::Exhaustion => write!(f, "exhaustion"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub id: TrendId,
    pub direction: Direction,
    /// Constituent swings in order
    pub swing_ids: Vec<SwingId>,
    pub start_swing_id: SwingId,
    pub end_swing_id: SwingId,
    /// Dominant swing holding the trend extremum
    pub extremum_swing_id: SwingId,
    pub start_raw_id: RawBarId,
    pub end_raw_id: RawBarId,
    pub high: f64,
    pub low: f64,
    pub completed: bool,
    pub completion: Option<TrendCompletion>,
    pub completed_at: Option<RawBarId>,
}

impl Trend {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    fn from_members(id: TrendId, direction: Direction, members: &[Swing]) -> Option<Self> {
        let first = members.first()?;
        let last = members.last()?;
        let extremum = extremum_index(direction, members).map(|i| members[i].id)?;
        let high = members.iter().map(|s| s.high).fold(f64::NEG_INFINITY, f64::max);
        let low = members.iter().map(|s| s.low).fold(f64::INFINITY, f64::min);
        Some(Self {
            id,
            direction,
            swing_ids: members.iter().map(|s| s.id).collect(),
            start_swing_id: first.id,
            end_swing_id: last.id,
            extremum_swing_id: extremum,
            start_raw_id: first.start_raw_id,
            end_raw_id: last.end_raw_id,
            high,
            low,
            completed: false,
            completion: None,
            completed_at: None,
        })
    }
}

/// Index of the dominant swing with the extreme price (earliest on ties)
fn extremum_index(direction: Direction, members: &[Swing]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, swing) in members.iter().enumerate() {
        if swing.direction != direction {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => match direction {
                Direction::Up => swing.high > members[b].high,
                Direction::Down => swing.low < members[b].low,
            },
        };
        if better {
            best = Some(i);
        }
    }
    best
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendUpdate {
    pub appended: Vec<TrendId>,
    pub revised: Vec<TrendId>,
    pub completed: Vec<TrendId>,
}

#[derive(Debug, Clone)]
pub struct TrendCheckpoint {
    trends_len: usize,
    last: Option<Trend>,
    members: Vec<Swing>,
    next_id: TrendId,
}

#[derive(Debug, Clone)]
pub struct TrendAggregator {
    config: TrendConfig,
    trends: Vec<Trend>,
    /// Swings of the trend under construction
    members: Vec<Swing>,
    next_id: TrendId,
}

impl TrendAggregator {
    pub fn new(config: TrendConfig) -> Self {
        Self {
            config,
            trends: Vec::new(),
            members: Vec::new(),
            next_id: 0,
        }
    }

    /// Batch path: aggregate every confirmed swing
    pub fn build(config: TrendConfig, swings: &[Swing]) -> Result<Self> {
        let mut aggregator = Self::new(config);
        aggregator.update(swings)?;
        Ok(aggregator)
    }

    pub fn update(&mut self, sealed: &[Swing]) -> Result<TrendUpdate> {
        let mut update = TrendUpdate::default();
        for swing in sealed {
            let sealed_at = swing.confirmed_at;
            let mut queue = VecDeque::from([swing.clone()]);
            while let Some(next) = queue.pop_front() {
                if let Some(replay) = self.advance(next, sealed_at, &mut update)? {
                    for swing in replay.into_iter().rev() {
                        queue.push_front(swing);
                    }
                }
            }
        }
        update.revised.retain(|id| !update.appended.contains(id));
        update.revised.dedup();
        Ok(update)
    }

    fn advance(
        &mut self,
        swing: Swing,
        sealed_at: Option<RawBarId>,
        update: &mut TrendUpdate,
    ) -> Result<Option<Vec<Swing>>> {
        let active = match self.trends.last() {
            Some(t) if !t.completed && !self.members.is_empty() => t.clone(),
            _ => {
                let id = self.next_id;
                self.next_id += 1;
                self.members = vec![swing];
                if let Some(trend) = Trend::from_members(id, self.members[0].direction, &self.members) {
                    self.trends.push(trend);
                }
                update.appended.push(id);
                return Ok(None);
            }
        };

        let continues = if swing.direction == active.direction {
            match active.direction {
                Direction::Up => swing.high > active.high,
                Direction::Down => swing.low < active.low,
            }
        } else {
            let range = active.range();
            let retracement = if range <= PRICE_EPSILON {
                f64::INFINITY
            } else {
                match active.direction {
                    Direction::Up => (active.high - swing.low) / range,
                    Direction::Down => (swing.high - active.low) / range,
                }
            };
            retracement <= self.config.retracement_threshold
        };

        if continues {
            self.members.push(swing);
            self.refresh(active.id)?;
            update.revised.push(active.id);
            return Ok(None);
        }

        let reason = if swing.direction == active.direction {
            TrendCompletion::Exhaustion
        } else {
            TrendCompletion::Retracement
        };
        let replay = self.complete(&active, reason, swing, sealed_at)?;
        update.completed.push(active.id);
        Ok(Some(replay))
    }

    fn refresh(&mut self, id: TrendId) -> Result<()> {
        let Some(direction) = self.trends.last().map(|t| t.direction) else {
            return Ok(());
        };
        let trend = Trend::from_members(id, direction, &self.members).ok_or_else(|| {
            StructureError::invariant(Stage::Trend, vec![id], "trend has no dominant swing")
        })?;
        if let Some(slot) = self.trends.last_mut() {
            *slot = trend;
        }
        Ok(())
    }

    /// Seal the active trend at its extremum; returns the swings to replay
    fn complete(
        &mut self,
        active: &Trend,
        reason: TrendCompletion,
        trigger: Swing,
        completed_at: Option<RawBarId>,
    ) -> Result<Vec<Swing>> {
        let extremum = extremum_index(active.direction, &self.members).ok_or_else(|| {
            StructureError::invariant(Stage::Trend, vec![active.id], "trend has no dominant swing")
        })?;
        let mut members = std::mem::take(&mut self.members);
        let mut replay = members.split_off(extremum + 1);
        replay.push(trigger);

        let mut trend = Trend::from_members(active.id, active.direction, &members).ok_or_else(|| {
            StructureError::invariant(Stage::Trend, vec![active.id], "completed trend is empty")
        })?;
        if members[0].direction != trend.direction {
            return Err(StructureError::invariant(
                Stage::Trend,
                vec![trend.id, members[0].id],
                format!("{} trend opened by a {} swing", trend.direction, members[0].direction),
            ));
        }
        trend.completed = true;
        trend.completion = Some(reason);
        trend.completed_at = completed_at;
        info!(
            trend = trend.id,
            direction = %trend.direction,
            swings = trend.swing_ids.len(),
            reason = %reason,
            "trend completed"
        );
        if let Some(slot) = self.trends.last_mut() {
            *slot = trend;
        }
        Ok(replay)
    }

    pub fn trends(&self) -> &[Trend] {
        &self.trends
    }

    /// Trend under construction
    pub fn active(&self) -> Option<&Trend> {
        self.trends.last().filter(|t| !t.completed)
    }

    pub fn completed(&self) -> impl Iterator<Item = &Trend> {
        self.trends.iter().filter(|t| t.completed)
    }

    pub fn checkpoint(&self) -> TrendCheckpoint {
        TrendCheckpoint {
            trends_len: self.trends.len(),
            last: self.trends.last().cloned(),
            members: self.members.clone(),
            next_id: self.next_id,
        }
    }

    pub fn restore(&mut self, checkpoint: TrendCheckpoint) {
        self.trends.truncate(checkpoint.trends_len);
        if let (Some(slot), Some(last)) = (self.trends.last_mut(), checkpoint.last) {
            *slot = last;
        }
        self.members = checkpoint.members;
        self.next_id = checkpoint.next_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::fractal::FractalKind;
    use crate::structure::swing::SwingState;

    fn swing(id: u64, direction: Direction, from: f64, to: f64) -> Swing {
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
            start_raw_id: id * 10,
            end_raw_id: id * 10 + 10,
            start_kind,
            end_kind,
            high: from.max(to),
            low: from.min(to),
            relation: None,
            confirmed_at: Some(id * 10 + 14),
            transitions: vec![SwingState::Forming, SwingState::PendingReverse, SwingState::Confirmed],
        }
    }

    #[test]
    fn test_pullback_is_tolerated() {
        let swings = vec![
            swing(0, Direction::Up, 10.0, 20.0),
            swing(1, Direction::Down, 20.0, 16.0),
            swing(2, Direction::Up, 16.0, 25.0),
        ];
        let agg = TrendAggregator::build(TrendConfig::default(), &swings).unwrap();
        assert_eq!(agg.trends().len(), 1);
        let trend = agg.active().unwrap();
        assert_eq!(trend.direction, Direction::Up);
        assert_eq!(trend.swing_ids, vec![0, 1, 2]);
        assert_eq!(trend.extremum_swing_id, 2);
        assert_eq!((trend.high, trend.low), (25.0, 10.0));
    }

    #[test]
    fn test_deep_retracement_completes_trend() {
        let swings = vec![
            swing(0, Direction::Up, 10.0, 20.0),
            swing(1, Direction::Down, 20.0, 16.0),
            swing(2, Direction::Up, 16.0, 25.0),
            swing(3, Direction::Down, 25.0, 12.0),
        ];
        let agg = TrendAggregator::build(TrendConfig::default(), &swings).unwrap();
        assert_eq!(agg.trends().len(), 2);
        let up = &agg.trends()[0];
        assert!(up.completed);
        assert_eq!(up.completion, Some(TrendCompletion::Retracement));
        assert_eq!(up.end_swing_id, 2);
        assert_eq!(up.completed_at, Some(44));
        let down = agg.active().unwrap();
        assert_eq!(down.direction, Direction::Down);
        assert_eq!(down.swing_ids, vec![3]);
    }

    #[test]
    fn test_exhaustion_trims_to_extremum_and_replays() {
        let swings = vec![
            swing(0, Direction::Up, 10.0, 20.0),
            swing(1, Direction::Down, 20.0, 15.0),
            swing(2, Direction::Up, 15.0, 19.0),
        ];
        let agg = TrendAggregator::build(TrendConfig::default(), &swings).unwrap();
        let trends = agg.trends();
        assert_eq!(trends.len(), 3);
        assert_eq!(trends[0].swing_ids, vec![0]);
        assert_eq!(trends[0].completion, Some(TrendCompletion::Exhaustion));
        // the replayed down trend cannot absorb an 80% retracement
        assert_eq!(trends[1].direction, Direction::Down);
        assert_eq!(trends[1].swing_ids, vec![1]);
        assert_eq!(trends[1].completion, Some(TrendCompletion::Retracement));
        assert_eq!(trends[2].direction, Direction::Up);
        assert!(!trends[2].completed);
    }

    #[test]
    fn test_incremental_matches_batch() {
        let swings = vec![
            swing(0, Direction::Up, 10.0, 20.0),
            swing(1, Direction::Down, 20.0, 15.0),
            swing(2, Direction::Up, 15.0, 19.0),
            swing(3, Direction::Down, 19.0, 8.0),
            swing(4, Direction::Up, 8.0, 11.0),
            swing(5, Direction::Down, 11.0, 6.0),
        ];
        let batch = TrendAggregator::build(TrendConfig::default(), &swings).unwrap();
        let mut incremental = TrendAggregator::new(TrendConfig::default());
        for s in &swings {
            incremental.update(std::slice::from_ref(s)).unwrap();
        }
        assert_eq!(batch.trends(), incremental.trends());
    }

    #[test]
    fn test_trend_boundaries_available_mid_formation() {
        let mut agg = TrendAggregator::new(TrendConfig::default());
        let update = agg.update(&[swing(0, Direction::Down, 30.0, 20.0)]).unwrap();
        assert_eq!(update.appended, vec![0]);
        let trend = agg.active().unwrap();
        assert_eq!((trend.start_swing_id, trend.end_swing_id), (0, 0));
        assert_eq!((trend.start_raw_id, trend.end_raw_id), (0, 10));
    }
}
