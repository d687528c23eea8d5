//! One (symbol, timeframe) processing context
//!
//! Owns every stage and runs the cascade for each raw bar atomically: all
//! stages are checkpointed first and restored if any stage fails, so a
//! rejected bar leaves no trace. Invariant violations halt the context.

use super::events::{Backtrack, CascadeEvent, StageDelta};
use crate::config::StructureConfig;
use crate::error::{Result, Stage, StructureError};
use crate::scoring::{self, ScoringConfig, StructuralWindow, SupplyDemandResult};
use crate::structure::consolidator::{BarConsolidator, ConsolidatedBar, ConsolidationChange, ConsolidatorCheckpoint};
use crate::structure::fractal::{Fractal, FractalCandidate, FractalCheckpoint, FractalDetector, FractalLabel};
use crate::structure::invariants;
use crate::structure::keyzone::{KeyZone, KeyZoneDeriver, ZoneCheckpoint, ZoneSignal};
use crate::structure::swing::{Swing, SwingBuilder, SwingCheckpoint};
use crate::structure::trend::{Trend, TrendAggregator, TrendCheckpoint};
use crate::types::{ConsolidatedBarId, ContextKey, RawBar, RawBarId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Capacity of the commit notification channel
const EVENT_CAPACITY: usize = 1024;

/// Bounded view of the most recent structure of one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureSnapshot {
    pub key: ContextKey,
    pub commit_seq: u64,
    pub raw_count: usize,
    pub last_raw_id: Option<RawBarId>,
    pub consolidated: Vec<ConsolidatedBar>,
    pub fractals: Vec<Fractal>,
    pub pending_candidate: Option<FractalCandidate>,
    /// Sealed swings followed by the swing under construction
    pub swings: Vec<Swing>,
    pub trends: Vec<Trend>,
    pub zones: Vec<KeyZone>,
    pub latest_signal: Option<ZoneSignal>,
    pub score: Option<SupplyDemandResult>,
}

/// Latest entity of each stage for one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframeAnalysis {
    pub key: ContextKey,
    pub commit_seq: u64,
    pub latest_consolidated: Option<ConsolidatedBar>,
    /// The swing under construction, or the last sealed one
    pub latest_swing: Option<Swing>,
    pub latest_trend: Option<Trend>,
    pub latest_signal: Option<ZoneSignal>,
    pub score: Option<SupplyDemandResult>,
}

struct Checkpoint {
    raw_len: usize,
    consolidator: ConsolidatorCheckpoint,
    fractals: FractalCheckpoint,
    swings: SwingCheckpoint,
    trends: TrendCheckpoint,
    zones: ZoneCheckpoint,
    latest: Option<SupplyDemandResult>,
}

pub struct PipelineContext {
    key: ContextKey,
    structure: StructureConfig,
    scoring: ScoringConfig,
    raw: Vec<RawBar>,
    consolidator: BarConsolidator,
    fractals: FractalDetector,
    swings: SwingBuilder,
    trends: TrendAggregator,
    zones: KeyZoneDeriver,
    latest: Option<SupplyDemandResult>,
    commit_seq: u64,
    halted: Option<StructureError>,
    event_tx: broadcast::Sender<CascadeEvent>,
}

impl PipelineContext {
    pub fn new(key: ContextKey, structure: StructureConfig, scoring: ScoringConfig) -> Result<Self> {
        structure.validate()?;
        scoring.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            key,
            consolidator: BarConsolidator::new(),
            fractals: FractalDetector::new(),
            swings: SwingBuilder::new(structure.swing.clone()),
            trends: TrendAggregator::new(structure.trend.clone()),
            zones: KeyZoneDeriver::new(structure.zones.clone()),
            structure,
            scoring,
            raw: Vec::new(),
            latest: None,
            commit_seq: 0,
            halted: None,
            event_tx,
        })
    }

    /// Batch path: every stage computed over the complete upstream output
    pub fn from_batch(
        key: ContextKey,
        structure: StructureConfig,
        scoring: ScoringConfig,
        bars: Vec<RawBar>,
    ) -> Result<Self> {
        let mut context = Self::new(key, structure, scoring)?;
        for bar in &bars {
            context.check_input(bar)?;
            context.raw.push(bar.clone());
        }

        let mut consolidator = BarConsolidator::new();
        for bar in &context.raw {
            consolidator.push(bar);
        }
        let fractals = FractalDetector::detect(consolidator.bars());
        let swings = SwingBuilder::build(
            context.structure.swing.clone(),
            fractals.fractals(),
            consolidator.bars(),
        )?;
        let trends = TrendAggregator::build(context.structure.trend.clone(), swings.sealed())?;
        let zones = KeyZoneDeriver::replay(
            context.structure.zones.clone(),
            swings.sealed(),
            trends.trends(),
            &context.raw,
        );

        context.consolidator = consolidator;
        context.fractals = fractals;
        context.swings = swings;
        context.trends = trends;
        context.zones = zones;
        context.commit_seq = context.raw.len() as u64;
        if !context.raw.is_empty() {
            context.latest = Some(context.compute_score());
        }
        debug!(key = %context.key, bars = context.raw.len(), "context built from batch");
        Ok(context)
    }

    /// Apply one raw bar through the full cascade
    pub fn push(&mut self, bar: RawBar) -> Result<CascadeEvent> {
        if let Some(cause) = &self.halted {
            return Err(StructureError::ContextHalted {
                key: self.key.clone(),
                cause: cause.to_string(),
            });
        }
        if let Err(e) = self.check_input(&bar) {
            warn!(key = %self.key, "bar rejected: {}", e);
            return Err(e);
        }

        let checkpoint = self.checkpoint();
        match self.cascade(bar) {
            Ok(event) => {
                // No subscribers is fine
                let _ = self.event_tx.send(event.clone());
                Ok(event)
            }
            Err(e) => {
                self.restore(checkpoint);
                if e.is_fatal() {
                    error!(key = %self.key, "context halted: {}", e);
                    self.halted = Some(e.clone());
                }
                Err(e)
            }
        }
    }

    /// Push bars in order, stopping at the first rejection
    pub fn extend<I>(&mut self, bars: I) -> Result<Vec<CascadeEvent>>
    where
        I: IntoIterator<Item = RawBar>,
    {
        bars.into_iter().map(|bar| self.push(bar)).collect()
    }

    fn check_input(&self, bar: &RawBar) -> Result<()> {
        if !bar.is_well_formed() {
            return Err(StructureError::InvalidBar {
                key: self.key.clone(),
                sequence: bar.sequence,
                detail: format!(
                    "o={} h={} l={} c={} is not a consistent finite bar",
                    bar.open, bar.high, bar.low, bar.close
                ),
            });
        }
        if let Some(previous) = self.raw.last() {
            if bar.sequence <= previous.sequence || bar.timestamp < previous.timestamp {
                return Err(StructureError::InputOrdering {
                    key: self.key.clone(),
                    sequence: bar.sequence,
                    timestamp: bar.timestamp,
                    previous_sequence: previous.sequence,
                    previous_timestamp: previous.timestamp,
                });
            }
        }
        Ok(())
    }

    fn cascade(&mut self, bar: RawBar) -> Result<CascadeEvent> {
        let raw_id = bar.sequence;
        let change = self.consolidator.push(&bar);
        self.raw.push(bar);
        let bars = self.consolidator.bars();
        invariants::check_tail(&self.raw, bars)?;

        let fractal_update = self.fractals.update(bars)?;
        let swing_update = self.swings.update(&fractal_update.confirmed, bars)?;
        let sealed: Vec<Swing> = self
            .swings
            .sealed()
            .iter()
            .filter(|s| swing_update.sealed.contains(&s.id))
            .cloned()
            .collect();
        let trend_update = self.trends.update(&sealed)?;
        let completed: Vec<Trend> = self
            .trends
            .trends()
            .iter()
            .filter(|t| trend_update.completed.contains(&t.id))
            .cloned()
            .collect();
        let zone_update = self.zones.on_bar(&sealed, &completed, &self.raw);

        let score = self.compute_score();
        self.latest = Some(score.clone());
        self.commit_seq += 1;

        let consolidated = match change {
            ConsolidationChange::Opened(id) => StageDelta {
                appended: vec![id],
                revised: Vec::new(),
            },
            ConsolidationChange::Extended(id) => StageDelta {
                appended: Vec::new(),
                revised: vec![id],
            },
        };
        let backtrack = fractal_update
            .backtrack_from
            .map(|from_id| Backtrack {
                stage: Stage::Fractal,
                from_id,
            })
            .or(swing_update.backtrack_from.map(|from_id| Backtrack {
                stage: Stage::Swing,
                from_id,
            }));

        debug!(
            key = %self.key,
            commit = self.commit_seq,
            raw = raw_id,
            score = score.score,
            stage = %score.stage,
            "cascade committed"
        );
        Ok(CascadeEvent {
            key: self.key.clone(),
            commit_seq: self.commit_seq,
            raw_id,
            consolidated,
            fractals: StageDelta {
                appended: fractal_update.confirmed.iter().map(|f| f.cbar_id).collect(),
                revised: fractal_update.revised,
            },
            swings: StageDelta {
                appended: swing_update.sealed,
                revised: swing_update.active.into_iter().collect(),
            },
            trends: StageDelta {
                appended: trend_update.appended,
                revised: trend_update.revised,
            },
            completed_trends: trend_update.completed,
            zones: StageDelta {
                appended: zone_update.created,
                revised: zone_update.touched,
            },
            backtrack,
            signal: zone_update.signal,
            score,
        })
    }

    fn compute_score(&self) -> SupplyDemandResult {
        let from = self.raw.len().saturating_sub(self.scoring.window_bars);
        let window = StructuralWindow {
            bars: &self.raw[from..],
            sealed_swings: self.swings.sealed(),
            active_swing: self.swings.active(),
            trend: self.trends.trends().last(),
            zones: self.zones.active_zones(),
            signal: self.zones.latest_signal(),
        };
        scoring::score(&window, &self.scoring)
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            raw_len: self.raw.len(),
            consolidator: self.consolidator.checkpoint(),
            fractals: self.fractals.checkpoint(),
            swings: self.swings.checkpoint(),
            trends: self.trends.checkpoint(),
            zones: self.zones.checkpoint(),
            latest: self.latest.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.raw.truncate(checkpoint.raw_len);
        self.consolidator.restore(checkpoint.consolidator);
        self.fractals.restore(checkpoint.fractals);
        self.swings.restore(checkpoint.swings);
        self.trends.restore(checkpoint.trends);
        self.zones.restore(checkpoint.zones);
        self.latest = checkpoint.latest;
    }

    /// Subscribe to commit notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CascadeEvent> {
        self.event_tx.subscribe()
    }

    /// Swap the scoring configuration; applies from the next commit
    pub fn set_scoring_config(&mut self, scoring: ScoringConfig) -> Result<()> {
        scoring.validate()?;
        self.scoring = scoring;
        Ok(())
    }

    /// Drop every entity and clear a halt
    pub fn reset(&mut self) {
        self.raw.clear();
        self.consolidator = BarConsolidator::new();
        self.fractals = FractalDetector::new();
        self.swings = SwingBuilder::new(self.structure.swing.clone());
        self.trends = TrendAggregator::new(self.structure.trend.clone());
        self.zones = KeyZoneDeriver::new(self.structure.zones.clone());
        self.latest = None;
        self.commit_seq = 0;
        self.halted = None;
        debug!(key = %self.key, "context reset");
    }

    /// Bounded view holding at most `depth` of the most recent entities of each kind
    pub fn snapshot(&self, depth: usize) -> StructureSnapshot {
        fn tail<T: Clone>(items: &[T], depth: usize) -> Vec<T> {
            items[items.len().saturating_sub(depth)..].to_vec()
        }
        let swings = self.swings.all();
        StructureSnapshot {
            key: self.key.clone(),
            commit_seq: self.commit_seq,
            raw_count: self.raw.len(),
            last_raw_id: self.raw.last().map(|b| b.sequence),
            consolidated: tail(self.consolidator.bars(), depth),
            fractals: tail(self.fractals.fractals(), depth),
            pending_candidate: self.fractals.pending_candidate(self.consolidator.bars()),
            swings: tail(&swings, depth),
            trends: tail(self.trends.trends(), depth),
            zones: tail(self.zones.zones(), depth),
            latest_signal: self.zones.latest_signal().cloned(),
            score: self.latest.clone(),
        }
    }

    pub fn analysis(&self) -> TimeframeAnalysis {
        TimeframeAnalysis {
            key: self.key.clone(),
            commit_seq: self.commit_seq,
            latest_consolidated: self.consolidator.bars().last().cloned(),
            latest_swing: self.swings.active().or_else(|| self.swings.sealed().last()).cloned(),
            latest_trend: self.trends.trends().last().cloned(),
            latest_signal: self.zones.latest_signal().cloned(),
            score: self.latest.clone(),
        }
    }

    /// Run every structural invariant check over the full state
    pub fn audit(&self) -> Result<()> {
        invariants::audit(
            &self.raw,
            self.consolidator.bars(),
            self.fractals.labels(),
            &self.swings.all(),
            self.trends.trends(),
            self.zones.zones(),
        )
    }

    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    pub fn raw(&self) -> &[RawBar] {
        &self.raw
    }

    pub fn consolidated(&self) -> &[ConsolidatedBar] {
        self.consolidator.bars()
    }

    pub fn labels(&self) -> &[FractalLabel] {
        self.fractals.labels()
    }

    pub fn fractals(&self) -> &[Fractal] {
        self.fractals.fractals()
    }

    pub fn fractal_at(&self, cbar_id: ConsolidatedBarId) -> Option<&Fractal> {
        self.fractals.fractal_at(cbar_id)
    }

    pub fn prev_fractal(&self, cbar_id: ConsolidatedBarId) -> Option<&Fractal> {
        self.fractals.prev_fractal(cbar_id)
    }

    pub fn next_fractal(&self, cbar_id: ConsolidatedBarId) -> Option<&Fractal> {
        self.fractals.next_fractal(cbar_id)
    }

    pub fn latest_fractal(&self) -> Option<&Fractal> {
        self.fractals.latest_fractal()
    }

    pub fn pending_candidate(&self) -> Option<FractalCandidate> {
        self.fractals.pending_candidate(self.consolidator.bars())
    }

    pub fn sealed_swings(&self) -> &[Swing] {
        self.swings.sealed()
    }

    pub fn active_swing(&self) -> Option<&Swing> {
        self.swings.active()
    }

    pub fn trends(&self) -> &[Trend] {
        self.trends.trends()
    }

    pub fn zones(&self) -> &[KeyZone] {
        self.zones.zones()
    }

    pub fn latest_signal(&self) -> Option<&ZoneSignal> {
        self.zones.latest_signal()
    }

    pub fn latest_result(&self) -> Option<&SupplyDemandResult> {
        self.latest.as_ref()
    }

    pub fn commit_seq(&self) -> u64 {
        self.commit_seq
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn structure_config(&self) -> &StructureConfig {
        &self.structure
    }

    pub fn scoring_config(&self) -> &ScoringConfig {
        &self.scoring
    }
}
