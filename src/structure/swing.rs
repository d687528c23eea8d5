//! Swing construction from confirmed fractals
//!
//! Each swing runs through an explicit lifecycle:
//! 1. Forming: origin fixed, no opposing fractal accepted yet
//! 2. PendingReverse: an opposing fractal is the candidate end
//! 3. Confirmed: a later fractal of the origin's type validated the reversal
//!
//! PendingReverse falls back to Forming when the reversal is not validated.
//! On confirmation the next swing starts from the candidate. That successor is
//! kept up to date from the moment the candidate appears, so confirming a swing
//! never revisits earlier fractals.

use super::consolidator::ConsolidatedBar;
use super::envelope::{Envelope, EnvelopeRelation};
use super::fractal::{Fractal, FractalKind};
use crate::config::SwingConfig;
use crate::error::{Result, Stage, StructureError};
use crate::types::{ConsolidatedBarId, Direction, RawBarId, SwingId, PRICE_EPSILON};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwingState {
    Forming,
    PendingReverse,
    Confirmed,
}

impl std::fmt::Display for SwingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwingState::Forming => write!(f, "FORMING"),
            SwingState::PendingReverse => write!(f, "PENDING_REVERSE"),
            SwingState::Confirmed => write!(f, "CONFIRMED"),
        }
    }
}

/// A directional move between two opposite fractals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swing {
    pub id: SwingId,
    pub direction: Direction,
    pub state: SwingState,
    pub start_cbar_id: ConsolidatedBarId,
    pub end_cbar_id: ConsolidatedBarId,
    pub start_raw_id: RawBarId,
    pub end_raw_id: RawBarId,
    pub start_kind: FractalKind,
    /// `None` while the swing has no candidate end
    pub end_kind: FractalKind,
    pub high: f64,
    pub low: f64,
    /// Relation between the start and end fractal envelopes
    pub relation: Option<EnvelopeRelation>,
    /// Raw bar whose arrival sealed the swing
    pub confirmed_at: Option<RawBarId>,
    /// Lifecycle states entered, in order: the initial one and the most recent
    pub transitions: Vec<SwingState>,
}

impl Swing {
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == SwingState::Confirmed
    }
}

/// Lifecycle states kept per swing
pub const TRANSITION_HISTORY: usize = 16;

/// Phase of the swing under construction
#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Forming,
    PendingReverse { candidate: Fractal },
}

#[derive(Debug, Clone, PartialEq)]
struct ActiveSwing {
    id: SwingId,
    direction: Direction,
    origin: Fractal,
    /// Most extreme end-type fractal since the origin
    extreme: Option<Fractal>,
    phase: Phase,
    transitions: Vec<SwingState>,
}

impl ActiveSwing {
    fn new(id: SwingId, origin: Fractal) -> Self {
        let direction = match origin.kind {
            FractalKind::Bottom => Direction::Up,
            _ => Direction::Down,
        };
        Self {
            id,
            direction,
            origin,
            extreme: None,
            phase: Phase::Forming,
            transitions: vec![SwingState::Forming],
        }
    }

    fn end_kind(&self) -> FractalKind {
        self.origin.kind.opposite()
    }

    fn state(&self) -> SwingState {
        match self.phase {
            Phase::Forming => SwingState::Forming,
            Phase::PendingReverse { .. } => SwingState::PendingReverse,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.record(self.state());
    }

    fn record(&mut self, state: SwingState) {
        if self.transitions.len() >= TRANSITION_HISTORY {
            self.transitions.remove(1);
        }
        self.transitions.push(state);
    }

    /// Take an end-type fractal. Returns whether it became the new extreme.
    fn take_end(&mut self, fractal: &Fractal) -> bool {
        let extends = self
            .extreme
            .as_ref()
            .map_or(true, |e| fractal.is_more_extreme_than(e));
        if extends {
            self.extreme = Some(fractal.clone());
        }
        if self.phase == Phase::Forming {
            let candidate = self.extreme.clone().unwrap_or_else(|| fractal.clone());
            self.enter(Phase::PendingReverse { candidate });
        } else if extends {
            self.phase = Phase::PendingReverse {
                candidate: fractal.clone(),
            };
        }
        extends
    }

    /// Drop the candidate end. Returns whether there was one.
    fn withdraw(&mut self) -> bool {
        if self.phase == Phase::Forming {
            return false;
        }
        self.enter(Phase::Forming);
        true
    }

    /// Advance a successor that has not started yet.
    ///
    /// Every origin-type fractal it sees already failed the second leg of the
    /// swing in front of it, against a smaller reference range, so the
    /// successor can only withdraw its candidate and never confirm.
    fn follow(&mut self, fractal: &Fractal) {
        if fractal.kind == self.end_kind() {
            self.take_end(fractal);
        } else if self.extreme.is_some() {
            self.withdraw();
        }
    }
}

/// Envelope relation of a valid leg from `a` to `b`, or None if the leg is not valid
pub fn leg_relation(
    config: &SwingConfig,
    a: &Fractal,
    b: &Fractal,
    previous_range: Option<f64>,
) -> Option<EnvelopeRelation> {
    if a.kind == FractalKind::None || b.kind != a.kind.opposite() {
        return None;
    }
    let gap = b.cbar_id.checked_sub(a.cbar_id)? as usize;
    if gap < config.min_fractal_gap {
        return None;
    }
    let progressing = match a.kind {
        FractalKind::Bottom => b.envelope.high > a.envelope.high && b.envelope.low > a.envelope.low,
        _ => b.envelope.high < a.envelope.high && b.envelope.low < a.envelope.low,
    };
    if !progressing {
        return None;
    }
    match a.envelope.relation(&b.envelope) {
        EnvelopeRelation::Intersecting => {
            let distance = (b.price - a.price).abs();
            let strong_enough = previous_range
                .map(|range| range > PRICE_EPSILON && distance / range >= config.overlap_distance_ratio)
                .unwrap_or(false);
            (gap >= config.overlap_fractal_gap && strong_enough)
                .then_some(EnvelopeRelation::Intersecting)
        }
        relation => Some(relation),
    }
}

fn span(bars: &[ConsolidatedBar], from: ConsolidatedBarId, to: ConsolidatedBarId) -> Envelope {
    let last = bars.len().saturating_sub(1);
    let from = (from as usize).min(last);
    let to = (to as usize).min(last).max(from);
    Envelope::spanning(&bars[from..=to])
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwingUpdate {
    /// Swings confirmed by this update
    pub sealed: Vec<SwingId>,
    /// Swing under construction, if it changed
    pub active: Option<SwingId>,
    /// Swing whose candidate end or origin was withdrawn
    pub backtrack_from: Option<SwingId>,
}

#[derive(Debug, Clone)]
pub struct SwingCheckpoint {
    sealed_len: usize,
    active: Option<ActiveSwing>,
    successor: Option<ActiveSwing>,
    provisional: Option<Swing>,
    next_id: SwingId,
}

#[derive(Debug, Clone)]
pub struct SwingBuilder {
    config: SwingConfig,
    sealed: Vec<Swing>,
    active: Option<ActiveSwing>,
    /// Swing starting at the active extreme, followed while that extreme holds.
    /// None while the leg to the extreme cannot be confirmed.
    successor: Option<ActiveSwing>,
    provisional: Option<Swing>,
    next_id: SwingId,
}

impl SwingBuilder {
    pub fn new(config: SwingConfig) -> Self {
        Self {
            config,
            sealed: Vec::new(),
            active: None,
            successor: None,
            provisional: None,
            next_id: 0,
        }
    }

    /// Batch path: build swings from every confirmed fractal
    pub fn build(config: SwingConfig, fractals: &[Fractal], bars: &[ConsolidatedBar]) -> Result<Self> {
        let mut builder = Self::new(config);
        builder.update(fractals, bars)?;
        Ok(builder)
    }

    /// Feed newly confirmed fractals, then refresh the swing under construction
    pub fn update(&mut self, confirmed: &[Fractal], bars: &[ConsolidatedBar]) -> Result<SwingUpdate> {
        let mut update = SwingUpdate::default();
        for fractal in confirmed {
            self.feed(fractal.clone(), bars, &mut update)?;
        }

        let provisional = self.active.as_ref().map(|a| materialize(a, bars));
        if provisional != self.provisional {
            update.active = provisional.as_ref().map(|s| s.id);
        }
        self.provisional = provisional;
        Ok(update)
    }

    /// Apply one fractal
    fn feed(&mut self, fractal: Fractal, bars: &[ConsolidatedBar], update: &mut SwingUpdate) -> Result<()> {
        if self.active.is_none() {
            debug!(cbar = fractal.cbar_id, kind = %fractal.kind, "first swing origin");
            self.active = Some(ActiveSwing::new(self.next_id, fractal));
            self.next_id += 1;
            return Ok(());
        }
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let previous_range = self.sealed.last().map(|s| s.range());

        if fractal.kind == active.end_kind() {
            if active.take_end(&fractal) {
                self.successor = leg_relation(&self.config, &active.origin, &fractal, previous_range)
                    .map(|_| ActiveSwing::new(self.next_id, fractal));
            } else if let Some(successor) = self.successor.as_mut() {
                successor.follow(&fractal);
            }
            return Ok(());
        }

        // Fractal of the origin's type
        if let Some(successor) = self.successor.as_mut() {
            successor.follow(&fractal);
        }
        let Some(candidate) = active.extreme.clone() else {
            if !fractal.is_more_extreme_than(&active.origin) {
                return Ok(());
            }
            if self.sealed.is_empty() {
                active.origin = fractal;
            } else {
                debug!(swing = active.id, cbar = fractal.cbar_id, "origin pinned to the sealed chain");
            }
            return Ok(());
        };

        let first_leg = leg_relation(&self.config, &active.origin, &candidate, previous_range);
        let second_leg = first_leg.and_then(|_| {
            let leg_range = (candidate.price - active.origin.price).abs();
            leg_relation(&self.config, &candidate, &fractal, Some(leg_range))
        });

        if let (Some(relation), Some(_)) = (first_leg, second_leg) {
            if active.phase == Phase::Forming {
                active.enter(Phase::PendingReverse {
                    candidate: candidate.clone(),
                });
            }
            active.record(SwingState::Confirmed);
            let swing = seal(active, &candidate, relation, fractal.confirmed_at, bars);
            self.check_sealed(&swing)?;
            info!(
                swing = swing.id,
                direction = %swing.direction,
                start = swing.start_cbar_id,
                end = swing.end_cbar_id,
                relation = %relation,
                "swing confirmed"
            );
            update.sealed.push(swing.id);
            let range = swing.range();
            self.sealed.push(swing);

            let mut next = self
                .successor
                .take()
                .unwrap_or_else(|| ActiveSwing::new(self.next_id, candidate));
            next.id = self.next_id;
            self.next_id += 1;
            self.successor = next.extreme.as_ref().and_then(|extreme| {
                leg_relation(&self.config, &next.origin, extreme, Some(range))
                    .map(|_| ActiveSwing::new(self.next_id, extreme.clone()))
            });
            self.active = Some(next);
            return Ok(());
        }

        if fractal.is_more_extreme_than(&active.origin) {
            if self.sealed.is_empty() {
                // Nothing sealed yet: the move really starts from the new extreme
                debug!(swing = active.id, cbar = fractal.cbar_id, "swing origin re-anchored");
                active.origin = fractal;
                active.extreme = None;
                active.withdraw();
                self.successor = None;
                update.backtrack_from.get_or_insert(active.id);
                return Ok(());
            }
            debug!(swing = active.id, cbar = fractal.cbar_id, "origin pinned to the sealed chain");
        }

        if active.withdraw() {
            debug!(swing = active.id, cbar = fractal.cbar_id, "candidate reversal discarded");
            update.backtrack_from.get_or_insert(active.id);
        }
        Ok(())
    }

    fn check_sealed(&self, swing: &Swing) -> Result<()> {
        let expected = match swing.direction {
            Direction::Up => (FractalKind::Bottom, FractalKind::Top),
            Direction::Down => (FractalKind::Top, FractalKind::Bottom),
        };
        if (swing.start_kind, swing.end_kind) != expected {
            return Err(StructureError::invariant(
                Stage::Swing,
                vec![swing.id, swing.start_cbar_id, swing.end_cbar_id],
                format!(
                    "{} swing anchored {} -> {}",
                    swing.direction, swing.start_kind, swing.end_kind
                ),
            ));
        }
        if let Some(previous) = self.sealed.last() {
            if previous.end_cbar_id != swing.start_cbar_id || previous.direction == swing.direction {
                return Err(StructureError::invariant(
                    Stage::Swing,
                    vec![previous.id, swing.id],
                    "sealed swings do not chain",
                ));
            }
        }
        Ok(())
    }

    /// Sealed (Confirmed) swings in order
    pub fn sealed(&self) -> &[Swing] {
        &self.sealed
    }

    /// Swing under construction
    pub fn active(&self) -> Option<&Swing> {
        self.provisional.as_ref()
    }

    /// Sealed swings followed by the swing under construction
    pub fn all(&self) -> Vec<Swing> {
        self.sealed
            .iter()
            .chain(self.provisional.iter())
            .cloned()
            .collect()
    }

    pub fn checkpoint(&self) -> SwingCheckpoint {
        SwingCheckpoint {
            sealed_len: self.sealed.len(),
            active: self.active.clone(),
            successor: self.successor.clone(),
            provisional: self.provisional.clone(),
            next_id: self.next_id,
        }
    }

    pub fn restore(&mut self, checkpoint: SwingCheckpoint) {
        self.sealed.truncate(checkpoint.sealed_len);
        self.active = checkpoint.active;
        self.successor = checkpoint.successor;
        self.provisional = checkpoint.provisional;
        self.next_id = checkpoint.next_id;
    }
}

fn seal(
    active: &ActiveSwing,
    end: &Fractal,
    relation: EnvelopeRelation,
    confirmed_at: RawBarId,
    bars: &[ConsolidatedBar],
) -> Swing {
    let envelope = span(bars, active.origin.cbar_id, end.cbar_id);
    Swing {
        id: active.id,
        direction: active.direction,
        state: SwingState::Confirmed,
        start_cbar_id: active.origin.cbar_id,
        end_cbar_id: end.cbar_id,
        start_raw_id: active.origin.extreme_raw_id,
        end_raw_id: end.extreme_raw_id,
        start_kind: active.origin.kind,
        end_kind: end.kind,
        high: envelope.high,
        low: envelope.low,
        relation: Some(relation),
        confirmed_at: Some(confirmed_at),
        transitions: active.transitions.clone(),
    }
}

fn materialize(active: &ActiveSwing, bars: &[ConsolidatedBar]) -> Swing {
    let (end_cbar_id, end_raw_id, end_kind, relation) = match &active.phase {
        Phase::PendingReverse { candidate } => (
            candidate.cbar_id,
            candidate.extreme_raw_id,
            candidate.kind,
            Some(active.origin.envelope.relation(&candidate.envelope)),
        ),
        Phase::Forming => match bars.last() {
            Some(last) => (last.id, last.raw_end_id, FractalKind::None, None),
            None => (active.origin.cbar_id, active.origin.extreme_raw_id, FractalKind::None, None),
        },
    };
    let envelope = span(bars, active.origin.cbar_id, end_cbar_id);
    Swing {
        id: active.id,
        direction: active.direction,
        state: active.state(),
        start_cbar_id: active.origin.cbar_id,
        end_cbar_id,
        start_raw_id: active.origin.extreme_raw_id,
        end_raw_id,
        start_kind: active.origin.kind,
        end_kind,
        high: envelope.high,
        low: envelope.low,
        relation,
        confirmed_at: None,
        transitions: active.transitions.clone(),
    }
}
