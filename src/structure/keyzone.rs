//! Key zone derivation and price interaction classification
//!
//! Every sealed swing and completed trend leaves a zone at its extremum:
//! an Up source gives a resistance zone below its high, a Down source a support
//! zone above its low. The inner bound is tightened toward the bodies of the
//! raw bars that reached into the zone, never widened.
//!
//! Each new raw bar is then classified against the most recent zones. The
//! strongest interaction becomes the latest signal consumed by the scorer.

use super::envelope::EnvelopeRelation;
use super::swing::Swing;
use super::trend::Trend;
use crate::config::ZoneConfig;
use crate::types::{Direction, KeyZoneId, RawBar, RawBarId, SwingId, TrendId, PRICE_EPSILON};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Body ratio treated as a decisive bar
const DECISIVE_BODY: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneSource {
    Swing(SwingId),
    Trend(TrendId),
}

impl std::fmt::Display for ZoneSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneSource::Swing(id) => write!(f, "swing#{}", id),
            ZoneSource::Trend(id) => write!(f, "trend#{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneRole {
    Support,
    Resistance,
}

impl ZoneRole {
    /// Direction of a push through the zone
    pub fn push_direction(&self) -> Direction {
        match self {
            ZoneRole::Resistance => Direction::Up,
            ZoneRole::Support => Direction::Down,
        }
    }
}

impl std::fmt::Display for ZoneRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneRole::Support => write!(f, "SUPPORT"),
            ZoneRole::Resistance => write!(f, "RESISTANCE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneBehavior {
    StrongAccept,
    WeakAccept,
    StrongReject,
    WeakReject,
    SecondPush,
    BreakoutFailure,
}

impl ZoneBehavior {
    /// Behaviors that favour a move through the zone
    pub fn favours_push(&self) -> bool {
        matches!(
            self,
            ZoneBehavior::StrongAccept | ZoneBehavior::WeakAccept | ZoneBehavior::SecondPush
        )
    }
}

impl std::fmt::Display for ZoneBehavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneBehavior::StrongAccept => write!(f, "STRONG_ACCEPT"),
            ZoneBehavior::WeakAccept => write!(f, "WEAK_ACCEPT"),
            ZoneBehavior::StrongReject => write!(f, "STRONG_REJECT"),
            ZoneBehavior::WeakReject => write!(f, "WEAK_REJECT"),
            ZoneBehavior::SecondPush => write!(f, "SECOND_PUSH"),
            ZoneBehavior::BreakoutFailure => write!(f, "BREAKOUT_FAILURE"),
        }
    }
}

/// One classified interaction of a raw bar with a zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneTouch {
    pub raw_id: RawBarId,
    pub raw_index: usize,
    pub behavior: ZoneBehavior,
    /// Directional bias implied by the interaction
    pub direction: Direction,
    pub strength: f64,
    /// How far the bar reached into the zone, in zone widths
    pub penetration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyZone {
    pub id: KeyZoneId,
    pub source: ZoneSource,
    pub role: ZoneRole,
    pub upper: f64,
    pub lower: f64,
    /// Bounds before wick refinement
    pub candidate_upper: f64,
    pub candidate_lower: f64,
    /// Envelope relation of the source swing (None for trend zones)
    pub relation: Option<EnvelopeRelation>,
    pub source_start_raw_id: RawBarId,
    pub source_end_raw_id: RawBarId,
    pub created_at: RawBarId,
    pub created_index: usize,
    pub touches: Vec<ZoneTouch>,
    pub behavior: Option<ZoneBehavior>,
}

impl KeyZone {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    pub fn contains(&self, price: f64) -> bool {
        price >= self.lower && price <= self.upper
    }

    /// Structural quality of the source
    pub fn quality(&self) -> f64 {
        self.relation.map(|r| r.weight()).unwrap_or(1.0)
    }
}

/// Most recent classified interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSignal {
    pub zone_id: KeyZoneId,
    pub behavior: ZoneBehavior,
    pub direction: Direction,
    pub strength: f64,
    pub raw_id: RawBarId,
}

impl ZoneSignal {
    /// Strength signed by direction, in [-1, 1]
    pub fn signed_strength(&self) -> f64 {
        (self.direction.sign() * self.strength).clamp(-1.0, 1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneUpdate {
    pub created: Vec<KeyZoneId>,
    pub touched: Vec<KeyZoneId>,
    pub signal: Option<ZoneSignal>,
}

/// Classify one bar against one zone. None if the bar never reached the zone.
pub fn classify_bar(
    config: &ZoneConfig,
    zone: &KeyZone,
    bar: &RawBar,
    previous: Option<&RawBar>,
    index: usize,
) -> Option<ZoneTouch> {
    // Orient prices so that the push through the zone always goes up
    let push = zone.role.push_direction();
    let s = push.sign();
    let (near, far) = match zone.role {
        ZoneRole::Resistance => (zone.lower, zone.upper),
        ZoneRole::Support => (-zone.upper, -zone.lower),
    };
    let (reach, back) = match zone.role {
        ZoneRole::Resistance => (bar.high, bar.low),
        ZoneRole::Support => (-bar.low, -bar.high),
    };
    if reach < near - PRICE_EPSILON || back > far + PRICE_EPSILON {
        return None;
    }

    let width = (far - near).max(PRICE_EPSILON);
    let range = bar.range().max(PRICE_EPSILON);
    let penetration = ((reach - near) / width).clamp(0.0, 2.0);
    let close = s * bar.close;
    let body_ratio = bar.body_ratio();
    let pushing = match push {
        Direction::Up => bar.is_bullish(),
        Direction::Down => bar.is_bearish(),
    };
    let rejection_wick = match zone.role {
        ZoneRole::Resistance => (bar.high - bar.body_top()) / range,
        ZoneRole::Support => (bar.body_bottom() - bar.low) / range,
    };
    let broke_out_before = previous.map_or(false, |p| s * p.close > far + PRICE_EPSILON);

    let (behavior, strength) = if broke_out_before && close <= far + PRICE_EPSILON {
        let depth = ((far - close) / width).clamp(0.0, 1.0);
        (ZoneBehavior::BreakoutFailure, 0.6 + 0.4 * depth)
    } else if close > far + PRICE_EPSILON {
        let margin = (close - far) / width;
        let decisive = pushing && body_ratio >= DECISIVE_BODY;
        let behavior = if margin >= config.strong_margin || decisive {
            ZoneBehavior::StrongAccept
        } else {
            ZoneBehavior::WeakAccept
        };
        let body = if pushing { body_ratio } else { 0.0 };
        (behavior, 0.5 * margin.min(1.0) + 0.5 * body)
    } else if close >= near - PRICE_EPSILON {
        let prior = zone.touches.iter().any(|t| {
            t.raw_index + 1 < index
                && matches!(
                    t.behavior,
                    ZoneBehavior::StrongReject | ZoneBehavior::WeakReject | ZoneBehavior::SecondPush
                )
        });
        if prior {
            (ZoneBehavior::SecondPush, 0.4 + 0.6 * penetration.min(1.0))
        } else {
            (ZoneBehavior::WeakAccept, 0.25 * penetration.min(1.0))
        }
    } else {
        let decisive = !pushing && body_ratio >= DECISIVE_BODY;
        let behavior = if penetration >= config.strong_penetration || decisive {
            ZoneBehavior::StrongReject
        } else {
            ZoneBehavior::WeakReject
        };
        (behavior, 0.5 * penetration.min(1.0) + 0.5 * rejection_wick)
    };

    let direction = if behavior.favours_push() {
        push
    } else {
        push.opposite()
    };
    Some(ZoneTouch {
        raw_id: bar.sequence,
        raw_index: index,
        behavior,
        direction,
        strength: (strength.clamp(0.05, 1.0) * zone.quality()).clamp(0.0, 1.0),
        penetration,
    })
}

#[derive(Debug, Clone)]
pub struct ZoneCheckpoint {
    zones_len: usize,
    tail: Vec<KeyZone>,
    latest_signal: Option<ZoneSignal>,
    next_id: KeyZoneId,
}

#[derive(Debug, Clone)]
pub struct KeyZoneDeriver {
    config: ZoneConfig,
    zones: Vec<KeyZone>,
    latest_signal: Option<ZoneSignal>,
    next_id: KeyZoneId,
}

impl KeyZoneDeriver {
    pub fn new(config: ZoneConfig) -> Self {
        Self {
            config,
            zones: Vec::new(),
            latest_signal: None,
            next_id: 0,
        }
    }

    /// Batch path: derive zones at the bar their source was sealed and replay
    /// every bar against them
    pub fn replay(config: ZoneConfig, swings: &[Swing], trends: &[Trend], raw: &[RawBar]) -> Self {
        let mut deriver = Self::new(config);
        let sealed: Vec<&Swing> = swings.iter().filter(|s| s.confirmed_at.is_some()).collect();
        let completed: Vec<&Trend> = trends.iter().filter(|t| t.completed).collect();
        let (mut si, mut ti) = (0, 0);
        for (index, bar) in raw.iter().enumerate() {
            let swing_from = si;
            while si < sealed.len() && sealed[si].confirmed_at == Some(bar.sequence) {
                si += 1;
            }
            let trend_from = ti;
            while ti < completed.len() && completed[ti].completed_at == Some(bar.sequence) {
                ti += 1;
            }
            let new_swings: Vec<Swing> = sealed[swing_from..si].iter().map(|s| (*s).clone()).collect();
            let new_trends: Vec<Trend> = completed[trend_from..ti].iter().map(|t| (*t).clone()).collect();
            deriver.on_bar(&new_swings, &new_trends, &raw[..=index]);
        }
        deriver
    }

    /// Derive zones for newly sealed structure, then classify the last bar of `raw`
    pub fn on_bar(&mut self, sealed: &[Swing], completed: &[Trend], raw: &[RawBar]) -> ZoneUpdate {
        let mut update = ZoneUpdate::default();
        let Some(bar) = raw.last() else {
            return update;
        };
        let index = raw.len() - 1;

        for swing in sealed {
            let id = self.derive(
                ZoneSource::Swing(swing.id),
                swing.direction,
                swing.high,
                swing.low,
                (swing.start_raw_id, swing.end_raw_id),
                swing.relation,
                raw,
            );
            update.created.push(id);
        }
        for trend in completed {
            let id = self.derive(
                ZoneSource::Trend(trend.id),
                trend.direction,
                trend.high,
                trend.low,
                (trend.start_raw_id, trend.end_raw_id),
                None,
                raw,
            );
            update.created.push(id);
        }

        let previous = index.checked_sub(1).map(|i| &raw[i]);
        let from = self.zones.len().saturating_sub(self.config.max_active_zones);
        let mut best: Option<ZoneSignal> = None;
        for zone in self.zones[from..].iter_mut() {
            if zone.created_index >= index {
                continue;
            }
            let Some(touch) = classify_bar(&self.config, zone, bar, previous, index) else {
                continue;
            };
            let candidate = ZoneSignal {
                zone_id: zone.id,
                behavior: touch.behavior,
                direction: touch.direction,
                strength: touch.strength,
                raw_id: bar.sequence,
            };
            // zones are visited oldest first, so >= lets the newest win ties
            if best.as_ref().map_or(true, |b| candidate.strength >= b.strength) {
                best = Some(candidate);
            }
            zone.behavior = Some(touch.behavior);
            zone.touches.push(touch);
            update.touched.push(zone.id);
        }

        if let Some(signal) = best {
            debug!(
                zone = signal.zone_id,
                behavior = %signal.behavior,
                strength = signal.strength,
                "zone interaction"
            );
            self.latest_signal = Some(signal.clone());
            update.signal = Some(signal);
        }
        update
    }

    #[allow(clippy::too_many_arguments)]
    fn derive(
        &mut self,
        source: ZoneSource,
        direction: Direction,
        high: f64,
        low: f64,
        span: (RawBarId, RawBarId),
        relation: Option<EnvelopeRelation>,
        raw: &[RawBar],
    ) -> KeyZoneId {
        let width = self.config.offset.width_for(high - low).max(0.0);
        let role = match direction {
            Direction::Up => ZoneRole::Resistance,
            Direction::Down => ZoneRole::Support,
        };
        let (candidate_upper, candidate_lower) = match role {
            ZoneRole::Resistance => (high, (high - width).max(low)),
            ZoneRole::Support => ((low + width).min(high), low),
        };

        let (start, end) = (span.0.min(span.1), span.0.max(span.1));
        let from = raw.partition_point(|b| b.sequence < start);
        let to = raw.partition_point(|b| b.sequence <= end);
        let source_bars = &raw[from..to];

        let (mut upper, mut lower) = (candidate_upper, candidate_lower);
        match role {
            ZoneRole::Resistance => {
                let inner = source_bars
                    .iter()
                    .filter(|b| b.high >= candidate_lower)
                    .map(|b| b.body_top())
                    .fold(f64::NEG_INFINITY, f64::max);
                if inner > candidate_lower && inner < candidate_upper {
                    lower = inner;
                }
            }
            ZoneRole::Support => {
                let inner = source_bars
                    .iter()
                    .filter(|b| b.low <= candidate_upper)
                    .map(|b| b.body_bottom())
                    .fold(f64::INFINITY, f64::min);
                if inner < candidate_upper && inner > candidate_lower {
                    upper = inner;
                }
            }
        }

        let (created_at, created_index) = match raw.last() {
            Some(bar) => (bar.sequence, raw.len() - 1),
            None => (end, 0),
        };
        let id = self.next_id;
        self.next_id += 1;
        info!(
            zone = id,
            source = %source,
            role = %role,
            lower,
            upper,
            "key zone derived"
        );
        self.zones.push(KeyZone {
            id,
            source,
            role,
            upper,
            lower,
            candidate_upper,
            candidate_lower,
            relation,
            source_start_raw_id: start,
            source_end_raw_id: end,
            created_at,
            created_index,
            touches: Vec::new(),
            behavior: None,
        });
        id
    }

    pub fn zones(&self) -> &[KeyZone] {
        &self.zones
    }

    /// Zones evaluated against new bars
    pub fn active_zones(&self) -> &[KeyZone] {
        let from = self.zones.len().saturating_sub(self.config.max_active_zones);
        &self.zones[from..]
    }

    pub fn latest_signal(&self) -> Option<&ZoneSignal> {
        self.latest_signal.as_ref()
    }

    pub fn checkpoint(&self) -> ZoneCheckpoint {
        ZoneCheckpoint {
            zones_len: self.zones.len(),
            tail: self.active_zones().to_vec(),
            latest_signal: self.latest_signal.clone(),
            next_id: self.next_id,
        }
    }

    pub fn restore(&mut self, checkpoint: ZoneCheckpoint) {
        self.zones
            .truncate(checkpoint.zones_len - checkpoint.tail.len());
        self.zones.extend(checkpoint.tail);
        self.latest_signal = checkpoint.latest_signal;
        self.next_id = checkpoint.next_id;
    }
}
