//! Registry of independent processing contexts
//!
//! Contexts share nothing mutable. Batches for different keys are processed in
//! parallel; each context still applies its own bars strictly in order.

use super::context::{PipelineContext, TimeframeAnalysis};
use super::events::CascadeEvent;
use crate::config::StructureConfig;
use crate::error::{Result, StructureError};
use crate::scoring::{ProfileStore, ScoringConfig};
use crate::types::{ContextKey, RawBar, Timeframe};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// One symbol read across three timeframes. A slot is `None` when that
/// context is not registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiTimeframeSnapshot {
    pub symbol: String,
    pub higher: Option<TimeframeAnalysis>,
    pub trade: Option<TimeframeAnalysis>,
    pub entry: Option<TimeframeAnalysis>,
}

pub struct ContextRegistry {
    structure: StructureConfig,
    profiles: Arc<ProfileStore>,
    contexts: BTreeMap<ContextKey, PipelineContext>,
}

impl ContextRegistry {
    pub fn new(structure: StructureConfig, profiles: Arc<ProfileStore>) -> Result<Self> {
        structure.validate()?;
        Ok(Self {
            structure,
            profiles,
            contexts: BTreeMap::new(),
        })
    }

    /// Create the context for `key` if it does not exist yet
    pub fn register(&mut self, key: ContextKey) -> Result<&mut PipelineContext> {
        if !self.contexts.contains_key(&key) {
            let scoring = self.profiles.resolve(&key)?;
            let context = PipelineContext::new(key.clone(), self.structure.clone(), scoring)?;
            info!(key = %key, "context registered");
            self.contexts.insert(key.clone(), context);
        }
        self.get_mut(&key)
    }

    pub fn get(&self, key: &ContextKey) -> Result<&PipelineContext> {
        self.contexts
            .get(key)
            .ok_or_else(|| StructureError::UnknownContext { key: key.clone() })
    }

    pub fn get_mut(&mut self, key: &ContextKey) -> Result<&mut PipelineContext> {
        self.contexts
            .get_mut(key)
            .ok_or_else(|| StructureError::UnknownContext { key: key.clone() })
    }

    pub fn remove(&mut self, key: &ContextKey) -> Option<PipelineContext> {
        self.contexts.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &ContextKey> {
        self.contexts.keys()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn push(&mut self, key: &ContextKey, bar: RawBar) -> Result<CascadeEvent> {
        self.get_mut(key)?.push(bar)
    }

    /// Apply ordered batches to many contexts in parallel, registering unknown keys.
    /// A failure in one context never affects the others.
    pub fn ingest_parallel(
        &mut self,
        batches: BTreeMap<ContextKey, Vec<RawBar>>,
    ) -> BTreeMap<ContextKey, Result<Vec<CascadeEvent>>> {
        let mut results = BTreeMap::new();
        for key in batches.keys() {
            if let Err(e) = self.register(key.clone()) {
                warn!(key = %key, "context not registered: {}", e);
                results.insert(key.clone(), Err(e));
            }
        }

        let processed: BTreeMap<ContextKey, Result<Vec<CascadeEvent>>> = self
            .contexts
            .par_iter_mut()
            .filter_map(|(key, context)| {
                let bars = batches.get(key)?;
                Some((key.clone(), context.extend(bars.iter().cloned())))
            })
            .collect();

        results.extend(processed);
        info!(contexts = results.len(), "parallel ingest complete");
        results
    }

    /// Swap the scoring profile and re-resolve every context.
    /// Nothing changes unless the document validates.
    pub fn reload_profiles(&mut self, text: &str) -> Result<()> {
        self.profiles.reload(text)?;
        let resolved: Vec<(ContextKey, ScoringConfig)> = self
            .contexts
            .keys()
            .map(|key| -> Result<(ContextKey, ScoringConfig)> { Ok((key.clone(), self.profiles.resolve(key)?)) })
            .collect::<Result<_>>()?;
        for (key, scoring) in resolved {
            self.get_mut(&key)?.set_scoring_config(scoring)?;
        }
        Ok(())
    }

    /// Read-only view of `symbol` on the higher, trade and entry timeframes
    pub fn multi_timeframe(
        &self,
        symbol: &str,
        higher: Timeframe,
        trade: Timeframe,
        entry: Timeframe,
    ) -> MultiTimeframeSnapshot {
        let read = |timeframe| {
            self.contexts
                .get(&ContextKey::new(symbol, timeframe))
                .map(PipelineContext::analysis)
        };
        MultiTimeframeSnapshot {
            symbol: symbol.to_string(),
            higher: read(higher),
            trade: read(trade),
            entry: read(entry),
        }
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }
}
