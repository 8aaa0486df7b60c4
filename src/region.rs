//! Valid/invalid completion-count frontiers.
//!
//! For each region (model, input template, stop template) the index records,
//! per `max_tokens`, the largest `n` observed to satisfy the inference
//! budget and the smallest `n` observed to violate it. Validity at a larger
//! `max_tokens` implies validity at smaller ones, and invalidity at a
//! smaller `max_tokens` implies invalidity at larger ones, so lookups scan
//! the matching half of the frontier. The index is a heuristic: queries
//! never fail, and conflicting evidence is tolerated.

use std::collections::{BTreeMap, HashMap};

/// `max_tokens` stand-in for models without an output-token cap.
pub const UNBOUNDED_TOKENS: u64 = u64::MAX;

/// Identity of the prompt-or-messages template of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputId {
    Prompt(usize),
    Messages(usize),
}

/// The scope within which validity frontiers apply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey {
    pub model: String,
    pub input: InputId,
    pub stop: Option<usize>,
}

/// Per-region frontiers over `max_tokens`.
#[derive(Debug, Default)]
pub struct RegionIndex {
    max_valid: HashMap<RegionKey, BTreeMap<u64, u32>>,
    min_invalid: HashMap<RegionKey, BTreeMap<u64, u32>>,
}

impl RegionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest `n` known valid at `max_tokens` or above. Defaults to 1.
    pub fn max_valid_n(&self, key: &RegionKey, max_tokens: u64) -> u32 {
        self.max_valid
            .get(key)
            .and_then(|m| m.range(max_tokens..).map(|(_, n)| *n).max())
            .unwrap_or(1)
    }

    /// Smallest `n` known invalid at `max_tokens` or below, if any.
    pub fn min_invalid_n(&self, key: &RegionKey, max_tokens: u64) -> Option<u32> {
        self.min_invalid
            .get(key)
            .and_then(|m| m.range(..=max_tokens).map(|(_, n)| *n).min())
    }

    /// Record that `n` completions satisfied the budget at `max_tokens`.
    pub fn mark_valid(&mut self, key: &RegionKey, max_tokens: u64, n: u32) {
        self.max_valid
            .entry(key.clone())
            .or_default()
            .entry(max_tokens)
            .and_modify(|v| *v = (*v).max(n))
            .or_insert(n);
    }

    /// Record that `n` completions violated the budget at `max_tokens`.
    pub fn mark_invalid(&mut self, key: &RegionKey, max_tokens: u64, n: u32) {
        self.min_invalid
            .entry(key.clone())
            .or_default()
            .entry(max_tokens)
            .and_modify(|v| *v = (*v).min(n))
            .or_insert(n);
    }
}
