//! Per-model pricing and the chat-model set.

use std::collections::{HashMap, HashSet};

/// Price per 1k tokens for a model, split into input and output rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePair {
    pub input: f64,
    pub output: f64,
}

impl PricePair {
    /// A flat price charges input and output tokens at the same rate.
    pub const fn flat(price: f64) -> Self {
        Self { input: price, output: price }
    }

    /// Separate input/output rates.
    pub const fn split(input: f64, output: f64) -> Self {
        Self { input, output }
    }
}

/// Model name to price-per-1k-tokens table.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    prices: HashMap<String, PricePair>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &str) -> Option<PricePair> {
        self.prices.get(model).copied()
    }

    pub fn insert(&mut self, model: impl Into<String>, price: PricePair) {
        self.prices.insert(model.into(), price);
    }

    /// Builder-style insertion of a flat price.
    pub fn with_flat(mut self, model: impl Into<String>, price: f64) -> Self {
        self.insert(model, PricePair::flat(price));
        self
    }

    /// Builder-style insertion of split input/output prices.
    pub fn with_split(mut self, model: impl Into<String>, input: f64, output: f64) -> Self {
        self.insert(model, PricePair::split(input, output));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

/// Published prices per 1k tokens for the well-known completion models.
pub fn default_price_table() -> PriceTable {
    PriceTable::new()
        .with_flat("text-ada-001", 0.0004)
        .with_flat("text-babbage-001", 0.0005)
        .with_flat("text-curie-001", 0.002)
        .with_flat("code-cushman-001", 0.024)
        .with_flat("code-davinci-002", 0.1)
        .with_flat("text-davinci-002", 0.02)
        .with_flat("text-davinci-003", 0.02)
        .with_flat("gpt-3.5-turbo", 0.002)
        .with_flat("gpt-3.5-turbo-0301", 0.002)
        .with_split("gpt-4", 0.03, 0.06)
        .with_split("gpt-4-0314", 0.03, 0.06)
        .with_split("gpt-4-32k", 0.06, 0.12)
        .with_split("gpt-4-32k-0314", 0.06, 0.12)
}

/// Models whose request shape uses `messages` rather than `prompt`.
pub fn default_chat_models() -> HashSet<String> {
    [
        "gpt-3.5-turbo",
        "gpt-3.5-turbo-0301",
        "gpt-4",
        "gpt-4-32k",
        "gpt-4-32k-0314",
        "gpt-4-0314",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
