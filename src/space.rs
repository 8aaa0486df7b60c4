//! Search-space domains.
//!
//! A space maps hyperparameter names to domains. The driver normalises the
//! user-facing space (template tables, temperature/top-p exclusivity) before
//! handing it to the search algorithm; the algorithm is responsible for
//! sampling the domains.

use std::collections::BTreeMap;

use serde_json::Value;

/// Domain of one hyperparameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    /// A fixed value.
    Constant(Value),
    /// One of several alternatives.
    Choice(Vec<Domain>),
    /// Uniform float in `[low, high)`.
    Uniform { low: f64, high: f64 },
    /// Uniform integer in `[low, high)`.
    RandInt { low: u64, high: u64 },
    /// Log-uniform integer in `[low, high)`.
    LogRandInt { low: u64, high: u64 },
    /// A nested sub-space, sampled as an object.
    Map(BTreeMap<String, Domain>),
}

impl Domain {
    /// Choice over plain values.
    pub fn choice(values: impl IntoIterator<Item = Value>) -> Self {
        Self::Choice(values.into_iter().map(Domain::Constant).collect())
    }

    /// Choice over the integers `0..len`, used for template-table indices.
    pub fn index_choice(len: usize) -> Self {
        Self::choice((0..len).map(|i| Value::from(i as u64)))
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Constant(value.into())
    }

    /// The constant value, if this domain is one.
    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Self::Constant(v) => Some(v),
            _ => None,
        }
    }
}

/// Hyperparameter name to domain.
pub type SearchSpace = BTreeMap<String, Domain>;

/// The default space searched when the user supplies no overrides.
pub fn default_search_space() -> SearchSpace {
    let mut space = SearchSpace::new();
    space.insert(
        "model".to_string(),
        Domain::choice(
            [
                "text-ada-001",
                "text-babbage-001",
                "text-davinci-003",
                "gpt-3.5-turbo",
                "gpt-4",
            ]
            .map(Value::from),
        ),
    );
    space.insert(
        "temperature_or_top_p".to_string(),
        Domain::Choice(vec![
            Domain::Map(BTreeMap::from([(
                "temperature".to_string(),
                Domain::Uniform { low: 0.0, high: 1.0 },
            )])),
            Domain::Map(BTreeMap::from([(
                "top_p".to_string(),
                Domain::Uniform { low: 0.0, high: 1.0 },
            )])),
        ]),
    );
    space.insert("max_tokens".to_string(), Domain::LogRandInt { low: 50, high: 1000 });
    space.insert("n".to_string(), Domain::RandInt { low: 1, high: 100 });
    space
}

/// The candidate models of a space, in declaration order.
pub fn candidate_models(space: &SearchSpace) -> Vec<String> {
    match space.get("model") {
        Some(Domain::Constant(Value::String(model))) => vec![model.clone()],
        Some(Domain::Choice(choices)) => choices
            .iter()
            .filter_map(|c| c.as_constant().and_then(Value::as_str).map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}
