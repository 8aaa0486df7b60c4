//! llmtune - cost-aware hyperparameter tuning for text-completion APIs
//!
//! Given a dataset, a user metric, and a search space over generation
//! parameters (model, temperature/top-p, max output tokens, completion
//! count, prompt/message templates, stop sequences), llmtune searches for
//! the configuration that optimizes the metric while honouring an inference
//! budget (average serving cost per instance) and an optimization budget
//! (total tuning spend). Trials are evaluated by a staged, pruning
//! evaluator that memoises remote calls and shares validity evidence
//! between configurations; the blackbox search algorithm and the completion
//! endpoint are injected.

pub mod cache;
pub mod caller;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod evaluator;
pub mod key;
pub mod price;
pub mod region;
pub mod search;
pub mod space;
pub mod template;

/// A JSON object, the shape of configurations and request bodies.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// A proposed trial configuration.
pub type Config = JsonMap;

/// One evaluation instance: named fields substituted into templates and
/// passed to the user metric.
pub type DataInstance = JsonMap;

pub use cache::{CacheValue, CallCache};
pub use caller::{CallOutcome, RemoteCaller, RetryPolicy};
pub use driver::{
    ServeOptions, SpaceOverrides, StopTemplate, TuneOptions, TunedParams, create, tune,
};
pub use endpoint::{
    Choice, CompletionEndpoint, EndpointError, Flavor, MockEndpoint, OpenAiConfig,
    OpenAiEndpoint, ResponseRecord, Usage,
};
pub use error::{Result, TuneError};
pub use evaluator::{EvalFn, MetricValue, PruneField, TrialResult, Tuner};
pub use key::fingerprint;
pub use price::{PricePair, PriceTable, default_chat_models, default_price_table};
pub use region::{InputId, RegionIndex, RegionKey};
pub use search::{ExperimentAnalysis, OptMode, SearchAlgorithm, SearchSetup, TrialRecord};
pub use space::{Domain, SearchSpace, default_search_space};
pub use template::{MessageTemplate, Template};
