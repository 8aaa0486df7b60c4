//! Staged, pruning trial evaluation.
//!
//! A trial is evaluated by growing the completion count and the data prefix
//! in two nested doublings. A small probe at the start of the data quickly
//! exposes configurations whose average output-token usage cannot fit the
//! inference budget; a Hoeffding-Serfling concentration bound widens or
//! narrows the decision threshold as more of the finite dataset is
//! observed. Evidence about valid and invalid completion counts is shared
//! across trials through the region index, so many configurations are
//! rejected without issuing any remote calls.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::caller::{CallOutcome, RemoteCaller};
use crate::cache::CallCache;
use crate::error::{Result, TuneError};
use crate::price::{PriceTable, default_price_table};
use crate::region::{InputId, RegionIndex, RegionKey, UNBOUNDED_TOKENS};
use crate::search::OptMode;
use crate::template::{InputTemplates, MessageTemplate, Template, bind_input};
use crate::{Config, DataInstance};

/// Default factor of the Hoeffding-Serfling slack term.
pub const DEFAULT_HOEFFDING_FACTOR: f64 = 0.1;

/// Output-token cap assumed for plain completion models when unspecified.
const DEFAULT_PLAIN_MAX_TOKENS: u64 = 16;

/// User metric function: responses for one instance in, named metrics out.
pub type EvalFn =
    dyn Fn(&[String], &DataInstance) -> BTreeMap<String, MetricValue> + Send + Sync;

/// One entry of a trial's metric mapping. Only numbers are aggregated
/// across instances; other values keep the last value seen.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    Other(Value),
}

impl MetricValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Other(_) => None,
        }
    }

    /// JSON form; non-finite numbers become strings.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Number(v) => json_number(*v),
            Self::Other(v) => v.clone(),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

fn json_number(v: f64) -> Value {
    if v.is_finite() {
        json!(v)
    } else if v > 0.0 {
        json!("Infinity")
    } else {
        json!("-Infinity")
    }
}

/// Result of evaluating one trial.
#[derive(Debug, Clone, Default)]
pub struct TrialResult {
    /// Aggregated metric fields, averaged over the evaluated prefix.
    pub metrics: BTreeMap<String, MetricValue>,
    /// Spend of this trial.
    pub cost: f64,
    /// Cumulative spend of the run, when recorded.
    pub total_cost: Option<f64>,
    /// Estimated per-instance serving cost of this configuration.
    pub inference_cost: Option<f64>,
}

impl TrialResult {
    /// Numeric value of a metric field.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).and_then(MetricValue::as_number)
    }

    /// Result of a trial rejected without any remote calls.
    pub fn pruned(metric: &str, mode: OptMode) -> Self {
        let mut result = Self {
            inference_cost: Some(f64::INFINITY),
            ..Self::default()
        };
        result.metrics.insert(metric.to_string(), MetricValue::Number(mode.worst()));
        result
    }

    /// Result of a trial abandoned mid-flight: zero metric, spend kept.
    pub fn zeroed(metric: &str, cost: f64, total_cost: Option<f64>) -> Self {
        let mut result = Self { cost, total_cost, ..Self::default() };
        result.metrics.insert(metric.to_string(), MetricValue::Number(0.0));
        result
    }

    /// JSON form used for the trial log.
    pub fn to_json(&self) -> Value {
        let metrics: serde_json::Map<String, Value> = self
            .metrics
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        json!({
            "metrics": metrics,
            "cost": self.cost,
            "total_cost": self.total_cost,
            "inference_cost": self.inference_cost.map(json_number),
        })
    }
}

/// Hyperparameter that bounds the completion count of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PruneField {
    #[default]
    N,
    BestOf,
}

impl PruneField {
    pub fn key(self) -> &'static str {
        match self {
            Self::N => "n",
            Self::BestOf => "best_of",
        }
    }
}

/// Trial evaluation context.
///
/// Holds every piece of state shared between trials of one tuning run: the
/// dataset, template tables, budgets, prices, the region index, cumulative
/// spend and the average input-token estimate, plus the caller and cache
/// handles.
pub struct Tuner {
    pub data: Vec<DataInstance>,
    pub eval_func: Arc<EvalFn>,
    pub metric: String,
    pub mode: OptMode,
    pub prompts: Vec<Template>,
    pub messages: Vec<Vec<MessageTemplate>>,
    pub stops: Vec<Vec<String>>,
    pub prune_hp: PruneField,
    pub inference_budget: Option<f64>,
    pub optimization_budget: Option<f64>,
    pub prices: PriceTable,
    pub hoeffding_factor: f64,
    pub caller: RemoteCaller,
    pub cache: CallCache,
    pub region: RegionIndex,
    pub total_cost: f64,
    pub avg_input_tokens: Option<f64>,
}

/// Owned copies of the templates selected by one trial.
enum BoundInput {
    Prompt(Template),
    Messages(Vec<MessageTemplate>),
}

impl BoundInput {
    fn as_templates(&self) -> InputTemplates<'_> {
        match self {
            Self::Prompt(t) => InputTemplates::Prompt(t),
            Self::Messages(m) => InputTemplates::Messages(m),
        }
    }
}

impl Tuner {
    pub fn new(
        data: Vec<DataInstance>,
        eval_func: Arc<EvalFn>,
        metric: impl Into<String>,
        mode: OptMode,
        caller: RemoteCaller,
        cache: CallCache,
    ) -> Self {
        Self {
            data,
            eval_func,
            metric: metric.into(),
            mode,
            prompts: vec![Template::format("{prompt}")],
            messages: Vec::new(),
            stops: Vec::new(),
            prune_hp: PruneField::N,
            inference_budget: None,
            optimization_budget: None,
            prices: default_price_table(),
            hoeffding_factor: DEFAULT_HOEFFDING_FACTOR,
            caller,
            cache,
            region: RegionIndex::new(),
            total_cost: 0.0,
            avg_input_tokens: None,
        }
    }

    /// Evaluate one configuration.
    ///
    /// With `prune` enabled and an inference budget set, the evaluation may
    /// stop early with a synthetic worst-case result. `eval_only` marks
    /// serving-style evaluation: budgets are ignored and remote calls never
    /// give up.
    pub async fn eval(
        &mut self,
        config: &Config,
        prune: bool,
        eval_only: bool,
    ) -> Result<TrialResult> {
        let mut cost = 0.0f64;
        let data_length = self.data.len();
        if data_length == 0 {
            return Err(TuneError::InvalidArgument("data must not be empty".to_string()));
        }
        let model = config
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| TuneError::InvalidArgument("config is missing a model".to_string()))?
            .to_string();
        let price = self
            .prices
            .get(&model)
            .ok_or_else(|| TuneError::UnknownPrice(model.clone()))?;
        let chat = self.caller.is_chat(&model);
        let flavor = self.caller.flavor(&model);
        let config_n = config
            .get(self.prune_hp.key())
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;
        let max_tokens = config
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(if chat { UNBOUNDED_TOKENS } else { DEFAULT_PLAIN_MAX_TOKENS });

        let (input_id, input) = self.resolve_input(config, chat)?;
        let (stop_index, stop) = self.resolve_stop(config)?;
        let region_key = RegionKey { model: model.clone(), input: input_id, stop: stop_index };

        let mut input_tokens: Vec<Option<u64>> = vec![None; data_length];
        let mut target_output_tokens: Option<f64> = None;
        let prune = prune && self.inference_budget.is_some() && !eval_only;

        let mut start_n = config_n;
        if prune {
            let inference_budget = self.inference_budget.unwrap_or_default();
            let mut max_valid_n = self.region.max_valid_n(&region_key, max_tokens);
            if let Some(avg_in) = self.avg_input_tokens {
                // max_tokens caps every completion, so the target output
                // budget bounds a completion count known to be affordable
                let target = (inference_budget * 1000.0 - avg_in * price.input) / price.output;
                target_output_tokens = Some(target);
                if target > 0.0 {
                    max_valid_n = max_valid_n.max((target / max_tokens as f64) as u32);
                }
            }
            if config_n <= max_valid_n {
                start_n = config_n;
            } else {
                if let Some(min_invalid) = self.region.min_invalid_n(&region_key, max_tokens) {
                    if config_n >= min_invalid {
                        debug!(model = %model, n = config_n, "rejected by invalid region");
                        return Ok(TrialResult::pruned(&self.metric, self.mode));
                    }
                }
                start_n = max_valid_n + 1;
            }
        }

        let mut params = config.clone();
        match &stop {
            Some(stop) => {
                params.insert("stop".to_string(), json!(stop));
            }
            None => {
                params.remove("stop");
            }
        }
        if let Some(Value::Object(choice)) = params.remove("temperature_or_top_p") {
            for (name, value) in choice {
                params.insert(name, value);
            }
        }

        let mut num_completions = start_n;
        let mut previous_num_completions = 0u32;
        let mut n_tokens_list: Vec<u64> = Vec::new();
        let mut responses_list: Vec<Vec<String>> = Vec::new();
        let mut avg_n_tokens = 0.0f64;
        loop {
            params.insert(
                self.prune_hp.key().to_string(),
                json!(num_completions - previous_num_completions),
            );
            let mut data_limit: usize = if prune { 1 } else { data_length };
            let mut prev_data_limit: usize = 0;
            let mut data_early_stop = false;
            loop {
                for i in prev_data_limit..data_limit {
                    debug!(num_completions, instance = i, "issuing call");
                    bind_input(&mut params, &input.as_templates(), chat, &self.data[i])?;
                    let outcome = self
                        .caller
                        .get_response(&mut self.cache, &params, eval_only)
                        .await?;
                    let record = match outcome {
                        CallOutcome::Poisoned => {
                            if prune {
                                self.region.mark_invalid(&region_key, max_tokens, num_completions);
                            }
                            return Ok(TrialResult::zeroed(&self.metric, cost, None));
                        }
                        CallOutcome::Response(record) => record,
                    };
                    let responses = record.texts(flavor);
                    let n_input_tokens = record.usage.prompt_tokens;
                    let n_output_tokens = record.usage.completion_tokens;
                    if self.avg_input_tokens.is_none() && input_tokens[i].is_none() {
                        input_tokens[i] = Some(n_input_tokens);
                    }
                    let query_cost = (price.input * n_input_tokens as f64
                        + price.output * n_output_tokens as f64)
                        / 1000.0;
                    self.total_cost += query_cost;
                    cost += query_cost;
                    if let Some(budget) = self.optimization_budget {
                        if self.total_cost >= budget && !eval_only {
                            info!(total_cost = self.total_cost, "optimization budget spent");
                            return Ok(TrialResult::zeroed(
                                &self.metric,
                                cost,
                                Some(self.total_cost),
                            ));
                        }
                    }
                    // requesting n1 then n2 completions and combining them is
                    // treated as one request for n1+n2 completions
                    if previous_num_completions > 0 {
                        n_tokens_list[i] += n_output_tokens;
                        responses_list[i].extend(responses);
                    } else {
                        n_tokens_list.push(n_output_tokens);
                        responses_list.push(responses);
                    }
                }

                avg_n_tokens = mean(&n_tokens_list[..data_limit]);
                let t = data_limit as f64;
                let total = data_length as f64;
                let rho = if 2 * data_limit > data_length {
                    (1.0 - t / total) * (1.0 + 1.0 / t)
                } else {
                    1.0 - (t - 1.0) / total
                };
                // Hoeffding-Serfling slack for sampling without replacement
                let ratio = self.hoeffding_factor * (rho / t).sqrt();

                if let Some(target) = target_output_tokens {
                    if avg_n_tokens > target * (1.0 + ratio) && !eval_only {
                        if prune {
                            self.region.mark_invalid(&region_key, max_tokens, num_completions);
                        }
                        debug!(avg_n_tokens, target, "output tokens over budget");
                        return Ok(TrialResult::zeroed(&self.metric, cost, Some(self.total_cost)));
                    }
                }
                let validated = prune
                    && target_output_tokens
                        .map(|target| avg_n_tokens <= target * (1.0 - ratio))
                        .unwrap_or(false)
                    && (num_completions < config_n
                        || (num_completions == config_n && data_limit == data_length));
                if validated {
                    self.region.mark_valid(&region_key, max_tokens, num_completions);
                    if num_completions < config_n {
                        // valid already, skip the rest of the data
                        data_limit = data_length;
                        data_early_stop = true;
                        break;
                    }
                }
                prev_data_limit = data_limit;
                if data_limit < data_length {
                    data_limit = (data_limit * 2).min(data_length);
                } else {
                    break;
                }
            }

            if num_completions == config_n {
                let mut result = TrialResult::default();
                for i in 0..data_limit {
                    let metrics = (self.eval_func)(&responses_list[i], &self.data[i]);
                    if result.metrics.is_empty() {
                        result.metrics = metrics;
                    } else {
                        for (name, value) in metrics {
                            match result.metrics.entry(name) {
                                std::collections::btree_map::Entry::Occupied(mut slot) => {
                                    match (slot.get_mut(), value) {
                                        (MetricValue::Number(sum), MetricValue::Number(v)) => {
                                            *sum += v;
                                        }
                                        (kept, value) => *kept = value,
                                    }
                                }
                                std::collections::btree_map::Entry::Vacant(slot) => {
                                    slot.insert(value);
                                }
                            }
                        }
                    }
                }
                for value in result.metrics.values_mut() {
                    if let MetricValue::Number(v) = value {
                        *v /= data_limit as f64;
                    }
                }
                result.total_cost = Some(self.total_cost);
                result.cost = cost;
                if self.avg_input_tokens.is_none() {
                    self.avg_input_tokens = Some(mean_known(&input_tokens));
                }
                let avg_in = self.avg_input_tokens.unwrap_or_default();
                result.inference_cost =
                    Some((avg_n_tokens * price.output + avg_in * price.input) / 1000.0);
                return Ok(result);
            }

            // exponential search over the completion count
            if data_early_stop {
                previous_num_completions = 0;
                n_tokens_list.clear();
                responses_list.clear();
            } else {
                previous_num_completions = num_completions;
            }
            num_completions = (num_completions * 2).min(config_n);
        }
    }

    fn resolve_input(&self, config: &Config, chat: bool) -> Result<(InputId, BoundInput)> {
        let prompt_index = index_field(config, "prompt")?;
        let messages_index = index_field(config, "messages")?;
        if chat && prompt_index.is_some() && messages_index.is_some() {
            return Err(TuneError::InvalidArgument(
                "prompt and messages cannot both be set".to_string(),
            ));
        }
        if let Some(index) = messages_index {
            if chat {
                let messages = self.messages.get(index).cloned().ok_or_else(|| {
                    TuneError::InvalidArgument(format!("messages index {index} out of range"))
                })?;
                return Ok((InputId::Messages(index), BoundInput::Messages(messages)));
            }
        }
        let index = prompt_index.ok_or_else(|| {
            TuneError::InvalidArgument("config is missing a prompt template".to_string())
        })?;
        let prompt = self.prompts.get(index).cloned().ok_or_else(|| {
            TuneError::InvalidArgument(format!("prompt index {index} out of range"))
        })?;
        Ok((InputId::Prompt(index), BoundInput::Prompt(prompt)))
    }

    fn resolve_stop(&self, config: &Config) -> Result<(Option<usize>, Option<Vec<String>>)> {
        if self.stops.is_empty() {
            return Ok((None, None));
        }
        let index = index_field(config, "stop")?.ok_or_else(|| {
            TuneError::InvalidArgument("config is missing a stop template".to_string())
        })?;
        let stop = self.stops.get(index).cloned().ok_or_else(|| {
            TuneError::InvalidArgument(format!("stop index {index} out of range"))
        })?;
        Ok((Some(index), Some(stop)))
    }
}

pub(crate) fn index_field(config: &Config, name: &str) -> Result<Option<usize>> {
    match config.get(name) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|i| Some(i as usize))
            .ok_or_else(|| {
                TuneError::InvalidArgument(format!("{name} must be a template index"))
            }),
    }
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<u64>() as f64 / values.len() as f64
}

fn mean_known(values: &[Option<u64>]) -> f64 {
    let known: Vec<u64> = values.iter().flatten().copied().collect();
    mean(&known)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::RetryPolicy;
    use crate::endpoint::{Choice, EndpointError, MockEndpoint, ResponseRecord, Usage};
    use crate::price::default_chat_models;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;
    use tempfile::TempDir;

    const ADA_PRICE: f64 = 0.0004;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            retry_time: Duration::ZERO,
            retry_timeout: Duration::ZERO,
            max_transient_retries: Some(3),
        }
    }

    fn instances(count: usize) -> Vec<DataInstance> {
        (0..count)
            .map(|i| match json!({"prompt": format!("question {i}")}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            })
            .collect()
    }

    fn count_metric() -> Arc<EvalFn> {
        Arc::new(|responses, _data| {
            BTreeMap::from([(
                "n_responses".to_string(),
                MetricValue::Number(responses.len() as f64),
            )])
        })
    }

    fn tuner(endpoint: Arc<MockEndpoint>, temp: &TempDir) -> Tuner {
        let caller = RemoteCaller::new(
            endpoint,
            fast_retry(),
            Arc::new(default_chat_models()),
        );
        let cache = CallCache::open(temp.path(), 41).unwrap();
        Tuner::new(instances(4), count_metric(), "n_responses", OptMode::Max, caller, cache)
    }

    fn config(value: Value) -> Config {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn ada_region_key() -> RegionKey {
        RegionKey {
            model: "text-ada-001".to_string(),
            input: InputId::Prompt(0),
            stop: None,
        }
    }

    #[tokio::test]
    async fn test_prune_by_invalid_region_issues_no_calls() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint.clone(), &temp);
        tuner.inference_budget = Some(0.001);
        tuner.region.mark_invalid(&ada_region_key(), 100, 5);

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 50, "n": 8, "prompt": 0}));
        let result = tuner.eval(&cfg, true, false).await.unwrap();

        assert_eq!(result.metric("n_responses"), Some(f64::NEG_INFINITY));
        assert_eq!(result.inference_cost, Some(f64::INFINITY));
        assert_eq!(result.cost, 0.0);
        assert_eq!(endpoint.call_count(), 0);
    }

    #[tokio::test]
    async fn test_prune_in_min_mode_returns_positive_infinity() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint, &temp);
        tuner.mode = OptMode::Min;
        tuner.inference_budget = Some(0.001);
        tuner.region.mark_invalid(&ada_region_key(), 100, 2);

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 50, "n": 8, "prompt": 0}));
        let result = tuner.eval(&cfg, true, false).await.unwrap();
        assert_eq!(result.metric("n_responses"), Some(f64::INFINITY));
    }

    #[tokio::test]
    async fn test_staged_growth_to_validity() {
        let temp = TempDir::new().unwrap();
        // 10 output tokens per completion, 5 input tokens per call
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint.clone(), &temp);
        // target output tokens resolves to (0.042 - 5*0.0004) / 0.0004 = 100
        tuner.inference_budget = Some(0.000042);
        tuner.avg_input_tokens = Some(5.0);

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "n": 8, "prompt": 0}));
        let result = tuner.eval(&cfg, true, false).await.unwrap();

        // the affordable-count lift puts the start at n = 6, then doubles to 8
        let issued: Vec<u64> = endpoint
            .calls()
            .iter()
            .map(|(p, _)| p.get("n").and_then(Value::as_u64).unwrap())
            .collect();
        assert_eq!(issued, vec![6, 8, 8, 8, 8]);

        assert!(tuner.region.max_valid_n(&ada_region_key(), 20) >= 8);
        assert_eq!(result.metric("n_responses"), Some(8.0));
        let inference_cost = result.inference_cost.unwrap();
        assert!(inference_cost.is_finite());
        // 80 avg output tokens plus 5 avg input tokens, all at the ada rate
        assert!((inference_cost - (80.0 * ADA_PRICE + 5.0 * ADA_PRICE) / 1000.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_over_budget_early_prune() {
        let temp = TempDir::new().unwrap();
        // far more output tokens than the target allows
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 500));
        let mut tuner = tuner(endpoint.clone(), &temp);
        // target output tokens resolves to 10
        tuner.inference_budget = Some(0.000006);
        tuner.avg_input_tokens = Some(5.0);

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "n": 1, "prompt": 0}));
        let result = tuner.eval(&cfg, true, false).await.unwrap();

        assert_eq!(endpoint.call_count(), 1);
        assert_eq!(result.metric("n_responses"), Some(0.0));
        assert!(result.cost > 0.0);
        assert_eq!(tuner.region.min_invalid_n(&ada_region_key(), 20), Some(1));
    }

    #[tokio::test]
    async fn test_optimization_budget_stops_mid_trial() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint.clone(), &temp);
        tuner.optimization_budget = Some(0.0);

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "n": 2, "prompt": 0}));
        let result = tuner.eval(&cfg, false, false).await.unwrap();

        assert_eq!(endpoint.call_count(), 1);
        assert_eq!(result.metric("n_responses"), Some(0.0));
        assert!(result.total_cost.is_some());
        assert!(result.cost > 0.0);
    }

    #[tokio::test]
    async fn test_cost_accounting() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint.clone(), &temp);

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "n": 2, "prompt": 0}));
        let result = tuner.eval(&cfg, false, false).await.unwrap();

        // 4 instances, each one call of 5 input + 20 output tokens
        let expected = 4.0 * (5.0 * ADA_PRICE + 20.0 * ADA_PRICE) / 1000.0;
        assert!((result.cost - expected).abs() < 1e-12);
        assert!((tuner.total_cost - expected).abs() < 1e-12);

        // a second identical trial is served from the cache at zero cost,
        // but total cost still accumulates per trial
        let again = tuner.eval(&cfg, false, false).await.unwrap();
        assert!((again.cost - expected).abs() < 1e-12);
        assert!((tuner.total_cost - 2.0 * expected).abs() < 1e-12);
        assert_eq!(endpoint.call_count(), 4);
    }

    #[tokio::test]
    async fn test_chat_model_request_shape() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint.clone(), &temp);

        let cfg = config(json!({"model": "gpt-3.5-turbo", "max_tokens": 20, "n": 1, "prompt": 0}));
        tuner.eval(&cfg, false, false).await.unwrap();

        for (params, flavor) in endpoint.calls() {
            assert_eq!(flavor, crate::endpoint::Flavor::Chat);
            assert!(params.contains_key("messages"));
            assert!(!params.contains_key("prompt"));
        }
    }

    #[tokio::test]
    async fn test_plain_model_request_shape() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint.clone(), &temp);

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "n": 1, "prompt": 0}));
        tuner.eval(&cfg, false, false).await.unwrap();

        for (params, _) in endpoint.calls() {
            assert!(params.contains_key("prompt"));
            assert!(!params.contains_key("messages"));
        }
    }

    #[tokio::test]
    async fn test_responses_are_right_trimmed() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::fixed(ResponseRecord::new(
            vec![Choice::text("answer  \n")],
            Usage { prompt_tokens: 5, completion_tokens: 3 },
        )));
        let mut tuner = tuner(endpoint, &temp);
        tuner.data = instances(1);
        tuner.eval_func = Arc::new(|responses, _| {
            let clean = responses.iter().all(|r| r == r.trim_end());
            let score = if clean { 1.0 } else { 0.0 };
            BTreeMap::from([("clean".to_string(), MetricValue::Number(score))])
        });
        tuner.metric = "clean".to_string();

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "n": 1, "prompt": 0}));
        let result = tuner.eval(&cfg, false, false).await.unwrap();
        assert_eq!(result.metric("clean"), Some(1.0));
    }

    #[tokio::test]
    async fn test_poisoned_call_marks_invalid() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::new(|_, _| {
            Err(EndpointError::RateLimited("slow down".into()))
        }));
        let mut tuner = tuner(endpoint, &temp);
        tuner.inference_budget = Some(0.001);

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "n": 2, "prompt": 0}));
        let result = tuner.eval(&cfg, true, false).await.unwrap();

        assert_eq!(result.metric("n_responses"), Some(0.0));
        assert_eq!(result.cost, 0.0);
        // the probe ran at n = max valid + 1 = 2
        assert_eq!(tuner.region.min_invalid_n(&ada_region_key(), 20), Some(2));
    }

    #[tokio::test]
    async fn test_temperature_or_top_p_resolution() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint.clone(), &temp);
        tuner.data = instances(1);

        let cfg = config(json!({
            "model": "text-ada-001",
            "max_tokens": 20,
            "n": 1,
            "prompt": 0,
            "temperature_or_top_p": {"top_p": 0.9},
        }));
        tuner.eval(&cfg, false, false).await.unwrap();

        let calls = endpoint.calls();
        let (params, _) = &calls[0];
        assert_eq!(params.get("top_p"), Some(&json!(0.9)));
        assert!(!params.contains_key("temperature"));
        assert!(!params.contains_key("temperature_or_top_p"));
    }

    #[tokio::test]
    async fn test_best_of_as_prune_field() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint.clone(), &temp);
        tuner.data = instances(1);
        tuner.prune_hp = PruneField::BestOf;

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "best_of": 3, "prompt": 0}));
        tuner.eval(&cfg, false, false).await.unwrap();

        let calls = endpoint.calls();
        let (params, _) = &calls[0];
        assert_eq!(params.get("best_of"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_stop_template_resolution() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint.clone(), &temp);
        tuner.data = instances(1);
        tuner.stops = vec![vec!["\n".to_string()], vec!["###".to_string(), "END".to_string()]];

        let cfg = config(json!({
            "model": "text-ada-001", "max_tokens": 20, "n": 1, "prompt": 0, "stop": 1,
        }));
        tuner.eval(&cfg, false, false).await.unwrap();

        let calls = endpoint.calls();
        let (params, _) = &calls[0];
        assert_eq!(params.get("stop"), Some(&json!(["###", "END"])));
    }

    #[tokio::test]
    async fn test_metric_aggregation_averages_numbers_only() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint, &temp);
        tuner.eval_func = Arc::new(|_responses, data| {
            let i = data
                .get("prompt")
                .and_then(Value::as_str)
                .and_then(|p| p.strip_prefix("question "))
                .and_then(|n| n.parse::<f64>().ok())
                .unwrap_or(0.0);
            BTreeMap::from([
                ("score".to_string(), MetricValue::Number(i)),
                ("tag".to_string(), MetricValue::Other(json!(format!("instance {i}")))),
            ])
        });
        tuner.metric = "score".to_string();

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "n": 1, "prompt": 0}));
        let result = tuner.eval(&cfg, false, false).await.unwrap();

        // (0 + 1 + 2 + 3) / 4
        assert_eq!(result.metric("score"), Some(1.5));
        // non-numeric fields keep the last value seen
        assert_eq!(
            result.metrics.get("tag"),
            Some(&MetricValue::Other(json!("instance 3")))
        );
    }

    #[tokio::test]
    async fn test_first_trial_records_avg_input_tokens() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(7, 10));
        let mut tuner = tuner(endpoint, &temp);
        assert!(tuner.avg_input_tokens.is_none());

        let cfg = config(json!({"model": "text-ada-001", "max_tokens": 20, "n": 1, "prompt": 0}));
        tuner.eval(&cfg, false, false).await.unwrap();
        assert_eq!(tuner.avg_input_tokens, Some(7.0));
    }

    #[tokio::test]
    async fn test_unknown_model_price_is_an_error() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let mut tuner = tuner(endpoint, &temp);

        let cfg = config(json!({"model": "unknown-model", "n": 1, "prompt": 0}));
        let result = tuner.eval(&cfg, false, false).await;
        assert!(matches!(result, Err(TuneError::UnknownPrice(_))));
    }

    #[tokio::test]
    async fn test_custom_chat_model_set() {
        let temp = TempDir::new().unwrap();
        let endpoint = Arc::new(MockEndpoint::per_completion(5, 10));
        let chat: HashSet<String> = ["my-chat-model".to_string()].into_iter().collect();
        let caller = RemoteCaller::new(endpoint.clone(), fast_retry(), Arc::new(chat));
        let cache = CallCache::open(temp.path(), 41).unwrap();
        let mut tuner = Tuner::new(
            instances(1),
            count_metric(),
            "n_responses",
            OptMode::Max,
            caller,
            cache,
        );
        tuner.prices = PriceTable::new().with_flat("my-chat-model", 0.001);

        let cfg = config(json!({"model": "my-chat-model", "n": 1, "prompt": 0}));
        tuner.eval(&cfg, false, false).await.unwrap();
        let calls = endpoint.calls();
        let (params, _) = &calls[0];
        assert!(params.contains_key("messages"));
    }

    #[test]
    fn test_pruned_result_shape() {
        let result = TrialResult::pruned("success", OptMode::Min);
        assert_eq!(result.metric("success"), Some(f64::INFINITY));
        assert_eq!(result.inference_cost, Some(f64::INFINITY));
        assert_eq!(result.cost, 0.0);
    }

    #[test]
    fn test_result_to_json_handles_infinities() {
        let result = TrialResult::pruned("success", OptMode::Min);
        let json = result.to_json();
        assert_eq!(json["metrics"]["success"], json!("Infinity"));
        assert_eq!(json["inference_cost"], json!("Infinity"));
    }

    #[test]
    fn test_prune_field_keys() {
        assert_eq!(PruneField::N.key(), "n");
        assert_eq!(PruneField::BestOf.key(), "best_of");
    }
}
