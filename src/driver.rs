//! Tuning driver and serving path.
//!
//! `tune` normalises the user-facing search space (template tables become
//! integer-indexed choice variables, temperature/top-p exclusivity is
//! enforced), seeds the injected search algorithm with one starting point
//! per candidate model, runs the suggest/evaluate loop under the
//! optimization budget, and materialises the best configuration back into
//! concrete templates. `create` is the one-shot serving sibling.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cache::{CallCache, DEFAULT_CACHE_ROOT, DEFAULT_SEED};
use crate::caller::{CallOutcome, RemoteCaller, RetryPolicy};
use crate::endpoint::CompletionEndpoint;
use crate::error::{Result, TuneError};
use crate::evaluator::{
    DEFAULT_HOEFFDING_FACTOR, EvalFn, PruneField, Tuner, index_field,
};
use crate::price::{PriceTable, default_chat_models, default_price_table};
use crate::search::{ExperimentAnalysis, OptMode, SearchAlgorithm, SearchSetup, TrialRecord};
use crate::space::{Domain, SearchSpace, candidate_models, default_search_space};
use crate::template::{InputTemplates, MessageTemplate, Template, bind_input};
use crate::{Config, DataInstance};

/// Parameters of a tuning run.
#[derive(Debug, Clone)]
pub struct TuneOptions {
    /// Metric field to optimize.
    pub metric: String,
    pub mode: OptMode,
    /// Maximum permitted average serving cost per data instance.
    pub inference_budget: Option<f64>,
    /// Maximum permitted total spend during tuning.
    pub optimization_budget: Option<f64>,
    /// Number of trials; -1 means bounded only by the optimization budget.
    pub num_samples: i64,
    /// Optional JSONL log of completed trials.
    pub log_file_name: Option<PathBuf>,
    pub cache_root: PathBuf,
    pub cache_seed: u64,
    pub retry: RetryPolicy,
    pub hoeffding_factor: f64,
    pub prices: PriceTable,
    pub chat_models: HashSet<String>,
}

impl TuneOptions {
    pub fn new(metric: impl Into<String>, mode: OptMode) -> Self {
        Self {
            metric: metric.into(),
            mode,
            inference_budget: None,
            optimization_budget: None,
            num_samples: 1,
            log_file_name: None,
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            cache_seed: DEFAULT_SEED,
            retry: RetryPolicy::default(),
            hoeffding_factor: DEFAULT_HOEFFDING_FACTOR,
            prices: default_price_table(),
            chat_models: default_chat_models(),
        }
    }
}

/// User overrides merged onto the default search space.
///
/// Domains replace same-named defaults; template tables replace the default
/// prompt table and are folded into integer-indexed choice variables.
#[derive(Debug, Default)]
pub struct SpaceOverrides {
    pub space: SearchSpace,
    pub prompts: Vec<Template>,
    pub messages: Vec<Vec<MessageTemplate>>,
    pub stops: Vec<Vec<String>>,
}

impl SpaceOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, name: impl Into<String>, domain: Domain) -> Self {
        self.space.insert(name.into(), domain);
        self
    }

    pub fn with_prompt(mut self, prompt: Template) -> Self {
        self.prompts.push(prompt);
        self
    }

    pub fn with_messages(mut self, messages: Vec<MessageTemplate>) -> Self {
        self.messages.push(messages);
        self
    }

    /// Add one stop template; a bare string becomes a one-element list.
    pub fn with_stop(mut self, stop: impl Into<StopTemplate>) -> Self {
        self.stops.push(stop.into().0);
        self
    }
}

/// A stop template: one string or an ordered list of strings.
#[derive(Debug, Clone)]
pub struct StopTemplate(pub Vec<String>);

impl From<&str> for StopTemplate {
    fn from(s: &str) -> Self {
        Self(vec![s.to_string()])
    }
}

impl From<Vec<String>> for StopTemplate {
    fn from(list: Vec<String>) -> Self {
        Self(list)
    }
}

/// The best configuration, materialised into concrete request inputs.
#[derive(Debug, Clone)]
pub struct TunedParams {
    /// Request parameters with stop and sampling controls resolved.
    pub params: Config,
    pub prompt: Option<Template>,
    pub messages: Option<Vec<MessageTemplate>>,
}

/// Serving-path options for [`create`].
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub use_cache: bool,
    pub cache_root: PathBuf,
    pub cache_seed: u64,
    pub retry: RetryPolicy,
    pub chat_models: HashSet<String>,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            cache_seed: DEFAULT_SEED,
            retry: RetryPolicy::default(),
            chat_models: default_chat_models(),
        }
    }
}

pub(crate) struct NormalisedSpace {
    pub space: SearchSpace,
    pub prompts: Vec<Template>,
    pub messages: Vec<Vec<MessageTemplate>>,
    pub stops: Vec<Vec<String>>,
    pub prune_hp: PruneField,
}

/// Merge user overrides onto the default space and fold templates into
/// index choices.
pub(crate) fn normalise_space(overrides: SpaceOverrides) -> Result<NormalisedSpace> {
    let mut space = default_search_space();
    for (name, domain) in overrides.space {
        space.insert(name, domain);
    }

    if !overrides.messages.is_empty() && !overrides.prompts.is_empty() {
        return Err(TuneError::InvalidArgument(
            "messages and prompt cannot be provided at the same time".to_string(),
        ));
    }
    let mut prompts = overrides.prompts;
    let messages = overrides.messages;
    if messages.is_empty() {
        if prompts.is_empty() {
            prompts.push(Template::format("{prompt}"));
        }
        space.insert("prompt".to_string(), Domain::index_choice(prompts.len()));
        space.remove("messages");
    } else {
        if messages.iter().any(Vec::is_empty) {
            return Err(TuneError::InvalidArgument(
                "each messages template must contain at least one message".to_string(),
            ));
        }
        space.insert("messages".to_string(), Domain::index_choice(messages.len()));
        space.remove("prompt");
    }

    let stops = overrides.stops;
    if !stops.is_empty() {
        space.insert("stop".to_string(), Domain::index_choice(stops.len()));
    }

    let temperature = space.remove("temperature");
    let top_p = space.remove("top_p");
    match (temperature, top_p) {
        (Some(domain), None) => {
            space.insert(
                "temperature_or_top_p".to_string(),
                Domain::Map([("temperature".to_string(), domain)].into()),
            );
        }
        (None, Some(domain)) => {
            space.insert(
                "temperature_or_top_p".to_string(),
                Domain::Map([("top_p".to_string(), domain)].into()),
            );
        }
        (Some(temperature), Some(top_p)) => {
            warn!("temperature and top_p are not recommended to vary together");
            space.remove("temperature_or_top_p");
            space.insert("temperature".to_string(), temperature);
            space.insert("top_p".to_string(), top_p);
        }
        (None, None) => {}
    }

    let prune_hp = match space.get("best_of") {
        Some(domain) if domain.as_constant().and_then(Value::as_u64) == Some(1) => PruneField::N,
        Some(_) => PruneField::BestOf,
        None => PruneField::N,
    };

    Ok(NormalisedSpace { space, prompts, messages, stops, prune_hp })
}

/// Search the space for the configuration optimizing the metric under both
/// budgets.
///
/// Returns the best configuration materialised into concrete templates,
/// together with the full analysis of the run.
pub async fn tune(
    data: Vec<DataInstance>,
    eval_func: Arc<EvalFn>,
    endpoint: Arc<dyn CompletionEndpoint>,
    search_factory: impl Fn(&SearchSetup) -> Box<dyn SearchAlgorithm>,
    overrides: SpaceOverrides,
    options: TuneOptions,
) -> Result<(TunedParams, ExperimentAnalysis)> {
    if data.is_empty() {
        return Err(TuneError::InvalidArgument("data must not be empty".to_string()));
    }
    let normalised = normalise_space(overrides)?;

    let mut setup = SearchSetup {
        space: normalised.space.clone(),
        metric: options.metric.clone(),
        mode: options.mode,
        cost_attr: "cost".to_string(),
        cost_budget: options.optimization_budget,
        points_to_evaluate: Vec::new(),
    };
    // start every candidate model from a common configuration
    let models = candidate_models(&normalised.space);
    if models.len() > 1 {
        let mut seeder = search_factory(&setup);
        if let Some(first) = seeder.suggest("t0") {
            let mut points = vec![first.clone()];
            for model in &models {
                if first.get("model").and_then(Value::as_str) != Some(model) {
                    let mut point = first.clone();
                    point.insert("model".to_string(), json!(model));
                    points.push(point);
                }
            }
            setup.points_to_evaluate = points;
        }
    }
    let mut algorithm = search_factory(&setup);

    let cache = CallCache::open(&options.cache_root, options.cache_seed)?;
    let caller = RemoteCaller::new(
        endpoint,
        options.retry.clone(),
        Arc::new(options.chat_models.clone()),
    );
    let mut tuner = Tuner::new(
        data,
        eval_func,
        options.metric.clone(),
        options.mode,
        caller,
        cache,
    );
    tuner.prompts = normalised.prompts;
    tuner.messages = normalised.messages;
    tuner.stops = normalised.stops;
    tuner.prune_hp = normalised.prune_hp;
    tuner.inference_budget = options.inference_budget;
    tuner.optimization_budget = options.optimization_budget;
    tuner.prices = options.prices.clone();
    tuner.hoeffding_factor = options.hoeffding_factor;

    let mut log = match &options.log_file_name {
        Some(path) => Some(TrialLog::open(path)?),
        None => None,
    };
    let mut analysis = ExperimentAnalysis::new(options.metric.clone(), options.mode);
    let mut trial = 0i64;
    loop {
        if options.num_samples >= 0 && trial >= options.num_samples {
            break;
        }
        let trial_id = format!("t{trial}");
        let Some(config) = algorithm.suggest(&trial_id) else {
            break;
        };
        debug!(trial_id = %trial_id, "evaluating trial");
        let result = tuner.eval(&config, true, false).await?;
        algorithm.on_trial_complete(&trial_id, &result);
        let record = TrialRecord { trial_id, config, result };
        if let Some(log) = &mut log {
            log.append(&record.to_json())?;
        }
        analysis.push(record);
        trial += 1;
        if let Some(budget) = options.optimization_budget {
            if tuner.total_cost >= budget {
                info!(total_cost = tuner.total_cost, "stopping search, optimization budget spent");
                break;
            }
        }
    }

    let best = analysis
        .best_config()
        .cloned()
        .ok_or_else(|| TuneError::InvalidArgument("search produced no trials".to_string()))?;
    let params = materialise(&best, &tuner.prompts, &tuner.messages, &tuner.stops)?;
    Ok((params, analysis))
}

/// Resolve a tuned configuration's template indices back into templates.
fn materialise(
    config: &Config,
    prompts: &[Template],
    messages: &[Vec<MessageTemplate>],
    stops: &[Vec<String>],
) -> Result<TunedParams> {
    let mut params = config.clone();
    if !stops.is_empty() {
        let index = index_field(config, "stop")?.ok_or_else(|| {
            TuneError::InvalidArgument("config is missing a stop template".to_string())
        })?;
        let stop = stops.get(index).ok_or_else(|| {
            TuneError::InvalidArgument(format!("stop index {index} out of range"))
        })?;
        params.insert("stop".to_string(), json!(stop));
    }
    if let Some(Value::Object(choice)) = params.remove("temperature_or_top_p") {
        for (name, value) in choice {
            params.insert(name, value);
        }
    }

    let prompt_index = index_field(config, "prompt")?;
    let messages_index = index_field(config, "messages")?;
    params.remove("prompt");
    params.remove("messages");
    match (prompt_index, messages_index) {
        (Some(index), None) => {
            let prompt = prompts.get(index).cloned().ok_or_else(|| {
                TuneError::InvalidArgument(format!("prompt index {index} out of range"))
            })?;
            Ok(TunedParams { params, prompt: Some(prompt), messages: None })
        }
        (None, Some(index)) => {
            let template = messages.get(index).cloned().ok_or_else(|| {
                TuneError::InvalidArgument(format!("messages index {index} out of range"))
            })?;
            Ok(TunedParams { params, prompt: None, messages: Some(template) })
        }
        _ => Err(TuneError::InvalidArgument(
            "config must carry exactly one of prompt and messages".to_string(),
        )),
    }
}

/// Make one completion for a context, optionally through the cache.
///
/// The cache scope is opened and released per call, so concurrent processes
/// sharing the cache directory only contend for the duration of one lookup.
pub async fn create(
    endpoint: Arc<dyn CompletionEndpoint>,
    tuned: &TunedParams,
    context: &DataInstance,
    options: &ServeOptions,
) -> Result<CallOutcome> {
    let caller = RemoteCaller::new(
        endpoint.clone(),
        options.retry.clone(),
        Arc::new(options.chat_models.clone()),
    );
    let model = tuned
        .params
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| TuneError::InvalidArgument("params are missing a model".to_string()))?
        .to_string();
    let chat = caller.is_chat(&model);

    let input = match (&tuned.prompt, &tuned.messages) {
        (Some(prompt), None) => InputTemplates::Prompt(prompt),
        (None, Some(messages)) => InputTemplates::Messages(messages),
        (Some(_), Some(_)) => {
            return Err(TuneError::InvalidArgument(
                "prompt and messages cannot both be set".to_string(),
            ));
        }
        (None, None) => {
            return Err(TuneError::InvalidArgument(
                "a prompt or messages template is required".to_string(),
            ));
        }
    };
    let mut params = tuned.params.clone();
    bind_input(&mut params, &input, chat, context)?;

    if options.use_cache {
        let mut cache = CallCache::open(&options.cache_root, options.cache_seed)?;
        caller.get_response(&mut cache, &params, true).await
    } else {
        let record = endpoint
            .complete(&params, caller.flavor(&model))
            .await
            .map_err(TuneError::Endpoint)?;
        Ok(CallOutcome::Response(record))
    }
}

/// Append-only JSONL log of completed trials.
struct TrialLog {
    file: File,
}

impl TrialLog {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    fn append(&mut self, record: &Value) -> Result<()> {
        writeln!(self.file, "{record}")?;
        Ok(())
    }
}
