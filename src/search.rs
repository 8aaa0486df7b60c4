//! Search-algorithm interface and tuning analysis.
//!
//! The blackbox search algorithm is injected: the driver hands it the
//! normalised space and a per-trial cost attribute, asks it to propose
//! configurations, and feeds results back. Any cost-aware optimizer can be
//! plugged in through these types.

use serde_json::json;

use crate::Config;
use crate::evaluator::TrialResult;

/// Optimization direction of the target metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptMode {
    Min,
    Max,
}

impl OptMode {
    /// The synthetic metric value assigned to pruned trials.
    pub fn worst(self) -> f64 {
        match self {
            Self::Min => f64::INFINITY,
            Self::Max => f64::NEG_INFINITY,
        }
    }

    /// Whether `candidate` improves on `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Min => candidate < incumbent,
            Self::Max => candidate > incumbent,
        }
    }
}

/// Everything a search algorithm needs at construction time.
#[derive(Debug, Clone)]
pub struct SearchSetup {
    pub space: crate::space::SearchSpace,
    pub metric: String,
    pub mode: OptMode,
    /// Result field the algorithm should treat as the trial cost.
    pub cost_attr: String,
    /// Total spend the algorithm should plan for.
    pub cost_budget: Option<f64>,
    /// Configurations to evaluate before sampling, in order.
    pub points_to_evaluate: Vec<Config>,
}

/// A cost-aware blackbox search algorithm.
pub trait SearchAlgorithm {
    /// Propose the configuration for a trial, or `None` when finished.
    fn suggest(&mut self, trial_id: &str) -> Option<Config>;

    /// Consume the result of a completed trial.
    fn on_trial_complete(&mut self, _trial_id: &str, _result: &TrialResult) {}
}

/// One completed trial.
#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub trial_id: String,
    pub config: Config,
    pub result: TrialResult,
}

impl TrialRecord {
    /// JSON form used for the trial log.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "trial_id": self.trial_id,
            "config": self.config,
            "result": self.result.to_json(),
            "recorded_at": chrono::Utc::now().to_rfc3339(),
        })
    }
}

/// The accumulated outcome of a tuning run.
#[derive(Debug, Default)]
pub struct ExperimentAnalysis {
    pub metric: String,
    pub mode: Option<OptMode>,
    pub trials: Vec<TrialRecord>,
}

impl ExperimentAnalysis {
    pub fn new(metric: impl Into<String>, mode: OptMode) -> Self {
        Self {
            metric: metric.into(),
            mode: Some(mode),
            trials: Vec::new(),
        }
    }

    pub fn push(&mut self, record: TrialRecord) {
        self.trials.push(record);
    }

    /// The trial with the best metric value, earliest on ties.
    pub fn best_trial(&self) -> Option<&TrialRecord> {
        let mode = self.mode?;
        let mut best: Option<(&TrialRecord, f64)> = None;
        for trial in &self.trials {
            let Some(value) = trial.result.metric(&self.metric) else {
                continue;
            };
            if value.is_nan() {
                continue;
            }
            match best {
                Some((_, incumbent)) if !mode.is_better(value, incumbent) => {}
                _ => best = Some((trial, value)),
            }
        }
        best.map(|(t, _)| t)
    }

    /// The configuration of the best trial.
    pub fn best_config(&self) -> Option<&Config> {
        self.best_trial().map(|t| &t.config)
    }

    /// Total spend across all recorded trials.
    pub fn total_cost(&self) -> f64 {
        self.trials.iter().map(|t| t.result.cost).sum()
    }
}
