//! Run configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tw_optimizer::{MetaConfig, StrategyConfig};
use tw_types::{config_error, Assignment, ObjectiveDirection, ParameterSpec, TuneResult};

/// Scheduler and meta-optimizer settings for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Total trials in the store, so a resumed run continues toward the same
    /// budget.
    pub max_trials: usize,
    /// Concurrent evaluations; also the batch size.
    pub parallelism: usize,
    pub wall_clock_budget_ms: Option<u64>,
    pub evaluation_timeout_ms: u64,
    /// How long in-flight evaluations may finish after cancellation.
    pub cancel_grace_ms: u64,
    pub seed: u64,
    pub direction: ObjectiveDirection,
    /// Failed proposal attempts tolerated per scheduling step.
    pub max_proposal_retries: usize,
    /// Consecutive scheduling steps in which every strategy failed before the
    /// run aborts with `NoViableStrategy`.
    pub max_failed_steps: usize,
    /// Evaluate the default assignment as trial 0 of a fresh run.
    pub evaluate_default_first: bool,
    pub meta: MetaConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_trials: 100,
            parallelism: 1,
            wall_clock_budget_ms: None,
            evaluation_timeout_ms: 300_000,
            cancel_grace_ms: 5_000,
            seed: 0,
            direction: ObjectiveDirection::Minimize,
            max_proposal_retries: 3,
            max_failed_steps: 20,
            evaluate_default_first: true,
            meta: MetaConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn new(max_trials: usize) -> Self {
        Self {
            max_trials,
            ..Default::default()
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_wall_clock_budget(mut self, budget: Duration) -> Self {
        self.wall_clock_budget_ms = Some(budget.as_millis() as u64);
        self
    }

    pub fn with_evaluation_timeout(mut self, timeout: Duration) -> Self {
        self.evaluation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_max_proposal_retries(mut self, retries: usize) -> Self {
        self.max_proposal_retries = retries;
        self
    }

    pub fn with_max_failed_steps(mut self, steps: usize) -> Self {
        self.max_failed_steps = steps;
        self
    }

    pub fn with_default_first(mut self, enabled: bool) -> Self {
        self.evaluate_default_first = enabled;
        self
    }

    pub fn with_meta(mut self, meta: MetaConfig) -> Self {
        self.meta = meta;
        self
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn wall_clock_budget(&self) -> Option<Duration> {
        self.wall_clock_budget_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.max_trials == 0 {
            return Err(config_error!("max_trials must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(config_error!("parallelism must be at least 1"));
        }
        if self.max_failed_steps == 0 {
            return Err(config_error!("max_failed_steps must be at least 1"));
        }
        if self.evaluation_timeout_ms == 0 {
            return Err(config_error!("evaluation_timeout_ms must be positive"));
        }
        self.meta.validate().map_err(|e| config_error!("{e}"))
    }
}

/// A run file as read by `tunewell-run`.
///
/// ```json
/// {
///   "parameters": [
///     {"name": "lr", "kind": "log_continuous", "low": 1e-4, "high": 0.1},
///     {"name": "depth", "kind": "integer", "low": 1, "high": 5}
///   ],
///   "command": "python train.py --lr {lr} --depth {depth}",
///   "iterations": 10,
///   "trials_per_iteration": 2,
///   "database": "tuning.db"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFile {
    pub parameters: Vec<ParameterSpec>,
    pub command: String,
    pub iterations: usize,
    #[serde(default = "default_trials_per_iteration")]
    pub trials_per_iteration: usize,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    /// Strategy pool; the default pool when absent.
    #[serde(default)]
    pub strategies: Option<Vec<StrategyConfig>>,
    #[serde(default)]
    pub seeds: Vec<Assignment>,
    #[serde(default)]
    pub run: RunConfig,
}

fn default_trials_per_iteration() -> usize {
    1
}

fn default_database() -> PathBuf {
    PathBuf::from("tunewell.db")
}

impl RunFile {
    pub fn load(path: &Path) -> TuneResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read run file {}: {e}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> TuneResult<Self> {
        serde_json::from_str(text).map_err(|e| config_error!("invalid run file: {e}"))
    }

    /// Effective run config: the iteration plan sets budget and parallelism.
    pub fn run_config(&self) -> TuneResult<RunConfig> {
        let max_trials = self
            .iterations
            .checked_mul(self.trials_per_iteration)
            .ok_or_else(|| config_error!("iterations * trials_per_iteration overflows"))?;
        let config = RunConfig {
            max_trials,
            parallelism: self.trials_per_iteration,
            ..self.run.clone()
        };
        config.validate()?;
        Ok(config)
    }
}
