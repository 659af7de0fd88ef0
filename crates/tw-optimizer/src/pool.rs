//! Declarative strategy pool configuration.

use serde::{Deserialize, Serialize};

use crate::search::{GridSearch, LocalSearch, RandomSearch, Strategy};
use crate::surrogate::{KnnSurrogate, SurrogateSearch};

/// One entry of a strategy pool, as written in a run file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    Random {
        #[serde(default = "default_attempts")]
        max_attempts: usize,
    },
    Grid {
        #[serde(default = "default_grid_steps")]
        float_steps: usize,
    },
    Local {
        #[serde(default = "default_initial_step")]
        initial_step: f64,
        #[serde(default = "default_min_step")]
        min_step: f64,
        #[serde(default = "default_patience")]
        patience: usize,
    },
    Surrogate {
        #[serde(default = "default_neighbours")]
        neighbours: usize,
        #[serde(default = "default_min_observations")]
        min_observations: usize,
        #[serde(default = "default_candidate_pool")]
        candidate_pool: usize,
        #[serde(default = "default_xi")]
        xi: f64,
    },
}

fn default_attempts() -> usize {
    100
}

fn default_grid_steps() -> usize {
    5
}

fn default_initial_step() -> f64 {
    0.2
}

fn default_min_step() -> f64 {
    0.01
}

fn default_patience() -> usize {
    4
}

fn default_neighbours() -> usize {
    5
}

fn default_min_observations() -> usize {
    5
}

fn default_candidate_pool() -> usize {
    256
}

fn default_xi() -> f64 {
    0.01
}

impl StrategyConfig {
    pub fn build(&self) -> Box<dyn Strategy> {
        match *self {
            Self::Random { max_attempts } => {
                Box::new(RandomSearch::new().with_max_attempts(max_attempts))
            }
            Self::Grid { float_steps } => Box::new(GridSearch::new(float_steps)),
            Self::Local {
                initial_step,
                min_step,
                patience,
            } => Box::new(
                LocalSearch::new()
                    .with_step(initial_step, min_step)
                    .with_patience(patience),
            ),
            Self::Surrogate {
                neighbours,
                min_observations,
                candidate_pool,
                xi,
            } => Box::new(
                SurrogateSearch::new(Box::new(KnnSurrogate::new(neighbours)))
                    .with_min_observations(min_observations)
                    .with_candidate_pool(candidate_pool)
                    .with_exploration(xi),
            ),
        }
    }
}

/// Surrogate, random and local search with default settings.
pub fn default_pool() -> Vec<StrategyConfig> {
    vec![
        StrategyConfig::Surrogate {
            neighbours: default_neighbours(),
            min_observations: default_min_observations(),
            candidate_pool: default_candidate_pool(),
            xi: default_xi(),
        },
        StrategyConfig::Random {
            max_attempts: default_attempts(),
        },
        StrategyConfig::Local {
            initial_step: default_initial_step(),
            min_step: default_min_step(),
            patience: default_patience(),
        },
    ]
}

pub fn build_pool(configs: &[StrategyConfig]) -> Vec<Box<dyn Strategy>> {
    configs.iter().map(StrategyConfig::build).collect()
}
