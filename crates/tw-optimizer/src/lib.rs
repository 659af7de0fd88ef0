//! # tw-optimizer
//!
//! Proposal strategies and the bandit meta-optimizer that arbitrates
//! between them.
//!
//! Built-in strategies:
//! - **Random**: independent (log-)uniform sampling with constraint rejection
//! - **Grid**: exhaustive grid, resumable from the trial history
//! - **Local**: perturbation of the best-known assignment
//! - **Surrogate**: k-NN surrogate with expected-improvement acquisition

pub mod bandit;
pub mod meta;
pub mod pool;
pub mod search;
pub mod surrogate;

pub use bandit::{ArmStatistics, MetaConfig, RewardPolicy, SelectionPolicy};
pub use meta::{derive_rng, MetaOptimizer, MetaState, Proposal, ProposalRequest};
pub use pool::{build_pool, default_pool, StrategyConfig};
pub use search::{
    sample_feasible, sample_feasible_batch, sample_uniform, GridSearch, LocalSearch, ProposalContext, RandomSearch,
    Strategy,
};
pub use surrogate::{
    expected_improvement, latin_hypercube, KnnSurrogate, Prediction, SurrogateModel,
    SurrogateSearch,
};
