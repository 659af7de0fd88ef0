//! Run context: everything a run owns, created at run start and torn down
//! (flushing persistence) at its end.

use std::sync::Arc;
use tracing::{info, warn};
use tw_optimizer::{MetaOptimizer, Strategy};
use tw_store::TrialStore;
use tw_types::{
    config_error, Assignment, FailureReason, SearchSpace, TrialStatus, TuneResult, SEED_ORIGIN,
};

use crate::config::RunConfig;
use crate::evaluator::Evaluator;

pub struct RunContext {
    pub(crate) config: RunConfig,
    pub(crate) space: SearchSpace,
    pub(crate) meta: MetaOptimizer,
    pub(crate) store: Box<dyn TrialStore>,
    pub(crate) evaluator: Arc<dyn Evaluator>,
    seeds: Vec<Assignment>,
    reconciled: usize,
    replayed: usize,
}

impl RunContext {
    /// Validate the configuration, mark trials left in flight by a previous
    /// process as abandoned and replay the store into the meta-optimizer.
    pub fn new(
        config: RunConfig,
        space: SearchSpace,
        strategies: Vec<Box<dyn Strategy>>,
        mut store: Box<dyn TrialStore>,
        evaluator: Arc<dyn Evaluator>,
    ) -> TuneResult<Self> {
        config.validate()?;
        let mut meta = MetaOptimizer::new(strategies, config.meta.clone(), config.direction)?;

        let mut reconciled = 0;
        for trial in store.all_trials()? {
            if matches!(trial.status, TrialStatus::Pending | TrialStatus::Running) {
                store.mark_failed(trial.id, FailureReason::Abandoned)?;
                reconciled += 1;
            }
        }
        if reconciled > 0 {
            warn!(trials = reconciled, "marked trials from an interrupted run as abandoned");
        }

        let history = store.all_trials()?;
        let replayed = meta.replay(&history);
        if !history.is_empty() {
            info!(
                trials = history.len(),
                rewards = replayed,
                best = ?meta.running_best(),
                "replayed trial history"
            );
        }

        Ok(Self {
            config,
            space,
            meta,
            store,
            evaluator,
            seeds: Vec::new(),
            reconciled,
            replayed,
        })
    }

    /// User-supplied assignments evaluated before any strategy proposes.
    /// Seeds already recorded by an earlier run are not evaluated again.
    pub fn with_seeds(mut self, seeds: Vec<Assignment>) -> TuneResult<Self> {
        for seed in seeds {
            let seed = self.space.coerce(seed);
            self.space
                .validate(&seed)
                .map_err(|e| config_error!("invalid seed assignment: {e}"))?;
            self.seeds.push(seed);
        }
        Ok(self)
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn meta(&self) -> &MetaOptimizer {
        &self.meta
    }

    pub fn store(&self) -> &dyn TrialStore {
        &*self.store
    }

    pub fn into_store(self) -> Box<dyn TrialStore> {
        self.store
    }

    /// Trials marked abandoned at construction.
    pub fn reconciled(&self) -> usize {
        self.reconciled
    }

    /// Rewards applied while replaying the store.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Seed assignments still to evaluate: the default assignment (only for
    /// a fresh run) followed by user seeds, minus those already recorded.
    pub(crate) fn pending_seeds(&self) -> TuneResult<Vec<Assignment>> {
        let history = self.store.all_trials()?;
        let recorded = history.iter().filter(|t| t.origin == SEED_ORIGIN).count();

        let mut queue = Vec::with_capacity(self.seeds.len() + 1);
        if self.config.evaluate_default_first && (history.is_empty() || recorded > 0) {
            match self.space.sample_default() {
                Ok(default) => queue.push(default),
                Err(e) => warn!(error = %e, "default assignment is infeasible, skipping it"),
            }
        }
        queue.extend(self.seeds.iter().cloned());
        queue.drain(..recorded.min(queue.len()));
        Ok(queue)
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("config", &self.config)
            .field("space", &self.space)
            .field("meta", &self.meta)
            .field("seeds", &self.seeds.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::FnEvaluator;
    use tw_optimizer::{MetaConfig, RandomSearch};
    use tw_store::MemoryTrialStore;
    use tw_types::{NewTrial, ParameterValue, TuneError};

    fn space() -> SearchSpace {
        SearchSpace::builder()
            .integer("depth", 1, 5)
            .continuous("lr", 0.0, 1.0)
            .build()
            .unwrap()
    }

    fn evaluator() -> Arc<dyn Evaluator> {
        Arc::new(FnEvaluator::new(|_| Ok(0.0)))
    }

    fn pool() -> Vec<Box<dyn Strategy>> {
        vec![Box::new(RandomSearch::new())]
    }

    fn assignment(depth: i64) -> Assignment {
        let mut a = Assignment::new();
        a.insert("depth".into(), ParameterValue::Int(depth));
        a.insert("lr".into(), ParameterValue::Float(0.5));
        a
    }

    #[test]
    fn empty_pool_fails_fast() {
        let err = RunContext::new(
            RunConfig::new(10),
            space(),
            Vec::new(),
            Box::new(MemoryTrialStore::new()),
            evaluator(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "EmptyStrategyPool");
        assert!(err.is_fatal());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RunConfig::new(10).with_meta(MetaConfig::default().with_failure_penalty(0.5));
        let err = RunContext::new(config, space(), pool(), Box::new(MemoryTrialStore::new()), evaluator())
            .unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));
    }

    #[test]
    fn stale_trials_are_abandoned_and_replayed() {
        let mut store = MemoryTrialStore::new();
        let done = store.append(NewTrial::new("random", assignment(1))).unwrap();
        store.mark_running(done).unwrap();
        store
            .mark_completed(done, 1.0, Default::default())
            .unwrap();
        let running = store.append(NewTrial::new("random", assignment(2))).unwrap();
        store.mark_running(running).unwrap();
        store.append(NewTrial::new("random", assignment(3))).unwrap();

        let ctx = RunContext::new(RunConfig::new(10), space(), pool(), Box::new(store), evaluator())
            .unwrap();
        assert_eq!(ctx.reconciled(), 2);
        assert_eq!(ctx.replayed(), 1);

        let trials = ctx.store().all_trials().unwrap();
        assert!(trials[1..]
            .iter()
            .all(|t| t.failure == Some(FailureReason::Abandoned)));
        // Abandoned trials carry no penalty.
        assert_eq!(ctx.meta().arm_statistics()[0].1.pulls, 1);
    }

    #[test]
    fn seeds_are_validated_and_not_repeated() {
        let ctx = RunContext::new(
            RunConfig::new(10),
            space(),
            pool(),
            Box::new(MemoryTrialStore::new()),
            evaluator(),
        )
        .unwrap()
        .with_seeds(vec![assignment(2), assignment(4)])
        .unwrap();
        let queue = ctx.pending_seeds().unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue[0], space().sample_default().unwrap());

        let mut store = MemoryTrialStore::new();
        for a in [space().sample_default().unwrap(), assignment(2)] {
            let id = store.append(NewTrial::new(SEED_ORIGIN, a)).unwrap();
            store.mark_running(id).unwrap();
            store.mark_completed(id, 0.0, Default::default()).unwrap();
        }
        let resumed = RunContext::new(RunConfig::new(10), space(), pool(), Box::new(store), evaluator())
            .unwrap()
            .with_seeds(vec![assignment(2), assignment(4)])
            .unwrap();
        assert_eq!(resumed.pending_seeds().unwrap(), vec![assignment(4)]);

        let invalid = RunContext::new(
            RunConfig::new(10),
            space(),
            pool(),
            Box::new(MemoryTrialStore::new()),
            evaluator(),
        )
        .unwrap()
        .with_seeds(vec![assignment(9)]);
        assert!(matches!(invalid, Err(TuneError::Config(_))));
    }

    #[test]
    fn integer_seed_values_are_coerced_for_continuous_parameters() {
        let mut seed = assignment(3);
        seed.insert("lr".into(), ParameterValue::Int(1));
        let ctx = RunContext::new(
            RunConfig::new(10).with_default_first(false),
            space(),
            pool(),
            Box::new(MemoryTrialStore::new()),
            evaluator(),
        )
        .unwrap()
        .with_seeds(vec![seed])
        .unwrap();
        assert_eq!(
            ctx.pending_seeds().unwrap()[0]["lr"],
            ParameterValue::Float(1.0)
        );
    }
}
