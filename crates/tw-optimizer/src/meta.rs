//! Bandit meta-optimizer: treats each strategy as an arm, picks which one
//! proposes next and learns from trial outcomes.

use std::collections::HashMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tw_types::{
    Assignment, MetaError, ObjectiveDirection, SearchSpace, SpaceError, Trial, TrialId,
    TrialStatus, TuneResult,
};

use crate::bandit::{ArmStatistics, MetaConfig};
use crate::search::{ProposalContext, Strategy};

/// Stream index used for the selection RNG, distinct from every arm index.
const SELECTION_STREAM: u64 = u64::MAX;

// SplitMix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Deterministic RNG for one proposal step, derived from the run seed and
/// the step coordinates.
pub fn derive_rng(seed: u64, parts: &[u64]) -> ChaCha8Rng {
    let state = parts.iter().fold(mix(seed), |acc, &p| mix(acc ^ mix(p)));
    ChaCha8Rng::seed_from_u64(state)
}

struct Arm {
    strategy: Box<dyn Strategy>,
    stats: ArmStatistics,
}

/// Observable meta-optimizer state; two optimizers that saw the same trials
/// in the same order compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaState {
    pub arms: Vec<(String, ArmStatistics)>,
    /// Best oriented score seen so far (higher is better).
    pub running_best: Option<f64>,
    pub last_observed: Option<TrialId>,
}

/// One proposal step.
pub struct ProposalRequest<'a> {
    pub space: &'a SearchSpace,
    /// Store history at the start of the step, ordered by id.
    pub history: &'a [Trial],
    /// Wanted candidates (>= 1).
    pub k: usize,
    pub seed: u64,
    /// Id the next stored trial will get.
    pub next_trial_id: TrialId,
    /// Dispatches already planned per arm in the current batch.
    pub virtual_pulls: &'a [u64],
    pub max_retries: usize,
}

/// Outcome of one proposal step.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Arm index and id of the strategy whose candidates were accepted;
    /// `None` when every attempt of the step failed.
    pub accepted: Option<(usize, String)>,
    /// Valid candidates, empty exactly when `accepted` is `None`.
    pub assignments: Vec<Assignment>,
    /// Arm of each failed trial recorded while producing this proposal.
    pub failed_arms: Vec<usize>,
}

impl Proposal {
    pub fn strategy_id(&self) -> Option<&str> {
        self.accepted.as_ref().map(|(_, id)| id.as_str())
    }
}

/// Bandit over a fixed pool of strategies.
pub struct MetaOptimizer {
    arms: Vec<Arm>,
    index: HashMap<String, usize>,
    config: MetaConfig,
    direction: ObjectiveDirection,
    running_best: Option<f64>,
    last_observed: Option<TrialId>,
}

impl MetaOptimizer {
    pub fn new(
        strategies: Vec<Box<dyn Strategy>>,
        config: MetaConfig,
        direction: ObjectiveDirection,
    ) -> Result<Self, MetaError> {
        if strategies.is_empty() {
            return Err(MetaError::EmptyStrategyPool);
        }
        let mut index = HashMap::with_capacity(strategies.len());
        let mut arms = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let id = strategy.id().to_string();
            if index.insert(id.clone(), arms.len()).is_some() {
                return Err(MetaError::DuplicateStrategy { strategy_id: id });
            }
            arms.push(Arm {
                strategy,
                stats: ArmStatistics::default(),
            });
        }
        Ok(Self {
            arms,
            index,
            config,
            direction,
            running_best: None,
            last_observed: None,
        })
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.arms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    pub fn strategy_ids(&self) -> Vec<&str> {
        self.arms.iter().map(|a| a.strategy.id()).collect()
    }

    pub fn arm_index(&self, strategy_id: &str) -> Option<usize> {
        self.index.get(strategy_id).copied()
    }

    /// Per-arm statistics in pool order.
    pub fn arm_statistics(&self) -> Vec<(String, ArmStatistics)> {
        self.arms
            .iter()
            .map(|a| (a.strategy.id().to_string(), a.stats.clone()))
            .collect()
    }

    pub fn state(&self) -> MetaState {
        MetaState {
            arms: self.arm_statistics(),
            running_best: self.running_best,
            last_observed: self.last_observed,
        }
    }

    /// Best raw score seen so far.
    pub fn running_best(&self) -> Option<f64> {
        self.running_best.map(|b| self.direction.oriented(b))
    }

    /// Apply the outcome of a terminal trial. Trials must be fed in id order;
    /// ids at or below the last observed one are ignored. Returns the reward
    /// credited to an arm, if any.
    pub fn observe(&mut self, trial: &Trial) -> Option<f64> {
        if !trial.is_terminal() {
            return None;
        }
        if self.last_observed.is_some_and(|last| trial.id <= last) {
            warn!(trial_id = trial.id, "trial observed out of order, ignoring");
            return None;
        }
        self.last_observed = Some(trial.id);

        let arm = self.index.get(&trial.origin).copied();
        let reward = match trial.status {
            TrialStatus::Completed => {
                let score = self.direction.oriented(trial.score?);
                let reward = self.config.reward.reward(score, self.running_best);
                if self.running_best.map_or(true, |best| score > best) {
                    self.running_best = Some(score);
                }
                reward
            }
            _ => match &trial.failure {
                Some(reason) if reason.is_attributable() => self.config.failure_penalty,
                _ => return None,
            },
        };

        let idx = arm?;
        self.arms[idx].stats.record(reward, trial.ended_at);
        debug!(
            trial_id = trial.id,
            strategy = %trial.origin,
            reward,
            pulls = self.arms[idx].stats.pulls,
            "arm updated"
        );
        Some(reward)
    }

    /// Rebuild state from a stored history (ordered by id). Produces exactly
    /// the state a live run observing the same trials would have.
    pub fn replay(&mut self, trials: &[Trial]) -> usize {
        trials.iter().filter_map(|t| self.observe(t)).count()
    }

    /// Selection score per arm, `None` for excluded arms.
    pub fn selection_scores(
        &self,
        excluded: &[usize],
        virtual_pulls: &[u64],
        rng: &mut ChaCha8Rng,
    ) -> Vec<Option<f64>> {
        let pulls = |idx: usize| {
            self.arms[idx].stats.pulls + virtual_pulls.get(idx).copied().unwrap_or(0)
        };
        let total: u64 = (0..self.arms.len())
            .filter(|i| !excluded.contains(i))
            .map(pulls)
            .sum();
        self.arms
            .iter()
            .enumerate()
            .map(|(idx, arm)| {
                if excluded.contains(&idx) {
                    return None;
                }
                let virtual_pulls = virtual_pulls.get(idx).copied().unwrap_or(0);
                let score = self
                    .config
                    .selection
                    .score(&arm.stats, virtual_pulls, total, rng);
                Some(if score.is_nan() { f64::NEG_INFINITY } else { score })
            })
            .collect()
    }

    /// Highest-scoring arm not in `excluded`. Ties go to the arm with fewer
    /// (real plus virtual) pulls, then to pool order.
    pub fn select(
        &self,
        excluded: &[usize],
        virtual_pulls: &[u64],
        rng: &mut ChaCha8Rng,
    ) -> Option<usize> {
        let scores = self.selection_scores(excluded, virtual_pulls, rng);
        let pulls =
            |idx: usize| self.arms[idx].stats.pulls + virtual_pulls.get(idx).copied().unwrap_or(0);

        let mut best: Option<(usize, f64)> = None;
        for (idx, score) in scores.into_iter().enumerate() {
            let Some(score) = score else { continue };
            best = match best {
                None => Some((idx, score)),
                Some((b, bs)) if score > bs || (score == bs && pulls(idx) < pulls(b)) => {
                    Some((idx, score))
                }
                keep => keep,
            };
        }
        best.map(|(idx, _)| idx)
    }

    /// Select an arm and ask it for candidates, retrying with the failing arm
    /// excluded when a proposal fails.
    ///
    /// Every failed attempt and every invalid candidate is handed to
    /// `record_failure`, which must persist it as a failed trial; the penalty
    /// reaches the arm when that trial is observed. After `max_retries`
    /// retries, or once every arm has been excluded, the step ends with an
    /// empty proposal. Only errors from `record_failure` are returned.
    pub fn propose<F>(
        &mut self,
        request: ProposalRequest<'_>,
        mut record_failure: F,
    ) -> TuneResult<Proposal>
    where
        F: FnMut(&str, &SpaceError) -> TuneResult<TrialId>,
    {
        let mut excluded: Vec<usize> = Vec::new();
        let mut failed_arms: Vec<usize> = Vec::new();
        let mut attempt = 0u64;

        loop {
            let mut selection_rng = derive_rng(
                request.seed,
                &[request.next_trial_id, attempt, SELECTION_STREAM],
            );
            let selected = if excluded.len() > request.max_retries {
                None
            } else {
                self.select(&excluded, request.virtual_pulls, &mut selection_rng)
            };
            let Some(idx) = selected else {
                debug!(failures = failed_arms.len(), "every proposal attempt failed");
                return Ok(Proposal {
                    accepted: None,
                    assignments: Vec::new(),
                    failed_arms,
                });
            };

            let arm = &mut self.arms[idx];
            let strategy_id = arm.strategy.id().to_string();
            let k = if arm.strategy.supports_parallel_batch() {
                request.k.max(1)
            } else {
                1
            };
            let mut ctx = ProposalContext {
                space: request.space,
                history: request.history,
                direction: self.direction,
                seed: request.seed,
                rng: derive_rng(request.seed, &[request.next_trial_id, attempt, idx as u64]),
            };
            attempt += 1;

            let outcome = arm.strategy.propose(&mut ctx, k).and_then(|candidates| {
                if candidates.is_empty() {
                    Err(SpaceError::ConstraintUnsatisfiable { attempts: 0 })
                } else {
                    Ok(candidates)
                }
            });

            match outcome {
                Ok(candidates) => {
                    let mut valid = Vec::with_capacity(candidates.len());
                    for candidate in candidates {
                        let candidate = request.space.coerce(candidate);
                        match request.space.validate(&candidate) {
                            Ok(()) => valid.push(candidate),
                            Err(err) => {
                                warn!(strategy = %strategy_id, error = %err, "invalid proposal");
                                record_failure(&strategy_id, &err)?;
                                failed_arms.push(idx);
                            }
                        }
                    }
                    if !valid.is_empty() {
                        return Ok(Proposal {
                            accepted: Some((idx, strategy_id)),
                            assignments: valid,
                            failed_arms,
                        });
                    }
                }
                Err(err) => {
                    warn!(strategy = %strategy_id, kind = err.kind(), error = %err, "proposal failed");
                    record_failure(&strategy_id, &err)?;
                    failed_arms.push(idx);
                }
            }
            excluded.push(idx);
        }
    }
}

impl std::fmt::Debug for MetaOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaOptimizer")
            .field("arms", &self.strategy_ids())
            .field("selection", &self.config.selection.name())
            .field("running_best", &self.running_best)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::SelectionPolicy;
    use crate::search::tests::completed_trial;
    use crate::search::RandomSearch;
    use tw_types::{timestamp_now, FailureReason, NewTrial, ParameterValue};

    /// Always fails to propose.
    struct Broken;

    impl Strategy for Broken {
        fn id(&self) -> &str {
            "broken"
        }

        fn propose(
            &mut self,
            _ctx: &mut ProposalContext<'_>,
            _k: usize,
        ) -> Result<Vec<Assignment>, SpaceError> {
            Err(SpaceError::ConstraintUnsatisfiable { attempts: 1 })
        }
    }

    /// Proposes out-of-domain values.
    struct OutOfDomain;

    impl Strategy for OutOfDomain {
        fn id(&self) -> &str {
            "out_of_domain"
        }

        fn propose(
            &mut self,
            _ctx: &mut ProposalContext<'_>,
            k: usize,
        ) -> Result<Vec<Assignment>, SpaceError> {
            let mut a = Assignment::new();
            a.insert("x".into(), ParameterValue::Int(1_000));
            Ok(vec![a; k])
        }
    }

    struct Named(&'static str);

    impl Strategy for Named {
        fn id(&self) -> &str {
            self.0
        }

        fn propose(
            &mut self,
            ctx: &mut ProposalContext<'_>,
            k: usize,
        ) -> Result<Vec<Assignment>, SpaceError> {
            RandomSearch::new().propose(ctx, k)
        }
    }

    fn space() -> SearchSpace {
        SearchSpace::builder().integer("x", 0, 10).build().unwrap()
    }

    fn failed_trial(id: TrialId, origin: &str, reason: FailureReason) -> Trial {
        let mut trial = Trial::new(id, NewTrial::new(origin, Assignment::new()), timestamp_now());
        trial.mark_failed(reason, timestamp_now()).unwrap();
        trial
    }

    fn point(x: i64) -> Assignment {
        let mut a = Assignment::new();
        a.insert("x".into(), ParameterValue::Int(x));
        a
    }

    fn meta(strategies: Vec<Box<dyn Strategy>>) -> MetaOptimizer {
        MetaOptimizer::new(strategies, MetaConfig::default(), ObjectiveDirection::Maximize).unwrap()
    }

    #[test]
    fn pool_must_be_non_empty_and_unique() {
        let err = MetaOptimizer::new(vec![], MetaConfig::default(), ObjectiveDirection::Minimize)
            .unwrap_err();
        assert_eq!(err, MetaError::EmptyStrategyPool);

        let err = MetaOptimizer::new(
            vec![Box::new(Named("a")), Box::new(Named("a"))],
            MetaConfig::default(),
            ObjectiveDirection::Minimize,
        )
        .unwrap_err();
        assert_eq!(
            err,
            MetaError::DuplicateStrategy {
                strategy_id: "a".into()
            }
        );
    }

    #[test]
    fn unpulled_arms_are_tried_first_in_pool_order() {
        let mut m = meta(vec![Box::new(Named("a")), Box::new(Named("b")), Box::new(Named("c"))]);
        let mut rng = derive_rng(0, &[]);
        assert_eq!(m.select(&[], &[], &mut rng), Some(0));
        assert_eq!(m.select(&[], &[1, 0, 0], &mut rng), Some(1));

        m.observe(&completed_trial(0, "a", point(1), 1.0));
        assert_eq!(m.select(&[], &[], &mut rng), Some(1));
        assert_eq!(m.select(&[1], &[], &mut rng), Some(2));
        assert_eq!(m.select(&[0, 1, 2], &[], &mut rng), None);
    }

    #[test]
    fn rewards_follow_running_best() {
        let mut m = meta(vec![Box::new(Named("a")), Box::new(Named("b"))]);
        assert_eq!(m.observe(&completed_trial(0, "a", point(1), 1.0)), Some(1.0));
        assert_eq!(m.observe(&completed_trial(1, "b", point(2), 0.5)), Some(0.0));
        assert_eq!(m.observe(&completed_trial(2, "b", point(3), 2.0)), Some(1.0));
        assert_eq!(m.running_best(), Some(2.0));

        let stats = m.arm_statistics();
        assert_eq!(stats[0].1.pulls, 1);
        assert_eq!(stats[1].1.pulls, 2);
        assert_eq!(stats[1].1.cumulative_reward, 1.0);
        assert!(stats[1].1.last_update_time.is_some());
    }

    #[test]
    fn seed_trials_update_best_but_no_arm() {
        let mut m = meta(vec![Box::new(Named("a"))]);
        assert_eq!(m.observe(&completed_trial(0, tw_types::SEED_ORIGIN, point(1), 5.0)), None);
        assert_eq!(m.running_best(), Some(5.0));
        assert_eq!(m.observe(&completed_trial(1, "a", point(2), 4.0)), Some(0.0));
    }

    #[test]
    fn failures_are_penalized_unless_cancelled() {
        let mut m = meta(vec![Box::new(Named("a"))]);
        let timeout = failed_trial(0, "a", FailureReason::EvaluationTimeout { timeout_ms: 10 });
        assert_eq!(m.observe(&timeout), Some(-1.0));
        assert_eq!(m.observe(&failed_trial(1, "a", FailureReason::Cancelled)), None);
        assert_eq!(m.observe(&failed_trial(2, "a", FailureReason::Abandoned)), None);
        assert_eq!(m.arm_statistics()[0].1.pulls, 1);
    }

    #[test]
    fn observe_is_idempotent_and_ordered() {
        let mut m = meta(vec![Box::new(Named("a"))]);
        let trial = completed_trial(3, "a", point(1), 1.0);
        assert!(m.observe(&trial).is_some());
        assert!(m.observe(&trial).is_none());
        assert!(m.observe(&completed_trial(2, "a", point(2), 9.0)).is_none());
        assert_eq!(m.arm_statistics()[0].1.pulls, 1);
    }

    #[test]
    fn replay_matches_live_observation() {
        let trials = vec![
            completed_trial(0, "a", point(1), 1.0),
            failed_trial(1, "b", FailureReason::EvaluationCrash { message: "boom".into() }),
            completed_trial(2, "b", point(2), 3.0),
            failed_trial(3, "a", FailureReason::Cancelled),
            completed_trial(4, "a", point(3), 2.0),
        ];
        let mut live = meta(vec![Box::new(Named("a")), Box::new(Named("b"))]);
        for t in &trials {
            live.observe(t);
        }
        let mut replayed = meta(vec![Box::new(Named("a")), Box::new(Named("b"))]);
        assert_eq!(replayed.replay(&trials), 4);
        assert_eq!(live.state(), replayed.state());
    }

    #[test]
    fn failing_strategy_is_excluded_and_recorded() {
        let space = space();
        let mut m = meta(vec![Box::new(Broken), Box::new(Named("a"))]);
        let mut recorded = Vec::new();
        let proposal = m
            .propose(
                ProposalRequest {
                    space: &space,
                    history: &[],
                    k: 2,
                    seed: 42,
                    next_trial_id: 0,
                    virtual_pulls: &[0, 0],
                    max_retries: 3,
                },
                |origin, err| {
                    recorded.push((origin.to_string(), err.kind()));
                    Ok(recorded.len() as TrialId - 1)
                },
            )
            .unwrap();
        assert_eq!(proposal.strategy_id(), Some("a"));
        assert_eq!(proposal.assignments.len(), 2);
        assert_eq!(proposal.failed_arms, vec![0]);
        assert_eq!(
            recorded,
            vec![("broken".to_string(), "ConstraintUnsatisfiable")]
        );
    }

    #[test]
    fn invalid_candidates_are_recorded_as_domain_violations() {
        let space = space();
        let mut m = meta(vec![Box::new(OutOfDomain), Box::new(Named("a"))]);
        let mut kinds = Vec::new();
        let proposal = m
            .propose(
                ProposalRequest {
                    space: &space,
                    history: &[],
                    k: 2,
                    seed: 1,
                    next_trial_id: 0,
                    virtual_pulls: &[0, 0],
                    max_retries: 3,
                },
                |_, err| {
                    kinds.push(err.kind());
                    Ok(0)
                },
            )
            .unwrap();
        assert_eq!(proposal.strategy_id(), Some("a"));
        assert_eq!(kinds, vec!["DomainViolation", "DomainViolation"]);
    }

    #[test]
    fn step_where_every_arm_fails_is_empty_not_an_error() {
        let space = space();
        let mut m = meta(vec![Box::new(Broken), Box::new(OutOfDomain)]);
        let mut recorded = Vec::new();
        let proposal = m
            .propose(
                ProposalRequest {
                    space: &space,
                    history: &[],
                    k: 1,
                    seed: 0,
                    next_trial_id: 0,
                    virtual_pulls: &[0, 0],
                    max_retries: 5,
                },
                |origin, _| {
                    recorded.push(origin.to_string());
                    Ok(recorded.len() as TrialId - 1)
                },
            )
            .unwrap();
        assert_eq!(proposal.accepted, None);
        assert!(proposal.assignments.is_empty());
        assert_eq!(proposal.failed_arms, vec![0, 1]);
        assert_eq!(recorded, vec!["broken".to_string(), "out_of_domain".to_string()]);
    }

    #[test]
    fn retries_are_bounded() {
        let space = space();
        let mut m = meta(vec![Box::new(Broken), Box::new(Named("a"))]);
        let proposal = m
            .propose(
                ProposalRequest {
                    space: &space,
                    history: &[],
                    k: 1,
                    seed: 0,
                    next_trial_id: 0,
                    virtual_pulls: &[0, 0],
                    max_retries: 0,
                },
                |_, _| Ok(0),
            )
            .unwrap();
        assert_eq!(proposal.accepted, None);
        assert_eq!(proposal.failed_arms, vec![0]);
    }

    #[test]
    fn recording_errors_are_propagated() {
        let space = space();
        let mut m = meta(vec![Box::new(Broken)]);
        let err = m
            .propose(
                ProposalRequest {
                    space: &space,
                    history: &[],
                    k: 1,
                    seed: 0,
                    next_trial_id: 0,
                    virtual_pulls: &[0],
                    max_retries: 3,
                },
                |_, _| {
                    Err(tw_types::StoreError::WriteError {
                        message: "disk full".into(),
                    }
                    .into())
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), "StoreWriteError");
    }

    #[test]
    fn proposals_are_deterministic() {
        let space = space();
        let run = || {
            let mut m = MetaOptimizer::new(
                vec![Box::new(Named("a")), Box::new(Named("b"))],
                MetaConfig::default().with_selection(SelectionPolicy::Thompson),
                ObjectiveDirection::Minimize,
            )
            .unwrap();
            m.propose(
                ProposalRequest {
                    space: &space,
                    history: &[],
                    k: 3,
                    seed: 99,
                    next_trial_id: 7,
                    virtual_pulls: &[0, 0],
                    max_retries: 1,
                },
                |_, _| Ok(0),
            )
            .unwrap()
        };
        assert_eq!(run(), run());
    }
}
