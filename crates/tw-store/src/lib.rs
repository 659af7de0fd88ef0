//! # tw-store
//!
//! Append-only, resumable trial log for Tunewell.
//!
//! The store is the single source of truth for a run: trial ids come from a
//! persisted high-water mark, status transitions are written exactly once,
//! and `all_trials` returns the id-ordered history the meta-optimizer
//! replays on resume.

mod memory;
mod sqlite;

pub use memory::MemoryTrialStore;
pub use sqlite::SqliteTrialStore;

use serde::{Deserialize, Serialize};
use tw_types::{
    EvaluationMetadata, FailureReason, NewTrial, ObjectiveDirection, StoreError, Trial, TrialId,
    TrialStatus,
};

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Core trial log interface.
///
/// Only the run coordinator mutates a store; implementations need not be
/// safe for concurrent mutation.
pub trait TrialStore: Send {
    /// Append a `pending` trial and return its id. Ids are strictly
    /// increasing and never reused, including across reopen.
    fn append(&mut self, trial: NewTrial) -> StoreResult<TrialId>;

    /// `pending -> running`
    fn mark_running(&mut self, id: TrialId) -> StoreResult<()>;

    /// `running -> completed`
    fn mark_completed(
        &mut self,
        id: TrialId,
        score: f64,
        metadata: EvaluationMetadata,
    ) -> StoreResult<()>;

    /// `pending | running -> failed`
    fn mark_failed(&mut self, id: TrialId, reason: FailureReason) -> StoreResult<()>;

    fn get(&self, id: TrialId) -> StoreResult<Option<Trial>>;

    /// Every trial ordered by id.
    fn all_trials(&self) -> StoreResult<Vec<Trial>>;

    /// The id the next `append` will assign.
    fn next_trial_id(&self) -> StoreResult<TrialId>;

    /// Whether data survives process restarts.
    fn is_persistent(&self) -> bool;

    fn count_by_status(&self) -> StoreResult<StatusCounts> {
        Ok(StatusCounts::from_trials(&self.all_trials()?))
    }

    /// Id of the newest durable trial, if any.
    fn last_trial_id(&self) -> StoreResult<Option<TrialId>> {
        Ok(self.all_trials()?.last().map(|t| t.id))
    }

    fn flush(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

impl<S: TrialStore + ?Sized> TrialStore for Box<S> {
    fn append(&mut self, trial: NewTrial) -> StoreResult<TrialId> {
        (**self).append(trial)
    }

    fn mark_running(&mut self, id: TrialId) -> StoreResult<()> {
        (**self).mark_running(id)
    }

    fn mark_completed(
        &mut self,
        id: TrialId,
        score: f64,
        metadata: EvaluationMetadata,
    ) -> StoreResult<()> {
        (**self).mark_completed(id, score, metadata)
    }

    fn mark_failed(&mut self, id: TrialId, reason: FailureReason) -> StoreResult<()> {
        (**self).mark_failed(id, reason)
    }

    fn get(&self, id: TrialId) -> StoreResult<Option<Trial>> {
        (**self).get(id)
    }

    fn all_trials(&self) -> StoreResult<Vec<Trial>> {
        (**self).all_trials()
    }

    fn next_trial_id(&self) -> StoreResult<TrialId> {
        (**self).next_trial_id()
    }

    fn is_persistent(&self) -> bool {
        (**self).is_persistent()
    }

    fn count_by_status(&self) -> StoreResult<StatusCounts> {
        (**self).count_by_status()
    }

    fn last_trial_id(&self) -> StoreResult<Option<TrialId>> {
        (**self).last_trial_id()
    }

    fn flush(&mut self) -> StoreResult<()> {
        (**self).flush()
    }
}

/// Trial counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn from_trials(trials: &[Trial]) -> Self {
        let mut counts = Self::default();
        for trial in trials {
            match trial.status {
                TrialStatus::Pending => counts.pending += 1,
                TrialStatus::Running => counts.running += 1,
                TrialStatus::Completed => counts.completed += 1,
                TrialStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed
    }

    pub fn in_flight(&self) -> usize {
        self.pending + self.running
    }
}

/// Best completed trial; the earliest id wins ties.
pub fn best_trial(trials: &[Trial], direction: ObjectiveDirection) -> Option<&Trial> {
    let mut best: Option<(&Trial, f64)> = None;
    for trial in trials {
        if let Some(score) = trial.completed_score() {
            match best {
                Some((_, incumbent)) if !direction.is_better(score, incumbent) => {}
                _ => best = Some((trial, score)),
            }
        }
    }
    best.map(|(trial, _)| trial)
}

/// Up to `n` completed trials, best first (stable on ties).
pub fn top_trials(trials: &[Trial], n: usize, direction: ObjectiveDirection) -> Vec<&Trial> {
    let mut completed: Vec<(&Trial, f64)> = trials
        .iter()
        .filter_map(|t| t.completed_score().map(|s| (t, direction.oriented(s))))
        .collect();
    completed.sort_by(|a, b| b.1.total_cmp(&a.1));
    completed.into_iter().take(n).map(|(t, _)| t).collect()
}

/// Number of times the running best improved, in id order.
pub fn improvement_count(trials: &[Trial], direction: ObjectiveDirection) -> usize {
    let mut best: Option<f64> = None;
    let mut improvements = 0;
    for score in trials.iter().filter_map(Trial::completed_score) {
        if best.map_or(true, |b| direction.is_better(score, b)) {
            best = Some(score);
            improvements += 1;
        }
    }
    improvements
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every backend must share.

    use super::*;
    use tw_types::{Assignment, ParameterValue};

    pub fn assignment(depth: i64) -> Assignment {
        let mut a = Assignment::new();
        a.insert("depth".into(), ParameterValue::Int(depth));
        a.insert("lr".into(), ParameterValue::Float(0.001 * depth as f64));
        a
    }

    pub fn ids_are_monotonic(store: &mut dyn TrialStore) {
        let start = store.next_trial_id().unwrap();
        let a = store.append(NewTrial::new("random", assignment(1))).unwrap();
        let b = store.append(NewTrial::new("local", assignment(2))).unwrap();
        assert_eq!(a, start);
        assert_eq!(b, start + 1);
        assert_eq!(store.next_trial_id().unwrap(), start + 2);
        assert_eq!(store.last_trial_id().unwrap(), Some(b));
    }

    pub fn transitions_follow_lifecycle(store: &mut dyn TrialStore) {
        let id = store.append(NewTrial::new("random", assignment(3))).unwrap();
        let trial = store.get(id).unwrap().unwrap();
        assert_eq!(trial.status, TrialStatus::Pending);
        assert_eq!(trial.assignment, assignment(3));

        let err = store
            .mark_completed(id, 1.0, EvaluationMetadata::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store.mark_running(id).unwrap();
        assert!(store.mark_running(id).is_err());

        let mut metadata = EvaluationMetadata {
            wall_time_ms: 42,
            ..Default::default()
        };
        metadata.metrics.insert("binary_size".into(), 1024.0);
        store.mark_completed(id, -0.25, metadata.clone()).unwrap();

        let trial = store.get(id).unwrap().unwrap();
        assert_eq!(trial.status, TrialStatus::Completed);
        assert_eq!(trial.score, Some(-0.25));
        assert_eq!(trial.metadata, Some(metadata));
        assert!(trial.started_at.is_some() && trial.ended_at.is_some());

        assert!(store.mark_failed(id, FailureReason::Cancelled).is_err());
        assert!(matches!(
            store.mark_running(999_999),
            Err(StoreError::NotFound { trial_id: 999_999 })
        ));
    }

    pub fn failures_are_recorded(store: &mut dyn TrialStore) {
        let pending = store.append(NewTrial::new("surrogate", Assignment::new())).unwrap();
        let reason = FailureReason::ProposalFailed {
            kind: "ConstraintUnsatisfiable".into(),
            message: "no feasible point".into(),
        };
        store.mark_failed(pending, reason.clone()).unwrap();

        let running = store.append(NewTrial::new("random", assignment(4))).unwrap();
        store.mark_running(running).unwrap();
        store
            .mark_failed(running, FailureReason::EvaluationTimeout { timeout_ms: 100 })
            .unwrap();

        let trials = store.all_trials().unwrap();
        let ids: Vec<TrialId> = trials.iter().map(|t| t.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);

        let failed = store.get(pending).unwrap().unwrap();
        assert_eq!(failed.failure, Some(reason));
        assert!(failed.score.is_none());

        let counts = store.count_by_status().unwrap();
        assert!(counts.failed >= 2);
        assert_eq!(counts.total(), trials.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::{timestamp_now, Assignment};

    fn completed(id: TrialId, score: f64) -> Trial {
        let mut trial = Trial::new(id, NewTrial::new("random", Assignment::new()), timestamp_now());
        trial.mark_running(timestamp_now()).unwrap();
        trial
            .mark_completed(score, EvaluationMetadata::default(), timestamp_now())
            .unwrap();
        trial
    }

    fn failed(id: TrialId) -> Trial {
        let mut trial = Trial::new(id, NewTrial::new("random", Assignment::new()), timestamp_now());
        trial
            .mark_failed(FailureReason::Cancelled, timestamp_now())
            .unwrap();
        trial
    }

    #[test]
    fn best_trial_respects_direction() {
        let trials = vec![completed(0, 3.0), failed(1), completed(2, 1.0), completed(3, 5.0)];
        assert_eq!(best_trial(&trials, ObjectiveDirection::Minimize).unwrap().id, 2);
        assert_eq!(best_trial(&trials, ObjectiveDirection::Maximize).unwrap().id, 3);
        assert!(best_trial(&[failed(0)], ObjectiveDirection::Minimize).is_none());
    }

    #[test]
    fn best_trial_prefers_earliest_on_ties() {
        let trials = vec![completed(0, 2.0), completed(1, 2.0)];
        assert_eq!(best_trial(&trials, ObjectiveDirection::Maximize).unwrap().id, 0);
    }

    #[test]
    fn top_trials_orders_best_first() {
        let trials = vec![completed(0, 3.0), completed(1, 1.0), completed(2, 2.0), failed(3)];
        let top: Vec<TrialId> = top_trials(&trials, 2, ObjectiveDirection::Minimize)
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(top, vec![1, 2]);
    }

    #[test]
    fn improvement_count_tracks_running_best() {
        let trials = vec![
            completed(0, 5.0),
            completed(1, 6.0),
            completed(2, 4.0),
            failed(3),
            completed(4, 4.0),
            completed(5, 1.0),
        ];
        assert_eq!(improvement_count(&trials, ObjectiveDirection::Minimize), 3);
        assert_eq!(improvement_count(&trials, ObjectiveDirection::Maximize), 2);
    }

    #[test]
    fn status_counts() {
        let trials = vec![completed(0, 1.0), failed(1), failed(2)];
        let counts = StatusCounts::from_trials(&trials);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.in_flight(), 0);
    }
}
