//! In-memory trial store (non-persistent, for tests and dry runs).

use tw_types::{
    timestamp_now, EvaluationMetadata, FailureReason, NewTrial, StoreError, Trial, TrialId,
};

use crate::{StoreResult, TrialStore};

#[derive(Debug, Default, Clone)]
pub struct MemoryTrialStore {
    trials: Vec<Trial>,
    next_id: TrialId,
}

impl MemoryTrialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a previously captured trial log, e.g. to
    /// simulate resuming from a partially written run.
    pub fn from_trials(mut trials: Vec<Trial>) -> StoreResult<Self> {
        trials.sort_by_key(|t| t.id);
        if let Some(pair) = trials.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(StoreError::Corruption {
                message: format!("duplicate trial id {}", pair[0].id),
            });
        }
        let next_id = trials.last().map_or(0, |t| t.id + 1);
        Ok(Self { trials, next_id })
    }

    fn trial_mut(&mut self, id: TrialId) -> StoreResult<&mut Trial> {
        // Ids are dense and sorted, but `from_trials` logs may have gaps.
        self.trials
            .binary_search_by_key(&id, |t| t.id)
            .map(|idx| &mut self.trials[idx])
            .map_err(|_| StoreError::NotFound { trial_id: id })
    }
}

impl TrialStore for MemoryTrialStore {
    fn append(&mut self, trial: NewTrial) -> StoreResult<TrialId> {
        let id = self.next_id;
        self.trials.push(Trial::new(id, trial, timestamp_now()));
        self.next_id += 1;
        Ok(id)
    }

    fn mark_running(&mut self, id: TrialId) -> StoreResult<()> {
        self.trial_mut(id)?.mark_running(timestamp_now())
    }

    fn mark_completed(
        &mut self,
        id: TrialId,
        score: f64,
        metadata: EvaluationMetadata,
    ) -> StoreResult<()> {
        self.trial_mut(id)?
            .mark_completed(score, metadata, timestamp_now())
    }

    fn mark_failed(&mut self, id: TrialId, reason: FailureReason) -> StoreResult<()> {
        self.trial_mut(id)?.mark_failed(reason, timestamp_now())
    }

    fn get(&self, id: TrialId) -> StoreResult<Option<Trial>> {
        Ok(self
            .trials
            .binary_search_by_key(&id, |t| t.id)
            .ok()
            .map(|idx| self.trials[idx].clone()))
    }

    fn all_trials(&self) -> StoreResult<Vec<Trial>> {
        Ok(self.trials.clone())
    }

    fn next_trial_id(&self) -> StoreResult<TrialId> {
        Ok(self.next_id)
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn last_trial_id(&self) -> StoreResult<Option<TrialId>> {
        Ok(self.trials.last().map(|t| t.id))
    }
}
