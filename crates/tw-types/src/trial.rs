//! Trial records and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{EvaluationError, SpaceError, StoreError};
use crate::space::Assignment;

/// Monotonic trial identifier, assigned by the trial store.
pub type TrialId = u64;

/// Origin recorded for default and user-seeded trials. Not a bandit arm.
pub const SEED_ORIGIN: &str = "seed";

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    #[default]
    Minimize,
    Maximize,
}

impl ObjectiveDirection {
    /// Score mapped so that higher is always better.
    pub fn oriented(self, score: f64) -> f64 {
        match self {
            Self::Maximize => score,
            Self::Minimize => -score,
        }
    }

    /// Strict improvement of `candidate` over `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        self.oriented(candidate) > self.oriented(incumbent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TrialStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a trial ended in `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    EvaluationTimeout { timeout_ms: u64 },
    EvaluationCrash { message: String },
    /// The originating strategy could not produce a valid candidate.
    ProposalFailed { kind: String, message: String },
    Cancelled,
    /// Found pending or running when a run resumed.
    Abandoned,
}

impl FailureReason {
    pub fn kind(&self) -> &str {
        match self {
            Self::EvaluationTimeout { .. } => "EvaluationTimeout",
            Self::EvaluationCrash { .. } => "EvaluationCrash",
            Self::ProposalFailed { kind, .. } => kind,
            Self::Cancelled => "Cancelled",
            Self::Abandoned => "Abandoned",
        }
    }

    /// Whether the failure is attributed to the originating strategy.
    /// Cancellation and abandonment are not the strategy's fault.
    pub fn is_attributable(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Abandoned)
    }
}

impl From<EvaluationError> for FailureReason {
    fn from(err: EvaluationError) -> Self {
        match err {
            EvaluationError::Timeout { timeout_ms } => Self::EvaluationTimeout { timeout_ms },
            EvaluationError::Crash { message } => Self::EvaluationCrash { message },
        }
    }
}

impl From<&SpaceError> for FailureReason {
    fn from(err: &SpaceError) -> Self {
        Self::ProposalFailed {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Side information returned with a successful evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetadata {
    pub wall_time_ms: u64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

/// A trial not yet in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTrial {
    pub origin: String,
    pub assignment: Assignment,
}

impl NewTrial {
    pub fn new(origin: impl Into<String>, assignment: Assignment) -> Self {
        Self {
            origin: origin.into(),
            assignment,
        }
    }
}

/// A single trial (one assignment evaluated against the objective).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    /// Id of the strategy that proposed the assignment.
    pub origin: String,
    pub assignment: Assignment,
    pub status: TrialStatus,
    /// Present iff `status == Completed`.
    pub score: Option<f64>,
    pub failure: Option<FailureReason>,
    pub metadata: Option<EvaluationMetadata>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(id: TrialId, new: NewTrial, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            origin: new.origin,
            assignment: new.assignment,
            status: TrialStatus::Pending,
            score: None,
            failure: None,
            metadata: None,
            created_at,
            started_at: None,
            ended_at: None,
        }
    }

    fn invalid(&self, to: TrialStatus) -> StoreError {
        StoreError::InvalidTransition {
            trial_id: self.id,
            from: self.status.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    /// `pending -> running`
    pub fn mark_running(&mut self, at: DateTime<Utc>) -> Result<(), StoreError> {
        if self.status != TrialStatus::Pending {
            return Err(self.invalid(TrialStatus::Running));
        }
        self.status = TrialStatus::Running;
        self.started_at = Some(at);
        Ok(())
    }

    /// `running -> completed`
    pub fn mark_completed(
        &mut self,
        score: f64,
        metadata: EvaluationMetadata,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.status != TrialStatus::Running {
            return Err(self.invalid(TrialStatus::Completed));
        }
        self.status = TrialStatus::Completed;
        self.score = Some(score);
        self.metadata = Some(metadata);
        self.ended_at = Some(at);
        Ok(())
    }

    /// `pending | running -> failed`
    pub fn mark_failed(&mut self, reason: FailureReason, at: DateTime<Utc>) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(self.invalid(TrialStatus::Failed));
        }
        self.status = TrialStatus::Failed;
        self.failure = Some(reason);
        self.ended_at = Some(at);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Score of a completed trial.
    pub fn completed_score(&self) -> Option<f64> {
        match self.status {
            TrialStatus::Completed => self.score,
            _ => None,
        }
    }
}

/// Current time truncated to microseconds, the precision every store
/// backend keeps.
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParameterValue;

    fn pending_trial() -> Trial {
        let mut assignment = Assignment::new();
        assignment.insert("depth".into(), ParameterValue::Int(3));
        Trial::new(0, NewTrial::new("random", assignment), timestamp_now())
    }

    #[test]
    fn trial_lifecycle() {
        let mut trial = pending_trial();
        assert_eq!(trial.status, TrialStatus::Pending);

        trial.mark_running(timestamp_now()).unwrap();
        assert_eq!(trial.status, TrialStatus::Running);
        assert!(trial.started_at.is_some());

        let metadata = EvaluationMetadata {
            wall_time_ms: 12,
            metrics: BTreeMap::new(),
        };
        trial.mark_completed(1.8, metadata, timestamp_now()).unwrap();
        assert_eq!(trial.status, TrialStatus::Completed);
        assert_eq!(trial.completed_score(), Some(1.8));
        assert!(trial.ended_at.is_some());
    }

    #[test]
    fn transitions_are_written_once() {
        let mut trial = pending_trial();
        let err = trial
            .mark_completed(1.0, EvaluationMetadata::default(), timestamp_now())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        trial.mark_running(timestamp_now()).unwrap();
        assert!(trial.mark_running(timestamp_now()).is_err());

        trial
            .mark_failed(FailureReason::Cancelled, timestamp_now())
            .unwrap();
        assert!(trial
            .mark_failed(FailureReason::Abandoned, timestamp_now())
            .is_err());
        assert_eq!(trial.failure, Some(FailureReason::Cancelled));
    }

    #[test]
    fn pending_trials_can_fail_directly() {
        let mut trial = pending_trial();
        let reason = FailureReason::from(&SpaceError::ConstraintUnsatisfiable { attempts: 10 });
        trial.mark_failed(reason.clone(), timestamp_now()).unwrap();
        assert_eq!(trial.status, TrialStatus::Failed);
        assert_eq!(reason.kind(), "ConstraintUnsatisfiable");
        assert!(reason.is_attributable());
        assert!(trial.completed_score().is_none());
    }

    #[test]
    fn direction_orients_scores() {
        assert!(ObjectiveDirection::Minimize.is_better(1.0, 2.0));
        assert!(ObjectiveDirection::Maximize.is_better(2.0, 1.0));
        assert!(!ObjectiveDirection::Maximize.is_better(1.0, 1.0));
        assert_eq!(ObjectiveDirection::Minimize.oriented(3.0), -3.0);
    }

    #[test]
    fn evaluation_errors_map_to_failure_reasons() {
        let reason: FailureReason = EvaluationError::Timeout { timeout_ms: 500 }.into();
        assert_eq!(reason.kind(), "EvaluationTimeout");
        assert!(!FailureReason::Cancelled.is_attributable());
        assert!(!FailureReason::Abandoned.is_attributable());
    }

    #[test]
    fn timestamps_are_microsecond_precise() {
        let ts = timestamp_now();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[test]
    fn failure_reason_json_shape() {
        let reason = FailureReason::EvaluationCrash {
            message: "exit status 1".into(),
        };
        let json = serde_json::to_string(&reason).unwrap();
        assert!(json.contains(r#""reason":"evaluation_crash""#));
        let back: FailureReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reason);
    }
}
