//! Run lifecycle states, progress events and the final report.

use serde::{Deserialize, Serialize};
use tw_optimizer::ArmStatistics;
use tw_store::{best_trial, improvement_count, StatusCounts};
use tw_types::{ObjectiveDirection, Trial, TrialId, TrialStatus, TuneError};
use uuid::Uuid;

/// Scheduler state machine:
/// `Initializing -> Running -> Completed | Aborted | Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Running,
    /// Trial or wall-clock budget exhausted.
    Completed,
    /// A fatal error ended the run.
    Aborted,
    /// External cancellation.
    Stopped,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Stopped)
    }
}

/// Progress events for external consumption (progress display, logging).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        session_id: Uuid,
        resumed_trials: usize,
    },
    TrialDispatched {
        trial_id: TrialId,
        strategy: String,
    },
    TrialFinished {
        trial_id: TrialId,
        strategy: String,
        status: TrialStatus,
        score: Option<f64>,
    },
    ProposalFailed {
        trial_id: TrialId,
        strategy: String,
        kind: String,
    },
    RunFinished {
        state: RunState,
        best_score: Option<f64>,
    },
}

/// Summary returned when a run ends, on success or abort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub session_id: Uuid,
    pub state: RunState,
    pub best_trial: Option<Trial>,
    pub trials_total: usize,
    pub trials_completed: usize,
    pub trials_failed: usize,
    /// Times the running best improved.
    pub improvements: usize,
    pub fatal_error_kind: Option<String>,
    pub fatal_error: Option<String>,
    /// Newest trial safely in the store; a resumed run continues after it.
    pub last_durable_trial_id: Option<TrialId>,
    pub elapsed_ms: u64,
    pub arms: Vec<(String, ArmStatistics)>,
}

impl RunReport {
    pub(crate) fn build(
        session_id: Uuid,
        state: RunState,
        trials: &[Trial],
        direction: ObjectiveDirection,
        fatal: Option<&TuneError>,
        elapsed_ms: u64,
        arms: Vec<(String, ArmStatistics)>,
    ) -> Self {
        let counts = StatusCounts::from_trials(trials);
        Self {
            session_id,
            state,
            best_trial: best_trial(trials, direction).cloned(),
            trials_total: counts.total(),
            trials_completed: counts.completed,
            trials_failed: counts.failed,
            improvements: improvement_count(trials, direction),
            fatal_error_kind: fatal.map(|e| e.kind().to_string()),
            fatal_error: fatal.map(|e| e.to_string()),
            last_durable_trial_id: trials.last().map(|t| t.id),
            elapsed_ms,
            arms,
        }
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_trial.as_ref().and_then(|t| t.score)
    }

    /// Process exit code for command-line callers.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Aborted => 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_types::{timestamp_now, Assignment, EvaluationMetadata, NewTrial, StoreError};

    fn completed(id: TrialId, score: f64) -> Trial {
        let mut t = Trial::new(id, NewTrial::new("random", Assignment::new()), timestamp_now());
        t.mark_running(timestamp_now()).unwrap();
        t.mark_completed(score, EvaluationMetadata::default(), timestamp_now())
            .unwrap();
        t
    }

    #[test]
    fn report_summarizes_trials() {
        let trials = vec![completed(0, 2.0), completed(1, 1.0), completed(2, 3.0)];
        let report = RunReport::build(
            Uuid::new_v4(),
            RunState::Completed,
            &trials,
            ObjectiveDirection::Minimize,
            None,
            12,
            Vec::new(),
        );
        assert_eq!(report.best_score(), Some(1.0));
        assert_eq!(report.trials_total, 3);
        assert_eq!(report.improvements, 2);
        assert_eq!(report.last_durable_trial_id, Some(2));
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn aborted_report_carries_fatal_error() {
        let err: TuneError = StoreError::WriteError {
            message: "disk full".into(),
        }
        .into();
        let report = RunReport::build(
            Uuid::new_v4(),
            RunState::Aborted,
            &[],
            ObjectiveDirection::Minimize,
            Some(&err),
            0,
            Vec::new(),
        );
        assert_eq!(report.fatal_error_kind.as_deref(), Some("StoreWriteError"));
        assert!(report.best_trial.is_none());
        assert_eq!(report.exit_code(), 1);
        assert!(RunState::Aborted.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }
}
