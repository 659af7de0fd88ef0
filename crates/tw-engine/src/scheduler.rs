//! Trial scheduler: a single coordinator that owns the store and the
//! meta-optimizer, plus a bounded set of evaluation workers.

use crossbeam_channel::Sender;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tw_optimizer::ProposalRequest;
use tw_types::{
    Assignment, EvaluationError, FailureReason, MetaError, NewTrial, TrialId, TrialStatus,
    TuneResult, SEED_ORIGIN,
};
use uuid::Uuid;

use crate::context::RunContext;
use crate::evaluator::{Evaluation, Evaluator};
use crate::report::{RunEvent, RunReport, RunState};

/// Result sent back by a worker.
#[derive(Debug)]
struct WorkerReport {
    trial_id: TrialId,
    outcome: Result<Evaluation, EvaluationError>,
}

/// Trials dispatched in the current batch.
struct Batch {
    first_id: TrialId,
    in_flight: HashMap<TrialId, JoinHandle<()>>,
    origins: HashMap<TrialId, String>,
    tx: mpsc::UnboundedSender<WorkerReport>,
    rx: mpsc::UnboundedReceiver<WorkerReport>,
}

impl Batch {
    fn new(first_id: TrialId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            first_id,
            in_flight: HashMap::new(),
            origins: HashMap::new(),
            tx,
            rx,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "evaluator panicked".to_string()
    }
}

/// Drives one run to a terminal [`RunState`].
pub struct Scheduler {
    ctx: RunContext,
    state: RunState,
    session_id: Uuid,
    events: Option<Sender<RunEvent>>,
    /// Consecutive proposal steps that produced no candidate.
    failed_steps: usize,
}

impl Scheduler {
    pub fn new(ctx: RunContext) -> Self {
        Self {
            ctx,
            state: RunState::Initializing,
            session_id: Uuid::new_v4(),
            events: None,
            failed_steps: 0,
        }
    }

    /// Send progress events to `tx`. Events are dropped when the receiver
    /// lags or is gone.
    pub fn with_events(mut self, tx: Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn into_context(self) -> RunContext {
        self.ctx
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }

    /// Run until the budget is spent, a fatal error occurs or `cancel` fires.
    /// Never returns an error: fatal errors end the run as `Aborted` and are
    /// described in the report.
    pub async fn run(&mut self, cancel: CancellationToken) -> RunReport {
        let started = Instant::now();
        let resumed = self.ctx.store.count_by_status().map(|c| c.total()).unwrap_or(0);
        self.emit(RunEvent::RunStarted {
            session_id: self.session_id,
            resumed_trials: resumed,
        });
        info!(
            session = %self.session_id,
            max_trials = self.ctx.config.max_trials,
            parallelism = self.ctx.config.parallelism,
            strategies = ?self.ctx.meta.strategy_ids(),
            resumed_trials = resumed,
            "run started"
        );

        let outcome = self.drive(&cancel, started).await;
        let (state, fatal) = match outcome {
            Ok(state) => (state, None),
            Err(err) => {
                error!(kind = err.kind(), error = %err, "run aborted");
                (RunState::Aborted, Some(err))
            }
        };
        self.state = state;

        if let Err(e) = self.ctx.store.flush() {
            warn!(error = %e, "failed to flush trial store");
        }

        let trials = self.ctx.store.all_trials().unwrap_or_else(|e| {
            warn!(error = %e, "cannot read trial store for the run report");
            Vec::new()
        });
        let report = RunReport::build(
            self.session_id,
            state,
            &trials,
            self.ctx.config.direction,
            fatal.as_ref(),
            started.elapsed().as_millis() as u64,
            self.ctx.meta.arm_statistics(),
        );
        self.emit(RunEvent::RunFinished {
            state,
            best_score: report.best_score(),
        });
        info!(
            session = %self.session_id,
            state = ?state,
            trials = report.trials_total,
            completed = report.trials_completed,
            failed = report.trials_failed,
            best = ?report.best_score(),
            "run finished"
        );
        report
    }

    async fn drive(&mut self, cancel: &CancellationToken, started: Instant) -> TuneResult<RunState> {
        let mut seeds: VecDeque<Assignment> = self.ctx.pending_seeds()?.into();
        self.state = RunState::Running;
        self.failed_steps = 0;

        loop {
            if cancel.is_cancelled() {
                info!("cancellation requested, stopping");
                return Ok(RunState::Stopped);
            }
            let total = self.ctx.store.count_by_status()?.total();
            if total >= self.ctx.config.max_trials {
                info!(trials = total, "trial budget exhausted");
                return Ok(RunState::Completed);
            }
            if let Some(budget) = self.ctx.config.wall_clock_budget() {
                if started.elapsed() >= budget {
                    info!(elapsed_ms = started.elapsed().as_millis() as u64, "wall-clock budget exhausted");
                    return Ok(RunState::Completed);
                }
            }

            let mut batch = Batch::new(self.ctx.store.next_trial_id()?);
            let outcome = match self.fill_batch(&mut batch, &mut seeds, cancel) {
                Ok(()) => self.collect_batch(&mut batch, cancel).await,
                Err(e) => Err(e),
            };
            if let Err(err) = outcome {
                self.abandon_batch(&mut batch);
                return Err(err);
            }
            self.observe_batch(&batch)?;
        }
    }

    /// Remaining trial budget.
    fn remaining(&self) -> TuneResult<usize> {
        let total = self.ctx.store.count_by_status()?.total();
        Ok(self.ctx.config.max_trials.saturating_sub(total))
    }

    /// Select, propose, validate, append and dispatch until the batch is
    /// full, the budget is spent or cancellation is requested.
    fn fill_batch(
        &mut self,
        batch: &mut Batch,
        seeds: &mut VecDeque<Assignment>,
        cancel: &CancellationToken,
    ) -> TuneResult<()> {
        let slots = self.ctx.config.parallelism;
        let mut virtual_pulls = vec![0u64; self.ctx.meta.len()];

        while batch.in_flight.len() < slots {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let remaining = self.remaining()?;
            if remaining == 0 {
                return Ok(());
            }

            if let Some(seed) = seeds.pop_front() {
                self.dispatch(batch, SEED_ORIGIN, seed)?;
                continue;
            }

            let want = (slots - batch.in_flight.len()).min(remaining);
            let history = self.ctx.store.all_trials()?;
            let next_trial_id = self.ctx.store.next_trial_id()?;

            let RunContext {
                config,
                space,
                meta,
                store,
                ..
            } = &mut self.ctx;
            let events = &self.events;
            let proposal = meta.propose(
                ProposalRequest {
                    space,
                    history: &history,
                    k: want,
                    seed: config.seed,
                    next_trial_id,
                    virtual_pulls: &virtual_pulls,
                    max_retries: config.max_proposal_retries,
                },
                |origin, err| {
                    let id = store.append(NewTrial::new(origin, Assignment::new()))?;
                    store.mark_failed(id, FailureReason::from(err))?;
                    if let Some(tx) = events {
                        let _ = tx.try_send(RunEvent::ProposalFailed {
                            trial_id: id,
                            strategy: origin.to_string(),
                            kind: err.kind().to_string(),
                        });
                    }
                    Ok(id)
                },
            )?;

            for &arm in &proposal.failed_arms {
                virtual_pulls[arm] += 1;
            }
            let Some((arm, strategy_id)) = proposal.accepted else {
                // The failed attempts are recorded trials, so the budget still shrinks.
                self.failed_steps += 1;
                if self.failed_steps >= self.ctx.config.max_failed_steps {
                    return Err(MetaError::NoViableStrategy {
                        steps: self.failed_steps,
                    }
                    .into());
                }
                warn!(
                    steps = self.failed_steps,
                    failures = proposal.failed_arms.len(),
                    "no strategy produced a valid candidate"
                );
                continue;
            };
            self.failed_steps = 0;
            // Recorded proposal failures consume budget too.
            let room = self
                .remaining()?
                .min(slots.saturating_sub(batch.in_flight.len()));
            for assignment in proposal.assignments.into_iter().take(room) {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                self.dispatch(batch, &strategy_id, assignment)?;
                virtual_pulls[arm] += 1;
            }
        }
        Ok(())
    }

    /// Persist a trial as running and hand it to a worker.
    fn dispatch(&mut self, batch: &mut Batch, origin: &str, assignment: Assignment) -> TuneResult<()> {
        let store = &mut self.ctx.store;
        let trial_id = store.append(NewTrial::new(origin, assignment.clone()))?;
        store.mark_running(trial_id)?;

        info!(trial = trial_id, strategy = %origin, "trial dispatched");
        debug!(trial = trial_id, assignment = ?assignment, "trial assignment");
        self.emit(RunEvent::TrialDispatched {
            trial_id,
            strategy: origin.to_string(),
        });

        let evaluator: Arc<dyn Evaluator> = Arc::clone(&self.ctx.evaluator);
        let timeout = self.ctx.config.evaluation_timeout();
        let tx = batch.tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(evaluator.evaluate(trial_id, &assignment, timeout))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(EvaluationError::Crash {
                        message: panic_message(&*panic),
                    })
                });
            let _ = tx.send(WorkerReport { trial_id, outcome });
        });
        batch.in_flight.insert(trial_id, handle);
        batch.origins.insert(trial_id, origin.to_string());
        Ok(())
    }

    /// Wait for every in-flight trial. After cancellation, waits at most the
    /// grace period and marks the rest `Cancelled`.
    async fn collect_batch(&mut self, batch: &mut Batch, cancel: &CancellationToken) -> TuneResult<()> {
        let mut grace_deadline: Option<tokio::time::Instant> = None;

        while !batch.in_flight.is_empty() {
            let report = if cancel.is_cancelled() {
                let deadline = *grace_deadline.get_or_insert_with(|| {
                    tokio::time::Instant::now() + self.ctx.config.cancel_grace()
                });
                match tokio::time::timeout_at(deadline, batch.rx.recv()).await {
                    Ok(Some(report)) => report,
                    Ok(None) | Err(_) => break,
                }
            } else {
                tokio::select! {
                    received = batch.rx.recv() => match received {
                        Some(report) => report,
                        None => break,
                    },
                    _ = cancel.cancelled() => continue,
                }
            };
            self.finish_trial(batch, report)?;
        }

        let mut outstanding: Vec<TrialId> = batch.in_flight.keys().copied().collect();
        outstanding.sort_unstable();
        for trial_id in outstanding {
            if let Some(handle) = batch.in_flight.remove(&trial_id) {
                handle.abort();
            }
            self.ctx.store.mark_failed(trial_id, FailureReason::Cancelled)?;
            warn!(trial = trial_id, "trial cancelled after grace period");
            self.emit(RunEvent::TrialFinished {
                trial_id,
                strategy: batch.origins.get(&trial_id).cloned().unwrap_or_default(),
                status: TrialStatus::Failed,
                score: None,
            });
        }
        Ok(())
    }

    fn finish_trial(&mut self, batch: &mut Batch, report: WorkerReport) -> TuneResult<()> {
        let WorkerReport { trial_id, outcome } = report;
        if batch.in_flight.remove(&trial_id).is_none() {
            return Ok(());
        }
        let strategy = batch.origins.get(&trial_id).cloned().unwrap_or_default();

        let (status, score) = match outcome {
            Ok(evaluation) if evaluation.score.is_finite() => {
                self.ctx
                    .store
                    .mark_completed(trial_id, evaluation.score, evaluation.metadata)?;
                info!(trial = trial_id, strategy = %strategy, score = evaluation.score, "trial completed");
                (TrialStatus::Completed, Some(evaluation.score))
            }
            Ok(evaluation) => {
                let reason = FailureReason::EvaluationCrash {
                    message: format!("non-finite score {}", evaluation.score),
                };
                self.ctx.store.mark_failed(trial_id, reason)?;
                warn!(trial = trial_id, strategy = %strategy, "trial returned a non-finite score");
                (TrialStatus::Failed, None)
            }
            Err(err) => {
                warn!(trial = trial_id, strategy = %strategy, kind = err.kind(), error = %err, "trial failed");
                self.ctx.store.mark_failed(trial_id, err.into())?;
                (TrialStatus::Failed, None)
            }
        };
        self.emit(RunEvent::TrialFinished {
            trial_id,
            strategy,
            status,
            score,
        });
        Ok(())
    }

    /// Feed every trial of the batch to the meta-optimizer in id order,
    /// including proposal failures recorded while filling it.
    fn observe_batch(&mut self, batch: &Batch) -> TuneResult<()> {
        let trials = self.ctx.store.all_trials()?;
        for trial in trials.iter().filter(|t| t.id >= batch.first_id) {
            self.ctx.meta.observe(trial);
        }
        debug!(
            first = batch.first_id,
            best = ?self.ctx.meta.running_best(),
            "batch observed"
        );
        Ok(())
    }

    /// Best-effort cleanup after a fatal error: stop workers and mark their
    /// trials cancelled where the store still accepts writes.
    fn abandon_batch(&mut self, batch: &mut Batch) {
        for (trial_id, handle) in batch.in_flight.drain() {
            handle.abort();
            if let Err(e) = self.ctx.store.mark_failed(trial_id, FailureReason::Cancelled) {
                debug!(trial = trial_id, error = %e, "could not mark trial cancelled");
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// Run a prepared context to a terminal state and hand the context back.
pub async fn run_to_completion(ctx: RunContext, cancel: CancellationToken) -> (RunReport, RunContext) {
    let mut scheduler = Scheduler::new(ctx);
    let report = scheduler.run(cancel).await;
    (report, scheduler.into_context())
}
