//! Proposal strategies: random, grid and local (perturbation) search.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tw_types::{Assignment, FailureReason, ObjectiveDirection, SearchSpace, SpaceError, Trial};

/// Everything a strategy may look at when proposing.
pub struct ProposalContext<'a> {
    pub space: &'a SearchSpace,
    /// Every trial so far, ordered by id (any status).
    pub history: &'a [Trial],
    pub direction: ObjectiveDirection,
    /// Run seed, for designs that must stay fixed across proposal steps.
    pub seed: u64,
    /// Seeded per proposal step, so proposals are a pure function of the run
    /// seed and the history.
    pub rng: ChaCha8Rng,
}

impl ProposalContext<'_> {
    /// Best completed trial; the earliest id wins ties.
    pub fn best_trial(&self) -> Option<&Trial> {
        let mut best: Option<(&Trial, f64)> = None;
        for trial in self.history {
            if let Some(score) = trial.completed_score() {
                match best {
                    Some((_, incumbent)) if !self.direction.is_better(score, incumbent) => {}
                    _ => best = Some((trial, score)),
                }
            }
        }
        best.map(|(trial, _)| trial)
    }

    /// Number of history trials a strategy originated.
    pub fn originated_by(&self, strategy_id: &str) -> usize {
        self.history.iter().filter(|t| t.origin == strategy_id).count()
    }
}

/// Common trait for all proposal strategies.
pub trait Strategy: Send + Sync {
    /// Stable identifier, recorded as the origin of every trial proposed.
    fn id(&self) -> &str;

    /// Propose up to `k` (k >= 1) candidate assignments. Must work with an
    /// empty history.
    fn propose(
        &mut self,
        ctx: &mut ProposalContext<'_>,
        k: usize,
    ) -> Result<Vec<Assignment>, SpaceError>;

    /// Whether `propose` can return more than one useful candidate per call.
    fn supports_parallel_batch(&self) -> bool {
        true
    }
}

/// Draw a uniform point in the encoded space (log-uniform for log-scale
/// parameters) without checking constraints.
pub fn sample_uniform<R: Rng + ?Sized>(space: &SearchSpace, rng: &mut R) -> Assignment {
    let point: Vec<f64> = (0..space.len()).map(|_| rng.gen::<f64>()).collect();
    space.decode(&point)
}

/// Rejection-sample an assignment satisfying every constraint.
pub fn sample_feasible<R: Rng + ?Sized>(
    space: &SearchSpace,
    rng: &mut R,
    max_attempts: usize,
) -> Result<Assignment, SpaceError> {
    for _ in 0..max_attempts.max(1) {
        let candidate = sample_uniform(space, rng);
        if space.check_constraints(&candidate).is_ok() {
            return Ok(candidate);
        }
    }
    Err(SpaceError::ConstraintUnsatisfiable {
        attempts: max_attempts.max(1),
    })
}

/// Up to `k` feasible samples. Draws that exhaust `max_attempts` are dropped;
/// fails only when no draw succeeds.
pub fn sample_feasible_batch<R: Rng + ?Sized>(
    space: &SearchSpace,
    rng: &mut R,
    k: usize,
    max_attempts: usize,
) -> Result<Vec<Assignment>, SpaceError> {
    let mut batch = Vec::with_capacity(k.max(1));
    let mut last_err = None;
    for _ in 0..k.max(1) {
        match sample_feasible(space, rng, max_attempts) {
            Ok(candidate) => batch.push(candidate),
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) if batch.is_empty() => Err(err),
        _ => Ok(batch),
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    max_attempts: usize,
}

impl RandomSearch {
    pub const ID: &'static str = "random";

    pub fn new() -> Self {
        Self { max_attempts: 100 }
    }

    pub fn with_max_attempts(mut self, n: usize) -> Self {
        self.max_attempts = n.max(1);
        self
    }
}

impl Default for RandomSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for RandomSearch {
    fn id(&self) -> &str {
        Self::ID
    }

    fn propose(
        &mut self,
        ctx: &mut ProposalContext<'_>,
        k: usize,
    ) -> Result<Vec<Assignment>, SpaceError> {
        sample_feasible_batch(ctx.space, &mut ctx.rng, k, self.max_attempts)
    }
}

// ---- Grid search ----

/// Exhaustive grid search. Points the grid already originated are skipped, so
/// a resumed run picks up where it left off. Points whose trial was cancelled
/// or abandoned are proposed again.
#[derive(Debug, Clone)]
pub struct GridSearch {
    /// Number of steps for continuous dimensions.
    float_steps: usize,
}

impl GridSearch {
    pub const ID: &'static str = "grid";

    pub fn new(float_steps: usize) -> Self {
        Self {
            float_steps: float_steps.max(2),
        }
    }
}

impl Strategy for GridSearch {
    fn id(&self) -> &str {
        Self::ID
    }

    fn propose(
        &mut self,
        ctx: &mut ProposalContext<'_>,
        k: usize,
    ) -> Result<Vec<Assignment>, SpaceError> {
        let total = ctx.space.grid_size(self.float_steps).unwrap_or(usize::MAX);
        let consumed: Vec<&Assignment> = ctx
            .history
            .iter()
            .filter(|t| t.origin == Self::ID && consumes_grid_point(t))
            .map(|t| &t.assignment)
            .collect();

        let batch: Vec<Assignment> = (0..total)
            .map_while(|idx| ctx.space.grid_point(idx, self.float_steps))
            .filter(|point| ctx.space.check_constraints(point).is_ok())
            .filter(|point| !consumed.contains(&point))
            .take(k.max(1))
            .collect();

        if batch.is_empty() {
            return Err(SpaceError::GridExhausted {
                points: consumed.len(),
            });
        }
        Ok(batch)
    }
}

/// Pending, running, completed and evaluation-failed trials occupy their grid
/// point; cancelled, abandoned and proposal-failure trials do not.
fn consumes_grid_point(trial: &Trial) -> bool {
    match &trial.failure {
        None => true,
        Some(FailureReason::EvaluationTimeout { .. } | FailureReason::EvaluationCrash { .. }) => {
            true
        }
        Some(_) => false,
    }
}

// ---- Local search ----

/// Bounded perturbation of the best-known assignment.
///
/// The step radius is measured in encoded (unit) coordinates. It halves for
/// every `patience` trials this strategy originated since the running best
/// last improved, down to `min_step`.
#[derive(Debug, Clone)]
pub struct LocalSearch {
    initial_step: f64,
    min_step: f64,
    patience: usize,
    categorical_flip: f64,
    max_attempts: usize,
}

impl LocalSearch {
    pub const ID: &'static str = "local";

    pub fn new() -> Self {
        Self {
            initial_step: 0.2,
            min_step: 0.01,
            patience: 4,
            categorical_flip: 0.2,
            max_attempts: 100,
        }
    }

    pub fn with_step(mut self, initial: f64, min: f64) -> Self {
        self.initial_step = initial.clamp(1e-6, 1.0);
        self.min_step = min.clamp(1e-9, self.initial_step);
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience.max(1);
        self
    }

    pub fn with_categorical_flip(mut self, p: f64) -> Self {
        self.categorical_flip = p.clamp(0.0, 1.0);
        self
    }

    /// Current step radius derived from the history.
    pub fn step_size(&self, ctx: &ProposalContext<'_>) -> f64 {
        let mut best: Option<f64> = None;
        let mut stale = 0usize;
        for trial in ctx.history {
            if let Some(score) = trial.completed_score() {
                if best.map_or(true, |b| ctx.direction.is_better(score, b)) {
                    best = Some(score);
                    stale = 0;
                    continue;
                }
            }
            if trial.origin == Self::ID && trial.is_terminal() {
                stale += 1;
            }
        }
        let halvings = (stale / self.patience).min(64) as i32;
        (self.initial_step * 0.5f64.powi(halvings)).max(self.min_step)
    }

    fn perturb(
        &self,
        space: &SearchSpace,
        center: &[f64],
        step: f64,
        rng: &mut ChaCha8Rng,
    ) -> Assignment {
        let point: Vec<f64> = space
            .parameters()
            .iter()
            .zip(center)
            .map(|(param, &u)| {
                if param.is_categorical() {
                    if rng.gen_bool(self.categorical_flip) {
                        rng.gen::<f64>()
                    } else {
                        u
                    }
                } else {
                    (u + rng.gen_range(-step..=step)).clamp(0.0, 1.0)
                }
            })
            .collect();
        space.decode(&point)
    }
}

impl Default for LocalSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for LocalSearch {
    fn id(&self) -> &str {
        Self::ID
    }

    fn propose(
        &mut self,
        ctx: &mut ProposalContext<'_>,
        k: usize,
    ) -> Result<Vec<Assignment>, SpaceError> {
        let center = match ctx.best_trial() {
            Some(best) => ctx.space.encode(&best.assignment).ok(),
            None => None,
        };
        let Some(center) = center else {
            // Cold start: nothing to perturb yet.
            return sample_feasible_batch(ctx.space, &mut ctx.rng, k, self.max_attempts);
        };

        let step = self.step_size(ctx);
        tracing::debug!(step, "local search perturbing best assignment");

        let mut proposals = Vec::with_capacity(k.max(1));
        for _ in 0..k.max(1) {
            let found = (0..self.max_attempts)
                .map(|_| self.perturb(ctx.space, &center, step, &mut ctx.rng))
                .find(|candidate| ctx.space.check_constraints(candidate).is_ok());
            proposals.extend(found);
        }
        if proposals.is_empty() {
            return Err(SpaceError::ConstraintUnsatisfiable {
                attempts: self.max_attempts,
            });
        }
        Ok(proposals)
    }
}
