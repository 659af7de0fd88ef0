//! Model-guided search: fit a surrogate on completed trials and pick the
//! candidates with the highest expected improvement.

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tw_types::{Assignment, SpaceError};

use crate::meta::derive_rng;
use crate::search::{sample_feasible, sample_feasible_batch, ProposalContext, Strategy};

/// Predictive distribution at one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub mean: f64,
    pub std: f64,
}

/// Regression model over the encoded unit cube. Targets are oriented so that
/// higher is better.
pub trait SurrogateModel: Send + Sync {
    fn name(&self) -> &str;

    fn fit(&mut self, points: &[Vec<f64>], targets: &[f64]);

    fn predict(&self, point: &[f64]) -> Prediction;
}

/// Inverse-distance weighted k-nearest-neighbour regression.
///
/// Uncertainty grows with the distance to the closest observation, so
/// unexplored regions keep a non-zero expected improvement.
#[derive(Debug, Clone)]
pub struct KnnSurrogate {
    k: usize,
    points: Vec<Vec<f64>>,
    targets: Vec<f64>,
    target_spread: f64,
}

impl KnnSurrogate {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(1),
            points: Vec::new(),
            targets: Vec::new(),
            target_spread: 0.0,
        }
    }
}

impl Default for KnnSurrogate {
    fn default() -> Self {
        Self::new(5)
    }
}

fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

impl SurrogateModel for KnnSurrogate {
    fn name(&self) -> &str {
        "knn"
    }

    fn fit(&mut self, points: &[Vec<f64>], targets: &[f64]) {
        let n = points.len().min(targets.len());
        self.points = points[..n].to_vec();
        self.targets = targets[..n].to_vec();
        self.target_spread = if n > 1 {
            let mean = self.targets.iter().sum::<f64>() / n as f64;
            (self.targets.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n as f64).sqrt()
        } else {
            1.0
        };
    }

    fn predict(&self, point: &[f64]) -> Prediction {
        if self.points.is_empty() {
            return Prediction { mean: 0.0, std: 1.0 };
        }

        let mut neighbours: Vec<(f64, f64)> = self
            .points
            .iter()
            .zip(&self.targets)
            .map(|(p, &t)| (distance(p, point), t))
            .collect();
        neighbours.sort_by(|a, b| a.0.total_cmp(&b.0));
        neighbours.truncate(self.k);

        let weights: Vec<f64> = neighbours.iter().map(|(d, _)| 1.0 / (d + 1e-9)).collect();
        let total: f64 = weights.iter().sum();
        let mean = neighbours
            .iter()
            .zip(&weights)
            .map(|((_, t), w)| w * t)
            .sum::<f64>()
            / total;
        let variance = neighbours
            .iter()
            .zip(&weights)
            .map(|((_, t), w)| w * (t - mean).powi(2))
            .sum::<f64>()
            / total;

        let nearest = neighbours[0].0;
        Prediction {
            mean,
            std: variance.sqrt() + nearest * self.target_spread,
        }
    }
}

// Abramowitz & Stegun 7.1.26, |error| < 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Expected improvement over `best` (higher is better) with exploration
/// margin `xi`.
pub fn expected_improvement(prediction: Prediction, best: f64, xi: f64) -> f64 {
    let gain = prediction.mean - best - xi;
    if prediction.std <= 1e-12 {
        return gain.max(0.0);
    }
    let z = gain / prediction.std;
    (gain * normal_cdf(z) + prediction.std * normal_pdf(z)).max(0.0)
}

/// `n` points of a Latin hypercube over the unit cube of `dims` dimensions.
pub fn latin_hypercube(dims: usize, n: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f64>> {
    let mut points = vec![vec![0.0; dims]; n];
    for d in 0..dims {
        let mut strata: Vec<usize> = (0..n).collect();
        strata.shuffle(rng);
        for (point, stratum) in points.iter_mut().zip(strata) {
            point[d] = (stratum as f64 + rng.gen::<f64>()) / n as f64;
        }
    }
    points
}

/// Stream index of the cold-start design, distinct from every proposal step.
const COLD_START_STREAM: u64 = u64::MAX - 1;

/// Surrogate-guided strategy.
pub struct SurrogateSearch {
    model: Box<dyn SurrogateModel>,
    min_observations: usize,
    candidate_pool: usize,
    xi: f64,
    max_attempts: usize,
}

impl SurrogateSearch {
    pub const ID: &'static str = "surrogate";

    pub fn new(model: Box<dyn SurrogateModel>) -> Self {
        Self {
            model,
            min_observations: 5,
            candidate_pool: 256,
            xi: 0.01,
            max_attempts: 100,
        }
    }

    pub fn with_min_observations(mut self, n: usize) -> Self {
        self.min_observations = n.max(1);
        self
    }

    pub fn with_candidate_pool(mut self, n: usize) -> Self {
        self.candidate_pool = n.max(1);
        self
    }

    pub fn with_exploration(mut self, xi: f64) -> Self {
        self.xi = xi.max(0.0);
        self
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Cold-start batch: the next strata of a `min_observations`-point Latin
    /// hypercube fixed by the run seed. The position in the design is the
    /// number of trials this strategy already originated, so single-trial
    /// batches still fill the space.
    fn cold_start(
        &self,
        ctx: &mut ProposalContext<'_>,
        k: usize,
    ) -> Result<Vec<Assignment>, SpaceError> {
        let n = self.min_observations.max(1);
        let cursor = ctx.originated_by(Self::ID);

        let mut design_round = usize::MAX;
        let mut design: Vec<Vec<f64>> = Vec::new();
        let mut batch = Vec::with_capacity(k);
        for idx in cursor..cursor + k {
            let round = idx / n;
            if round != design_round {
                let mut rng = derive_rng(ctx.seed, &[COLD_START_STREAM, round as u64]);
                design = latin_hypercube(ctx.space.len(), n, &mut rng);
                design_round = round;
            }
            let candidate = ctx.space.decode(&design[idx % n]);
            if ctx.space.check_constraints(&candidate).is_ok() {
                batch.push(candidate);
            } else if let Ok(candidate) = sample_feasible(ctx.space, &mut ctx.rng, self.max_attempts) {
                batch.push(candidate);
            }
        }

        if batch.is_empty() {
            return Err(SpaceError::ConstraintUnsatisfiable {
                attempts: self.max_attempts,
            });
        }
        Ok(batch)
    }
}

impl Default for SurrogateSearch {
    fn default() -> Self {
        Self::new(Box::new(KnnSurrogate::default()))
    }
}

impl std::fmt::Debug for SurrogateSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurrogateSearch")
            .field("model", &self.model.name())
            .field("min_observations", &self.min_observations)
            .field("candidate_pool", &self.candidate_pool)
            .field("xi", &self.xi)
            .finish()
    }
}

impl Strategy for SurrogateSearch {
    fn id(&self) -> &str {
        Self::ID
    }

    fn propose(
        &mut self,
        ctx: &mut ProposalContext<'_>,
        k: usize,
    ) -> Result<Vec<Assignment>, SpaceError> {
        let k = k.max(1);
        let mut points = Vec::new();
        let mut targets = Vec::new();
        for trial in ctx.history {
            if let Some(score) = trial.completed_score() {
                if let Ok(point) = ctx.space.encode(&trial.assignment) {
                    points.push(point);
                    targets.push(ctx.direction.oriented(score));
                }
            }
        }

        if points.len() < self.min_observations {
            tracing::debug!(
                observations = points.len(),
                "surrogate cold start, sampling latin hypercube"
            );
            return self.cold_start(ctx, k);
        }

        self.model.fit(&points, &targets);
        let incumbent = targets.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        // Draws that find no feasible point are dropped from the pool.
        let mut candidates = Vec::with_capacity(self.candidate_pool);
        let mut encoded = Vec::with_capacity(self.candidate_pool);
        for _ in 0..self.candidate_pool {
            let Ok(candidate) = sample_feasible(ctx.space, &mut ctx.rng, self.max_attempts) else {
                continue;
            };
            encoded.push(ctx.space.encode(&candidate)?);
            candidates.push(candidate);
        }
        if candidates.is_empty() {
            return Err(SpaceError::ConstraintUnsatisfiable {
                attempts: self.max_attempts,
            });
        }

        let model = &*self.model;
        let xi = self.xi;
        let scores: Vec<f64> = encoded
            .par_iter()
            .map(|point| expected_improvement(model.predict(point), incumbent, xi))
            .collect();

        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

        let mut chosen: Vec<Assignment> = Vec::with_capacity(k);
        for idx in order {
            if chosen.len() == k {
                break;
            }
            let candidate = &candidates[idx];
            let seen = chosen.contains(candidate)
                || ctx.history.iter().any(|t| &t.assignment == candidate);
            if !seen {
                chosen.push(candidate.clone());
            }
        }
        if chosen.len() < k {
            if let Ok(extra) =
                sample_feasible_batch(ctx.space, &mut ctx.rng, k - chosen.len(), self.max_attempts)
            {
                chosen.extend(extra);
            }
        }
        if chosen.is_empty() {
            return Err(SpaceError::ConstraintUnsatisfiable {
                attempts: self.max_attempts,
            });
        }

        tracing::debug!(
            model = self.model.name(),
            observations = points.len(),
            incumbent,
            "surrogate proposals scored"
        );
        Ok(chosen)
    }
}
