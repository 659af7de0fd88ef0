//! Multi-armed bandit primitives: per-arm statistics, selection and reward
//! policies.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Running statistics for one strategy arm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmStatistics {
    pub pulls: u64,
    pub cumulative_reward: f64,
    /// Welford running mean of rewards.
    pub mean: f64,
    /// Welford sum of squared deviations.
    pub m2: f64,
    /// Completion time of the last trial that updated the arm.
    pub last_update_time: Option<DateTime<Utc>>,
}

impl ArmStatistics {
    pub fn record(&mut self, reward: f64, at: Option<DateTime<Utc>>) {
        self.pulls += 1;
        self.cumulative_reward += reward;
        let delta = reward - self.mean;
        self.mean += delta / self.pulls as f64;
        self.m2 += delta * (reward - self.mean);
        if at.is_some() {
            self.last_update_time = at;
        }
    }

    pub fn mean_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Population variance of rewards.
    pub fn variance(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            (self.m2 / self.pulls as f64).max(0.0)
        }
    }
}

/// How the next arm is chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// `mean + c * sqrt(ln N / n)`
    Ucb1 { exploration: f64 },
    /// UCB1-Tuned: the bonus is capped by the arm's observed variance.
    UcbTuned,
    /// Gaussian Thompson sampling on the reward mean.
    Thompson,
    /// Cycle through arms in pool order, ignoring rewards.
    RoundRobin,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::Ucb1 {
            exploration: std::f64::consts::SQRT_2,
        }
    }
}

impl SelectionPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ucb1 { .. } => "ucb1",
            Self::UcbTuned => "ucb_tuned",
            Self::Thompson => "thompson",
            Self::RoundRobin => "round_robin",
        }
    }

    /// Selection score of one arm. `virtual_pulls` counts dispatches already
    /// planned for the arm in the current batch, `total_pulls` the sum over
    /// all candidate arms including those. Unpulled arms score `+inf`.
    pub fn score(
        &self,
        stats: &ArmStatistics,
        virtual_pulls: u64,
        total_pulls: u64,
        rng: &mut ChaCha8Rng,
    ) -> f64 {
        let n = stats.pulls + virtual_pulls;
        if n == 0 {
            return f64::INFINITY;
        }
        let n = n as f64;
        let ln_total = (total_pulls.max(1) as f64).ln();
        let mean = stats.mean_reward();

        match self {
            Self::Ucb1 { exploration } => mean + exploration * (ln_total / n).sqrt(),
            Self::UcbTuned => {
                let v = stats.variance() + (2.0 * ln_total / n).sqrt();
                mean + (ln_total / n * v.min(0.25)).sqrt()
            }
            Self::Thompson => {
                let spread = (stats.variance().max(0.25) / n).sqrt();
                mean + spread * standard_normal(rng)
            }
            Self::RoundRobin => -n,
        }
    }
}

fn standard_normal(rng: &mut ChaCha8Rng) -> f64 {
    // Box-Muller; `1 - u` keeps the logarithm finite.
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// How a completed trial is turned into a reward for its arm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RewardPolicy {
    /// 1 when the trial strictly improves the running best, else 0.
    #[default]
    Improvement,
    /// `0.5 + 0.5 * tanh(scale * relative_gain)` against the running best.
    RelativeGain { scale: f64 },
}

impl RewardPolicy {
    /// Reward for an oriented score (higher is better). The first completed
    /// trial always earns the maximum reward.
    pub fn reward(&self, oriented_score: f64, running_best: Option<f64>) -> f64 {
        let Some(best) = running_best else {
            return 1.0;
        };
        match self {
            Self::Improvement => {
                if oriented_score > best {
                    1.0
                } else {
                    0.0
                }
            }
            Self::RelativeGain { scale } => {
                let gain = (oriented_score - best) / best.abs().max(1e-9);
                0.5 + 0.5 * (scale * gain).tanh()
            }
        }
    }
}

/// Meta-optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub selection: SelectionPolicy,
    pub reward: RewardPolicy,
    /// Reward recorded for attributable failures. Strictly below every
    /// success reward.
    pub failure_penalty: f64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            selection: SelectionPolicy::default(),
            reward: RewardPolicy::default(),
            failure_penalty: -1.0,
        }
    }
}

impl MetaConfig {
    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_reward(mut self, reward: RewardPolicy) -> Self {
        self.reward = reward;
        self
    }

    pub fn with_failure_penalty(mut self, penalty: f64) -> Self {
        self.failure_penalty = penalty;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.failure_penalty.is_finite() && self.failure_penalty < 0.0) {
            return Err(format!(
                "failure_penalty must be a negative number, got {}",
                self.failure_penalty
            ));
        }
        if let SelectionPolicy::Ucb1 { exploration } = self.selection {
            if !(exploration.is_finite() && exploration >= 0.0) {
                return Err(format!("exploration must be >= 0, got {exploration}"));
            }
        }
        if let RewardPolicy::RelativeGain { scale } = self.reward {
            if !(scale.is_finite() && scale > 0.0) {
                return Err(format!("reward scale must be > 0, got {scale}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn stats(rewards: &[f64]) -> ArmStatistics {
        let mut s = ArmStatistics::default();
        for &r in rewards {
            s.record(r, None);
        }
        s
    }

    #[test]
    fn welford_matches_direct_computation() {
        let s = stats(&[1.0, 0.0, 0.0, 1.0, -1.0]);
        assert_eq!(s.pulls, 5);
        assert!((s.mean_reward() - 0.2).abs() < 1e-12);
        assert!((s.cumulative_reward - 1.0).abs() < 1e-12);
        // mean 0.2: squared deviations 0.64 + 0.04 + 0.04 + 0.64 + 1.44
        assert!((s.variance() - 2.8 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn unpulled_arms_score_infinity() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for policy in [
            SelectionPolicy::default(),
            SelectionPolicy::UcbTuned,
            SelectionPolicy::Thompson,
            SelectionPolicy::RoundRobin,
        ] {
            let score = policy.score(&ArmStatistics::default(), 0, 10, &mut rng);
            assert_eq!(score, f64::INFINITY, "{}", policy.name());
        }
    }

    #[test]
    fn ucb1_formula() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let s = stats(&[1.0, 0.0]);
        let policy = SelectionPolicy::Ucb1 { exploration: 2.0 };
        let expected = 0.5 + 2.0 * ((10f64).ln() / 2.0).sqrt();
        assert!((policy.score(&s, 0, 10, &mut rng) - expected).abs() < 1e-12);
    }

    #[test]
    fn virtual_pulls_shrink_the_bonus() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let s = stats(&[1.0]);
        let policy = SelectionPolicy::default();
        let alone = policy.score(&s, 0, 4, &mut rng);
        let planned = policy.score(&s, 2, 4, &mut rng);
        assert!(planned < alone);
        assert!(policy.score(&ArmStatistics::default(), 1, 4, &mut rng).is_finite());
    }

    #[test]
    fn round_robin_prefers_least_pulled() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let policy = SelectionPolicy::RoundRobin;
        assert!(policy.score(&stats(&[1.0]), 0, 3, &mut rng) > policy.score(&stats(&[0.0, 0.0]), 0, 3, &mut rng));
    }

    #[test]
    fn improvement_reward() {
        let policy = RewardPolicy::Improvement;
        assert_eq!(policy.reward(1.0, None), 1.0);
        assert_eq!(policy.reward(2.0, Some(1.0)), 1.0);
        assert_eq!(policy.reward(1.0, Some(1.0)), 0.0);
        assert_eq!(policy.reward(0.5, Some(1.0)), 0.0);
    }

    #[test]
    fn relative_gain_reward_is_bounded() {
        let policy = RewardPolicy::RelativeGain { scale: 5.0 };
        let better = policy.reward(1.5, Some(1.0));
        let same = policy.reward(1.0, Some(1.0));
        let worse = policy.reward(-10.0, Some(1.0));
        assert!(better > same && same > worse);
        assert_eq!(same, 0.5);
        assert!(worse >= 0.0 && better <= 1.0);
    }

    #[test]
    fn config_validation() {
        assert!(MetaConfig::default().validate().is_ok());
        assert!(MetaConfig::default()
            .with_failure_penalty(0.0)
            .validate()
            .is_err());
        assert!(MetaConfig::default()
            .with_selection(SelectionPolicy::Ucb1 { exploration: -1.0 })
            .validate()
            .is_err());
        assert!(MetaConfig::default()
            .with_reward(RewardPolicy::RelativeGain { scale: 0.0 })
            .validate()
            .is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: MetaConfig =
            serde_json::from_str(r#"{"selection": {"policy": "thompson"}}"#).unwrap();
        assert_eq!(config.selection, SelectionPolicy::Thompson);
        assert_eq!(config.reward, RewardPolicy::Improvement);
        assert_eq!(config.failure_penalty, -1.0);
    }
}
