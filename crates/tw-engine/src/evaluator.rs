//! Objective evaluator adapters: the only boundary to untrusted execution.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;
use tw_types::{config_error, Assignment, EvaluationError, EvaluationMetadata, TrialId, TuneResult};

/// Successful evaluation of one assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub score: f64,
    pub metadata: EvaluationMetadata,
}

impl Evaluation {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            metadata: EvaluationMetadata::default(),
        }
    }
}

/// Runs the objective for one assignment.
///
/// Implementations enforce `timeout` themselves and turn every crash into
/// [`EvaluationError`]; nothing an evaluator does may take down the caller.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        trial_id: TrialId,
        assignment: &Assignment,
        timeout: Duration,
    ) -> Result<Evaluation, EvaluationError>;
}

fn timeout_error(timeout: Duration) -> EvaluationError {
    EvaluationError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
    }
}

fn crash(message: impl Into<String>) -> EvaluationError {
    EvaluationError::Crash {
        message: message.into(),
    }
}

// ---- Subprocess evaluator ----

#[derive(Debug, Deserialize)]
struct ScoreLine {
    score: f64,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
}

/// Parse the evaluator output: the last non-empty line holds either a bare
/// number or `{"score": f, "metrics": {...}}`.
pub fn parse_score(stdout: &str) -> Result<(f64, BTreeMap<String, f64>), EvaluationError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|l| !l.is_empty())
        .ok_or_else(|| crash("evaluator produced no output"))?;

    let (score, metrics) = match line.parse::<f64>() {
        Ok(score) => (score, BTreeMap::new()),
        Err(_) => {
            let parsed: ScoreLine = serde_json::from_str(line)
                .map_err(|e| crash(format!("unparsable score line {line:?}: {e}")))?;
            (parsed.score, parsed.metrics)
        }
    };
    if !score.is_finite() {
        return Err(crash(format!("non-finite score {score}")));
    }
    Ok((score, metrics))
}

/// Runs an external command per trial.
///
/// The template is split on whitespace; `{name}` is replaced by the value of
/// parameter `name` and `{trial_id}` by the trial id.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    template: Vec<String>,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandEvaluator {
    pub fn new(template: &str) -> TuneResult<Self> {
        let template: Vec<String> = template.split_whitespace().map(String::from).collect();
        if template.is_empty() {
            return Err(config_error!("evaluation command template is empty"));
        }
        Ok(Self {
            template,
            working_dir: None,
            env: Vec::new(),
        })
    }

    /// Use an explicit argument vector, for arguments containing whitespace.
    pub fn from_argv(argv: Vec<String>) -> TuneResult<Self> {
        if argv.is_empty() {
            return Err(config_error!("evaluation command is empty"));
        }
        Ok(Self {
            template: argv,
            working_dir: None,
            env: Vec::new(),
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line for one trial. Placeholders are expanded in a single
    /// pass, so substituted values are never expanded again.
    pub fn render(&self, trial_id: TrialId, assignment: &Assignment) -> Vec<String> {
        self.template
            .iter()
            .map(|token| render_token(token, trial_id, assignment))
            .collect()
    }
}

/// Expand `{trial_id}` and `{name}` placeholders; unknown ones are kept.
fn render_token(token: &str, trial_id: TrialId, assignment: &Assignment) -> String {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = &after[..close];
        if name.contains('{') {
            out.push('{');
            rest = after;
            continue;
        }
        if name == "trial_id" {
            out.push_str(&trial_id.to_string());
        } else if let Some(value) = assignment.get(name) {
            out.push_str(&value.to_string());
        } else {
            out.push_str(&rest[open..open + close + 2]);
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(
        &self,
        trial_id: TrialId,
        assignment: &Assignment,
        timeout: Duration,
    ) -> Result<Evaluation, EvaluationError> {
        let argv = self.render(trial_id, assignment);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| crash("empty command line"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        debug!(trial = trial_id, command = %argv.join(" "), "spawning evaluator");
        let started = Instant::now();
        // Dropping the output future on timeout kills the child.
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| timeout_error(timeout))?
            .map_err(|e| crash(format!("failed to spawn {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(crash(format!("{} {}", output.status, detail).trim().to_string()));
        }

        let (score, metrics) = parse_score(&String::from_utf8_lossy(&output.stdout))?;
        Ok(Evaluation {
            score,
            metadata: EvaluationMetadata {
                wall_time_ms: started.elapsed().as_millis() as u64,
                metrics,
            },
        })
    }
}

// ---- In-process evaluator ----

type ObjectiveFn = dyn Fn(&Assignment) -> Result<f64, String> + Send + Sync;

/// Runs a synchronous objective on the blocking pool.
///
/// A timed-out call keeps running in the background until it returns; only
/// its result is discarded.
#[derive(Clone)]
pub struct FnEvaluator {
    objective: Arc<ObjectiveFn>,
}

impl FnEvaluator {
    pub fn new<F>(objective: F) -> Self
    where
        F: Fn(&Assignment) -> Result<f64, String> + Send + Sync + 'static,
    {
        Self {
            objective: Arc::new(objective),
        }
    }
}

impl std::fmt::Debug for FnEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnEvaluator").finish_non_exhaustive()
    }
}

#[async_trait]
impl Evaluator for FnEvaluator {
    async fn evaluate(
        &self,
        _trial_id: TrialId,
        assignment: &Assignment,
        timeout: Duration,
    ) -> Result<Evaluation, EvaluationError> {
        let objective = Arc::clone(&self.objective);
        let assignment = assignment.clone();
        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(move || objective(&assignment));

        let score = match tokio::time::timeout(timeout, handle).await {
            Err(_) => return Err(timeout_error(timeout)),
            Ok(Err(join)) => return Err(crash(format!("objective panicked: {join}"))),
            Ok(Ok(Err(message))) => return Err(crash(message)),
            Ok(Ok(Ok(score))) => score,
        };
        if !score.is_finite() {
            return Err(crash(format!("non-finite score {score}")));
        }
        Ok(Evaluation {
            score,
            metadata: EvaluationMetadata {
                wall_time_ms: started.elapsed().as_millis() as u64,
                metrics: BTreeMap::new(),
            },
        })
    }
}
