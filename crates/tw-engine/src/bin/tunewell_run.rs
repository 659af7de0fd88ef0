use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tw_engine::{run_to_completion, CancellationToken, CommandEvaluator, RunContext, RunFile};
use tw_optimizer::{build_pool, default_pool};
use tw_store::SqliteTrialStore;
use tw_types::{SearchSpace, TuneResult};

/// Exit code for unusable configuration.
const EXIT_CONFIG: i32 = 2;

fn prepare(path: &Path) -> TuneResult<RunContext> {
    let file = RunFile::load(path)?;
    let config = file.run_config()?;
    let space = SearchSpace::from_parameters(file.parameters.clone())?;
    let strategies = build_pool(file.strategies.as_deref().unwrap_or(&default_pool()));
    let evaluator = CommandEvaluator::new(&file.command)?;

    let database = std::env::var_os("TUNEWELL_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|| file.database.clone());
    let store = SqliteTrialStore::open(&database)?;
    info!(database = %database.display(), "opened trial store");

    RunContext::new(config, space, strategies, Box::new(store), Arc::new(evaluator))?
        .with_seeds(file.seeds.clone())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        eprintln!("usage: tunewell-run <run.json>");
        std::process::exit(EXIT_CONFIG);
    };

    let ctx = match prepare(&path) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(kind = e.kind(), error = %e, "cannot start run");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight trials");
            on_signal.cancel();
        }
    });

    let (report, _ctx) = run_to_completion(ctx, cancel).await;
    let summary = serde_json::to_string_pretty(&report).context("serializing run report")?;
    println!("{summary}");

    let code = report.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
