//! Binary entry point for the orchestrator.
//!
//! Not a general CLI: takes a feature name and a task-graph path as fixed
//! positional arguments (or their `ORCH_FEATURE`/`ORCH_GRAPH_PATH`
//! environment equivalents), loads configuration, and runs the orchestrator
//! loop to completion or until an unrecoverable error.
//!
//! ```bash
//! zerg-orchestrator <feature> <graph.json> [repo-dir]
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use zerg_orchestrator::config::OrchestratorConfig;
use zerg_orchestrator::logging::init_tracing;
use zerg_orchestrator::orchestrator::Orchestrator;

fn usage() -> String {
    "usage: zerg-orchestrator <feature> <graph.json> [repo-dir]\n\
     (or set ORCH_FEATURE and ORCH_GRAPH_PATH)"
        .to_string()
}

struct Args {
    feature: String,
    graph_path: PathBuf,
    repo_dir: PathBuf,
}

fn parse_args() -> Result<Args, String> {
    let mut positional = std::env::args().skip(1);

    let feature = positional
        .next()
        .or_else(|| std::env::var("ORCH_FEATURE").ok())
        .ok_or_else(usage)?;
    let graph_path = positional
        .next()
        .or_else(|| std::env::var("ORCH_GRAPH_PATH").ok())
        .map(PathBuf::from)
        .ok_or_else(usage)?;
    let repo_dir = positional
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(Args {
        feature,
        graph_path,
        repo_dir,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = run(args.feature, &args.graph_path, &args.repo_dir).await {
        tracing::error!(error = %err, "orchestrator run failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn run(
    feature: String,
    graph_path: &Path,
    repo_dir: &Path,
) -> Result<(), zerg_orchestrator::error::OrchestratorError> {
    let config = OrchestratorConfig::load(feature)?;
    let mut orchestrator = Orchestrator::bootstrap(config, graph_path, repo_dir).await?;
    orchestrator.run().await?;
    tracing::info!(summary = %orchestrator.state_summary(), "orchestrator stopped");
    Ok(())
}
