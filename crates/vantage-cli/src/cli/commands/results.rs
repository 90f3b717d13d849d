use super::exit_codes;
use crate::cli::args::{ResultsArgs, RunsArgs, SetStatusArgs};
use vantage_core::cache::LoadMore;
use vantage_core::model::{ResultFilters, Run, RunStatus};
use vantage_core::orchestrator::Orchestrator;

pub async fn cmd_runs(orch: &Orchestrator, args: RunsArgs) -> anyhow::Result<i32> {
    match orch.refresh_runs(args.project.as_deref()).await {
        Ok(state) => {
            for run in &state.runs {
                print_run(run);
            }
            Ok(exit_codes::OK)
        }
        Err(e) => {
            eprintln!("warning: could not refresh runs ({}); showing last known list", e);
            for run in &orch.runs().runs {
                print_run(run);
            }
            Ok(exit_codes::RUN_FAILED)
        }
    }
}

fn print_run(run: &Run) {
    println!(
        "{}\t{}\t{}/{}\t{}",
        run.id,
        run.status,
        run.completed,
        run.total,
        run.name.as_deref().unwrap_or("-")
    );
}

pub async fn cmd_results(orch: &Orchestrator, args: ResultsArgs) -> anyhow::Result<i32> {
    let filters = ResultFilters {
        engine: args.engine,
        channel: args.channel,
        risk_level: args.risk_level,
    };

    let loaded = match orch.load_results_filtered(&args.run_id, &filters).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("could not load results for {}: {}", args.run_id, e);
            return Ok(exit_codes::RUN_FAILED);
        }
    };

    if args.all {
        loop {
            match orch.load_more(&args.run_id).await? {
                LoadMore::Loaded { has_more: true, .. } => continue,
                LoadMore::Loaded { .. } | LoadMore::NoMore | LoadMore::Superseded => break,
                LoadMore::InFlight => tokio::task::yield_now().await,
            }
        }
    }

    let entry = orch
        .cache()
        .entry(&args.run_id)
        .unwrap_or_else(|| loaded.entry.clone());
    for record in &entry.results {
        println!("{}", serde_json::to_string(record)?);
    }
    eprintln!(
        "{} of {} results (version {}, cache hit: {})",
        entry.results.len(),
        entry.total,
        entry.version,
        loaded.cache_hit
    );
    Ok(exit_codes::OK)
}

pub async fn cmd_set_status(orch: &Orchestrator, args: SetStatusArgs) -> anyhow::Result<i32> {
    let Some(status) = RunStatus::parse(&args.status) else {
        eprintln!("config error: unknown status '{}'", args.status);
        return Ok(exit_codes::CONFIG_ERROR);
    };

    if orch.runs().get(&args.run_id).is_none() {
        if let Err(e) = orch.refresh_runs(None).await {
            tracing::warn!(event = "vantage.cli.refresh_failed", error = %e);
        }
    }

    match orch.set_run_status(&args.run_id, status).await {
        Ok(run) => {
            print_run(&run);
            Ok(exit_codes::OK)
        }
        Err(e) => {
            eprintln!("status change for {} rolled back: {}", args.run_id, e);
            Ok(exit_codes::RUN_FAILED)
        }
    }
}
