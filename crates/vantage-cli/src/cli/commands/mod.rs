use super::args::*;
use std::path::Path;
use tracing_subscriber::{fmt, EnvFilter};
use vantage_core::config::ClientConfig;
use vantage_core::orchestrator::Orchestrator;

pub mod results;
pub mod run;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const RUN_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    if let Command::Version = cli.cmd {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(exit_codes::OK);
    }

    let cfg = match load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    init_logging(&cfg.log_level);
    tracing::debug!(event = "vantage.cli.config", config = ?cfg);

    let orch = Orchestrator::from_config(&cfg)?;
    match cli.cmd {
        Command::Start(args) => run::cmd_start(&orch, args).await,
        Command::Resume => run::cmd_resume(&orch).await,
        Command::Runs(args) => results::cmd_runs(&orch, args).await,
        Command::Results(args) => results::cmd_results(&orch, args).await,
        Command::SetStatus(args) => results::cmd_set_status(&orch, args).await,
        Command::Version => unreachable!("handled above"),
    }
}

/// File config when present, then `VANTAGE_*` overrides on top.
fn load_config(path: &Path) -> anyhow::Result<ClientConfig> {
    let mut cfg = if path.exists() {
        ClientConfig::load(path)?
    } else {
        ClientConfig::default()
    };
    cfg.apply_env();
    cfg.validate()?;
    Ok(cfg)
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(std::io::stderr)
        .init();
}
