use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "vantage",
    version,
    about = "Launch and follow AI-visibility simulation runs"
)]
pub struct Cli {
    /// YAML client config; missing file means defaults plus VANTAGE_* env
    #[arg(long, global = true, default_value = "vantage.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a run and follow it to completion
    Start(StartArgs),
    /// Re-attach to a run the previous session left in flight
    Resume,
    Runs(RunsArgs),
    Results(ResultsArgs),
    SetStatus(SetStatusArgs),
    Version,
}

#[derive(clap::Args, Debug, Clone)]
pub struct StartArgs {
    #[arg(long)]
    pub project: String,

    #[arg(long)]
    pub question_set: String,

    /// Engine to query; repeat for several
    #[arg(long = "provider", required = true)]
    pub providers: Vec<String>,

    #[arg(long)]
    pub name: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RunsArgs {
    #[arg(long)]
    pub project: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ResultsArgs {
    pub run_id: String,

    /// Keep loading pages until every result is held
    #[arg(long)]
    pub all: bool,

    #[arg(long)]
    pub engine: Option<String>,

    #[arg(long)]
    pub channel: Option<String>,

    #[arg(long)]
    pub risk_level: Option<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SetStatusArgs {
    pub run_id: String,

    /// pending | ready | running | evaluating | completed | failed
    pub status: String,
}
