use anyhow::Result;
use clap::Parser;
use replay_runner::{ReplayCommand, RewardReport, REPORT_DIVIDER};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const ABOUT: &str = "Replay recorded trials and compute the difficulty-weighted reward";

const LONG_ABOUT: &str = "\
Replay recorded trials and compute the difficulty-weighted reward.

Reads the samples in <INPUT_DIRECTORY>/test_data.p, replays each action log
with the replay tool and writes the per-level summary to
<INPUT_DIRECTORY>/reward.txt.

The replay tool is taken from REPLAY_ACTION_LOG_EXE, or `replay_action_log`
next to this binary. Replays have no timeout.";

#[derive(Parser)]
#[command(name = "replay-rewards", version, about = ABOUT, long_about = LONG_ABOUT)]
struct Cli {
    /// Directory containing the generated log files.
    input_directory: PathBuf,
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    if let Err(err) = run(&cli.input_directory) {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(input_directory: &Path) -> Result<()> {
    let trials = replay_runner::load_trials(input_directory)?;
    let command = ReplayCommand::from_env();
    tracing::debug!(exe = %command.exe().display(), "using replay tool");

    let results = replay_runner::replay_trials(&trials, &command, |trial| {
        println!(
            "Replay level {} sample {}",
            trial.difficulty, trial.iteration
        );
    })?;
    let report = RewardReport::from_results(&results)?;

    println!("\n{}\n", REPORT_DIVIDER);
    println!("{}", report.render());

    let path = replay_runner::write_report(input_directory, &report)?;
    tracing::info!(path = %path.display(), "wrote reward report");
    Ok(())
}
