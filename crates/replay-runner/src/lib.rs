//! Replays recorded manipulation trials through an external replay tool and
//! aggregates the accumulated rewards into a difficulty-weighted report.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const LEVELS: [i64; 4] = [1, 2, 3, 4];
pub const SAMPLE_FILE: &str = "test_data.p";
pub const REPORT_FILE: &str = "reward.txt";
pub const REWARD_LABEL: &str = "Accumulated Reward: ";
pub const REPLAY_EXE_ENV: &str = "REPLAY_ACTION_LOG_EXE";
pub const DEFAULT_REPLAY_EXE: &str = "replay_action_log";
pub const REPORT_DIVIDER: &str = "=======================================================";
const REPORT_SEPARATOR: &str = "-------------------------------------------------------";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("'{}' does not exist or is not a directory.", .path.display())]
    NotFound { path: PathBuf },

    #[error("failed to load samples from {}: {message}", .path.display())]
    Deserialization { path: PathBuf, message: String },

    #[error("failed to launch replay tool {}", .exe.display())]
    Spawn {
        exe: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Replay of {} failed.  Output: {stderr}", .logfile.display())]
    ReplayExecution { logfile: PathBuf, stderr: String },

    #[error("Failed to parse reward from replay of {}: {reason}", .logfile.display())]
    RewardParse { logfile: PathBuf, reason: String },

    #[error("sample {iteration} has difficulty {difficulty}, expected one of {:?}", LEVELS)]
    UnknownDifficulty { difficulty: i64, iteration: i64 },

    #[error("failed to write report {}", .path.display())]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One recorded trial as stored in the sample file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrialDescriptor {
    pub difficulty: i64,
    pub iteration: i64,
    #[serde(rename = "init_pose_json")]
    pub initial_pose: String,
    #[serde(rename = "goal_pose_json")]
    pub goal_pose: String,
    #[serde(rename = "logfile")]
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialResult {
    pub trial: TrialDescriptor,
    pub reward: f64,
}

/// Loads the ordered trial list from `<input_dir>/test_data.p`.
///
/// The sample file holds one JSON object per line; blank lines are ignored.
pub fn load_trials(input_dir: &Path) -> Result<Vec<TrialDescriptor>, ReplayError> {
    if !input_dir.is_dir() {
        return Err(ReplayError::NotFound {
            path: input_dir.to_path_buf(),
        });
    }
    let path = input_dir.join(SAMPLE_FILE);
    let data = fs::read_to_string(&path).map_err(|e| ReplayError::Deserialization {
        path: path.clone(),
        message: e.to_string(),
    })?;
    let trials = parse_trials(&data)
        .map_err(|message| ReplayError::Deserialization { path: path.clone(), message })?;
    info!(path = %path.display(), count = trials.len(), "loaded samples");
    Ok(trials)
}

fn parse_trials(data: &str) -> Result<Vec<TrialDescriptor>, String> {
    let mut trials = Vec::new();
    for (idx, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let trial: TrialDescriptor =
            serde_json::from_str(line).map_err(|e| format!("line {}: {}", idx + 1, e))?;
        trials.push(trial);
    }
    Ok(trials)
}

/// The external replay tool. Each run blocks until the child exits; there is
/// no timeout, so a hung tool hangs the caller.
#[derive(Debug, Clone)]
pub struct ReplayCommand {
    exe: PathBuf,
}

impl ReplayCommand {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    /// Uses `REPLAY_ACTION_LOG_EXE` when set, else `replay_action_log` next
    /// to the running binary.
    pub fn from_env() -> Self {
        let exe = resolve_replay_exe(
            std::env::var_os(REPLAY_EXE_ENV),
            std::env::current_exe().ok(),
        );
        Self::new(exe)
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn run(&self, trial: &TrialDescriptor) -> Result<f64, ReplayError> {
        let args = replay_args(trial);
        debug!(exe = %self.exe.display(), ?args, "launching replay");
        let output = Command::new(&self.exe)
            .args(&args)
            .output()
            .map_err(|source| ReplayError::Spawn {
                exe: self.exe.clone(),
                source,
            })?;
        debug!(status = %output.status, logfile = %trial.log_path.display(), "replay exited");

        if !output.status.success() {
            return Err(ReplayError::ReplayExecution {
                logfile: trial.log_path.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_reward(&stdout).map_err(|reason| ReplayError::RewardParse {
            logfile: trial.log_path.clone(),
            reason,
        })
    }
}

fn resolve_replay_exe(env_value: Option<OsString>, current_exe: Option<PathBuf>) -> PathBuf {
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return PathBuf::from(value);
    }
    current_exe
        .as_deref()
        .and_then(Path::parent)
        .map(|dir| dir.join(DEFAULT_REPLAY_EXE))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REPLAY_EXE))
}

fn replay_args(trial: &TrialDescriptor) -> Vec<OsString> {
    vec![
        "--difficulty".into(),
        trial.difficulty.to_string().into(),
        "--initial-pose".into(),
        trial.initial_pose.clone().into(),
        "--goal-pose".into(),
        trial.goal_pose.clone().into(),
        "--logfile".into(),
        trial.log_path.clone().into_os_string(),
    ]
}

/// Returns the value of the first `Accumulated Reward: ` line.
pub fn parse_reward(stdout: &str) -> Result<f64, String> {
    let raw = stdout
        .lines()
        .find_map(|line| line.strip_prefix(REWARD_LABEL))
        .ok_or_else(|| format!("no line starting with '{}'", REWARD_LABEL))?;
    raw.trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid reward value '{}': {}", raw.trim(), e))
}

fn ensure_known_level(trial: &TrialDescriptor) -> Result<(), ReplayError> {
    if LEVELS.contains(&trial.difficulty) {
        Ok(())
    } else {
        Err(ReplayError::UnknownDifficulty {
            difficulty: trial.difficulty,
            iteration: trial.iteration,
        })
    }
}

/// Replays every trial in order and stops at the first failure.
///
/// `on_trial` is called before each replay starts.
pub fn replay_trials<F>(
    trials: &[TrialDescriptor],
    command: &ReplayCommand,
    mut on_trial: F,
) -> Result<Vec<TrialResult>, ReplayError>
where
    F: FnMut(&TrialDescriptor),
{
    let mut results = Vec::with_capacity(trials.len());
    for trial in trials {
        on_trial(trial);
        ensure_known_level(trial)?;
        let reward = command.run(trial)?;
        info!(
            difficulty = trial.difficulty,
            iteration = trial.iteration,
            reward,
            "replay finished"
        );
        results.push(TrialResult {
            trial: trial.clone(),
            reward,
        });
    }
    Ok(results)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DifficultyReport {
    pub difficulty: i64,
    pub rewards: Vec<f64>,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
}

impl DifficultyReport {
    pub fn from_rewards(difficulty: i64, rewards: Vec<f64>) -> Self {
        let (mean, std) = mean_and_std(&rewards);
        Self {
            difficulty,
            rewards,
            mean,
            std,
        }
    }

    pub fn weighted_contribution(&self) -> f64 {
        self.difficulty as f64 * self.mean
    }

    fn render_line(&self) -> String {
        format!(
            "Level {} mean reward:\t{},\tstd: {}",
            self.difficulty,
            format_reward(self.mean),
            format_reward(self.std)
        )
    }
}

// Empty input yields NaN for both.
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    let variance = values
        .iter()
        .map(|v| {
            let diff = v - mean;
            diff * diff
        })
        .sum::<f64>()
        / count;
    (mean, variance.sqrt())
}

fn format_reward(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{:.3}", value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardReport {
    pub levels: Vec<DifficultyReport>,
    pub total_weighted_reward: f64,
}

impl RewardReport {
    pub fn from_results(results: &[TrialResult]) -> Result<Self, ReplayError> {
        let mut grouped: BTreeMap<i64, Vec<f64>> =
            LEVELS.iter().map(|&level| (level, Vec::new())).collect();
        for result in results {
            ensure_known_level(&result.trial)?;
            if let Some(rewards) = grouped.get_mut(&result.trial.difficulty) {
                rewards.push(result.reward);
            }
        }

        let levels = grouped
            .into_iter()
            .map(|(difficulty, rewards)| {
                if rewards.is_empty() {
                    warn!(difficulty, "no samples for level, reporting nan");
                }
                DifficultyReport::from_rewards(difficulty, rewards)
            })
            .collect();
        Ok(Self::from_levels(levels))
    }

    /// Builds a report from per-level results already in ascending order.
    pub fn from_levels(levels: Vec<DifficultyReport>) -> Self {
        let total_weighted_reward = levels
            .iter()
            .fold(0.0, |total, level| total + level.weighted_contribution());
        Self {
            levels,
            total_weighted_reward,
        }
    }

    pub fn render(&self) -> String {
        let mut report = String::new();
        for level in &self.levels {
            report.push_str(&level.render_line());
            report.push('\n');
        }
        report.push_str(REPORT_SEPARATOR);
        report.push('\n');
        report.push_str(&format!(
            "Total Weighted Reward: {}\n",
            format_reward(self.total_weighted_reward)
        ));
        report
    }
}

/// Writes the rendered report to `<input_dir>/reward.txt`, replacing any
/// previous report.
pub fn write_report(input_dir: &Path, report: &RewardReport) -> Result<PathBuf, ReplayError> {
    let path = input_dir.join(REPORT_FILE);
    fs::write(&path, report.render()).map_err(|source| ReplayError::ReportWrite {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
