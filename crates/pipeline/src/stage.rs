use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

/// Why a stage ultimately did not succeed
#[derive(Debug, Error)]
pub enum StageError {
    /// The external tool could not be spawned at all. Never retried; the
    /// stage is marked unavailable rather than failed.
    #[error("external tool not found: {0}")]
    ToolMissing(String),
    /// The command kept exiting non-zero through every retry
    #[error("stage `{stage}` failed after {attempts} attempt(s): {detail}")]
    Failed {
        stage: String,
        attempts: usize,
        detail: String,
    },
    #[error("stage `{stage}` log error: {source}")]
    Log {
        stage: String,
        #[source]
        source: std::io::Error,
    },
}

/// One structured entry in the append-only per-project pipeline log
#[derive(Debug, Serialize)]
struct StageEvent<'a> {
    timestamp: String,
    step: &'a str,
    status: &'a str,
    cmd: String,
    dur: f64,
    attempt: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<String>,
}

/// Executes pipeline stages as external commands with bounded retry.
///
/// Every attempt, success or failure, is appended as one JSON line to the
/// project's pipeline log so a run can be reconstructed after the fact.
#[derive(Debug, Clone)]
pub struct StageRunner {
    backoff: Vec<Duration>,
    retries: usize,
    log_path: PathBuf,
}

impl StageRunner {
    pub fn new(backoff_secs: &[u64], retries: usize, log_path: PathBuf) -> Self {
        let backoff = if backoff_secs.is_empty() {
            vec![Duration::from_secs(5)]
        } else {
            backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect()
        };
        Self {
            backoff,
            retries,
            log_path,
        }
    }

    /// Execute one stage command. Retries on non-zero exit per the backoff
    /// schedule (clamped at its last entry); a spawn failure with NotFound is
    /// immediately fatal for the stage and never retried.
    pub async fn run(&self, stage: &str, program: &Path, args: &[String]) -> Result<(), StageError> {
        let cmd_str = format!(
            "{} {}",
            program.display(),
            args.join(" ")
        );

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let started = Instant::now();

            let output = Command::new(program).args(args).output().await;
            let dur = started.elapsed().as_secs_f64();

            match output {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let tool = program.display().to_string();
                    error!("stage {}: tool missing: {}", stage, tool);
                    self.append_event(stage, "unavailable", &cmd_str, dur, attempt, Some(e.to_string()))?;
                    return Err(StageError::ToolMissing(tool));
                }
                Err(e) => {
                    warn!("stage {}: spawn error (attempt {}): {}", stage, attempt, e);
                    self.append_event(stage, "fail", &cmd_str, dur, attempt, Some(e.to_string()))?;
                    if attempt > self.retries {
                        return Err(StageError::Failed {
                            stage: stage.to_string(),
                            attempts: attempt,
                            detail: e.to_string(),
                        });
                    }
                }
                Ok(out) if out.status.success() => {
                    info!("stage {}: ok in {:.2}s", stage, dur);
                    self.append_event(stage, "ok", &cmd_str, dur, attempt, None)?;
                    return Ok(());
                }
                Ok(out) => {
                    let exit_code = out.status.code().unwrap_or(-1);
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    let detail = format!("exit code {}: {}", exit_code, tail(&stderr, 400));
                    warn!("stage {}: attempt {} failed ({})", stage, attempt, detail);
                    self.append_event(stage, "fail", &cmd_str, dur, attempt, Some(detail.clone()))?;
                    if attempt > self.retries {
                        return Err(StageError::Failed {
                            stage: stage.to_string(),
                            attempts: attempt,
                            detail,
                        });
                    }
                }
            }

            let delay = self.backoff[(attempt - 1).min(self.backoff.len() - 1)];
            info!("stage {}: retrying in {:?}", stage, delay);
            tokio::time::sleep(delay).await;
        }
    }

    fn append_event(
        &self,
        stage: &str,
        status: &str,
        cmd: &str,
        dur: f64,
        attempt: usize,
        err: Option<String>,
    ) -> Result<(), StageError> {
        let event = StageEvent {
            timestamp: Utc::now().to_rfc3339(),
            step: stage,
            status,
            cmd: cmd.to_string(),
            dur: (dur * 100.0).round() / 100.0,
            attempt,
            err,
        };

        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)?;
            let line = serde_json::to_string(&event).map_err(std::io::Error::other)?;
            writeln!(file, "{}", line)
        };

        write().map_err(|source| StageError::Log {
            stage: stage.to_string(),
            source,
        })
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s.trim_end()
    } else {
        let start = s.len() - max;
        // Don't split a UTF-8 sequence
        let start = (start..s.len()).find(|i| s.is_char_boundary(*i)).unwrap_or(start);
        s[start..].trim_end()
    }
}
