use crate::error::EngineError;
use crate::models::BacktestResult;
use crate::planner::WorkerConfig;
use crate::progress::{parse_progress_line, JobProgress};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long pipe readers may keep running after the child has exited or been killed.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerStatus {
    Succeeded,
    Failed { reason: String },
    TimedOut { timeout_secs: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub symbols: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub return_code: Option<i32>,
    pub execution_time: Duration,
    pub status: WorkerStatus,
    pub result: Option<BacktestResult>,
}

impl WorkerResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, WorkerStatus::Succeeded) && self.result.is_some()
    }

    pub fn failure_reason(&self) -> Option<String> {
        match &self.status {
            WorkerStatus::Succeeded => None,
            WorkerStatus::Failed { reason } => Some(reason.clone()),
            WorkerStatus::TimedOut { timeout_secs } => Some(
                EngineError::Timeout {
                    worker_id: self.worker_id,
                    timeout_secs: *timeout_secs,
                }
                .tagged_message(),
            ),
        }
    }
}

/// Runs each worker config in its own OS process: `<program> <args..> <config path>`.
#[derive(Clone)]
pub struct WorkerSpawner {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    progress: Option<JobProgress>,
    temp_dir: Option<PathBuf>,
}

impl WorkerSpawner {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
            timeout: Duration::from_secs(600),
            progress: None,
            temp_dir: None,
        }
    }

    /// Spawner that re-invokes the running binary's `worker` subcommand.
    pub fn for_current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Unable to resolve current executable")?;
        Ok(Self::new(program))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress(mut self, progress: JobProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_temp_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Results come back in submission order; at most `concurrency` children run at once.
    pub async fn spawn_parallel_workers(
        &self,
        configs: &[WorkerConfig],
        concurrency: usize,
    ) -> Vec<WorkerResult> {
        let concurrency = concurrency.max(1);
        info!(
            "Spawning {} worker(s), {} at a time",
            configs.len(),
            concurrency
        );
        stream::iter(configs.iter())
            .map(|config| self.spawn_worker(config))
            .buffered(concurrency)
            .collect()
            .await
    }

    pub async fn spawn_worker(&self, config: &WorkerConfig) -> WorkerResult {
        let started = Instant::now();
        if let Some(progress) = &self.progress {
            progress.register_worker(config.worker_id);
        }

        let mut result = match self.run_child(config).await {
            Ok(result) => result,
            Err(error) => WorkerResult {
                worker_id: config.worker_id,
                symbols: config.job.symbols.clone(),
                stdout: String::new(),
                stderr: String::new(),
                return_code: None,
                execution_time: Duration::ZERO,
                status: WorkerStatus::Failed {
                    reason: EngineError::Process {
                        worker_id: config.worker_id,
                        message: format!("{:#}", error),
                    }
                    .tagged_message(),
                },
                result: None,
            },
        };
        result.execution_time = started.elapsed();

        match &result.status {
            WorkerStatus::Succeeded => info!(
                "Worker {} finished {} symbol(s) in {:.1}s",
                result.worker_id,
                result.symbols.len(),
                result.execution_time.as_secs_f64()
            ),
            WorkerStatus::Failed { reason } => {
                warn!("Worker {} failed: {}", result.worker_id, reason)
            }
            WorkerStatus::TimedOut { timeout_secs } => warn!(
                "Worker {} killed after {}s timeout",
                result.worker_id, timeout_secs
            ),
        }
        if let Some(progress) = &self.progress {
            progress.finish_worker(config.worker_id, result.is_success());
        }
        result
    }

    async fn run_child(&self, config: &WorkerConfig) -> Result<WorkerResult> {
        let worker_id = config.worker_id;
        let prefix = format!("backtest-worker-{}-", worker_id);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".json");
        let mut config_file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .context("Failed to create worker config file")?;
        serde_json::to_writer(&mut config_file, config)
            .context("Failed to serialize worker config")?;
        config_file
            .flush()
            .context("Failed to flush worker config file")?;

        debug!(
            "Worker {} config written to {}",
            worker_id,
            config_file.path().display()
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(config_file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program.display()))?;

        let stdout_task = child.stdout.take().map(read_all);
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| read_stderr_lines(stderr, worker_id, self.progress.clone()));

        let exit = tokio::time::timeout(self.timeout, child.wait()).await;
        let exit_status: Option<ExitStatus> = match exit {
            Ok(status) => Some(status.context("Failed to wait for worker process")?),
            Err(_) => {
                if let Err(error) = child.kill().await {
                    warn!("Failed to kill worker {}: {}", worker_id, error);
                }
                None
            }
        };

        let stdout = join_reader(stdout_task).await;
        let stderr = join_reader(stderr_task).await;
        drop(config_file);

        let mut worker_result = WorkerResult {
            worker_id,
            symbols: config.job.symbols.clone(),
            stdout,
            stderr,
            return_code: exit_status.and_then(|status| status.code()),
            execution_time: Duration::ZERO,
            status: WorkerStatus::Succeeded,
            result: None,
        };

        let Some(exit_status) = exit_status else {
            worker_result.status = WorkerStatus::TimedOut {
                timeout_secs: self.timeout.as_secs(),
            };
            return Ok(worker_result);
        };

        if !exit_status.success() {
            let detail = last_diagnostic_line(&worker_result.stderr)
                .unwrap_or_else(|| "no diagnostics".to_string());
            worker_result.status = WorkerStatus::Failed {
                reason: EngineError::Process {
                    worker_id,
                    message: format!("exited with {}: {}", exit_status, detail),
                }
                .tagged_message(),
            };
            return Ok(worker_result);
        }

        match serde_json::from_str::<BacktestResult>(worker_result.stdout.trim()) {
            Ok(parsed) => {
                worker_result.result = Some(parsed);
                worker_result.status = WorkerStatus::Succeeded;
            }
            Err(error) => {
                worker_result.status = WorkerStatus::Failed {
                    reason: EngineError::Process {
                        worker_id,
                        message: format!("unparsable result on stdout: {}", error),
                    }
                    .tagged_message(),
                };
            }
        }
        Ok(worker_result)
    }
}

fn read_all<R>(mut reader: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Err(error) = reader.read_to_end(&mut buffer).await {
            warn!("Failed to read worker stdout: {}", error);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

/// Collects stderr while forwarding progress lines to the job board.
fn read_stderr_lines<R>(
    reader: R,
    worker_id: usize,
    progress: Option<JobProgress>,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut collected = String::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let (Some(progress), Some(event)) = (&progress, parse_progress_line(&line)) {
                        progress.record_event(worker_id, &event);
                    }
                    collected.push_str(&line);
                    collected.push('\n');
                }
                Ok(None) => break,
                Err(error) => {
                    warn!("Failed to read worker {} stderr: {}", worker_id, error);
                    break;
                }
            }
        }
        collected
    })
}

async fn join_reader(task: Option<JoinHandle<String>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(error)) => {
            warn!("Worker pipe reader failed: {}", error);
            String::new()
        }
        Err(_) => {
            // a grandchild may still hold the pipe open
            task.abort();
            String::new()
        }
    }
}

fn last_diagnostic_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && parse_progress_line(line).is_none())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_skip_progress_lines() {
        let stderr = "Error: invalid job\n{\"type\":\"progress\",\"progress_pct\":10.0,\"current_date\":\"2023-01-02\",\"status\":\"running\"}\n\n";
        assert_eq!(
            last_diagnostic_line(stderr),
            Some("Error: invalid job".to_string())
        );
        assert_eq!(last_diagnostic_line(""), None);
    }

    #[test]
    fn failure_reason_reflects_status() {
        let result = WorkerResult {
            worker_id: 3,
            symbols: vec!["AAA".to_string()],
            stdout: String::new(),
            stderr: String::new(),
            return_code: None,
            execution_time: Duration::from_secs(1),
            status: WorkerStatus::TimedOut { timeout_secs: 5 },
            result: None,
        };
        assert!(!result.is_success());
        assert_eq!(
            result.failure_reason(),
            Some("process: worker 3 timed out after 5s".to_string())
        );
    }
}
