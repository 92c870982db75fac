use chrono::NaiveDate;
use crossbeam_channel::Sender;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// One line of the progress stream: `{"type":"progress","progress_pct":..,"current_date":..,"status":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "progress")]
pub struct ProgressEvent {
    pub progress_pct: f64,
    pub current_date: NaiveDate,
    pub status: RunStatus,
}

pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    serde_json::from_str(line.trim()).ok()
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

pub struct LogProgressSink {
    label: String,
}

impl LogProgressSink {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressSink for LogProgressSink {
    fn emit(&self, event: &ProgressEvent) {
        info!(
            "{}: {:.1}% ({}, {:?})",
            self.label, event.progress_pct, event.current_date, event.status
        );
    }
}

/// Writes one JSON object per line. Write failures are logged and dropped.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.writer.into_inner().ok()
    }
}

impl<W: Write + Send> ProgressSink for JsonLinesSink<W> {
    fn emit(&self, event: &ProgressEvent) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut writer) = self.writer.lock() {
            if let Err(error) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
                warn!("Failed to write progress event: {}", error);
            }
        }
    }
}

/// Forwards events over a channel without blocking the simulation; a full channel drops them.
pub struct ChannelProgressSink {
    sender: Sender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: &ProgressEvent) {
        let _ = self.sender.try_send(event.clone());
    }
}

/// Emits progress at most once per `interval_pct` step, plus a final event.
pub struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    interval_pct: f64,
    next_threshold: f64,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: &'a dyn ProgressSink, interval_pct: f64) -> Self {
        let interval_pct = if interval_pct.is_finite() && interval_pct > 0.0 {
            interval_pct.min(100.0)
        } else {
            5.0
        };
        Self {
            sink,
            interval_pct,
            next_threshold: interval_pct,
        }
    }

    /// `completed` of `total` trading days are done as of `date`.
    pub fn day_completed(&mut self, completed: usize, total: usize, date: NaiveDate) {
        if total == 0 {
            return;
        }
        let pct = completed as f64 * 100.0 / total as f64;
        if pct + 1e-9 < self.next_threshold || completed >= total {
            return;
        }
        while self.next_threshold <= pct + 1e-9 {
            self.next_threshold += self.interval_pct;
        }
        self.sink.emit(&ProgressEvent {
            progress_pct: pct,
            current_date: date,
            status: RunStatus::Running,
        });
    }

    pub fn finish(&mut self, status: RunStatus, progress_pct: f64, date: NaiveDate) {
        self.sink.emit(&ProgressEvent {
            progress_pct,
            current_date: date,
            status,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Shared view of a multi-worker job, updated from the spawner's stderr readers.
#[derive(Clone, Default)]
pub struct JobProgress {
    inner: Arc<Mutex<JobProgressData>>,
}

#[derive(Default)]
struct JobProgressData {
    phase: String,
    workers: BTreeMap<usize, (f64, WorkerPhase)>,
}

#[derive(Clone, Debug)]
pub struct JobProgressSnapshot {
    pub phase: String,
    pub workers_total: usize,
    pub workers_finished: usize,
    pub workers_failed: usize,
    pub overall_pct: f64,
}

impl JobProgress {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(JobProgressData {
                phase: "Initializing".to_string(),
                ..Default::default()
            })),
        }
    }

    pub fn set_phase<S: Into<String>>(&self, phase: S) {
        if let Ok(mut data) = self.inner.lock() {
            data.phase = phase.into();
        }
    }

    pub fn register_worker(&self, worker_id: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.workers.insert(worker_id, (0.0, WorkerPhase::Pending));
        }
    }

    pub fn record_event(&self, worker_id: usize, event: &ProgressEvent) {
        if let Ok(mut data) = self.inner.lock() {
            let entry = data
                .workers
                .entry(worker_id)
                .or_insert((0.0, WorkerPhase::Pending));
            entry.0 = event.progress_pct.clamp(0.0, 100.0);
            if entry.1 == WorkerPhase::Pending {
                entry.1 = WorkerPhase::Running;
            }
        }
    }

    pub fn finish_worker(&self, worker_id: usize, succeeded: bool) {
        if let Ok(mut data) = self.inner.lock() {
            let phase = if succeeded {
                WorkerPhase::Succeeded
            } else {
                WorkerPhase::Failed
            };
            data.workers.insert(worker_id, (100.0, phase));
        }
    }

    pub fn snapshot(&self) -> JobProgressSnapshot {
        if let Ok(data) = self.inner.lock() {
            let workers_total = data.workers.len();
            let finished = |phase: WorkerPhase| {
                matches!(phase, WorkerPhase::Succeeded | WorkerPhase::Failed)
            };
            let overall_pct = if workers_total == 0 {
                0.0
            } else {
                data.workers.values().map(|(pct, _)| pct).sum::<f64>() / workers_total as f64
            };
            JobProgressSnapshot {
                phase: data.phase.clone(),
                workers_total,
                workers_finished: data.workers.values().filter(|(_, p)| finished(*p)).count(),
                workers_failed: data
                    .workers
                    .values()
                    .filter(|(_, p)| *p == WorkerPhase::Failed)
                    .count(),
                overall_pct,
            }
        } else {
            JobProgressSnapshot {
                phase: "Status unavailable".to_string(),
                workers_total: 0,
                workers_finished: 0,
                workers_failed: 0,
                overall_pct: 0.0,
            }
        }
    }
}
