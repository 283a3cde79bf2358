use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::status::Severity;

/// Engine counters, snapshotted by [`JobManager::metrics`](crate::JobManager::metrics).
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobMetrics {
    /// Completed runs by job name.
    pub runs: HashMap<String, u64>,
    /// Runs that ended with an ERROR result, by job name.
    pub failures: HashMap<String, u64>,
    /// Runs that ended with a CANCEL result, by job name.
    pub cancellations: HashMap<String, u64>,
    /// Average body duration by job name.
    pub avg_duration: HashMap<String, Duration>,
    pub last_duration: HashMap<String, Duration>,
    pub last_run: HashMap<String, DateTime<Utc>>,
    pub jobs_scheduled: u64,
    pub jobs_completed: u64,
    pub deadlocks_resolved: u64,
    /// Listener callbacks that panicked and were absorbed.
    pub listener_panics: u64,
    pub workers_spawned: u64,
    pub workers_retired: u64,
}

impl JobMetrics {
    /// Record one execution of a job body.
    pub fn record_execution(&mut self, job_name: &str, duration: Duration, severity: Severity) {
        *self.runs.entry(job_name.to_string()).or_default() += 1;
        self.last_run.insert(job_name.to_string(), Utc::now());
        self.last_duration.insert(job_name.to_string(), duration);
        match severity {
            Severity::Error => *self.failures.entry(job_name.to_string()).or_default() += 1,
            Severity::Cancel => *self.cancellations.entry(job_name.to_string()).or_default() += 1,
            _ => {}
        }

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.runs[job_name];
        let prev_avg = self.avg_duration.get(job_name).copied().unwrap_or_default();
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            Duration::from_nanos((prev_nanos + (cur_nanos - prev_nanos) / count as f64) as u64)
        };
        self.avg_duration.insert(job_name.to_string(), new_avg);
    }
}
