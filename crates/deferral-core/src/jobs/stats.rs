//! Aggregated scheduler statistics and the status snapshot

use crate::jobs::job::JobId;
use serde::{Deserialize, Serialize};

/// Counters maintained across the scheduler's lifetime
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Jobs ever admitted
    pub total_jobs: u64,

    /// Jobs that completed successfully
    pub completed_jobs: u64,

    /// Jobs that exhausted their attempts
    pub failed_jobs: u64,

    /// Jobs canceled before completion
    pub canceled_jobs: u64,

    /// Run-loop time spent in completed jobs
    pub total_time_ms: u64,

    /// Mean run-loop time per completed job
    pub avg_time_ms: u64,
}

impl SchedulerStats {
    pub(crate) fn record_completion(&mut self, duration_ms: u64) {
        self.completed_jobs += 1;
        self.total_time_ms += duration_ms;
        self.avg_time_ms = self.total_time_ms / self.completed_jobs;
    }
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Whether the pump is admitting work
    pub is_running: bool,

    /// Queued job ids in priority order
    pub pending: Vec<JobId>,

    /// Currently executing job ids
    pub running: Vec<JobId>,

    /// Jobs archived after successful completion
    pub completed: usize,

    /// Lifetime counters
    pub stats: SchedulerStats,
}

impl SchedulerStatus {
    /// Format as human-readable
    pub fn format(&self) -> String {
        let mut lines = vec![format!(
            "Scheduler ({}):",
            if self.is_running { "running" } else { "stopped" }
        )];

        lines.push(format!("  Pending: {}", self.pending.len()));
        lines.push(format!("  Running: {}", self.running.len()));
        lines.push(format!("  Completed: {}", self.completed));
        lines.push(format!(
            "  Totals: jobs={}, completed={}, failed={}, canceled={}",
            self.stats.total_jobs,
            self.stats.completed_jobs,
            self.stats.failed_jobs,
            self.stats.canceled_jobs
        ));
        lines.push(format!(
            "  Timing: total={}ms, avg={}ms",
            self.stats.total_time_ms, self.stats.avg_time_ms
        ));

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_completion_updates_average() {
        let mut stats = SchedulerStats::default();
        stats.record_completion(10);
        stats.record_completion(30);

        assert_eq!(stats.completed_jobs, 2);
        assert_eq!(stats.total_time_ms, 40);
        assert_eq!(stats.avg_time_ms, 20);
    }

    #[test]
    fn test_status_format_mentions_counts() {
        let status = SchedulerStatus {
            is_running: true,
            pending: vec![JobId::from("job-2")],
            running: vec![JobId::from("job-1")],
            completed: 3,
            stats: SchedulerStats {
                total_jobs: 5,
                completed_jobs: 3,
                failed_jobs: 1,
                canceled_jobs: 0,
                total_time_ms: 60,
                avg_time_ms: 20,
            },
        };

        let formatted = status.format();
        assert!(formatted.contains("running"));
        assert!(formatted.contains("Pending: 1"));
        assert!(formatted.contains("completed=3"));
        assert!(formatted.contains("avg=20ms"));
    }
}
