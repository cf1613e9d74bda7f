//! Per-run summary.

use std::fmt;
use std::time::Duration;

use super::Stage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Completed,
    /// Output already present and `--skip-existing` was given.
    Skipped,
    Failed(String),
}

/// What one stage did.
#[derive(Debug, Clone)]
pub struct StageSummary {
    pub stage: Stage,
    pub status: StageStatus,
    pub elapsed: Duration,
    /// Labelled counters, in display order.
    pub counts: Vec<(&'static str, usize)>,
    /// Items that failed, with the reason.
    pub failures: Vec<(String, String)>,
}

impl StageSummary {
    pub fn completed(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Completed,
            elapsed: Duration::ZERO,
            counts: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn skipped(stage: Stage) -> Self {
        Self {
            status: StageStatus::Skipped,
            ..Self::completed(stage)
        }
    }

    pub fn failed(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed(reason.into()),
            ..Self::completed(stage)
        }
    }

    pub fn count(mut self, label: &'static str, n: usize) -> Self {
        self.counts.push((label, n));
        self
    }

    pub fn with_failures(mut self, failures: Vec<(String, String)>) -> Self {
        self.failures = failures;
        self
    }

    pub fn get(&self, label: &str) -> Option<usize> {
        self.counts.iter().find(|(l, _)| *l == label).map(|(_, n)| *n)
    }
}

impl fmt::Display for StageSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match &self.status {
            StageStatus::Completed => "completed".to_string(),
            StageStatus::Skipped => "skipped".to_string(),
            StageStatus::Failed(reason) => format!("failed: {}", reason),
        };
        write!(f, "{} {} in {:.1}s", self.stage, status, self.elapsed.as_secs_f64())?;
        for (label, n) in &self.counts {
            write!(f, ", {} {}", n, label)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub stages: Vec<StageSummary>,
}

impl RunSummary {
    pub fn push(&mut self, summary: StageSummary) {
        self.stages.push(summary);
    }

    pub fn is_success(&self) -> bool {
        self.stages
            .iter()
            .all(|s| !matches!(s.status, StageStatus::Failed(_)))
    }

    pub fn failed_stage(&self) -> Option<&StageSummary> {
        self.stages
            .iter()
            .find(|s| matches!(s.status, StageStatus::Failed(_)))
    }

    pub fn total_elapsed(&self) -> Duration {
        self.stages.iter().map(|s| s.elapsed).sum()
    }
}
