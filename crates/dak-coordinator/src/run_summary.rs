use dak_client::{RunConclusion, WorkflowRunStatus};
use std::fmt;

/// Overall state of a branch's workflow runs
///
/// - Any failure → Failing
/// - Any queued, running or waiting run (and no failure) → Running
/// - All runs succeeded → Passing
/// - No runs, or runs without a usable conclusion → Unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallState {
    Passing,
    Failing,
    Running,
    Unknown,
}

/// Aggregated counts over one status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub state: OverallState,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub running: usize,
    /// Runs waiting for someone to approve them
    pub awaiting_approval: usize,
}

impl RunSummary {
    pub fn from_runs(runs: &[WorkflowRunStatus]) -> Self {
        let mut summary = Self {
            state: OverallState::Unknown,
            total: runs.len(),
            passed: 0,
            failed: 0,
            running: 0,
            awaiting_approval: 0,
        };

        for run in runs {
            if run.is_active() {
                summary.running += 1;
                if run.needs_approval() {
                    summary.awaiting_approval += 1;
                }
                continue;
            }
            match run.conclusion {
                Some(RunConclusion::Success) => summary.passed += 1,
                Some(RunConclusion::Failure) => summary.failed += 1,
                None => {}
            }
        }

        summary.state = if summary.failed > 0 {
            OverallState::Failing
        } else if summary.running > 0 {
            OverallState::Running
        } else if summary.total > 0 && summary.passed == summary.total {
            OverallState::Passing
        } else {
            OverallState::Unknown
        };
        summary
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {} passed, {} failed, {} running of {}",
            self.state, self.passed, self.failed, self.running, self.total
        )?;
        if self.awaiting_approval > 0 {
            write!(f, " ({} awaiting approval)", self.awaiting_approval)?;
        }
        Ok(())
    }
}
