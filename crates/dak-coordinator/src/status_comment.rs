//! Markdown for the managed workflow status comment of a pull request

use crate::dashboard::DashboardScope;
use crate::run_summary::{OverallState, RunSummary};
use chrono::{DateTime, Utc};
use dak_client::{sanitize_text, sanitize_url, RunConclusion, WorkflowRunStatus};
use std::fmt::Write;

/// Marker name of the status comment
pub const STATUS_COMMENT_MARKER: &str = "dak-workflow-status";

const MAX_BRANCH_CHARS: usize = 100;
const MAX_NAME_CHARS: usize = 200;

fn state_icon(state: OverallState) -> &'static str {
    match state {
        OverallState::Passing => "🟢",
        OverallState::Failing => "🔴",
        OverallState::Running => "🟡",
        OverallState::Unknown => "⚪",
    }
}

fn run_outcome(run: &WorkflowRunStatus) -> String {
    if run.needs_approval() {
        return "awaiting approval".to_string();
    }
    match run.conclusion {
        Some(RunConclusion::Success) => "✅ success".to_string(),
        Some(RunConclusion::Failure) => "❌ failure".to_string(),
        None => format!("{:?}", run.status).to_lowercase(),
    }
}

/// Body of the status comment (without the marker line)
///
/// Branch and workflow names are escaped and links only point into `host`.
pub fn render_status_comment(
    scope: &DashboardScope,
    runs: &[WorkflowRunStatus],
    host: &str,
    updated_at: DateTime<Utc>,
) -> String {
    let summary = RunSummary::from_runs(runs);
    let branch = sanitize_text(&scope.branch, MAX_BRANCH_CHARS);

    let mut body = String::new();
    let _ = writeln!(body, "## Workflow status: {:?}", summary.state);
    let _ = writeln!(body);
    let _ = writeln!(body, "**Branch:** `{}`", branch);
    let _ = writeln!(body, "**Status:** {} {}", state_icon(summary.state), summary);
    let _ = writeln!(body);

    if runs.is_empty() {
        let _ = writeln!(body, "No workflow runs yet.");
    } else {
        let _ = writeln!(body, "| Workflow | Result |");
        let _ = writeln!(body, "| --- | --- |");
        for run in runs {
            let name = sanitize_text(&run.name, MAX_NAME_CHARS).replace('|', "\\|");
            let link = run.url.as_deref().and_then(|url| sanitize_url(url, host));
            match link {
                Some(url) => {
                    let _ = writeln!(body, "| [{}]({}) | {} |", name, url, run_outcome(run));
                }
                None => {
                    let _ = writeln!(body, "| {} | {} |", name, run_outcome(run));
                }
            }
        }
    }

    let _ = writeln!(body);
    let _ = writeln!(
        body,
        "_Updated {}. This comment is edited in place on every update._",
        updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    body
}
