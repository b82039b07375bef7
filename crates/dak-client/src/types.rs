//! Repository API data transfer objects
//!
//! These are the typed shapes the coordination layer works with. Raw REST
//! payloads never leave this crate; `octocrab_client` normalizes them into
//! the types below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Owner/name pair identifying a repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    /// User or organization owning the repository
    pub owner: String,
    /// Repository name
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse an `owner/name` slug
    pub fn parse(slug: &str) -> Option<Self> {
        let (owner, name) = slug.trim().split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Last known state of one CI run for a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRunStatus {
    /// Workflow the run belongs to
    pub workflow_id: u64,
    /// Run ID (None until a run exists)
    pub run_id: Option<u64>,
    /// Display name of the workflow
    pub name: String,
    /// Current status
    pub status: RunStatus,
    /// Conclusion, only present when `status` is `Completed`
    pub conclusion: Option<RunConclusion>,
    /// When the run was created
    pub created_at: DateTime<Utc>,
    /// URL to view the run
    pub url: Option<String>,
}

impl WorkflowRunStatus {
    /// Build a run status, dropping a conclusion the status does not allow
    pub fn new(
        workflow_id: u64,
        run_id: Option<u64>,
        name: impl Into<String>,
        status: RunStatus,
        conclusion: Option<RunConclusion>,
        created_at: DateTime<Utc>,
        url: Option<String>,
    ) -> Self {
        let conclusion = if status == RunStatus::Completed {
            conclusion
        } else {
            None
        };
        Self {
            workflow_id,
            run_id,
            name: name.into(),
            status,
            conclusion,
            created_at,
            url,
        }
    }

    /// Whether the run is still doing something
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Queued | RunStatus::InProgress | RunStatus::Waiting
        )
    }

    /// Whether the run is held back until someone approves it
    pub fn needs_approval(&self) -> bool {
        self.status == RunStatus::Waiting
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    /// Waiting for an approval or an environment gate
    Waiting,
    Completed,
    Unknown,
}

/// Conclusion of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
}

/// Capabilities checked by the permission gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    Comment,
    TriggerWorkflows,
    ApproveWorkflows,
    MergePullRequest,
    ReviewPullRequest,
    ManagePullRequest,
}

impl PermissionKind {
    pub const ALL: [PermissionKind; 6] = [
        PermissionKind::Comment,
        PermissionKind::TriggerWorkflows,
        PermissionKind::ApproveWorkflows,
        PermissionKind::MergePullRequest,
        PermissionKind::ReviewPullRequest,
        PermissionKind::ManagePullRequest,
    ];
}

/// Repository access level of the authenticated user
///
/// Mirrors the `permissions` object of the repository endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoAccess {
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub maintain: bool,
    #[serde(default)]
    pub push: bool,
    #[serde(default)]
    pub triage: bool,
    #[serde(default)]
    pub pull: bool,
}

impl RepoAccess {
    /// Whether this access level grants the given capability
    pub fn grants(&self, kind: PermissionKind) -> bool {
        let write = self.admin || self.maintain || self.push;
        match kind {
            PermissionKind::Comment | PermissionKind::ReviewPullRequest => {
                write || self.triage || self.pull
            }
            PermissionKind::TriggerWorkflows
            | PermissionKind::ApproveWorkflows
            | PermissionKind::MergePullRequest => write,
            PermissionKind::ManagePullRequest => write || self.triage,
        }
    }
}

/// Merge method for pull requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Create a merge commit
    #[default]
    Merge,
    /// Squash all commits into one
    Squash,
    /// Rebase commits onto the base branch
    Rebase,
}

/// Options for merging a pull request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    pub method: MergeMethod,
    pub commit_title: Option<String>,
    pub commit_message: Option<String>,
}

/// Result of a merge operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    /// Whether the merge was successful
    pub merged: bool,
    /// Commit SHA of the merge commit (if successful)
    pub sha: Option<String>,
    /// Message from the merge operation
    pub message: String,
}

/// Review event type for PR reviews
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
    Comment,
}

/// The authenticated account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub login: String,
}

impl Identity {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_ref_parse() {
        let repo = RepoRef::parse("WorldHealthOrganization/smart-immunizations").unwrap();
        assert_eq!(repo.owner, "WorldHealthOrganization");
        assert_eq!(repo.name, "smart-immunizations");
        assert_eq!(repo.to_string(), "WorldHealthOrganization/smart-immunizations");

        assert!(RepoRef::parse("no-slash").is_none());
        assert!(RepoRef::parse("/repo").is_none());
        assert!(RepoRef::parse("owner/").is_none());
        assert!(RepoRef::parse("a/b/c").is_none());
    }

    #[test]
    fn test_conclusion_only_kept_when_completed() {
        let running = WorkflowRunStatus::new(
            1,
            Some(10),
            "build",
            RunStatus::InProgress,
            Some(RunConclusion::Failure),
            Utc::now(),
            None,
        );
        assert_eq!(running.conclusion, None);
        assert!(running.is_active());

        let done = WorkflowRunStatus::new(
            1,
            Some(10),
            "build",
            RunStatus::Completed,
            Some(RunConclusion::Success),
            Utc::now(),
            None,
        );
        assert_eq!(done.conclusion, Some(RunConclusion::Success));
        assert!(!done.is_active());
    }

    #[test]
    fn test_repo_access_grants() {
        let read = RepoAccess {
            pull: true,
            ..Default::default()
        };
        assert!(read.grants(PermissionKind::Comment));
        assert!(read.grants(PermissionKind::ReviewPullRequest));
        assert!(!read.grants(PermissionKind::MergePullRequest));
        assert!(!read.grants(PermissionKind::ManagePullRequest));

        let triage = RepoAccess {
            triage: true,
            pull: true,
            ..Default::default()
        };
        assert!(triage.grants(PermissionKind::ManagePullRequest));
        assert!(!triage.grants(PermissionKind::TriggerWorkflows));

        let write = RepoAccess {
            push: true,
            ..Default::default()
        };
        for kind in PermissionKind::ALL {
            assert!(write.grants(kind), "push access should grant {:?}", kind);
        }

        let none = RepoAccess::default();
        for kind in PermissionKind::ALL {
            assert!(!none.grants(kind));
        }
    }

    #[test]
    fn test_review_event_serde() {
        let json = serde_json::to_string(&ReviewEvent::RequestChanges).unwrap();
        assert_eq!(json, "\"REQUEST_CHANGES\"");
    }
}
