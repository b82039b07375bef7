//! Mock repository client for unit tests

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dak_client::{
    ApiError, ApiResult, CommentMarker, CommentOutcome, Identity, MergeOptions, MergeResult,
    PermissionKind, RepoRef, RepositoryClient, ReviewEvent, RunConclusion, RunStatus,
    WorkflowRunStatus,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    runs: HashMap<String, Vec<WorkflowRunStatus>>,
    runs_error: Option<ApiError>,
    permission_errors: HashMap<PermissionKind, ApiError>,
    denied: Vec<PermissionKind>,
    action_errors: VecDeque<ApiError>,
    calls: Vec<String>,
    /// Managed comments by marker name: (id, rendered body)
    comments: HashMap<String, (u64, String)>,
    next_comment_id: u64,
}

/// Configurable in-memory client that records every call
#[derive(Default)]
pub(crate) struct MockClient {
    state: Mutex<MockState>,
    run_fetches: AtomicUsize,
    permission_checks: AtomicUsize,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(self, branch: &str, runs: Vec<WorkflowRunStatus>) -> Self {
        self.set_runs(branch, runs);
        self
    }

    pub fn set_runs(&self, branch: &str, runs: Vec<WorkflowRunStatus>) {
        self.state.lock().unwrap().runs.insert(branch.to_string(), runs);
    }

    pub fn fail_runs(&self, error: Option<ApiError>) {
        self.state.lock().unwrap().runs_error = error;
    }

    pub fn fail_permission(self, kind: PermissionKind, error: ApiError) -> Self {
        self.state.lock().unwrap().permission_errors.insert(kind, error);
        self
    }

    /// Make every permission check fail with `error`
    pub fn fail_all_permissions(&self, error: ApiError) {
        let mut state = self.state.lock().unwrap();
        for kind in PermissionKind::ALL {
            state.permission_errors.insert(kind, error.clone());
        }
    }

    pub fn clear_permission_errors(&self) {
        self.state.lock().unwrap().permission_errors.clear();
    }

    pub fn comment_body(&self, marker: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .comments
            .get(marker)
            .map(|(_, body)| body.clone())
    }

    pub fn deny(self, kind: PermissionKind) -> Self {
        self.state.lock().unwrap().denied.push(kind);
        self
    }

    /// Queue an error for the next action call; actions succeed once drained
    pub fn push_action_error(&self, error: ApiError) {
        self.state.lock().unwrap().action_errors.push_back(error);
    }

    pub fn run_fetches(&self) -> usize {
        self.run_fetches.load(Ordering::SeqCst)
    }

    pub fn permission_checks(&self) -> usize {
        self.permission_checks.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn action(&self, call: String) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.action_errors.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RepositoryClient for MockClient {
    async fn fetch_workflow_runs(
        &self,
        _repo: &RepoRef,
        branch: &str,
    ) -> ApiResult<Vec<WorkflowRunStatus>> {
        self.run_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.runs_error {
            return Err(error.clone());
        }
        Ok(state.runs.get(branch).cloned().unwrap_or_default())
    }

    async fn trigger_workflow(
        &self,
        _repo: &RepoRef,
        workflow_id: u64,
        branch: &str,
    ) -> ApiResult<bool> {
        self.action(format!("trigger {} {}", workflow_id, branch))
            .map(|_| true)
    }

    async fn approve_workflow_run(&self, _repo: &RepoRef, run_id: u64) -> ApiResult<bool> {
        self.action(format!("approve {}", run_id)).map(|_| true)
    }

    async fn rerun_workflow_run(&self, _repo: &RepoRef, run_id: u64) -> ApiResult<bool> {
        self.action(format!("rerun {}", run_id)).map(|_| true)
    }

    async fn fetch_permission(
        &self,
        kind: PermissionKind,
        _repo: &RepoRef,
        _pr: Option<u64>,
    ) -> ApiResult<bool> {
        self.permission_checks.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if let Some(error) = state.permission_errors.get(&kind) {
            return Err(error.clone());
        }
        Ok(!state.denied.contains(&kind))
    }

    async fn merge_pull_request(
        &self,
        _repo: &RepoRef,
        pr_number: u64,
        _options: &MergeOptions,
    ) -> ApiResult<MergeResult> {
        self.action(format!("merge {}", pr_number))?;
        Ok(MergeResult {
            merged: true,
            sha: Some("deadbeef".to_string()),
            message: "Pull Request successfully merged".to_string(),
        })
    }

    async fn submit_review(
        &self,
        _repo: &RepoRef,
        pr_number: u64,
        event: ReviewEvent,
        _body: Option<&str>,
    ) -> ApiResult<()> {
        self.action(format!("review {} {:?}", pr_number, event))
    }

    async fn upsert_marked_comment(
        &self,
        _repo: &RepoRef,
        pr_number: u64,
        marker: &CommentMarker,
        body: &str,
    ) -> ApiResult<CommentOutcome> {
        self.action(format!("comment {} {}", pr_number, marker))?;
        let mut state = self.state.lock().unwrap();
        let rendered = marker.render(body);
        if let Some((id, existing)) = state.comments.get_mut(marker.name()) {
            *existing = rendered;
            return Ok(CommentOutcome::Updated { id: *id });
        }
        state.next_comment_id += 1;
        let id = state.next_comment_id;
        state
            .comments
            .insert(marker.name().to_string(), (id, rendered));
        Ok(CommentOutcome::Created { id })
    }

    async fn fetch_authenticated_user(&self) -> ApiResult<Identity> {
        Ok(Identity::new("octocat"))
    }
}

pub(crate) fn repo() -> RepoRef {
    RepoRef::new("WorldHealthOrganization", "smart-base")
}

pub(crate) fn run(
    workflow_id: u64,
    status: RunStatus,
    conclusion: Option<RunConclusion>,
) -> WorkflowRunStatus {
    WorkflowRunStatus::new(
        workflow_id,
        Some(workflow_id * 100),
        format!("workflow {}", workflow_id),
        status,
        conclusion,
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        None,
    )
}

pub(crate) fn sso_error() -> ApiError {
    ApiError::from_status(
        403,
        "Resource protected by organization SAML enforcement. You must grant your token access.",
    )
}
