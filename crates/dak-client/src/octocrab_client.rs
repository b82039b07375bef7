//! Octocrab-based repository client
//!
//! Direct implementation of the `RepositoryClient` trait using the octocrab
//! library. Responses are fetched as raw REST payloads and normalized into
//! the crate's own types before they leave this module.

use crate::client::{ApiResult, RepositoryClient};
use crate::comment::{CommentMarker, CommentOutcome};
use crate::error::ApiError;
use crate::types::{
    Identity, MergeMethod, MergeOptions, MergeResult, PermissionKind, RepoAccess, RepoRef,
    ReviewEvent, RunConclusion, RunStatus, WorkflowRunStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Runs fetched per branch; enough to cover the latest run of every workflow
const RUNS_PER_PAGE: &str = "50";

/// Comments scanned for a marker; managed comments are posted early
const COMMENTS_PER_PAGE: &str = "100";

/// How long lookups shared by the permission checks are reused
const LOOKUP_TTL: Duration = Duration::from_secs(10);

/// Keyed lookups reused for a short time
///
/// The lock is held across the fetch, so concurrent callers asking for the
/// same data wait for the first request instead of sending their own. The
/// fetch future is dropped unpolled on a hit. Failures are not remembered.
#[derive(Debug)]
struct Memo<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K, V> Memo<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_fetch<Fut>(&self, key: K, fetch: Fut) -> ApiResult<V>
    where
        Fut: Future<Output = ApiResult<V>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some((fetched_at, value)) = entries.get(&key) {
            if fetched_at.elapsed() < self.ttl {
                return Ok(value.clone());
            }
        }
        let value = fetch.await?;
        entries.insert(key, (Instant::now(), value.clone()));
        Ok(value)
    }
}

#[derive(Debug)]
struct Lookups {
    access: Memo<RepoRef, RepoAccess>,
    authors: Memo<(RepoRef, u64), String>,
    login: Memo<(), String>,
}

impl Default for Lookups {
    fn default() -> Self {
        Self {
            access: Memo::new(LOOKUP_TTL),
            authors: Memo::new(LOOKUP_TTL),
            login: Memo::new(LOOKUP_TTL),
        }
    }
}

/// Direct repository API client using octocrab
#[derive(Debug, Clone)]
pub struct OctocrabClient {
    octocrab: Arc<Octocrab>,
    base_url: String,
    lookups: Arc<Lookups>,
}

impl OctocrabClient {
    /// Create a new client for public GitHub
    pub fn new(octocrab: Arc<Octocrab>) -> Self {
        Self::with_base_url(octocrab, "https://api.github.com".to_string())
    }

    /// Create a new client with an explicit API base URL (GitHub Enterprise)
    pub fn with_base_url(octocrab: Arc<Octocrab>, base_url: String) -> Self {
        Self {
            octocrab,
            base_url,
            lookups: Arc::new(Lookups::default()),
        }
    }

    /// Get a reference to the underlying octocrab instance
    pub fn octocrab(&self) -> &Octocrab {
        &self.octocrab
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST to an endpoint that answers without a JSON body we care about
    async fn post_no_content<B: Serialize + ?Sized>(
        &self,
        repo: &RepoRef,
        route: String,
        body: Option<&B>,
    ) -> ApiResult<()> {
        let response = self
            .octocrab
            ._post(route, body)
            .await
            .map_err(|e| org_error(repo, e))?;
        octocrab::map_github_error(response)
            .await
            .map_err(|e| org_error(repo, e))?;
        Ok(())
    }

    async fn fetch_repo_access(&self, repo: &RepoRef) -> ApiResult<RepoAccess> {
        self.lookups
            .access
            .get_or_fetch(repo.clone(), self.request_repo_access(repo))
            .await
    }

    async fn fetch_pull_request_author(&self, repo: &RepoRef, pr_number: u64) -> ApiResult<String> {
        self.lookups
            .authors
            .get_or_fetch(
                (repo.clone(), pr_number),
                self.request_pull_request_author(repo, pr_number),
            )
            .await
    }

    async fn own_login(&self) -> ApiResult<String> {
        let identity = self.fetch_authenticated_user();
        self.lookups
            .login
            .get_or_fetch((), async move { identity.await.map(|user| user.login) })
            .await
    }

    async fn request_repo_access(&self, repo: &RepoRef) -> ApiResult<RepoAccess> {
        let route = format!("/repos/{}/{}", repo.owner, repo.name);
        let raw: RawRepository = self
            .octocrab
            .get(route, None::<&()>)
            .await
            .map_err(|e| org_error(repo, e))?;
        Ok(raw.permissions.unwrap_or_default())
    }

    async fn request_pull_request_author(
        &self,
        repo: &RepoRef,
        pr_number: u64,
    ) -> ApiResult<String> {
        let route = format!("/repos/{}/{}/pulls/{}", repo.owner, repo.name, pr_number);
        let raw: RawPullRequest = self
            .octocrab
            .get(route, None::<&()>)
            .await
            .map_err(|e| org_error(repo, e))?;
        Ok(raw.user.map(|u| u.login).unwrap_or_default())
    }
}

#[async_trait]
impl RepositoryClient for OctocrabClient {
    async fn fetch_workflow_runs(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> ApiResult<Vec<WorkflowRunStatus>> {
        debug!("Fetching workflow runs for {} @ {}", repo, branch);

        let route = format!("/repos/{}/{}/actions/runs", repo.owner, repo.name);
        let params = [("branch", branch), ("per_page", RUNS_PER_PAGE)];
        let raw: RawRunList = self
            .octocrab
            .get(route, Some(&params))
            .await
            .map_err(|e| org_error(repo, e))?;

        let runs = normalize_runs(raw.workflow_runs);
        debug!(
            "Fetched {} workflow runs for {} @ {}",
            runs.len(),
            repo,
            branch
        );
        Ok(runs)
    }

    async fn trigger_workflow(
        &self,
        repo: &RepoRef,
        workflow_id: u64,
        branch: &str,
    ) -> ApiResult<bool> {
        debug!(
            "Dispatching workflow {} on {} @ {}",
            workflow_id, repo, branch
        );

        #[derive(Serialize)]
        struct DispatchBody<'a> {
            #[serde(rename = "ref")]
            git_ref: &'a str,
        }

        let route = format!(
            "/repos/{}/{}/actions/workflows/{}/dispatches",
            repo.owner, repo.name, workflow_id
        );
        self.post_no_content(repo, route, Some(&DispatchBody { git_ref: branch }))
            .await?;
        Ok(true)
    }

    async fn approve_workflow_run(&self, repo: &RepoRef, run_id: u64) -> ApiResult<bool> {
        debug!("Approving workflow run {} in {}", run_id, repo);
        let route = format!(
            "/repos/{}/{}/actions/runs/{}/approve",
            repo.owner, repo.name, run_id
        );
        self.post_no_content(repo, route, None::<&()>).await?;
        Ok(true)
    }

    async fn rerun_workflow_run(&self, repo: &RepoRef, run_id: u64) -> ApiResult<bool> {
        debug!("Re-running workflow run {} in {}", run_id, repo);
        let route = format!(
            "/repos/{}/{}/actions/runs/{}/rerun",
            repo.owner, repo.name, run_id
        );
        self.post_no_content(repo, route, None::<&()>).await?;
        Ok(true)
    }

    async fn fetch_permission(
        &self,
        kind: PermissionKind,
        repo: &RepoRef,
        pr: Option<u64>,
    ) -> ApiResult<bool> {
        debug!("Checking {:?} permission on {} (PR {:?})", kind, repo, pr);

        let access = self.fetch_repo_access(repo).await?;
        let granted = access.grants(kind);

        match (kind, pr) {
            // Authors cannot review their own pull request
            (PermissionKind::ReviewPullRequest, Some(pr_number)) if granted => {
                let author = self.fetch_pull_request_author(repo, pr_number).await?;
                Ok(author != self.own_login().await?)
            }
            // Authors can always manage (edit, close) their own pull request
            (PermissionKind::ManagePullRequest, Some(pr_number)) if !granted => {
                let author = self.fetch_pull_request_author(repo, pr_number).await?;
                Ok(author == self.own_login().await?)
            }
            _ => Ok(granted),
        }
    }

    async fn merge_pull_request(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        options: &MergeOptions,
    ) -> ApiResult<MergeResult> {
        debug!(
            "Merging PR #{} in {} ({:?})",
            pr_number, repo, options.method
        );

        #[derive(Serialize)]
        struct MergeBody<'a> {
            merge_method: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            commit_title: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            commit_message: Option<&'a str>,
        }

        let body = MergeBody {
            merge_method: merge_method_param(options.method),
            commit_title: options.commit_title.as_deref(),
            commit_message: options.commit_message.as_deref(),
        };
        let route = format!(
            "/repos/{}/{}/pulls/{}/merge",
            repo.owner, repo.name, pr_number
        );
        let raw: RawMergeResponse = self
            .octocrab
            .put(route, Some(&body))
            .await
            .map_err(|e| org_error(repo, e))?;

        Ok(MergeResult {
            merged: raw.merged,
            sha: raw.sha,
            message: raw.message.unwrap_or_default(),
        })
    }

    async fn submit_review(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        event: ReviewEvent,
        body: Option<&str>,
    ) -> ApiResult<()> {
        debug!("Submitting {:?} review on PR #{} in {}", event, pr_number, repo);

        #[derive(Serialize)]
        struct ReviewBody<'a> {
            event: ReviewEvent,
            #[serde(skip_serializing_if = "Option::is_none")]
            body: Option<&'a str>,
        }

        let route = format!(
            "/repos/{}/{}/pulls/{}/reviews",
            repo.owner, repo.name, pr_number
        );
        let _: serde_json::Value = self
            .octocrab
            .post(route, Some(&ReviewBody { event, body }))
            .await
            .map_err(|e| org_error(repo, e))?;
        Ok(())
    }

    async fn upsert_marked_comment(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        marker: &CommentMarker,
        body: &str,
    ) -> ApiResult<CommentOutcome> {
        #[derive(Serialize)]
        struct CommentBody<'a> {
            body: &'a str,
        }

        let rendered = marker.render(body);
        let list_route = format!(
            "/repos/{}/{}/issues/{}/comments",
            repo.owner, repo.name, pr_number
        );
        let params = [("per_page", COMMENTS_PER_PAGE)];
        let existing: Vec<RawComment> = self
            .octocrab
            .get(&list_route, Some(&params))
            .await
            .map_err(|e| org_error(repo, e))?;

        match find_marked_comment(&existing, marker) {
            Some(id) => {
                debug!("Updating {} comment {} on PR #{} in {}", marker, id, pr_number, repo);
                let route = format!("/repos/{}/{}/issues/comments/{}", repo.owner, repo.name, id);
                let _: RawComment = self
                    .octocrab
                    .patch(route, Some(&CommentBody { body: &rendered }))
                    .await
                    .map_err(|e| org_error(repo, e))?;
                Ok(CommentOutcome::Updated { id })
            }
            None => {
                debug!("Posting {} comment on PR #{} in {}", marker, pr_number, repo);
                let created: RawComment = self
                    .octocrab
                    .post(list_route, Some(&CommentBody { body: &rendered }))
                    .await
                    .map_err(|e| org_error(repo, e))?;
                Ok(CommentOutcome::Created { id: created.id })
            }
        }
    }

    async fn fetch_authenticated_user(&self) -> ApiResult<Identity> {
        let raw: RawUser = self.octocrab.get("/user", None::<&()>).await?;
        Ok(Identity::new(raw.login))
    }
}

fn org_error(repo: &RepoRef, err: octocrab::Error) -> ApiError {
    ApiError::from(err).for_organization(&repo.owner)
}

fn merge_method_param(method: MergeMethod) -> &'static str {
    match method {
        MergeMethod::Merge => "merge",
        MergeMethod::Squash => "squash",
        MergeMethod::Rebase => "rebase",
    }
}

#[derive(Debug, Deserialize)]
struct RawRunList {
    #[serde(default)]
    workflow_runs: Vec<RawWorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct RawWorkflowRun {
    id: u64,
    workflow_id: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRepository {
    #[serde(default)]
    permissions: Option<RepoAccess>,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    #[serde(default)]
    user: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
}

/// Oldest comment carrying the marker
fn find_marked_comment(comments: &[RawComment], marker: &CommentMarker) -> Option<u64> {
    comments
        .iter()
        .find(|comment| comment.body.as_deref().is_some_and(|body| marker.matches(body)))
        .map(|comment| comment.id)
}

#[derive(Debug, Deserialize)]
struct RawMergeResponse {
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Keep the newest run of every workflow
///
/// The runs endpoint lists newest first, so the first run seen per workflow
/// wins.
fn normalize_runs(raw: Vec<RawWorkflowRun>) -> Vec<WorkflowRunStatus> {
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|run| seen.insert(run.workflow_id))
        .map(convert_run)
        .collect()
}

/// Convert a raw run into our run status
fn convert_run(run: RawWorkflowRun) -> WorkflowRunStatus {
    let mut status = convert_status(run.status.as_deref());
    let mut conclusion = run.conclusion.as_deref().and_then(convert_conclusion);

    // Fork runs held for approval complete with `action_required`
    if run.conclusion.as_deref() == Some("action_required") {
        status = RunStatus::Waiting;
        conclusion = None;
    }

    WorkflowRunStatus::new(
        run.workflow_id,
        Some(run.id),
        run.name.unwrap_or_default(),
        status,
        conclusion,
        run.created_at,
        run.html_url,
    )
}

/// Convert a status string from the API to our enum
fn convert_status(status: Option<&str>) -> RunStatus {
    match status.map(str::to_lowercase).as_deref() {
        Some("queued") | Some("requested") | Some("pending") => RunStatus::Queued,
        Some("in_progress") => RunStatus::InProgress,
        Some("waiting") | Some("action_required") => RunStatus::Waiting,
        Some("completed") => RunStatus::Completed,
        _ => RunStatus::Unknown,
    }
}

/// Convert a conclusion string from the API to our enum
fn convert_conclusion(conclusion: &str) -> Option<RunConclusion> {
    match conclusion.to_lowercase().as_str() {
        "success" | "neutral" | "skipped" => Some(RunConclusion::Success),
        "failure" | "cancelled" | "timed_out" | "startup_failure" | "stale" => {
            Some(RunConclusion::Failure)
        }
        _ => None,
    }
}
