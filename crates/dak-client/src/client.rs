//! Repository client trait
//!
//! This module defines the `RepositoryClient` trait the coordination layer
//! is written against. The octocrab-backed implementation lives in
//! `octocrab_client`; tests substitute hand-written mocks.

use crate::comment::{CommentMarker, CommentOutcome};
use crate::error::ApiError;
use crate::types::{
    Identity, MergeOptions, MergeResult, PermissionKind, RepoRef, ReviewEvent, WorkflowRunStatus,
};
use async_trait::async_trait;

/// Result type of every repository API call
pub type ApiResult<T> = Result<T, ApiError>;

/// Repository hosting API client
///
/// Implementations must be `Send + Sync` so a single client can be shared
/// by pollers, permission checks and user actions running as separate tasks.
///
/// # Example
///
/// ```rust,ignore
/// use dak_client::{RepoRef, RepositoryClient};
///
/// async fn latest_runs(client: &dyn RepositoryClient) -> dak_client::ApiResult<usize> {
///     let repo = RepoRef::new("WorldHealthOrganization", "smart-base");
///     Ok(client.fetch_workflow_runs(&repo, "main").await?.len())
/// }
/// ```
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Fetch the latest run of every workflow for a branch
    ///
    /// # Arguments
    ///
    /// * `repo` - Repository to query
    /// * `branch` - Branch the runs were triggered for
    ///
    /// # Returns
    ///
    /// One entry per workflow, newest run first.
    async fn fetch_workflow_runs(
        &self,
        repo: &RepoRef,
        branch: &str,
    ) -> ApiResult<Vec<WorkflowRunStatus>>;

    /// Dispatch a workflow on a branch
    ///
    /// Returns `true` when the dispatch was accepted.
    async fn trigger_workflow(
        &self,
        repo: &RepoRef,
        workflow_id: u64,
        branch: &str,
    ) -> ApiResult<bool>;

    /// Approve a run waiting for approval (e.g. from a fork contributor)
    async fn approve_workflow_run(&self, repo: &RepoRef, run_id: u64) -> ApiResult<bool>;

    /// Re-run a completed workflow run
    async fn rerun_workflow_run(&self, repo: &RepoRef, run_id: u64) -> ApiResult<bool>;

    /// Check whether the authenticated account holds a capability
    ///
    /// # Arguments
    ///
    /// * `kind` - Capability to check
    /// * `repo` - Repository the capability applies to
    /// * `pr` - Pull request the capability applies to, if any
    async fn fetch_permission(
        &self,
        kind: PermissionKind,
        repo: &RepoRef,
        pr: Option<u64>,
    ) -> ApiResult<bool>;

    /// Merge a pull request
    async fn merge_pull_request(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        options: &MergeOptions,
    ) -> ApiResult<MergeResult>;

    /// Submit a review (approve, request changes or comment)
    async fn submit_review(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        event: ReviewEvent,
        body: Option<&str>,
    ) -> ApiResult<()>;

    /// Create or edit the pull request comment carrying `marker`
    ///
    /// `body` is rendered behind the marker line; an existing comment with
    /// the marker is edited, otherwise a new one is posted.
    async fn upsert_marked_comment(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        marker: &CommentMarker,
        body: &str,
    ) -> ApiResult<CommentOutcome>;

    /// Resolve the account the client authenticates as
    async fn fetch_authenticated_user(&self) -> ApiResult<Identity>;
}
