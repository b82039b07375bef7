//! One repository/branch/pull request view
//!
//! `WorkflowDashboard` owns the status poller, the action tracker and the
//! permission gate for its scope, and hands SSO failures to the tab's auth
//! watcher. Dropping the dashboard stops everything it started.

use crate::action_tracker::{ActionState, ActionStateTracker};
use crate::auth_channel::{SignalKind, Subscription};
use crate::auth_watcher::{CrossTabAuthWatcher, WatchStart};
use crate::permission_gate::{PermissionGate, PermissionScope, PermissionSet};
use crate::run_summary::RunSummary;
use crate::status_comment::{render_status_comment, STATUS_COMMENT_MARKER};
use crate::status_poller::{IntervalTier, PollUpdate, StatusPoller};
use chrono::Utc;
use dak_client::{
    ApiContext, ApiError, ApiResult, CommentMarker, CommentOutcome, MergeOptions, MergeResult,
    PermissionKind, RepoRef, RepositoryClient, ReviewEvent, WorkflowRunStatus,
};
use dak_config::CoordinatorConfig;
use log::{debug, info, warn};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// What a dashboard shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardScope {
    pub repo: RepoRef,
    pub branch: String,
    /// Pull request of the branch, if one is open
    pub pr: Option<u64>,
}

impl DashboardScope {
    pub fn new(repo: RepoRef, branch: impl Into<String>, pr: Option<u64>) -> Self {
        Self {
            repo,
            branch: branch.into(),
            pr,
        }
    }
}

pub struct WorkflowDashboard {
    context: ApiContext,
    host: String,
    scope: DashboardScope,
    poller: StatusPoller<Vec<WorkflowRunStatus>>,
    actions: Arc<ActionStateTracker>,
    gate: Arc<PermissionGate>,
    permissions: Mutex<PermissionSet>,
    auth_watcher: Arc<CrossTabAuthWatcher>,
    last_error: Arc<Mutex<Option<ApiError>>>,
    _authorized: Subscription,
}

impl WorkflowDashboard {
    /// Evaluate permissions for the scope and start polling its branch
    pub async fn open(
        context: ApiContext,
        config: CoordinatorConfig,
        auth_watcher: Arc<CrossTabAuthWatcher>,
        scope: DashboardScope,
    ) -> Self {
        info!(
            "Opening dashboard for {}@{} (PR: {:?})",
            scope.repo, scope.branch, scope.pr
        );
        let gate = Arc::new(PermissionGate::new(Arc::clone(&context.client)));

        // Authorization can widen what the token sees, so re-check on demand
        let stale_gate = Arc::downgrade(&gate);
        let organization = scope.repo.owner.clone();
        let authorized = auth_watcher
            .channel()
            .on(SignalKind::Authorized, move |signal| {
                if signal.organization() != organization {
                    return;
                }
                if let Some(gate) = stale_gate.upgrade() {
                    debug!("{} authorized, permissions will be re-evaluated", organization);
                    gate.invalidate();
                }
            });

        let mut dashboard = Self {
            poller: StatusPoller::new(config.polling.clone()),
            actions: Arc::new(ActionStateTracker::new(config.actions.clone())),
            gate,
            permissions: Mutex::new(PermissionSet::denied()),
            auth_watcher,
            last_error: Arc::new(Mutex::new(None)),
            host: config.host.clone(),
            context,
            scope,
            _authorized: authorized,
        };
        dashboard.refresh_permissions().await;
        dashboard.start_polling();
        dashboard
    }

    pub fn scope(&self) -> &DashboardScope {
        &self.scope
    }

    pub fn permissions(&self) -> PermissionSet {
        *self.permissions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn auth_watcher(&self) -> &Arc<CrossTabAuthWatcher> {
        &self.auth_watcher
    }

    /// Latest workflow runs of the branch, None before the first fetch
    pub fn latest_runs(&self) -> Option<Vec<WorkflowRunStatus>> {
        self.poller.latest()
    }

    pub fn subscribe_runs(&self) -> watch::Receiver<Option<Vec<WorkflowRunStatus>>> {
        self.poller.subscribe()
    }

    pub fn summary(&self) -> Option<RunSummary> {
        self.poller
            .latest()
            .map(|runs| RunSummary::from_runs(&runs))
    }

    /// Error of the most recent poll, cleared by the next successful one
    pub fn last_error(&self) -> Option<ApiError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn action_state(&self, entity_id: &str) -> Option<ActionState> {
        self.actions.get(entity_id)
    }

    pub fn action_states(&self) -> Vec<ActionState> {
        self.actions.snapshot()
    }

    /// Fetch runs now
    pub fn refresh(&self) -> bool {
        self.poller.refresh_now()
    }

    /// Recompute permissions if identity, repository or PR changed, or if
    /// the last evaluation was blocked by SSO or invalidated
    ///
    /// A check blocked by SSO starts a wait for the organization.
    pub async fn refresh_permissions(&self) -> PermissionSet {
        let scope = PermissionScope::new(
            self.context.auth.identity(),
            self.scope.repo.clone(),
            self.scope.pr,
        );
        let evaluation = self.gate.permissions_for(&scope).await;
        debug!("Permissions for {}: {:?}", self.scope.repo, evaluation.permissions);

        if let Some(error) = &evaluation.sso_required {
            let retry = self.bind(|client, repo| async move {
                client
                    .fetch_permission(PermissionKind::Comment, &repo, None)
                    .await
            });
            if let Some(start) = self.auth_watcher.handle_error(&self.scope.repo, error, retry) {
                log_watch_start(&self.scope.repo, &start);
            }
        }

        *self.permissions.lock().unwrap_or_else(PoisonError::into_inner) = evaluation.permissions;
        evaluation.permissions
    }

    /// Start a new SSO wait after the previous one timed out
    ///
    /// Retries the run fetch of this dashboard.
    pub fn retry_authorization(&self) -> WatchStart {
        let branch = self.scope.branch.clone();
        let fetch = self.bind(move |client, repo| {
            let branch = branch.clone();
            async move { client.fetch_workflow_runs(&repo, &branch).await }
        });
        let repository = self.scope.repo.to_string();
        let start =
            self.auth_watcher
                .retry_authorization(&self.scope.repo.owner, Some(&repository), fetch);
        log_watch_start(&self.scope.repo, &start);
        start
    }

    /// Point the dashboard at another branch
    ///
    /// The previous branch's runs are discarded before polling restarts.
    pub fn switch_branch(&mut self, branch: impl Into<String>) {
        let branch = branch.into();
        if branch == self.scope.branch {
            return;
        }
        info!("Switching {} from {} to {}", self.scope.repo, self.scope.branch, branch);
        self.poller.stop();
        self.poller.clear_snapshot();
        self.scope.branch = branch;
        self.start_polling();
    }

    /// Point the dashboard at another pull request (or none)
    pub async fn set_pull_request(&mut self, pr: Option<u64>) -> PermissionSet {
        self.scope.pr = pr;
        self.refresh_permissions().await
    }

    pub fn close(&mut self) {
        self.poller.stop();
    }

    pub async fn trigger_workflow(&self, workflow_id: u64) -> ApiResult<bool> {
        let branch = self.scope.branch.clone();
        let action = self.bind(move |client, repo| {
            let branch = branch.clone();
            async move { client.trigger_workflow(&repo, workflow_id, &branch).await }
        });
        self.run_action(
            format!("workflow-{}", workflow_id),
            PermissionKind::TriggerWorkflows,
            |_| "Workflow run requested".to_string(),
            action,
        )
        .await
    }

    pub async fn approve_run(&self, run_id: u64) -> ApiResult<bool> {
        let action = self.bind(move |client, repo| async move {
            client.approve_workflow_run(&repo, run_id).await
        });
        self.run_action(
            format!("run-{}", run_id),
            PermissionKind::ApproveWorkflows,
            |_| "Run approved".to_string(),
            action,
        )
        .await
    }

    pub async fn rerun_run(&self, run_id: u64) -> ApiResult<bool> {
        let action = self.bind(move |client, repo| async move {
            client.rerun_workflow_run(&repo, run_id).await
        });
        self.run_action(
            format!("run-{}", run_id),
            PermissionKind::TriggerWorkflows,
            |_| "Re-run requested".to_string(),
            action,
        )
        .await
    }

    pub async fn merge(&self, options: MergeOptions) -> ApiResult<MergeResult> {
        let pr = self.require_pull_request()?;
        let action = self.bind(move |client, repo| {
            let options = options.clone();
            async move { client.merge_pull_request(&repo, pr, &options).await }
        });
        self.run_action(
            format!("pr-{}", pr),
            PermissionKind::MergePullRequest,
            |result: &MergeResult| result.message.clone(),
            action,
        )
        .await
    }

    pub async fn review(&self, event: ReviewEvent, body: Option<String>) -> ApiResult<()> {
        let pr = self.require_pull_request()?;
        let action = self.bind(move |client, repo| {
            let body = body.clone();
            async move {
                client
                    .submit_review(&repo, pr, event, body.as_deref())
                    .await
            }
        });
        self.run_action(
            format!("pr-{}", pr),
            PermissionKind::ReviewPullRequest,
            |_| "Review submitted".to_string(),
            action,
        )
        .await
    }

    /// Create or edit the pull request comment carrying `marker`
    pub async fn comment(&self, marker: &str, body: impl Into<String>) -> ApiResult<CommentOutcome> {
        let pr = self.require_pull_request()?;
        let marker = CommentMarker::new(marker)?;
        let entity_id = format!("comment-{}-{}", pr, marker);
        let body = body.into();
        let action = self.bind(move |client, repo| {
            let marker = marker.clone();
            let body = body.clone();
            async move {
                client
                    .upsert_marked_comment(&repo, pr, &marker, &body)
                    .await
            }
        });
        self.run_action(
            entity_id,
            PermissionKind::Comment,
            |outcome: &CommentOutcome| outcome.to_string(),
            action,
        )
        .await
    }

    /// Publish the latest runs as the pull request's status comment
    pub async fn publish_status_comment(&self) -> ApiResult<CommentOutcome> {
        let runs = self.latest_runs().ok_or_else(|| {
            ApiError::Unprocessable(format!(
                "No workflow runs fetched yet for {}@{}",
                self.scope.repo, self.scope.branch
            ))
        })?;
        let body = render_status_comment(&self.scope, &runs, &self.host, Utc::now());
        self.comment(STATUS_COMMENT_MARKER, body).await
    }

    fn start_polling(&mut self) {
        let branch = self.scope.branch.clone();
        let fetch = self.bind(move |client, repo| {
            let branch = branch.clone();
            async move { client.fetch_workflow_runs(&repo, &branch).await }
        });

        let watcher = Arc::clone(&self.auth_watcher);
        let last_error = Arc::clone(&self.last_error);
        let repo = self.scope.repo.clone();
        let retry = fetch.clone();
        let on_update = move |update: PollUpdate<Vec<WorkflowRunStatus>>| {
            let error = match update {
                PollUpdate::Snapshot(runs) => {
                    debug!("{} workflow runs for {}", runs.len(), repo);
                    None
                }
                PollUpdate::Failed(error) => {
                    if let Some(start) = watcher.handle_error(&repo, &error, retry.clone()) {
                        log_watch_start(&repo, &start);
                    }
                    Some(error)
                }
            };
            *last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
        };

        self.poller.start(fetch, on_update);
    }

    /// Run a user action with permission check, feedback and follow-up
    ///
    /// On success the branch is polled right away and then at the intensive
    /// cadence, so the run it caused shows up quickly. An SSO failure starts
    /// a wait that retries the action itself; when such a retry goes
    /// through, the action's state and the polling follow-up are updated as
    /// if the first attempt had succeeded.
    async fn run_action<R, F, Fut>(
        &self,
        entity_id: String,
        required: PermissionKind,
        success_message: fn(&R) -> String,
        action: F,
    ) -> ApiResult<R>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        let permissions = self.refresh_permissions().await;
        if !permissions.allows(required) {
            let error = ApiError::Forbidden(format!(
                "{:?} is not permitted on {}",
                required, self.scope.repo
            ));
            debug!("Refusing {}: {}", entity_id, error);
            self.actions.resolve(&entity_id, false, error.user_message());
            return Err(error);
        }

        let result = self
            .actions
            .track(&entity_id, success_message, action())
            .await;

        match &result {
            Ok(_) => {
                self.poller.set_interval_tier(IntervalTier::Intensive);
                self.poller.refresh_now();
            }
            Err(error) => {
                let retry = self.follow_up_retry(entity_id, success_message, action);
                if let Some(start) = self.auth_watcher.handle_error(&self.scope.repo, error, retry)
                {
                    log_watch_start(&self.scope.repo, &start);
                }
            }
        }
        result
    }

    /// Wrap an action for the SSO wait so its outcome still reaches the
    /// action state and the poller
    fn follow_up_retry<R, F, Fut>(
        &self,
        entity_id: String,
        success_message: fn(&R) -> String,
        action: F,
    ) -> impl Fn() -> std::pin::Pin<Box<dyn Future<Output = ApiResult<R>> + Send>>
           + Send
           + Sync
           + 'static
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        let actions = Arc::downgrade(&self.actions);
        let poller = self.poller.control();
        move || {
            let attempt = action();
            let actions = actions.clone();
            let poller = poller.clone();
            let entity_id = entity_id.clone();
            Box::pin(async move {
                let result = attempt.await;
                let Some(actions) = actions.upgrade() else {
                    return result;
                };
                match &result {
                    Ok(value) => {
                        info!("{} went through after SSO authorization", entity_id);
                        actions.resolve(&entity_id, true, success_message(value));
                        if let Some(poller) = &poller {
                            poller.set_interval_tier(IntervalTier::Intensive);
                            poller.refresh_now();
                        }
                    }
                    Err(e) if !e.is_sso_required() => {
                        warn!("{} failed after SSO authorization: {}", entity_id, e);
                        actions.resolve(&entity_id, false, e.user_message());
                    }
                    Err(_) => {}
                }
                result
            })
        }
    }

    /// Turn a client call into a repeatable closure bound to this scope
    fn bind<F, Fut>(&self, call: F) -> impl Fn() -> Fut + Clone + Send + Sync + 'static
    where
        F: Fn(Arc<dyn RepositoryClient>, RepoRef) -> Fut + Clone + Send + Sync + 'static,
    {
        let client = Arc::clone(&self.context.client);
        let repo = self.scope.repo.clone();
        move || call(Arc::clone(&client), repo.clone())
    }

    fn require_pull_request(&self) -> ApiResult<u64> {
        self.scope.pr.ok_or_else(|| {
            ApiError::Unprocessable(format!(
                "No pull request is open for {}@{}",
                self.scope.repo, self.scope.branch
            ))
        })
    }
}

fn log_watch_start(repo: &RepoRef, start: &WatchStart) {
    match start {
        WatchStart::Started(handle) => info!("{}", handle.session().message()),
        WatchStart::AlreadyWatching(_) => {
            debug!("Already waiting for SSO authorization for {}", repo)
        }
        WatchStart::CoolingDown { remaining } => debug!(
            "SSO prompt for {} dismissed, retrying in {:?} at the earliest",
            repo, remaining
        ),
        WatchStart::TimedOut => debug!(
            "SSO wait for {} timed out, not retrying until asked to",
            repo
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_tracker::ActionPhase;
    use crate::auth_channel::{AuthChannel, AuthSignal, TabId};
    use crate::auth_watcher::SessionStatus;
    use crate::run_summary::OverallState;
    use crate::test_support::{repo, run, sso_error, MockClient};
    use dak_client::{AuthProvider, Identity, RunConclusion, RunStatus, SessionAuth};
    use std::time::Duration;
    use tokio::time::sleep;

    const ORG: &str = "WorldHealthOrganization";

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn signed_in() -> Arc<dyn AuthProvider> {
        Arc::new(SessionAuth::signed_in(Identity::new("octocat")))
    }

    async fn open(
        client: Arc<MockClient>,
        auth: Arc<dyn AuthProvider>,
        pr: Option<u64>,
    ) -> WorkflowDashboard {
        let config = CoordinatorConfig::default();
        let watcher = Arc::new(CrossTabAuthWatcher::new(
            AuthChannel::new(),
            config.sso.clone(),
        ));
        let context = ApiContext::new(client, auth);
        let dashboard =
            WorkflowDashboard::open(context, config, watcher, DashboardScope::new(repo(), "main", pr))
                .await;
        settle().await;
        dashboard
    }

    fn main_runs() -> Vec<WorkflowRunStatus> {
        vec![
            run(1, RunStatus::Completed, Some(RunConclusion::Success)),
            run(2, RunStatus::InProgress, None),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_polls_and_evaluates_permissions() {
        let client = Arc::new(MockClient::new().with_runs("main", main_runs()));
        let dashboard = open(client.clone(), signed_in(), Some(5)).await;

        assert_eq!(dashboard.latest_runs(), Some(main_runs()));
        assert_eq!(dashboard.summary().map(|s| s.state), Some(OverallState::Running));
        assert!(dashboard.permissions().can_trigger_workflows);
        assert_eq!(client.permission_checks(), 6);
        assert_eq!(client.run_fetches(), 1);

        sleep(Duration::from_secs(31)).await;
        assert_eq!(client.run_fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthenticated_dashboard_refuses_actions() {
        let client = Arc::new(MockClient::new());
        let dashboard = open(client.clone(), Arc::new(SessionAuth::anonymous()), Some(5)).await;

        assert_eq!(dashboard.permissions(), PermissionSet::denied());
        assert_eq!(client.permission_checks(), 0);

        let result = dashboard.trigger_workflow(7).await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
        assert_eq!(
            dashboard.action_state("workflow-7").map(|s| s.phase),
            Some(ActionPhase::Failed)
        );
        assert!(client.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_permission_refuses_only_that_action() {
        let client = Arc::new(MockClient::new().deny(PermissionKind::ApproveWorkflows));
        let dashboard = open(client.clone(), signed_in(), None).await;

        assert!(dashboard.approve_run(300).await.is_err());
        assert!(dashboard.rerun_run(300).await.unwrap());
        assert_eq!(client.calls(), vec!["rerun 300".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_action_polls_intensively() {
        let client = Arc::new(MockClient::new().with_runs("main", main_runs()));
        let dashboard = open(client.clone(), signed_in(), None).await;
        assert_eq!(client.run_fetches(), 1);

        assert!(dashboard.trigger_workflow(1).await.unwrap());
        let state = dashboard.action_state("workflow-1").unwrap();
        assert_eq!(state.phase, ActionPhase::Succeeded);
        assert_eq!(client.calls(), vec!["trigger 1 main".to_string()]);

        settle().await;
        assert_eq!(client.run_fetches(), 2);

        sleep(Duration::from_millis(5_500)).await;
        assert_eq!(client.run_fetches(), 3);

        sleep(Duration::from_secs(10)).await;
        assert!(dashboard.action_state("workflow-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_action_reports_message() {
        let client = Arc::new(MockClient::new());
        let dashboard = open(client.clone(), signed_in(), Some(9)).await;
        client.push_action_error(ApiError::from_status(405, "Pull Request is not mergeable"));

        assert!(dashboard.merge(MergeOptions::default()).await.is_err());
        let state = dashboard.action_state("pr-9").unwrap();
        assert_eq!(state.phase, ActionPhase::Failed);
        assert_eq!(state.message, "Pull Request is not mergeable");
        assert!(dashboard.auth_watcher().active_session(ORG).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_request_actions_need_a_pull_request() {
        let client = Arc::new(MockClient::new());
        let mut dashboard = open(client.clone(), signed_in(), None).await;

        assert!(matches!(
            dashboard.review(ReviewEvent::Approve, None).await,
            Err(ApiError::Unprocessable(_))
        ));

        dashboard.set_pull_request(Some(4)).await;
        assert_eq!(client.permission_checks(), 12);
        dashboard
            .review(ReviewEvent::Approve, Some("LGTM".to_string()))
            .await
            .unwrap();
        assert_eq!(
            dashboard.action_state("pr-4").map(|s| s.message),
            Some("Review submitted".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sso_failure_retries_action_until_authorized() {
        let client = Arc::new(MockClient::new());
        let dashboard = open(client.clone(), signed_in(), None).await;
        client.push_action_error(sso_error());

        let error = dashboard.trigger_workflow(3).await.unwrap_err();
        assert!(error.is_sso_required());
        let session = dashboard.auth_watcher().active_session(ORG).unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);
        assert!(dashboard.auth_watcher().should_show_prompt(ORG));

        assert_eq!(
            dashboard.action_state("workflow-3").map(|s| s.phase),
            Some(ActionPhase::Failed)
        );
        assert_eq!(client.run_fetches(), 1);

        sleep(Duration::from_millis(5_100)).await;
        assert!(dashboard.auth_watcher().active_session(ORG).is_none());
        assert_eq!(
            client.calls(),
            vec!["trigger 3 main".to_string(), "trigger 3 main".to_string()]
        );

        // The retried trigger counts as the action's result
        let state = dashboard.action_state("workflow-3").unwrap();
        assert_eq!(state.phase, ActionPhase::Succeeded);
        assert_eq!(state.message, "Workflow run requested");
        assert_eq!(client.run_fetches(), 2);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(client.run_fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_action_failing_otherwise_reports_that_error() {
        let client = Arc::new(MockClient::new());
        let dashboard = open(client.clone(), signed_in(), Some(8)).await;
        client.push_action_error(sso_error());
        client.push_action_error(ApiError::from_status(405, "Pull Request is not mergeable"));

        assert!(dashboard.merge(MergeOptions::default()).await.is_err());
        sleep(Duration::from_millis(5_100)).await;

        let state = dashboard.action_state("pr-8").unwrap();
        assert_eq!(state.phase, ActionPhase::Failed);
        assert_eq!(state.message, "Pull Request is not mergeable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sso_blocked_permissions_recover_after_authorization() {
        let client = Arc::new(MockClient::new());
        client.fail_all_permissions(sso_error());
        client.fail_runs(Some(sso_error()));
        let dashboard = open(client.clone(), signed_in(), None).await;

        assert_eq!(dashboard.permissions(), PermissionSet::denied());
        assert!(dashboard.auth_watcher().active_session(ORG).is_some());

        client.clear_permission_errors();
        client.fail_runs(None);
        sleep(Duration::from_millis(5_100)).await;
        assert!(dashboard.auth_watcher().active_session(ORG).is_none());

        assert!(dashboard.trigger_workflow(3).await.unwrap());
        assert!(dashboard.permissions().can_trigger_workflows);
        assert_eq!(client.calls(), vec!["trigger 3 main".to_string()]);
        assert!(dashboard.refresh_permissions().await.can_merge_pr);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authorization_signal_invalidates_permissions() {
        let client = Arc::new(MockClient::new().deny(PermissionKind::TriggerWorkflows));
        let dashboard = open(client.clone(), signed_in(), None).await;
        assert_eq!(client.permission_checks(), 6);

        dashboard.refresh_permissions().await;
        assert_eq!(client.permission_checks(), 6);

        dashboard.auth_watcher().channel().broadcast(AuthSignal::Authorized {
            organization: ORG.to_string(),
            origin: TabId::next(),
        });
        settle().await;
        dashboard.refresh_permissions().await;
        assert_eq!(client.permission_checks(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_wait_is_not_restarted_by_polling() {
        let client = Arc::new(MockClient::new());
        client.fail_runs(Some(sso_error()));
        let dashboard = open(client.clone(), signed_in(), None).await;
        assert!(dashboard.auth_watcher().active_session(ORG).is_some());

        sleep(Duration::from_secs(301)).await;
        assert!(dashboard.auth_watcher().active_session(ORG).is_none());
        assert!(dashboard.auth_watcher().is_timed_out(ORG));

        // Two more failing polls at 330s and 360s
        sleep(Duration::from_secs(60)).await;
        assert!(dashboard.auth_watcher().active_session(ORG).is_none());
        assert!(dashboard.last_error().is_some_and(|e| e.is_sso_required()));

        client.fail_runs(None);
        let mut handle = match dashboard.retry_authorization() {
            WatchStart::Started(handle) => handle,
            other => panic!("expected a new wait, got {:?}", other),
        };
        assert_eq!(handle.finished().await.status, SessionStatus::Authorized);
        assert!(!dashboard.auth_watcher().is_timed_out(ORG));
    }

    #[tokio::test(start_paused = true)]
    async fn test_comment_creates_then_updates() {
        let client = Arc::new(MockClient::new());
        let dashboard = open(client.clone(), signed_in(), Some(12)).await;

        let first = dashboard.comment("dak-compliance-report", "All checks passed").await;
        assert!(matches!(first, Ok(CommentOutcome::Created { .. })));
        let second = dashboard.comment("dak-compliance-report", "2 issues").await;
        assert_eq!(second.unwrap(), CommentOutcome::Updated { id: first.unwrap().id() });

        assert_eq!(
            client.comment_body("dak-compliance-report").as_deref(),
            Some("<!-- dak-compliance-report -->\n2 issues")
        );
        assert_eq!(
            dashboard.action_state("comment-12-dak-compliance-report").map(|s| s.message),
            Some("Comment updated".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_comment_is_gated_and_needs_a_pull_request() {
        let client = Arc::new(MockClient::new().deny(PermissionKind::Comment));
        let mut dashboard = open(client.clone(), signed_in(), None).await;

        assert!(matches!(
            dashboard.comment("dak-workflow-status", "hi").await,
            Err(ApiError::Unprocessable(_))
        ));

        dashboard.set_pull_request(Some(12)).await;
        assert!(matches!(
            dashboard.comment("dak-workflow-status", "hi").await,
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            dashboard.comment("not a marker -->", "hi").await,
            Err(ApiError::Unprocessable(_))
        ));
        assert!(client.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_status_comment() {
        let client = Arc::new(MockClient::new().with_runs("main", main_runs()));
        let dashboard = open(client.clone(), signed_in(), Some(12)).await;

        dashboard.publish_status_comment().await.unwrap();

        let body = client.comment_body(STATUS_COMMENT_MARKER).unwrap();
        assert!(body.starts_with("<!-- dak-workflow-status -->\n## Workflow status: Running"));
        assert!(body.contains("| workflow 1 | ✅ success |"));
        assert_eq!(client.calls(), vec!["comment 12 dak-workflow-status".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sso_failure_while_polling_starts_wait() {
        let client = Arc::new(MockClient::new());
        client.fail_runs(Some(sso_error()));
        let dashboard = open(client.clone(), signed_in(), None).await;

        assert!(dashboard.latest_runs().is_none());
        assert!(dashboard.last_error().is_some_and(|e| e.is_sso_required()));
        assert!(dashboard.auth_watcher().active_session(ORG).is_some());

        client.fail_runs(None);
        sleep(Duration::from_millis(5_100)).await;
        assert!(dashboard.auth_watcher().active_session(ORG).is_none());

        dashboard.refresh();
        settle().await;
        assert!(dashboard.last_error().is_none());
        assert_eq!(dashboard.latest_runs(), Some(Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_branch_discards_previous_runs() {
        let client = Arc::new(
            MockClient::new()
                .with_runs("main", main_runs())
                .with_runs("feature", vec![run(9, RunStatus::Queued, None)]),
        );
        let mut dashboard = open(client.clone(), signed_in(), None).await;
        let mut runs = dashboard.subscribe_runs();
        runs.borrow_and_update();

        dashboard.switch_branch("feature");
        assert_eq!(dashboard.latest_runs(), None);
        assert_eq!(dashboard.scope().branch, "feature");

        runs.wait_for(|runs| runs.is_some()).await.unwrap();
        assert_eq!(
            dashboard.latest_runs(),
            Some(vec![run(9, RunStatus::Queued, None)])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_polling() {
        let client = Arc::new(MockClient::new());
        let dashboard = open(client.clone(), signed_in(), None).await;
        assert_eq!(client.run_fetches(), 1);

        drop(dashboard);
        sleep(Duration::from_secs(120)).await;
        assert_eq!(client.run_fetches(), 1);
    }
}
