//! Per-capability permission evaluation

use dak_client::{ApiError, ApiResult, Identity, PermissionKind, RepoRef, RepositoryClient};
use log::{debug, warn};
use std::sync::{Arc, Mutex, PoisonError};

/// What the signed-in account may do in the current scope
///
/// Every flag is false until proven otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermissionSet {
    pub can_comment: bool,
    pub can_trigger_workflows: bool,
    pub can_approve_workflows: bool,
    pub can_merge_pr: bool,
    pub can_review_pr: bool,
    pub can_manage_pr: bool,
}

impl PermissionSet {
    /// The all-false set
    pub fn denied() -> Self {
        Self::default()
    }

    pub fn allows(&self, kind: PermissionKind) -> bool {
        match kind {
            PermissionKind::Comment => self.can_comment,
            PermissionKind::TriggerWorkflows => self.can_trigger_workflows,
            PermissionKind::ApproveWorkflows => self.can_approve_workflows,
            PermissionKind::MergePullRequest => self.can_merge_pr,
            PermissionKind::ReviewPullRequest => self.can_review_pr,
            PermissionKind::ManagePullRequest => self.can_manage_pr,
        }
    }

    pub fn set(&mut self, kind: PermissionKind, allowed: bool) {
        let flag = match kind {
            PermissionKind::Comment => &mut self.can_comment,
            PermissionKind::TriggerWorkflows => &mut self.can_trigger_workflows,
            PermissionKind::ApproveWorkflows => &mut self.can_approve_workflows,
            PermissionKind::MergePullRequest => &mut self.can_merge_pr,
            PermissionKind::ReviewPullRequest => &mut self.can_review_pr,
            PermissionKind::ManagePullRequest => &mut self.can_manage_pr,
        };
        *flag = allowed;
    }
}

/// Inputs a permission set was computed for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionScope {
    pub identity: Option<Identity>,
    pub repo: RepoRef,
    pub pr: Option<u64>,
}

impl PermissionScope {
    pub fn new(identity: Option<Identity>, repo: RepoRef, pr: Option<u64>) -> Self {
        Self { identity, repo, pr }
    }
}

/// Outcome of one permission evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub permissions: PermissionSet,
    /// Set when a check was blocked by organization SSO; the permissions
    /// are then incomplete and were not remembered
    pub sso_required: Option<ApiError>,
}

impl Evaluation {
    fn complete(permissions: PermissionSet) -> Self {
        Self {
            permissions,
            sso_required: None,
        }
    }
}

/// Computes permission sets and remembers the last one
pub struct PermissionGate {
    client: Arc<dyn RepositoryClient>,
    last: Mutex<Option<(PermissionScope, PermissionSet)>>,
}

impl PermissionGate {
    pub fn new(client: Arc<dyn RepositoryClient>) -> Self {
        Self {
            client,
            last: Mutex::new(None),
        }
    }

    /// Evaluate every capability for a scope
    ///
    /// Without an identity no request is made. The six checks run
    /// concurrently and a failing check only clears its own flag. A check
    /// blocked by SSO is reported in the result, and such an evaluation is
    /// not remembered so the next call asks again.
    pub async fn evaluate(
        &self,
        identity: Option<&Identity>,
        repo: &RepoRef,
        pr: Option<u64>,
    ) -> Evaluation {
        let evaluation = match identity {
            None => {
                debug!("Not signed in, denying all permissions for {}", repo);
                Evaluation::complete(PermissionSet::denied())
            }
            Some(identity) => {
                debug!("Evaluating permissions of {} on {}", identity.login, repo);
                let results = tokio::join!(
                    self.check(PermissionKind::Comment, repo, pr),
                    self.check(PermissionKind::TriggerWorkflows, repo, pr),
                    self.check(PermissionKind::ApproveWorkflows, repo, pr),
                    self.check(PermissionKind::MergePullRequest, repo, pr),
                    self.check(PermissionKind::ReviewPullRequest, repo, pr),
                    self.check(PermissionKind::ManagePullRequest, repo, pr),
                );
                let results: [ApiResult<bool>; 6] =
                    [results.0, results.1, results.2, results.3, results.4, results.5];

                let mut evaluation = Evaluation::complete(PermissionSet::denied());
                for (kind, result) in PermissionKind::ALL.into_iter().zip(results) {
                    match result {
                        Ok(allowed) => evaluation.permissions.set(kind, allowed),
                        Err(e) => {
                            evaluation.sso_required.get_or_insert(e);
                        }
                    }
                }
                evaluation
            }
        };

        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if evaluation.sso_required.is_some() {
            debug!("Permissions for {} blocked by SSO, not caching", repo);
            *last = None;
        } else {
            let scope = PermissionScope::new(identity.cloned(), repo.clone(), pr);
            *last = Some((scope, evaluation.permissions));
        }
        evaluation
    }

    /// Permissions for a scope, evaluating only if the scope changed
    pub async fn permissions_for(&self, scope: &PermissionScope) -> Evaluation {
        if let Some(permissions) = self.cached(scope) {
            return Evaluation::complete(permissions);
        }
        self.evaluate(scope.identity.as_ref(), &scope.repo, scope.pr)
            .await
    }

    /// Last evaluation, if it was made for exactly this scope
    pub fn cached(&self, scope: &PermissionScope) -> Option<PermissionSet> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|(last_scope, _)| last_scope == scope)
            .map(|(_, permissions)| *permissions)
    }

    /// Forget the last evaluation, e.g. after the token was authorized for
    /// an organization
    pub fn invalidate(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Ok with the flag, or the SSO error that blocked the check
    async fn check(&self, kind: PermissionKind, repo: &RepoRef, pr: Option<u64>) -> ApiResult<bool> {
        match self.client.fetch_permission(kind, repo, pr).await {
            Ok(allowed) => Ok(allowed),
            Err(e) if e.is_sso_required() => {
                debug!("{:?} on {} needs SSO authorization", kind, repo);
                Err(e)
            }
            Err(e) if e.is_permission_denied() => {
                debug!("{:?} on {} denied: {}", kind, repo, e);
                Ok(false)
            }
            Err(e) => {
                warn!("Failed to check {:?} on {}: {}", kind, repo, e);
                Ok(false)
            }
        }
    }
}
