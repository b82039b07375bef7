//! Coordination layer for DAK workflow dashboards
//!
//! Everything between the repository API client and a UI: polling of
//! workflow runs, feedback for user actions, permission gating, waiting
//! for organization SSO authorization and the managed status comment of a
//! pull request.
//!
//! ```text
//! ┌──────────────────────── WorkflowDashboard ────────────────────────┐
//! │ StatusPoller ─── ActionStateTracker ─── PermissionGate            │
//! └───────────────┬───────────────────────────────────────────────────┘
//!                 │ SSO-required errors
//!                 ▼
//!        CrossTabAuthWatcher ◀──── AuthChannel ────▶ other tabs
//! ```
//!
//! All components run on tokio and own their background tasks; dropping a
//! component stops them.

pub mod action_tracker;
pub mod auth_channel;
pub mod auth_watcher;
pub mod dashboard;
pub mod permission_gate;
pub mod run_summary;
pub mod status_comment;
pub mod status_poller;

#[cfg(test)]
mod test_support;

pub use action_tracker::{ActionPhase, ActionState, ActionStateTracker};
pub use auth_channel::{AuthChannel, AuthSignal, SignalKind, Subscription, TabId};
pub use auth_watcher::{
    CrossTabAuthWatcher, SamlPollingSession, SessionHandle, SessionStatus, WatchOptions,
    WatchStart,
};
pub use dashboard::{DashboardScope, WorkflowDashboard};
pub use permission_gate::{Evaluation, PermissionGate, PermissionScope, PermissionSet};
pub use run_summary::{OverallState, RunSummary};
pub use status_comment::{render_status_comment, STATUS_COMMENT_MARKER};
pub use status_poller::{IntervalTier, PollControl, PollUpdate, StatusPoller};
