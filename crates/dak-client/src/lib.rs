//! Repository hosting API client for DAK workflow coordination
//!
//! This crate provides the trait-based client the coordination layer talks
//! to, the octocrab implementation of it, and the typed error every call
//! returns.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │            RepositoryClient trait                │
//! │  - fetch_workflow_runs()                         │
//! │  - trigger_workflow() / approve_workflow_run()   │
//! │  - fetch_permission() / merge_pull_request()     │
//! │  - upsert_marked_comment()                       │
//! └─────────────────────────────────────────────────┘
//!                        │
//!        ┌───────────────┴───────────────┐
//!        ▼                               ▼
//! ┌─────────────────┐         ┌─────────────────────┐
//! │ OctocrabClient  │         │ test mocks          │
//! │ (direct API)    │         │                     │
//! └─────────────────┘         └─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use dak_client::{ApiContext, RepoRef};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let context = ApiContext::connect(None).await?;
//! let repo = RepoRef::new("WorldHealthOrganization", "smart-base");
//! let runs = context.client.fetch_workflow_runs(&repo, "main").await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod comment;
pub mod context;
pub mod error;
pub mod octocrab_client;
pub mod types;

pub use auth::{AuthProvider, SessionAuth, TokenResolver, TokenSource};
pub use client::{ApiResult, RepositoryClient};
pub use comment::{
    sanitize_text, sanitize_url, CommentMarker, CommentOutcome, MAX_COMMENT_CHARS,
    MAX_FIELD_CHARS,
};
pub use context::ApiContext;
pub use dak_config::DEFAULT_HOST;
pub use error::ApiError;
pub use octocrab_client::OctocrabClient;
pub use types::{
    Identity, MergeMethod, MergeOptions, MergeResult, PermissionKind, RepoAccess, RepoRef,
    ReviewEvent, RunConclusion, RunStatus, WorkflowRunStatus,
};

// Re-export octocrab so consumers don't need to depend on it directly
pub use octocrab;
