mod logger;

use anyhow::{Context, Result};
use clap::Parser;
use dak_client::{ApiContext, PermissionKind, RepoRef, WorkflowRunStatus, DEFAULT_HOST};
use dak_config::CoordinatorConfig;
use dak_coordinator::{
    AuthChannel, AuthSignal, CrossTabAuthWatcher, DashboardScope, PermissionSet, RunSummary,
    WorkflowDashboard,
};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(
    name = "dak-watch",
    version,
    about = "Watch workflow runs and permissions of a DAK repository branch"
)]
struct Cli {
    /// Repository as <owner>/<repo>
    repo: String,
    /// Branch whose workflow runs to watch
    branch: String,
    /// Pull request opened from the branch
    #[arg(long)]
    pr: Option<u64>,
    /// Repository host, e.g. a GitHub Enterprise server
    #[arg(long)]
    host: Option<String>,
    /// Config file to use instead of the default locations
    #[arg(long)]
    config: Option<PathBuf>,
    /// Fetch the runs once and exit
    #[arg(long)]
    once: bool,
    /// Keep a status comment on the pull request up to date (needs --pr)
    #[arg(long, requires = "pr")]
    status_comment: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_file = logger::init()?;
    info!("Starting dak-watch, logging to {}", log_file.display());

    let repo = RepoRef::parse(&cli.repo)
        .with_context(|| format!("Expected <owner>/<repo>, got '{}'", cli.repo))?;

    let mut config = match &cli.config {
        Some(path) => CoordinatorConfig::from_path(path)?,
        None => CoordinatorConfig::load(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }

    let host = (config.host != DEFAULT_HOST).then(|| config.host.clone());
    let context = ApiContext::connect(host.as_deref()).await?;

    if cli.once {
        let runs = context
            .client
            .fetch_workflow_runs(&repo, &cli.branch)
            .await
            .map_err(|e| anyhow::anyhow!(e.user_message()))
            .with_context(|| format!("Failed to fetch workflow runs of {}@{}", repo, cli.branch))?;
        print_runs(&runs);
        return Ok(());
    }

    let channel = AuthChannel::new();
    let watcher = Arc::new(CrossTabAuthWatcher::new(channel, config.sso.clone()));

    let organization = repo.owner.clone();
    let scope = DashboardScope::new(repo, cli.branch, cli.pr);
    let mut dashboard = WorkflowDashboard::open(context, config, watcher, scope).await;
    print_permissions(&dashboard.permissions());

    watch(&dashboard, &organization, cli.status_comment).await;

    dashboard.close();
    info!("Exiting dak-watch");
    Ok(())
}

/// Print every new snapshot and status change until Ctrl-C
async fn watch(dashboard: &WorkflowDashboard, organization: &str, status_comment: bool) {
    let mut runs = dashboard.subscribe_runs();
    let mut signals = dashboard.auth_watcher().channel().subscribe();
    let mut status_check = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut last_error = None;
    let mut prompted = false;
    let mut timed_out = false;
    let mut published: Option<Vec<WorkflowRunStatus>> = None;

    loop {
        tokio::select! {
            changed = runs.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = runs.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    print_runs(&snapshot);
                    if status_comment && published.as_ref() != Some(&snapshot) {
                        match dashboard.publish_status_comment().await {
                            Ok(outcome) => {
                                info!("{} (#{})", outcome, outcome.id());
                                published = Some(snapshot);
                            }
                            Err(e) => warn!("Status comment not published: {}", e.user_message()),
                        }
                    }
                }
            }
            signal = signals.recv() => match signal {
                Ok(AuthSignal::Authorized { organization: authorized, .. })
                    if authorized == organization =>
                {
                    println!("SSO authorization for {} detected", authorized);
                    print_permissions(&dashboard.refresh_permissions().await);
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = status_check.tick() => {
                let error = dashboard.last_error().map(|e| e.user_message());
                if error != last_error {
                    if let Some(message) = &error {
                        eprintln!("Polling failed: {}", message);
                    }
                    last_error = error;
                }

                let show_prompt = dashboard.auth_watcher().should_show_prompt(organization);
                if show_prompt && !prompted {
                    if let Some(session) = dashboard.auth_watcher().active_session(organization) {
                        eprintln!("{}", session.message());
                    }
                }
                prompted = show_prompt;

                let gave_up = dashboard.auth_watcher().is_timed_out(organization);
                if gave_up && !timed_out {
                    eprintln!(
                        "Stopped waiting for SSO authorization of {}. Authorize the token and restart dak-watch.",
                        organization
                    );
                }
                timed_out = gave_up;
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }
}

fn print_permissions(permissions: &PermissionSet) {
    let allowed: Vec<String> = PermissionKind::ALL
        .into_iter()
        .filter(|kind| permissions.allows(*kind))
        .map(|kind| format!("{:?}", kind))
        .collect();
    if allowed.is_empty() {
        println!("Permissions: none (not signed in or no access)");
    } else {
        println!("Permissions: {}", allowed.join(", "));
    }
}

fn print_runs(runs: &[WorkflowRunStatus]) {
    println!("{}", RunSummary::from_runs(runs));
    for run in runs {
        let outcome = match run.conclusion {
            Some(conclusion) => format!("{:?}", conclusion),
            None => format!("{:?}", run.status),
        };
        println!(
            "  {:<40} {:<12} {}",
            run.name,
            outcome,
            run.url.as_deref().unwrap_or("")
        );
    }
}
