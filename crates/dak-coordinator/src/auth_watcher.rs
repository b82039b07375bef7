//! Waiting for organization SSO authorization across tabs
//!
//! When a request fails because the token is not authorized for an
//! organization's SAML SSO, the user has to authorize it in the browser.
//! The watcher retries the blocked request until that happens, the wait
//! times out or the user dismisses it.
//!
//! ```text
//! IDLE ──start_watching──▶ WAITING ──retry ok / other error──▶ AUTHORIZED
//!                             │ ──Authorized from another tab─▶ AUTHORIZED
//!                             │ ──timeout──────────────────────▶ TIMED_OUT (sticky)
//!                             └──cancel────────────────────────▶ CANCELLED (+ cooldown)
//! ```
//!
//! A timed-out organization stays timed out until the user asks for another
//! wait with `retry_authorization` or another tab reports it authorized;
//! further SSO errors do not start a new wait on their own.
//!
//! Tabs share an `AuthChannel`. A success in any tab releases every tab
//! waiting for the same organization, and among the waiting tabs only the
//! one with the lowest `TabId` shows the prompt.

use crate::auth_channel::{AuthChannel, AuthSignal, TabId};
use chrono::{DateTime, Utc};
use dak_client::{ApiError, ApiResult, RepoRef};
use dak_config::SsoConfig;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Waiting,
    Authorized,
    TimedOut,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Waiting)
    }
}

/// One tab's wait for an organization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlPollingSession {
    pub organization: String,
    /// Repository whose request was blocked, if known
    pub repository: Option<String>,
    pub started_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl SamlPollingSession {
    /// Text for the prompt or banner of this session
    pub fn message(&self) -> String {
        match self.status {
            SessionStatus::Waiting => format!(
                "Authorize your token for the {} organization (SAML SSO). Waiting for authorization...",
                self.organization
            ),
            SessionStatus::Authorized => {
                format!("Authorization for {} detected.", self.organization)
            }
            SessionStatus::TimedOut => format!(
                "Timed out waiting for SSO authorization of {}. Authorize your token and retry.",
                self.organization
            ),
            SessionStatus::Cancelled => format!(
                "Stopped waiting for SSO authorization of {}.",
                self.organization
            ),
        }
    }
}

/// Retry cadence and give-up time of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&SsoConfig> for WatchOptions {
    fn from(config: &SsoConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from(&SsoConfig::default())
    }
}

/// Read-only view of a running or finished session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    receiver: watch::Receiver<SamlPollingSession>,
}

impl SessionHandle {
    pub fn session(&self) -> SamlPollingSession {
        self.receiver.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.receiver.borrow().status
    }

    /// Wait until the session reaches a terminal status
    pub async fn finished(&mut self) -> SamlPollingSession {
        let finished = self
            .receiver
            .wait_for(|session| session.status.is_terminal())
            .await
            .map(|session| session.clone());
        finished.unwrap_or_else(|_| self.receiver.borrow().clone())
    }
}

/// Outcome of `start_watching`
#[derive(Debug)]
pub enum WatchStart {
    Started(SessionHandle),
    /// This tab already waits for the organization
    AlreadyWatching(SessionHandle),
    /// The user dismissed a wait for the organization recently
    CoolingDown { remaining: Duration },
    /// The last wait timed out; only `retry_authorization` starts another
    TimedOut,
}

impl WatchStart {
    pub fn handle(&self) -> Option<&SessionHandle> {
        match self {
            WatchStart::Started(handle) | WatchStart::AlreadyWatching(handle) => Some(handle),
            WatchStart::CoolingDown { .. } | WatchStart::TimedOut => None,
        }
    }
}

struct SessionEntry {
    id: u64,
    state: Arc<watch::Sender<SamlPollingSession>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct WatcherState {
    sessions: HashMap<String, SessionEntry>,
    cooldowns: HashMap<String, Instant>,
    /// Organizations whose last wait ran into the timeout
    timed_out: HashSet<String>,
    /// Other tabs currently waiting, per organization
    remote_waiting: HashMap<String, BTreeSet<TabId>>,
    next_session: u64,
}

type SharedState = Arc<Mutex<WatcherState>>;

fn lock(shared: &SharedState) -> MutexGuard<'_, WatcherState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-tab SSO authorization watcher
///
/// Must be created within a tokio runtime; dropping it stops every wait it
/// owns.
pub struct CrossTabAuthWatcher {
    tab: TabId,
    channel: AuthChannel,
    config: SsoConfig,
    shared: SharedState,
    listener: JoinHandle<()>,
}

impl CrossTabAuthWatcher {
    pub fn new(channel: AuthChannel, config: SsoConfig) -> Self {
        let tab = TabId::next();
        let shared: SharedState = Arc::new(Mutex::new(WatcherState::default()));
        let listener = spawn_listener(tab, channel.subscribe(), Arc::clone(&shared));
        debug!("Auth watcher for {} listening", tab);
        Self {
            tab,
            channel,
            config,
            shared,
            listener,
        }
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }

    pub fn channel(&self) -> &AuthChannel {
        &self.channel
    }

    /// Start retrying `retry` until the organization authorizes the token
    ///
    /// Announces the wait to the other tabs right away. At most one wait per
    /// organization runs in a tab. None starts during the cooldown that
    /// follows a `cancel` or after a wait for the organization timed out.
    pub fn start_watching<F, Fut, R>(
        &self,
        organization: &str,
        repository: Option<&str>,
        retry: F,
        options: WatchOptions,
    ) -> WatchStart
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        let now = Instant::now();
        let mut shared = lock(&self.shared);

        if shared.timed_out.contains(organization) {
            debug!("SSO wait for {} timed out earlier, waiting for the user", organization);
            return WatchStart::TimedOut;
        }

        if let Some(until) = shared.cooldowns.get(organization).copied() {
            if now < until {
                let remaining = until - now;
                debug!(
                    "Not watching {} again for another {:?} after dismissal",
                    organization, remaining
                );
                return WatchStart::CoolingDown { remaining };
            }
            shared.cooldowns.remove(organization);
        }

        if let Some(entry) = shared.sessions.get(organization) {
            if !entry.state.borrow().status.is_terminal() {
                return WatchStart::AlreadyWatching(SessionHandle {
                    receiver: entry.state.subscribe(),
                });
            }
        }

        let started_at = Utc::now();
        let timeout_at = chrono::Duration::from_std(options.timeout)
            .ok()
            .and_then(|timeout| started_at.checked_add_signed(timeout))
            .unwrap_or(started_at);
        let (state, receiver) = watch::channel(SamlPollingSession {
            organization: organization.to_string(),
            repository: repository.map(str::to_string),
            started_at,
            timeout_at,
            status: SessionStatus::Waiting,
        });
        let state = Arc::new(state);

        shared.next_session += 1;
        let id = shared.next_session;

        // Subscribe before announcing so no Authorized signal can slip past
        let signals = self.channel.subscribe();
        let task = tokio::spawn(run_session(
            SessionTask {
                id,
                tab: self.tab,
                organization: organization.to_string(),
                channel: self.channel.clone(),
                state: Arc::clone(&state),
                shared: Arc::clone(&self.shared),
            },
            signals,
            retry,
            options,
        ));
        let previous = shared
            .sessions
            .insert(organization.to_string(), SessionEntry { id, state, task });
        drop(shared);

        if let Some(previous) = previous {
            previous.task.abort();
        }

        info!(
            "Waiting for SSO authorization of {} (retry every {:?}, give up after {:?})",
            organization, options.interval, options.timeout
        );
        self.channel.broadcast(AuthSignal::PollingStarted {
            organization: organization.to_string(),
            origin: self.tab,
        });

        WatchStart::Started(SessionHandle { receiver })
    }

    /// Start watching if `error` says the organization requires SSO
    ///
    /// Returns None for any other error.
    pub fn handle_error<F, Fut, R>(
        &self,
        repo: &RepoRef,
        error: &ApiError,
        retry: F,
    ) -> Option<WatchStart>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        let ApiError::SsoRequired { organization, .. } = error else {
            return None;
        };
        let organization = organization.as_deref().unwrap_or(&repo.owner);
        let repository = repo.to_string();
        Some(self.start_watching(
            organization,
            Some(&repository),
            retry,
            WatchOptions::from(&self.config),
        ))
    }

    /// Start a new wait after the previous one timed out
    ///
    /// This is the explicit user action that lifts the timeout; the
    /// dismissal cooldown still applies.
    pub fn retry_authorization<F, Fut, R>(
        &self,
        organization: &str,
        repository: Option<&str>,
        retry: F,
    ) -> WatchStart
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<R>> + Send + 'static,
        R: Send + 'static,
    {
        if lock(&self.shared).timed_out.remove(organization) {
            info!("Retrying SSO authorization of {} on request", organization);
        }
        self.start_watching(
            organization,
            repository,
            retry,
            WatchOptions::from(&self.config),
        )
    }

    /// Whether the last wait for the organization timed out
    pub fn is_timed_out(&self, organization: &str) -> bool {
        lock(&self.shared).timed_out.contains(organization)
    }

    /// Stop waiting for an organization because the user dismissed it
    ///
    /// Starts the dismissal cooldown. Returns whether a wait was running.
    pub fn cancel(&self, organization: &str) -> bool {
        let entry = {
            let mut shared = lock(&self.shared);
            shared.cooldowns.insert(
                organization.to_string(),
                Instant::now() + self.config.dismiss_cooldown(),
            );
            shared.sessions.remove(organization)
        };

        let Some(entry) = entry else {
            return false;
        };
        entry.task.abort();
        if entry.state.borrow().status.is_terminal() {
            return false;
        }

        entry
            .state
            .send_modify(|session| session.status = SessionStatus::Cancelled);
        info!("Stopped waiting for SSO authorization of {}", organization);
        self.channel.broadcast(AuthSignal::Stopped {
            organization: organization.to_string(),
            origin: self.tab,
        });
        true
    }

    /// The waiting session for an organization, if any
    pub fn active_session(&self, organization: &str) -> Option<SamlPollingSession> {
        lock(&self.shared)
            .sessions
            .get(organization)
            .map(|entry| entry.state.borrow().clone())
            .filter(|session| !session.status.is_terminal())
    }

    /// Whether a tab with a lower ID is already waiting for the organization
    pub fn is_prompt_suppressed(&self, organization: &str) -> bool {
        lock(&self.shared)
            .remote_waiting
            .get(organization)
            .and_then(|tabs| tabs.first())
            .is_some_and(|lowest| *lowest < self.tab)
    }

    /// Whether this tab should display the SSO prompt for the organization
    pub fn should_show_prompt(&self, organization: &str) -> bool {
        self.active_session(organization).is_some() && !self.is_prompt_suppressed(organization)
    }
}

impl Drop for CrossTabAuthWatcher {
    fn drop(&mut self) {
        self.listener.abort();
        let sessions: Vec<(String, SessionEntry)> = lock(&self.shared).sessions.drain().collect();
        for (organization, entry) in sessions {
            entry.task.abort();
            if entry.state.borrow().status.is_terminal() {
                continue;
            }
            entry
                .state
                .send_modify(|session| session.status = SessionStatus::Cancelled);
            // Lets the remaining tabs take over the prompt
            self.channel.broadcast(AuthSignal::Stopped {
                organization,
                origin: self.tab,
            });
        }
    }
}

fn spawn_listener(
    tab: TabId,
    mut signals: broadcast::Receiver<AuthSignal>,
    shared: SharedState,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match signals.recv().await {
                Ok(signal) if signal.origin() != tab => track_remote(&shared, signal),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("{} missed {} auth signals", tab, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn track_remote(shared: &SharedState, signal: AuthSignal) {
    let mut shared = lock(shared);
    match signal {
        AuthSignal::PollingStarted {
            organization,
            origin,
        } => {
            shared
                .remote_waiting
                .entry(organization)
                .or_default()
                .insert(origin);
        }
        AuthSignal::Stopped {
            organization,
            origin,
        } => {
            if let Some(tabs) = shared.remote_waiting.get_mut(&organization) {
                tabs.remove(&origin);
                if tabs.is_empty() {
                    shared.remote_waiting.remove(&organization);
                }
            }
        }
        // Every tab waiting for the organization is released
        AuthSignal::Authorized { organization, .. } => {
            shared.remote_waiting.remove(&organization);
            shared.timed_out.remove(&organization);
        }
    }
}

struct SessionTask {
    id: u64,
    tab: TabId,
    organization: String,
    channel: AuthChannel,
    state: Arc<watch::Sender<SamlPollingSession>>,
    shared: SharedState,
}

async fn run_session<F, Fut, R>(
    task: SessionTask,
    mut signals: broadcast::Receiver<AuthSignal>,
    retry: F,
    options: WatchOptions,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ApiResult<R>>,
{
    let organization = task.organization.as_str();
    let start = Instant::now();
    let deadline = start + options.timeout;
    let mut ticks = interval_at(start + options.interval, options.interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut signals_open = true;
    let mut attempts = 0u32;

    let outcome = loop {
        tokio::select! {
            biased;

            _ = sleep_until(deadline) => break SessionStatus::TimedOut,

            signal = signals.recv(), if signals_open => match signal {
                Ok(AuthSignal::Authorized { organization: authorized, origin })
                    if authorized == organization && origin != task.tab =>
                {
                    debug!("{} authorized {}", origin, organization);
                    break SessionStatus::Authorized;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("SSO wait for {} missed {} auth signals", organization, skipped);
                }
                Err(RecvError::Closed) => signals_open = false,
            },

            _ = ticks.tick() => {
                attempts += 1;
                match retry().await {
                    Ok(_) => break SessionStatus::Authorized,
                    Err(e) if e.is_sso_required() => {
                        debug!("{} still requires SSO (attempt {})", organization, attempts);
                    }
                    Err(e) => {
                        // Past the SSO wall; the caller deals with this error
                        debug!("Retry for {} failed without SSO: {}", organization, e);
                        break SessionStatus::Authorized;
                    }
                }
            }
        }
    };

    task.state.send_modify(|session| session.status = outcome);

    match outcome {
        SessionStatus::Authorized => {
            info!("SSO authorization of {} detected", organization);
            task.channel.broadcast(AuthSignal::Authorized {
                organization: organization.to_string(),
                origin: task.tab,
            });
        }
        SessionStatus::TimedOut => {
            warn!(
                "Gave up waiting for SSO authorization of {} after {:?}",
                organization, options.timeout
            );
            task.channel.broadcast(AuthSignal::Stopped {
                organization: organization.to_string(),
                origin: task.tab,
            });
        }
        SessionStatus::Waiting | SessionStatus::Cancelled => {}
    }

    let mut shared = lock(&task.shared);
    if shared
        .sessions
        .get(organization)
        .is_some_and(|entry| entry.id == task.id)
    {
        shared.sessions.remove(organization);
        if outcome == SessionStatus::TimedOut {
            shared.timed_out.insert(organization.to_string());
        }
    }
}
