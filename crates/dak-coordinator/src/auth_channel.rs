//! Broadcast channel shared by every tab of the application
//!
//! Each tab (dashboard instance) announces when it starts waiting for an
//! organization's SSO authorization, when the authorization went through
//! and when it stopped waiting. Signals are idempotent notifications, so
//! late or duplicate delivery is harmless.

use log::{debug, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 64;

static NEXT_TAB_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one tab within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TabId(u64);

impl TabId {
    /// Allocate a fresh, process-unique ID
    pub fn next() -> Self {
        Self(NEXT_TAB_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tab-{}", self.0)
    }
}

/// Kind of an `AuthSignal`, used to filter subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    PollingStarted,
    Authorized,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSignal {
    /// A tab started waiting for the organization
    PollingStarted { organization: String, origin: TabId },
    /// A request for the organization went through
    Authorized { organization: String, origin: TabId },
    /// A tab stopped waiting (cancelled or timed out)
    Stopped { organization: String, origin: TabId },
}

impl AuthSignal {
    pub fn kind(&self) -> SignalKind {
        match self {
            AuthSignal::PollingStarted { .. } => SignalKind::PollingStarted,
            AuthSignal::Authorized { .. } => SignalKind::Authorized,
            AuthSignal::Stopped { .. } => SignalKind::Stopped,
        }
    }

    pub fn organization(&self) -> &str {
        match self {
            AuthSignal::PollingStarted { organization, .. }
            | AuthSignal::Authorized { organization, .. }
            | AuthSignal::Stopped { organization, .. } => organization,
        }
    }

    pub fn origin(&self) -> TabId {
        match self {
            AuthSignal::PollingStarted { origin, .. }
            | AuthSignal::Authorized { origin, .. }
            | AuthSignal::Stopped { origin, .. } => *origin,
        }
    }
}

/// Cloneable handle to the process-wide signal channel
#[derive(Debug, Clone)]
pub struct AuthChannel {
    sender: broadcast::Sender<AuthSignal>,
}

impl Default for AuthChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Send a signal to every subscriber, including the sender's own
    pub fn broadcast(&self, signal: AuthSignal) {
        debug!("Broadcasting {:?}", signal);
        // No subscribers is not an error
        let _ = self.sender.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthSignal> {
        self.sender.subscribe()
    }

    /// Run `handler` for every signal of the given kind until the
    /// subscription is dropped
    pub fn on<H>(&self, kind: SignalKind, handler: H) -> Subscription
    where
        H: Fn(AuthSignal) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(signal) if signal.kind() == kind => handler(signal),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Auth signal subscriber lagged, skipped {} signals", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }
}

/// Active `AuthChannel::on` handler; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
