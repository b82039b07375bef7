//! Interval-driven status polling
//!
//! A `StatusPoller` owns one background task that fetches a status snapshot,
//! publishes it, and waits for the next tick. Every dashboard loop goes
//! through this type so they all share the same start/stop/tier rules.
//!
//! Fetches are strictly sequential: out-of-band refreshes are sent to the
//! polling task rather than run next to it, so a slow response can never
//! overwrite the snapshot of a newer one.

use dak_client::{ApiError, ApiResult};
use dak_config::PollingConfig;
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Polling cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalTier {
    /// Steady-state cadence
    Normal,
    /// Short cadence right after a user action, reverts on its own
    Intensive,
}

/// What the poller reports after each fetch
#[derive(Debug, Clone)]
pub enum PollUpdate<T> {
    /// A fresh snapshot replaced the held one
    Snapshot(T),
    /// The fetch failed; the previous snapshot is kept
    Failed(ApiError),
}

#[derive(Debug)]
enum PollCommand {
    SetTier(IntervalTier),
    RefreshNow,
}

/// Tier bookkeeping for the polling task
#[derive(Debug, Clone)]
struct TierSchedule {
    tier: IntervalTier,
    remaining_intensive: u32,
    normal: Duration,
    intensive: Duration,
    intensive_ticks: u32,
}

impl TierSchedule {
    fn new(config: &PollingConfig) -> Self {
        Self {
            tier: IntervalTier::Normal,
            remaining_intensive: 0,
            normal: config.normal_interval(),
            intensive: config.intensive_interval(),
            intensive_ticks: config.intensive_ticks,
        }
    }

    fn set(&mut self, tier: IntervalTier) {
        match tier {
            IntervalTier::Intensive if self.intensive_ticks > 0 => {
                self.tier = IntervalTier::Intensive;
                self.remaining_intensive = self.intensive_ticks;
            }
            _ => {
                self.tier = IntervalTier::Normal;
                self.remaining_intensive = 0;
            }
        }
    }

    fn interval(&self) -> Duration {
        match self.tier {
            IntervalTier::Normal => self.normal,
            IntervalTier::Intensive => self.intensive,
        }
    }

    /// Account for one scheduled fetch
    fn on_tick(&mut self) {
        if self.tier == IntervalTier::Intensive {
            self.remaining_intensive = self.remaining_intensive.saturating_sub(1);
            if self.remaining_intensive == 0 {
                debug!("Intensive polling finished, back to normal cadence");
                self.tier = IntervalTier::Normal;
            }
        }
    }
}

struct RunningLoop {
    handle: JoinHandle<()>,
    commands: mpsc::UnboundedSender<PollCommand>,
}

/// Cloneable remote for one polling run
///
/// Commands sent after that run stopped are dropped and report `false`.
#[derive(Debug, Clone)]
pub struct PollControl {
    commands: mpsc::UnboundedSender<PollCommand>,
}

impl PollControl {
    pub fn set_interval_tier(&self, tier: IntervalTier) -> bool {
        self.commands.send(PollCommand::SetTier(tier)).is_ok()
    }

    pub fn refresh_now(&self) -> bool {
        self.commands.send(PollCommand::RefreshNow).is_ok()
    }
}

/// Repeatedly fetches a status snapshot until stopped
///
/// Must be started from within a tokio runtime. Dropping the poller stops
/// its task.
///
/// # Example
///
/// ```rust,ignore
/// let mut poller = StatusPoller::new(config.polling.clone());
/// poller.start(
///     move || {
///         let client = client.clone();
///         async move { client.fetch_workflow_runs(&repo, "main").await }
///     },
///     |update| log::debug!("{:?}", update),
/// );
/// poller.set_interval_tier(IntervalTier::Intensive);
/// ```
pub struct StatusPoller<T> {
    config: PollingConfig,
    snapshot: Arc<watch::Sender<Option<T>>>,
    running: Option<RunningLoop>,
}

impl<T> StatusPoller<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: PollingConfig) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            config,
            snapshot: Arc::new(snapshot),
            running: None,
        }
    }

    /// Start polling
    ///
    /// Fetches once immediately, then once per interval. Calling this while
    /// the poller is already running does nothing and returns `false`.
    pub fn start<F, Fut, C>(&mut self, fetch: F, on_update: C) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<T>> + Send + 'static,
        C: Fn(PollUpdate<T>) + Send + Sync + 'static,
    {
        if self.is_running() {
            debug!("Poller already running, ignoring start");
            return false;
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::clone(&self.snapshot);
        let schedule = TierSchedule::new(&self.config);

        let handle = tokio::spawn(poll_loop(fetch, on_update, snapshot, command_rx, schedule));
        self.running = Some(RunningLoop { handle, commands });
        true
    }

    /// Stop polling; safe to call any number of times
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            debug!("Stopping poller");
            running.handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Switch cadence
    ///
    /// `Intensive` lasts for the configured number of ticks, then the poller
    /// returns to `Normal` by itself. Returns `false` when not running.
    pub fn set_interval_tier(&self, tier: IntervalTier) -> bool {
        self.send(PollCommand::SetTier(tier))
    }

    /// Fetch now instead of waiting for the next tick
    pub fn refresh_now(&self) -> bool {
        self.send(PollCommand::RefreshNow)
    }

    /// Remote for the current run, None when not running
    pub fn control(&self) -> Option<PollControl> {
        self.running.as_ref().map(|running| PollControl {
            commands: running.commands.clone(),
        })
    }

    /// Last successfully fetched snapshot
    pub fn latest(&self) -> Option<T> {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.snapshot.subscribe()
    }

    /// Forget the held snapshot (the polled target changed)
    pub fn clear_snapshot(&self) {
        self.snapshot.send_replace(None);
    }

    fn send(&self, command: PollCommand) -> bool {
        match &self.running {
            Some(running) => running.commands.send(command).is_ok(),
            None => false,
        }
    }
}

impl<T> Drop for StatusPoller<T> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.abort();
        }
    }
}

async fn poll_loop<T, F, Fut, C>(
    fetch: F,
    on_update: C,
    snapshot: Arc<watch::Sender<Option<T>>>,
    mut commands: mpsc::UnboundedReceiver<PollCommand>,
    mut schedule: TierSchedule,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
    C: Fn(PollUpdate<T>),
    T: Clone,
{
    let mut failures = 0u32;
    poll_once(&fetch, &on_update, &snapshot, &mut failures).await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(schedule.interval()) => {
                poll_once(&fetch, &on_update, &snapshot, &mut failures).await;
                schedule.on_tick();
            }
            command = commands.recv() => match command {
                Some(PollCommand::SetTier(tier)) => {
                    debug!("Poller switching to {:?} cadence", tier);
                    schedule.set(tier);
                }
                Some(PollCommand::RefreshNow) => {
                    poll_once(&fetch, &on_update, &snapshot, &mut failures).await;
                }
                None => break,
            }
        }
    }
}

async fn poll_once<T, F, Fut, C>(
    fetch: &F,
    on_update: &C,
    snapshot: &watch::Sender<Option<T>>,
    failures: &mut u32,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ApiResult<T>>,
    C: Fn(PollUpdate<T>),
    T: Clone,
{
    match fetch().await {
        Ok(status) => {
            if *failures > 0 {
                debug!("Status fetch recovered after {} failures", failures);
            }
            *failures = 0;
            snapshot.send_replace(Some(status.clone()));
            on_update(PollUpdate::Snapshot(status));
        }
        Err(e) => {
            *failures += 1;
            warn!("Status fetch failed ({} in a row): {}", failures, e);
            on_update(PollUpdate::Failed(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::{sleep, Instant};

    fn counting_fetch(
        count: Arc<AtomicUsize>,
    ) -> impl Fn() -> std::future::Ready<ApiResult<usize>> + Send + Sync + 'static {
        move || {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(Ok(n))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fetches_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut poller = StatusPoller::new(PollingConfig::default());

        assert!(poller.start(counting_fetch(count.clone()), |_| {}));
        sleep(Duration::from_millis(1)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(poller.latest(), Some(1));
        assert!(poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_runs_single_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut poller = StatusPoller::new(PollingConfig::default());

        assert!(poller.start(counting_fetch(count.clone()), |_| {}));
        assert!(!poller.start(counting_fetch(count.clone()), |_| {}));

        // Fetches at 0s, 30s and 60s
        sleep(Duration::from_secs(65)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_leaves_no_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut poller = StatusPoller::<usize>::new(PollingConfig::default());

        // Stopping a poller that never ran is fine
        poller.stop();

        poller.start(counting_fetch(count.clone()), |_| {});
        sleep(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        poller.stop();
        poller.stop();
        poller.stop();
        assert!(!poller.is_running());
        assert!(!poller.set_interval_tier(IntervalTier::Intensive));
        assert!(!poller.refresh_now());

        sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_intensive_tier_reverts_after_bounded_ticks() {
        let start = Instant::now();
        let fetched_at = Arc::new(Mutex::new(Vec::new()));
        let mut poller = StatusPoller::new(PollingConfig::default());

        let record = fetched_at.clone();
        poller.start(
            move || {
                record.lock().unwrap().push(start.elapsed());
                std::future::ready(Ok(()))
            },
            |_| {},
        );
        assert!(poller.set_interval_tier(IntervalTier::Intensive));

        sleep(Duration::from_secs(61)).await;

        let secs: Vec<u64> = fetched_at
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.as_secs())
            .collect();
        // Initial fetch, six intensive fetches 5s apart, then 30s spacing again
        assert_eq!(secs, vec![0, 5, 10, 15, 20, 25, 30, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_keeps_last_snapshot() {
        let count = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let mut poller = StatusPoller::new(PollingConfig::default());

        let calls = count.clone();
        let failed = failures.clone();
        poller.start(
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(if n == 0 {
                    Ok("first")
                } else {
                    Err(ApiError::Transport("connection reset".into()))
                })
            },
            move |update| {
                if let PollUpdate::Failed(_) = update {
                    failed.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        // Ten consecutive failures after the first success
        sleep(Duration::from_secs(301)).await;

        assert_eq!(count.load(Ordering::SeqCst), 11);
        assert_eq!(failures.load(Ordering::SeqCst), 10);
        assert_eq!(poller.latest(), Some("first"));
        assert!(poller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_fetches_out_of_band() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut poller = StatusPoller::new(PollingConfig::default());
        let mut updates = poller.subscribe();

        poller.start(counting_fetch(count.clone()), |_| {});
        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(poller.refresh_now());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_outlives_borrow_but_not_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut poller = StatusPoller::new(PollingConfig::default());
        assert!(poller.control().is_none());

        poller.start(counting_fetch(count.clone()), |_| {});
        let control = poller.control().unwrap();
        sleep(Duration::from_secs(1)).await;

        let remote = control.clone();
        assert!(tokio::spawn(async move { remote.refresh_now() }).await.unwrap());
        sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        poller.stop();
        sleep(Duration::from_millis(1)).await;
        assert!(!control.refresh_now());
        assert!(!control.set_interval_tier(IntervalTier::Intensive));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_snapshot_and_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut poller = StatusPoller::new(PollingConfig::default());
        poller.start(counting_fetch(count.clone()), |_| {});
        sleep(Duration::from_millis(1)).await;

        poller.clear_snapshot();
        assert_eq!(poller.latest(), None);

        drop(poller);
        sleep(Duration::from_secs(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_intensive_ticks_stays_normal() {
        let config = PollingConfig {
            intensive_ticks: 0,
            ..Default::default()
        };
        let mut schedule = TierSchedule::new(&config);
        schedule.set(IntervalTier::Intensive);
        assert_eq!(schedule.tier, IntervalTier::Normal);
        assert_eq!(schedule.interval(), Duration::from_secs(30));
    }
}
