//! Transient feedback for user-triggered actions
//!
//! One entry per entity (a workflow, a run, a pull request). Entries drive
//! spinners and banners only; the authoritative state always comes from the
//! next status poll.

use chrono::{DateTime, Utc};
use dak_client::ApiResult;
use dak_config::ActionConfig;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Phase of a tracked action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    Pending,
    Succeeded,
    Failed,
}

/// Feedback state for one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionState {
    pub entity_id: String,
    pub phase: ActionPhase,
    pub message: String,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    state: ActionState,
    generation: u64,
    expiry: Option<JoinHandle<()>>,
}

impl Entry {
    fn cancel_expiry(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }
}

#[derive(Default)]
struct Entries {
    by_entity: HashMap<String, Entry>,
    next_generation: u64,
}

impl Entries {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

/// Keyed, self-expiring action feedback
///
/// `resolve` schedules the removal of the entry on the tokio runtime, so it
/// must be called from within one.
pub struct ActionStateTracker {
    config: ActionConfig,
    entries: Arc<Mutex<Entries>>,
}

impl ActionStateTracker {
    pub fn new(config: ActionConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(Entries::default())),
        }
    }

    /// Mark an entity as pending, replacing whatever it had before
    pub fn begin(&self, entity_id: &str) -> ActionState {
        self.begin_with_message(entity_id, "")
    }

    /// Like `begin`, with a progress message for the spinner
    pub fn begin_with_message(&self, entity_id: &str, message: impl Into<String>) -> ActionState {
        self.insert_pending(entity_id, message.into()).0
    }

    fn insert_pending(&self, entity_id: &str, message: String) -> (ActionState, u64) {
        let state = ActionState {
            entity_id: entity_id.to_string(),
            phase: ActionPhase::Pending,
            message,
            started_at: Utc::now(),
        };

        let mut entries = self.lock();
        let generation = entries.next_generation();
        let previous = entries.by_entity.insert(
            entity_id.to_string(),
            Entry {
                state: state.clone(),
                generation,
                expiry: None,
            },
        );
        if let Some(mut previous) = previous {
            debug!("Replacing {:?} action state for {}", previous.state.phase, entity_id);
            previous.cancel_expiry();
        }
        (state, generation)
    }

    /// Finish the action and schedule the entry's removal
    ///
    /// Successes stay visible longer than failures. An entity without a
    /// pending entry gets a finished one.
    pub fn resolve(&self, entity_id: &str, success: bool, message: impl Into<String>) -> ActionState {
        let mut entries = self.lock();
        self.finish(&mut entries, entity_id, success, message.into())
    }

    /// Resolve only if the entry still belongs to the `begin` that returned
    /// `generation`; a newer action on the entity keeps its state.
    fn resolve_if_current(
        &self,
        entity_id: &str,
        generation: u64,
        success: bool,
        message: String,
    ) -> Option<ActionState> {
        let mut entries = self.lock();
        let current = entries
            .by_entity
            .get(entity_id)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            debug!("Dropping stale result for {}", entity_id);
            return None;
        }
        Some(self.finish(&mut entries, entity_id, success, message))
    }

    fn finish(
        &self,
        entries: &mut Entries,
        entity_id: &str,
        success: bool,
        message: String,
    ) -> ActionState {
        let (phase, delay) = if success {
            (ActionPhase::Succeeded, self.config.success_expiry())
        } else {
            (ActionPhase::Failed, self.config.failure_expiry())
        };

        let generation = entries.next_generation();
        let started_at = entries
            .by_entity
            .get(entity_id)
            .map(|entry| entry.state.started_at)
            .unwrap_or_else(Utc::now);

        let state = ActionState {
            entity_id: entity_id.to_string(),
            phase,
            message,
            started_at,
        };
        let expiry = self.schedule_expiry(entity_id.to_string(), generation, delay);

        let previous = entries.by_entity.insert(
            entity_id.to_string(),
            Entry {
                state: state.clone(),
                generation,
                expiry: Some(expiry),
            },
        );
        if let Some(mut previous) = previous {
            previous.cancel_expiry();
        }
        state
    }

    /// Remove an entity's entry immediately
    pub fn clear(&self, entity_id: &str) -> Option<ActionState> {
        let mut entry = self.lock().by_entity.remove(entity_id)?;
        entry.cancel_expiry();
        Some(entry.state)
    }

    pub fn get(&self, entity_id: &str) -> Option<ActionState> {
        self.lock()
            .by_entity
            .get(entity_id)
            .map(|entry| entry.state.clone())
    }

    pub fn is_pending(&self, entity_id: &str) -> bool {
        self.get(entity_id)
            .is_some_and(|state| state.phase == ActionPhase::Pending)
    }

    /// All current entries, ordered by entity ID
    pub fn snapshot(&self) -> Vec<ActionState> {
        let mut states: Vec<ActionState> = self
            .lock()
            .by_entity
            .values()
            .map(|entry| entry.state.clone())
            .collect();
        states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        states
    }

    pub fn len(&self) -> usize {
        self.lock().by_entity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a remote action with pending/succeeded/failed feedback
    ///
    /// The error, if any, is returned untouched so callers can still react
    /// to it (e.g. start an SSO wait). If another action on the same entity
    /// began in the meantime, this result does not touch its state.
    pub async fn track<R, Fut>(
        &self,
        entity_id: &str,
        success_message: impl FnOnce(&R) -> String,
        action: Fut,
    ) -> ApiResult<R>
    where
        Fut: Future<Output = ApiResult<R>>,
    {
        let (_, generation) = self.insert_pending(entity_id, String::new());
        let result = action.await;
        match &result {
            Ok(value) => {
                self.resolve_if_current(entity_id, generation, true, success_message(value));
            }
            Err(e) => {
                debug!("Action on {} failed: {}", entity_id, e);
                self.resolve_if_current(entity_id, generation, false, e.user_message());
            }
        }
        result
    }

    fn schedule_expiry(&self, entity_id: String, generation: u64, delay: Duration) -> JoinHandle<()> {
        let entries = Arc::downgrade(&self.entries);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(entries) = entries.upgrade() else {
                return;
            };
            let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
            let expired = entries
                .by_entity
                .get(&entity_id)
                .is_some_and(|entry| entry.generation == generation);
            if expired {
                debug!("Action state for {} expired", entity_id);
                entries.by_entity.remove(&entity_id);
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ActionStateTracker {
    fn drop(&mut self) {
        for entry in self.lock().by_entity.values_mut() {
            entry.cancel_expiry();
        }
    }
}
