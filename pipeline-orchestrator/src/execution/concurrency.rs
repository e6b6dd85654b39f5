// Concurrency Controller
// At most one active run per concurrency group

use crate::execution::context::TemplateVars;
use crate::execution::trigger::TriggerEvent;
use crate::workflow::models::Concurrency;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identity of one admitted run.
pub type RunId = Uuid;

/// Render the concurrency group key for an event.
///
/// Without a declared group the key is `<workflow>-<ref>`.
pub fn group_key(concurrency: Option<&Concurrency>, workflow: &str, event: &TriggerEvent) -> String {
    match concurrency {
        Some(concurrency) => TemplateVars::new()
            .with("workflow", workflow)
            .with("ref", event.git_ref.as_str())
            .with("event", event.kind.to_string())
            .render(concurrency.group()),
        None => format!("{}-{}", workflow, event.git_ref),
    }
}

/// What happens to an active run when another run of the same group arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Cancel the active run and admit immediately
    CancelInProgress,
    /// Wait until the active run is released
    Queue,
}

impl AdmissionPolicy {
    pub fn from_definition(concurrency: Option<&Concurrency>) -> Self {
        match concurrency {
            Some(c) if !c.cancel_in_progress() => AdmissionPolicy::Queue,
            _ => AdmissionPolicy::CancelInProgress,
        }
    }
}

/// Handle for an admitted run. The token is cancelled when a newer run of
/// the same group supersedes this one.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub id: RunId,
    pub key: String,
    pub token: CancellationToken,
}

impl RunHandle {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Result of an admission.
#[derive(Debug, Clone)]
pub struct Admission {
    pub handle: RunHandle,
    /// Runs cancelled to make room for this one
    pub cancelled: Vec<RunId>,
}

#[derive(Debug)]
struct ActiveRun {
    id: RunId,
    token: CancellationToken,
}

/// Tracks the active run per concurrency group.
pub struct ConcurrencyController {
    active: Mutex<HashMap<String, ActiveRun>>,
    released: watch::Sender<u64>,
}

impl ConcurrencyController {
    pub fn new() -> Self {
        let (released, _) = watch::channel(0);
        Self {
            active: Mutex::new(HashMap::new()),
            released,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit a run into `key`'s group.
    ///
    /// Under [`AdmissionPolicy::CancelInProgress`] the prior active run's
    /// token is cancelled and the new run becomes active at once. Under
    /// [`AdmissionPolicy::Queue`] this waits until the group is free.
    pub async fn admit(&self, key: &str, policy: AdmissionPolicy) -> Admission {
        let mut released = self.released.subscribe();

        loop {
            {
                let mut active = self.lock();
                let busy = active.contains_key(key);

                if !busy || policy == AdmissionPolicy::CancelInProgress {
                    let cancelled = match active.remove(key) {
                        Some(prior) => {
                            prior.token.cancel();
                            tracing::info!(group = key, run = %prior.id, "cancelling superseded run");
                            vec![prior.id]
                        }
                        None => Vec::new(),
                    };

                    let handle = RunHandle {
                        id: Uuid::new_v4(),
                        key: key.to_string(),
                        token: CancellationToken::new(),
                    };
                    active.insert(
                        key.to_string(),
                        ActiveRun {
                            id: handle.id,
                            token: handle.token.clone(),
                        },
                    );

                    tracing::debug!(group = key, run = %handle.id, "admitted run");
                    return Admission { handle, cancelled };
                }
            }

            tracing::info!(group = key, "run queued behind active run");
            if released.changed().await.is_err() {
                // Sender lives as long as self
                continue;
            }
        }
    }

    /// Release a run. The group is only cleared if this run is still the
    /// active one, so a superseded run never clears its successor.
    pub fn release(&self, handle: &RunHandle) {
        let mut active = self.lock();
        if active.get(&handle.key).map(|run| run.id) == Some(handle.id) {
            active.remove(&handle.key);
            tracing::debug!(group = %handle.key, run = %handle.id, "released run");
        }
        drop(active);

        self.released.send_modify(|generation| *generation += 1);
    }

    /// The active run of a group, if any.
    pub fn active_run(&self, key: &str) -> Option<RunId> {
        self.lock().get(key).map(|run| run.id)
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new()
    }
}
