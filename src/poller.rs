use crate::remote::UpdateSource;
use crate::types::{MatchResult, SearchHandler, NO_MATCH_LABEL};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

const POLL_WAIT: Duration = Duration::from_secs(1);
const GRACE_WAIT: Duration = Duration::from_secs(1);

/// Handlers still waiting for a remote result, keyed by query id. Entries
/// go in when a submit succeeds and come out when the poller dispatches
/// the matching update. Locks are held only for the map operation itself.
#[derive(Default)]
pub struct PendingQueries {
    entries: Mutex<HashMap<String, Arc<dyn SearchHandler>>>,
}

impl PendingQueries {
    pub fn new() -> Self {
        PendingQueries::default()
    }

    pub fn register(&self, qid: impl Into<String>, handler: Arc<dyn SearchHandler>) {
        let qid = qid.into();
        let replaced = self
            .entries
            .lock()
            .unwrap()
            .insert(qid.clone(), handler)
            .is_some();
        if replaced {
            log::warn!("Replaced pending handler for reused query id {}", qid);
        }
    }

    pub fn take(&self, qid: &str) -> Option<Arc<dyn SearchHandler>> {
        self.entries.lock().unwrap().remove(qid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Deserialize)]
struct UpdateEnvelope {
    #[serde(default)]
    data: Option<UpdateData>,
}

#[derive(Debug, Deserialize)]
struct UpdateData {
    #[serde(default)]
    error: Option<i64>,
    #[serde(default)]
    results: Vec<UpdateEntry>,
}

#[derive(Debug, Deserialize)]
struct UpdateEntry {
    qid: String,
    #[serde(default)]
    qid_data: QidData,
}

#[derive(Debug, Default, Deserialize)]
struct QidData {
    #[serde(default)]
    labels: Option<String>,
    #[serde(default)]
    meta: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollerPhase {
    Stopped,
    Running,
}

/// Phase plus the epoch of the loop currently allowed to run. Every resume
/// starts a fresh loop under a bumped epoch. A loop that returns from a
/// poll under a stale epoch was superseded while in flight; it exits
/// instead of running alongside its successor.
#[derive(Debug, Clone, Copy)]
struct PollerState {
    phase: PollerPhase,
    epoch: u64,
}

/// Background long-poll loop. While running it waits briefly on a wake
/// signal, polls the update endpoint, and routes each result entry to the
/// pending handler registered under its query id. Any single cycle failing
/// is logged and survived; only `pause` ends the loop.
pub struct UpdatePoller {
    inner: Arc<PollerInner>,
}

struct PollerInner {
    source: Arc<dyn UpdateSource>,
    pending: Arc<PendingQueries>,
    device_id: Option<String>,
    state: Mutex<PollerState>,
    wake: Notify,
    poll_wait: Duration,
    grace_wait: Duration,
}

impl UpdatePoller {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        pending: Arc<PendingQueries>,
        device_id: Option<String>,
    ) -> Self {
        Self::with_timing(source, pending, device_id, POLL_WAIT, GRACE_WAIT)
    }

    pub fn with_timing(
        source: Arc<dyn UpdateSource>,
        pending: Arc<PendingQueries>,
        device_id: Option<String>,
        poll_wait: Duration,
        grace_wait: Duration,
    ) -> Self {
        UpdatePoller {
            inner: Arc::new(PollerInner {
                source,
                pending,
                device_id,
                state: Mutex::new(PollerState {
                    phase: PollerPhase::Stopped,
                    epoch: 0,
                }),
                wake: Notify::new(),
                poll_wait,
                grace_wait,
            }),
        }
    }

    /// Starts the poll loop. Returns false if it was already running.
    pub fn resume(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.phase == PollerPhase::Running {
            log::debug!("Update poller already running");
            return false;
        }
        state.phase = PollerPhase::Running;
        state.epoch += 1;
        let epoch = state.epoch;
        drop(state);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run(epoch).await });
        log::info!("Update poller started");
        true
    }

    /// Stops the poll loop and wakes it so the stop is observed without
    /// waiting out the poll timeout. Returns false if already stopped.
    pub fn pause(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.phase == PollerPhase::Stopped {
            log::debug!("Update poller already stopped");
            return false;
        }
        state.phase = PollerPhase::Stopped;
        drop(state);

        self.inner.wake.notify_waiters();
        log::info!("Update poller stopped");
        true
    }

    /// Nudges the loop to poll now instead of waiting out its timeout.
    /// Called after every successful submit.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap().phase == PollerPhase::Running
    }
}

impl PollerInner {
    fn current(&self, epoch: u64) -> bool {
        let state = self.state.lock().unwrap();
        state.phase == PollerPhase::Running && state.epoch == epoch
    }

    async fn run(self: Arc<Self>, epoch: u64) {
        log::debug!("Update poll loop entered");
        loop {
            // Register for the wake signal before re-checking the flag so a
            // signal arriving in between is not lost.
            let notified = self.wake.notified();
            if !self.current(epoch) {
                break;
            }
            let _ = tokio::time::timeout(self.poll_wait, notified).await;
            if !self.current(epoch) {
                break;
            }

            match self.source.poll_updates(self.device_id.as_deref()).await {
                Ok(body) => {
                    if body.is_empty() {
                        log::trace!("Update poll returned no content");
                        continue;
                    }
                    dispatch_update(&self.pending, &body, self.grace_wait).await;
                }
                Err(e) => {
                    log::warn!("Update poll failed: {}", e);
                }
            }
        }
        log::debug!("Update poll loop exited");
    }
}

/// Parses one update payload and routes its result entries. Failures,
/// whether a malformed body or a service-side error code, abandon only
/// this payload.
pub(crate) async fn dispatch_update(pending: &PendingQueries, body: &str, grace: Duration) {
    let envelope: UpdateEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("Malformed update payload: {}", e);
            return;
        }
    };
    let data = match envelope.data {
        Some(data) => data,
        None => {
            log::trace!("Update payload had no data section");
            return;
        }
    };
    if let Some(code) = data.error {
        if code != 0 {
            log::error!("Update endpoint reported error {}", code);
            return;
        }
    }

    for entry in data.results {
        dispatch_entry(pending, entry, grace).await;
    }
}

async fn dispatch_entry(pending: &PendingQueries, entry: UpdateEntry, grace: Duration) {
    let handler = match pending.take(&entry.qid) {
        Some(handler) => Some(handler),
        None => {
            // The submitting call may not have registered the id yet; give
            // it one grace period and look again.
            log::debug!(
                "No handler yet for query {}, retrying after grace period",
                entry.qid
            );
            tokio::time::sleep(grace).await;
            pending.take(&entry.qid)
        }
    };
    let handler = match handler {
        Some(handler) => handler,
        None => {
            log::warn!("Dropping result for unknown query {}", entry.qid);
            return;
        }
    };

    let matched = entry.qid_data.labels.is_some();
    let result = MatchResult {
        query_id: Some(entry.qid.clone()),
        object_id: None,
        object_name: Some(
            entry
                .qid_data
                .labels
                .unwrap_or_else(|| NO_MATCH_LABEL.to_string()),
        ),
        object_meta: if matched { entry.qid_data.meta } else { None },
        remote_match: true,
        error: None,
    };
    log::debug!("Dispatching remote result for query {}", entry.qid);
    handler.on_result(result);
}
