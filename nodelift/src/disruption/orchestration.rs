//! The orchestration queue: executes approved commands, tolerating failure.
//!
//! Commands are serialized per candidate: a provider id may belong to at
//! most one in-flight command. Execution taints the candidates, launches the
//! replacements, then reconciles until every replacement initializes and
//! every candidate's claim is deleted. A command that cannot finish inside
//! its wall-clock budget is rolled back and reported.

use super::{disruption_taint, Command, DisruptionError};
use crate::api::{labels, ConditionType};
use crate::config::Options;
use crate::events::{Event, EventRecorder};
use crate::metrics;
use crate::provider::CloudProvider;
use crate::scheduling::Results;
use crate::state::{ClusterState, ObjectStore, StateError};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A launched replacement being tracked to readiness
#[derive(Debug, Clone)]
pub struct Replacement {
    pub name: String,
    pub initialized: bool,
}

/// One command in flight
pub struct CommandState {
    pub command: Command,
    pub replacements: Mutex<Vec<Replacement>>,
    pub added_at: Instant,
    pub succeeded: AtomicBool,
}

enum Outcome {
    Done,
    Retry(String),
    Fatal(String),
}

pub struct OrchestrationQueue {
    by_provider_id: RwLock<HashMap<String, Arc<CommandState>>>,
    tx: mpsc::UnboundedSender<Arc<CommandState>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<CommandState>>>>,
    cluster: Arc<ClusterState>,
    store: Arc<dyn ObjectStore>,
    provider: Arc<dyn CloudProvider>,
    recorder: Arc<dyn EventRecorder>,
    options: Options,
}

impl OrchestrationQueue {
    pub fn new(
        cluster: Arc<ClusterState>,
        store: Arc<dyn ObjectStore>,
        provider: Arc<dyn CloudProvider>,
        recorder: Arc<dyn EventRecorder>,
        options: Options,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(OrchestrationQueue {
            by_provider_id: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            cluster,
            store,
            provider,
            recorder,
            options,
        })
    }

    /// Whether any in-flight command holds this candidate
    pub fn contains(&self, provider_id: &str) -> bool {
        self.by_provider_id.read().contains_key(provider_id)
    }

    /// The in-flight command holding this candidate, if any
    pub fn command_for(&self, provider_id: &str) -> Option<Command> {
        self.by_provider_id.read().get(provider_id).map(|state| state.command.clone())
    }

    pub fn len(&self) -> usize {
        self.by_provider_id.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_provider_id.read().is_empty()
    }

    /// Accept a validated command: taint candidates, mark them for deletion,
    /// launch replacements, record nominations, and hand the command to the
    /// reconcile workers. Side effects are rolled back if any step refuses.
    pub async fn add(
        &self,
        command: Command,
        results: Option<&Results>,
    ) -> super::Result<()> {
        {
            let map = self.by_provider_id.read();
            for candidate in &command.candidates {
                if map.contains_key(candidate.provider_id()) {
                    return Err(DisruptionError::DuplicateCandidate(
                        candidate.name().to_string(),
                    ));
                }
            }
        }

        // 1. taint and condition every candidate so nothing schedules onto it
        let mut tainted: Vec<String> = Vec::new();
        for candidate in &command.candidates {
            match self.store.taint_node(candidate.name(), disruption_taint()).await {
                Ok(()) => tainted.push(candidate.name().to_string()),
                Err(error) => {
                    warn!(node = candidate.name(), %error, "failed to taint candidate");
                }
            }
            if let Some(claim) = candidate.claim_name() {
                if let Err(error) = self
                    .store
                    .set_node_claim_condition(
                        claim,
                        ConditionType::Disrupted,
                        true,
                        Some(command.reason.to_string()),
                    )
                    .await
                {
                    warn!(node_claim = claim, %error, "failed to set disruption condition");
                }
            }
        }
        if tainted.is_empty() && !command.replacements.is_empty() {
            self.rollback(&command, &tainted).await;
            return Err(DisruptionError::Taint(
                "no candidate could be tainted and replacements are required".to_string(),
            ));
        }

        // 2. shield the candidates from other disruption decisions
        let provider_ids = command.provider_ids();
        self.cluster.mark_for_deletion(&provider_ids);

        // 3. launch replacements before anything is torn down
        let mut replacements = Vec::new();
        for node in &command.replacements {
            match self.provider.create(&node.to_claim_spec()).await {
                Ok(claim) => {
                    info!(node_claim = claim.name(), reason = %command.reason, "launching replacement");
                    self.recorder.publish(Event::Launching {
                        node_claim: claim.name().to_string(),
                        reason: command.reason.to_string(),
                    });
                    self.cluster.update_node_claim(claim.clone());
                    replacements
                        .push(Replacement { name: claim.name().to_string(), initialized: false });
                }
                Err(error) => {
                    // failing to get capacity must not strand the workloads
                    self.cluster.unmark_for_deletion(&provider_ids);
                    self.rollback(&command, &tainted).await;
                    return Err(DisruptionError::Launch(error.to_string()));
                }
            }
        }

        // 4. nominations and topology implied by the plan
        if let Some(results) = results {
            results.record(self.recorder.as_ref(), &self.cluster);
        }

        let state = Arc::new(CommandState {
            replacements: Mutex::new(replacements),
            added_at: Instant::now(),
            succeeded: AtomicBool::new(false),
            command,
        });
        {
            let mut map = self.by_provider_id.write();
            for candidate in &state.command.candidates {
                map.insert(candidate.provider_id().to_string(), state.clone());
            }
        }
        // the worker loop may not be running in tests; commands still sit in
        // the map and block double-enqueue either way
        let _ = self.tx.send(state);
        Ok(())
    }

    /// Reconcile commands until shutdown. At most `queue_concurrency`
    /// commands reconcile at once, each attempt rate-limited.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("orchestration queue is already running");
            return;
        };
        let semaphore = Arc::new(Semaphore::new(self.options.queue_concurrency));
        let limiter = Arc::new(RateLimiter::new(100.0, 1000.0));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                state = rx.recv() => {
                    let Some(state) = state else { return };
                    let queue = self.clone();
                    let semaphore = semaphore.clone();
                    let limiter = limiter.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else { return };
                        queue.process(state, limiter, shutdown).await;
                    });
                }
            }
        }
    }

    async fn process(
        &self,
        state: Arc<CommandState>,
        limiter: Arc<RateLimiter>,
        shutdown: CancellationToken,
    ) {
        let mut backoff = self.options.queue_base_delay;
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            limiter.acquire().await;
            match self.reconcile(&state).await {
                Outcome::Done => {
                    self.complete(&state);
                    return;
                }
                Outcome::Fatal(reason) => {
                    self.fail(&state, &reason).await;
                    return;
                }
                Outcome::Retry(reason) => {
                    if state.added_at.elapsed() >= self.options.command_timeout {
                        self.fail(&state, &format!("command timed out: {reason}")).await;
                        return;
                    }
                    debug!(command = %state.command.id, %reason, "requeueing command");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.options.queue_max_delay);
                }
            }
        }
    }

    /// One reconcile attempt: poll replacements, then delete the candidates
    async fn reconcile(&self, state: &CommandState) -> Outcome {
        let mut replacements = state.replacements.lock().clone();
        let mut all_initialized = true;
        for replacement in replacements.iter_mut().filter(|r| !r.initialized) {
            match self.store.get_node_claim(&replacement.name).await {
                Ok(claim) if claim.metadata.deletion_timestamp.is_some() => {
                    return Outcome::Fatal(format!(
                        "replacement {} was deleted before initializing",
                        replacement.name
                    ));
                }
                Ok(claim) if claim.is_initialized() => replacement.initialized = true,
                Ok(_) => {
                    self.recorder.publish(Event::WaitingOnReadiness {
                        node_claim: replacement.name.clone(),
                    });
                    all_initialized = false;
                }
                Err(StateError::NotFound { .. }) => {
                    return Outcome::Fatal(format!(
                        "replacement {} no longer exists",
                        replacement.name
                    ));
                }
                Err(error) => return Outcome::Retry(error.to_string()),
            }
        }
        *state.replacements.lock() = replacements;
        if !all_initialized {
            return Outcome::Retry("waiting on replacement initialization".to_string());
        }

        // all replacements ready: remove every candidate's claim in parallel
        let deletions = state.command.candidates.iter().filter_map(|candidate| {
            candidate.claim_name().map(|claim| {
                let store = self.store.clone();
                let claim = claim.to_string();
                async move { store.delete_node_claim(&claim).await }
            })
        });
        for result in join_all(deletions).await {
            match result {
                Ok(()) | Err(StateError::NotFound { .. }) => {}
                Err(error) => return Outcome::Retry(error.to_string()),
            }
        }
        for candidate in &state.command.candidates {
            self.recorder.publish(Event::Terminating {
                node: candidate.name().to_string(),
                reason: state.command.reason.to_string(),
            });
            metrics::counter_inc(
                metrics::NODECLAIMS_DISRUPTED_TOTAL,
                &[
                    ("reason", state.command.reason.as_str()),
                    ("nodepool", candidate.node_pool.name()),
                    ("capacity_type", &candidate.capacity_type),
                ],
            );
        }
        Outcome::Done
    }

    fn complete(&self, state: &CommandState) {
        state.succeeded.store(true, Ordering::Release);
        info!(command = %state.command.id, decision = state.command.decision().as_str(), "command completed");
        let mut map = self.by_provider_id.write();
        for candidate in &state.command.candidates {
            map.remove(candidate.provider_id());
        }
    }

    /// Unrecoverable failure: undo every visible side effect and report
    async fn fail(&self, state: &CommandState, reason: &str) {
        error!(command = %state.command.id, reason, "command failed unrecoverably");
        let tainted: Vec<String> =
            state.command.candidates.iter().map(|c| c.name().to_string()).collect();
        self.cluster.unmark_for_deletion(&state.command.provider_ids());
        self.rollback(&state.command, &tainted).await;

        // the failure metric counts replacements that never came up, which
        // is zero when a delete-only command (or one whose replacements all
        // initialized) times out on the deletion step alone
        let uninitialized =
            state.replacements.lock().iter().filter(|r| !r.initialized).count();
        metrics::counter_add(
            metrics::QUEUE_FAILURES_TOTAL,
            &[
                ("decision", state.command.decision().as_str()),
                ("reason", state.command.reason.as_str()),
                ("consolidation_type", state.command.consolidation_type),
            ],
            uninitialized as u64,
        );
        let mut map = self.by_provider_id.write();
        for candidate in &state.command.candidates {
            map.remove(candidate.provider_id());
        }
    }

    /// Remove taints and disruption conditions from the named candidates
    async fn rollback(&self, command: &Command, tainted: &[String]) {
        for node in tainted {
            if let Err(error) =
                self.store.remove_node_taint(node, labels::DISRUPTION_TAINT_KEY).await
            {
                warn!(%node, %error, "failed to remove disruption taint during rollback");
            }
        }
        for candidate in &command.candidates {
            if let Some(claim) = candidate.claim_name() {
                if let Err(error) = self
                    .store
                    .clear_node_claim_condition(claim, ConditionType::Disrupted)
                    .await
                {
                    warn!(node_claim = claim, %error, "failed to clear disruption condition during rollback");
                }
            }
        }
    }
}

/// Token bucket limiting reconcile attempts across all commands
struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    fn new(rate: f64, burst: f64) -> Self {
        RateLimiter { rate, burst, state: Mutex::new((burst, Instant::now())) }
    }

    async fn acquire(&self) {
        let wait = {
            let mut state = self.state.lock();
            let (ref mut tokens, ref mut last) = *state;
            let now = Instant::now();
            *tokens = (*tokens + now.duration_since(*last).as_secs_f64() * self.rate)
                .min(self.burst);
            *last = now;
            *tokens -= 1.0;
            if *tokens >= 0.0 {
                None
            } else {
                Some(Duration::from_secs_f64(-*tokens / self.rate))
            }
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_allows_burst_then_throttles() {
        let limiter = RateLimiter::new(10.0, 2.0);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        // the third token must wait ~100ms at 10/s
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(99));
    }
}
