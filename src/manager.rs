//! Agent registry
//!
//! Tracks the agents publishing into the store, fetches their latest
//! container batch every cycle, and turns the containers into tasks. An
//! agent whose newest batch is older than its declared lifetime is marked
//! inactive and removed on the next [`AgentRegistry::cleanup`].

use crate::backends::{Agent, ContainerGroup, Store};
use crate::worker::{ContainerOp, MaintenanceOp, TaskContext};
use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Bounded polling used when a container group cannot be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Overall time allowed for the retries
    pub timeout: Duration,
    /// Number of polls spread evenly over `timeout`
    pub retries: u32,
}

impl FetchPolicy {
    /// Interval between two polls
    pub fn period(&self) -> Duration {
        self.timeout / self.retries.max(1)
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            retries: 5,
        }
    }
}

/// Local view of one agent
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedAgent {
    pub agent: Agent,
    /// Id of the newest batch processed, 0 before the first fetch
    pub latest_batch_id: i64,
    pub last_check: Option<DateTime<Utc>>,
    pub active: bool,
}

impl TrackedAgent {
    fn new(agent: Agent) -> Self {
        Self {
            agent,
            latest_batch_id: 0,
            last_check: None,
            active: true,
        }
    }
}

/// What one [`AgentRegistry::run`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub agents: usize,
    /// Agents whose batch could not be fetched
    pub skipped: usize,
    /// Agents found past their lifetime
    pub inactive: usize,
    pub containers: usize,
    /// Containers whose image was analysed
    pub analysed: usize,
}

/// What one [`AgentRegistry::cleanup`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub maintained: usize,
}

/// Concurrent map of tracked agents keyed by [`Agent::key`]
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, TrackedAgent>>,
    fetch: FetchPolicy,
}

impl AgentRegistry {
    pub fn new(fetch: FetchPolicy) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            fetch,
        }
    }

    /// Start tracking agents from the store that are not known yet.
    ///
    /// Returns the number of new agents. Nothing is removed here.
    pub async fn refresh(&self, store: &dyn Store) -> Result<usize> {
        let loaded = store.load_agents().await?;
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for agent in loaded {
            let key = agent.key();
            if agents.contains_key(&key) {
                continue;
            }
            info!(agent = %key, "New agent found");
            if agent.lifetime.is_zero() {
                warn!(agent = %key, "Agent declares a zero lifetime, it goes inactive after its first batch");
            }
            agents.insert(key, TrackedAgent::new(agent));
            added += 1;
        }
        Ok(added)
    }

    /// Fetch every agent's latest batch, dispatch container tasks on `ctx`,
    /// wait for them, then run reconciliation and backup.
    ///
    /// Containers of a batch seen before are only folded into the active
    /// model; a new batch also gets its images analysed.
    pub async fn run(&self, ctx: &TaskContext) -> RunReport {
        let mut report = RunReport::default();

        for tracked in self.snapshot() {
            report.agents += 1;
            let key = tracked.agent.key();

            let group = match fetch_container_group(&tracked.agent, ctx.backends.store.as_ref(), self.fetch).await {
                Ok(group) => group,
                Err(e) => {
                    error!(
                        agent = %key,
                        error = %e,
                        "Error fetching container group, agent is skipped this cycle"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            let now = Utc::now();
            if tracked.latest_batch_id != 0 && expired(group.id, tracked.agent.lifetime, now) {
                warn!(
                    agent = %key,
                    latest_batch = group.id,
                    lifetime = ?tracked.agent.lifetime,
                    "Agent exceeded its lifetime, marking inactive"
                );
                self.update(&key, |t| t.active = false);
                report.inactive += 1;
                continue;
            }

            let ops = if tracked.latest_batch_id == group.id {
                vec![ContainerOp::Running]
            } else {
                report.analysed += group.containers.len();
                vec![ContainerOp::Running, ContainerOp::Analyse]
            };
            report.containers += group.containers.len();
            debug!(agent = %key, batch = group.id, containers = group.containers.len(), ?ops, "Dispatching containers");

            for container in group.containers {
                ctx.dispatch_container(container, ops.clone());
            }

            self.update(&key, |t| {
                t.last_check = Some(now);
                t.latest_batch_id = group.id;
            });
        }

        ctx.completion.wait().await;

        let maintenance = ctx.fork(0);
        maintenance.dispatch_maintenance(vec![MaintenanceOp::Resolve, MaintenanceOp::Backup]);
        maintenance.completion.wait().await;

        report
    }

    /// Forget inactive agents and compact the batches of active ones.
    ///
    /// Deleting an inactive agent's data is best effort; a failing
    /// compaction aborts the cleanup.
    pub async fn cleanup(&self, store: &dyn Store) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for tracked in self.snapshot() {
            let key = tracked.agent.key();
            if !tracked.active {
                info!(
                    agent = %key,
                    last_batch = tracked.latest_batch_id,
                    last_check = ?tracked.last_check,
                    "Agent exceeded its lifetime and is removed"
                );
                self.remove(&key);
                if let Err(e) = store.delete_agent(&tracked.agent).await {
                    warn!(agent = %key, error = %e, "Failed to delete agent data");
                }
                report.removed += 1;
                continue;
            }

            // Nothing fetched yet, keep whatever the agent published
            if tracked.latest_batch_id == 0 {
                continue;
            }
            store.maintain(&tracked.agent, tracked.latest_batch_id).await?;
            report.maintained += 1;
        }
        Ok(report)
    }

    pub fn get(&self, key: &str) -> Option<TrackedAgent> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        agents.values().filter(|t| t.active).count()
    }

    fn snapshot(&self) -> Vec<TrackedAgent> {
        let agents = self.agents.read().unwrap_or_else(PoisonError::into_inner);
        let mut tracked: Vec<TrackedAgent> = agents.values().cloned().collect();
        tracked.sort_by_key(|t| t.agent.key());
        tracked
    }

    fn update<F: FnOnce(&mut TrackedAgent)>(&self, key: &str, apply: F) {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(tracked) = agents.get_mut(key) {
            apply(tracked);
        }
    }

    fn remove(&self, key: &str) {
        let mut agents = self.agents.write().unwrap_or_else(PoisonError::into_inner);
        agents.remove(key);
    }
}

fn expired(batch_id: i64, lifetime: Duration, now: DateTime<Utc>) -> bool {
    let Some(then) = Utc.timestamp_opt(batch_id, 0).single() else {
        return false;
    };
    match (now - then).to_std() {
        Ok(elapsed) => elapsed > lifetime,
        // Batch from the future
        Err(_) => false,
    }
}

/// Load an agent's latest container group, polling on failure.
///
/// After a failed first attempt the store is polled every
/// `policy.timeout / policy.retries` until a load succeeds or the timeout
/// elapses.
pub async fn fetch_container_group(
    agent: &Agent,
    store: &dyn Store,
    policy: FetchPolicy,
) -> Result<ContainerGroup> {
    let first = match store.load_container_group(agent).await {
        Ok(group) => return Ok(group),
        Err(e) => e,
    };

    let period = policy.period();
    warn!(agent = %agent, error = %first, retry_in = ?period, "Fetching container group failed, retrying");

    let polling = async {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match store.load_container_group(agent).await {
                Ok(group) => return group,
                Err(e) => {
                    warn!(agent = %agent, error = %e, retry_in = ?period, "Fetching container group failed, retrying");
                }
            }
        }
    };

    timeout(policy.timeout, polling)
        .await
        .map_err(|_| anyhow!("timeout fetching container group"))
}
