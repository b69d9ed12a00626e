//! Cycle orchestrator
//!
//! One cycle restores the monitored model (first cycle only), picks up new
//! agents, runs every agent's containers through the worker pool, reconciles
//! and backs up the monitored model, and finally cleans up agents. Cycles
//! never overlap: a tick arriving while a cycle is running is skipped.

use crate::backends::{Backends, Severity};
use crate::config::{ScheduleConfig, ServerConfig};
use crate::image::ImageModel;
use crate::manager::{AgentRegistry, CleanupReport, FetchPolicy, RunReport};
use crate::metrics::Metrics;
use crate::worker::{Dispatcher, MaintenanceOp, TaskContext, WaitGroup};
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one completed cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Agents picked up from the store this cycle
    pub new_agents: usize,
    pub run: RunReport,
    pub cleanup: CleanupReport,
    /// Records in the monitored model once the cycle finished
    pub monitored: usize,
    pub duration: Duration,
}

/// Owner of the long-lived state shared by all cycles
pub struct Orchestrator {
    schedule: ScheduleConfig,
    severity: Severity,
    backends: Backends,
    monitored: Arc<ImageModel>,
    registry: AgentRegistry,
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
    cycle: AtomicU64,
    in_flight: AtomicBool,
    refresh_on_restore: bool,
}

/// Clears the in-flight flag when a cycle ends, however it ends
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Orchestrator {
    /// Assemble the orchestrator and start its worker pool.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &ServerConfig, backends: Backends, metrics: Arc<Metrics>) -> Result<Self> {
        let dispatcher = Dispatcher::start(config.schedule.workers, Arc::clone(&metrics))
            .context("Failed to start worker pool")?;
        let fetch = FetchPolicy {
            timeout: config.schedule.fetch_timeout(),
            retries: config.schedule.fetch_retries,
        };

        Ok(Self {
            schedule: config.schedule.clone(),
            severity: config.scanner.severity_level,
            backends,
            monitored: Arc::new(ImageModel::new()),
            registry: AgentRegistry::new(fetch),
            dispatcher,
            metrics,
            cycle: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            refresh_on_restore: false,
        })
    }

    /// Push every restored record to the monitor again after the first restore
    pub fn with_refresh_on_restore(mut self, enabled: bool) -> Self {
        self.refresh_on_restore = enabled;
        self
    }

    /// Id of the last cycle started, 0 before the first one
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    pub fn monitored(&self) -> &Arc<ImageModel> {
        &self.monitored
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run one cycle unless another one is still running.
    ///
    /// Returns `Ok(None)` when the cycle was skipped.
    pub async fn run_cycle(&self) -> Result<Option<CycleReport>> {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            warn!(cycle = self.cycle(), "Previous cycle still running, skipping this tick");
            self.metrics.cycles_skipped_total.inc();
            return Ok(None);
        };

        let started = Instant::now();
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.execute(cycle, started).await;
        self.metrics
            .cycle_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                self.metrics.cycles_total.inc();
                Ok(Some(report))
            }
            Err(e) => {
                self.metrics.cycles_failed_total.inc();
                Err(e)
            }
        }
    }

    #[instrument(skip(self, started))]
    async fn execute(&self, cycle: u64, started: Instant) -> Result<CycleReport> {
        let store = self.backends.store.as_ref();

        if cycle == 1 {
            let mut ops = vec![MaintenanceOp::Restore];
            if self.refresh_on_restore {
                ops.push(MaintenanceOp::Refresh);
            }
            self.maintain(cycle, ops).await;
        }

        let new_agents = self
            .registry
            .refresh(store)
            .await
            .context("Failed to load agents")?;
        if new_agents > 0 {
            debug!(new_agents, "Tracking new agents");
        }

        let active = Arc::new(ImageModel::new());
        let ctx = self.context(cycle, active, self.schedule.task_retries);
        let run = self.registry.run(&ctx).await;

        let cleanup = self
            .registry
            .cleanup(store)
            .await
            .context("Failed to clean up agents")?;

        let monitored = self.monitored.len();
        self.metrics.monitored_images.set(monitored as i64);
        self.metrics
            .active_agents
            .set(self.registry.active_count() as i64);

        let report = CycleReport {
            cycle,
            new_agents,
            run,
            cleanup,
            monitored,
            duration: started.elapsed(),
        };
        info!(
            cycle,
            agents = run.agents,
            skipped = run.skipped,
            containers = run.containers,
            analysed = run.analysed,
            removed = cleanup.removed,
            monitored,
            duration = ?report.duration,
            "Cycle finished"
        );
        Ok(report)
    }

    /// Run one maintenance task outside the agent pass and wait for it
    async fn maintain(&self, cycle: u64, ops: Vec<MaintenanceOp>) {
        let ctx = self.context(cycle, Arc::new(ImageModel::new()), 0);
        ctx.dispatch_maintenance(ops);
        ctx.completion.wait().await;
    }

    fn context(&self, cycle: u64, active: Arc<ImageModel>, retries: usize) -> TaskContext {
        TaskContext {
            active,
            monitored: Arc::clone(&self.monitored),
            backends: self.backends.clone(),
            severity: self.severity,
            retries,
            cycle,
            completion: WaitGroup::new(),
            queue: self.dispatcher.queue(),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Run cycles on the configured interval until `shutdown` resolves,
    /// then let the running cycle finish and stop the worker pool.
    pub async fn run_forever<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.schedule.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(interval = ?self.schedule.interval(), "Starting cycle scheduler");
        let mut current: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let orchestrator = Arc::clone(&self);
                    let handle = tokio::spawn(async move {
                        if let Err(e) = orchestrator.run_cycle().await {
                            error!(error = %e, "Cycle failed");
                        }
                    });
                    // Skipped ticks return at once, keep waiting on the running cycle
                    match &current {
                        Some(running) if !running.is_finished() => {}
                        _ => current = Some(handle),
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        if let Some(handle) = current {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cycle terminated abnormally");
            }
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stop the worker pool
    pub async fn shutdown(&self) {
        self.dispatcher.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory_store::MemoryStore;
    use crate::backends::{Agent, Container, Store};
    use crate::image::State;
    use crate::worker::task::tests::{NullMonitor, NullScanner};
    use chrono::Utc;

    fn backends(store: Arc<MemoryStore>) -> Backends {
        Backends {
            scanner: Arc::new(NullScanner),
            monitor: Arc::new(NullMonitor),
            store,
        }
    }

    fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.schedule.workers = 2;
        config.schedule.fetch_timeout_secs = 1;
        config.schedule.fetch_retries = 1;
        config
    }

    #[tokio::test]
    async fn test_cycles_are_numbered() {
        let store = Arc::new(MemoryStore::new());
        let agent = Agent {
            hostname: "node-1".to_string(),
            host_id: "docker".to_string(),
            version: "1.0".to_string(),
            disambiguator: "a".to_string(),
            lifetime: Duration::from_secs(3600),
        };
        let container = Container {
            name: "web".to_string(),
            id: "c1".to_string(),
            hostname: "node-1".to_string(),
            image: "nginx:1.25".to_string(),
            image_id: "sha256:1".to_string(),
            owner: "web-team".to_string(),
            timestamp: Utc::now(),
        };
        store.store_container(&container, &agent).await.unwrap();

        let metrics = Arc::new(Metrics::new().unwrap());
        let orchestrator = Orchestrator::new(&config(), backends(store), Arc::clone(&metrics)).unwrap();

        let first = orchestrator.run_cycle().await.unwrap().unwrap();
        assert_eq!(first.cycle, 1);
        assert_eq!(first.new_agents, 1);
        assert_eq!(first.run.analysed, 1);
        assert_eq!(first.monitored, 1);
        assert_eq!(
            orchestrator.monitored().read("sha256:1").unwrap().state,
            State::Monitored
        );

        let second = orchestrator.run_cycle().await.unwrap().unwrap();
        assert_eq!(second.cycle, 2);
        assert_eq!(second.new_agents, 0);
        assert_eq!(second.run.analysed, 0);
        assert_eq!(metrics.cycles_total.get(), 2);
        assert_eq!(metrics.monitored_images.get(), 1);
        assert_eq!(metrics.active_agents.get(), 1);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_tick_during_cycle_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let orchestrator = Orchestrator::new(&config(), backends(store), Arc::clone(&metrics)).unwrap();

        let guard = FlightGuard::acquire(&orchestrator.in_flight).unwrap();
        assert!(orchestrator.run_cycle().await.unwrap().is_none());
        assert_eq!(orchestrator.cycle(), 0);
        assert_eq!(metrics.cycles_skipped_total.get(), 1);

        drop(guard);
        assert!(orchestrator.run_cycle().await.unwrap().is_some());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_forever_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let orchestrator =
            Arc::new(Orchestrator::new(&config(), backends(store), Arc::clone(&metrics)).unwrap());

        let shutdown = tokio::time::sleep(Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(5), Arc::clone(&orchestrator).run_forever(shutdown))
            .await
            .unwrap()
            .unwrap();

        // The first tick fires immediately
        assert_eq!(orchestrator.cycle(), 1);
        assert_eq!(metrics.cycles_total.get(), 1);
    }
}
