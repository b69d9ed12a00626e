//! Units of work executed by the pool
//!
//! A task is registered on its cycle's [`WaitGroup`] once, when it is
//! created, and deregistered once, when it either succeeds or is dropped
//! after exhausting its retry budget. Resubmitting a task for a retry does
//! not register it again.

use crate::backends::{Backends, Container, Severity};
use crate::image::{lifecycle, Action, ImageModel};
use crate::metrics::{Metrics, TASK_DROPPED, TASK_RETRIED};
use anyhow::Result;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct WaitGroupInner {
    pending: AtomicUsize,
    notify: Notify,
}

/// Counter of outstanding tasks that can be awaited until it reaches zero
#[derive(Debug, Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, count: usize) {
        self.inner.pending.fetch_add(count, Ordering::SeqCst);
    }

    /// Mark one task finished. Extra calls at zero are ignored.
    pub fn done(&self) {
        let previous = self
            .inner
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.inner.notify.notify_waiters(),
            Ok(_) => {}
            Err(_) => warn!("Wait group released more often than registered"),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Resolve once every registered task is done
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking to not miss a wakeup
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Membership of one task in a wait group
#[derive(Debug, Default)]
pub struct Registration {
    group: Option<WaitGroup>,
}

impl Registration {
    /// Join `group`; a task already registered stays with its first group
    pub fn register(&mut self, group: &WaitGroup) {
        if self.group.is_none() {
            group.add(1);
            self.group = Some(group.clone());
        }
    }

    /// Leave the group; only the first call has an effect
    pub fn deregister(&mut self) {
        if let Some(group) = self.group.take() {
            group.done();
        }
    }

    #[cfg(test)]
    fn is_registered(&self) -> bool {
        self.group.is_some()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // A task lost without finishing must not block its cycle forever
        self.deregister();
    }
}

/// Contract shared by every task kind
#[async_trait::async_trait]
pub trait Task: Send {
    /// Short description used in logs
    fn label(&self) -> String;

    /// Execute the task's pipeline
    async fn run(&mut self) -> Result<()>;

    /// Resubmit after a failure, or drop the task once its budget is spent
    fn retry(self: Box<Self>);

    /// Join the completion group of the task's cycle
    fn register(&mut self);

    /// Leave the completion group
    fn deregister(&mut self);
}

/// Sending side of the pool's task queue
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Box<dyn Task>>,
}

impl TaskQueue {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Box<dyn Task>>) -> Self {
        Self { tx }
    }

    /// Queue a task. If the pool is gone the task is released immediately.
    pub fn submit(&self, task: Box<dyn Task>) {
        if let Err(mpsc::error::SendError(mut task)) = self.tx.send(task) {
            warn!(task = %task.label(), "Task queue closed, dropping task");
            task.deregister();
        }
    }
}

/// Everything a task of one cycle needs
#[derive(Clone)]
pub struct TaskContext {
    /// Images observed in this cycle
    pub active: Arc<ImageModel>,
    /// Long-lived monitored images
    pub monitored: Arc<ImageModel>,
    pub backends: Backends,
    pub severity: Severity,
    /// Remaining retries of a task created from this context
    pub retries: usize,
    pub cycle: u64,
    pub completion: WaitGroup,
    pub queue: TaskQueue,
    pub metrics: Arc<Metrics>,
}

impl TaskContext {
    /// Copy of this context with its own completion group and retry budget
    pub fn fork(&self, retries: usize) -> Self {
        Self {
            retries,
            completion: WaitGroup::new(),
            ..self.clone()
        }
    }

    /// Create, register and queue a container task
    pub fn dispatch_container(&self, container: Container, ops: Vec<ContainerOp>) {
        let mut task = ContainerTask::new(self.clone(), container, ops);
        task.register();
        self.queue.submit(Box::new(task));
    }

    /// Create, register and queue a maintenance task
    pub fn dispatch_maintenance(&self, ops: Vec<MaintenanceOp>) {
        let mut task = MaintenanceTask::new(self.clone(), ops);
        task.register();
        self.queue.submit(Box::new(task));
    }

    /// Spend one retry; `false` once the budget is exhausted
    fn take_retry(&mut self, label: &str) -> bool {
        if self.retries == 0 {
            warn!(task = %label, cycle = self.cycle, "Retry budget exhausted, dropping task for this cycle");
            self.metrics.record_task(TASK_DROPPED);
            return false;
        }
        self.retries -= 1;
        debug!(task = %label, remaining = self.retries, "Retrying task");
        self.metrics.record_task(TASK_RETRIED);
        true
    }
}

/// Step of a container task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerOp {
    /// Fold the container into the active model
    Running,
    /// Scan the container's image and push it to the monitor
    Analyse,
}

impl fmt::Display for ContainerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerOp::Running => f.write_str("running"),
            ContainerOp::Analyse => f.write_str("analyse"),
        }
    }
}

/// Step of a maintenance task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOp {
    /// Load persisted monitored images
    Restore,
    /// Persist monitored images
    Backup,
    /// Reconcile monitored against active images
    Resolve,
    /// Push every monitored image again
    Refresh,
}

impl fmt::Display for MaintenanceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MaintenanceOp::Restore => "restore",
            MaintenanceOp::Backup => "backup",
            MaintenanceOp::Resolve => "resolve",
            MaintenanceOp::Refresh => "refresh",
        };
        f.write_str(name)
    }
}

/// Task bound to one observed container
pub struct ContainerTask {
    ctx: TaskContext,
    container: Container,
    ops: Vec<ContainerOp>,
    registration: Registration,
}

impl ContainerTask {
    pub fn new(ctx: TaskContext, container: Container, ops: Vec<ContainerOp>) -> Self {
        Self {
            ctx,
            container,
            ops,
            registration: Registration::default(),
        }
    }

    async fn apply(&self, op: ContainerOp) -> Result<()> {
        let ctx = &self.ctx;
        match op {
            ContainerOp::Running => {
                ctx.active.create_or_merge(&self.container);
            }
            ContainerOp::Analyse => {
                let scanned = lifecycle::analyse(
                    &ctx.monitored,
                    &self.container,
                    ctx.cycle,
                    ctx.backends.scanner.as_ref(),
                )
                .await?;
                if let Some(status) = scanned {
                    lifecycle::monitor(
                        &ctx.monitored,
                        &status,
                        ctx.cycle,
                        ctx.backends.monitor.as_ref(),
                        ctx.severity,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Task for ContainerTask {
    fn label(&self) -> String {
        let ops: Vec<String> = self.ops.iter().map(ToString::to_string).collect();
        format!("container {} [{}]", self.container.id, ops.join(","))
    }

    async fn run(&mut self) -> Result<()> {
        for op in self.ops.clone() {
            self.apply(op).await?;
        }
        Ok(())
    }

    fn retry(mut self: Box<Self>) {
        let label = self.label();
        if self.ctx.take_retry(&label) {
            let queue = self.ctx.queue.clone();
            queue.submit(self);
        } else {
            self.deregister();
        }
    }

    fn register(&mut self) {
        self.registration.register(&self.ctx.completion);
    }

    fn deregister(&mut self) {
        self.registration.deregister();
    }
}

/// Fleet-wide task not bound to a container
pub struct MaintenanceTask {
    ctx: TaskContext,
    ops: Vec<MaintenanceOp>,
    registration: Registration,
}

impl MaintenanceTask {
    pub fn new(ctx: TaskContext, ops: Vec<MaintenanceOp>) -> Self {
        Self {
            ctx,
            ops,
            registration: Registration::default(),
        }
    }

    async fn apply(&self, op: MaintenanceOp) -> Result<()> {
        let ctx = &self.ctx;
        let store = ctx.backends.store.as_ref();
        let monitor = ctx.backends.monitor.as_ref();
        match op {
            MaintenanceOp::Restore => {
                lifecycle::restore(&ctx.monitored, store).await?;
            }
            MaintenanceOp::Backup => {
                let count = lifecycle::backup(&ctx.monitored, store).await?;
                debug!(count, cycle = ctx.cycle, "Backed up monitored images");
            }
            MaintenanceOp::Resolve => {
                let summary = lifecycle::resolve(
                    &ctx.monitored,
                    &ctx.active,
                    ctx.cycle,
                    monitor,
                    store,
                    ctx.severity,
                )
                .await?;
                ctx.metrics.record_actions(Action::Update, summary.updated);
                ctx.metrics
                    .record_actions(Action::PartlyResolve, summary.partly_resolved);
                ctx.metrics
                    .record_actions(Action::FullyResolve, summary.fully_resolved);
                if summary.total() > 0 {
                    info!(
                        cycle = ctx.cycle,
                        updated = summary.updated,
                        partly_resolved = summary.partly_resolved,
                        fully_resolved = summary.fully_resolved,
                        "Reconciled monitored images"
                    );
                }
            }
            MaintenanceOp::Refresh => {
                let count = lifecycle::refresh(&ctx.monitored, monitor, ctx.severity).await?;
                info!(count, "Pushed monitored images again");
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Task for MaintenanceTask {
    fn label(&self) -> String {
        let ops: Vec<String> = self.ops.iter().map(ToString::to_string).collect();
        format!("maintenance [{}]", ops.join(","))
    }

    async fn run(&mut self) -> Result<()> {
        for op in self.ops.clone() {
            self.apply(op).await?;
        }
        Ok(())
    }

    fn retry(mut self: Box<Self>) {
        let label = self.label();
        if self.ctx.take_retry(&label) {
            let queue = self.ctx.queue.clone();
            queue.submit(self);
        } else {
            self.deregister();
        }
    }

    fn register(&mut self) {
        self.registration.register(&self.ctx.completion);
    }

    fn deregister(&mut self) {
        self.registration.deregister();
    }
}
