//! Fixed-size worker pool
//!
//! Each worker owns a single-slot channel and announces that it is idle by
//! handing a sender for that channel to the dispatcher. The dispatcher
//! pulls tasks from the shared queue and forwards each one to the next idle
//! worker, so at most `size` tasks run at any time.
//!
//! Stopping is cooperative: a worker finishes the task it is running and
//! then exits. Tasks still queued are released from their wait groups.

use crate::metrics::{Metrics, TASK_SUCCEEDED};
use crate::worker::task::{Task, TaskQueue};
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type TaskSender = mpsc::Sender<Box<dyn Task>>;

/// Owner of the workers and the dispatch loop
pub struct Dispatcher {
    size: usize,
    queue: TaskQueue,
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `size` workers and the dispatch loop
    pub fn start(size: usize, metrics: Arc<Metrics>) -> Result<Self> {
        if size == 0 {
            return Err(anyhow!("worker pool needs at least one worker"));
        }

        let (task_tx, task_rx) = mpsc::unbounded_channel::<Box<dyn Task>>();
        let (idle_tx, idle_rx) = mpsc::channel::<TaskSender>(size);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(size + 1);
        for id in 0..size {
            handles.push(tokio::spawn(worker_loop(
                id,
                idle_tx.clone(),
                stop_rx.clone(),
                Arc::clone(&metrics),
            )));
        }
        handles.push(tokio::spawn(dispatch_loop(task_rx, idle_rx, stop_rx)));

        info!(workers = size, "Worker pool started");
        Ok(Self {
            size,
            queue: TaskQueue::new(task_tx),
            stop_tx,
            handles: Mutex::new(handles),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Handle for submitting tasks
    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    /// Signal every worker to stop after its current task and wait for them
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker terminated abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    idle: mpsc::Sender<TaskSender>,
    mut stop: watch::Receiver<bool>,
    metrics: Arc<Metrics>,
) {
    let (tx, mut rx) = mpsc::channel::<Box<dyn Task>>(1);
    loop {
        if *stop.borrow() {
            break;
        }
        if idle.send(tx.clone()).await.is_err() {
            break;
        }

        let mut task = tokio::select! {
            _ = stop.changed() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        match task.run().await {
            Ok(()) => {
                debug!(worker = id, task = %task.label(), "Task finished");
                metrics.record_task(TASK_SUCCEEDED);
                task.deregister();
            }
            Err(e) => {
                warn!(worker = id, task = %task.label(), error = %e, "Task failed");
                task.retry();
            }
        }
    }
    debug!(worker = id, "Worker stopped");
}

async fn dispatch_loop(
    mut tasks: mpsc::UnboundedReceiver<Box<dyn Task>>,
    mut idle: mpsc::Receiver<TaskSender>,
    mut stop: watch::Receiver<bool>,
) {
    'dispatch: loop {
        let mut task = tokio::select! {
            biased;
            _ = stop.changed() => break,
            task = tasks.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        // Block until a worker is idle; a worker that exited meanwhile
        // hands the task back and the next one is tried
        loop {
            let worker = tokio::select! {
                biased;
                _ = stop.changed() => {
                    task.deregister();
                    break 'dispatch;
                }
                worker = idle.recv() => worker,
            };
            let Some(worker) = worker else {
                task.deregister();
                break 'dispatch;
            };
            match worker.send(task).await {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => task = returned,
            }
        }
    }

    tasks.close();
    let mut released = 0;
    while let Ok(mut task) = tasks.try_recv() {
        task.deregister();
        released += 1;
    }
    if released > 0 {
        warn!(count = released, "Released queued tasks on shutdown");
    }
}
