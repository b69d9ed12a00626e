//! Monitor forwarding to several monitors

use crate::backends::{ImageStack, Monitor, MonitorStatus};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::warn;

/// Delivers each call to every wrapped monitor.
///
/// All monitors are attempted even when one fails; the call fails if any
/// of them did.
pub struct FanoutMonitor {
    monitors: Vec<Arc<dyn Monitor>>,
}

impl FanoutMonitor {
    pub fn new(monitors: Vec<Arc<dyn Monitor>>) -> Self {
        Self { monitors }
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }
}

fn combine(operation: &str, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "{} failed on {} monitor(s): {}",
        operation,
        errors.len(),
        errors.join("; ")
    ))
}

#[async_trait::async_trait]
impl Monitor for FanoutMonitor {
    async fn push(&self, stack: &ImageStack, status: MonitorStatus) -> Result<()> {
        let mut errors = Vec::new();
        for (index, monitor) in self.monitors.iter().enumerate() {
            if let Err(e) = monitor.push(stack, status).await {
                warn!(monitor = index, tag = %stack.metadata.tag, error = %e, "Push failed");
                errors.push(e.to_string());
            }
        }
        combine("push", errors)
    }

    async fn resolve(&self, stack: &ImageStack) -> Result<()> {
        let mut errors = Vec::new();
        for (index, monitor) in self.monitors.iter().enumerate() {
            if let Err(e) = monitor.resolve(stack).await {
                warn!(monitor = index, tag = %stack.metadata.tag, error = %e, "Resolve failed");
                errors.push(e.to_string());
            }
        }
        combine("resolve", errors)
    }
}
