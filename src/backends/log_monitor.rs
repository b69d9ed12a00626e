//! Monitor that reports through the tracing pipeline

use crate::backends::{BackendConfig, ImageStack, Monitor, MonitorStatus};
use anyhow::Result;
use tracing::{info, warn};

/// Writes every push and resolution as a structured log event
#[derive(Debug, Clone, Default)]
pub struct LogMonitor {
    default_assignee: Option<String>,
}

impl LogMonitor {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            default_assignee: config.default_assignee.clone(),
        }
    }

    fn owners(&self, stack: &ImageStack) -> String {
        if stack.metadata.owners.is_empty() {
            return self.default_assignee.clone().unwrap_or_default();
        }
        stack.metadata.owners.join(",")
    }
}

#[async_trait::async_trait]
impl Monitor for LogMonitor {
    async fn push(&self, stack: &ImageStack, status: MonitorStatus) -> Result<()> {
        let findings = stack.vulnerabilities.cves.len();
        let owners = self.owners(stack);
        match status {
            MonitorStatus::Ok => info!(
                tag = %stack.metadata.tag,
                image_id = %stack.metadata.image_id,
                owners = %owners,
                containers = stack.containers.len(),
                "Image has no findings at or above threshold"
            ),
            _ => warn!(
                tag = %stack.metadata.tag,
                image_id = %stack.metadata.image_id,
                owners = %owners,
                containers = stack.containers.len(),
                findings,
                status = status.code(),
                "Image has vulnerabilities"
            ),
        }
        Ok(())
    }

    async fn resolve(&self, stack: &ImageStack) -> Result<()> {
        info!(
            tag = %stack.metadata.tag,
            image_id = %stack.metadata.image_id,
            owners = %self.owners(stack),
            "Image resolved"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Image;

    #[test]
    fn test_owner_fallback() {
        let mut config = BackendConfig::named("log");
        config.default_assignee = Some("secops".to_string());
        let monitor = LogMonitor::new(&config);

        let mut stack = ImageStack::default();
        assert_eq!(monitor.owners(&stack), "secops");

        stack.metadata = Image {
            owners: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        assert_eq!(monitor.owners(&stack), "a,b");
    }

    #[tokio::test]
    async fn test_push_and_resolve_never_fail() {
        let monitor = LogMonitor::default();
        let stack = ImageStack::default();
        assert!(monitor.push(&stack, MonitorStatus::Error).await.is_ok());
        assert!(monitor.push(&stack, MonitorStatus::Ok).await.is_ok());
        assert!(monitor.resolve(&stack).await.is_ok());
    }
}
