//! Per-image monitoring records
//!
//! An [`ImageStatus`] is the record kept for one image id: the image and its
//! owners, the containers currently running it, the latest findings, the
//! lifecycle [`State`] and the pending reconciliation [`Action`].
//!
//! [`ImageModel`] is the concurrent map holding those records. Two models
//! exist while the server runs: the long-lived *monitored* model and the
//! per-cycle *active* model that collects what agents reported.

use crate::backends::{Container, Image, ImageStack, Monitor, MonitorStatus, Scan, Severity, Vulnerabilities};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

pub mod lifecycle;
pub mod reconcile;
pub mod severity;

pub use reconcile::compare;

/// Lifecycle state of an image record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Seen, not analysed yet
    #[default]
    Running,
    /// Scan in flight
    Scanning,
    /// Findings attached
    Scanned,
    /// Pushed to the monitor
    Monitored,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Running => "running",
            State::Scanning => "scanning",
            State::Scanned => "scanned",
            State::Monitored => "monitored",
        };
        f.write_str(name)
    }
}

/// Pending operation decided by reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Noop,
    /// Containers changed, push again
    Update,
    /// Some owners vanished, report them as resolved
    PartlyResolve,
    /// Image no longer observed anywhere
    FullyResolve,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Noop => "noop",
            Action::Update => "update",
            Action::PartlyResolve => "partly_resolve",
            Action::FullyResolve => "fully_resolve",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitoring record for one image id
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageStatus {
    pub stack: ImageStack,
    pub state: State,
    pub action: Action,
    /// Cycle in which `state` last changed
    pub state_changed_at: u64,
}

impl ImageStatus {
    /// New `Running` record holding a single container and owner
    pub fn from_container(container: &Container) -> Self {
        Self {
            stack: ImageStack {
                metadata: Image {
                    tag: container.image.clone(),
                    image_id: container.image_id.clone(),
                    batch_id: container.timestamp.timestamp(),
                    owners: vec![container.owner.clone()],
                },
                vulnerabilities: Vulnerabilities::default(),
                containers: vec![container.clone()],
            },
            ..Default::default()
        }
    }

    /// Record rebuilt from a persisted stack
    pub fn from_stack(stack: ImageStack, state: State, cycle: u64) -> Self {
        Self {
            stack,
            state,
            action: Action::Noop,
            state_changed_at: cycle,
        }
    }

    pub fn image_id(&self) -> &str {
        &self.stack.metadata.image_id
    }

    pub fn tag(&self) -> &str {
        &self.stack.metadata.tag
    }

    pub fn owners(&self) -> &[String] {
        &self.stack.metadata.owners
    }

    pub fn containers(&self) -> &[Container] {
        &self.stack.containers
    }

    /// Fold a container into this record.
    ///
    /// Containers are deduplicated by id and owners by value; the state is
    /// left untouched. Returns whether anything was added.
    pub fn merge(&mut self, container: &Container) -> bool {
        let mut changed = false;
        if !self.stack.containers.iter().any(|c| c.id == container.id) {
            self.stack.containers.push(container.clone());
            changed = true;
        }
        if !self.stack.metadata.owners.contains(&container.owner) {
            self.stack.metadata.owners.push(container.owner.clone());
            changed = true;
        }
        changed
    }

    /// Ask the scanner for the findings of this image
    pub async fn scan(&self, scanner: &dyn Scan) -> Result<Vulnerabilities> {
        scanner
            .scan(&self.stack.metadata)
            .await
            .map_err(|e| anyhow!("Image: {} - {}", self.tag(), e))
    }

    /// Push the findings at or above `threshold` to the monitor
    pub async fn monitor(&self, monitor: &dyn Monitor, threshold: Severity) -> Result<MonitorStatus> {
        let mut stack = self.stack.clone();
        stack.vulnerabilities.cves = severity::filter_findings(&stack.vulnerabilities.cves, threshold);
        let status = severity::evaluate_status(&stack.vulnerabilities.cves, threshold);

        info!(
            image = %self.tag(),
            count = stack.vulnerabilities.cves.len(),
            severity = %threshold,
            "Vulnerabilities found"
        );

        monitor.push(&stack, status).await?;
        Ok(status)
    }

    /// Report the image as resolved
    pub async fn resolve(&self, monitor: &dyn Monitor) -> Result<()> {
        monitor.resolve(&self.stack).await
    }
}

/// Concurrent map of image records keyed by image id.
///
/// Each call locks the map once, so single-key operations are atomic.
/// Nothing spans several keys.
#[derive(Debug, Default)]
pub struct ImageModel {
    images: RwLock<HashMap<String, ImageStatus>>,
}

impl ImageModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `Running` record for the container's image, or merge the
    /// container into the existing one without changing its state
    pub fn create_or_merge(&self, container: &Container) -> ImageStatus {
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        match images.get_mut(&container.image_id) {
            Some(existing) => {
                if existing.merge(container) {
                    debug!(
                        image = %container.image,
                        id = %container.image_id,
                        owner = %container.owner,
                        state = %existing.state,
                        "Image exists, added container and owner"
                    );
                }
                existing.clone()
            }
            None => {
                debug!(
                    image = %container.image,
                    id = %container.image_id,
                    owner = %container.owner,
                    "Add new image"
                );
                let status = ImageStatus::from_container(container);
                images.insert(container.image_id.clone(), status.clone());
                status
            }
        }
    }

    /// Insert or replace a record
    pub fn insert(&self, status: ImageStatus) {
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        images.insert(status.image_id().to_string(), status);
    }

    /// Set the state of a record; `None` if it no longer exists
    pub fn update_state(&self, id: &str, state: State, cycle: u64) -> Option<ImageStatus> {
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        let status = images.get_mut(id)?;
        status.state = state;
        status.state_changed_at = cycle;
        Some(status.clone())
    }

    /// Move a record to `Scanning` unless a scan is already in flight.
    ///
    /// Returns the record when this caller owns the scan.
    pub fn begin_scan(&self, id: &str, cycle: u64) -> Option<ImageStatus> {
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        let status = images.get_mut(id)?;
        if status.state == State::Scanning {
            return None;
        }
        status.state = State::Scanning;
        status.state_changed_at = cycle;
        Some(status.clone())
    }

    /// Attach findings and move the record to `Scanned`
    pub fn complete_scan(&self, id: &str, vulnerabilities: Vulnerabilities, cycle: u64) -> Option<ImageStatus> {
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        let status = images.get_mut(id)?;
        status.stack.vulnerabilities = vulnerabilities;
        status.state = State::Scanned;
        status.state_changed_at = cycle;
        Some(status.clone())
    }

    pub fn read(&self, id: &str) -> Option<ImageStatus> {
        let images = self.images.read().unwrap_or_else(PoisonError::into_inner);
        images.get(id).cloned()
    }

    pub fn delete(&self, id: &str) -> Option<ImageStatus> {
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        images.remove(id)
    }

    /// Drop every record
    pub fn reset(&self) {
        let mut images = self.images.write().unwrap_or_else(PoisonError::into_inner);
        images.clear();
    }

    /// Visit a snapshot of all records until the visitor returns `false`.
    ///
    /// The map is not locked while visiting, so the visitor may modify the
    /// model; changes made meanwhile by others are not reflected.
    pub fn range<F>(&self, mut visitor: F)
    where
        F: FnMut(&ImageStatus) -> bool,
    {
        for status in self.snapshot() {
            if !visitor(&status) {
                break;
            }
        }
    }

    /// Copy of every record, sorted by image id
    pub fn snapshot(&self) -> Vec<ImageStatus> {
        let images = self.images.read().unwrap_or_else(PoisonError::into_inner);
        let mut records: Vec<ImageStatus> = images.values().cloned().collect();
        records.sort_by(|a, b| a.image_id().cmp(b.image_id()));
        records
    }

    pub fn len(&self) -> usize {
        self.images.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records in `state`
    pub fn count_in(&self, state: State) -> usize {
        let images = self.images.read().unwrap_or_else(PoisonError::into_inner);
        images.values().filter(|s| s.state == state).count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    pub(crate) fn container(id: &str, image_id: &str, owner: &str) -> Container {
        Container {
            name: format!("name-{}", id),
            id: id.to_string(),
            hostname: "node".to_string(),
            image: format!("{}:latest", image_id),
            image_id: image_id.to_string(),
            owner: owner.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_state_names() {
        assert_eq!(State::Monitored.to_string(), "monitored");
        let parsed: State = serde_json::from_str("\"scanned\"").unwrap();
        assert_eq!(parsed, State::Scanned);
        // Resolved records are dropped from the model instead of kept in a state
        assert!(serde_json::from_str::<State>("\"resolved\"").is_err());
    }

    #[test]
    fn test_create_then_merge() {
        let model = ImageModel::new();
        let created = model.create_or_merge(&container("c1", "img1", "o1"));
        assert_eq!(created.state, State::Running);
        assert_eq!(created.owners(), ["o1".to_string()]);
        assert_eq!(created.containers().len(), 1);

        let merged = model.create_or_merge(&container("c2", "img1", "o2"));
        assert_eq!(merged.owners(), ["o1".to_string(), "o2".to_string()]);
        assert_eq!(merged.containers().len(), 2);
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let model = ImageModel::new();
        let c = container("c1", "img1", "o1");
        model.create_or_merge(&c);
        let again = model.create_or_merge(&c);
        assert_eq!(again.containers().len(), 1);
        assert_eq!(again.owners().len(), 1);
    }

    #[test]
    fn test_merge_keeps_state() {
        let model = ImageModel::new();
        model.create_or_merge(&container("c1", "img1", "o1"));
        model.update_state("img1", State::Monitored, 3);

        let merged = model.create_or_merge(&container("c2", "img1", "o1"));
        assert_eq!(merged.state, State::Monitored);
        assert_eq!(merged.state_changed_at, 3);
        assert_eq!(merged.containers().len(), 2);
    }

    #[test]
    fn test_update_state_of_missing_record() {
        let model = ImageModel::new();
        assert!(model.update_state("gone", State::Scanned, 1).is_none());
    }

    #[test]
    fn test_begin_scan_is_exclusive() {
        let model = ImageModel::new();
        model.create_or_merge(&container("c1", "img1", "o1"));

        assert!(model.begin_scan("img1", 1).is_some());
        assert!(model.begin_scan("img1", 1).is_none());

        let scanned = model
            .complete_scan("img1", Vulnerabilities::default(), 1)
            .unwrap();
        assert_eq!(scanned.state, State::Scanned);
        assert!(model.begin_scan("img1", 2).is_some());
    }

    #[test]
    fn test_range_allows_mutation() {
        let model = ImageModel::new();
        model.create_or_merge(&container("c1", "img1", "o1"));
        model.create_or_merge(&container("c2", "img2", "o1"));

        let mut visited = Vec::new();
        model.range(|status| {
            visited.push(status.image_id().to_string());
            model.delete(status.image_id());
            true
        });
        assert_eq!(visited, vec!["img1", "img2"]);
        assert!(model.is_empty());
    }

    #[test]
    fn test_range_stops_early() {
        let model = ImageModel::new();
        model.create_or_merge(&container("c1", "img1", "o1"));
        model.create_or_merge(&container("c2", "img2", "o1"));

        let mut count = 0;
        model.range(|_| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn test_reset_and_count() {
        let model = ImageModel::new();
        model.create_or_merge(&container("c1", "img1", "o1"));
        model.create_or_merge(&container("c2", "img2", "o1"));
        model.update_state("img2", State::Monitored, 1);

        assert_eq!(model.count_in(State::Monitored), 1);
        assert_eq!(model.count_in(State::Running), 1);

        model.reset();
        assert!(model.is_empty());
    }
}
