//! Lifecycle operations on image records
//!
//! These are the steps tasks run: analysing a container's image, pushing
//! it to the monitor, restoring and backing up the monitored model, and
//! executing the actions reconciliation decides on.

use crate::backends::{stack_key, Container, Monitor, MonitorStatus, Scan, Severity, Store};
use crate::image::{compare, Action, ImageModel, ImageStatus, State};
use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

/// Store prefix under which monitored records are persisted
pub const BACKUP_PREFIX: &str = "backup/monitored";

/// Counts of actions executed by [`resolve`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    pub updated: usize,
    pub partly_resolved: usize,
    pub fully_resolved: usize,
}

impl ResolveSummary {
    pub fn total(&self) -> usize {
        self.updated + self.partly_resolved + self.fully_resolved
    }
}

/// Fold the container into `model` and scan its image.
///
/// Returns `None` when a scan for the image is already in flight or the
/// record disappeared meanwhile. A failed scan moves the record back to
/// `Running` so the next cycle tries again.
pub async fn analyse(
    model: &ImageModel,
    container: &Container,
    cycle: u64,
    scanner: &dyn Scan,
) -> Result<Option<ImageStatus>> {
    let merged = model.create_or_merge(container);

    let Some(scanning) = model.begin_scan(merged.image_id(), cycle) else {
        debug!(
            image = %merged.tag(),
            id = %merged.image_id(),
            owner = ?merged.owners(),
            "Image is currently being scanned, not analysing it again"
        );
        return Ok(None);
    };

    let vulnerabilities = match scanning.scan(scanner).await {
        Ok(vulnerabilities) => vulnerabilities,
        Err(e) => {
            model.update_state(scanning.image_id(), State::Running, cycle);
            return Err(e);
        }
    };

    Ok(model.complete_scan(scanning.image_id(), vulnerabilities, cycle))
}

/// Push a record to the monitor and mark it `Monitored`
pub async fn monitor(
    model: &ImageModel,
    status: &ImageStatus,
    cycle: u64,
    monitor: &dyn Monitor,
    threshold: Severity,
) -> Result<MonitorStatus> {
    let pushed = status.monitor(monitor, threshold).await?;
    if model
        .update_state(status.image_id(), State::Monitored, cycle)
        .is_none()
    {
        debug!(id = %status.image_id(), "Image was removed while being monitored");
    }
    Ok(pushed)
}

/// Load persisted records into `model` as `Monitored`
pub async fn restore(model: &ImageModel, store: &dyn Store) -> Result<usize> {
    let stacks = store.load_image_stacks(BACKUP_PREFIX).await?;
    let count = stacks.len();
    for stack in stacks {
        model.insert(ImageStatus::from_stack(stack, State::Monitored, 0));
    }
    info!(count, "Restored monitored images");
    Ok(count)
}

/// Persist every `Monitored` record; stops at the first store error
pub async fn backup(model: &ImageModel, store: &dyn Store) -> Result<usize> {
    let mut count = 0;
    for status in model.snapshot() {
        if status.state != State::Monitored {
            debug!(
                image = %status.tag(),
                id = %status.image_id(),
                state = %status.state,
                "Image is not monitored yet, not backing it up"
            );
            continue;
        }
        store.store_image_stack(&status.stack, BACKUP_PREFIX).await?;
        count += 1;
    }
    Ok(count)
}

/// Reconcile `monitored` against `active` and execute the resulting actions.
///
/// - `Update`: push again and keep the refreshed record
/// - `PartlyResolve`: report the missing owners as resolved, then re-seed
///   the record from what is still running
/// - `FullyResolve`: report the image as resolved and forget it
///
/// The first monitor or store error aborts the remaining actions.
pub async fn resolve(
    monitored: &ImageModel,
    active: &ImageModel,
    cycle: u64,
    monitor: &dyn Monitor,
    store: &dyn Store,
    threshold: Severity,
) -> Result<ResolveSummary> {
    let mut summary = ResolveSummary::default();

    for mut record in compare(monitored, active, cycle) {
        match record.action {
            Action::Update => {
                record.monitor(monitor, threshold).await?;
                record.action = Action::Noop;
                record.state = State::Monitored;
                record.state_changed_at = cycle;
                monitored.insert(record);
                summary.updated += 1;
            }
            Action::PartlyResolve | Action::FullyResolve => {
                record.resolve(monitor).await?;
                forget(monitored, &record);
                store.delete(&stack_key(BACKUP_PREFIX, record.image_id())).await?;

                if record.action == Action::PartlyResolve {
                    reseed(monitored, active, &record, cycle);
                    summary.partly_resolved += 1;
                } else {
                    summary.fully_resolved += 1;
                }
            }
            Action::Noop => return Err(anyhow!("Invalid state of resolvable image {}", record.image_id())),
        }
    }

    Ok(summary)
}

/// Push every `Monitored` record again.
///
/// All records are attempted; the first error is returned afterwards.
pub async fn refresh(model: &ImageModel, monitor: &dyn Monitor, threshold: Severity) -> Result<usize> {
    let mut pushed = 0;
    let mut first_error = None;
    for status in model.snapshot() {
        if status.state != State::Monitored {
            continue;
        }
        match status.monitor(monitor, threshold).await {
            Ok(_) => pushed += 1,
            Err(e) => {
                warn!(image = %status.tag(), error = %e, "Failed to refresh image");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(pushed),
    }
}

fn forget(monitored: &ImageModel, record: &ImageStatus) {
    info!(
        image = %record.tag(),
        id = %record.image_id(),
        owner = ?record.owners(),
        "Deleting image from monitored list"
    );
    monitored.delete(record.image_id());
}

// Remaining owners stay monitored: rebuild the record from the active view
// and keep the findings already reported.
fn reseed(monitored: &ImageModel, active: &ImageModel, resolved: &ImageStatus, cycle: u64) {
    let Some(mut observed) = active.read(resolved.image_id()) else {
        return;
    };
    observed.stack.vulnerabilities = resolved.stack.vulnerabilities.clone();
    observed.state = State::Monitored;
    observed.action = Action::Noop;
    observed.state_changed_at = cycle;
    debug!(
        image = %observed.tag(),
        owner = ?observed.owners(),
        "Keeping remaining owners monitored"
    );
    monitored.insert(observed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory_store::MemoryStore;
    use crate::backends::{Cve, Image, ImageStack, Vulnerabilities};
    use crate::image::tests::container;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubScanner {
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Scan for StubScanner {
        async fn scan(&self, image: &Image) -> Result<Vulnerabilities> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("scanner offline"));
            }
            Ok(Vulnerabilities {
                digest: image.image_id.clone(),
                scanner: "stub".to_string(),
                cves: vec![
                    Cve {
                        fix: "1.1".to_string(),
                        package: "openssl".to_string(),
                        severity: Severity::High,
                        url: String::new(),
                        vuln: "CVE-1".to_string(),
                        description: String::new(),
                    },
                    Cve {
                        fix: String::new(),
                        package: "zlib".to_string(),
                        severity: Severity::Low,
                        url: String::new(),
                        vuln: "CVE-2".to_string(),
                        description: String::new(),
                    },
                ],
            })
        }
    }

    #[derive(Default)]
    struct RecordingMonitor {
        pushes: Mutex<Vec<(ImageStack, MonitorStatus)>>,
        resolves: Mutex<Vec<ImageStack>>,
    }

    #[async_trait::async_trait]
    impl Monitor for RecordingMonitor {
        async fn push(&self, stack: &ImageStack, status: MonitorStatus) -> Result<()> {
            self.pushes.lock().unwrap().push((stack.clone(), status));
            Ok(())
        }

        async fn resolve(&self, stack: &ImageStack) -> Result<()> {
            self.resolves.lock().unwrap().push(stack.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_analyse_scans_and_attaches_findings() {
        let model = ImageModel::new();
        let scanner = StubScanner::default();

        let scanned = analyse(&model, &container("c1", "img1", "o1"), 1, &scanner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scanned.state, State::Scanned);
        assert_eq!(scanned.stack.vulnerabilities.cves.len(), 2);
        assert_eq!(model.read("img1").unwrap().state, State::Scanned);
    }

    #[tokio::test]
    async fn test_failed_scan_rolls_back() {
        let model = ImageModel::new();
        let scanner = StubScanner::default();
        scanner.fail.store(true, Ordering::SeqCst);

        let err = analyse(&model, &container("c1", "img1", "o1"), 1, &scanner)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Image: img1:latest - scanner offline");
        assert_eq!(model.read("img1").unwrap().state, State::Running);
    }

    #[tokio::test]
    async fn test_analyse_skips_image_being_scanned() {
        let model = ImageModel::new();
        model.create_or_merge(&container("c1", "img1", "o1"));
        model.begin_scan("img1", 1);

        let result = analyse(&model, &container("c2", "img1", "o2"), 1, &StubScanner::default())
            .await
            .unwrap();
        assert!(result.is_none());
        // The container was still folded in
        assert_eq!(model.read("img1").unwrap().containers().len(), 2);
    }

    #[tokio::test]
    async fn test_monitor_filters_by_threshold() {
        let model = ImageModel::new();
        let recorder = RecordingMonitor::default();
        let scanned = analyse(&model, &container("c1", "img1", "o1"), 1, &StubScanner::default())
            .await
            .unwrap()
            .unwrap();

        let status = monitor(&model, &scanned, 1, &recorder, Severity::High).await.unwrap();
        assert_eq!(status, MonitorStatus::Error);
        assert_eq!(model.read("img1").unwrap().state, State::Monitored);

        let pushes = recorder.pushes.lock().unwrap();
        assert_eq!(pushes[0].0.vulnerabilities.cves.len(), 1);
        assert_eq!(pushes[0].0.vulnerabilities.cves[0].vuln, "CVE-1");

        // Stored findings are not filtered
        assert_eq!(model.read("img1").unwrap().stack.vulnerabilities.cves.len(), 2);
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let model = ImageModel::new();
        let store = MemoryStore::new();
        model.create_or_merge(&container("c1", "img1", "o1"));
        model.create_or_merge(&container("c2", "img2", "o1"));
        model.update_state("img1", State::Monitored, 1);

        assert_eq!(backup(&model, &store).await.unwrap(), 1);
        assert_eq!(store.document_keys(), vec!["backup/monitored/img1".to_string()]);

        let restored = ImageModel::new();
        assert_eq!(restore(&restored, &store).await.unwrap(), 1);
        let record = restored.read("img1").unwrap();
        assert_eq!(record.state, State::Monitored);
        assert_eq!(record.state_changed_at, 0);
    }

    #[tokio::test]
    async fn test_resolve_executes_actions() {
        let monitored = ImageModel::new();
        let active = ImageModel::new();
        let store = MemoryStore::new();
        let recorder = RecordingMonitor::default();

        // img1 vanished, img2 lost an owner, img3 changed containers
        for c in [
            container("c1", "img1", "o1"),
            container("c2", "img2", "o1"),
            container("c3", "img2", "o2"),
            container("c4", "img3", "o1"),
        ] {
            monitored.create_or_merge(&c);
        }
        for status in monitored.snapshot() {
            monitored.update_state(status.image_id(), State::Monitored, 1);
        }
        backup(&monitored, &store).await.unwrap();

        active.create_or_merge(&container("c2", "img2", "o1"));
        active.create_or_merge(&container("c5", "img3", "o1"));

        let summary = resolve(&monitored, &active, 2, &recorder, &store, Severity::High)
            .await
            .unwrap();
        assert_eq!(
            summary,
            ResolveSummary {
                updated: 1,
                partly_resolved: 1,
                fully_resolved: 1,
            }
        );
        assert_eq!(summary.total(), 3);

        assert!(monitored.read("img1").is_none());

        let img2 = monitored.read("img2").unwrap();
        assert_eq!(img2.owners(), ["o1".to_string()]);
        assert_eq!(img2.state, State::Monitored);
        assert_eq!(img2.state_changed_at, 2);

        let img3 = monitored.read("img3").unwrap();
        assert_eq!(img3.containers()[0].id, "c5");

        let resolves = recorder.resolves.lock().unwrap();
        assert_eq!(resolves.len(), 2);
        let partly = resolves
            .iter()
            .find(|s| s.metadata.image_id == "img2")
            .unwrap();
        assert_eq!(partly.metadata.owners, vec!["o2".to_string()]);

        assert_eq!(store.document_keys(), vec!["backup/monitored/img3".to_string()]);
    }

    #[tokio::test]
    async fn test_update_reports_new_owners() {
        let monitored = ImageModel::new();
        let active = ImageModel::new();
        let store = MemoryStore::new();
        let recorder = RecordingMonitor::default();

        monitored.create_or_merge(&container("c1", "img1", "o1"));
        monitored.update_state("img1", State::Monitored, 1);
        active.create_or_merge(&container("c1", "img1", "o1"));
        active.create_or_merge(&container("c2", "img1", "o2"));

        let summary = resolve(&monitored, &active, 3, &recorder, &store, Severity::High)
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);

        let record = monitored.read("img1").unwrap();
        assert_eq!(record.owners(), ["o1".to_string(), "o2".to_string()]);
        assert_eq!(record.containers().len(), 2);
        assert_eq!(record.state, State::Monitored);
        assert_eq!(record.action, Action::Noop);
        assert_eq!(record.state_changed_at, 3);

        let pushes = recorder.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0.metadata.owners, vec!["o1".to_string(), "o2".to_string()]);
        let ids: Vec<&str> = pushes[0].0.containers.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_partly_resolve_reseeds_from_active() {
        let monitored = ImageModel::new();
        let active = ImageModel::new();
        let store = MemoryStore::new();
        let recorder = RecordingMonitor::default();

        monitored.create_or_merge(&container("c1", "img1", "o1"));
        monitored.create_or_merge(&container("c2", "img1", "o2"));
        monitored.complete_scan(
            "img1",
            StubScanner::default().scan(&Image::default()).await.unwrap(),
            1,
        );
        monitored.update_state("img1", State::Monitored, 1);
        backup(&monitored, &store).await.unwrap();

        // o2 is gone and c1 was replaced by c3
        active.create_or_merge(&container("c3", "img1", "o1"));

        let summary = resolve(&monitored, &active, 4, &recorder, &store, Severity::High)
            .await
            .unwrap();
        assert_eq!(summary.partly_resolved, 1);

        let record = monitored.read("img1").unwrap();
        let ids: Vec<&str> = record.containers().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c3"]);
        assert_eq!(record.owners(), ["o1".to_string()]);
        assert_eq!(record.state, State::Monitored);
        assert_eq!(record.action, Action::Noop);
        assert_eq!(record.state_changed_at, 4);
        assert_eq!(record.stack.vulnerabilities.cves.len(), 2);

        // The next backup persists the reseeded record
        assert!(store.document_keys().is_empty());
        backup(&monitored, &store).await.unwrap();
        let persisted = store.load_image_stacks(BACKUP_PREFIX).await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].metadata.owners, vec!["o1".to_string()]);
        assert_eq!(persisted[0].containers[0].id, "c3");
    }

    #[tokio::test]
    async fn test_refresh_pushes_monitored_only() {
        let model = ImageModel::new();
        let recorder = RecordingMonitor::default();
        model.create_or_merge(&container("c1", "img1", "o1"));
        model.create_or_merge(&container("c2", "img2", "o1"));
        model.update_state("img2", State::Monitored, 1);

        assert_eq!(refresh(&model, &recorder, Severity::High).await.unwrap(), 1);
        assert_eq!(recorder.pushes.lock().unwrap().len(), 1);
    }
}
