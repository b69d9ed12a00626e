//! Reconciliation of monitored records against one cycle's observations

use crate::backends::Container;
use crate::image::{Action, ImageModel, ImageStatus, State};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Records of `monitored` that need an action in `cycle`.
///
/// Only `Monitored` records whose state did not change after `cycle` are
/// considered. For each of them:
///
/// - absent from `active`: [`Action::FullyResolve`]
/// - owners missing from `active`: [`Action::PartlyResolve`], owners
///   replaced by the missing ones
/// - same container ids in any order: no action
/// - otherwise [`Action::Update`], containers and owners replaced by the
///   active ones
///
/// Both models are read through a snapshot taken on entry. Neither model is
/// modified.
pub fn compare(monitored: &ImageModel, active: &ImageModel, cycle: u64) -> Vec<ImageStatus> {
    let active: HashMap<String, ImageStatus> = active
        .snapshot()
        .into_iter()
        .map(|status| (status.image_id().to_string(), status))
        .collect();

    let mut different = Vec::new();
    for record in monitored.snapshot() {
        if record.state != State::Monitored {
            debug!(
                image = %record.tag(),
                id = %record.image_id(),
                state = %record.state,
                "Image is not monitored yet, skipping reconciliation"
            );
            continue;
        }

        if record.state_changed_at > cycle {
            debug!(
                image = %record.tag(),
                id = %record.image_id(),
                cycle_changed = record.state_changed_at,
                current_cycle = cycle,
                "Image changed after this cycle, skipping reconciliation"
            );
            continue;
        }

        if let Some(decided) = decide(record, &active) {
            different.push(decided);
        }
    }
    different
}

fn decide(mut record: ImageStatus, active: &HashMap<String, ImageStatus>) -> Option<ImageStatus> {
    let Some(observed) = active.get(record.image_id()) else {
        record.action = Action::FullyResolve;
        info!(
            image = %record.tag(),
            id = %record.image_id(),
            owner = ?record.owners(),
            action = %record.action,
            "Fully resolve image"
        );
        return Some(record);
    };

    let missing = missing_owners(record.owners(), observed.owners());
    if !missing.is_empty() {
        record.stack.metadata.owners = missing;
        record.action = Action::PartlyResolve;
        info!(
            image = %record.tag(),
            id = %record.image_id(),
            owner = ?record.owners(),
            action = %record.action,
            "Partly resolve image"
        );
        return Some(record);
    }

    if same_containers(record.containers(), observed.containers()) {
        return None;
    }

    // No owner is missing here, so the active owners are a superset
    record.stack.containers = observed.containers().to_vec();
    record.stack.metadata.owners = observed.owners().to_vec();
    record.action = Action::Update;
    info!(
        image = %record.tag(),
        id = %record.image_id(),
        containers = record.containers().len(),
        action = %record.action,
        "Update image"
    );
    Some(record)
}

/// Owners of `monitored` not present in `active`, in monitored order
fn missing_owners(monitored: &[String], active: &[String]) -> Vec<String> {
    let active: HashSet<&str> = active.iter().map(String::as_str).collect();
    monitored
        .iter()
        .filter(|owner| !active.contains(owner.as_str()))
        .cloned()
        .collect()
}

/// Order-independent comparison of container ids
fn same_containers(a: &[Container], b: &[Container]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut left: Vec<&str> = a.iter().map(|c| c.id.as_str()).collect();
    let mut right: Vec<&str> = b.iter().map(|c| c.id.as_str()).collect();
    left.sort_unstable();
    right.sort_unstable();
    left == right
}
