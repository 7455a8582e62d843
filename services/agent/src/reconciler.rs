//! Reconciliation planning.
//!
//! Compares desired apps against the actual container snapshot. The join key
//! is the container name: app `X` is satisfied by a container named `/X`.
//!
//! Planning is pure: the same inputs always give the same plan. Only missing
//! apps are acted on; an existing container is never compared against the
//! app's image or envs.

use std::collections::HashSet;

use crate::client::App;
use crate::engine::Container;

/// Container name (as the engine reports it) for an app.
pub fn app_container_name(app_id: &str) -> String {
    format!("/{app_id}")
}

/// Find the container that satisfies `app_id`, if any.
pub fn find_app_container<'a>(app_id: &str, containers: &'a [Container]) -> Option<&'a Container> {
    let name = app_container_name(app_id);
    containers.iter().find(|c| c.has_name(&name))
}

/// Outcome of comparing desired apps with actual containers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Apps with no container and no provisioning in flight.
    pub to_provision: Vec<App>,

    /// App ids already backed by a container.
    pub present: Vec<String>,

    /// App ids skipped because a provisioning task is still running.
    pub in_flight: Vec<String>,
}

impl ReconcilePlan {
    /// Whether every desired app is already present.
    pub fn is_converged(&self) -> bool {
        self.to_provision.is_empty() && self.in_flight.is_empty()
    }
}

/// Plan a reconciliation pass.
///
/// Apps listed twice are considered once, at their first position.
pub fn plan(desired: &[App], actual: &[Container], in_flight: &HashSet<String>) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();
    let mut seen = HashSet::new();

    for app in desired {
        if !seen.insert(app.id.as_str()) {
            continue;
        }

        if find_app_container(&app.id, actual).is_some() {
            plan.present.push(app.id.clone());
        } else if in_flight.contains(&app.id) {
            plan.in_flight.push(app.id.clone());
        } else {
            plan.to_provision.push(app.clone());
        }
    }

    plan
}
