//! Extension set reconciliation.
//!
//! Computes which extensions to add, update, and remove given the desired
//! list from the remote copy and the locally installed set, then applies
//! the plan one item at a time. A failing item never aborts its phase.

use semver::Version;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::errors::SyncResult;
use crate::extensions::metadata::{MetadataProvider, auto_update_versions};
use crate::extensions::{Extension, ExtensionInstaller};
use crate::filter::matches_any;

/// The computed delta. Each list preserves the relative order of its
/// source list (desired order for added/updated, local order for removed).
#[derive(Debug, Default, Clone)]
pub struct ReconcilePlan {
    pub added: Vec<Extension>,
    /// Pairs of (installed version, desired extension).
    pub updated: Vec<(String, Extension)>,
    pub removed: Vec<Extension>,
}

/// Per-phase outcome: the items that went through and the ones whose
/// collaborator call failed.
#[derive(Debug, Default)]
pub struct PhaseOutcome {
    pub succeeded: Vec<Extension>,
    pub failed: Vec<Extension>,
}

#[derive(Debug, Default)]
pub struct ExtensionSyncResult {
    pub added: PhaseOutcome,
    pub updated: PhaseOutcome,
    pub removed: PhaseOutcome,
}

impl ExtensionSyncResult {
    pub fn failures(&self) -> usize {
        self.added.failed.len() + self.updated.failed.len() + self.removed.failed.len()
    }
}

fn parse_version(raw: &str) -> Version {
    Version::parse(raw).unwrap_or_else(|_| Version::new(0, 0, 0))
}

/// Compute the delta between desired and locally installed extensions.
///
/// With `auto_update`, each desired entry is first bumped to the newest
/// published version whose engine requirement the host satisfies. A
/// desired version not newer than the installed one reserves the local
/// extension untouched. Locally installed extensions matching
/// `exclude_patterns` are never removal candidates. All id comparisons are
/// case-insensitive.
pub async fn reconcile<M: MetadataProvider>(
    desired: &[Extension],
    local: &[Extension],
    exclude_patterns: &[String],
    auto_update: bool,
    host_version: &str,
    metadata: &M,
) -> SyncResult<ReconcilePlan> {
    let mut desired: Vec<Extension> = desired.to_vec();
    if auto_update {
        auto_update_versions(&mut desired, host_version, metadata).await?;
    }

    let mut plan = ReconcilePlan::default();
    let mut kept: HashSet<String> = HashSet::new();

    for ext in &desired {
        match local.iter().find(|l| l.key() == ext.key()) {
            Some(installed) => {
                kept.insert(ext.key());
                if parse_version(&ext.version) <= parse_version(&installed.version) {
                    debug!(id = %ext.id, version = %installed.version, "reserved");
                } else {
                    plan.updated.push((installed.version.clone(), ext.clone()));
                }
            }
            None => plan.added.push(ext.clone()),
        }
    }

    for installed in local {
        if matches_any(exclude_patterns, &installed.key()) {
            continue;
        }
        if !kept.contains(&installed.key())
            && !desired.iter().any(|d| d.key() == installed.key())
        {
            plan.removed.push(installed.clone());
        }
    }
    Ok(plan)
}

/// Apply a plan through the installer collaborator: add, then update, then
/// remove, items strictly in order. Collaborator failures are isolated per
/// item and collected into the phase outcome.
pub async fn apply_plan<I: ExtensionInstaller>(
    plan: &ReconcilePlan,
    installer: &I,
) -> ExtensionSyncResult {
    let mut result = ExtensionSyncResult::default();

    for ext in &plan.added {
        match installer.install(ext).await {
            Ok(()) => result.added.succeeded.push(ext.clone()),
            Err(e) => {
                warn!(id = %ext.id, error = %e, "install failed");
                result.added.failed.push(ext.clone());
            }
        }
    }
    for (old_version, ext) in &plan.updated {
        match installer.update(old_version, ext).await {
            Ok(()) => result.updated.succeeded.push(ext.clone()),
            Err(e) => {
                warn!(id = %ext.id, error = %e, "update failed");
                result.updated.failed.push(ext.clone());
            }
        }
    }
    for ext in &plan.removed {
        match installer.remove(ext).await {
            Ok(()) => result.removed.succeeded.push(ext.clone()),
            Err(e) => {
                warn!(id = %ext.id, error = %e, "remove failed");
                result.removed.failed.push(ext.clone());
            }
        }
    }
    result
}
