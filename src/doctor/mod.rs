//! doctor
//!
//! Read-only consistency checks over the ledger.
//!
//! # Architecture
//!
//! [`check`] cross-references the three kinds of ledger entries against
//! each other (and, when one is supplied, against the entity store):
//!
//! - every pending marker must belong to a live operation that names it
//! - every entity named by a live operation must be marked pending under it
//! - every operation link must point at a live operation, without cycles
//! - every pre-image must belong to a live operation
//! - entities a live operation created or resized must still exist
//!
//! The doctor never repairs anything. Most findings clear up once the
//! affected operation is committed or rolled back; the rest need an
//! operator.
//!
//! [`summarize`] counts what the ledger holds.

mod issues;

pub use issues::{IssueId, KnownIssue, Severity};

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::core::kinds::{ChangeKind, EntityKind, OperationKind};
use crate::core::ops::{LockError, PendingOperation};
use crate::core::types::{EntityId, OpId, UtcTimestamp};
use crate::engine::{LedgerError, LinkGraph, Registry, Result};
use crate::entities::EntityStore;
use crate::store::PENDING_PREFIX;

/// Result of a consistency check.
#[derive(Debug, Default)]
pub struct Diagnosis {
    /// Findings, most severe first.
    pub issues: Vec<KnownIssue>,
    /// Number of live operations examined.
    pub operations: usize,
    /// Number of pending markers examined.
    pub markers: usize,
}

impl Diagnosis {
    /// Whether nothing was found.
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    /// Whether any finding is blocking.
    pub fn has_blocking(&self) -> bool {
        self.issues.iter().any(|i| i.severity().is_blocking())
    }

    /// Number of findings at `severity`.
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity() == severity).count()
    }

    /// Find an issue by id.
    pub fn find(&self, id: &IssueId) -> Option<&KnownIssue> {
        self.issues.iter().find(|i| i.issue_id() == *id)
    }

    /// Human-readable rendering, one issue per line.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for issue in &self.issues {
            out.push_str(&format!(
                "{:<8} {}  {}\n",
                issue.severity(),
                issue.issue_id(),
                issue
            ));
        }
        out.push_str(&format!(
            "{} issue(s): {} error, {} warning, {} info",
            self.issues.len(),
            self.count(Severity::Blocking),
            self.count(Severity::Warning),
            self.count(Severity::Info)
        ));
        out
    }

    fn push(&mut self, seen: &mut BTreeSet<IssueId>, issue: KnownIssue) {
        if seen.insert(issue.issue_id()) {
            self.issues.push(issue);
        }
    }
}

/// Check the ledger for inconsistencies.
///
/// `entities` enables the checks against live entities; without it only
/// the ledger's own entries are cross-referenced. Operations older than
/// `stale_after` at `now` are reported as stale.
///
/// # Errors
///
/// Store failures. Undecodable entries are reported as issues instead.
pub fn check(
    registry: &Registry,
    entities: Option<&dyn EntityStore>,
    now: &UtcTimestamp,
    stale_after: chrono::Duration,
) -> Result<Diagnosis> {
    let mut diagnosis = Diagnosis::default();
    let mut seen = BTreeSet::new();

    let ops = load_ops(registry, &mut diagnosis, &mut seen)?;
    let live: BTreeMap<&OpId, &PendingOperation> = ops.iter().map(|op| (&op.id, op)).collect();
    diagnosis.operations = ops.len();

    for op in &ops {
        check_actions(registry, op, &live, entities, &mut diagnosis, &mut seen)?;
        let age = op.age_at(now);
        if age > stale_after {
            diagnosis.push(
                &mut seen,
                KnownIssue::StaleOperation {
                    op: op.id.clone(),
                    age_secs: age.num_seconds(),
                },
            );
        }
    }

    check_markers(registry, &live, &mut diagnosis, &mut seen)?;
    check_cycles(&ops, &mut diagnosis, &mut seen);

    for (op, entity) in registry.preimages()? {
        if !live.contains_key(&op) {
            diagnosis.push(&mut seen, KnownIssue::OrphanPreimage { op, entity });
        }
    }

    diagnosis
        .issues
        .sort_by(|a, b| (a.severity(), a.issue_id()).cmp(&(b.severity(), b.issue_id())));
    debug!(
        operations = diagnosis.operations,
        markers = diagnosis.markers,
        issues = diagnosis.issues.len(),
        "ledger check finished"
    );
    Ok(diagnosis)
}

fn load_ops(
    registry: &Registry,
    diagnosis: &mut Diagnosis,
    seen: &mut BTreeSet<IssueId>,
) -> Result<Vec<PendingOperation>> {
    let mut ops = Vec::new();
    for id in registry.list()? {
        match registry.try_load(&id) {
            Ok(Some(op)) => ops.push(op),
            Ok(None) => {}
            Err(LedgerError::Corrupt { key, message }) => {
                diagnosis.push(seen, KnownIssue::CorruptEntry { key, message })
            }
            Err(e) => return Err(e),
        }
    }
    Ok(ops)
}

fn check_actions(
    registry: &Registry,
    op: &PendingOperation,
    live: &BTreeMap<&OpId, &PendingOperation>,
    entities: Option<&dyn EntityStore>,
    diagnosis: &mut Diagnosis,
    seen: &mut BTreeSet<IssueId>,
) -> Result<()> {
    for action in op.actions() {
        let change = action.change();
        if change == ChangeKind::Unknown {
            diagnosis.push(
                seen,
                KnownIssue::UnexpectedChange {
                    op: op.id.clone(),
                    change,
                    entity: action.entity_id().clone(),
                },
            );
            continue;
        }
        if let Some(linked) = action.linked_operation() {
            if !live.contains_key(linked) {
                diagnosis.push(
                    seen,
                    KnownIssue::DanglingLink {
                        op: op.id.clone(),
                        linked: linked.clone(),
                    },
                );
            }
            continue;
        }
        let holder = match registry.owner(action.entity_id()) {
            Ok(marker) => marker.map(|m| m.op_id),
            Err(LedgerError::Corrupt { .. }) => continue,
            Err(e) => return Err(e),
        };
        if holder.as_ref() != Some(&op.id) {
            diagnosis.push(
                seen,
                KnownIssue::UnmarkedEntity {
                    op: op.id.clone(),
                    entity: action.entity_id().clone(),
                    holder,
                },
            );
        }
    }

    let Some(entities) = entities else {
        return Ok(());
    };
    // Undone actions legitimately name entities that are gone again.
    for action in op.rollback_order() {
        let change = action.change();
        let expects_live = change.creates_entity()
            || matches!(
                change,
                ChangeKind::ExpandVolume | ChangeKind::ExpandBlockVolume | ChangeKind::RemoveDevice
            );
        let Some(kind) = change.entity_kind().filter(|_| expects_live) else {
            continue;
        };
        if !entities.exists(kind, action.entity_id())? {
            diagnosis.push(
                seen,
                KnownIssue::MissingEntity {
                    op: op.id.clone(),
                    change,
                    kind,
                    entity: action.entity_id().clone(),
                },
            );
        }
    }
    Ok(())
}

fn check_markers(
    registry: &Registry,
    live: &BTreeMap<&OpId, &PendingOperation>,
    diagnosis: &mut Diagnosis,
    seen: &mut BTreeSet<IssueId>,
) -> Result<()> {
    let locks = registry.locks();
    for key in registry.store().list(PENDING_PREFIX)? {
        diagnosis.markers += 1;
        let raw = key.trim_start_matches(PENDING_PREFIX);
        let Ok(entity) = EntityId::new(raw) else {
            diagnosis.push(
                seen,
                KnownIssue::CorruptEntry {
                    key,
                    message: "malformed entity id".into(),
                },
            );
            continue;
        };
        let marker = match locks.owner(&entity) {
            Ok(Some(marker)) => marker,
            Ok(None) => continue,
            Err(LockError::Corrupt { message, .. }) => {
                diagnosis.push(seen, KnownIssue::CorruptEntry { key, message });
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match live.get(&marker.op_id) {
            None => diagnosis.push(
                seen,
                KnownIssue::OrphanMarker {
                    entity,
                    op: marker.op_id,
                },
            ),
            Some(op) if !op.names_entity(&entity) => diagnosis.push(
                seen,
                KnownIssue::UnrecordedMarker {
                    entity,
                    op: marker.op_id,
                },
            ),
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_cycles(ops: &[PendingOperation], diagnosis: &mut Diagnosis, seen: &mut BTreeSet<IssueId>) {
    let graph = LinkGraph::from_operations(ops);
    let nodes: Vec<OpId> = graph.nodes().into_iter().cloned().collect();
    for parent in &nodes {
        for child in graph.children_of(parent) {
            let Some(path) = graph.path(child, parent) else {
                continue;
            };
            let mut cycle = vec![parent.clone()];
            cycle.extend(path);
            let trace = cycle
                .iter()
                .map(OpId::as_str)
                .collect::<Vec<_>>()
                .join(" -> ");
            diagnosis.push(seen, KnownIssue::LinkCycle { trace, ops: cycle });
        }
    }
}

/// Per-kind operation counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KindCount {
    pub total: usize,
    /// Operations whose rollback has started but not finished.
    pub rolling_back: usize,
}

/// What the ledger currently holds.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub operations: BTreeMap<OperationKind, KindCount>,
    pub markers: BTreeMap<EntityKind, usize>,
    pub actions: usize,
    pub preimages: usize,
    /// Records that could not be decoded.
    pub corrupt: usize,
}

impl LedgerSummary {
    /// Total number of live operations.
    pub fn total_operations(&self) -> usize {
        self.operations.values().map(|c| c.total).sum()
    }

    /// Total number of pending markers.
    pub fn total_markers(&self) -> usize {
        self.markers.values().sum()
    }
}

impl std::fmt::Display for LedgerSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "operations: {}", self.total_operations())?;
        for (kind, count) in &self.operations {
            write!(f, "  {}: {}", kind, count.total)?;
            if count.rolling_back > 0 {
                write!(f, " ({} rolling back)", count.rolling_back)?;
            }
            writeln!(f)?;
        }
        writeln!(f, "pending entities: {}", self.total_markers())?;
        for (kind, count) in &self.markers {
            writeln!(f, "  {}: {}", kind, count)?;
        }
        writeln!(f, "actions: {}", self.actions)?;
        write!(f, "pre-images: {}", self.preimages)?;
        if self.corrupt > 0 {
            write!(f, "\ncorrupt records: {}", self.corrupt)?;
        }
        Ok(())
    }
}

/// Count operations, markers, actions, and pre-images.
///
/// # Errors
///
/// Store failures. Undecodable records and markers are counted as corrupt.
pub fn summarize(registry: &Registry) -> Result<LedgerSummary> {
    let mut summary = LedgerSummary::default();
    for id in registry.list()? {
        match registry.try_load(&id) {
            Ok(Some(op)) => {
                let count = summary.operations.entry(op.kind).or_default();
                count.total += 1;
                if op.rollback_started() {
                    count.rolling_back += 1;
                }
                summary.actions += op.len();
            }
            Ok(None) => {}
            Err(LedgerError::Corrupt { .. }) => summary.corrupt += 1,
            Err(e) => return Err(e),
        }
    }
    let locks = registry.locks();
    for key in registry.store().list(PENDING_PREFIX)? {
        let owner = EntityId::new(key.trim_start_matches(PENDING_PREFIX))
            .ok()
            .map(|entity| locks.owner(&entity));
        match owner {
            Some(Ok(Some(marker))) => *summary.markers.entry(marker.entity_kind).or_default() += 1,
            Some(Ok(None)) => {}
            Some(Err(LockError::Corrupt { .. })) | None => summary.corrupt += 1,
            Some(Err(e)) => return Err(e.into()),
        }
    }
    summary.preimages = registry.preimages()?.len();
    Ok(summary)
}
