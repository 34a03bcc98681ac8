//! Integration tests for the ledger lifecycle.
//!
//! These tests drive whole workflows (record, crash, recover, finalize)
//! against the directory-backed store created with tempfile.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use opledger::core::delta::{Action, Delta};
use opledger::core::kinds::{ChangeKind, EntityKind, OperationKind};
use opledger::core::types::{EntityId, UtcTimestamp};
use opledger::doctor::{self, KnownIssue};
use opledger::engine::{
    finalize, CommitFinalizer, LedgerError, Outcome, Recovery, Registry, RollbackEngine,
};
use opledger::entities::memory::EntityOperation;
use opledger::entities::{EntitySnapshot, MemoryEntities};
use opledger::store::{FileStore, KvStore};

// =============================================================================
// Test Helpers
// =============================================================================

fn entity(id: &str) -> EntityId {
    EntityId::new(id).expect("valid entity id")
}

fn open(dir: &Path) -> Registry {
    let store = FileStore::open(dir.to_path_buf()).expect("open store");
    Registry::new(Arc::new(store))
}

fn removed(entities: &MemoryEntities) -> Vec<String> {
    entities
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            EntityOperation::Remove { id, .. } => Some(id.to_string()),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[test]
    fn expand_volume_commit() {
        let dir = TempDir::new().unwrap();
        let registry = open(dir.path());

        let mut op = registry.create(OperationKind::ExpandVolume).unwrap();
        registry
            .append(
                &mut op,
                ChangeKind::ExpandVolume,
                entity("vol-1"),
                Some(Delta::Size(5)),
            )
            .unwrap();
        registry.save(&mut op).unwrap();

        let loaded = registry.load(&op.id).unwrap();
        assert_eq!(loaded.actions()[0].expand_size().unwrap(), 5);
        assert_eq!(
            registry.owner(&entity("vol-1")).unwrap().unwrap().op_id,
            op.id
        );

        let report = CommitFinalizer::new(&registry).commit(&loaded).unwrap();
        assert!(report.complete, "{}", report.summary());
        assert!(registry.owner(&entity("vol-1")).unwrap().is_none());
        assert!(matches!(
            registry.load(&op.id),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn create_volume_rollback() {
        let dir = TempDir::new().unwrap();
        let registry = open(dir.path());
        let entities = MemoryEntities::new()
            .with_entity(EntityKind::Brick, entity("brick-1"), None)
            .with_entity(EntityKind::Volume, entity("vol-2"), Some(100));

        let mut op = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append(&mut op, ChangeKind::AddBrick, entity("brick-1"), None)
            .unwrap();
        registry
            .append(&mut op, ChangeKind::AddVolume, entity("vol-2"), None)
            .unwrap();

        let report = RollbackEngine::new(&registry, &entities)
            .rollback(&op)
            .unwrap();
        assert!(report.complete, "{}", report.summary());
        assert_eq!(removed(&entities), vec!["vol-2", "brick-1"]);
        assert!(registry.list().unwrap().is_empty());
        assert!(registry.locks().markers().unwrap().is_empty());
    }

    #[test]
    fn rollback_twice_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let registry = open(dir.path());
        let entities = MemoryEntities::new()
            .with_entity(EntityKind::Brick, entity("brick-1"), None)
            .with_entity(EntityKind::Volume, entity("vol-2"), None);

        let mut op = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append(&mut op, ChangeKind::AddBrick, entity("brick-1"), None)
            .unwrap();
        registry
            .append(&mut op, ChangeKind::AddVolume, entity("vol-2"), None)
            .unwrap();

        let engine = RollbackEngine::new(&registry, &entities);
        engine.rollback(&op).unwrap();
        let calls = entities.operations();

        let again = engine.rollback(&op).unwrap();
        assert!(again.all_stale());
        assert_eq!(entities.operations(), calls);
    }

    #[test]
    fn delete_then_rollback_restores_entity() {
        let dir = TempDir::new().unwrap();
        let registry = open(dir.path());
        let original = EntitySnapshot::new(EntityKind::Volume, entity("vol-9"))
            .with_size(50)
            .with_attribute("durability", serde_json::json!("replicate"));
        let entities = MemoryEntities::new();

        let mut op = registry.create(OperationKind::DeleteVolume).unwrap();
        registry.record_preimage(&op.id, &original).unwrap();
        registry
            .append(&mut op, ChangeKind::DeleteVolume, entity("vol-9"), None)
            .unwrap();

        let report = finalize(&registry, &entities, &op, Outcome::Rollback).unwrap();
        assert!(report.complete);
        assert_eq!(entities.get(&entity("vol-9")), Some(original));
        assert!(registry.preimages().unwrap().is_empty());
    }
}

// =============================================================================
// Persistence
// =============================================================================

mod persistence {
    use super::*;

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let registry = open(dir.path());
            let mut op = registry.create(OperationKind::RemoveDevice).unwrap();
            registry
                .append(&mut op, ChangeKind::RemoveDevice, entity("dev-1"), None)
                .unwrap();
            op.id
        };

        let registry = open(dir.path());
        let op = registry.load(&id).unwrap();
        assert_eq!(op.kind, OperationKind::RemoveDevice);
        assert_eq!(op.actions()[0].change(), ChangeKind::RemoveDevice);
        assert_eq!(registry.owner(&entity("dev-1")).unwrap().unwrap().op_id, id);
    }

    #[test]
    fn stale_copy_loses_compare_and_swap() {
        let dir = TempDir::new().unwrap();
        let registry = open(dir.path());
        let op = registry.create(OperationKind::ExpandVolume).unwrap();

        let mut first = registry.load(&op.id).unwrap();
        let mut second = registry.load(&op.id).unwrap();
        registry
            .append_action(&mut first, Action::expand_volume(entity("v1"), 1))
            .unwrap();

        let err = registry
            .append_action(&mut second, Action::expand_volume(entity("v2"), 2))
            .unwrap_err();
        assert!(err.is_storage_conflict(), "{:?}", err);
        assert!(second.is_empty());
        assert!(registry.owner(&entity("v2")).unwrap().is_none());
        assert_eq!(registry.load(&op.id).unwrap(), first);
    }

    #[test]
    fn stale_copy_cannot_delete_the_record() {
        let dir = TempDir::new().unwrap();
        let registry = open(dir.path());
        let op = registry.create(OperationKind::CreateVolume).unwrap();
        let stale = registry.load(&op.id).unwrap();
        let mut fresh = registry.load(&op.id).unwrap();
        registry
            .append(&mut fresh, ChangeKind::AddBrick, entity("b1"), None)
            .unwrap();

        assert!(registry.delete_record(&stale).unwrap_err().is_storage_conflict());
        assert_eq!(registry.load(&op.id).unwrap(), fresh);
        assert!(registry.delete_record(&fresh).unwrap());
    }

    #[test]
    fn revisions_are_store_wide() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).unwrap();
        let a = store.compare_and_swap("ops/a", None, "{}").unwrap();
        store.delete("ops/a", Some(a)).unwrap();
        let b = store.compare_and_swap("ops/a", None, "{}").unwrap();
        assert!(b > a);
    }
}

// =============================================================================
// Crash Recovery
// =============================================================================

mod recovery {
    use super::*;

    #[test]
    fn interrupted_workflows_are_finalized_on_restart() {
        let dir = TempDir::new().unwrap();
        let entities = MemoryEntities::new()
            .with_entity(EntityKind::Brick, entity("b-keep"), None)
            .with_entity(EntityKind::Brick, entity("b-undo"), None)
            .with_entity(EntityKind::Volume, entity("v-open"), Some(10));

        // Three workflows were running when the process died.
        let (keep, undo, open_id) = {
            let registry = open(dir.path());
            let mut keep = registry.create(OperationKind::CreateVolume).unwrap();
            registry
                .append(&mut keep, ChangeKind::AddBrick, entity("b-keep"), None)
                .unwrap();
            let mut undo = registry.create(OperationKind::CreateVolume).unwrap();
            registry
                .append(&mut undo, ChangeKind::AddBrick, entity("b-undo"), None)
                .unwrap();
            let mut open_op = registry.create(OperationKind::ExpandVolume).unwrap();
            registry
                .append_action(&mut open_op, Action::expand_volume(entity("v-open"), 4))
                .unwrap();
            (keep.id, undo.id, open_op.id)
        };

        let registry = open(dir.path());
        let mut log = HashMap::new();
        log.insert(keep.clone(), Outcome::Commit);
        log.insert(undo.clone(), Outcome::Rollback);

        let report = Recovery::new(&registry, &entities).recover(&log).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.finalized.len(), 2);
        assert_eq!(report.undecided, vec![open_id.clone()]);

        assert!(entities.get(&entity("b-keep")).is_some());
        assert!(entities.get(&entity("b-undo")).is_none());
        assert_eq!(registry.list().unwrap(), vec![open_id.clone()]);
        assert_eq!(
            registry.owner(&entity("v-open")).unwrap().unwrap().op_id,
            open_id
        );
    }

    #[test]
    fn nested_children_unwind_through_parent() {
        let dir = TempDir::new().unwrap();
        let registry = open(dir.path());
        let entities = MemoryEntities::new()
            .with_entity(EntityKind::Volume, entity("clone-src"), Some(10))
            .with_entity(EntityKind::Volume, entity("clone-dst"), Some(10))
            .with_entity(EntityKind::Brick, entity("clone-brick"), None);

        let mut parent = registry.create(OperationKind::CloneVolume).unwrap();
        registry
            .append(&mut parent, ChangeKind::CloneVolume, entity("clone-dst"), None)
            .unwrap();
        let mut child = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append_action(&mut parent, Action::child_link(&child.id))
            .unwrap();
        registry
            .append_action(&mut child, Action::parent_link(&parent.id))
            .unwrap();
        registry
            .append(&mut child, ChangeKind::AddBrick, entity("clone-brick"), None)
            .unwrap();

        let mut log = HashMap::new();
        log.insert(parent.id.clone(), Outcome::Rollback);
        let report = Recovery::new(&registry, &entities).recover(&log).unwrap();

        assert_eq!(report.deferred, vec![child.id.clone()]);
        assert!(report.is_clean());
        assert_eq!(removed(&entities), vec!["clone-brick", "clone-dst"]);
        assert!(entities.get(&entity("clone-src")).is_some());
        assert!(registry.list().unwrap().is_empty());
    }
}

// =============================================================================
// Doctor
// =============================================================================

mod doctor_checks {
    use super::*;

    #[test]
    fn record_deleted_behind_ledger_leaves_orphan_marker() {
        let dir = TempDir::new().unwrap();
        let registry = open(dir.path());
        let mut op = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append(&mut op, ChangeKind::AddVolume, entity("vol-1"), None)
            .unwrap();
        registry.delete(&op.id).unwrap();

        let diagnosis = doctor::check(
            &registry,
            None,
            &UtcTimestamp::now(),
            chrono::Duration::hours(1),
        )
        .unwrap();
        assert!(diagnosis.has_blocking());
        assert!(diagnosis
            .issues
            .iter()
            .any(|i| matches!(i, KnownIssue::OrphanMarker { op: o, .. } if *o == op.id)));
    }

    #[test]
    fn finalized_ledger_is_healthy() {
        let dir = TempDir::new().unwrap();
        let registry = open(dir.path());
        let entities = MemoryEntities::new().with_entity(EntityKind::Brick, entity("b1"), None);
        let mut op = registry.create(OperationKind::CreateVolume).unwrap();
        registry
            .append(&mut op, ChangeKind::AddBrick, entity("b1"), None)
            .unwrap();
        finalize(&registry, &entities, &op, Outcome::Rollback).unwrap();

        let diagnosis = doctor::check(
            &registry,
            Some(&entities),
            &UtcTimestamp::now(),
            chrono::Duration::hours(1),
        )
        .unwrap();
        assert!(diagnosis.is_healthy(), "{}", diagnosis.format());
        assert_eq!(doctor::summarize(&registry).unwrap().total_operations(), 0);
    }
}
