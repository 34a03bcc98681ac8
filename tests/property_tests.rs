//! Property-based tests using proptest.

use std::sync::Arc;

use proptest::prelude::*;

use opledger::core::delta::{Action, Delta};
use opledger::core::kinds::{ChangeKind, EntityKind, OperationKind};
use opledger::core::types::{EntityId, OpId};
use opledger::engine::{Registry, RollbackEngine};
use opledger::entities::memory::EntityOperation;
use opledger::entities::MemoryEntities;
use opledger::store::MemoryStore;

fn registry() -> Registry {
    Registry::new(Arc::new(MemoryStore::new()))
}

fn entity(i: usize) -> EntityId {
    EntityId::new(format!("brick-{:03}", i)).unwrap()
}

proptest! {
    #[test]
    fn operation_names_are_total(code in any::<i64>()) {
        let name = OperationKind::name_of_code(code);
        prop_assert!(!name.is_empty());
        let in_range = (0..OperationKind::ALL.len() as i64).contains(&code);
        if !in_range {
            prop_assert_eq!(name, "unknown");
        }
    }

    #[test]
    fn change_names_are_total(code in any::<i64>()) {
        let name = ChangeKind::name_of_code(code);
        prop_assert!(!name.is_empty());
        let in_range = (0..ChangeKind::ALL.len() as i64).contains(&code);
        if !in_range {
            prop_assert_eq!(name, "Unknown");
        }
    }

    #[test]
    fn expand_size_is_recovered(size in any::<u64>()) {
        let action = Action::new(
            ChangeKind::ExpandVolume,
            EntityId::new("vol-1").unwrap(),
            Some(Delta::Size(size)),
        ).unwrap();
        prop_assert_eq!(action.expand_size().unwrap(), size);
        prop_assert!(action.child_operation().is_err());
    }

    #[test]
    fn size_only_comes_from_expand_volume(index in 0usize..ChangeKind::ALL.len()) {
        let change = ChangeKind::ALL[index];
        prop_assume!(change != ChangeKind::ExpandVolume);
        let delta = if change.is_link() {
            Some(Delta::Operation(OpId::new()))
        } else {
            None
        };
        let action = Action::new(change, EntityId::new("e-1").unwrap(), delta).unwrap();
        let err = action.expand_size().unwrap_err();
        prop_assert!(!err.to_string().is_empty());
    }

    #[test]
    fn saved_records_load_back(sizes in prop::collection::vec(1u64..10_000, 0..12)) {
        let registry = registry();
        let mut op = registry.create(OperationKind::ExpandVolume).unwrap();
        for (i, size) in sizes.iter().enumerate() {
            let volume = EntityId::new(format!("vol-{}", i)).unwrap();
            registry.append_action(&mut op, Action::expand_volume(volume, *size)).unwrap();
        }

        let loaded = registry.load(&op.id).unwrap();
        prop_assert_eq!(&loaded, &op);
        let recorded: Vec<u64> = loaded
            .actions()
            .iter()
            .map(|a| a.expand_size().unwrap())
            .collect();
        prop_assert_eq!(recorded, sizes);
    }

    #[test]
    fn rollback_reverses_append_order(count in 1usize..16) {
        let registry = registry();
        let mut entities = MemoryEntities::new();
        for i in 0..count {
            entities = entities.with_entity(EntityKind::Brick, entity(i), None);
        }

        let mut op = registry.create(OperationKind::CreateVolume).unwrap();
        for i in 0..count {
            registry.append(&mut op, ChangeKind::AddBrick, entity(i), None).unwrap();
        }

        let report = RollbackEngine::new(&registry, &entities).rollback(&op).unwrap();
        prop_assert!(report.complete);

        let undone: Vec<EntityId> = entities
            .operations()
            .into_iter()
            .filter_map(|o| match o {
                EntityOperation::Remove { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        let expected: Vec<EntityId> = (0..count).rev().map(entity).collect();
        prop_assert_eq!(undone, expected);
    }

    #[test]
    fn entity_ids_reject_path_separators(prefix in "[a-z]{1,8}", suffix in "[a-z]{1,8}") {
        let nested = EntityId::new(format!("{}/{}", prefix, suffix));
        prop_assert!(nested.is_err());
        let dashed = EntityId::new(format!("{}-{}", prefix, suffix));
        prop_assert!(dashed.is_ok());
    }
}
