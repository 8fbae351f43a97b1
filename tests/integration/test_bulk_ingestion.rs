//! Bulk creation: per-item outcomes, capacity limits and durability.

use geotag::{GeoError, GeoTagEngine, ItemOutcome, NewLocation};
use tempfile::TempDir;

use crate::common::{SwitchableEmbedder, create_test_engine, hashing, near_seoul, test_settings};

fn batch(count: usize) -> Vec<NewLocation> {
    (0..count)
        .map(|i| near_seoul(i as f64 * 0.1, 0.0).with_description(format!("stall number {i}")))
        .collect()
}

#[test]
fn test_invalid_item_fails_alone() {
    let (engine, _dir) = create_test_engine();
    let mut locations = batch(10);
    locations[3] = NewLocation::new(95.0, 126.9);

    let outcome = engine.bulk_create(&locations).unwrap();

    assert_eq!(outcome.total_count, 10);
    assert_eq!(outcome.success_count, 9);
    assert_eq!(outcome.failed_count, 1);
    assert_eq!(outcome.created_ids().len(), 9);

    let failed: Vec<_> = outcome
        .items
        .iter()
        .filter(|item| item.id().is_none())
        .collect();
    assert_eq!(failed.len(), 1);
    match failed[0] {
        ItemOutcome::Failed { index, code, .. } => {
            assert_eq!(*index, 3);
            assert_eq!(code, "VALIDATION_ERROR");
        }
        other => panic!("expected a failure, got {other:?}"),
    }

    // Outcomes come back in input order
    let indices: Vec<usize> = outcome.items.iter().map(ItemOutcome::index).collect();
    assert_eq!(indices, (0..10).collect::<Vec<_>>());

    assert_eq!(engine.stats().total_locations, 9);
    assert!(engine.verify_consistency().is_empty());
}

#[test]
fn test_oversized_and_empty_batches_are_rejected() {
    let temp = TempDir::new().unwrap();
    let mut settings = test_settings(temp.path());
    settings.ingest.max_bulk = 5;
    let engine = GeoTagEngine::open(settings, hashing()).unwrap();

    let err = engine.bulk_create(&batch(6)).unwrap_err();
    assert!(matches!(err, GeoError::CapacityExceeded { .. }));
    assert_eq!(engine.stats().total_locations, 0);

    let err = engine.bulk_create(&[]).unwrap_err();
    assert!(matches!(err, GeoError::Validation { .. }));

    assert_eq!(engine.bulk_create(&batch(5)).unwrap().success_count, 5);
}

#[test]
fn test_batch_spanning_sub_batches() {
    let temp = TempDir::new().unwrap();
    let mut settings = test_settings(temp.path());
    settings.ingest.batch_size = 4;
    let engine = GeoTagEngine::open(settings, hashing()).unwrap();

    let outcome = engine.bulk_create(&batch(11)).unwrap();
    assert_eq!(outcome.success_count, 11);

    let mut ids = outcome.created_ids();
    let count = ids.len();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), count, "identities must be unique");
    assert_eq!(engine.stats().total_embeddings, 11);
}

#[test]
fn test_embedding_outage_degrades_whole_batch() {
    let temp = TempDir::new().unwrap();
    let embedder = SwitchableEmbedder::new();
    let engine = GeoTagEngine::open(test_settings(temp.path()), embedder.clone()).unwrap();

    embedder.set_failing(true);
    let outcome = engine.bulk_create(&batch(4)).unwrap();
    assert_eq!(outcome.success_count, 4);
    assert_eq!(outcome.degraded_count, 4);
    assert_eq!(engine.stats().total_embeddings, 0);

    embedder.set_failing(false);
    assert_eq!(engine.reconcile().embeddings_recomputed, 4);
    assert_eq!(engine.stats().total_embeddings, 4);
}

#[test]
fn test_bulk_records_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let settings = test_settings(temp.path());

    let ids = {
        let engine = GeoTagEngine::open(settings.clone(), hashing()).unwrap();
        engine.bulk_create(&batch(7)).unwrap().created_ids()
    };

    let engine = GeoTagEngine::open(settings, hashing()).unwrap();
    assert_eq!(engine.stats().total_locations, 7);
    for id in ids {
        let record = engine.get(id).unwrap();
        assert!(record.embedding.is_some());
    }
    assert!(engine.verify_consistency().is_empty());
}
