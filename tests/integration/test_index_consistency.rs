//! Cross-index consistency and reconciliation through the engine.

use std::sync::Arc;

use geotag::{GeoTagEngine, IndexKind, LocationPatch, NewLocation};
use tempfile::TempDir;

use crate::common::{
    SwitchableEmbedder, create_test_engine, hashing, near_seoul, sample_places::PLACES,
    test_settings,
};

fn populate(engine: &GeoTagEngine, count: usize) -> Vec<geotag::LocationId> {
    (0..count)
        .map(|i| {
            let (description, tags) = PLACES[i % PLACES.len()];
            let location = near_seoul(i as f64 * 0.3, (i % 5) as f64 * 0.2)
                .with_description(description)
                .with_tags(tags.iter().copied());
            engine.create(location).unwrap().id
        })
        .collect()
}

#[test]
fn test_indices_match_store_after_mixed_writes() {
    let (engine, _dir) = create_test_engine();
    let ids = populate(&engine, 24);

    for id in ids.iter().step_by(3) {
        engine.delete(*id).unwrap();
    }
    for id in ids.iter().skip(1).step_by(4) {
        let patch = LocationPatch {
            tags: Some(vec!["renovated".to_string()]),
            ..LocationPatch::default()
        };
        // Some of these were deleted above
        let _ = engine.update(*id, &patch);
    }

    assert!(engine.verify_consistency().is_empty());
    let stats = engine.stats();
    assert_eq!(stats.total_locations, 16);
    assert_eq!(stats.spatial_entries, 16);
    assert_eq!(stats.text_entries, 16);
    assert_eq!(stats.total_embeddings, 16);
}

#[test]
fn test_concurrent_writers_leave_indices_consistent() {
    let (engine, _dir) = create_test_engine();
    let engine = Arc::new(engine);
    let seed = populate(&engine, 8);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let engine = engine.clone();
            let seed = seed.clone();
            std::thread::spawn(move || {
                for i in 0..15 {
                    let created = engine
                        .create(
                            near_seoul(worker as f64, i as f64 * 0.1)
                                .with_description(format!("worker {worker} place {i}"))
                                .with_tags(["concurrent"]),
                        )
                        .unwrap();
                    if i % 3 == 0 {
                        engine.delete(created.id).unwrap();
                    }
                    // Everyone hammers the same seed records
                    let target = seed[i % seed.len()];
                    let patch = LocationPatch {
                        description: Some(format!("touched by {worker} at {i}")),
                        ..LocationPatch::default()
                    };
                    engine.update(target, &patch).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(engine.verify_consistency().is_empty());
    assert_eq!(engine.stats().total_locations, 8 + 4 * 10);
    assert!(engine.reconcile().is_clean());
}

#[test]
fn test_embedding_outage_degrades_then_reconcile_heals() {
    let temp = TempDir::new().unwrap();
    let embedder = SwitchableEmbedder::new();
    let engine = GeoTagEngine::open(test_settings(temp.path()), embedder.clone()).unwrap();

    let healthy = engine
        .create(NewLocation::new(37.57, 126.98).with_description("bakery"))
        .unwrap();

    embedder.set_failing(true);
    let degraded = engine
        .create(NewLocation::new(37.58, 126.99).with_description("noodle bar"))
        .unwrap();
    assert!(degraded.embedding.is_none());
    assert!(degraded.embedding_failure.is_some());

    // Missing only the vector, with the failure recorded, is consistent
    assert!(engine.verify_consistency().is_empty());
    assert_eq!(engine.stats().degraded_locations, 1);

    // Still failing: nothing to repair, nothing recomputed
    let report = engine.reconcile();
    assert_eq!(report.embeddings_recomputed, 0);
    assert_eq!(report.embedding_failures, 1);
    assert_eq!(report.total_repairs(), 0);

    embedder.set_failing(false);
    let report = engine.reconcile();
    assert_eq!(report.embeddings_recomputed, 1);
    assert_eq!(report.vector_repairs, 1);
    assert_eq!(report.embedding_failures, 0);

    let healed = engine.get(degraded.id).unwrap();
    assert!(healed.embedding.is_some());
    assert!(healed.embedding_failure.is_none());
    assert_eq!(engine.stats().total_embeddings, 2);
    assert!(engine.get(healthy.id).is_ok());
    assert!(engine.verify_consistency().is_empty());
}

#[test]
fn test_reconciliation_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let settings = test_settings(temp.path());
    {
        let engine = GeoTagEngine::open(settings.clone(), hashing()).unwrap();
        populate(&engine, 12);
    }
    // Lose the checkpoint: every vector has to come back through reconciliation
    let _ = std::fs::remove_file(settings.checkpoint_path());

    let engine = GeoTagEngine::open(settings, hashing()).unwrap();
    assert!(engine.verify_consistency().is_empty());

    let first = engine.reconcile();
    let second = engine.reconcile();
    assert_eq!(first.total_repairs(), 0);
    assert_eq!(second.total_repairs(), 0);
    assert_eq!(second.scanned, 12);
}

#[test]
fn test_update_text_reindexes_everywhere() {
    let (engine, _dir) = create_test_engine();
    let record = engine
        .create(near_seoul(0.0, 0.0).with_description("flower shop").with_tags(["flowers"]))
        .unwrap();

    let patch = LocationPatch {
        description: Some("vinyl record store".to_string()),
        tags: Some(vec!["music".to_string()]),
        ..LocationPatch::default()
    };
    let updated = engine.update(record.id, &patch).unwrap();
    assert_ne!(updated.embedding, record.embedding);

    let problems = engine.verify_consistency();
    assert!(
        !problems.iter().any(|(_, kinds)| kinds.contains(IndexKind::TEXT)),
        "text index not refreshed: {problems:?}"
    );
    assert!(problems.is_empty());
}
