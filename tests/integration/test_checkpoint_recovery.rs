//! Vector checkpoints and recovery after the process goes away.

use std::collections::BTreeSet;

use geotag::vector::read_header;
use geotag::{
    Coordinate, GeoTagEngine, LocationId, LocationPatch, Modalities, UnifiedQuery, VectorMode,
};
use tempfile::TempDir;

use crate::common::{
    SEOUL, TEST_DIMENSION, hashing, near_seoul, sample_places::PLACES, test_settings,
};

fn vector_and_location_query() -> UnifiedQuery {
    UnifiedQuery::default()
        .with_text("coffee near the market")
        .with_location(Coordinate::new(SEOUL.0, SEOUL.1).unwrap(), 3.0)
        .with_modalities(Modalities::VECTOR | Modalities::LOCATION)
        .with_threshold(0.0)
        .with_limit(30)
}

fn ranked(engine: &GeoTagEngine, query: &UnifiedQuery) -> Vec<(LocationId, f32)> {
    engine
        .search(query)
        .unwrap()
        .results
        .into_iter()
        .map(|r| (r.id, r.score))
        .collect()
}

fn text_hits(engine: &GeoTagEngine, text: &str) -> BTreeSet<LocationId> {
    let query = UnifiedQuery::default()
        .with_text(text)
        .with_modalities(Modalities::TEXT)
        .with_limit(50);
    engine.search(&query).unwrap().results.into_iter().map(|r| r.id).collect()
}

#[test]
fn test_checkpoint_written_after_interval() {
    let temp = TempDir::new().unwrap();
    let settings = test_settings(temp.path());
    let engine = GeoTagEngine::open(settings.clone(), hashing()).unwrap();

    for i in 0..9 {
        engine.create(near_seoul(i as f64 * 0.1, 0.0)).unwrap();
    }
    assert!(!settings.checkpoint_path().exists());

    engine.create(near_seoul(1.0, 0.0)).unwrap();
    let header = read_header(&settings.checkpoint_path()).unwrap();
    assert_eq!(header.population, 10);
    assert_eq!(header.dimension, TEST_DIMENSION);
}

#[test]
fn test_restart_answers_queries_like_before() {
    let temp = TempDir::new().unwrap();
    let settings = test_settings(temp.path());
    let query = vector_and_location_query();

    let (before, coffee_before, ids) = {
        let engine = GeoTagEngine::open(settings.clone(), hashing()).unwrap();
        let ids: Vec<LocationId> = (0..10)
            .map(|i| {
                let (description, tags) = PLACES[i % PLACES.len()];
                engine
                    .create(
                        near_seoul(i as f64 * 0.2, i as f64 * 0.1)
                            .with_description(description)
                            .with_tags(tags.iter().copied()),
                    )
                    .unwrap()
                    .id
            })
            .collect();

        // Past the last checkpoint: these live only in the store's log
        engine
            .create(near_seoul(0.4, 0.4).with_description("espresso bar").with_tags(["coffee"]))
            .unwrap();
        engine.delete(ids[2]).unwrap();
        let patch = LocationPatch {
            description: Some("coffee stand inside the market".to_string()),
            ..LocationPatch::default()
        };
        engine.update(ids[1], &patch).unwrap();

        (ranked(&engine, &query), text_hits(&engine, "coffee"), ids)
    };

    let engine = GeoTagEngine::open(settings, hashing()).unwrap();
    assert!(engine.verify_consistency().is_empty());
    assert_eq!(engine.stats().total_locations, 10);
    assert!(engine.get(ids[2]).is_err());

    let after = ranked(&engine, &query);
    assert_eq!(
        before.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        after.iter().map(|(id, _)| *id).collect::<Vec<_>>()
    );
    for ((_, a), (_, b)) in before.iter().zip(&after) {
        assert!((a - b).abs() < 1e-5);
    }
    assert_eq!(coffee_before, text_hits(&engine, "coffee"));
}

#[test]
fn test_restart_restores_partitioned_layout() {
    let temp = TempDir::new().unwrap();
    let mut settings = test_settings(temp.path());
    settings.vector.min_train_population = 20;
    settings.vector.partitions = 4;
    settings.vector.probe = 2;
    let query = vector_and_location_query();

    let (before, stats_before) = {
        let engine = GeoTagEngine::open(settings.clone(), hashing()).unwrap();
        let ids: Vec<LocationId> = (0..30)
            .map(|i| {
                let (description, tags) = PLACES[i % PLACES.len()];
                engine
                    .create(
                        near_seoul((i % 6) as f64 * 0.3, (i / 6) as f64 * 0.3)
                            .with_description(description)
                            .with_tags(tags.iter().copied()),
                    )
                    .unwrap()
                    .id
            })
            .collect();
        // Leave dead partition slots behind before the checkpoint
        engine.delete(ids[4]).unwrap();
        let patch = LocationPatch {
            description: Some("palace gate with evening lanterns".to_string()),
            ..LocationPatch::default()
        };
        engine.update(ids[0], &patch).unwrap();
        engine.checkpoint().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.index_type, VectorMode::Partitioned);
        (ranked(&engine, &query), stats.vector)
    };

    let engine = GeoTagEngine::open(settings, hashing()).unwrap();
    let stats = engine.stats();
    assert_eq!(stats.index_type, VectorMode::Partitioned);
    assert_eq!(stats.vector.partitions, stats_before.partitions);
    assert_eq!(stats.vector.tombstones, stats_before.tombstones);
    assert_eq!(stats.total_embeddings, 29);
    assert!(engine.verify_consistency().is_empty());

    let after = ranked(&engine, &query);
    assert!(!after.is_empty());
    assert_eq!(
        before.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        after.iter().map(|(id, _)| *id).collect::<Vec<_>>()
    );
    for ((_, a), (_, b)) in before.iter().zip(&after) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn test_corrupted_checkpoint_is_rebuilt_from_store() {
    let temp = TempDir::new().unwrap();
    let settings = test_settings(temp.path());
    {
        let engine = GeoTagEngine::open(settings.clone(), hashing()).unwrap();
        for i in 0..4 {
            engine.create(near_seoul(i as f64, 0.0).with_description("kiosk")).unwrap();
        }
        engine.checkpoint().unwrap();
    }
    std::fs::write(settings.checkpoint_path(), b"not a checkpoint").unwrap();

    let engine = GeoTagEngine::open(settings, hashing()).unwrap();
    assert_eq!(engine.stats().total_embeddings, 4);
    assert!(engine.verify_consistency().is_empty());
}

#[test]
fn test_new_identities_continue_after_restart() {
    let temp = TempDir::new().unwrap();
    let settings = test_settings(temp.path());

    let last = {
        let engine = GeoTagEngine::open(settings.clone(), hashing()).unwrap();
        engine.create(near_seoul(0.0, 0.0)).unwrap();
        let last = engine.create(near_seoul(0.1, 0.0)).unwrap().id;
        engine.delete(last).unwrap();
        last
    };

    let engine = GeoTagEngine::open(settings, hashing()).unwrap();
    let next = engine.create(near_seoul(0.2, 0.0)).unwrap().id;
    assert!(next > last);
}
