//! Unified queries through the engine: fusion, radius filtering, thresholds.

use geotag::{
    Coordinate, GeoError, GeoTagEngine, LocationId, LocationPatch, Modalities, Modality,
    NewLocation, UnifiedQuery, VectorMode,
};
use tempfile::TempDir;

use crate::common::{SEOUL, create_test_engine, hashing, near_seoul, test_settings};

fn seoul() -> Coordinate {
    Coordinate::new(SEOUL.0, SEOUL.1).unwrap()
}

#[test]
fn test_record_matching_two_modalities_ranks_first() {
    let (engine, _dir) = create_test_engine();

    // Text match, far away
    let far = engine
        .create(
            NewLocation::new(35.1796, 129.0756)
                .with_description("coffee roastery")
                .with_tags(["coffee"]),
        )
        .unwrap();
    // Text match, close by
    let near = engine
        .create(
            near_seoul(0.2, 0.1)
                .with_description("coffee roastery")
                .with_tags(["coffee"]),
        )
        .unwrap();
    // Close by, no text match
    engine
        .create(near_seoul(0.1, 0.0).with_description("bicycle repair").with_tags(["bikes"]))
        .unwrap();

    let query = UnifiedQuery::default()
        .with_text("coffee")
        .with_location(seoul(), 5.0)
        .with_modalities(Modalities::TEXT | Modalities::LOCATION);
    let response = engine.search(&query).unwrap();

    assert_eq!(response.results[0].id, near.id);
    assert!(
        response.results[0].matched.contains(&Modality::Text)
            && response.results[0].matched.contains(&Modality::Location)
    );
    let far_rank = response.results.iter().position(|r| r.id == far.id).unwrap();
    assert!(far_rank > 0);
    assert!(response.results.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn test_radius_query_returns_only_points_inside() {
    let (engine, _dir) = create_test_engine();
    for (north, east) in [(0.3, 0.0), (0.0, 0.7), (0.95, 0.0), (1.2, 0.0), (3.0, 3.0), (0.5, 0.5)] {
        engine
            .create(near_seoul(north, east).with_description("somewhere"))
            .unwrap();
    }

    let query = UnifiedQuery::default()
        .with_location(seoul(), 1.0)
        .with_modalities(Modalities::LOCATION)
        .with_limit(50);
    let response = engine.search(&query).unwrap();

    assert_eq!(response.results.len(), 4);
    let distances: Vec<f64> = response
        .results
        .iter()
        .map(|r| r.distance_km.unwrap())
        .collect();
    assert!(distances.iter().all(|d| *d <= 1.0));
    assert!(distances.windows(2).all(|w| w[0] <= w[1]), "{distances:?}");
}

#[test]
fn test_query_without_modalities_is_rejected() {
    let (engine, _dir) = create_test_engine();
    engine.create(near_seoul(0.0, 0.0)).unwrap();

    let query = UnifiedQuery::default()
        .with_text("anything")
        .with_modalities(Modalities::empty());
    let err = engine.search(&query).unwrap_err();
    assert!(matches!(err, GeoError::InvalidQuery { .. }));
    assert_eq!(err.status_code(), "INVALID_QUERY");
}

#[test]
fn test_radius_above_maximum_is_capacity_error() {
    let (engine, _dir) = create_test_engine();
    let max = engine.settings().search.max_radius_km;

    let query = UnifiedQuery::default()
        .with_location(seoul(), max * 2.0)
        .with_modalities(Modalities::LOCATION);
    assert!(matches!(
        engine.search(&query),
        Err(GeoError::CapacityExceeded { .. })
    ));
}

#[test]
fn test_pagination_pages_do_not_overlap() {
    let (engine, _dir) = create_test_engine();
    for i in 0..12 {
        engine.create(near_seoul(i as f64 * 0.05, 0.0)).unwrap();
    }

    let base = UnifiedQuery::default()
        .with_location(seoul(), 2.0)
        .with_modalities(Modalities::LOCATION)
        .with_limit(5);
    let first = engine.search(&base.clone()).unwrap();
    let second = engine.search(&base.with_offset(5)).unwrap();

    assert_eq!(first.results.len(), 5);
    assert_eq!(second.results.len(), 5);
    for hit in &second.results {
        assert!(first.results.iter().all(|r| r.id != hit.id));
    }
}

#[test]
fn test_vector_threshold_holds_across_index_modes() {
    let temp = TempDir::new().unwrap();
    let mut settings = test_settings(temp.path());
    settings.vector.min_train_population = 20;
    settings.vector.partitions = 4;
    settings.vector.probe = 4;
    let engine = GeoTagEngine::open(settings, hashing()).unwrap();

    let descriptions = [
        "coffee shop with pastries",
        "coffee bar open late",
        "museum of modern art",
        "riverside cycling path",
        "night market food stalls",
    ];
    let query = UnifiedQuery::default()
        .with_text("coffee shop")
        .with_modalities(Modalities::VECTOR)
        .with_threshold(0.5)
        .with_limit(50);

    let check = |engine: &GeoTagEngine| {
        let response = engine.search(&query).unwrap();
        for result in &response.results {
            let similarity = result.similarity.unwrap();
            assert!(similarity >= 0.5, "similarity {similarity} below threshold");
        }
        response.results.len()
    };

    for i in 0..10 {
        engine
            .create(near_seoul(i as f64, 0.0).with_description(descriptions[i % descriptions.len()]))
            .unwrap();
    }
    assert_eq!(engine.stats().index_type, VectorMode::Exhaustive);
    let before = check(&engine);
    assert!(before > 0);

    for i in 10..30 {
        engine
            .create(near_seoul(i as f64, 0.0).with_description(descriptions[i % descriptions.len()]))
            .unwrap();
    }
    assert_eq!(engine.stats().index_type, VectorMode::Partitioned);
    // Probing every partition finds at least what exhaustive search found
    assert!(check(&engine) >= before);
}

#[test]
fn test_response_reports_candidates_per_modality() {
    let (engine, _dir) = create_test_engine();
    engine
        .create(near_seoul(0.1, 0.1).with_description("tea house").with_tags(["tea"]))
        .unwrap();
    engine
        .create(near_seoul(0.2, 0.1).with_description("dumpling shop"))
        .unwrap();

    let query = UnifiedQuery::default()
        .with_text("tea")
        .with_location(seoul(), 1.0)
        .with_threshold(0.0);
    let response = engine.search(&query).unwrap();

    assert_eq!(response.modalities_used, Modality::ALL.to_vec());
    assert_eq!(response.candidate_counts[&Modality::Location], 2);
    assert_eq!(response.candidate_counts[&Modality::Text], 1);
    assert!(response.total_before_dedup >= response.total_candidates);
    assert_eq!(response.total_candidates, 2);
}

#[test]
fn test_equal_text_scores_page_by_identity() {
    let (engine, _dir) = create_test_engine();
    let ids: Vec<LocationId> = (0..25)
        .map(|i| {
            engine
                .create(near_seoul(i as f64 * 0.1, 0.0).with_description("cafe").with_tags(["cafe"]))
                .unwrap()
                .id
        })
        .collect();

    // Moving the first record re-indexes it without changing its text
    let patch = LocationPatch {
        latitude: Some(SEOUL.0 + 0.05),
        ..LocationPatch::default()
    };
    engine.update(ids[0], &patch).unwrap();

    let text_page = |offset: usize, limit: usize| -> Vec<LocationId> {
        let query = UnifiedQuery::default()
            .with_text("cafe")
            .with_modalities(Modalities::TEXT)
            .with_offset(offset)
            .with_limit(limit);
        engine.search(&query).unwrap().results.into_iter().map(|r| r.id).collect()
    };

    assert_eq!(text_page(0, 1), vec![ids[0]]);
    assert_eq!(text_page(1, 1), vec![ids[1]]);
    let everything = text_page(0, 25);
    assert_eq!(everything, ids);
    assert_eq!(text_page(0, 5), everything[..5].to_vec());
}
