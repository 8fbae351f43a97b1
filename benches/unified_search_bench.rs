//! Performance benchmarks for unified search and bulk ingestion
//!
//! Uses an in-memory engine with the deterministic hashing embedder so the
//! numbers measure the indices and fusion, not a model.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use geotag::{
    Coordinate, GeoTagEngine, HashingEmbedder, Modalities, NewLocation, Settings, UnifiedQuery,
    VectorDimension,
};

const DIMENSION: usize = 128;
const WORDS: &[&str] = &[
    "coffee", "market", "museum", "park", "ramen", "books", "river", "palace", "tea", "bakery",
];

fn create_engine(population: usize) -> GeoTagEngine {
    let mut settings = Settings::default();
    settings.embedding.model = "hashing".to_string();
    settings.embedding.dimension = DIMENSION;
    let generator = Arc::new(HashingEmbedder::new(VectorDimension::new(DIMENSION).unwrap()));
    let engine = GeoTagEngine::in_memory(settings, generator).unwrap();

    let locations = create_test_locations(population);
    for chunk in locations.chunks(engine.settings().ingest.max_bulk) {
        engine.bulk_create(chunk).unwrap();
    }
    engine
}

fn create_test_locations(count: usize) -> Vec<NewLocation> {
    (0..count)
        .map(|i| {
            let word = WORDS[i % WORDS.len()];
            let other = WORDS[(i * 7 + 3) % WORDS.len()];
            NewLocation::new(37.40 + (i % 97) as f64 * 0.004, 126.80 + (i % 89) as f64 * 0.004)
                .with_description(format!("{word} place number {i} next to the {other}"))
                .with_tags([word])
        })
        .collect()
}

fn seoul() -> Coordinate {
    Coordinate::new(37.5665, 126.9780).unwrap()
}

fn bench_unified_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("unified_search");
    for population in [1_000, 5_000] {
        let engine = create_engine(population);
        let queries = [
            (
                "location",
                UnifiedQuery::default()
                    .with_location(seoul(), 2.0)
                    .with_modalities(Modalities::LOCATION),
            ),
            (
                "text",
                UnifiedQuery::default()
                    .with_text("coffee market")
                    .with_modalities(Modalities::TEXT),
            ),
            (
                "all",
                UnifiedQuery::default()
                    .with_text("coffee market")
                    .with_location(seoul(), 2.0),
            ),
        ];
        for (name, query) in &queries {
            group.bench_with_input(BenchmarkId::new(*name, population), query, |b, query| {
                b.iter(|| black_box(engine.search(black_box(query)).unwrap()));
            });
        }
    }
    group.finish();
}

fn bench_bulk_create(c: &mut Criterion) {
    let locations = create_test_locations(500);
    c.bench_function("bulk_create_500_locations", |b| {
        b.iter_batched(
            || create_engine(0),
            |engine| black_box(engine.bulk_create(&locations).unwrap()),
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(benches, bench_unified_search, bench_bulk_create);
criterion_main!(benches);
