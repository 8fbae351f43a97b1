//! Settings files feeding the engine, in an isolated directory.

use geotag::{GeoError, GeoTagEngine, Settings};
use tempfile::TempDir;

use crate::common::{TEST_DIMENSION, hashing, test_settings};

#[test]
fn test_saved_settings_reopen_the_same_engine() {
    let test_dir = TempDir::new().expect("Failed to create temp dir");
    let settings_file = test_dir.path().join(".geotag").join("settings.toml");

    let mut settings = test_settings(test_dir.path());
    settings.search.max_limit = 42;
    settings.fusion.multi_match_bonus = 0.25;
    settings.save(&settings_file).expect("Should write settings file");
    assert!(settings_file.exists());

    let loaded = Settings::load_from(&settings_file).expect("Should load settings");
    assert_eq!(loaded.data_dir, settings.data_dir);
    assert_eq!(loaded.search.max_limit, 42);
    assert_eq!(loaded.fusion.multi_match_bonus, 0.25);
    assert_eq!(loaded.embedding.dimension, TEST_DIMENSION);

    let engine = GeoTagEngine::open(loaded, hashing()).expect("Should open engine");
    assert_eq!(engine.settings().search.max_limit, 42);
}

#[test]
fn test_partial_file_keeps_defaults() {
    let test_dir = TempDir::new().expect("Failed to create temp dir");
    let settings_file = test_dir.path().join("settings.toml");
    std::fs::write(
        &settings_file,
        r#"
[search]
default_limit = 7

[ingest]
batch_size = 16
"#,
    )
    .expect("Should write settings file");

    let loaded = Settings::load_from(&settings_file).expect("Should load settings");
    let defaults = Settings::default();
    assert_eq!(loaded.search.default_limit, 7);
    assert_eq!(loaded.ingest.batch_size, 16);
    assert_eq!(loaded.search.max_limit, defaults.search.max_limit);
    assert_eq!(loaded.ingest.max_bulk, defaults.ingest.max_bulk);
    assert_eq!(loaded.embedding.model, defaults.embedding.model);
}

#[test]
fn test_dimension_mismatch_refuses_to_open() {
    let test_dir = TempDir::new().expect("Failed to create temp dir");
    let mut settings = test_settings(test_dir.path());
    settings.embedding.dimension = TEST_DIMENSION * 2;

    let err = GeoTagEngine::open(settings, hashing()).unwrap_err();
    assert!(matches!(err, GeoError::Config { .. }), "got {err:?}");
}
