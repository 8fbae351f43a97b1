//! CLI entry point for the geo-tag search engine.
//!
//! Every command opens the engine on the configured data directory, runs one
//! operation and exits. Output is a table by default and JSON with `--json`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use console::style;
use geotag::display::{
    ImportProgress, create_bulk_table, create_locations_table, create_reconcile_table,
    create_search_table, create_stats_table, with_spinner,
};
use geotag::vector::generator_from_config;
use geotag::{
    BulkOutcome, Coordinate, GeoError, GeoTagEngine, LocationId, LocationPatch, Modalities,
    NewLocation, Settings, UnifiedQuery,
};
use serde::{Deserialize, Serialize};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Geo-tagged locations with keyword, semantic and radius search
#[derive(Parser)]
#[command(
    name = "geotag",
    version = env!("CARGO_PKG_VERSION"),
    about = "Geo-tagged locations with keyword, semantic and radius search",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Examples:\n  geotag init\n  geotag add --lat 37.5665 --lon 126.9780 --tags cafe,coffee -d \"Cafe near City Hall\"\n  geotag import locations.json\n  geotag search --text cafe --lat 37.5665 --lon 126.9780 --radius 1.0\n  geotag search --text \"quiet place to read\" --no-text --threshold 0.5"
)]
struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
enum Commands {
    /// Initialize project
    #[command(about = "Set up .geotag directory with default configuration")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show current configuration settings
    #[command(about = "Display active settings from .geotag/settings.toml")]
    Config,

    /// Create one location
    Add {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Comma-separated tags
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,

        #[arg(short, long, default_value = "")]
        description: String,

        #[arg(long)]
        json: bool,
    },

    /// Show one location
    Get {
        id: u64,

        #[arg(long)]
        json: bool,
    },

    /// Change fields of a location; omitted fields stay as they are
    Update {
        id: u64,

        #[arg(long, allow_hyphen_values = true)]
        lat: Option<f64>,

        #[arg(long, allow_hyphen_values = true)]
        lon: Option<f64>,

        /// Comma-separated tags, replacing the current ones
        #[arg(short, long, value_delimiter = ',')]
        tags: Option<Vec<String>>,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Delete a location
    Delete { id: u64 },

    /// List locations, newest first
    List {
        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Bulk-create locations from a JSON file
    #[command(
        after_help = "The file holds an array of {\"latitude\", \"longitude\", \"tags\", \"description\"} objects,\nor an object with such an array under \"locations\"."
    )]
    Import {
        file: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Unified search over text, vector and location
    #[command(
        after_help = "Text and vector search run when --text is given, location search when\n--lat/--lon are given. --no-text, --no-vector and --no-location switch a modality off."
    )]
    Search {
        #[arg(long)]
        text: Option<String>,

        #[arg(long, allow_hyphen_values = true, requires = "lon")]
        lat: Option<f64>,

        #[arg(long, allow_hyphen_values = true, requires = "lat")]
        lon: Option<f64>,

        /// Radius in kilometres (defaults to search.default_radius_km)
        #[arg(long)]
        radius: Option<f64>,

        #[arg(long)]
        no_text: bool,

        #[arg(long)]
        no_vector: bool,

        #[arg(long)]
        no_location: bool,

        /// Minimum vector similarity (defaults to search.default_similarity_threshold)
        #[arg(long)]
        threshold: Option<f32>,

        #[arg(short, long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long)]
        json: bool,
    },

    /// Repair index entries from the record store
    Reconcile {
        #[arg(long)]
        json: bool,
    },

    /// Write the vector checkpoint
    Checkpoint {
        /// Re-partition the vector index first, dropping tombstones
        #[arg(long)]
        rebuild: bool,

        /// Also fold the record log into a fresh snapshot
        #[arg(long)]
        compact: bool,
    },

    /// Show record and index statistics
    Stats {
        #[arg(long)]
        json: bool,
    },
}

/// Accepted shapes of an import file.
#[derive(Deserialize)]
#[serde(untagged)]
enum ImportFile {
    List(Vec<NewLocation>),
    Wrapped { locations: Vec<NewLocation> },
}

impl ImportFile {
    fn into_locations(self) -> Vec<NewLocation> {
        match self {
            Self::List(locations) | Self::Wrapped { locations } => locations,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            if let Some(geo) = e.downcast_ref::<GeoError>() {
                for suggestion in geo.recovery_suggestions() {
                    eprintln!("  Suggestion: {suggestion}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::load_from(path).map_err(|e| {
            anyhow::anyhow!("Configuration error loading from {}: {e}", path.display())
        })?,
        None => Settings::load().unwrap_or_else(|e| {
            eprintln!("Configuration error: {e}");
            eprintln!("Using default configuration.");
            Settings::default()
        }),
    };
    geotag::logging::init(&settings.logging);

    match cli.command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(force).map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Created configuration file at: {}", path.display());
            println!("Edit this file to customize your settings.");
            Ok(())
        }

        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }

        command => {
            let engine = open_engine(settings)?;
            dispatch(&engine, command)
        }
    }
}

fn open_engine(settings: Settings) -> Result<GeoTagEngine> {
    let generator = with_spinner(
        &format!("Loading embedding model {}", settings.embedding.model),
        || generator_from_config(&settings.embedding),
    )?;
    let data_dir = settings.data_dir.clone();
    let engine = GeoTagEngine::open(settings, generator)
        .with_context(|| format!("Could not open data directory {}", data_dir.display()))?;
    Ok(engine)
}

fn dispatch(engine: &GeoTagEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Add {
            lat,
            lon,
            tags,
            description,
            json,
        } => {
            let location = NewLocation::new(lat, lon)
                .with_tags(tags)
                .with_description(description);
            let record = engine.create(location)?;
            if json {
                print_json(&record)?;
            } else {
                println!("{} Created location {}", style("✓").green(), record.id);
                if let Some(reason) = &record.embedding_failure {
                    println!(
                        "{} Stored without a vector: {reason}",
                        style("!").yellow().bold()
                    );
                }
            }
            Ok(())
        }

        Commands::Get { id, json } => {
            let record = engine.get(parse_id(id)?)?;
            if json {
                print_json(&record)
            } else {
                println!("{}", create_locations_table(std::slice::from_ref(&record)));
                Ok(())
            }
        }

        Commands::Update {
            id,
            lat,
            lon,
            tags,
            description,
            json,
        } => {
            let patch = LocationPatch {
                latitude: lat,
                longitude: lon,
                tags,
                description,
            };
            let record = engine.update(parse_id(id)?, &patch)?;
            if json {
                print_json(&record)
            } else {
                println!(
                    "{} Updated location {} (revision {})",
                    style("✓").green(),
                    record.id,
                    record.revision
                );
                Ok(())
            }
        }

        Commands::Delete { id } => {
            let id = parse_id(id)?;
            engine.delete(id)?;
            println!("{} Deleted location {id}", style("✓").green());
            Ok(())
        }

        Commands::List {
            offset,
            limit,
            json,
        } => {
            let records = engine.list(offset, limit);
            if json {
                print_json(&records)
            } else if records.is_empty() {
                println!("No locations.");
                Ok(())
            } else {
                println!("{}", create_locations_table(&records));
                Ok(())
            }
        }

        Commands::Import { file, json } => {
            let outcome = import(engine, &file)?;
            if json {
                print_json(&outcome)
            } else {
                println!("{}", create_bulk_table(&outcome));
                Ok(())
            }
        }

        Commands::Search {
            text,
            lat,
            lon,
            radius,
            no_text,
            no_vector,
            no_location,
            threshold,
            limit,
            offset,
            json,
        } => {
            let search = &engine.settings().search;
            let mut query = UnifiedQuery::with_defaults(search).with_offset(offset);

            let mut modalities = Modalities::empty();
            if let Some(text) = text {
                query = query.with_text(text);
                if !no_text {
                    modalities |= Modalities::TEXT;
                }
                if !no_vector {
                    modalities |= Modalities::VECTOR;
                }
            }
            if let (Some(lat), Some(lon)) = (lat, lon) {
                let center = Coordinate::new(lat, lon)?;
                query = query.with_location(center, radius.unwrap_or(search.default_radius_km));
                if !no_location {
                    modalities |= Modalities::LOCATION;
                }
            }
            query = query.with_modalities(modalities);
            if let Some(threshold) = threshold {
                query = query.with_threshold(threshold);
            }
            if let Some(limit) = limit {
                query = query.with_limit(limit);
            }

            let response = engine.search(&query)?;
            if json {
                print_json(&response)
            } else {
                println!("{}", create_search_table(&response));
                Ok(())
            }
        }

        Commands::Reconcile { json } => {
            let report = engine.reconcile();
            if json {
                print_json(&report)
            } else {
                println!("{}", create_reconcile_table(&report));
                Ok(())
            }
        }

        Commands::Checkpoint { rebuild, compact } => {
            if rebuild {
                with_spinner("Rebuilding vector partitions", || {
                    engine.rebuild_vector_index()
                })?;
            } else {
                engine.checkpoint()?;
            }
            println!("{} Vector checkpoint written", style("✓").green());
            if compact {
                engine.compact_store()?;
                println!("{} Record log compacted", style("✓").green());
            }
            Ok(())
        }

        Commands::Stats { json } => {
            let stats = engine.stats();
            if json {
                print_json(&stats)
            } else {
                println!("{}", create_stats_table(&stats));
                Ok(())
            }
        }

        Commands::Init { .. } | Commands::Config => Ok(()),
    }
}

/// Feeds the file to the engine in requests of at most `max_bulk` items.
fn import(engine: &GeoTagEngine, file: &Path) -> Result<BulkOutcome> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Could not read {}", file.display()))?;
    let locations = serde_json::from_str::<ImportFile>(&content)
        .with_context(|| format!("{} is not a list of locations", file.display()))?
        .into_locations();

    let max_bulk = engine.settings().ingest.max_bulk.max(1);
    let progress = ImportProgress::new(locations.len());

    let mut total = BulkOutcome {
        items: Vec::with_capacity(locations.len()),
        success_count: 0,
        failed_count: 0,
        degraded_count: 0,
        total_count: 0,
        elapsed_ms: 0.0,
    };
    for (chunk_index, chunk) in locations.chunks(max_bulk).enumerate() {
        let outcome = engine.bulk_create(chunk)?;
        let base = chunk_index * max_bulk;
        total.items.extend(outcome.items.into_iter().map(|mut item| {
            shift_index(&mut item, base);
            item
        }));
        total.success_count += outcome.success_count;
        total.failed_count += outcome.failed_count;
        total.degraded_count += outcome.degraded_count;
        total.total_count += outcome.total_count;
        total.elapsed_ms += outcome.elapsed_ms;
        progress.advance(chunk.len(), total.failed_count, total.degraded_count);
    }
    progress.finish();

    // A one-off import rarely reaches the automatic checkpoint interval
    engine.checkpoint()?;
    Ok(total)
}

fn shift_index(item: &mut geotag::ItemOutcome, base: usize) {
    match item {
        geotag::ItemOutcome::Created { index, .. } | geotag::ItemOutcome::Failed { index, .. } => {
            *index += base;
        }
    }
}

fn parse_id(raw: u64) -> Result<LocationId> {
    LocationId::new(raw).ok_or_else(|| {
        GeoError::Validation {
            field: "id".to_string(),
            reason: "location ids start at 1".to_string(),
        }
        .into()
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
