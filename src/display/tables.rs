//! Table formatting for CLI output.

use comfy_table::{
    Attribute, Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::engine::EngineStats;
use crate::ingest::{BulkOutcome, ItemOutcome, ReconcileReport};
use crate::search::UnifiedSearchResponse;
use crate::types::LocationRecord;

/// Longest description shown in a table cell.
const DESCRIPTION_WIDTH: usize = 48;

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    pub fn new() -> Self {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.apply_modifier(UTF8_ROUND_CORNERS);
        Self { table }
    }

    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        let header_cells: Vec<Cell> = headers
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect();
        self.table.set_header(header_cells);
        self
    }

    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    pub fn build(self) -> String {
        self.table.to_string()
    }
}

/// One row per record.
pub fn create_locations_table(records: &[LocationRecord]) -> String {
    records
        .iter()
        .fold(
            TableBuilder::new().set_headers(vec![
                "ID",
                "Latitude",
                "Longitude",
                "Tags",
                "Description",
                "Vector",
            ]),
            |table, record| {
                table.add_row(vec![
                    record.id.to_string(),
                    format!("{:.6}", record.coordinate.latitude),
                    format!("{:.6}", record.coordinate.longitude),
                    record.tags.join(", "),
                    truncate(&record.description),
                    vector_state(record).to_string(),
                ])
            },
        )
        .build()
}

/// Ranked search results followed by the per-modality summary.
pub fn create_search_table(response: &UnifiedSearchResponse) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table.set_header(vec![
        Cell::new("#").add_attribute(Attribute::Bold),
        Cell::new("ID").add_attribute(Attribute::Bold),
        Cell::new("Score").add_attribute(Attribute::Bold),
        Cell::new("Matched").add_attribute(Attribute::Bold),
        Cell::new("Distance").add_attribute(Attribute::Bold),
        Cell::new("Tags").add_attribute(Attribute::Bold),
        Cell::new("Description").add_attribute(Attribute::Bold),
    ]);

    for (rank, result) in response.results.iter().enumerate() {
        let matched: Vec<String> = result.matched.iter().map(ToString::to_string).collect();
        // More than one modality is the signal worth highlighting
        let matched_cell = if matched.len() > 1 {
            Cell::new(matched.join("+")).fg(Color::Green)
        } else {
            Cell::new(matched.join("+"))
        };
        table.add_row(vec![
            Cell::new(rank + 1),
            Cell::new(result.id),
            Cell::new(format!("{:.3}", result.score)),
            matched_cell,
            Cell::new(
                result
                    .distance_km
                    .map(|d| format!("{d:.3} km"))
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(result.record.tags.join(", ")),
            Cell::new(truncate(&result.record.description)),
        ]);
    }

    let counts: Vec<String> = response
        .candidate_counts
        .iter()
        .map(|(modality, count)| format!("{modality}: {count}"))
        .collect();
    format!(
        "{table}\n{} results | candidates {} ({} before dedup) | {} | {:.1} ms",
        response.results.len(),
        response.total_candidates,
        response.total_before_dedup,
        counts.join(", "),
        response.elapsed_ms
    )
}

pub fn create_stats_table(stats: &EngineStats) -> String {
    TableBuilder::new()
        .set_headers(vec!["Metric", "Value"])
        .add_row(vec!["Locations".into(), stats.total_locations.to_string()])
        .add_row(vec!["Embeddings".into(), stats.total_embeddings.to_string()])
        .add_row(vec![
            "Without vector".into(),
            stats.degraded_locations.to_string(),
        ])
        .add_row(vec!["Embedding model".into(), stats.embedding_model.clone()])
        .add_row(vec!["Vector index".into(), stats.index_type.to_string()])
        .add_row(vec!["Partitions".into(), stats.vector.partitions.to_string()])
        .add_row(vec!["Tombstones".into(), stats.vector.tombstones.to_string()])
        .add_row(vec!["Dimension".into(), stats.vector.dimension.to_string()])
        .add_row(vec![
            "Ops since checkpoint".into(),
            stats.vector.ops_since_checkpoint.to_string(),
        ])
        .add_row(vec!["Spatial entries".into(), stats.spatial_entries.to_string()])
        .add_row(vec!["Text entries".into(), stats.text_entries.to_string()])
        .add_row(vec!["Stale entries".into(), stats.stale_entries.to_string()])
        .add_row(vec![
            "Pending log entries".into(),
            stats.pending_log_entries.to_string(),
        ])
        .build()
}

/// Aggregate counts plus one row per failed or degraded item.
pub fn create_bulk_table(outcome: &BulkOutcome) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);
    table.set_header(vec![
        Cell::new("Item").add_attribute(Attribute::Bold),
        Cell::new("Result").add_attribute(Attribute::Bold),
        Cell::new("Detail").add_attribute(Attribute::Bold),
    ]);

    for item in &outcome.items {
        match item {
            ItemOutcome::Failed {
                index,
                code,
                reason,
            } => {
                table.add_row(vec![
                    Cell::new(index),
                    Cell::new(code).fg(Color::Red),
                    Cell::new(reason),
                ]);
            }
            ItemOutcome::Created {
                index,
                id,
                embedding_failure: Some(reason),
            } => {
                table.add_row(vec![
                    Cell::new(index),
                    Cell::new(format!("created {id}, no vector")).fg(Color::Yellow),
                    Cell::new(reason),
                ]);
            }
            ItemOutcome::Created { .. } => {}
        }
    }

    table.add_row(vec![
        Cell::new("TOTAL").add_attribute(Attribute::Bold),
        Cell::new(format!(
            "{} created / {} failed",
            outcome.success_count, outcome.failed_count
        ))
        .add_attribute(Attribute::Bold),
        Cell::new(format!(
            "{} items in {:.1} ms",
            outcome.total_count, outcome.elapsed_ms
        )),
    ]);
    table.to_string()
}

pub fn create_reconcile_table(report: &ReconcileReport) -> String {
    TableBuilder::new()
        .set_headers(vec!["Check", "Count"])
        .add_row(vec!["Records scanned".into(), report.scanned.to_string()])
        .add_row(vec!["Stale flags drained".into(), report.stale_drained.to_string()])
        .add_row(vec!["Spatial repairs".into(), report.spatial_repairs.to_string()])
        .add_row(vec!["Text repairs".into(), report.text_repairs.to_string()])
        .add_row(vec!["Vector repairs".into(), report.vector_repairs.to_string()])
        .add_row(vec!["Orphans evicted".into(), report.orphans_evicted.to_string()])
        .add_row(vec![
            "Embeddings recomputed".into(),
            report.embeddings_recomputed.to_string(),
        ])
        .add_row(vec![
            "Still without vector".into(),
            report.embedding_failures.to_string(),
        ])
        .build()
}

fn vector_state(record: &LocationRecord) -> &'static str {
    match (&record.embedding, &record.embedding_failure) {
        (Some(_), _) => "yes",
        (None, Some(_)) => "failed",
        (None, None) => "pending",
    }
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= DESCRIPTION_WIDTH {
        return text.to_string();
    }
    let cut: String = text.chars().take(DESCRIPTION_WIDTH - 1).collect();
    format!("{cut}…")
}
