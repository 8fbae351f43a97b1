//! Terminal output for the CLI: tables and progress bars.

pub mod progress;
pub mod tables;

pub use progress::{ImportProgress, with_spinner};
pub use tables::{
    TableBuilder, create_bulk_table, create_locations_table, create_reconcile_table,
    create_search_table, create_stats_table,
};
