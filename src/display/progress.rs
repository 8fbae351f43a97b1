//! Progress display for long-running CLI operations.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const IMPORT_TEMPLATE: &str =
    "{spinner:.cyan} importing [{bar:32.green/white}] {pos}/{len} ({per_sec}) {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.cyan} {msg} {elapsed:.dim}";

/// Progress of a file import, advanced once per bulk request.
pub struct ImportProgress {
    bar: ProgressBar,
}

impl ImportProgress {
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        match ProgressStyle::with_template(IMPORT_TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("=> ")),
            Err(e) => tracing::debug!("import progress template rejected: {e}"),
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    /// Records a finished request of `items` locations. `failed` and
    /// `degraded` are running totals for the whole import.
    pub fn advance(&self, items: usize, failed: usize, degraded: usize) {
        self.bar.inc(items as u64);
        if failed > 0 || degraded > 0 {
            self.bar
                .set_message(format!("{failed} failed, {degraded} without vector"));
        }
    }

    pub fn finish(self) {
        self.bar.finish_and_clear();
    }
}

/// Runs `operation` behind a spinner that is cleared afterwards.
pub fn with_spinner<F, T>(message: &str, operation: F) -> T
where
    F: FnOnce() -> T,
{
    let spinner = ProgressBar::new_spinner().with_message(message.to_string());
    if let Ok(style) = ProgressStyle::with_template(SPINNER_TEMPLATE) {
        spinner.set_style(style);
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    let result = operation();
    spinner.finish_and_clear();
    result
}
