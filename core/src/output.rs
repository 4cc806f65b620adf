//! Report consumers
//!
//! Outputs are the extension seam for anything that wants to observe report
//! windows: consoles, files, custom exporters. They are registered on the
//! facade before the test starts and invoked from the runner's report pump.

use crate::stats::Report;

/// A consumer of report windows.
pub trait Output: Send + Sync {
    /// Called once when the test starts.
    fn on_start(&self) {}

    /// Called with every emitted report, final summary included.
    fn on_event(&self, report: &Report);

    /// Called once when the test stops.
    fn on_stop(&self) {}
}

/// Prints a per-endpoint summary table for each report window.
#[derive(Debug, Default)]
pub struct ConsoleOutput;

impl ConsoleOutput {
    /// Create a console output.
    pub fn new() -> Self {
        Self
    }
}

impl Output for ConsoleOutput {
    fn on_start(&self) {
        tracing::info!("console output started");
    }

    fn on_event(&self, report: &Report) {
        println!("Current time: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        println!("Active users: {}", report.user_count);
        println!(
            "{:<8} {:<24} {:>10} {:>8} {:>9} {:>7} {:>7} {:>8}",
            "TYPE", "NAME", "# REQS", "# FAILS", "AVG(ms)", "MIN", "MAX", "REQ/S"
        );
        for row in report.stats.iter().chain(std::iter::once(&report.stats_total)) {
            println!(
                "{:<8} {:<24} {:>10} {:>8} {:>9.1} {:>7} {:>7} {:>8.1}",
                row.method,
                row.name,
                row.num_requests,
                row.num_failures,
                row.average_response_time(),
                row.min_response_time.unwrap_or(0),
                row.max_response_time,
                row.requests_per_second(),
            );
        }
        if !report.errors.is_empty() {
            println!("Errors:");
            let mut errors: Vec<_> = report.errors.iter().collect();
            errors.sort();
            for (key, count) in errors {
                println!("  {count:>6}  {key}");
            }
        }
        println!();
    }

    fn on_stop(&self) {
        tracing::info!("console output stopped");
    }
}
