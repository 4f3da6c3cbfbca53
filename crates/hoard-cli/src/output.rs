//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use anyhow::Result;
use serde::Serialize;

use hoard_core::{BatchReport, CompactionReport, StorageHealth};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is in quiet mode
    pub fn is_quiet(&self) -> bool {
        matches!(self.format, OutputFormat::Quiet)
    }

    /// Print any serializable value as pretty JSON
    pub fn json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Print a storage health snapshot
    pub fn print_health(&self, health: &StorageHealth) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "  State:      {}{}",
                    state_label(health),
                    if health.is_healthy { "" } else { " (nearly full)" }
                );
                println!(
                    "  Used:       {} of {} ({})",
                    format_bytes(health.used_bytes),
                    if health.quota_bytes == 0 {
                        "unlimited".to_string()
                    } else {
                        format_bytes(health.quota_bytes)
                    },
                    format_percent(health.percent_used)
                );
                println!(
                    "  Persistent: {}",
                    if health.persistent { "yes" } else { "no" }
                );
                if let Some(ref error) = health.last_error {
                    println!("  Last error: {}", error);
                }
            }
            OutputFormat::Json => self.json(health)?,
            OutputFormat::Quiet => println!("{}", state_label(health)),
        }
        Ok(())
    }

    /// Print the outcome of a bulk write
    pub fn print_batch_report(&self, collection: &str, report: &BatchReport) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "✓ Wrote {} record(s) to {} in {} transaction(s)",
                    report.written, collection, report.transactions
                );
                if report.skipped > 0 {
                    println!("⚠ Skipped {} invalid record(s)", report.skipped);
                }
            }
            OutputFormat::Json => self.json(report)?,
            OutputFormat::Quiet => println!("{}", report.written),
        }
        Ok(())
    }

    /// Print the outcome of a compaction pass
    pub fn print_compaction(&self, report: &CompactionReport) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                println!("✓ Compacted database");
                println!("  Before:    {}", format_bytes(report.bytes_before));
                println!("  After:     {}", format_bytes(report.bytes_after));
                println!("  Reclaimed: {}", format_bytes(report.bytes_reclaimed()));
            }
            OutputFormat::Json => self.json(report)?,
            OutputFormat::Quiet => println!("{}", report.bytes_reclaimed()),
        }
        Ok(())
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn state_label(health: &StorageHealth) -> String {
    serde_json::to_value(health.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", health.state))
}

/// Format a byte count with a binary unit
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = next;
    }
    format!("{:.1} {}", value, unit)
}

/// Format a percentage with one decimal place
pub fn format_percent(percent: f64) -> String {
    format!("{:.1}%", percent)
}
