//! Eviction and compaction command handlers

use anyhow::{Context, Result};

use hoard_core::{Collection, Engine};

use crate::output::{Output, OutputFormat};

/// Delete records older than `days` from a collection
pub async fn evict(engine: &Engine, collection: String, days: u32, output: &Output) -> Result<()> {
    let target: Collection = collection.parse()?;
    let removed = engine
        .clear_old_data(target, days)
        .await
        .with_context(|| format!("Failed to clear old data from {}", target))?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "collection": target.to_string(),
                    "older_than_days": days,
                    "removed": removed
                })
            );
        }
        OutputFormat::Quiet => println!("{}", removed),
        OutputFormat::Human => {
            output.success(&format!(
                "Removed {} record(s) older than {} day(s) from {}",
                removed, days, target
            ));
        }
    }
    Ok(())
}

/// Reclaim free pages and reopen the database
pub async fn compact(engine: &Engine, output: &Output) -> Result<()> {
    let report = engine
        .compact_database()
        .await
        .context("Failed to compact database")?;
    output.print_compaction(&report)
}
