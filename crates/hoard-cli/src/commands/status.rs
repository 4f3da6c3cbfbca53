//! Status command handler

use anyhow::Result;

use hoard_core::{Collection, Engine};

use crate::output::{Output, OutputFormat};

/// Show storage health and contents
pub async fn show(engine: &Engine, output: &Output) -> Result<()> {
    let health = engine.check_health();
    let db = engine.database()?;
    let records = engine.count(Collection::Data).await?;
    let chunks = engine.count(Collection::Chunks).await?;
    let last_compaction = engine.last_compaction().await?;

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "database": db.name(),
                    "path": db.path(),
                    "schema_version": db.schema_version(),
                    "health": health,
                    "counts": {
                        "data": records,
                        "chunks": chunks
                    },
                    "last_compaction": last_compaction
                })
            );
        }
        OutputFormat::Quiet => {
            output.print_health(&health)?;
        }
        OutputFormat::Human => {
            println!("Hoard Status");
            println!("============");
            println!();
            println!("Database:");
            println!("  Name:       {}", db.name());
            println!("  Location:   {}", db.path().display());
            println!("  Schema:     v{}", db.schema_version());
            println!(
                "  Compacted:  {}",
                last_compaction.as_deref().unwrap_or("never")
            );
            println!();
            println!("Storage:");
            output.print_health(&health)?;
            println!();
            println!("Contents:");
            println!("  Records: {}", records);
            println!("  Chunks:  {}", chunks);
        }
    }

    Ok(())
}
