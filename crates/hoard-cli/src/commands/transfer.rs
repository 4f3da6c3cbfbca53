//! Import and export command handlers
//!
//! Both directions use JSON lines: one record object per line.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use futures_util::StreamExt;

use hoard_core::{Collection, Engine, Record};

use crate::output::{Output, OutputFormat};

/// Default page size for exports
const EXPORT_PAGE_SIZE: usize = 500;

/// Bulk-load records from a JSON lines file
pub async fn import(
    engine: &Engine,
    collection: String,
    file: PathBuf,
    batch_size: Option<usize>,
    output: &Output,
) -> Result<()> {
    let target: Collection = collection.parse()?;
    let reader = BufReader::new(
        File::open(&file).with_context(|| format!("Failed to open {:?}", file))?,
    );
    let records = parse_records(reader).with_context(|| format!("Failed to read {:?}", file))?;

    let mut writer = engine.writer();
    if let Some(size) = batch_size {
        writer = writer.with_batch_size(size);
    }
    let report = writer
        .write(target, &records)
        .await
        .with_context(|| format!("Import into {} failed", target))?;

    output.print_batch_report(&target.to_string(), &report)
}

/// Write every record of a collection as JSON lines
pub async fn export(
    engine: &Engine,
    collection: String,
    batch_size: Option<usize>,
    path: Option<PathBuf>,
    output: &Output,
) -> Result<()> {
    let source: Collection = collection.parse()?;
    let sink: Box<dyn Write> = match &path {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("Failed to create {:?}", path))?,
        ),
        None => Box::new(io::stdout().lock()),
    };
    let mut sink = BufWriter::new(sink);

    let mut pages = engine.stream_read(source, batch_size.unwrap_or(EXPORT_PAGE_SIZE));
    let mut exported = 0;
    while let Some(page) = pages.next().await {
        exported += write_records(&mut sink, &page)?;
    }
    sink.flush()?;

    // Records went to stdout; keep it clean
    let Some(path) = path else {
        return Ok(());
    };
    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "collection": source.to_string(),
                    "exported": exported,
                    "path": path
                })
            );
        }
        OutputFormat::Quiet => println!("{}", exported),
        OutputFormat::Human => output.success(&format!(
            "Exported {} record(s) from {} to {}",
            exported,
            source,
            path.display()
        )),
    }
    Ok(())
}

/// Parse JSON lines into records, skipping blank lines
fn parse_records(reader: impl BufRead) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = Record::from_json(&line)
            .with_context(|| format!("Line {}: not a valid record", index + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Write one record per line; returns how many were written
fn write_records(sink: &mut impl Write, records: &[Record]) -> Result<usize> {
    for record in records {
        writeln!(sink, "{}", record.to_json()?)?;
    }
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use hoard_core::storage::SimulatedHost;
    use hoard_core::Config;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_parse_records_skips_blank_lines() {
        let input = "{\"id\":\"a\",\"n\":1}\n\n   \n{\"id\":\"b\"}\n";
        let records = parse_records(input.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a");
        assert_eq!(records[1].id, "b");
    }

    #[test]
    fn test_parse_records_reports_line_number() {
        let input = "{\"id\":\"a\"}\nnot json\n";
        let err = parse_records(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("Line 2"));
    }

    #[test]
    fn test_write_records_one_per_line() {
        let mut buf = Vec::new();
        let written = write_records(
            &mut buf,
            &[Record::new("a").with("n", 1), Record::new("b")],
        )
        .unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(Record::from_json(lines[0]).unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_import_then_export() {
        let temp_dir = TempDir::new().unwrap();
        let mut engine = Engine::new(
            Config::for_data_dir(temp_dir.path().join("data")),
            Arc::new(SimulatedHost::at_percent(10)),
        );
        engine.start().await.unwrap();
        let output = Output::new(OutputFormat::Quiet);

        let input = temp_dir.path().join("in.jsonl");
        let lines: Vec<String> = (0..25)
            .map(|i| format!("{{\"id\":\"rec-{:02}\",\"n\":{}}}", i, i))
            .collect();
        std::fs::write(&input, lines.join("\n")).unwrap();

        import(&engine, "data".into(), input, Some(10), &output)
            .await
            .unwrap();
        assert_eq!(engine.count(Collection::Data).await.unwrap(), 25);

        let exported = temp_dir.path().join("out.jsonl");
        export(&engine, "data".into(), Some(7), Some(exported.clone()), &output)
            .await
            .unwrap();
        let text = std::fs::read_to_string(&exported).unwrap();
        assert_eq!(text.lines().collect::<Vec<_>>(), lines);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Engine::new(
            Config::for_data_dir(temp_dir.path()),
            Arc::new(SimulatedHost::at_percent(10)),
        );
        let output = Output::new(OutputFormat::Quiet);

        let err = export(&engine, "metadata".into(), None, None, &output)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("metadata"));
    }
}
