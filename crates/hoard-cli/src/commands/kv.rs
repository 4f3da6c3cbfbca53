//! Key-value command handlers

use anyhow::{bail, Context, Result};
use serde_json::Value;

use hoard_core::Engine;

use crate::output::{Output, OutputFormat};

/// Print the value stored under `key`
pub async fn get(engine: &Engine, key: String, output: &Output) -> Result<()> {
    let Some(value) = engine.kv().get::<Value>(&key).await? else {
        bail!("Key not found: {}", key);
    };

    match output.format {
        OutputFormat::Json => output.json(&value)?,
        // Bare strings print without quotes
        OutputFormat::Human | OutputFormat::Quiet => match value {
            Value::String(s) => println!("{}", s),
            other => println!("{}", serde_json::to_string_pretty(&other)?),
        },
    }
    Ok(())
}

/// Store a JSON value under `key`
pub async fn set(engine: &Engine, key: String, value: String, output: &Output) -> Result<()> {
    let parsed: Value = serde_json::from_str(&value).with_context(|| {
        format!(
            "Value is not valid JSON: {}\nQuote strings, e.g. '\"{}\"'",
            value, value
        )
    })?;

    engine
        .kv()
        .set(&key, &parsed)
        .await
        .with_context(|| format!("Failed to set '{}'", key))?;

    output.success(&format!("Set {}", key));
    Ok(())
}

/// Remove `key`
pub async fn remove(engine: &Engine, key: String, output: &Output) -> Result<()> {
    if engine.kv().remove(&key).await? {
        output.success(&format!("Removed {}", key));
    } else {
        output.message(&format!("Key not found: {}", key));
    }
    Ok(())
}
