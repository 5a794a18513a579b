use std::path::Path;

use anyhow::Context;
use serde_json::{Map, Value};
use tracing::info;

/// Turn a flat JSON object into `--key value` pairs, in file order.
///
/// A missing file yields no arguments. String values are passed verbatim,
/// everything else as its JSON text.
pub fn load_child_arguments(path: &Path) -> anyhow::Result<Vec<String>> {
    if !path.exists() {
        info!(
            "No arguments file found at {}, using default arguments",
            path.display()
        );
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let entries: Map<String, Value> = serde_json::from_str(&data)
        .with_context(|| format!("parsing {} as a JSON object", path.display()))?;

    let args = to_arguments(&entries);
    info!("Loaded {} arguments from {}", entries.len(), path.display());
    Ok(args)
}

fn to_arguments(entries: &Map<String, Value>) -> Vec<String> {
    let mut args = Vec::with_capacity(entries.len() * 2);
    for (key, value) in entries {
        args.push(format!("--{key}"));
        args.push(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    args
}
