//! Row command handlers

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::Value as Json;

use tabstore_core::mapper;
use tabstore_core::{Descriptor, Storage, Transport};

use crate::output::Output;

/// Read all rows of a bucket
pub fn read<T: Transport>(storage: &mut Storage<T>, bucket: &str, output: &Output) -> Result<()> {
    let rows = storage
        .iter(bucket)
        .with_context(|| format!("Failed to open bucket: {}", bucket))?;
    let descriptor = rows.descriptor().clone();
    let rows = rows
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read rows from {}", bucket))?;

    output.print_rows(&descriptor, &rows);
    Ok(())
}

/// Write rows from a JSON file
///
/// The file holds an array of rows, each either positional (an array in
/// schema field order) or keyed (an object by field name).
pub fn write<T: Transport>(
    storage: &mut Storage<T>,
    bucket: &str,
    file: &Path,
    method: &str,
    dry_run: bool,
    output: &Output,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read rows file: {:?}", file))?;
    let value: Json = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse rows file: {:?}", file))?;

    let descriptor = storage
        .describe(bucket, None)
        .with_context(|| format!("Failed to describe bucket: {}", bucket))?;
    let rows = parse_rows(value, &descriptor)?;

    let prepared = storage
        .prepare_write(bucket, rows)
        .with_context(|| format!("Failed to prepare rows for {}", bucket))?;
    let count = prepared.len();

    if dry_run {
        if !output.is_quiet() {
            output.message(&format!(
                "Would {} {} row(s) into {}",
                method, count, bucket
            ));
        }
        return Ok(());
    }

    storage
        .commit(prepared, method)
        .with_context(|| format!("Failed to write rows to {}", bucket))?;

    output.success(&format!("Wrote {} row(s) to {}", count, bucket));
    Ok(())
}

/// Turn a JSON array of rows into positional rows
fn parse_rows(value: Json, descriptor: &Descriptor) -> Result<Vec<Vec<Json>>> {
    let Json::Array(items) = value else {
        bail!("Rows file must hold a JSON array of rows");
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Json::Array(cells) => Ok(cells),
            Json::Object(map) => Ok(mapper::keyed_to_positional(&map, descriptor)),
            other => bail!("Row {} is neither an array nor an object: {}", i + 1, other),
        })
        .collect()
}
