//! Bucket command handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use tabstore_core::{Descriptor, Selection, Storage, Transport};

use crate::output::Output;

/// List all buckets
pub fn list<T: Transport>(storage: &mut Storage<T>, output: &Output) -> Result<()> {
    let buckets = storage.buckets().context("Failed to list buckets")?;
    output.print_buckets(&buckets);
    Ok(())
}

/// Show the schema descriptor of a bucket
pub fn describe<T: Transport>(
    storage: &mut Storage<T>,
    bucket: &str,
    output: &Output,
) -> Result<()> {
    let descriptor = storage
        .describe(bucket, None)
        .with_context(|| format!("Failed to describe bucket: {}", bucket))?;
    output.print_descriptor(bucket, &descriptor);
    Ok(())
}

/// Create buckets from descriptor files, paired by position
pub fn create<T: Transport>(
    storage: &mut Storage<T>,
    buckets: Vec<String>,
    schemas: &[PathBuf],
    force: bool,
    output: &Output,
) -> Result<()> {
    if buckets.len() != schemas.len() {
        bail!(
            "Got {} bucket(s) but {} schema file(s); pass one --schema per bucket",
            buckets.len(),
            schemas.len()
        );
    }

    let descriptors = schemas
        .iter()
        .map(|path| load_descriptor(path))
        .collect::<Result<Vec<_>>>()?;

    let names = buckets.join(", ");
    storage
        .create(buckets, descriptors, force)
        .context("Failed to create buckets")?;

    output.success(&format!("Created {}", names));
    Ok(())
}

/// Delete buckets; an empty list means every bucket
pub fn delete<T: Transport>(
    storage: &mut Storage<T>,
    buckets: Vec<String>,
    all: bool,
    ignore: bool,
    output: &Output,
) -> Result<()> {
    let selection = match (buckets.is_empty(), all) {
        (true, true) => None,
        (true, false) => bail!("No buckets given; pass --all to delete every bucket"),
        (false, true) => bail!("--all cannot be combined with bucket names"),
        (false, false) => Some(Selection::from(buckets.clone())),
    };

    storage
        .delete(selection, ignore)
        .context("Failed to delete buckets")?;

    if buckets.is_empty() {
        output.success("Deleted all buckets");
    } else {
        output.success(&format!("Deleted {}", buckets.join(", ")));
    }
    Ok(())
}

/// Read a descriptor from a JSON file
fn load_descriptor(path: &Path) -> Result<Descriptor> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file: {:?}", path))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse schema file: {:?}", path))?;
    let descriptor = Descriptor::from_json(value)
        .with_context(|| format!("Invalid schema in {:?}", path))?;
    Ok(descriptor)
}
