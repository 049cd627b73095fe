//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde_json::{Map, Value as Json};

use tabstore_core::{Cell, Descriptor, Row};

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

    /// Print a list of bucket names
    pub fn print_buckets(&self, buckets: &[String]) {
        match self.format {
            OutputFormat::Human => {
                if buckets.is_empty() {
                    println!("No buckets found.");
                    return;
                }
                for bucket in buckets {
                    println!("{}", bucket);
                }
                println!("\n{} bucket(s)", buckets.len());
            }
            OutputFormat::Json => {
                println!("{}", Json::from(buckets.to_vec()));
            }
            OutputFormat::Quiet => {
                for bucket in buckets {
                    println!("{}", bucket);
                }
            }
        }
    }

    /// Print a schema descriptor
    pub fn print_descriptor(&self, bucket: &str, descriptor: &Descriptor) {
        match self.format {
            OutputFormat::Human => {
                println!("Bucket: {}", bucket);
                println!();
                for field in &descriptor.fields {
                    match field.format {
                        Some(ref format) => {
                            println!("  {:<24} {} ({})", field.name, field.field_type, format)
                        }
                        None => println!("  {:<24} {}", field.name, field.field_type),
                    }
                }
                if let Some(ref key) = descriptor.primary_key {
                    println!();
                    println!("Primary key: {}", key.names().join(", "));
                }
            }
            OutputFormat::Json => match serde_json::to_string_pretty(descriptor) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("Failed to serialize descriptor: {}", e),
            },
            OutputFormat::Quiet => {
                for name in descriptor.field_names() {
                    println!("{}", name);
                }
            }
        }
    }

    /// Print rows in schema field order
    pub fn print_rows(&self, descriptor: &Descriptor, rows: &[Row]) {
        let names = descriptor.field_names();
        match self.format {
            OutputFormat::Human => {
                if rows.is_empty() {
                    println!("No rows found.");
                    return;
                }
                println!("{}", names.join(" | "));
                for row in rows {
                    let cells: Vec<String> = names
                        .iter()
                        .map(|name| truncate(&display_cell(row.get(*name)), 30))
                        .collect();
                    println!("{}", cells.join(" | "));
                }
                println!("\n{} row(s)", rows.len());
            }
            OutputFormat::Json => {
                let json_rows: Vec<Json> = rows
                    .iter()
                    .map(|row| {
                        let map: Map<String, Json> = names
                            .iter()
                            .map(|name| {
                                let value = row.get(*name).map(Cell::to_json).unwrap_or(Json::Null);
                                (name.to_string(), value)
                            })
                            .collect();
                        Json::Object(map)
                    })
                    .collect();
                println!("{}", Json::Array(json_rows));
            }
            OutputFormat::Quiet => {
                println!("{}", rows.len());
            }
        }
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

/// Human form of a cell; nulls print as empty
fn display_cell(cell: Option<&Cell>) -> String {
    match cell.map(Cell::to_json) {
        None | Some(Json::Null) => String::new(),
        Some(Json::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
