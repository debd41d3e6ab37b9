// src/local.rs

use crate::config::Config;
use crate::flatten::{cell_text, flatten};
use crate::llm_extract::{ExtractionClient, SUPPORTED_IMAGE_EXTENSIONS};
use clap::Args;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::info;

/// Extract one invoice image locally, without the HTTP server.
#[derive(Args)]
pub struct ExtractArgs {
    /// Invoice image (png, jpg, jpeg, gif, bmp, tiff)
    pub image: PathBuf,

    /// Append the flattened row to this CSV file
    #[arg(long)]
    pub csv: Option<PathBuf>,

    /// Print the nested result as pretty JSON instead of field rows
    #[arg(long)]
    pub json: bool,
}

pub async fn run(cfg: &Config, args: ExtractArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ext = args
        .image
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return Err(format!("Unsupported image type: {}", args.image.display()).into());
    }

    let client = ExtractionClient::from_config(&cfg.model);
    let data = client.extract_from_file(&args.image).await?;
    if data.is_empty() {
        println!("No data extracted");
        return Ok(());
    }

    let row = flatten(&data);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        for (field, value) in &row {
            let text = cell_text(value);
            if !text.is_empty() {
                println!("{field:<40} {text}");
            }
        }
        println!("Successfully extracted {} fields", row.len());
    }

    if let Some(csv_path) = &args.csv {
        let total = append_row(csv_path, &row)?;
        println!("Data appended to {} (total invoices saved: {total})", csv_path.display());
    }
    Ok(())
}

/// Append `row` to `path`, writing the header only when the file is new.
/// Returns the number of invoice rows now in the file.
pub fn append_row(path: &Path, row: &Map<String, Value>) -> Result<usize, Box<dyn std::error::Error>> {
    let exists = path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(file);

    if !exists {
        writer.write_record(row.keys())?;
    }
    writer.write_record(row.values().map(cell_text))?;
    writer.flush()?;

    let total = count_invoices(path)?;
    info!(path = %path.display(), total, "Invoice row appended");
    Ok(total)
}

pub fn count_invoices(path: &Path) -> Result<usize, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Ok(0);
    }
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    Ok(reader.records().filter(|r| r.is_ok()).count())
}
