//! Ticket Barcode CLI
//!
//! Command-line interface for finding barcodes in ticket PDFs.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use ticket_barcodes::{detect, DetectOptions, DetectionResult};

/// Find every barcode in a ticket or pass PDF
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input PDF file path
    #[arg(short, long)]
    input: PathBuf,

    /// Print the result as JSON
    #[arg(short, long)]
    json: bool,

    /// Wall-clock budget for the whole document, in seconds (0 disables it)
    #[arg(short, long, default_value = "30")]
    timeout_secs: u64,

    /// Worker threads (defaults to available cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run every format group on every page and arbitrate Aztec vs QR afterwards
    #[arg(long)]
    scan_all_dense: bool,

    /// Report a payload once per page instead of merging repeats across pages
    #[arg(long)]
    no_merge: bool,

    /// Directory containing the Pdfium library
    #[arg(long)]
    pdfium_lib: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let options = DetectOptions {
        timeout: (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs)),
        workers: args.workers,
        scan_all_dense_groups: args.scan_all_dense,
        merge_duplicate_payloads: !args.no_merge,
        pdfium_library_dir: args.pdfium_lib,
        ..DetectOptions::default()
    };

    let pdf_bytes =
        std::fs::read(&args.input).with_context(|| format!("Failed to read {:?}", args.input))?;
    let filename = args
        .input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let result = detect(&pdf_bytes, &filename, &options)
        .with_context(|| format!("Failed to scan {:?}", args.input))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&filename, &result);
    }

    Ok(())
}

fn print_summary(filename: &str, result: &DetectionResult) {
    println!("Ticket Barcode Scan: {}", filename);
    println!("==================");

    for (i, barcode) in result.barcodes.iter().enumerate() {
        let origin = match barcode.dpi {
            Some(dpi) => format!("rendered at {} DPI", dpi),
            None => "embedded image".to_string(),
        };
        let pages: Vec<String> = barcode.pages_found.iter().map(|p| (p + 1).to_string()).collect();
        println!(
            "\n#{} {} on page {} ({})",
            i + 1,
            barcode.format,
            pages.join(", "),
            origin
        );
        println!("   Encoding: {:?}", barcode.encoding_used);
        println!("   Payload:  {:?}", barcode.text);
    }

    for warning in &result.warnings {
        println!("\nWarning: {}", warning);
    }

    println!("\nDone! Found {} barcode(s)", result.barcodes.len());
}
