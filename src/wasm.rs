//! WebAssembly bindings for ticket barcode detection
//!
//! Browsers have no page rasterizer, so only images embedded in the PDF are searched.

use crate::{detect, DetectOptions};
use wasm_bindgen::prelude::*;

/// Initialize panic hook for better error messages in browser console
#[wasm_bindgen(start)]
pub fn init() {
    console_error_panic_hook::set_once();
}

/// Find every barcode in a PDF
///
/// # Arguments
/// * `pdf_bytes` - The input PDF file as a byte array
/// * `filename` - Original file name, used to break Aztec/QR ties
/// * `scan_all_dense` - Run every format group and arbitrate Aztec vs QR (default: false)
///
/// # Returns
/// The detection result as a JSON string (`raw_bytes` base64-encoded), or throws an error
#[wasm_bindgen]
pub fn detect_barcodes(
    pdf_bytes: &[u8],
    filename: Option<String>,
    scan_all_dense: Option<bool>,
) -> Result<String, JsError> {
    // No clock and no threads on wasm32-unknown-unknown
    let options = DetectOptions {
        timeout: None,
        workers: Some(1),
        scan_all_dense_groups: scan_all_dense.unwrap_or(false),
        ..DetectOptions::default()
    };

    let result = detect(pdf_bytes, filename.as_deref().unwrap_or(""), &options)
        .map_err(|e| JsError::new(&e.to_string()))?;

    serde_json::to_string(&result).map_err(|e| JsError::new(&e.to_string()))
}
