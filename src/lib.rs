//! Ticket PDF Barcode Detection
//!
//! Finds every machine-readable barcode in a ticket or pass PDF and returns one canonical
//! record per symbol. Shared between the CLI and WASM targets.
//!
//! The search walks three format groups in a fixed order (Aztec, then QR, then everything
//! else). For each group it tries images embedded in the page first, then the rasterized page
//! at 400 DPI, then at 600 DPI with the decoder's try-harder mode. The first attempt that
//! produces a hit ends the search for that page.

#[cfg(target_arch = "wasm32")]
pub mod wasm;

pub mod controller;
pub mod decoder;
pub mod payload;
pub mod preprocess;
pub mod resolve;
pub mod select;
pub mod source;

use bytes::Bytes;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

pub use controller::{CancelFlag, Detector};
pub use decoder::{DecodedSymbol, RxingDecoder, SymbolDecoder};
pub use payload::{normalize, Encoding};
pub use source::{PageSource, PdfDocument, Rasterizer, SourceError};

/// Barcode symbologies the engine reports.
///
/// Anything else the decoder returns is dropped at the adapter boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BarcodeFormat {
    Aztec,
    QrCode,
    DataMatrix,
    Pdf417,
    Code128,
    Code39,
    Code93,
    Ean8,
    Ean13,
    UpcA,
    UpcE,
    Codabar,
    Itf,
}

impl BarcodeFormat {
    pub const ALL: [BarcodeFormat; 13] = [
        BarcodeFormat::Aztec,
        BarcodeFormat::QrCode,
        BarcodeFormat::DataMatrix,
        BarcodeFormat::Pdf417,
        BarcodeFormat::Code128,
        BarcodeFormat::Code39,
        BarcodeFormat::Code93,
        BarcodeFormat::Ean8,
        BarcodeFormat::Ean13,
        BarcodeFormat::UpcA,
        BarcodeFormat::UpcE,
        BarcodeFormat::Codabar,
        BarcodeFormat::Itf,
    ];

    /// Single-row (1-D) symbologies
    pub fn is_linear(self) -> bool {
        matches!(
            self,
            BarcodeFormat::Code128
                | BarcodeFormat::Code39
                | BarcodeFormat::Code93
                | BarcodeFormat::Ean8
                | BarcodeFormat::Ean13
                | BarcodeFormat::UpcA
                | BarcodeFormat::UpcE
                | BarcodeFormat::Codabar
                | BarcodeFormat::Itf
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BarcodeFormat::Aztec => "Aztec",
            BarcodeFormat::QrCode => "QR",
            BarcodeFormat::DataMatrix => "DataMatrix",
            BarcodeFormat::Pdf417 => "PDF417",
            BarcodeFormat::Code128 => "Code128",
            BarcodeFormat::Code39 => "Code39",
            BarcodeFormat::Code93 => "Code93",
            BarcodeFormat::Ean8 => "EAN8",
            BarcodeFormat::Ean13 => "EAN13",
            BarcodeFormat::UpcA => "UPC-A",
            BarcodeFormat::UpcE => "UPC-E",
            BarcodeFormat::Codabar => "Codabar",
            BarcodeFormat::Itf => "ITF",
        }
    }

    /// Wallet pass barcode format for this symbology.
    ///
    /// Wallet passes only carry QR, PDF417, Aztec and Code128; other linear formats are
    /// re-encoded as Code128. DataMatrix has no equivalent.
    pub fn wallet_format(self) -> Option<WalletFormat> {
        match self {
            BarcodeFormat::Aztec => Some(WalletFormat::Aztec),
            BarcodeFormat::QrCode => Some(WalletFormat::Qr),
            BarcodeFormat::Pdf417 => Some(WalletFormat::Pdf417),
            BarcodeFormat::DataMatrix => None,
            _ => Some(WalletFormat::Code128),
        }
    }
}

impl std::fmt::Display for BarcodeFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Barcode formats understood by wallet passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WalletFormat {
    #[serde(rename = "PKBarcodeFormatQR")]
    Qr,
    #[serde(rename = "PKBarcodeFormatPDF417")]
    Pdf417,
    #[serde(rename = "PKBarcodeFormatAztec")]
    Aztec,
    #[serde(rename = "PKBarcodeFormatCode128")]
    Code128,
}

/// A named set of formats decoded together in one detection pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatGroup {
    pub name: &'static str,
    pub formats: &'static [BarcodeFormat],
}

impl FormatGroup {
    pub fn contains(&self, format: BarcodeFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// Detection passes in priority order.
///
/// Ticket-oriented Aztec beats general purpose QR, and any 2-D code beats 1-D codes.
pub const FORMAT_GROUPS: [FormatGroup; 3] = [
    FormatGroup {
        name: "aztec",
        formats: &[BarcodeFormat::Aztec],
    },
    FormatGroup {
        name: "qr",
        formats: &[BarcodeFormat::QrCode],
    },
    FormatGroup {
        name: "other",
        formats: &[
            BarcodeFormat::DataMatrix,
            BarcodeFormat::Pdf417,
            BarcodeFormat::Code128,
            BarcodeFormat::Code39,
            BarcodeFormat::Code93,
            BarcodeFormat::Ean8,
            BarcodeFormat::Ean13,
            BarcodeFormat::UpcA,
            BarcodeFormat::UpcE,
            BarcodeFormat::Codabar,
            BarcodeFormat::Itf,
        ],
    },
];

/// Where the bitmap a symbol was found on came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    EmbeddedImage,
    RasterizedPage,
}

/// Axis-aligned box in the pixel space of the bitmap the symbol was measured on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    /// Area shared with `other`
    pub fn intersection_area(&self, other: &BoundingBox) -> u64 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x1 <= x0 || y1 <= y0 {
            return 0;
        }
        (x1 - x0) as u64 * (y1 - y0) as u64
    }
}

/// One detected barcode symbol
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarcodeCandidate {
    /// Zero-based page the symbol was found on
    pub page_index: usize,
    pub format: BarcodeFormat,
    /// Exact decoder output; authoritative over `text`
    #[serde(serialize_with = "payload::serialize_base64")]
    pub raw_bytes: Bytes,
    pub text: String,
    pub encoding_used: Encoding,
    pub bbox: BoundingBox,
    /// Decoder-supplied score, when the decoder exposes one
    pub confidence: Option<f32>,
    /// Distance from the bbox center to the image center, in pixels
    pub center_distance: f64,
    pub source: ImageSource,
    /// Rasterization resolution (rasterized pages only)
    pub dpi: Option<u32>,
    /// Every page this payload was seen on, when duplicates were merged
    pub pages_found: Vec<usize>,
    /// Which bitmap within the attempt the bbox belongs to
    #[serde(skip)]
    pub(crate) image_ordinal: usize,
}

impl BarcodeCandidate {
    pub fn area(&self) -> u64 {
        self.bbox.area()
    }

    /// Whether both bounding boxes were measured on the same bitmap
    pub(crate) fn same_bitmap(&self, other: &BarcodeCandidate) -> bool {
        self.page_index == other.page_index
            && self.source == other.source
            && self.dpi == other.dpi
            && self.image_ordinal == other.image_ordinal
    }
}

/// Per-document result: one entry per logical ticket, ordered by page
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionResult {
    pub barcodes: Vec<BarcodeCandidate>,
    /// Non-fatal conditions worth surfacing to the caller
    pub warnings: Vec<String>,
}

impl DetectionResult {
    pub fn is_empty(&self) -> bool {
        self.barcodes.is_empty()
    }
}

/// Options for barcode detection
#[derive(Debug, Clone)]
pub struct DetectOptions {
    /// First rasterization tier
    pub first_dpi: u32,
    /// Second rasterization tier, decoded in try-harder mode
    pub escalation_dpi: u32,
    /// Wall-clock budget for the whole document
    pub timeout: Option<Duration>,
    /// Worker threads for page-level parallelism (defaults to available cores)
    pub workers: Option<usize>,
    /// Run every format group on every page and arbitrate Aztec vs QR afterwards
    pub scan_all_dense_groups: bool,
    /// Merge identical payloads found on several pages into one entry
    pub merge_duplicate_payloads: bool,
    /// Embedded images with a smaller side (in pixels) are ignored
    pub min_image_side: u32,
    /// Directory holding libpdfium (native builds only)
    pub pdfium_library_dir: Option<PathBuf>,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            first_dpi: 400,
            escalation_dpi: 600,
            timeout: Some(Duration::from_secs(30)),
            workers: None,
            scan_all_dense_groups: false,
            merge_duplicate_payloads: true,
            min_image_side: 16,
            pdfium_library_dir: None,
        }
    }
}

/// Document-level failure; the only way `detect` itself fails
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("PDF file is empty")]
    Empty,
    #[error("Failed to load PDF: {0}")]
    Load(String),
    #[error("PDF has no pages")]
    NoPages,
    #[error("Encrypted PDFs are not supported")]
    Encrypted,
}

/// Detect every barcode in a PDF.
///
/// `filename` is only used as a hint when Aztec and QR candidates compete on one page.
/// Finding nothing is not an error: the result is empty and carries a warning.
pub fn detect(
    pdf_bytes: &[u8],
    filename: &str,
    options: &DetectOptions,
) -> Result<DetectionResult, DetectError> {
    let document = PdfDocument::load(pdf_bytes)?
        .with_min_image_side(options.min_image_side)
        .with_rasterizer(source::default_rasterizer(options));
    let decoder = RxingDecoder::default();
    let detector = Detector::new(&document, &decoder, options.clone());
    Ok(detector.detect(filename))
}
