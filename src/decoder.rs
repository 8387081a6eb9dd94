//! Symbol decoding.
//!
//! Wraps the rxing decoder behind [`SymbolDecoder`] and normalizes its results into
//! [`DecodedSymbol`], so nothing downstream depends on decoder-specific result shapes.

use crate::{BarcodeFormat, Encoding};
use image::GrayImage;
use rxing::common::HybridBinarizer;
use rxing::multi::{GenericMultipleBarcodeReader, MultipleBarcodeReader};
use rxing::{
    BinaryBitmap, DecodeHintValue, DecodeHints, Luma8LuminanceSource, MultiFormatReader,
    RXingResult, RXingResultMetadataType, RXingResultMetadataValue,
};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};

/// One symbol as reported by a decoder
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSymbol {
    pub format: BarcodeFormat,
    pub raw_bytes: Vec<u8>,
    /// Corner or finder points in bitmap pixel space
    pub points: Vec<(f32, f32)>,
    pub confidence: Option<f32>,
}

/// Decoding capability.
///
/// Implementations only report symbols whose format is in `allowed`, and never fail: a bitmap
/// that cannot be decoded yields no symbols.
pub trait SymbolDecoder: Sync {
    fn decode(&self, bitmap: &GrayImage, allowed: &[BarcodeFormat], try_harder: bool) -> Vec<DecodedSymbol>;
}

/// Decoder backed by rxing's multi-format, multi-symbol reader
#[derive(Debug, Clone, Default)]
pub struct RxingDecoder;

impl SymbolDecoder for RxingDecoder {
    fn decode(&self, bitmap: &GrayImage, allowed: &[BarcodeFormat], try_harder: bool) -> Vec<DecodedSymbol> {
        if allowed.is_empty() || bitmap.width() == 0 || bitmap.height() == 0 {
            return Vec::new();
        }

        // rxing panics on some malformed inputs; treat that like any other decode failure
        let results = match panic::catch_unwind(AssertUnwindSafe(|| decode_multiple(bitmap, allowed, try_harder))) {
            Ok(Ok(results)) => results,
            Ok(Err(err)) => {
                log::trace!("[Decode] no symbols ({:?})", err);
                return Vec::new();
            }
            Err(_) => {
                log::warn!(
                    "[Decode] decoder panicked on {}x{} bitmap; treating as no result",
                    bitmap.width(),
                    bitmap.height()
                );
                return Vec::new();
            }
        };

        results
            .iter()
            .filter_map(|result| {
                let Some(format) = format_from_rxing(result.getBarcodeFormat()) else {
                    log::debug!("[Decode] dropping unsupported format {:?}", result.getBarcodeFormat());
                    return None;
                };
                if !allowed.contains(&format) {
                    log::debug!("[Decode] dropping {} outside the requested formats", format);
                    return None;
                }
                Some(DecodedSymbol {
                    format,
                    raw_bytes: payload_bytes(result),
                    points: result.getPoints().iter().map(|p| (p.x, p.y)).collect(),
                    confidence: None,
                })
            })
            .collect()
    }
}

fn decode_multiple(
    bitmap: &GrayImage,
    allowed: &[BarcodeFormat],
    try_harder: bool,
) -> Result<Vec<RXingResult>, rxing::Exceptions> {
    let formats: HashSet<rxing::BarcodeFormat> = allowed.iter().map(|f| format_to_rxing(*f)).collect();
    // Latin-1 maps every byte to one char, so the payload can be read back from the text
    let mut hints = DecodeHints::default()
        .with(DecodeHintValue::PossibleFormats(formats))
        .with(DecodeHintValue::CharacterSet(PAYLOAD_CHARSET.to_string()));
    if try_harder {
        hints = hints
            .with(DecodeHintValue::TryHarder(true))
            .with(DecodeHintValue::AlsoInverted(true));
    }

    let (width, height) = bitmap.dimensions();
    let source = Luma8LuminanceSource::new(bitmap.as_raw().clone(), width, height);
    let mut binary = BinaryBitmap::new(HybridBinarizer::new(source));
    let mut reader = GenericMultipleBarcodeReader::new(MultiFormatReader::default());
    reader.decode_multiple_with_hints(&mut binary, &hints)
}

const PAYLOAD_CHARSET: &str = "ISO-8859-1";

/// Payload bytes of a result.
///
/// rxing's raw bytes are the symbol codewords, not the payload. Byte segments are used only
/// when they spell out the whole text (a QR with a UTF-8 ECI, say); mixed-mode symbols leave
/// numeric and alphanumeric segments out of them. Otherwise the Latin-1 text is mapped back
/// one char per byte, and text outside Latin-1 (set by an ECI) is kept as UTF-8.
fn payload_bytes(result: &RXingResult) -> Vec<u8> {
    let text = result.getText();
    if let Some(RXingResultMetadataValue::ByteSegments(segments)) =
        result.getRXingResultMetadata().get(&RXingResultMetadataType::BYTE_SEGMENTS)
    {
        let joined: Vec<u8> = segments.concat();
        if !joined.is_empty() && segments_spell_text(&joined, text) {
            return joined;
        }
    }
    Encoding::Latin1
        .encode(text)
        .unwrap_or_else(|| text.as_bytes().to_vec())
}

fn segments_spell_text(bytes: &[u8], text: &str) -> bool {
    std::str::from_utf8(bytes).is_ok_and(|utf8| utf8 == text)
        || Encoding::Latin1.encode(text).as_deref() == Some(bytes)
}

fn format_to_rxing(format: BarcodeFormat) -> rxing::BarcodeFormat {
    match format {
        BarcodeFormat::Aztec => rxing::BarcodeFormat::AZTEC,
        BarcodeFormat::QrCode => rxing::BarcodeFormat::QR_CODE,
        BarcodeFormat::DataMatrix => rxing::BarcodeFormat::DATA_MATRIX,
        BarcodeFormat::Pdf417 => rxing::BarcodeFormat::PDF_417,
        BarcodeFormat::Code128 => rxing::BarcodeFormat::CODE_128,
        BarcodeFormat::Code39 => rxing::BarcodeFormat::CODE_39,
        BarcodeFormat::Code93 => rxing::BarcodeFormat::CODE_93,
        BarcodeFormat::Ean8 => rxing::BarcodeFormat::EAN_8,
        BarcodeFormat::Ean13 => rxing::BarcodeFormat::EAN_13,
        BarcodeFormat::UpcA => rxing::BarcodeFormat::UPC_A,
        BarcodeFormat::UpcE => rxing::BarcodeFormat::UPC_E,
        BarcodeFormat::Codabar => rxing::BarcodeFormat::CODABAR,
        BarcodeFormat::Itf => rxing::BarcodeFormat::ITF,
    }
}

fn format_from_rxing(format: &rxing::BarcodeFormat) -> Option<BarcodeFormat> {
    let format = match format {
        rxing::BarcodeFormat::AZTEC => BarcodeFormat::Aztec,
        rxing::BarcodeFormat::QR_CODE => BarcodeFormat::QrCode,
        rxing::BarcodeFormat::DATA_MATRIX => BarcodeFormat::DataMatrix,
        rxing::BarcodeFormat::PDF_417 => BarcodeFormat::Pdf417,
        rxing::BarcodeFormat::CODE_128 => BarcodeFormat::Code128,
        rxing::BarcodeFormat::CODE_39 => BarcodeFormat::Code39,
        rxing::BarcodeFormat::CODE_93 => BarcodeFormat::Code93,
        rxing::BarcodeFormat::EAN_8 => BarcodeFormat::Ean8,
        rxing::BarcodeFormat::EAN_13 => BarcodeFormat::Ean13,
        rxing::BarcodeFormat::UPC_A => BarcodeFormat::UpcA,
        rxing::BarcodeFormat::UPC_E => BarcodeFormat::UpcE,
        rxing::BarcodeFormat::CODABAR => BarcodeFormat::Codabar,
        rxing::BarcodeFormat::ITF => BarcodeFormat::Itf,
        _ => return None,
    };
    Some(format)
}
