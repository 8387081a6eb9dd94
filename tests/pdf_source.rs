//! Loading PDFs and pulling their embedded images.

mod common;

use common::{build_document, build_pdf, gray_image_stream, qr_image, save};
use fax::encoder::Encoder;
use fax::{Color, VecWriter};
use image::{GrayImage, Luma};
use lopdf::{dictionary, EncryptionState, EncryptionVersion, Object, Permissions, Stream};
use ticket_barcodes::{
    BarcodeFormat, DetectError, DetectOptions, Detector, PageSource, PdfDocument, RxingDecoder, SourceError,
};

fn checkerboard(size: u32) -> GrayImage {
    GrayImage::from_fn(size, size, |x, y| Luma([if (x / 4 + y / 4) % 2 == 0 { 0 } else { 255 }]))
}

/// Group 4 fax image XObject; pixels darker than mid-gray are black
fn ccitt_image_stream(img: &GrayImage) -> Stream {
    let width = img.width() as u16;
    let mut encoder = Encoder::new(VecWriter::new());
    for row in img.rows() {
        encoder
            .encode_line(row.map(|p| if p.0[0] < 128 { Color::Black } else { Color::White }), width)
            .unwrap();
    }
    let data = encoder.finish().unwrap().finish();
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => img.width() as i64,
            "Height" => img.height() as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 1,
            "Filter" => "CCITTFaxDecode",
            "DecodeParms" => dictionary! {
                "K" => -1,
                "Columns" => img.width() as i64,
                "Rows" => img.height() as i64,
            },
        },
        data,
    )
}

fn jbig2_image_stream(side: i64) -> Stream {
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => side,
            "Height" => side,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 1,
            "Filter" => "JBIG2Decode",
        },
        vec![0; 32],
    )
}

#[test]
fn load_validates_documents() {
    assert!(matches!(PdfDocument::load(b""), Err(DetectError::Empty)));
    assert!(matches!(PdfDocument::load(b"garbage, not a pdf"), Err(DetectError::Load(_))));

    let pdf = build_pdf(&[vec![], vec![], vec![]]);
    let doc = PdfDocument::load(&pdf).unwrap();
    assert_eq!(doc.page_count(), 3);
}

#[test]
fn document_without_pages_is_rejected() {
    let pdf = build_pdf(&[]);
    assert!(matches!(PdfDocument::load(&pdf), Err(DetectError::NoPages)));
}

#[test]
fn encrypted_document_is_rejected() {
    let mut doc = build_document(&[vec![gray_image_stream(&checkerboard(64))]]);
    let file_id = Object::string_literal("ticket-0000000001");
    doc.trailer.set("ID", Object::Array(vec![file_id.clone(), file_id]));
    let version = EncryptionVersion::V2 {
        document: &doc,
        owner_password: "owner",
        user_password: "",
        key_length: 40,
        permissions: Permissions::all(),
    };
    let state = EncryptionState::try_from(version).unwrap();
    doc.encrypt(&state).unwrap();
    let pdf = save(doc);

    assert!(matches!(PdfDocument::load(&pdf), Err(DetectError::Encrypted)));
    assert!(matches!(
        ticket_barcodes::detect(&pdf, "locked.pdf", &DetectOptions::default()),
        Err(DetectError::Encrypted)
    ));
}

#[test]
fn extracts_flate_gray_images_per_page() {
    let img = checkerboard(64);
    let pdf = build_pdf(&[vec![gray_image_stream(&img)], vec![]]);
    let doc = PdfDocument::load(&pdf).unwrap();

    let first = doc.embedded_images(0);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].to_luma8(), img);

    assert!(doc.embedded_images(1).is_empty());
    assert!(doc.embedded_images(7).is_empty());
}

#[test]
fn skips_images_below_the_minimum_side() {
    let pdf = build_pdf(&[vec![gray_image_stream(&checkerboard(8))]]);
    let doc = PdfDocument::load(&pdf).unwrap().with_min_image_side(16);
    assert!(doc.embedded_images(0).is_empty());
}

#[test]
fn rasterize_without_backend_is_unavailable() {
    let pdf = build_pdf(&[vec![]]);
    let doc = PdfDocument::load(&pdf).unwrap();
    assert!(matches!(doc.rasterize(0, 400), Err(SourceError::Unavailable(_))));
    assert_eq!(doc.rasterize(3, 400).unwrap_err(), SourceError::PageOutOfRange(3));
}

#[test]
fn decodes_group4_fax_images() {
    let img = checkerboard(64);
    let pdf = build_pdf(&[vec![ccitt_image_stream(&img)]]);
    let doc = PdfDocument::load(&pdf).unwrap();

    let images = doc.embedded_images(0);
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].to_luma8(), img);
    assert_eq!(doc.unreadable_images(0), 0);
}

#[test]
fn finds_a_qr_code_in_a_fax_image() {
    let pdf = build_pdf(&[vec![ccitt_image_stream(&qr_image("SCAN-7731"))]]);
    let doc = PdfDocument::load(&pdf).unwrap();
    let decoder = RxingDecoder::default();
    let result = Detector::new(&doc, &decoder, DetectOptions::default()).detect("scan.pdf");

    assert_eq!(result.barcodes.len(), 1);
    assert_eq!(result.barcodes[0].format, BarcodeFormat::QrCode);
    assert_eq!(result.barcodes[0].raw_bytes.as_ref(), b"SCAN-7731");
}

#[test]
fn jbig2_images_are_reported_when_rendering_is_unavailable() {
    let pdf = build_pdf(&[vec![jbig2_image_stream(64)]]);
    let doc = PdfDocument::load(&pdf).unwrap();
    assert!(doc.embedded_images(0).is_empty());
    assert_eq!(doc.unreadable_images(0), 1);

    let decoder = RxingDecoder::default();
    let result = Detector::new(&doc, &decoder, DetectOptions::default()).detect("scan.pdf");
    assert!(result.is_empty());
    assert!(
        result.warnings.iter().any(|w| w.starts_with("Page 1: 1 image(s) use JBIG2")),
        "{:?}",
        result.warnings
    );
}
