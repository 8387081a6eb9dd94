//! PDF and symbol builders shared by the integration tests.

#![allow(dead_code)]

use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::{GrayImage, Luma};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, Stream};
use rxing::{MultiFormatWriter, Writer};
use std::io::Write;

/// QR symbol with 4-pixel modules and a white quiet zone
pub fn qr_image(text: &str) -> GrayImage {
    let matrix = MultiFormatWriter::default()
        .encode(text, &rxing::BarcodeFormat::QR_CODE, 0, 0)
        .expect("encode QR");
    let module = 4;
    let margin = 8 * module;
    let mut img = GrayImage::from_pixel(
        matrix.width() * module + 2 * margin,
        matrix.height() * module + 2 * margin,
        Luma([255]),
    );
    for y in 0..matrix.height() {
        for x in 0..matrix.width() {
            if matrix.get(x, y) {
                for dy in 0..module {
                    for dx in 0..module {
                        img.put_pixel(margin + x * module + dx, margin + y * module + dy, Luma([0]));
                    }
                }
            }
        }
    }
    img
}

/// Flate-compressed 8-bit DeviceGray image XObject
pub fn gray_image_stream(img: &GrayImage) -> Stream {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(img.as_raw()).unwrap();
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => img.width() as i64,
            "Height" => img.height() as i64,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
            "Filter" => "FlateDecode",
        },
        encoder.finish().unwrap(),
    )
}

/// A page holding one QR symbol
pub fn qr_page(text: &str) -> Vec<Stream> {
    vec![gray_image_stream(&qr_image(text))]
}

/// Document whose pages each hold the given image XObjects, stacked from the bottom left
pub fn build_document(pages: &[Vec<Stream>]) -> Document {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::new();

    for images in pages {
        let mut xobjects = Dictionary::new();
        let mut operations = Vec::new();
        for (i, image) in images.iter().enumerate() {
            let name = format!("Im{}", i);
            let image_id = doc.add_object(image.clone());
            xobjects.set(name.as_bytes().to_vec(), image_id);
            operations.push(Operation::new("q", vec![]));
            operations.push(Operation::new(
                "cm",
                vec![200.into(), 0.into(), 0.into(), 200.into(), 50.into(), (50 + 250 * i as i64).into()],
            ));
            operations.push(Operation::new("Do", vec![Object::Name(name.into_bytes())]));
            operations.push(Operation::new("Q", vec![]));
        }
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "XObject" => xobjects },
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc
}

pub fn save(mut doc: Document) -> Vec<u8> {
    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

pub fn build_pdf(pages: &[Vec<Stream>]) -> Vec<u8> {
    save(build_document(pages))
}
