//! Page image sources.
//!
//! Pulls raster images placed directly on a PDF page (cheap, no rendering) and renders whole
//! pages to bitmaps (slow, but also covers vector-drawn symbols).

use crate::{DetectError, DetectOptions};
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::HashSet;
use std::io::Read;

/// Page-level source failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    /// No rasterizer is configured, or its backend cannot be loaded
    #[error("page rendering unavailable: {0}")]
    Unavailable(String),
    #[error("page {0} does not exist")]
    PageOutOfRange(usize),
    #[error("failed to render page: {0}")]
    Render(String),
}

/// Document access needed by the detector.
///
/// Page indices are zero-based.
pub trait PageSource: Sync {
    fn page_count(&self) -> usize;

    /// Raster images placed on the page. A page without images yields an empty list.
    fn embedded_images(&self, page_index: usize) -> Vec<DynamicImage>;

    /// Render the full page at `dpi`
    fn rasterize(&self, page_index: usize, dpi: u32) -> Result<DynamicImage, SourceError>;

    /// Images on the page whose compression can only be read by rendering the page
    fn unreadable_images(&self, _page_index: usize) -> usize {
        0
    }
}

/// Renders PDF pages to bitmaps
pub trait Rasterizer: Send + Sync {
    fn render(&self, pdf: &[u8], page_index: usize, dpi: u32) -> Result<DynamicImage, SourceError>;
}

/// A loaded PDF
pub struct PdfDocument {
    doc: Document,
    bytes: Bytes,
    page_ids: Vec<ObjectId>,
    min_image_side: u32,
    rasterizer: Option<Box<dyn Rasterizer>>,
}

impl PdfDocument {
    /// Parse and validate PDF bytes.
    ///
    /// Empty, unparsable, page-less and encrypted documents are rejected.
    pub fn load(pdf_bytes: &[u8]) -> Result<Self, DetectError> {
        if pdf_bytes.is_empty() {
            return Err(DetectError::Empty);
        }

        let doc = Document::load_mem(pdf_bytes).map_err(|e| DetectError::Load(e.to_string()))?;

        // lopdf decrypts empty-user-password files on load and drops Encrypt from the trailer
        if doc.was_encrypted() || doc.trailer.get(b"Encrypt").is_ok() {
            return Err(DetectError::Encrypted);
        }

        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if page_ids.is_empty() {
            return Err(DetectError::NoPages);
        }

        Ok(Self {
            doc,
            bytes: Bytes::copy_from_slice(pdf_bytes),
            page_ids,
            min_image_side: DetectOptions::default().min_image_side,
            rasterizer: None,
        })
    }

    /// Ignore embedded images whose width or height is below `side` pixels
    pub fn with_min_image_side(mut self, side: u32) -> Self {
        self.min_image_side = side;
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Option<Box<dyn Rasterizer>>) -> Self {
        self.rasterizer = rasterizer;
        self
    }
}

impl PageSource for PdfDocument {
    fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    fn embedded_images(&self, page_index: usize) -> Vec<DynamicImage> {
        let Some(&page_id) = self.page_ids.get(page_index) else {
            return Vec::new();
        };

        let mut images = Vec::new();
        for image_id in collect_page_images(&self.doc, page_id) {
            let Ok(Object::Stream(stream)) = self.doc.get_object(image_id) else {
                continue;
            };
            match decode_image_xobject(&self.doc, stream) {
                Ok(img) if img.width() < self.min_image_side || img.height() < self.min_image_side => {
                    log::trace!("[Source] skipping {:?}: {}x{} is too small", image_id, img.width(), img.height());
                }
                Ok(img) => images.push(img),
                Err(e) => log::debug!("[Source] skipping image {:?}: {}", image_id, e),
            }
        }
        images
    }

    fn rasterize(&self, page_index: usize, dpi: u32) -> Result<DynamicImage, SourceError> {
        if page_index >= self.page_ids.len() {
            return Err(SourceError::PageOutOfRange(page_index));
        }
        match &self.rasterizer {
            Some(rasterizer) => rasterizer.render(&self.bytes, page_index, dpi),
            None => Err(SourceError::Unavailable("no rasterizer configured".to_string())),
        }
    }

    fn unreadable_images(&self, page_index: usize) -> usize {
        let Some(&page_id) = self.page_ids.get(page_index) else {
            return 0;
        };
        collect_page_images(&self.doc, page_id)
            .into_iter()
            .filter(|id| match self.doc.get_object(*id) {
                Ok(Object::Stream(stream)) => needs_rendering(stream),
                _ => false,
            })
            .count()
    }
}

/// Rasterizer for this build, if any
pub fn default_rasterizer(options: &DetectOptions) -> Option<Box<dyn Rasterizer>> {
    #[cfg(all(feature = "pdfium", not(target_arch = "wasm32")))]
    {
        Some(Box::new(pdfium::PdfiumRasterizer::new(options.pdfium_library_dir.clone())))
    }
    #[cfg(not(all(feature = "pdfium", not(target_arch = "wasm32"))))]
    {
        let _ = options;
        None
    }
}

#[cfg(all(feature = "pdfium", not(target_arch = "wasm32")))]
pub mod pdfium {
    use super::{Rasterizer, SourceError};
    use image::{DynamicImage, RgbaImage};
    use pdfium_render::prelude::{PdfRenderConfig, Pdfium};
    use std::path::PathBuf;
    use std::sync::{Mutex, OnceLock, PoisonError};

    /// Process-wide Pdfium instance.
    ///
    /// `Pdfium::new` runs FPDF_InitLibrary and dropping it runs FPDF_DestroyLibrary, neither of
    /// which may overlap with rendering on another thread. The instance is created once and
    /// never dropped.
    static PDFIUM: OnceLock<Pdfium> = OnceLock::new();
    static BINDING: Mutex<()> = Mutex::new(());
    /// Serializes FFI calls across worker threads
    static RENDERING: Mutex<()> = Mutex::new(());

    /// Renders pages with libpdfium.
    ///
    /// The library is bound on first use and shared by every rasterizer in the process, so the
    /// `library_dir` of the first rasterizer to render successfully wins.
    #[derive(Debug, Clone, Default)]
    pub struct PdfiumRasterizer {
        library_dir: Option<PathBuf>,
    }

    impl PdfiumRasterizer {
        /// `library_dir` overrides the default search (working directory, then system)
        pub fn new(library_dir: Option<PathBuf>) -> Self {
            Self { library_dir }
        }

        fn bind(&self) -> Result<Pdfium, SourceError> {
            let bindings = match &self.library_dir {
                Some(dir) => Pdfium::bind_to_library(&Pdfium::pdfium_platform_library_name_at_path(dir)),
                None => Pdfium::bind_to_library(&Pdfium::pdfium_platform_library_name_at_path("./"))
                    .or_else(|_| Pdfium::bind_to_system_library()),
            }
            .map_err(|e| SourceError::Unavailable(format!("failed to load Pdfium: {}", e)))?;
            log::info!("[Source] Pdfium bound");
            Ok(Pdfium::new(bindings))
        }
    }

    /// Initialize `cell` at most once. A failed `init` leaves it empty so a later call can retry.
    pub(crate) fn shared<T: Sync>(
        cell: &'static OnceLock<T>,
        guard: &Mutex<()>,
        init: impl FnOnce() -> Result<T, SourceError>,
    ) -> Result<&'static T, SourceError> {
        if let Some(value) = cell.get() {
            return Ok(value);
        }
        let _binding = guard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = cell.get() {
            return Ok(value);
        }
        let value = init()?;
        Ok(cell.get_or_init(|| value))
    }

    impl Rasterizer for PdfiumRasterizer {
        fn render(&self, pdf: &[u8], page_index: usize, dpi: u32) -> Result<DynamicImage, SourceError> {
            let pdfium = shared(&PDFIUM, &BINDING, || self.bind())?;
            let _rendering = RENDERING.lock().unwrap_or_else(PoisonError::into_inner);
            let document = pdfium
                .load_pdf_from_byte_slice(pdf, None)
                .map_err(|e| SourceError::Render(e.to_string()))?;
            let index = u16::try_from(page_index).map_err(|_| SourceError::PageOutOfRange(page_index))?;
            let page = document
                .pages()
                .get(index)
                .map_err(|_| SourceError::PageOutOfRange(page_index))?;

            let config = PdfRenderConfig::new().scale_page_by_factor(dpi as f32 / 72.0);
            let bitmap = page
                .render_with_config(&config)
                .map_err(|e| SourceError::Render(e.to_string()))?;

            let width = bitmap.width().max(0) as u32;
            let height = bitmap.height().max(0) as u32;
            let rgba = RgbaImage::from_raw(width, height, bitmap.as_rgba_bytes())
                .ok_or_else(|| SourceError::Render("rendered bitmap has unexpected size".to_string()))?;
            Ok(DynamicImage::ImageRgba8(rgba))
        }
    }

}

/// Filters no decoder here handles; such images are only seen when the page is rendered
const RENDER_ONLY_FILTERS: [&str; 2] = ["JBIG2Decode", "JPXDecode"];

fn needs_rendering(stream: &Stream) -> bool {
    stream_filters(stream)
        .iter()
        .any(|f| RENDER_ONLY_FILTERS.contains(&f.as_str()))
}

/// Collect image XObjects referenced from a page, in resource order
fn collect_page_images(doc: &Document, page_id: ObjectId) -> Vec<ObjectId> {
    let mut images: Vec<ObjectId> = Vec::new();
    let mut seen: HashSet<ObjectId> = HashSet::new();

    let Ok(Object::Dictionary(page_dict)) = doc.get_object(page_id) else {
        return images;
    };

    let resources = get_page_resources(doc, page_dict);
    for (_, obj_id) in get_xobjects(doc, &resources) {
        collect_images_recursive(doc, obj_id, &mut images, &mut seen);
    }

    images
}

/// Recursively collect images from an object (handles Form XObjects)
fn collect_images_recursive(
    doc: &Document,
    obj_id: ObjectId,
    images: &mut Vec<ObjectId>,
    seen: &mut HashSet<ObjectId>,
) {
    if !seen.insert(obj_id) {
        return;
    }

    let Ok(Object::Stream(stream)) = doc.get_object(obj_id) else {
        return;
    };

    match name_value(stream.dict.get(b"Subtype").ok()).as_deref() {
        Some("Image") => images.push(obj_id),
        Some("Form") => {
            if let Ok(res) = stream.dict.get(b"Resources") {
                for (_, child_id) in get_xobjects(doc, res) {
                    collect_images_recursive(doc, child_id, images, seen);
                }
            }
        }
        _ => {}
    }
}

/// Page resources, inherited from the parent page tree node when absent
fn get_page_resources(doc: &Document, page_dict: &Dictionary) -> Object {
    if let Ok(resources) = page_dict.get(b"Resources") {
        return resources.clone();
    }

    let mut parent = page_dict.get(b"Parent").ok();
    let mut depth = 0;
    while let Some(Object::Reference(parent_id)) = parent {
        let Ok(Object::Dictionary(parent_dict)) = doc.get_object(*parent_id) else {
            break;
        };
        if let Ok(resources) = parent_dict.get(b"Resources") {
            return resources.clone();
        }
        depth += 1;
        if depth > 32 {
            break;
        }
        parent = parent_dict.get(b"Parent").ok();
    }

    Object::Null
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

/// Named XObject references from a resources dictionary
fn get_xobjects(doc: &Document, resources: &Object) -> Vec<(String, ObjectId)> {
    let Object::Dictionary(res_dict) = resolve(doc, resources) else {
        return Vec::new();
    };
    let Ok(xobjects) = res_dict.get(b"XObject") else {
        return Vec::new();
    };
    let Object::Dictionary(xobj_dict) = resolve(doc, xobjects) else {
        return Vec::new();
    };

    xobj_dict
        .iter()
        .filter_map(|(name, value)| match value {
            Object::Reference(obj_id) => Some((String::from_utf8_lossy(name).to_string(), *obj_id)),
            _ => None,
        })
        .collect()
}

fn name_value(obj: Option<&Object>) -> Option<String> {
    match obj {
        Some(Object::Name(n)) => Some(String::from_utf8_lossy(n).to_string()),
        _ => None,
    }
}

fn int_value(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<i64> {
    match dict.get(key).map(|o| resolve(doc, o)) {
        Ok(Object::Integer(n)) => Some(*n),
        Ok(Object::Real(r)) => Some(*r as i64),
        _ => None,
    }
}

/// Filter names of a stream, in application order
fn stream_filters(stream: &Stream) -> Vec<String> {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(n)) => vec![String::from_utf8_lossy(n).to_string()],
        Ok(Object::Array(arr)) => arr
            .iter()
            .filter_map(|f| match f {
                Object::Name(n) => Some(String::from_utf8_lossy(n).to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Decode parameters for the filter at `index`
fn decode_parms<'a>(doc: &'a Document, stream: &'a Stream, index: usize) -> Option<&'a Dictionary> {
    let parms = resolve(doc, stream.dict.get(b"DecodeParms").ok()?);
    match parms {
        Object::Dictionary(d) => Some(d),
        Object::Array(arr) => match arr.get(index).map(|o| resolve(doc, o)) {
            Some(Object::Dictionary(d)) => Some(d),
            _ => None,
        },
        _ => None,
    }
}

/// Stream data after all filters, or a fully decoded image when the chain ends in DCTDecode
enum Decoded {
    Samples(Vec<u8>),
    Image(DynamicImage),
}

fn decode_stream_data(doc: &Document, stream: &Stream) -> Result<Decoded, String> {
    let filters = stream_filters(stream);
    let mut data = stream.content.clone();

    for (index, filter) in filters.iter().enumerate() {
        match filter.as_str() {
            "FlateDecode" | "Fl" => {
                let mut decoder = ZlibDecoder::new(&data[..]);
                let mut decoded = Vec::new();
                decoder.read_to_end(&mut decoded).map_err(|e| e.to_string())?;
                data = match decode_parms(doc, stream, index) {
                    Some(parms) => undo_predictor(doc, parms, decoded)?,
                    None => decoded,
                };
            }
            "DCTDecode" | "DCT" => {
                let img = image::load_from_memory_with_format(&data, ImageFormat::Jpeg)
                    .map_err(|e| format!("Failed to decode JPEG image: {}", e))?;
                return Ok(Decoded::Image(img));
            }
            "CCITTFaxDecode" | "CCF" => {
                data = decode_ccitt(doc, stream, decode_parms(doc, stream, index), &data)?;
            }
            "JBIG2Decode" | "JPXDecode" => {
                return Err(format!("{} images can only be read by rendering the page", filter))
            }
            other => return Err(format!("Unsupported filter: {}", other)),
        }
    }

    Ok(Decoded::Samples(data))
}

/// Decode CCITT Group 3 or Group 4 fax data into 1-bit rows padded to a byte boundary.
///
/// Rows follow the image sample convention, where a 0 bit is black unless `BlackIs1` is set.
fn decode_ccitt(
    doc: &Document,
    stream: &Stream,
    parms: Option<&Dictionary>,
    data: &[u8],
) -> Result<Vec<u8>, String> {
    let param = |key: &[u8]| parms.and_then(|p| int_value(doc, p, key));
    let black_is_1 = parms.is_some_and(|p| matches!(p.get(b"BlackIs1"), Ok(Object::Boolean(true))));

    let columns = param(b"Columns").unwrap_or(1728);
    let width = u16::try_from(columns)
        .ok()
        .filter(|w| *w > 0)
        .ok_or_else(|| format!("Invalid CCITT width {}", columns))?;
    let height = param(b"Rows")
        .filter(|r| *r > 0)
        .or_else(|| int_value(doc, &stream.dict, b"Height"))
        .and_then(|r| u16::try_from(r).ok());

    let mut lines: Vec<Vec<u8>> = Vec::new();
    let status = if param(b"K").unwrap_or(0) < 0 {
        fax::decoder::decode_g4(data.iter().copied(), width, height, |transitions| {
            lines.push(pack_fax_line(transitions, width))
        })
    } else {
        fax::decoder::decode_g3(data.iter().copied(), |transitions| {
            lines.push(pack_fax_line(transitions, width))
        })
    };
    if lines.is_empty() {
        return Err("CCITT data could not be decoded".to_string());
    }
    if status.is_none() {
        log::debug!("[Source] CCITT data ended early after {} row(s)", lines.len());
    }

    // Missing trailing rows are white
    if let Some(height) = height {
        lines.resize(usize::from(height), vec![0; usize::from(width).div_ceil(8)]);
    }
    let mut rows = lines.concat();
    if !black_is_1 {
        rows.iter_mut().for_each(|b| *b = !*b);
    }
    Ok(rows)
}

/// Pack one decoded fax line, given as color change positions starting with white, with 1 for black
fn pack_fax_line(transitions: &[u16], width: u16) -> Vec<u8> {
    let width = usize::from(width);
    let mut row = vec![0u8; width.div_ceil(8)];
    let mut start = 0;
    let mut black = false;
    for end in transitions
        .iter()
        .map(|&t| usize::from(t).min(width))
        .chain(std::iter::once(width))
    {
        if black {
            for x in start..end {
                row[x / 8] |= 0x80 >> (x % 8);
            }
        }
        start = end;
        black = !black;
    }
    row
}

/// Reverse a PNG (>= 10) predictor; TIFF predictors are not supported
fn undo_predictor(doc: &Document, parms: &Dictionary, data: Vec<u8>) -> Result<Vec<u8>, String> {
    let predictor = int_value(doc, parms, b"Predictor").unwrap_or(1);
    if predictor < 2 {
        return Ok(data);
    }
    if predictor == 2 {
        return Err("TIFF predictor not supported".to_string());
    }

    let colors = int_value(doc, parms, b"Colors").unwrap_or(1).max(1) as usize;
    let bpc = int_value(doc, parms, b"BitsPerComponent").unwrap_or(8).max(1) as usize;
    let columns = int_value(doc, parms, b"Columns").unwrap_or(1).max(1) as usize;

    let bpp = (colors * bpc).div_ceil(8).max(1);
    let row_len = (colors * bpc * columns).div_ceil(8);
    let mut out = Vec::with_capacity(data.len());
    let mut prev = vec![0u8; row_len];

    for chunk in data.chunks(row_len + 1) {
        if chunk.len() < row_len + 1 {
            break;
        }
        let kind = chunk[0];
        let mut row = chunk[1..].to_vec();
        for i in 0..row_len {
            let left = if i >= bpp { row[i - bpp] } else { 0 };
            let up = prev[i];
            let up_left = if i >= bpp { prev[i - bpp] } else { 0 };
            let predicted = match kind {
                0 => 0,
                1 => left,
                2 => up,
                3 => ((left as u16 + up as u16) / 2) as u8,
                4 => paeth(left, up, up_left),
                _ => return Err(format!("Invalid PNG predictor row type {}", kind)),
            };
            row[i] = row[i].wrapping_add(predicted);
        }
        out.extend_from_slice(&row);
        prev = row;
    }

    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

/// Unpack `bpc`-bit samples from rows padded to a byte boundary
fn unpack_samples(data: &[u8], samples_per_row: usize, rows: usize, bpc: usize) -> Option<Vec<u8>> {
    if bpc == 8 {
        let needed = samples_per_row * rows;
        return (data.len() >= needed).then(|| data[..needed].to_vec());
    }
    if !matches!(bpc, 1 | 2 | 4) {
        return None;
    }

    let row_bytes = (samples_per_row * bpc).div_ceil(8);
    if data.len() < row_bytes * rows {
        return None;
    }
    let mask = ((1u16 << bpc) - 1) as u8;
    let mut out = Vec::with_capacity(samples_per_row * rows);
    for row in data.chunks(row_bytes).take(rows) {
        for i in 0..samples_per_row {
            let bit = i * bpc;
            let shift = 8 - bpc - (bit % 8);
            out.push((row[bit / 8] >> shift) & mask);
        }
    }
    Some(out)
}

/// Color space of an image, with the lookup table for Indexed spaces
enum ColorSpace {
    Gray,
    Rgb,
    Cmyk,
    Indexed { base: Box<ColorSpace>, palette: Vec<u8> },
    /// ICCBased or unknown: guess from the data size
    Guess,
}

impl ColorSpace {
    fn components(&self) -> usize {
        match self {
            ColorSpace::Gray | ColorSpace::Indexed { .. } | ColorSpace::Guess => 1,
            ColorSpace::Rgb => 3,
            ColorSpace::Cmyk => 4,
        }
    }
}

fn parse_color_space(doc: &Document, obj: &Object) -> ColorSpace {
    match resolve(doc, obj) {
        Object::Name(name) => match name.as_slice() {
            b"DeviceGray" | b"G" | b"CalGray" => ColorSpace::Gray,
            b"DeviceRGB" | b"RGB" | b"CalRGB" => ColorSpace::Rgb,
            b"DeviceCMYK" | b"CMYK" => ColorSpace::Cmyk,
            _ => ColorSpace::Guess,
        },
        Object::Array(arr) => match arr.first() {
            Some(Object::Name(n)) if n == b"Indexed" || n == b"I" => {
                let base = arr.get(1).map(|b| parse_color_space(doc, b)).unwrap_or(ColorSpace::Rgb);
                let palette = match arr.get(3).map(|o| resolve(doc, o)) {
                    Some(Object::String(bytes, _)) => bytes.clone(),
                    Some(Object::Stream(s)) => match decode_stream_data(doc, s) {
                        Ok(Decoded::Samples(bytes)) => bytes,
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                };
                ColorSpace::Indexed { base: Box::new(base), palette }
            }
            Some(Object::Name(n)) if n == b"ICCBased" => {
                let components = match arr.get(1).map(|o| resolve(doc, o)) {
                    Some(Object::Stream(s)) => int_value(doc, &s.dict, b"N"),
                    _ => None,
                };
                match components {
                    Some(1) => ColorSpace::Gray,
                    Some(3) => ColorSpace::Rgb,
                    Some(4) => ColorSpace::Cmyk,
                    _ => ColorSpace::Guess,
                }
            }
            Some(first) => parse_color_space(doc, first),
            None => ColorSpace::Guess,
        },
        _ => ColorSpace::Guess,
    }
}

/// Decode an image XObject into a bitmap, with any soft mask composited over white
fn decode_image_xobject(doc: &Document, stream: &Stream) -> Result<DynamicImage, String> {
    let img = decode_image_stream(doc, stream)?;

    let Ok(Object::Reference(smask_id)) = stream.dict.get(b"SMask") else {
        return Ok(img);
    };
    let Ok(Object::Stream(smask_stream)) = doc.get_object(*smask_id) else {
        return Ok(img);
    };
    match decode_image_stream(doc, smask_stream) {
        Ok(mask) => Ok(composite_over_white(&img, &mask.to_luma8())),
        Err(e) => {
            log::debug!("[Source] ignoring unreadable SMask: {}", e);
            Ok(img)
        }
    }
}

fn composite_over_white(img: &DynamicImage, alpha: &GrayImage) -> DynamicImage {
    let mut rgb = img.to_rgb8();
    let alpha = if alpha.dimensions() == rgb.dimensions() {
        alpha.clone()
    } else {
        imageops::resize(alpha, rgb.width(), rgb.height(), FilterType::Triangle)
    };
    for (pixel, a) in rgb.pixels_mut().zip(alpha.pixels()) {
        let a = a.0[0] as u32;
        for c in pixel.0.iter_mut() {
            *c = (255 - (a * (255 - *c as u32)) / 255) as u8;
        }
    }
    DynamicImage::ImageRgb8(rgb)
}

/// Decode a PDF image stream into a bitmap
fn decode_image_stream(doc: &Document, stream: &Stream) -> Result<DynamicImage, String> {
    let width = int_value(doc, &stream.dict, b"Width").unwrap_or(0).max(0) as u32;
    let height = int_value(doc, &stream.dict, b"Height").unwrap_or(0).max(0) as u32;
    if width == 0 || height == 0 {
        return Err("Invalid image dimensions".to_string());
    }

    let data = match decode_stream_data(doc, stream)? {
        Decoded::Image(img) => return Ok(img),
        Decoded::Samples(data) => data,
    };

    let is_mask = matches!(stream.dict.get(b"ImageMask"), Ok(Object::Boolean(true)));
    let bpc = if is_mask {
        1
    } else {
        // fax images routinely leave BitsPerComponent out
        let fax = stream_filters(stream).iter().any(|f| f == "CCITTFaxDecode" || f == "CCF");
        int_value(doc, &stream.dict, b"BitsPerComponent").unwrap_or(if fax { 1 } else { 8 }) as usize
    };
    let color_space = if is_mask {
        ColorSpace::Gray
    } else {
        match stream.dict.get(b"ColorSpace") {
            Ok(cs) => parse_color_space(doc, cs),
            Err(_) => ColorSpace::Guess,
        }
    };
    let inverted = match stream.dict.get(b"Decode").map(|o| resolve(doc, o)) {
        Ok(Object::Array(arr)) => matches!(arr.first(), Some(Object::Integer(1)))
            || matches!(arr.first(), Some(Object::Real(r)) if *r >= 1.0),
        _ => false,
    };

    let (w, h) = (width as usize, height as usize);
    let max_value = ((1u32 << bpc.min(8)) - 1).max(1);
    let scale = |v: u8| ((v as u32 * 255) / max_value) as u8;

    let img = match color_space {
        ColorSpace::Guess => {
            // ICCBased without a readable N: infer the component count from the data size
            let pixels = w * h;
            if bpc == 8 && data.len() >= pixels * 3 {
                rgb_from_samples(width, height, data[..pixels * 3].to_vec())?
            } else {
                let samples = unpack_samples(&data, w, h, bpc).ok_or("Could not determine image color space")?;
                gray_from_samples(width, height, samples.into_iter().map(scale).collect())?
            }
        }
        ColorSpace::Gray => {
            let samples = unpack_samples(&data, w, h, bpc)
                .ok_or_else(|| format!("Unsupported grayscale format: {} bits, {} bytes", bpc, data.len()))?;
            gray_from_samples(width, height, samples.into_iter().map(scale).collect())?
        }
        ColorSpace::Rgb => {
            let samples = unpack_samples(&data, w * 3, h, bpc)
                .ok_or_else(|| format!("Unsupported RGB format: {} bits, {} bytes", bpc, data.len()))?;
            rgb_from_samples(width, height, samples.into_iter().map(scale).collect())?
        }
        ColorSpace::Cmyk => {
            let samples = unpack_samples(&data, w * 4, h, bpc)
                .ok_or_else(|| format!("Unsupported CMYK format: {} bits, {} bytes", bpc, data.len()))?;
            let mut rgb_data = Vec::with_capacity(w * h * 3);
            for chunk in samples.chunks(4) {
                let c = scale(chunk[0]) as f32 / 255.0;
                let m = scale(chunk[1]) as f32 / 255.0;
                let y = scale(chunk[2]) as f32 / 255.0;
                let k = scale(chunk[3]) as f32 / 255.0;
                rgb_data.push(((1.0 - c) * (1.0 - k) * 255.0) as u8);
                rgb_data.push(((1.0 - m) * (1.0 - k) * 255.0) as u8);
                rgb_data.push(((1.0 - y) * (1.0 - k) * 255.0) as u8);
            }
            rgb_from_samples(width, height, rgb_data)?
        }
        ColorSpace::Indexed { base, palette } => {
            let samples = unpack_samples(&data, w, h, bpc)
                .ok_or_else(|| format!("Unsupported indexed format: {} bits, {} bytes", bpc, data.len()))?;
            let stride = base.components();
            let lookup = |index: u8, channel: usize| palette.get(index as usize * stride + channel).copied().unwrap_or(0);
            match *base {
                ColorSpace::Gray => gray_from_samples(width, height, samples.iter().map(|&i| lookup(i, 0)).collect())?,
                ColorSpace::Rgb => rgb_from_samples(
                    width,
                    height,
                    samples.iter().flat_map(|&i| [lookup(i, 0), lookup(i, 1), lookup(i, 2)]).collect(),
                )?,
                _ => return Err("Unsupported Indexed base color space".to_string()),
            }
        }
    };

    if inverted {
        let mut img = img;
        img.invert();
        return Ok(img);
    }
    Ok(img)
}

fn gray_from_samples(width: u32, height: u32, data: Vec<u8>) -> Result<DynamicImage, String> {
    GrayImage::from_raw(width, height, data)
        .map(DynamicImage::ImageLuma8)
        .ok_or_else(|| "Failed to create grayscale image from raw data".to_string())
}

fn rgb_from_samples(width: u32, height: u32, data: Vec<u8>) -> Result<DynamicImage, String> {
    RgbImage::from_raw(width, height, data)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| "Failed to create RGB image from raw data".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    #[test]
    fn unpacks_one_bit_rows_with_padding() {
        // 10 samples per row -> 2 bytes per row
        let data = [0b1010_1010, 0b1100_0000, 0b0000_0000, 0b0100_0000];
        let samples = unpack_samples(&data, 10, 2, 1).unwrap();
        assert_eq!(samples[..10], [1, 0, 1, 0, 1, 0, 1, 0, 1, 1]);
        assert_eq!(samples[10..], [0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(unpack_samples(&data, 10, 3, 1).is_none());
    }

    #[test]
    fn png_up_predictor_is_reversed() {
        let doc = Document::with_version("1.5");
        let parms = dictionary! { "Predictor" => 12, "Columns" => 3, "Colors" => 1, "BitsPerComponent" => 8 };
        // row 1: None filter; row 2: Up filter adding 1 to each byte of row 1
        let data = vec![0, 10, 20, 30, 2, 1, 1, 1];
        let out = undo_predictor(&doc, &parms, data).unwrap();
        assert_eq!(out, vec![10, 20, 30, 11, 21, 31]);
    }

    #[test]
    fn image_mask_with_decode_inversion() {
        let doc = Document::with_version("1.5");
        let stream = Stream::new(
            dictionary! {
                "Subtype" => "Image",
                "Width" => 8,
                "Height" => 1,
                "ImageMask" => true,
                "Decode" => vec![1.into(), 0.into()],
            },
            vec![0b1111_0000],
        );
        let img = decode_image_stream(&doc, &stream).unwrap().to_luma8();
        let row: Vec<u8> = img.pixels().map(|p| p.0[0]).collect();
        assert_eq!(row, vec![0, 0, 0, 0, 255, 255, 255, 255]);
    }

    #[test]
    fn fax_lines_pack_black_runs() {
        // white 2, black 3, white 2, black to the end
        assert_eq!(pack_fax_line(&[2, 5, 7], 8), vec![0b0011_1001]);
        assert_eq!(pack_fax_line(&[], 10), vec![0, 0]);
        assert_eq!(pack_fax_line(&[0], 10), vec![0xFF, 0b1100_0000]);
    }

    #[test]
    fn undecodable_ccitt_data_is_an_error() {
        let doc = Document::with_version("1.5");
        let stream = Stream::new(
            dictionary! {
                "Subtype" => "Image",
                "Width" => 8,
                "Height" => 2,
                "Filter" => "CCITTFaxDecode",
                "DecodeParms" => dictionary! { "K" => -1, "Columns" => 0 },
            },
            vec![0xFF],
        );
        assert!(decode_image_stream(&doc, &stream).is_err());
    }

    #[test]
    fn jbig2_and_jpeg2000_need_rendering() {
        let doc = Document::with_version("1.5");
        for filter in RENDER_ONLY_FILTERS {
            let stream = Stream::new(
                dictionary! { "Subtype" => "Image", "Width" => 8, "Height" => 8, "Filter" => filter },
                vec![0; 8],
            );
            assert!(needs_rendering(&stream));
            let err = decode_image_stream(&doc, &stream).unwrap_err();
            assert!(err.contains("rendering the page"), "{}", err);
        }
    }

    #[test]
    fn soft_mask_composites_over_white() {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 1, image::Luma([0])));
        let alpha = GrayImage::from_raw(2, 1, vec![255, 0]).unwrap();
        let out = composite_over_white(&img, &alpha).to_luma8();
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(1, 0).0[0], 255);
    }
}
