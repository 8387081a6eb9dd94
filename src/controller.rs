//! Format-ordered detection.
//!
//! Each page walks [`FORMAT_GROUPS`] in order. Within a group the attempts get progressively more
//! expensive: embedded images, then the page rendered at the first DPI tier, then at the
//! escalation tier in try-harder mode. The first attempt with a hit decides the page.
//!
//! Pages are independent and run on a bounded rayon pool. A shared budget (deadline plus
//! cancellation flag) is checked before every attempt; a page that runs out of budget
//! contributes nothing.

use crate::decoder::{DecodedSymbol, SymbolDecoder};
use crate::payload::normalize;
use crate::preprocess;
use crate::resolve;
use crate::select;
use crate::source::{PageSource, SourceError};
use crate::{
    BarcodeCandidate, BarcodeFormat, BoundingBox, DetectOptions, DetectionResult, FormatGroup, ImageSource,
    FORMAT_GROUPS,
};
use bytes::Bytes;
use image::{DynamicImage, GrayImage};
use rayon::prelude::*;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cooperative cancellation shared between a caller and a running detection.
///
/// Cancelling stops new attempts from starting; a decode call already in flight finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Timeout,
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Timeout => f.write_str("timed out"),
            StopReason::Cancelled => f.write_str("was cancelled"),
        }
    }
}

struct Budget<'a> {
    deadline: Option<Instant>,
    cancel: &'a CancelFlag,
}

impl Budget<'_> {
    fn check(&self) -> Result<(), StopReason> {
        if self.cancel.is_cancelled() {
            return Err(StopReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StopReason::Timeout),
            _ => Ok(()),
        }
    }
}

/// One step of a format group's ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Embedded,
    Raster { dpi: u32, try_harder: bool },
}

enum GroupOutcome {
    Hit(Vec<BarcodeCandidate>),
    Miss,
    Stopped(StopReason),
    Failed(SourceError),
}

/// Bitmaps already produced for a page, reused across format groups
#[derive(Default)]
struct PageCache {
    embedded: Option<Vec<GrayImage>>,
    rasters: HashMap<u32, GrayImage>,
    rendering_unavailable: bool,
}

struct PageReport {
    page_index: usize,
    candidates: Vec<BarcodeCandidate>,
    warnings: Vec<String>,
    stopped: Option<StopReason>,
    /// Page found nothing and could only be searched through its embedded images
    rendering_unavailable: bool,
}

impl PageReport {
    fn new(page_index: usize) -> Self {
        Self {
            page_index,
            candidates: Vec::new(),
            warnings: Vec::new(),
            stopped: None,
            rendering_unavailable: false,
        }
    }

    fn fail(&mut self, err: SourceError) {
        log::warn!("[Detect] page {}: {}", self.page_index + 1, err);
        self.warnings
            .push(format!("Page {} could not be rendered: {}", self.page_index + 1, err));
    }
}

/// Runs the format-ordered search over every page of a source
pub struct Detector<'a, S: PageSource, D: SymbolDecoder> {
    source: &'a S,
    decoder: &'a D,
    options: DetectOptions,
    cancel: CancelFlag,
}

impl<'a, S: PageSource, D: SymbolDecoder> Detector<'a, S, D> {
    pub fn new(source: &'a S, decoder: &'a D, options: DetectOptions) -> Self {
        Self {
            source,
            decoder,
            options,
            cancel: CancelFlag::default(),
        }
    }

    /// Stop issuing attempts once `cancel` is set
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Scan every page. Never fails; problems surface as warnings on the result.
    pub fn detect(&self, filename: &str) -> DetectionResult {
        let page_count = self.source.page_count();
        let budget = Budget {
            deadline: self.options.timeout.and_then(|t| Instant::now().checked_add(t)),
            cancel: &self.cancel,
        };
        log::info!("[Detect] {:?}: scanning {} page(s)", filename, page_count);

        let mut reports = self.scan_pages(page_count, filename, &budget);
        reports.sort_by_key(|r| r.page_index);
        self.merge(reports, page_count)
    }

    fn scan_pages(&self, page_count: usize, filename: &str, budget: &Budget<'_>) -> Vec<PageReport> {
        let sequential = page_count <= 1 || self.options.workers == Some(1);
        if !sequential {
            let mut builder = rayon::ThreadPoolBuilder::new();
            if let Some(workers) = self.options.workers {
                builder = builder.num_threads(workers);
            }
            match builder.build() {
                Ok(pool) => {
                    return pool.install(|| {
                        (0..page_count)
                            .into_par_iter()
                            .map(|page_index| self.scan_page(page_index, filename, budget))
                            .collect()
                    })
                }
                Err(e) => log::warn!("[Detect] thread pool unavailable ({}); scanning pages in order", e),
            }
        }
        (0..page_count)
            .map(|page_index| self.scan_page(page_index, filename, budget))
            .collect()
    }

    fn scan_page(&self, page_index: usize, filename: &str, budget: &Budget<'_>) -> PageReport {
        let mut report = PageReport::new(page_index);
        let mut cache = PageCache::default();

        if self.options.scan_all_dense_groups {
            self.scan_every_group(&mut report, &mut cache, filename, budget);
        } else {
            self.scan_until_hit(&mut report, &mut cache, budget);
        }

        report.rendering_unavailable =
            cache.rendering_unavailable && report.candidates.is_empty() && report.stopped.is_none();
        if report.rendering_unavailable {
            let unreadable = self.source.unreadable_images(page_index);
            if unreadable > 0 {
                log::warn!(
                    "[Detect] page {}: {} image(s) need page rendering to be searched",
                    page_index + 1,
                    unreadable
                );
                report.warnings.push(format!(
                    "Page {}: {} image(s) use JBIG2 or JPEG 2000 compression and were not searched",
                    page_index + 1,
                    unreadable
                ));
            }
        }
        report
    }

    fn scan_until_hit(&self, report: &mut PageReport, cache: &mut PageCache, budget: &Budget<'_>) {
        for group in &FORMAT_GROUPS {
            match self.scan_group(report.page_index, group, cache, budget) {
                GroupOutcome::Hit(hits) => {
                    report.candidates = select::select(hits);
                    log::info!(
                        "[Detect] page {}: {} {} symbol(s)",
                        report.page_index + 1,
                        report.candidates.len(),
                        group.name
                    );
                    return;
                }
                GroupOutcome::Miss => {}
                GroupOutcome::Stopped(reason) => {
                    log::debug!("[Detect] page {}: {}", report.page_index + 1, reason);
                    report.stopped = Some(reason);
                    return;
                }
                GroupOutcome::Failed(err) => {
                    report.fail(err);
                    return;
                }
            }
        }
        log::debug!("[Detect] page {}: no barcode", report.page_index + 1);
    }

    /// Ambiguity re-scan: every group runs its full ladder, then Aztec and QR are arbitrated
    fn scan_every_group(
        &self,
        report: &mut PageReport,
        cache: &mut PageCache,
        filename: &str,
        budget: &Budget<'_>,
    ) {
        let mut accepted = Vec::new();
        for group in &FORMAT_GROUPS {
            match self.scan_group(report.page_index, group, cache, budget) {
                GroupOutcome::Hit(hits) => accepted.extend(select::select(hits)),
                GroupOutcome::Miss => {}
                GroupOutcome::Stopped(reason) => {
                    log::debug!("[Detect] page {}: {}", report.page_index + 1, reason);
                    report.stopped = Some(reason);
                    return;
                }
                GroupOutcome::Failed(err) => {
                    report.fail(err);
                    return;
                }
            }
        }

        let resolution = resolve::resolve(accepted, filename);
        if resolution.ambiguous {
            report.warnings.push(format!(
                "Page {}: Aztec and QR symbols are equally plausible; kept Aztec",
                report.page_index + 1
            ));
        }
        report.candidates = resolution.candidates;
    }

    fn plan(&self) -> [Attempt; 3] {
        [
            Attempt::Embedded,
            Attempt::Raster {
                dpi: self.options.first_dpi,
                try_harder: false,
            },
            Attempt::Raster {
                dpi: self.options.escalation_dpi,
                try_harder: true,
            },
        ]
    }

    fn scan_group(
        &self,
        page_index: usize,
        group: &FormatGroup,
        cache: &mut PageCache,
        budget: &Budget<'_>,
    ) -> GroupOutcome {
        for attempt in self.plan() {
            if let Err(reason) = budget.check() {
                return GroupOutcome::Stopped(reason);
            }

            let hits: Vec<BarcodeCandidate> = match attempt {
                Attempt::Embedded => {
                    let images = cache
                        .embedded
                        .get_or_insert_with(|| self.load_embedded(page_index));
                    let mut hits = Vec::new();
                    for (ordinal, bitmap) in images.iter().enumerate() {
                        for symbol in self.decoder.decode(bitmap, group.formats, false) {
                            hits.extend(build_candidate(
                                page_index,
                                symbol,
                                bitmap,
                                ImageSource::EmbeddedImage,
                                None,
                                ordinal,
                            ));
                        }
                    }
                    hits
                }
                Attempt::Raster { dpi, try_harder } => {
                    if cache.rendering_unavailable {
                        break;
                    }
                    match self.render(page_index, dpi, cache) {
                        Ok(()) => {}
                        Err(SourceError::Unavailable(reason)) => {
                            log::debug!("[Detect] page {}: {}", page_index + 1, reason);
                            cache.rendering_unavailable = true;
                            break;
                        }
                        Err(err) => return GroupOutcome::Failed(err),
                    }
                    let Some(bitmap) = cache.rasters.get(&dpi) else {
                        break;
                    };
                    self.decoder
                        .decode(bitmap, group.formats, try_harder)
                        .into_iter()
                        .filter_map(|symbol| {
                            build_candidate(page_index, symbol, bitmap, ImageSource::RasterizedPage, Some(dpi), 0)
                        })
                        .collect()
                }
            };

            log::debug!(
                "[Detect] page {}: {} group, {:?} -> {} hit(s)",
                page_index + 1,
                group.name,
                attempt,
                hits.len()
            );
            if !hits.is_empty() {
                return GroupOutcome::Hit(hits);
            }
        }
        GroupOutcome::Miss
    }

    fn load_embedded(&self, page_index: usize) -> Vec<GrayImage> {
        let images: Vec<GrayImage> = self
            .source
            .embedded_images(page_index)
            .iter()
            .map(DynamicImage::to_luma8)
            .collect();
        log::debug!("[Detect] page {}: {} embedded image(s)", page_index + 1, images.len());
        images
    }

    /// Make sure the enhanced page bitmap for `dpi` is in the cache
    fn render(&self, page_index: usize, dpi: u32, cache: &mut PageCache) -> Result<(), SourceError> {
        if let Entry::Vacant(slot) = cache.rasters.entry(dpi) {
            let page = self.source.rasterize(page_index, dpi)?;
            log::debug!(
                "[Detect] page {}: rendered {}x{} at {} DPI",
                page_index + 1,
                page.width(),
                page.height(),
                dpi
            );
            slot.insert(preprocess::enhance(&page));
        }
        Ok(())
    }

    fn merge(&self, reports: Vec<PageReport>, page_count: usize) -> DetectionResult {
        let mut result = DetectionResult::default();
        let mut stopped = None;
        let mut unfinished = 0;
        let mut rendering_unavailable = false;

        for report in reports {
            result.warnings.extend(report.warnings);
            if let Some(reason) = report.stopped {
                stopped.get_or_insert(reason);
                unfinished += 1;
            }
            rendering_unavailable |= report.rendering_unavailable;

            for candidate in report.candidates {
                if self.options.merge_duplicate_payloads {
                    if let Some(first) = result
                        .barcodes
                        .iter_mut()
                        .find(|b| b.format == candidate.format && b.raw_bytes == candidate.raw_bytes)
                    {
                        if !first.pages_found.contains(&candidate.page_index) {
                            first.pages_found.push(candidate.page_index);
                        }
                        log::debug!(
                            "[Detect] page {}: {} payload already seen on page {}",
                            candidate.page_index + 1,
                            candidate.format,
                            first.page_index + 1
                        );
                        continue;
                    }
                }
                result.barcodes.push(candidate);
            }
        }

        if rendering_unavailable {
            result
                .warnings
                .push("Page rendering is unavailable; only embedded images were searched".to_string());
        }
        if let Some(reason) = stopped {
            log::warn!("[Detect] stopped early: {} of {} page(s) unfinished", unfinished, page_count);
            result.warnings.push(format!(
                "Detection {} before {} of {} page(s) finished",
                reason, unfinished, page_count
            ));
        }
        for barcode in &result.barcodes {
            if barcode.format.wallet_format().is_none() {
                result.warnings.push(format!(
                    "{} barcode on page {} has no wallet pass equivalent",
                    barcode.format,
                    barcode.page_index + 1
                ));
            }
        }
        if result.barcodes.is_empty() {
            result.warnings.push("No barcode found in document".to_string());
        }

        log::info!(
            "[Detect] {} barcode(s), {} warning(s)",
            result.barcodes.len(),
            result.warnings.len()
        );
        result
    }
}

fn build_candidate(
    page_index: usize,
    symbol: DecodedSymbol,
    bitmap: &GrayImage,
    source: ImageSource,
    dpi: Option<u32>,
    image_ordinal: usize,
) -> Option<BarcodeCandidate> {
    if symbol.raw_bytes.is_empty() {
        log::debug!("[Detect] page {}: dropping {} with empty payload", page_index + 1, symbol.format);
        return None;
    }

    let (width, height) = bitmap.dimensions();
    let bbox = bounding_box(&symbol.points, width, height);
    let (cx, cy) = bbox.center();
    let center_distance = (cx - width as f64 / 2.0).hypot(cy - height as f64 / 2.0);
    let (text, encoding_used) = normalize(&symbol.raw_bytes);

    Some(BarcodeCandidate {
        page_index,
        format: symbol.format,
        raw_bytes: Bytes::from(symbol.raw_bytes),
        text,
        encoding_used,
        bbox,
        confidence: symbol.confidence,
        center_distance,
        source,
        dpi,
        pages_found: vec![page_index],
        image_ordinal,
    })
}

/// Box around the decoder's points, clamped to the bitmap and at least one pixel each way.
///
/// Without usable points the whole bitmap is the box.
fn bounding_box(points: &[(f32, f32)], width: u32, height: u32) -> BoundingBox {
    let finite: Vec<(f32, f32)> = points
        .iter()
        .copied()
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    if finite.is_empty() {
        return BoundingBox { x: 0, y: 0, width, height };
    }

    let span = |lo: f32, hi: f32, limit: u32| -> (u32, u32) {
        let start = (lo.floor().max(0.0) as u32).min(limit.saturating_sub(1));
        let end = (hi.ceil().max(0.0) as u32).min(limit);
        (start, end.saturating_sub(start).max(1))
    };
    let min_x = finite.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
    let max_x = finite.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
    let min_y = finite.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let max_y = finite.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);

    let (x, w) = span(min_x, max_x, width);
    let (y, h) = span(min_y, max_y, height);
    BoundingBox { x, y, width: w, height: h }
}
