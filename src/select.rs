//! Ranking and reduction of competing candidates on one page.

use crate::BarcodeCandidate;
use std::cmp::Ordering;

/// Share of the smaller box that must be covered for two detections to count as one symbol
const DUPLICATE_OVERLAP: f64 = 0.5;

/// Ranking order: higher confidence, then larger area, then closer to the image center.
///
/// A missing confidence ranks below any reported one.
pub fn rank_cmp(a: &BarcodeCandidate, b: &BarcodeCandidate) -> Ordering {
    let confidence = match (a.confidence, b.confidence) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    confidence
        .then_with(|| b.area().cmp(&a.area()))
        .then_with(|| a.center_distance.total_cmp(&b.center_distance))
}

/// Sort best first. Stable, so equal candidates keep decoder order.
pub fn rank(candidates: &mut [BarcodeCandidate]) {
    candidates.sort_by(rank_cmp);
}

/// Whether two candidates are detections of the same physical symbol
pub fn is_duplicate(a: &BarcodeCandidate, b: &BarcodeCandidate) -> bool {
    if a.page_index != b.page_index {
        return false;
    }
    if a.format == b.format && a.raw_bytes == b.raw_bytes {
        return true;
    }
    if !a.same_bitmap(b) {
        return false;
    }
    let smaller = a.area().min(b.area());
    if smaller == 0 {
        return false;
    }
    a.bbox.intersection_area(&b.bbox) as f64 / smaller as f64 >= DUPLICATE_OVERLAP
}

/// Rank candidates and drop duplicate detections of the same symbol.
///
/// Non-overlapping symbols are separate tickets and all survive, best first. Among
/// overlapping detections only the best-ranked one is kept.
pub fn select(mut candidates: Vec<BarcodeCandidate>) -> Vec<BarcodeCandidate> {
    rank(&mut candidates);

    let mut kept: Vec<BarcodeCandidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().any(|k| is_duplicate(k, &candidate)) {
            log::debug!(
                "[Select] page {}: dropping duplicate {} detection",
                candidate.page_index + 1,
                candidate.format
            );
            continue;
        }
        kept.push(candidate);
    }
    kept
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{BarcodeFormat, BoundingBox, Encoding, ImageSource};
    use bytes::Bytes;

    pub(crate) fn candidate(format: BarcodeFormat, payload: &str, bbox: BoundingBox) -> BarcodeCandidate {
        BarcodeCandidate {
            page_index: 0,
            format,
            raw_bytes: Bytes::copy_from_slice(payload.as_bytes()),
            text: payload.to_string(),
            encoding_used: Encoding::Utf8,
            bbox,
            confidence: None,
            center_distance: 0.0,
            source: ImageSource::EmbeddedImage,
            dpi: None,
            pages_found: vec![0],
            image_ordinal: 0,
        }
    }

    fn sized(payload: &str, confidence: Option<f32>, area: u32, center_distance: f64) -> BarcodeCandidate {
        let mut c = candidate(
            BarcodeFormat::QrCode,
            payload,
            BoundingBox { x: 0, y: 0, width: area, height: 1 },
        );
        c.confidence = confidence;
        c.center_distance = center_distance;
        c
    }

    fn payloads(candidates: &[BarcodeCandidate]) -> Vec<&str> {
        candidates.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn confidence_then_area_then_centrality() {
        let mut candidates = vec![
            sized("a100", Some(0.9), 100, 0.0),
            sized("a200", Some(0.9), 200, 0.0),
            sized("a999", Some(0.5), 999, 0.0),
        ];
        rank(&mut candidates);
        assert_eq!(payloads(&candidates), ["a200", "a100", "a999"]);

        let mut candidates = vec![sized("far", None, 50, 100.0), sized("near", None, 50, 10.0)];
        rank(&mut candidates);
        assert_eq!(payloads(&candidates), ["near", "far"]);
    }

    #[test]
    fn absent_confidence_ranks_lowest() {
        let mut candidates = vec![sized("none", None, 10_000, 0.0), sized("low", Some(0.0), 1, 0.0)];
        rank(&mut candidates);
        assert_eq!(payloads(&candidates), ["low", "none"]);
    }

    #[test]
    fn overlapping_detections_collapse_to_the_best() {
        let big = candidate(BarcodeFormat::QrCode, "real", BoundingBox { x: 10, y: 10, width: 100, height: 100 });
        let ghost = candidate(BarcodeFormat::QrCode, "reflection", BoundingBox { x: 20, y: 20, width: 60, height: 60 });
        let selected = select(vec![ghost, big]);
        assert_eq!(payloads(&selected), ["real"]);
    }

    #[test]
    fn separate_symbols_are_separate_tickets() {
        let left = candidate(BarcodeFormat::QrCode, "passenger-1", BoundingBox { x: 0, y: 0, width: 100, height: 100 });
        let right = candidate(BarcodeFormat::QrCode, "passenger-2", BoundingBox { x: 300, y: 0, width: 100, height: 100 });
        let selected = select(vec![left, right]);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn same_payload_in_two_images_is_one_symbol() {
        let a = candidate(BarcodeFormat::QrCode, "same", BoundingBox { x: 0, y: 0, width: 100, height: 100 });
        let mut b = candidate(BarcodeFormat::QrCode, "same", BoundingBox { x: 500, y: 500, width: 80, height: 80 });
        b.image_ordinal = 1;
        assert_eq!(select(vec![a, b]).len(), 1);
    }

    #[test]
    fn boxes_from_different_bitmaps_do_not_overlap() {
        let a = candidate(BarcodeFormat::QrCode, "one", BoundingBox { x: 0, y: 0, width: 100, height: 100 });
        let mut b = candidate(BarcodeFormat::QrCode, "two", BoundingBox { x: 0, y: 0, width: 100, height: 100 });
        b.image_ordinal = 1;
        assert_eq!(select(vec![a, b]).len(), 2);
    }

    #[test]
    fn single_candidate_passes_through() {
        let only = candidate(BarcodeFormat::Aztec, "x", BoundingBox { x: 0, y: 0, width: 5, height: 5 });
        assert_eq!(select(vec![only.clone()]), vec![only]);
        assert!(select(Vec::new()).is_empty());
    }
}
