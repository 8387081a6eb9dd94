//! Aztec vs QR arbitration for a page where both were accepted.
//!
//! Only reachable when every dense group is scanned (`scan_all_dense_groups`); the normal
//! short-circuit never lets both through on one page.

use crate::{BarcodeCandidate, BarcodeFormat};

/// Filename fragments that mark a transport or event ticket, which are usually Aztec
pub const FILENAME_HINTS: [&str; 5] = ["aztec", "ticket", "pass", "billet", "code"];

/// Outcome of arbitration for one page
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub candidates: Vec<BarcodeCandidate>,
    /// Set when neither a hint nor area separated the two types
    pub ambiguous: bool,
}

/// Case-insensitive substring match against [`FILENAME_HINTS`]
pub fn has_filename_hint(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    FILENAME_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Keep either the Aztec or the QR candidates of one page, never both.
///
/// A filename hint picks Aztec. Otherwise the type with the larger symbol wins, and Aztec wins
/// an exact tie. Every other format passes through untouched, in its original order.
pub fn resolve(candidates: Vec<BarcodeCandidate>, filename: &str) -> Resolution {
    let largest = |format: BarcodeFormat| {
        candidates
            .iter()
            .filter(|c| c.format == format)
            .map(BarcodeCandidate::area)
            .max()
    };

    let (aztec, qr) = match (largest(BarcodeFormat::Aztec), largest(BarcodeFormat::QrCode)) {
        (Some(aztec), Some(qr)) => (aztec, qr),
        _ => {
            return Resolution {
                candidates,
                ambiguous: false,
            }
        }
    };

    let mut ambiguous = false;
    let loser = if has_filename_hint(filename) {
        log::debug!("[Resolve] filename {:?} hints at Aztec", filename);
        BarcodeFormat::QrCode
    } else if qr > aztec {
        BarcodeFormat::Aztec
    } else {
        if qr == aztec {
            ambiguous = true;
            log::warn!("[Resolve] Aztec and QR symbols of equal size ({} px²); keeping Aztec", aztec);
        }
        BarcodeFormat::QrCode
    };

    Resolution {
        candidates: candidates.into_iter().filter(|c| c.format != loser).collect(),
        ambiguous,
    }
}
