//! Size-system detection and size/quantity validation.
//!
//! Order documents mix size vocabularies: EU numeric clothing (34–58),
//! letter sizes (XS–XXXL), pants waist sizes (24–36) and mixed labels like
//! `38/XS`. Quantities only make sense against the system actually in use —
//! a "40" in a letter-sized table is almost certainly a quantity column that
//! leaked into the sizes. Detecting the dominant system first and validating
//! each entry against it filters those leaks out.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::model::SizeQuantity;

/// The size vocabularies the detector can recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeSystem {
    /// EU numeric clothing sizes: 32–58.
    ClothingNumericEu,
    /// Letter sizes: XS, S, M, L, XL, …
    ClothingLetters,
    /// Pants waist sizes: 24–36.
    PantsNumeric,
    /// Mixed labels: 38/XS, 40/S, …
    Mixed,
    /// No system reached the detection threshold.
    Unknown,
}

static RE_CLOTHING_EU: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(3[2-9]|4[0-9]|5[0-8])$").unwrap());
static RE_LETTERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(XS|S|M|L|XL|XXL|XXXL|2XL|3XL)$").unwrap());
static RE_PANTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(2[4-9]|3[0-6])$").unwrap());
static RE_MIXED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(38/XS|40/S|42/M|44/L|46/XL|48/XXL)$").unwrap());

/// Minimum fraction of entries that must match before a system is chosen.
const DETECTION_THRESHOLD: f64 = 0.6;

impl SizeSystem {
    fn pattern(&self) -> Option<&'static Regex> {
        match self {
            SizeSystem::ClothingNumericEu => Some(&RE_CLOTHING_EU),
            SizeSystem::ClothingLetters => Some(&RE_LETTERS),
            SizeSystem::PantsNumeric => Some(&RE_PANTS),
            SizeSystem::Mixed => Some(&RE_MIXED),
            SizeSystem::Unknown => None,
        }
    }

    const ALL: [SizeSystem; 4] = [
        SizeSystem::ClothingNumericEu,
        SizeSystem::ClothingLetters,
        SizeSystem::PantsNumeric,
        SizeSystem::Mixed,
    ];
}

/// Normalise a size label: trim, uppercase, strip leading zeros on
/// purely-numeric labels ("08" → "8").
pub fn normalize_size(size: &str) -> String {
    let upper = size.trim().to_uppercase();
    if !upper.is_empty() && upper.chars().all(|c| c.is_ascii_digit()) {
        let stripped = upper.trim_start_matches('0');
        if stripped.is_empty() {
            "0".to_string()
        } else {
            stripped.to_string()
        }
    } else {
        upper
    }
}

/// Detect which size system a list of labels is using.
///
/// Returns [`SizeSystem::Unknown`] unless at least 60% of labels match a
/// single system's pattern.
pub fn detect_size_system(sizes: &[String]) -> SizeSystem {
    let clean: Vec<String> = sizes
        .iter()
        .map(|s| normalize_size(s))
        .filter(|s| !s.is_empty())
        .collect();
    if clean.is_empty() {
        return SizeSystem::Unknown;
    }

    let mut best = (SizeSystem::Unknown, 0.0_f64);
    for system in SizeSystem::ALL {
        let pattern = system.pattern().expect("ALL systems have patterns");
        let matches = clean.iter().filter(|s| pattern.is_match(s)).count();
        let score = matches as f64 / clean.len() as f64;
        if score > best.1 {
            best = (system, score);
        }
    }

    if best.1 >= DETECTION_THRESHOLD {
        debug!(system = ?best.0, score = best.1, "size system detected");
        best.0
    } else {
        SizeSystem::Unknown
    }
}

/// Whether `size` (already normalised) is valid under `system`.
///
/// With an unknown system any label matching any known pattern (or the
/// unsized marker `UN`) is accepted — lenient by design, since rejecting
/// real sizes loses order lines while accepting a stray one only adds a
/// low-confidence row the validator will flag.
pub fn is_valid_size(size: &str, system: SizeSystem) -> bool {
    match system.pattern() {
        Some(pattern) => pattern.is_match(size),
        None => {
            size == "UN"
                || SizeSystem::ALL
                    .iter()
                    .any(|s| s.pattern().is_some_and(|p| p.is_match(size)))
        }
    }
}

/// Validate and normalise extracted `(size, quantity)` pairs.
///
/// Detects the system from the labels present, drops entries whose size
/// does not validate or whose quantity is not a positive number, and sorts
/// the survivors in natural size order.
pub fn validate_size_quantities(pairs: &[SizeQuantity]) -> Vec<SizeQuantity> {
    if pairs.is_empty() {
        return Vec::new();
    }

    let labels: Vec<String> = pairs.iter().map(|p| p.size.clone()).collect();
    let system = detect_size_system(&labels);

    let mut validated: Vec<SizeQuantity> = pairs
        .iter()
        .filter_map(|pair| {
            let size = normalize_size(&pair.size);
            if !is_valid_size(&size, system) {
                debug!(%size, ?system, "dropping size not valid for detected system");
                return None;
            }
            if !pair.quantity.is_finite() || pair.quantity <= 0.0 {
                return None;
            }
            Some(SizeQuantity {
                size,
                quantity: pair.quantity,
            })
        })
        .collect();

    validated.sort_by(|a, b| size_sort_key(&a.size).cmp(&size_sort_key(&b.size)));
    validated
}

/// Sort key giving natural order: letters (XS < S < … < XXXL), then
/// numerics ascending, then mixed labels by their numeric half, then the
/// rest alphabetically.
fn size_sort_key(size: &str) -> (u8, i64, String) {
    const LETTER_ORDER: &[(&str, i64)] = &[
        ("XXS", 0),
        ("XS", 1),
        ("S", 2),
        ("M", 3),
        ("L", 4),
        ("XL", 5),
        ("2XL", 6),
        ("XXL", 6),
        ("3XL", 7),
        ("XXXL", 7),
    ];

    if let Some((_, rank)) = LETTER_ORDER.iter().find(|(label, _)| *label == size) {
        return (0, *rank, String::new());
    }
    if let Ok(n) = size.parse::<i64>() {
        return (1, n, String::new());
    }
    if let Some((num, _)) = size.split_once('/') {
        if let Ok(n) = num.parse::<i64>() {
            return (2, n, String::new());
        }
    }
    (3, 0, size.to_string())
}
