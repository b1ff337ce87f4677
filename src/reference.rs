//! Static reference tables: suppliers, categories, expected prices.
//!
//! Read-only lookups used by the consolidator and the validation layer.
//! Everything here is a pure function over compiled-in tables; nothing
//! touches the network or the filesystem.

use crate::model::OrderInfo;

/// Fallback markup applied when the supplier is unknown.
pub const DEFAULT_MARKUP: f64 = 2.73;

/// Catch-all category for anything the vocabulary does not cover.
pub const FALLBACK_CATEGORY: &str = "ACESSÓRIOS";

/// The fixed category vocabulary (Portuguese, as exported downstream).
pub const CATEGORIES: &[&str] = &[
    "VESTIDOS",
    "BLUSAS",
    "SAIAS",
    "CASACOS",
    "BLAZERS E FATOS",
    "T-SHIRTS",
    "MALHAS",
    "SWEATSHIRTS",
    "POLOS",
    "CAMISAS",
    "CALÇAS",
    "JEANS",
    "CALÇADO",
    "ACESSÓRIOS",
];

/// Known suppliers: `(canonical name, code, markup)`.
///
/// Matched case-insensitively as substrings against order-info hints;
/// longer names are listed before their prefixes so "HUGO BOSS" wins
/// over "BOSS".
const SUPPLIERS: &[(&str, &str, f64)] = &[
    ("WEEKEND MAXMARA", "WMM", 2.60),
    ("TOMMY HILFIGER", "TH", 2.50),
    ("RALPH LAUREN", "RL", 2.80),
    ("PAUL & SHARK", "PS", 2.75),
    ("HUGO BOSS", "HB", 2.70),
    ("MARELLA", "MAR", 2.73),
    ("DEDIMAX", "DDM", 2.73),
    ("TWINSET", "TWS", 2.65),
    ("LIU.JO", "LJ", 2.73),
    ("LIUJO", "LJ", 2.73),
    ("BOSS", "HB", 2.70),
    ("GANT", "GAN", 2.55),
    ("BRAX", "BRX", 2.45),
    ("MEYER", "MEY", 2.45),
];

/// Expected unit price per category, for the plausibility band check.
/// The validation layer accepts `[0.3×, 3.0×]` around these anchors.
const EXPECTED_PRICES: &[(&str, f64)] = &[
    ("VESTIDOS", 120.0),
    ("BLUSAS", 60.0),
    ("SAIAS", 70.0),
    ("CASACOS", 180.0),
    ("BLAZERS E FATOS", 200.0),
    ("T-SHIRTS", 35.0),
    ("MALHAS", 80.0),
    ("SWEATSHIRTS", 55.0),
    ("POLOS", 50.0),
    ("CAMISAS", 65.0),
    ("CALÇAS", 75.0),
    ("JEANS", 70.0),
    ("CALÇADO", 110.0),
    ("ACESSÓRIOS", 40.0),
];

/// Table-header keywords used by the layout analyzers (multilingual).
pub const HEADER_KEYWORDS: &[&str] = &[
    "SIZE", "COLOR", "QTY", "PRICE", "QUANTITY", "MODEL", "MODELO", "COR", "TAMANHO", "PREÇO",
];

/// Look up a supplier by fuzzy (substring, case-insensitive) match.
///
/// Returns `(canonical name, code, markup)` when a known supplier name
/// appears inside `hint`.
pub fn lookup_supplier(hint: &str) -> Option<(&'static str, &'static str, f64)> {
    let upper = hint.to_uppercase();
    SUPPLIERS
        .iter()
        .find(|(name, _, _)| upper.contains(name))
        .copied()
}

/// Expected unit price for a (normalised) category.
pub fn expected_price(category: &str) -> Option<f64> {
    let upper = category.to_uppercase();
    EXPECTED_PRICES
        .iter()
        .find(|(cat, _)| *cat == upper)
        .map(|(_, p)| *p)
}

/// Whether `category` is exactly one of the fixed vocabulary entries.
pub fn is_known_category(category: &str) -> bool {
    let upper = category.to_uppercase();
    CATEGORIES.iter().any(|c| *c == upper)
}

/// Determine the single document-wide supplier from order-info hints.
///
/// Single lookup for the whole document, never per-product: tries the
/// supplier field, then the brand, then the customer line. Unknown hints
/// keep their raw (uppercased) name with the default markup so the export
/// still carries what the document said.
pub fn determine_supplier(info: &OrderInfo) -> (String, Option<String>, f64) {
    let hints = [&info.supplier, &info.brand, &info.customer];

    for hint in hints.into_iter().flatten() {
        if let Some((name, code, markup)) = lookup_supplier(hint) {
            return (name.to_string(), Some(code.to_string()), markup);
        }
    }

    // No table match: keep the raw supplier string if there is one.
    if let Some(raw) = info.supplier.as_deref() {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_uppercase(), None, DEFAULT_MARKUP);
        }
    }

    ("DESCONHECIDO".to_string(), None, DEFAULT_MARKUP)
}
