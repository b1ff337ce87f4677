//! Robust JSON recovery: raw oracle text → validated page extraction.
//!
//! Oracle responses are unreliable: fenced, unfenced, truncated, commented,
//! single-quoted, or plain prose with fragments of JSON inside. Rather than
//! one brittle parse, recovery runs an **ordered chain of stages** where the
//! first success wins:
//!
//! 1. Fenced code block(s) — parse, must contain `"products"`
//! 2. Largest balanced `{…}` substring containing `"products"` (longest
//!    valid candidate preferred, so a truncated prefix never beats the
//!    complete object)
//! 3. The entire response parsed directly
//! 4. **Partial**: the `"products": […]` array alone, parsed standalone
//! 5. **Emergency**: bare `"material_code": "…"` occurrences synthesised
//!    into placeholder products, capped at 10
//!
//! Every stage sees pre-cleaned text (comments stripped, single quotes
//! fixed, trailing commas removed, `undefined`→`null`, `NaN`→`0`), and
//! every successful parse goes through the same sanitation pass. The
//! winning stage name is reported for observability.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PageError;
use crate::model::{
    ColorVariant, OrderInfo, PageExtraction, Product, RecoveryMethod, SizeQuantity,
};
use crate::sizes;

/// Emergency recovery never synthesises more than this many placeholders.
pub const EMERGENCY_PRODUCT_CAP: usize = 10;

/// A page extraction plus how it was obtained.
#[derive(Debug, Clone)]
pub struct RecoveredPage {
    pub extraction: PageExtraction,
    pub method: RecoveryMethod,
    /// Name of the recovery stage that succeeded, for logs/metadata.
    pub stage: &'static str,
    /// Sanitation warnings (partially valid products, dropped entries).
    pub warnings: Vec<String>,
}

/// Outcome of validating one raw product value.
///
/// Tagged instead of mutated-in-place so callers can tell a clean product
/// from one that needed repair, and collect the reasons.
#[derive(Debug)]
pub enum ProductOutcome {
    Ok(Product),
    PartialOk(Product, Vec<String>),
    Rejected(String),
}

// ── Entry point ──────────────────────────────────────────────────────────

type Stage = fn(&str) -> Option<(Value, RecoveryMethod)>;

/// The ordered recovery chain. First success wins.
const STAGES: &[(&'static str, Stage)] = &[
    ("fenced_block", stage_fenced_block),
    ("brace_scan", stage_brace_scan),
    ("whole_response", stage_whole_response),
    ("products_array", stage_products_array),
    ("emergency_codes", stage_emergency_codes),
];

/// Run the recovery chain over one oracle response.
///
/// Returns the first stage's result, sanitised; `Err` only when every
/// stage failed, carrying a [`PageError::Malformed`].
pub fn recover_page(raw: &str, page: usize) -> Result<RecoveredPage, PageError> {
    for &(name, stage) in STAGES {
        if let Some((value, method)) = stage(raw) {
            debug!(page, stage = name, ?method, "recovery stage succeeded");
            let (extraction, warnings) = sanitize(value);
            if matches!(method, RecoveryMethod::Normal | RecoveryMethod::PartiallyRecovered)
                && extraction.products.is_empty()
                && !warnings.is_empty()
            {
                // Every product was rejected by sanitation; let the next
                // stage (e.g. emergency codes) have a try.
                warn!(page, stage = name, "stage parsed but sanitation emptied it, continuing chain");
                continue;
            }
            return Ok(RecoveredPage {
                extraction,
                method,
                stage: name,
                warnings,
            });
        }
    }

    Err(PageError::Malformed {
        page,
        detail: format!(
            "no recovery stage succeeded over {} chars of response",
            raw.len()
        ),
    })
}

/// Extract any JSON object from oracle text (stages 1–3 only, no
/// `"products"` requirement). Used for the visual layout classification
/// response.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    for caps in RE_FENCED.captures_iter(raw) {
        if let Ok(v) = serde_json::from_str::<Value>(&clean_json_text(&caps[1])) {
            if v.is_object() {
                return Some(v);
            }
        }
    }
    for candidate in brace_candidates(raw) {
        if let Ok(v) = serde_json::from_str::<Value>(&clean_json_text(candidate)) {
            if v.is_object() {
                return Some(v);
            }
        }
    }
    serde_json::from_str::<Value>(clean_json_text(raw).as_str())
        .ok()
        .filter(|v| v.is_object())
}

// ── Stages ───────────────────────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)\s*```").unwrap());

fn stage_fenced_block(raw: &str) -> Option<(Value, RecoveryMethod)> {
    for caps in RE_FENCED.captures_iter(raw) {
        let cleaned = clean_json_text(&caps[1]);
        if let Ok(v) = serde_json::from_str::<Value>(&cleaned) {
            if v.get("products").is_some() {
                return Some((v, RecoveryMethod::Normal));
            }
        }
    }
    None
}

fn stage_brace_scan(raw: &str) -> Option<(Value, RecoveryMethod)> {
    let mut best: Option<(usize, Value)> = None;
    for candidate in brace_candidates(raw) {
        let cleaned = clean_json_text(candidate);
        if let Ok(v) = serde_json::from_str::<Value>(&cleaned) {
            if v.is_object() && v.get("products").is_some() {
                let len = candidate.len();
                if best.as_ref().is_none_or(|(l, _)| len > *l) {
                    best = Some((len, v));
                }
            }
        }
    }
    best.map(|(_, v)| (v, RecoveryMethod::Normal))
}

fn stage_whole_response(raw: &str) -> Option<(Value, RecoveryMethod)> {
    let cleaned = clean_json_text(raw.trim());
    serde_json::from_str::<Value>(&cleaned)
        .ok()
        .filter(|v| v.is_object())
        .map(|v| (v, RecoveryMethod::Normal))
}

static RE_PRODUCTS_ANCHOR: Lazy<Regex> = Lazy::new(|| Regex::new(r#""products"\s*:\s*\["#).unwrap());

fn stage_products_array(raw: &str) -> Option<(Value, RecoveryMethod)> {
    let anchor = RE_PRODUCTS_ANCHOR.find(raw)?;
    // Balanced-scan the array starting at the `[` the anchor ends on.
    let start = anchor.end() - 1;
    let array_src = balanced_slice(&raw[start..], '[', ']')?;
    let cleaned = clean_json_text(array_src);
    let products = serde_json::from_str::<Value>(&cleaned).ok()?;
    if !products.is_array() {
        return None;
    }
    let mut obj = serde_json::Map::new();
    obj.insert("products".into(), products);
    obj.insert("order_info".into(), Value::Object(Default::default()));
    Some((Value::Object(obj), RecoveryMethod::PartiallyRecovered))
}

static RE_MATERIAL_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""material_code"\s*:\s*"([^"]+)""#).unwrap());

fn stage_emergency_codes(raw: &str) -> Option<(Value, RecoveryMethod)> {
    let codes: Vec<&str> = RE_MATERIAL_CODE
        .captures_iter(raw)
        .map(|c| c.get(1).map_or("", |m| m.as_str()))
        .filter(|c| !c.is_empty())
        .take(EMERGENCY_PRODUCT_CAP)
        .collect();

    if codes.is_empty() {
        return None;
    }
    warn!(count = codes.len(), "emergency recovery from bare material codes");

    let products: Vec<Value> = codes
        .iter()
        .map(|code| {
            serde_json::json!({
                "material_code": code,
                "name": format!("Produto {code}"),
                "colors": [{
                    "color_code": "001",
                    "color_name": "Padrão",
                    "sizes": [{"size": "UN", "quantity": 1}],
                    "unit_price": 0.0,
                    "sales_price": 0.0,
                    "subtotal": 0.0
                }]
            })
        })
        .collect();

    let mut obj = serde_json::Map::new();
    obj.insert("products".into(), Value::Array(products));
    obj.insert("order_info".into(), Value::Object(Default::default()));
    Some((Value::Object(obj), RecoveryMethod::EmergencyRecovery))
}

// ── Text cleaning ────────────────────────────────────────────────────────

static RE_LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)//[^\n]*$").unwrap());
static RE_BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static RE_SQ_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"'([^']*)'\s*:").unwrap());
static RE_SQ_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s*'([^']*)'").unwrap());
static RE_TRAILING_COMMA_OBJ: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*\}").unwrap());
static RE_TRAILING_COMMA_ARR: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*\]").unwrap());
static RE_UNDEFINED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bundefined\b").unwrap());
static RE_NAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bNaN\b").unwrap());

/// Normalise the almost-JSON dialects oracles produce into parseable JSON.
pub fn clean_json_text(src: &str) -> String {
    let s = RE_BLOCK_COMMENT.replace_all(src, "");
    let s = RE_LINE_COMMENT.replace_all(&s, "");
    let s = RE_SQ_KEY.replace_all(&s, "\"$1\":");
    let s = RE_SQ_VALUE.replace_all(&s, ": \"$1\"");
    let s = RE_TRAILING_COMMA_OBJ.replace_all(&s, "}");
    let s = RE_TRAILING_COMMA_ARR.replace_all(&s, "]");
    let s = RE_UNDEFINED.replace_all(&s, "null");
    let s = RE_NAN.replace_all(&s, "0");
    s.trim().to_string()
}

/// All top-level balanced `{…}` slices of `text`, quote-aware.
fn brace_candidates(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        candidates.push(&text[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    candidates
}

/// The balanced `open…close` slice starting at the first byte of `text`.
fn balanced_slice(text: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(&text[..=i]);
            }
        }
    }
    None
}

// ── Sanitation ───────────────────────────────────────────────────────────

/// Validate a parsed value into a [`PageExtraction`], collecting warnings.
///
/// Always applied, regardless of which stage produced the value. Rules:
/// non-object products are dropped; missing name/material_code coerce to
/// empty strings rather than dropping the product; size quantities coerce
/// to positive numbers (entries ≤ 0 or non-numeric dropped); colours left
/// with zero valid sizes are dropped; products left with zero valid colours
/// are dropped; `total_price` defaults to the sum of colour subtotals.
pub fn sanitize(value: Value) -> (PageExtraction, Vec<String>) {
    let mut warnings = Vec::new();
    let mut products = Vec::new();

    let raw_products = value
        .get("products")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for (idx, raw) in raw_products.into_iter().enumerate() {
        match sanitize_product(raw) {
            ProductOutcome::Ok(p) => products.push(p),
            ProductOutcome::PartialOk(p, mut issues) => {
                warnings.append(&mut issues);
                products.push(p);
            }
            ProductOutcome::Rejected(reason) => {
                warnings.push(format!("product {idx} rejected: {reason}"));
            }
        }
    }

    let order_info = value
        .get("order_info")
        .map(parse_order_info)
        .unwrap_or_default();

    (
        PageExtraction {
            products,
            order_info,
        },
        warnings,
    )
}

/// Validate one raw product value into a tagged outcome.
pub fn sanitize_product(raw: Value) -> ProductOutcome {
    let obj = match raw.as_object() {
        Some(o) => o,
        None => return ProductOutcome::Rejected("not a JSON object".into()),
    };
    let mut issues = Vec::new();

    let name = str_field(obj, "name").unwrap_or_else(|| {
        issues.push("missing name coerced to empty".into());
        String::new()
    });
    let material_code = str_field(obj, "material_code").unwrap_or_else(|| {
        issues.push("missing material_code coerced to empty".into());
        String::new()
    });

    let mut colors = Vec::new();
    if let Some(raw_colors) = obj.get("colors").and_then(Value::as_array) {
        for raw_color in raw_colors {
            match sanitize_color(raw_color) {
                Some(color) => colors.push(color),
                None => issues.push(format!(
                    "colour dropped for '{material_code}': no valid sized entry"
                )),
            }
        }
    }

    if colors.is_empty() {
        return ProductOutcome::Rejected(format!(
            "'{material_code}': no colour with a positive-quantity size"
        ));
    }

    let total_price = num_field(obj, "total_price").or_else(|| {
        let sum: f64 = colors.iter().filter_map(|c| c.subtotal).sum();
        (sum > 0.0).then_some(sum)
    });

    let product = Product {
        name,
        material_code,
        category: str_field(obj, "category"),
        model: str_field(obj, "model"),
        composition: str_field(obj, "composition"),
        colors,
        total_price,
        references: Vec::new(),
        brand: str_field(obj, "brand"),
        supplier: str_field(obj, "supplier"),
        validation: None,
    };

    if issues.is_empty() {
        ProductOutcome::Ok(product)
    } else {
        ProductOutcome::PartialOk(product, issues)
    }
}

fn sanitize_color(raw: &Value) -> Option<ColorVariant> {
    let obj = raw.as_object()?;

    let raw_sizes: Vec<SizeQuantity> = obj
        .get("sizes")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|s| {
                    let o = s.as_object()?;
                    let size = str_field(o, "size")?;
                    let quantity = num_field(o, "quantity")?;
                    Some(SizeQuantity { size, quantity })
                })
                .collect()
        })
        .unwrap_or_default();

    let sizes = sizes::validate_size_quantities(&raw_sizes);
    if sizes.is_empty() {
        return None;
    }

    Some(ColorVariant {
        color_code: str_field(obj, "color_code").unwrap_or_default(),
        color_name: str_field(obj, "color_name").unwrap_or_default(),
        sizes,
        unit_price: num_field(obj, "unit_price"),
        sales_price: num_field(obj, "sales_price"),
        subtotal: num_field(obj, "subtotal"),
        supplier: None,
    })
}

fn parse_order_info(value: &Value) -> OrderInfo {
    let Some(obj) = value.as_object() else {
        return OrderInfo::default();
    };
    OrderInfo {
        supplier: str_field(obj, "supplier"),
        document_type: str_field(obj, "document_type"),
        order_number: str_field(obj, "order_number"),
        date: str_field(obj, "date"),
        customer: str_field(obj, "customer"),
        brand: str_field(obj, "brand"),
        season: str_field(obj, "season"),
        total_pieces: num_field(obj, "total_pieces").map(|n| n.max(0.0) as u64),
        total_value: num_field(obj, "total_value"),
    }
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn num_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FENCED: &str = r#"Here is the result:
```json
{"products": [{"name": "Polo", "material_code": "CF100",
  "colors": [{"color_code": "001", "sizes": [{"size": "S", "quantity": 1}]}]}],
 "order_info": {"supplier": "MARELLA"}}
```"#;

    #[test]
    fn fenced_block_wins_first() {
        let page = recover_page(FENCED, 1).expect("recovers");
        assert_eq!(page.stage, "fenced_block");
        assert_eq!(page.method, RecoveryMethod::Normal);
        assert_eq!(page.extraction.products.len(), 1);
        assert_eq!(
            page.extraction.order_info.supplier.as_deref(),
            Some("MARELLA")
        );
    }

    #[test]
    fn fenced_json_round_trips_exactly() {
        // Parse → re-serialise → re-parse equality for a valid fenced response.
        let page = recover_page(FENCED, 1).expect("recovers");
        let json = serde_json::to_string(&page.extraction).expect("serialise");
        let back: PageExtraction = serde_json::from_str(&json).expect("reparse");
        assert_eq!(back, page.extraction);
    }

    #[test]
    fn brace_scan_prefers_longest_candidate() {
        // A truncated-looking small object followed by the full one.
        let raw = r#"partial: {"products": []}
full: {"products": [{"name": "A", "material_code": "X1",
  "colors": [{"color_code": "001", "sizes": [{"size": "M", "quantity": 2}]}]}],
 "order_info": {}}"#;
        let page = recover_page(raw, 1).expect("recovers");
        assert_eq!(page.stage, "brace_scan");
        assert_eq!(page.extraction.products.len(), 1);
    }

    #[test]
    fn whole_response_parse() {
        let raw = r#"{"products": [{"name": "B", "material_code": "Y2",
  "colors": [{"color_code": "002", "sizes": [{"size": "L", "quantity": 1}]}]}]}"#;
        let page = recover_page(raw, 1).expect("recovers");
        assert_eq!(page.extraction.products.len(), 1);
    }

    #[test]
    fn products_array_alone_is_partial() {
        let raw = r#"The model said: "products": [{"name": "C", "material_code": "Z3",
  "colors": [{"color_code": "003", "sizes": [{"size": "S", "quantity": 3}]}]}] and then trailed off"#;
        let page = recover_page(raw, 2).expect("recovers");
        assert_eq!(page.method, RecoveryMethod::PartiallyRecovered);
        assert_eq!(page.stage, "products_array");
        assert_eq!(page.extraction.products.len(), 1);
    }

    #[test]
    fn emergency_recovery_synthesises_placeholders() {
        // Scenario C: unparsable text, three material_code occurrences.
        let raw = r#"garbage "material_code": "AB1234" noise
"material_code": "AB1234" more "material_code": "AB1234" tail"#;
        let page = recover_page(raw, 3).expect("recovers");
        assert_eq!(page.method, RecoveryMethod::EmergencyRecovery);
        assert_eq!(page.extraction.products.len(), 3);
        for p in &page.extraction.products {
            assert_eq!(p.material_code, "AB1234");
            assert_eq!(p.colors.len(), 1);
            assert_eq!(p.colors[0].sizes[0].size, "UN");
            assert_eq!(p.colors[0].sizes[0].quantity, 1.0);
            assert_eq!(p.colors[0].unit_price, Some(0.0));
        }
    }

    #[test]
    fn emergency_recovery_caps_at_ten() {
        let mut raw = String::from("junk ");
        for i in 0..25 {
            raw.push_str(&format!(r#""material_code": "CODE{i}" "#));
        }
        let page = recover_page(&raw, 1).expect("recovers");
        assert_eq!(page.extraction.products.len(), EMERGENCY_PRODUCT_CAP);
    }

    #[test]
    fn total_failure_is_malformed_error() {
        let err = recover_page("nothing here at all", 5).expect_err("fails");
        assert_eq!(err.page(), 5);
    }

    #[test]
    fn cleaning_fixes_common_dialects() {
        let dirty = r#"{
  // a comment
  'name': 'Polo', /* block */
  "price": NaN,
  "model": undefined,
  "tags": [1, 2,],
}"#;
        let cleaned = clean_json_text(dirty);
        let v: Value = serde_json::from_str(&cleaned).expect("parses after cleaning");
        assert_eq!(v["name"], "Polo");
        assert_eq!(v["price"], 0);
        assert!(v["model"].is_null());
    }

    #[test]
    fn sanitize_drops_zero_quantity_sizes() {
        // Scenario A: one colour with sizes [S:1, M:0] keeps only S:1.
        let raw = serde_json::json!({
            "products": [{
                "name": "Dress", "material_code": "D1",
                "colors": [{"color_code": "001",
                    "sizes": [{"size": "S", "quantity": 1}, {"size": "M", "quantity": 0}]}]
            }]
        });
        let (extraction, _) = sanitize(raw);
        let sizes = &extraction.products[0].colors[0].sizes;
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].size, "S");
    }

    #[test]
    fn sanitize_drops_colorless_products_and_keeps_warnings() {
        let raw = serde_json::json!({
            "products": [
                {"name": "Empty", "material_code": "E1", "colors": []},
                "not an object",
                {"material_code": "K2",
                 "colors": [{"color_code": "004", "sizes": [{"size": "M", "quantity": 2}]}]}
            ]
        });
        let (extraction, warnings) = sanitize(raw);
        assert_eq!(extraction.products.len(), 1);
        assert_eq!(extraction.products[0].material_code, "K2");
        assert!(extraction.products[0].name.is_empty(), "name coerced to empty");
        assert!(!warnings.is_empty());
    }

    #[test]
    fn sanitize_computes_total_price_from_subtotals() {
        let raw = serde_json::json!({
            "products": [{
                "name": "Coat", "material_code": "C1",
                "colors": [
                    {"color_code": "001", "subtotal": 100.0,
                     "sizes": [{"size": "M", "quantity": 1}]},
                    {"color_code": "002", "subtotal": 50.5,
                     "sizes": [{"size": "L", "quantity": 1}]}
                ]
            }]
        });
        let (extraction, _) = sanitize(raw);
        assert_eq!(extraction.products[0].total_price, Some(150.5));
    }

    #[test]
    fn quantity_strings_are_coerced() {
        let raw = serde_json::json!({
            "products": [{
                "name": "P", "material_code": "Q1",
                "colors": [{"color_code": "001",
                    "sizes": [{"size": "S", "quantity": "2"}, {"size": "M", "quantity": "x"}]}]
            }]
        });
        let (extraction, _) = sanitize(raw);
        let sizes = &extraction.products[0].colors[0].sizes;
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].quantity, 2.0);
    }
}
