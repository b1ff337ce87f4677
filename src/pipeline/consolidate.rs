//! Product consolidation: per-page partials → canonical product list.
//!
//! Pages report overlapping fragments of the same order: the same material
//! code may appear on several pages with different colour subsets, names
//! arrive with trailing noise tokens, categories come back in whatever
//! language the oracle felt like. Consolidation turns that into one
//! coherent list:
//!
//! 1. one document-wide supplier/markup decision (single lookup, never
//!    per-product),
//! 2. name and category normalisation,
//! 3. merge by material code — first occurrence is canonical, later
//!    occurrences contribute only colours not already present,
//! 4. deterministic `{material_code}.{n}` reference assignment,
//! 5. uniform supplier/markup/brand application,
//! 6. sort by material code.
//!
//! A conflicting colour (same code, different data) is a
//! consolidation anomaly: resolved first-seen, logged, never fatal. Only
//! document-level failure propagates out of the pipeline — a single bad
//! product is skipped with a warning.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::model::{LineReference, OrderInfo, Product};
use crate::reference::{self, CATEGORIES, FALLBACK_CATEGORY};

/// Consolidation result: canonical products plus the supplier decision.
#[derive(Debug)]
pub struct Consolidation {
    pub products: Vec<Product>,
    pub supplier_name: String,
    pub supplier_code: Option<String>,
    pub markup: f64,
    /// First-seen-wins conflicts and skipped products, for the report.
    pub anomalies: Vec<String>,
}

static RE_NAME_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-zÀ-ÿ\s]+?)(?:\s+\d.*)?$").unwrap());
static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static RE_MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Normalise a display name: strip trailing numeric/noise tokens, collapse
/// whitespace, uppercase.
pub fn normalize_name(name: &str) -> String {
    let trimmed = name.trim();
    let cleaned = match RE_NAME_PREFIX.captures(trimmed) {
        Some(caps) => caps[1].trim().to_string(),
        None => RE_DIGITS.replace_all(trimmed, "").trim().to_string(),
    };
    RE_MULTI_SPACE.replace_all(&cleaned, " ").to_uppercase()
}

/// Normalise a category into the fixed vocabulary, with keyword mapping
/// for the usual foreign spellings and [`FALLBACK_CATEGORY`] as the
/// catch-all bucket.
pub fn normalize_category(category: Option<&str>) -> String {
    let upper = category.unwrap_or("").trim().to_uppercase();
    if upper.is_empty() {
        return FALLBACK_CATEGORY.to_string();
    }

    if ["POLO", "POLOSHIRT"].iter().any(|t| upper.contains(t)) {
        return "POLOS".to_string();
    }
    if ["SWEATER", "SWEAT", "MALHA", "JERSEY", "MAGLIA", "KNIT"]
        .iter()
        .any(|t| upper.contains(t))
    {
        return "MALHAS".to_string();
    }

    for known in CATEGORIES {
        if upper.contains(known) || known.contains(upper.as_str()) {
            return known.to_string();
        }
    }

    FALLBACK_CATEGORY.to_string()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Merge per-page products into canonical records.
///
/// Never raises on a single bad product; skipped products and colour
/// conflicts are recorded as anomalies.
pub fn consolidate(
    products: Vec<Product>,
    order_info: &OrderInfo,
    config: &ExtractionConfig,
) -> Consolidation {
    // One supplier decision for the whole document.
    let (supplier_name, supplier_code, table_markup) = reference::determine_supplier(order_info);
    let markup = if supplier_code.is_some() {
        table_markup
    } else {
        config.default_markup
    };
    info!(
        supplier = %supplier_name,
        code = supplier_code.as_deref().unwrap_or("-"),
        markup,
        "document supplier determined"
    );

    let mut anomalies = Vec::new();
    let mut canonical: Vec<Product> = Vec::new();
    let mut index_by_code: HashMap<String, usize> = HashMap::new();

    for mut product in products {
        let material_code = product.material_code.trim().to_string();
        if material_code.is_empty() {
            let note = format!(
                "product without material code skipped: '{}'",
                product.name.trim()
            );
            warn!("{note}");
            anomalies.push(note);
            continue;
        }
        product.material_code = material_code.clone();

        let has_valid_colors = product.colors.iter().any(|c| !c.sizes.is_empty());
        if !has_valid_colors {
            let note = format!("product '{material_code}' skipped: no sized colour");
            warn!("{note}");
            anomalies.push(note);
            continue;
        }

        product.name = normalize_name(&product.name);
        let normalized = normalize_category(product.category.as_deref());
        if let Some(original) = product.category.as_deref() {
            if original != normalized {
                debug!(
                    from = original,
                    to = %normalized,
                    code = %material_code,
                    "category normalised"
                );
            }
        }
        product.category = Some(normalized);

        match index_by_code.get(&material_code) {
            Some(&idx) => {
                // Later occurrence: contribute only colours not already
                // present. First-seen wins on colour-code conflicts.
                let existing = &mut canonical[idx];
                for color in product.colors {
                    let already = existing
                        .colors
                        .iter()
                        .any(|c| c.color_code == color.color_code);
                    if already {
                        let note = format!(
                            "'{material_code}': duplicate colour '{}' resolved first-seen",
                            color.color_code
                        );
                        debug!("{note}");
                        anomalies.push(note);
                    } else {
                        existing.colors.push(color);
                    }
                }
            }
            None => {
                index_by_code.insert(material_code, canonical.len());
                canonical.push(product);
            }
        }
    }

    // Price repair, totals, references, supplier — over the merged set.
    let order_brand = order_info
        .brand
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .map(str::to_string);

    for product in &mut canonical {
        repair_prices(product, markup);

        product.total_price = {
            let sum: f64 = product.colors.iter().filter_map(|c| c.subtotal).sum();
            Some(round2(sum))
        };

        product.references = build_references(product);

        product.supplier = Some(supplier_name.clone());
        if let Some(brand) = &order_brand {
            product.brand = Some(brand.clone());
        }
        for color in &mut product.colors {
            color.supplier = Some(supplier_name.clone());
        }
        for reference in &mut product.references {
            reference.supplier = Some(supplier_name.clone());
        }
    }

    canonical.sort_by(|a, b| a.material_code.cmp(&b.material_code));

    // Optional barcode assignment: external, non-fatal.
    if let Some(assigner) = &config.barcode_assigner {
        if let Err(reason) = assigner.assign(&mut canonical) {
            warn!(%reason, "barcode assignment failed, continuing without barcodes");
        }
    }

    info!(products = canonical.len(), "consolidation complete");

    Consolidation {
        products: canonical,
        supplier_name,
        supplier_code,
        markup,
        anomalies,
    }
}

/// Fill missing prices: `unit_price` defaults to 0, `sales_price` to
/// `unit × markup`, `subtotal` to `unit × Σ quantities`.
fn repair_prices(product: &mut Product, markup: f64) {
    for color in &mut product.colors {
        let unit = color.unit_price.filter(|p| p.is_finite()).unwrap_or(0.0);
        color.unit_price = Some(unit);

        if color.sales_price.filter(|p| p.is_finite()).is_none() {
            color.sales_price = Some(round2(unit * markup));
        }
        if color.subtotal.filter(|p| p.is_finite()).is_none() {
            color.subtotal = Some(round2(unit * color.total_quantity()));
        }
    }
}

/// One reference per `(colour, size, quantity > 0)` triple, counter in
/// encounter order.
fn build_references(product: &Product) -> Vec<LineReference> {
    let mut references = Vec::new();
    let mut counter = 0u32;

    for color in &product.colors {
        for size in &color.sizes {
            if size.quantity <= 0.0 {
                continue;
            }
            counter += 1;
            references.push(LineReference {
                reference: format!("{}.{}", product.material_code, counter),
                counter,
                color_code: color.color_code.clone(),
                color_name: color.color_name.clone(),
                size: size.size.clone(),
                quantity: size.quantity,
                description: format!(
                    "{}[{}/{}]",
                    product.name, color.color_code, size.size
                ),
                supplier: None,
                barcode: None,
            });
        }
    }
    references
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ColorVariant, SizeQuantity};

    fn color(code: &str, sizes: &[(&str, f64)], unit_price: Option<f64>) -> ColorVariant {
        ColorVariant {
            color_code: code.into(),
            color_name: format!("Colour {code}"),
            sizes: sizes
                .iter()
                .map(|(s, q)| SizeQuantity::new(*s, *q))
                .collect(),
            unit_price,
            sales_price: None,
            subtotal: None,
            supplier: None,
        }
    }

    fn product(code: &str, name: &str, colors: Vec<ColorVariant>) -> Product {
        Product {
            name: name.into(),
            material_code: code.into(),
            category: Some("Polo shirt".into()),
            colors,
            ..Default::default()
        }
    }

    fn config() -> ExtractionConfig {
        ExtractionConfig::default()
    }

    #[test]
    fn merges_colors_across_pages_by_material_code() {
        // Scenario B: two pages both report CF100 with colours 001 and 002.
        let page1 = product("CF100", "Camisa Slim", vec![color("001", &[("M", 1.0)], Some(40.0))]);
        let page2 = product("CF100", "Camisa Slim 123", vec![color("002", &[("L", 2.0)], Some(40.0))]);

        let result = consolidate(vec![page1, page2], &OrderInfo::default(), &config());
        assert_eq!(result.products.len(), 1);
        let p = &result.products[0];
        assert_eq!(p.material_code, "CF100");
        assert_eq!(p.colors.len(), 2);
    }

    #[test]
    fn never_emits_duplicate_material_codes() {
        let products = vec![
            product("B2", "Beta", vec![color("001", &[("M", 1.0)], None)]),
            product("A1", "Alpha", vec![color("001", &[("S", 1.0)], None)]),
            product("B2", "Beta", vec![color("002", &[("L", 1.0)], None)]),
            product("A1", "Alpha", vec![color("001", &[("S", 5.0)], None)]),
        ];
        let result = consolidate(products, &OrderInfo::default(), &config());
        let mut codes: Vec<&str> = result.products.iter().map(|p| p.material_code.as_str()).collect();
        let before = codes.len();
        codes.dedup();
        assert_eq!(codes.len(), before, "duplicate material codes in output");
        // Sorted by material code.
        assert_eq!(codes, vec!["A1", "B2"]);
    }

    #[test]
    fn duplicate_color_conflict_is_first_seen_and_logged() {
        let first = product("C1", "Casaco", vec![color("001", &[("M", 1.0)], Some(10.0))]);
        let second = product("C1", "Casaco", vec![color("001", &[("M", 9.0)], Some(99.0))]);
        let result = consolidate(vec![first, second], &OrderInfo::default(), &config());

        let p = &result.products[0];
        assert_eq!(p.colors.len(), 1);
        assert_eq!(p.colors[0].sizes[0].quantity, 1.0, "first-seen wins");
        assert!(result
            .anomalies
            .iter()
            .any(|a| a.contains("first-seen")));
    }

    #[test]
    fn references_are_deterministic_per_material() {
        let p = product(
            "CF200",
            "Polo Basico",
            vec![
                color("001", &[("S", 1.0), ("M", 2.0)], Some(10.0)),
                color("002", &[("L", 1.0)], Some(10.0)),
            ],
        );
        let result = consolidate(vec![p], &OrderInfo::default(), &config());
        let refs = &result.products[0].references;
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].reference, "CF200.1");
        assert_eq!(refs[1].reference, "CF200.2");
        assert_eq!(refs[2].reference, "CF200.3");
        assert_eq!(refs[0].description, "POLO BASICO[001/S]");
        assert_eq!(refs[2].color_code, "002");
    }

    #[test]
    fn supplier_applied_uniformly() {
        let info = OrderInfo {
            supplier: Some("Hugo Boss AG".into()),
            ..Default::default()
        };
        let p = product("H1", "Blazer", vec![color("010", &[("48", 1.0)], Some(100.0))]);
        let result = consolidate(vec![p], &info, &config());

        assert_eq!(result.supplier_name, "HUGO BOSS");
        assert_eq!(result.supplier_code.as_deref(), Some("HB"));
        let p = &result.products[0];
        assert_eq!(p.supplier.as_deref(), Some("HUGO BOSS"));
        assert_eq!(p.colors[0].supplier.as_deref(), Some("HUGO BOSS"));
        assert_eq!(p.references[0].supplier.as_deref(), Some("HUGO BOSS"));
    }

    #[test]
    fn price_repair_fills_missing_values() {
        let info = OrderInfo {
            supplier: Some("MARELLA".into()),
            ..Default::default()
        };
        let p = product("M1", "Vestido", vec![color("003", &[("38", 2.0)], Some(50.0))]);
        let result = consolidate(vec![p], &info, &config());

        let c = &result.products[0].colors[0];
        assert_eq!(c.unit_price, Some(50.0));
        assert_eq!(c.sales_price, Some(round2(50.0 * result.markup)));
        assert_eq!(c.subtotal, Some(100.0));
        assert_eq!(result.products[0].total_price, Some(100.0));
    }

    #[test]
    fn skips_products_without_material_code_or_colors() {
        let no_code = product("", "Sem Codigo", vec![color("001", &[("M", 1.0)], None)]);
        let no_colors = product("N1", "Sem Cores", vec![]);
        let good = product("G1", "Bom", vec![color("001", &[("M", 1.0)], None)]);
        let result = consolidate(vec![no_code, no_colors, good], &OrderInfo::default(), &config());

        assert_eq!(result.products.len(), 1);
        assert_eq!(result.products[0].material_code, "G1");
        assert_eq!(result.anomalies.len(), 2);
    }

    #[test]
    fn name_normalisation_strips_noise() {
        assert_eq!(normalize_name("Malha Fechada 5041 M/L"), "MALHA FECHADA");
        assert_eq!(normalize_name("  camisa   slim  "), "CAMISA SLIM");
        assert_eq!(normalize_name("123 456"), "");
    }

    #[test]
    fn category_normalisation_uses_vocabulary_and_fallback() {
        assert_eq!(normalize_category(Some("Polo shirt")), "POLOS");
        assert_eq!(normalize_category(Some("maglia")), "MALHAS");
        assert_eq!(normalize_category(Some("JEANS")), "JEANS");
        assert_eq!(normalize_category(Some("Spaceship")), FALLBACK_CATEGORY);
        assert_eq!(normalize_category(None), FALLBACK_CATEGORY);
    }

    #[test]
    fn barcode_failure_is_non_fatal() {
        struct FailingAssigner;
        impl crate::config::BarcodeAssigner for FailingAssigner {
            fn assign(&self, _products: &mut [Product]) -> Result<(), String> {
                Err("printer on fire".into())
            }
        }
        let cfg = ExtractionConfig::builder()
            .barcode_assigner(std::sync::Arc::new(FailingAssigner))
            .build()
            .unwrap();
        let p = product("B1", "Bolsa", vec![color("001", &[("UN", 1.0)], None)]);
        let result = consolidate(vec![p], &OrderInfo::default(), &cfg);
        assert_eq!(result.products.len(), 1, "failure must not drop products");
    }
}
