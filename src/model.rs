//! Data model for extracted order line items.
//!
//! Everything here is `serde`-derived: the same structs flow from JSON
//! recovery through consolidation and validation into the job-store output.
//! Lifecycle in one line: [`PageExtraction`] values are created and consumed
//! per page; their [`Product`]s merge across pages by `material_code` in the
//! consolidator and are finalised (sorted, referenced, scored) exactly once
//! at pipeline end.

use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Page input ───────────────────────────────────────────────────────────

/// Base64-encoded image payload handed to the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    /// Base64-encoded image bytes.
    pub data: String,
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
}

impl ImageData {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }
}

/// A positioned text fragment reported by the external renderer.
///
/// Feeds the technical layout analyzer (column clustering, alignment,
/// number-grid detection). Coordinates are in page units; only relative
/// positions matter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextElement {
    pub text: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub font_size: f64,
}

/// One rendered page. Immutable, externally produced, read-only.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 0-indexed page position.
    pub index: usize,
    /// The rendered page image, oracle-ready.
    pub image: ImageData,
    /// Plain text of the page, when the renderer has a text layer.
    pub text: Option<String>,
    /// Positioned text elements, when available.
    pub elements: Vec<TextElement>,
}

impl PageImage {
    pub fn new(index: usize, image: ImageData) -> Self {
        Self {
            index,
            image,
            text: None,
            elements: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_elements(mut self, elements: Vec<TextElement>) -> Self {
        self.elements = elements;
        self
    }
}

/// The whole document as handed to the pipeline by the external renderer.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub pages: Vec<PageImage>,
}

impl DocumentInput {
    pub fn new(pages: Vec<PageImage>) -> Self {
        Self { pages }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Concatenated text of the first `n` pages, for content analysis.
    pub fn leading_text(&self, n: usize) -> String {
        self.pages
            .iter()
            .take(n)
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Extracted data ───────────────────────────────────────────────────────

/// Size label plus ordered quantity. Retained only when `quantity > 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeQuantity {
    pub size: String,
    pub quantity: f64,
}

impl SizeQuantity {
    pub fn new(size: impl Into<String>, quantity: f64) -> Self {
        Self {
            size: size.into(),
            quantity,
        }
    }
}

/// One colour variant of a product.
///
/// Invariant after sanitation: at least one [`SizeQuantity`] with
/// `quantity > 0`, or the variant is dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorVariant {
    #[serde(default)]
    pub color_code: String,
    #[serde(default)]
    pub color_name: String,
    #[serde(default)]
    pub sizes: Vec<SizeQuantity>,
    #[serde(default)]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub sales_price: Option<f64>,
    #[serde(default)]
    pub subtotal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
}

impl ColorVariant {
    /// Sum of quantities over all sizes.
    pub fn total_quantity(&self) -> f64 {
        self.sizes.iter().map(|s| s.quantity).sum()
    }
}

/// One `(colour, size)` order line derived from a canonical product.
///
/// `reference` is `{material_code}.{n}` with `n` a per-material counter in
/// encounter order; `description` is `{name}[{color_code}/{size}]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineReference {
    pub reference: String,
    pub counter: u32,
    pub color_code: String,
    pub color_name: String,
    pub size: String,
    pub quantity: f64,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
}

/// A product as extracted and consolidated.
///
/// `material_code` is the natural key: the consolidator guarantees the final
/// list never contains two products sharing one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub material_code: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub composition: Option<String>,
    #[serde(default)]
    pub colors: Vec<ColorVariant>,
    #[serde(default)]
    pub total_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<LineReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
    /// Attached by the validation layer; absent until then.
    #[serde(
        rename = "_validation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub validation: Option<ConfidenceScore>,
}

impl Product {
    /// A product is "complete" when it has a name, at least one colour and
    /// at least one sized entry. Page quality is the fraction of complete
    /// products, which drives strategy adaptation.
    pub fn is_complete(&self) -> bool {
        !self.name.trim().is_empty()
            && !self.colors.is_empty()
            && self.colors.iter().any(|c| !c.sizes.is_empty())
    }
}

/// Document-level order header, accumulated first-non-empty-wins per page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrderInfo {
    #[serde(default)]
    pub supplier: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub order_number: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub total_pieces: Option<u64>,
    #[serde(default)]
    pub total_value: Option<f64>,
}

impl OrderInfo {
    /// Fill empty fields of `self` from `other` (first-seen wins).
    pub fn absorb(&mut self, other: &OrderInfo) {
        fn fill<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(incoming);
            }
        }
        fill(&mut self.supplier, &other.supplier);
        fill(&mut self.document_type, &other.document_type);
        fill(&mut self.order_number, &other.order_number);
        fill(&mut self.date, &other.date);
        fill(&mut self.customer, &other.customer);
        fill(&mut self.brand, &other.brand);
        fill(&mut self.season, &other.season);
        fill(&mut self.total_pieces, &other.total_pieces);
        fill(&mut self.total_value, &other.total_value);
    }
}

/// What a single oracle response decodes to, before consolidation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageExtraction {
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub order_info: OrderInfo,
}

/// Which recovery stage produced a page's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    /// Stages 1–3: a structurally intact response.
    #[default]
    Normal,
    /// Stage 4: only the `products` array could be salvaged.
    PartiallyRecovered,
    /// Stage 5: placeholder products synthesised from bare material codes.
    EmergencyRecovery,
}

/// Per-page result after oracle call + recovery. Transient: consumed
/// immediately by consolidation, summarised in the output metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageOutcome {
    /// 1-indexed page number.
    pub page: usize,
    pub products_found: usize,
    pub strategy: String,
    pub recovery: RecoveryMethod,
    /// Measured quality in `[0, 1]` (fraction of complete products).
    pub quality: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
    pub duration_ms: u64,
    pub retries: u8,
}

// ── Confidence scoring ───────────────────────────────────────────────────

/// Discrete confidence bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    /// HIGH ≥ 80, MEDIUM 50–79, LOW < 50.
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            ConfidenceLevel::High
        } else if score >= 50.0 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// Weighted, rule-based correctness estimate for one product (0–100).
/// Not a probability emitted by the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    pub material_code_score: f64,
    pub category_score: f64,
    pub colors_score: f64,
    pub sizes_score: f64,
    pub prices_score: f64,
    pub overall_score: f64,
    pub level: ConfidenceLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

/// Aggregate validation report embedded in the output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_products: usize,
    pub average_confidence: f64,
    pub level: ConfidenceLevel,
    pub high_confidence: usize,
    pub medium_confidence: usize,
    pub low_confidence: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub common_issues: Vec<IssueCount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
    /// Every correction applied by the corrective pass, for audit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub corrections: Vec<String>,
    /// Number of corrective re-extractions performed.
    pub retries_used: u32,
}

/// An issue string with its occurrence count across products.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCount {
    pub issue: String,
    pub count: usize,
}

// ── Final output ─────────────────────────────────────────────────────────

/// Pipeline metadata embedded in the job-store output as `_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    pub pages_processed: usize,
    pub final_strategy: String,
    pub strategy_adaptations: usize,
    pub layout_type: String,
    pub layout_confidence: f64,
    /// Per-layout-type scores from the analysis the run used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layout_scores: Vec<(String, f64)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_pages: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovered_pages: Vec<usize>,
    pub cancelled: bool,
    pub processing_time_ms: u64,
}

/// Complete result of one document extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub products: Vec<Product>,
    pub order_info: OrderInfo,
    #[serde(rename = "_validation")]
    pub validation: ValidationReport,
    #[serde(rename = "_metadata")]
    pub metadata: ExtractionMetadata,
    /// Per-page summaries, in page order.
    pub pages: Vec<PageOutcome>,
}

impl ExtractionOutput {
    /// The job-store shape: `{products, order_info, _metadata, ...}`.
    pub fn to_job_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::Value::Object(serde_json::Map::from_iter([(
                "error".to_string(),
                serde_json::Value::String("serialisation failed".into()),
            )]))
        })
    }

    /// Total ordered pieces across all products.
    pub fn total_pieces(&self) -> f64 {
        self.products
            .iter()
            .flat_map(|p| &p.colors)
            .map(|c| c.total_quantity())
            .sum()
    }
}

/// Per-strategy quality samples keyed by strategy name — the serialisable
/// snapshot of the cross-document performance registry.
pub type PerformanceSnapshot = BTreeMap<String, Vec<f64>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sized_color(code: &str, sizes: &[(&str, f64)]) -> ColorVariant {
        ColorVariant {
            color_code: code.into(),
            color_name: String::new(),
            sizes: sizes
                .iter()
                .map(|(s, q)| SizeQuantity::new(*s, *q))
                .collect(),
            unit_price: None,
            sales_price: None,
            subtotal: None,
            supplier: None,
        }
    }

    #[test]
    fn complete_product_needs_name_color_and_size() {
        let mut p = Product {
            name: "CAMISA".into(),
            material_code: "AB1234".into(),
            colors: vec![sized_color("001", &[("M", 2.0)])],
            ..Default::default()
        };
        assert!(p.is_complete());

        p.name.clear();
        assert!(!p.is_complete());

        p.name = "CAMISA".into();
        p.colors[0].sizes.clear();
        assert!(!p.is_complete());
    }

    #[test]
    fn order_info_absorb_is_first_seen_wins() {
        let mut a = OrderInfo {
            supplier: Some("MARELLA".into()),
            ..Default::default()
        };
        let b = OrderInfo {
            supplier: Some("OTHER".into()),
            season: Some("FW25".into()),
            ..Default::default()
        };
        a.absorb(&b);
        assert_eq!(a.supplier.as_deref(), Some("MARELLA"));
        assert_eq!(a.season.as_deref(), Some("FW25"));
    }

    #[test]
    fn confidence_level_boundaries() {
        assert_eq!(ConfidenceLevel::from_score(80.0), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(79.9), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(50.0), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(49.9), ConfidenceLevel::Low);
    }

    #[test]
    fn product_json_round_trip() {
        let p = Product {
            name: "POLO".into(),
            material_code: "CF5015E0624".into(),
            category: Some("POLOS".into()),
            colors: vec![sized_color("807", &[("S", 1.0), ("M", 2.0)])],
            total_price: Some(237.0),
            ..Default::default()
        };
        let json = serde_json::to_string(&p).expect("serialise");
        let back: Product = serde_json::from_str(&json).expect("deserialise");
        assert_eq!(back, p);
    }

    #[test]
    fn page_image_builders_attach_text_layer() {
        let page = PageImage::new(0, ImageData::new("YQ==", "image/png"))
            .with_text("CF100  001  S M L")
            .with_elements(vec![TextElement {
                text: "CF100".into(),
                x: 10.0,
                y: 20.0,
                width: 40.0,
                height: 10.0,
                font_size: 9.0,
            }]);
        assert!(page.text.as_deref().unwrap().contains("CF100"));
        assert_eq!(page.elements.len(), 1);

        let doc = DocumentInput::new(vec![page]);
        assert_eq!(doc.page_count(), 1);
        assert!(doc.leading_text(3).contains("CF100"));
    }

    #[test]
    fn page_extraction_tolerates_missing_fields() {
        let raw = r#"{"products": [{"material_code": "X1"}]}"#;
        let pe: PageExtraction = serde_json::from_str(raw).expect("lenient parse");
        assert_eq!(pe.products.len(), 1);
        assert!(pe.products[0].name.is_empty());
    }
}
