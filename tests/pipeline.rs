//! End-to-end pipeline tests against a scripted mock oracle.
//!
//! No network, no real VLM: the oracle returns canned text per page, which
//! lets every failure mode of the real thing be reproduced exactly —
//! fenced JSON, prose-wrapped JSON, truncated garbage, bare material
//! codes, per-page quality collapse.

use async_trait::async_trait;
use ordervision::{
    extract_order, DocumentInput, ExtractionConfig, ImageData, OracleError, OracleHandle,
    PageImage, RecoveryMethod, VisionOracle,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Scripted oracle ──────────────────────────────────────────────────────────

/// Oracle that answers the visual-classification prompt, per-page
/// extraction prompts (by page number), and corrective prompts from a
/// fixed script.
struct ScriptedOracle {
    visual: String,
    pages: Vec<String>,
    corrective: Option<String>,
    extraction_calls: AtomicUsize,
    corrective_calls: AtomicUsize,
}

impl ScriptedOracle {
    fn new(visual: &str, pages: Vec<&str>) -> Self {
        Self {
            visual: visual.to_string(),
            pages: pages.into_iter().map(String::from).collect(),
            corrective: None,
            extraction_calls: AtomicUsize::new(0),
            corrective_calls: AtomicUsize::new(0),
        }
    }

    fn with_corrective(mut self, response: &str) -> Self {
        self.corrective = Some(response.to_string());
        self
    }

    /// Pull the 1-indexed page number out of an extraction prompt.
    fn page_from_prompt(prompt: &str) -> Option<usize> {
        let idx = prompt.find("This is page ")?;
        let rest = &prompt[idx + "This is page ".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    }
}

#[async_trait]
impl VisionOracle for ScriptedOracle {
    async fn describe(&self, prompt: &str, _image: &ImageData) -> Result<String, OracleError> {
        if prompt.contains("VISUAL LAYOUT ANALYSIS") {
            return Ok(self.visual.clone());
        }
        if prompt.contains("CORRECTIVE RE-EXTRACTION") {
            self.corrective_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(self
                .corrective
                .clone()
                .unwrap_or_else(|| "no corrective script".to_string()));
        }
        self.extraction_calls.fetch_add(1, Ordering::SeqCst);
        let page = Self::page_from_prompt(prompt).unwrap_or(1);
        Ok(self
            .pages
            .get(page - 1)
            .cloned()
            .unwrap_or_else(|| "unscripted page".to_string()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────────

const VISUAL_GRID: &str = r#"```json
{"primary_layout": "GRID_TABULAR", "confidence": 0.85,
 "structural_elements": {"has_clear_grid": true, "has_headers": true,
   "alignment_quality": "high", "data_density": "medium",
   "repetitive_patterns": true},
 "extraction_hints": {"best_approach": "table_scan", "complexity_level": "simple"}}
```"#;

const PAGE_CF100_COLOR1: &str = r#"```json
{"products": [{
  "name": "Camisa Slim",
  "material_code": "CF100",
  "category": "CAMISAS",
  "colors": [{
    "color_code": "001", "color_name": "Branco",
    "sizes": [{"size": "S", "quantity": 1}, {"size": "M", "quantity": 2}],
    "unit_price": 60.0, "sales_price": 150.0, "subtotal": 180.0
  }],
  "total_price": 180.0
}],
"order_info": {"supplier": "MARELLA", "season": "FW25"}}
```"#;

const PAGE_CF100_COLOR2: &str = r#"```json
{"products": [{
  "name": "Camisa Slim 456",
  "material_code": "CF100",
  "category": "CAMISAS",
  "colors": [{
    "color_code": "002", "color_name": "Azul",
    "sizes": [{"size": "M", "quantity": 1}],
    "unit_price": 60.0, "sales_price": 150.0, "subtotal": 60.0
  }]
}],
"order_info": {"order_number": "ENC-2041"}}
```"#;

fn page(index: usize) -> PageImage {
    PageImage::new(index, ImageData::new("cGFnZQ==", "image/png"))
}

fn doc(pages: usize) -> DocumentInput {
    DocumentInput::new((0..pages).map(page).collect())
}

fn fast_config() -> ExtractionConfig {
    ExtractionConfig::builder()
        .retry_backoff_ms(1)
        .max_retries(1)
        .build()
        .expect("valid config")
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_pages_merge_into_one_product() {
    // Scenario B: both pages report CF100, colours 001 and 002.
    let oracle: OracleHandle = Arc::new(ScriptedOracle::new(
        VISUAL_GRID,
        vec![PAGE_CF100_COLOR1, PAGE_CF100_COLOR2],
    ));
    let output = extract_order(&doc(2), &oracle, &fast_config())
        .await
        .expect("extraction succeeds");

    assert_eq!(output.products.len(), 1);
    let p = &output.products[0];
    assert_eq!(p.material_code, "CF100");
    assert_eq!(p.colors.len(), 2, "both colour variants merged");
    assert_eq!(p.name, "CAMISA SLIM");
    assert_eq!(p.category.as_deref(), Some("CAMISAS"));

    // References: one per (colour, size) with quantity > 0, in order.
    let refs: Vec<&str> = p.references.iter().map(|r| r.reference.as_str()).collect();
    assert_eq!(refs, vec!["CF100.1", "CF100.2", "CF100.3"]);
    assert_eq!(p.references[0].description, "CAMISA SLIM[001/S]");

    // Supplier determined once and applied uniformly.
    assert_eq!(output.order_info.supplier.as_deref(), Some("MARELLA"));
    assert_eq!(p.supplier.as_deref(), Some("MARELLA"));
    assert!(p.colors.iter().all(|c| c.supplier.as_deref() == Some("MARELLA")));

    // Order info accumulated across pages, first-seen wins.
    assert_eq!(output.order_info.order_number.as_deref(), Some("ENC-2041"));
    assert_eq!(output.order_info.season.as_deref(), Some("FW25"));

    // S:1 + M:2 from page 1, M:1 from page 2.
    assert_eq!(output.total_pieces(), 4.0);

    // Every retained colour variant carries at least one positive quantity.
    assert!(output
        .products
        .iter()
        .flat_map(|p| &p.colors)
        .all(|c| c.sizes.iter().any(|s| s.quantity > 0.0)));

    // Metadata describes the run.
    assert_eq!(output.metadata.pages_processed, 2);
    assert!(output.metadata.failed_pages.is_empty());
    assert!(!output.metadata.cancelled);
    assert_eq!(output.metadata.layout_type, "GRID_TABULAR");

    // Grid layout with clean pages: table strategy throughout.
    assert_eq!(output.metadata.final_strategy, "structured_table");
    assert_eq!(output.metadata.strategy_adaptations, 0);

    // Confident output for clean data.
    assert!(output.validation.average_confidence >= 50.0);
    assert_eq!(output.validation.retries_used, 0);
}

#[tokio::test]
async fn no_duplicate_material_codes_in_output() {
    let oracle: OracleHandle = Arc::new(ScriptedOracle::new(
        VISUAL_GRID,
        vec![PAGE_CF100_COLOR1, PAGE_CF100_COLOR1, PAGE_CF100_COLOR2],
    ));
    let output = extract_order(&doc(3), &oracle, &fast_config())
        .await
        .expect("extraction succeeds");

    let mut codes: Vec<&str> = output
        .products
        .iter()
        .map(|p| p.material_code.as_str())
        .collect();
    let total = codes.len();
    codes.sort();
    codes.dedup();
    assert_eq!(codes.len(), total, "consolidator emitted duplicate codes");
}

// ── Degradation and recovery ─────────────────────────────────────────────────

#[tokio::test]
async fn first_page_failure_is_fatal() {
    let oracle: OracleHandle = Arc::new(ScriptedOracle::new(
        VISUAL_GRID,
        vec!["complete nonsense with no json at all", PAGE_CF100_COLOR1],
    ));
    let err = extract_order(&doc(2), &oracle, &fast_config())
        .await
        .expect_err("first page failure must be fatal");
    assert!(err.to_string().contains("First page"));
}

#[tokio::test]
async fn later_page_failure_degrades_and_continues() {
    let oracle: OracleHandle = Arc::new(ScriptedOracle::new(
        VISUAL_GRID,
        vec![PAGE_CF100_COLOR1, "no json markers anywhere here"],
    ));
    let output = extract_order(&doc(2), &oracle, &fast_config())
        .await
        .expect("later failures are non-fatal");

    assert_eq!(output.products.len(), 1, "page 1 data survives");
    assert_eq!(output.metadata.failed_pages, vec![2]);
    assert_eq!(output.pages[1].products_found, 0);
    assert!(output.pages[1].error.is_some());
    assert_eq!(output.pages[1].quality, 0.0);
}

#[tokio::test]
async fn emergency_recovery_synthesises_from_bare_codes() {
    // Scenario C on page 2: three material_code occurrences, no JSON.
    let page2 = r#"model rambling "material_code": "AB1234" and
"material_code": "AB1234" also "material_code": "AB1234" the end"#;
    let oracle: OracleHandle = Arc::new(ScriptedOracle::new(
        VISUAL_GRID,
        vec![PAGE_CF100_COLOR1, page2],
    ));
    let output = extract_order(&doc(2), &oracle, &fast_config())
        .await
        .expect("emergency recovery keeps the page");

    assert_eq!(output.pages[1].recovery, RecoveryMethod::EmergencyRecovery);
    assert_eq!(output.pages[1].products_found, 3);
    assert_eq!(output.metadata.recovered_pages, vec![2]);

    // Placeholders consolidate into one AB1234 product (same code).
    let ab = output
        .products
        .iter()
        .find(|p| p.material_code == "AB1234")
        .expect("placeholder product present");
    assert_eq!(ab.colors[0].sizes[0].size, "UN");
}

#[tokio::test]
async fn quality_collapse_switches_strategy() {
    // Page 1 fine, page 2 empty products → quality 0 → fallback edge for
    // page 3 (structured_table → adaptive_hybrid).
    let empty = r#"```json
{"products": [], "order_info": {}}
```"#;
    let oracle: OracleHandle = Arc::new(ScriptedOracle::new(
        VISUAL_GRID,
        vec![PAGE_CF100_COLOR1, empty, PAGE_CF100_COLOR2],
    ));
    let output = extract_order(&doc(3), &oracle, &fast_config())
        .await
        .expect("extraction succeeds");

    assert_eq!(output.pages[0].strategy, "structured_table");
    assert_eq!(output.pages[1].strategy, "structured_table");
    assert_eq!(
        output.pages[2].strategy, "adaptive_hybrid",
        "page 3 must run under the fallback strategy"
    );
    assert!(output.metadata.strategy_adaptations >= 1);
    assert_eq!(output.metadata.final_strategy, "adaptive_hybrid");
}

#[tokio::test]
async fn good_quality_keeps_strategy() {
    let oracle: OracleHandle = Arc::new(ScriptedOracle::new(
        VISUAL_GRID,
        vec![PAGE_CF100_COLOR1, PAGE_CF100_COLOR2],
    ));
    let output = extract_order(&doc(2), &oracle, &fast_config())
        .await
        .expect("extraction succeeds");
    assert_eq!(output.metadata.strategy_adaptations, 0);
    assert!(output.pages.iter().all(|p| p.strategy == "structured_table"));
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_returns_partial_results() {
    struct CancelAfterFirstPage {
        token: ordervision::CancelToken,
    }
    impl ordervision::ExtractionProgressCallback for CancelAfterFirstPage {
        fn on_page_complete(&self, _page: usize, _total: usize, _products: usize, _q: f64) {
            self.token.cancel();
        }
    }

    let token = ordervision::CancelToken::new();
    let config = ExtractionConfig::builder()
        .retry_backoff_ms(1)
        .cancel_token(token.clone())
        .progress_callback(Arc::new(CancelAfterFirstPage {
            token: token.clone(),
        }))
        .build()
        .expect("valid config");

    let oracle: OracleHandle = Arc::new(ScriptedOracle::new(
        VISUAL_GRID,
        vec![PAGE_CF100_COLOR1, PAGE_CF100_COLOR2, PAGE_CF100_COLOR2],
    ));
    let output = extract_order(&doc(3), &oracle, &config)
        .await
        .expect("cancellation is not an error");

    assert!(output.metadata.cancelled);
    assert_eq!(output.metadata.pages_processed, 1, "only page 1 ran");
    assert_eq!(output.products.len(), 1, "completed work is kept");
}

// ── Corrective re-extraction ─────────────────────────────────────────────────

/// A page that parses but scores terribly: junk codes, no names, no
/// colour codes, no prices.
const PAGE_LOW_CONFIDENCE: &str = r#"```json
{"products": [
  {"name": "", "material_code": "??x",
   "colors": [{"color_code": "", "sizes": [{"size": "M", "quantity": 1}]}]},
  {"name": "", "material_code": "!!z",
   "colors": [{"color_code": "", "sizes": [{"size": "L", "quantity": 2}]}]}
],
"order_info": {}}
```"#;

#[tokio::test]
async fn low_confidence_triggers_bounded_corrective_retry() {
    let corrective = PAGE_CF100_COLOR1;
    let scripted = ScriptedOracle::new(VISUAL_GRID, vec![PAGE_LOW_CONFIDENCE])
        .with_corrective(corrective);
    let oracle_ref = Arc::new(scripted);
    let oracle: OracleHandle = oracle_ref.clone();

    let config = ExtractionConfig::builder()
        .retry_backoff_ms(1)
        .max_validation_retries(1)
        .build()
        .expect("valid config");

    let output = extract_order(&doc(1), &oracle, &config)
        .await
        .expect("extraction succeeds");

    assert_eq!(
        oracle_ref.corrective_calls.load(Ordering::SeqCst),
        1,
        "exactly one corrective pass for one page"
    );
    assert_eq!(output.validation.retries_used, 1);
    // The corrective set scores higher and is kept.
    assert_eq!(output.products.len(), 1);
    assert_eq!(output.products[0].material_code, "CF100");
    assert!(output
        .validation
        .corrections
        .iter()
        .any(|c| c.contains("corrective set kept")));
}

#[tokio::test]
async fn corrective_retry_keeps_original_when_candidate_is_worse() {
    let scripted = ScriptedOracle::new(VISUAL_GRID, vec![PAGE_LOW_CONFIDENCE])
        .with_corrective("still complete garbage, no json");
    let oracle_ref = Arc::new(scripted);
    let oracle: OracleHandle = oracle_ref.clone();

    let output = extract_order(&doc(1), &oracle, &fast_config())
        .await
        .expect("extraction succeeds");

    assert_eq!(output.validation.retries_used, 1);
    // Original junk retained as fallback rather than dropped.
    assert_eq!(output.products.len(), 2);
    assert!(output
        .validation
        .corrections
        .iter()
        .any(|c| c.contains("corrective set discarded")));
}

#[tokio::test]
async fn high_confidence_never_triggers_corrective_retry() {
    let scripted =
        ScriptedOracle::new(VISUAL_GRID, vec![PAGE_CF100_COLOR1]).with_corrective(PAGE_CF100_COLOR1);
    let oracle_ref = Arc::new(scripted);
    let oracle: OracleHandle = oracle_ref.clone();

    let output = extract_order(&doc(1), &oracle, &fast_config())
        .await
        .expect("extraction succeeds");

    assert_eq!(oracle_ref.corrective_calls.load(Ordering::SeqCst), 0);
    assert_eq!(output.validation.retries_used, 0);
}

// ── Oracle failure handling ──────────────────────────────────────────────────

#[tokio::test]
async fn transient_oracle_errors_are_retried_per_page() {
    /// Fails the first extraction call, then delegates to the script.
    struct FlakyFirstCall {
        inner: ScriptedOracle,
        failed_once: AtomicUsize,
    }

    #[async_trait]
    impl VisionOracle for FlakyFirstCall {
        async fn describe(&self, prompt: &str, image: &ImageData) -> Result<String, OracleError> {
            if !prompt.contains("VISUAL LAYOUT ANALYSIS")
                && self.failed_once.fetch_add(1, Ordering::SeqCst) == 0
            {
                return Err(OracleError::Api("503 overloaded".into()));
            }
            self.inner.describe(prompt, image).await
        }
    }

    let oracle: OracleHandle = Arc::new(FlakyFirstCall {
        inner: ScriptedOracle::new(VISUAL_GRID, vec![PAGE_CF100_COLOR1]),
        failed_once: AtomicUsize::new(0),
    });

    let output = extract_order(&doc(1), &oracle, &fast_config())
        .await
        .expect("retry should recover the page");
    assert_eq!(output.products.len(), 1);
    assert_eq!(output.pages[0].retries, 1);
}

// ── Performance registry across documents ────────────────────────────────────

#[tokio::test]
async fn shared_registry_accumulates_across_documents() {
    let registry = Arc::new(ordervision::PerformanceRegistry::new());
    let config = ExtractionConfig::builder()
        .retry_backoff_ms(1)
        .performance(registry.clone())
        .build()
        .expect("valid config");

    for _ in 0..2 {
        let oracle: OracleHandle = Arc::new(ScriptedOracle::new(
            VISUAL_GRID,
            vec![PAGE_CF100_COLOR1, PAGE_CF100_COLOR2],
        ));
        extract_order(&doc(2), &oracle, &config)
            .await
            .expect("extraction succeeds");
    }

    let snapshot = registry.snapshot();
    let samples = snapshot
        .get("structured_table")
        .expect("table strategy recorded");
    assert_eq!(samples.len(), 4, "two documents × two pages");
    assert!(samples.iter().all(|q| *q > 0.9));
}
