//! Validation layer: per-product confidence scoring and bounded correction.
//!
//! Scores are rule-based estimates (0–100), not oracle probabilities:
//! material-code format 25%, category validity 15%, colour completeness
//! 25%, size/quantity validity 25%, price plausibility 10%. The aggregate
//! (mean over products) buckets into HIGH ≥ 80 / MEDIUM 50–79 / LOW < 50.
//!
//! Default behaviour is flag-and-report. When the aggregate is LOW and
//! retry budget remains, a corrective re-extraction runs over every page
//! with a focus chosen from the recommendation text (sizes/quantities,
//! grouping, or generic-conservative); the original products are kept as
//! fallback and the candidate set only replaces them when it scores
//! higher. Every corrective action lands in the audit list.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::ExtractionConfig;
use crate::model::{
    ConfidenceLevel, ConfidenceScore, DocumentInput, IssueCount, OrderInfo, Product,
    ValidationReport,
};
use crate::oracle::{call_with_retry, OracleHandle};
use crate::pipeline::consolidate::{self, Consolidation};
use crate::pipeline::recovery;
use crate::prompts::{self, CorrectiveFocus};
use crate::reference;
use crate::sizes;

// ── Field scorers ────────────────────────────────────────────────────────

static RE_CODE_ALNUM_LONG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2,6}\d{4,12}[A-Z]{0,6}\d{0,6}$").unwrap());
static RE_CODE_NUMERIC_LONG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{8,15}$").unwrap());
static RE_CODE_SHORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{2,4}\d{2,6}$").unwrap());
static RE_CODE_MIXED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9]{6,20}$").unwrap());
static RE_CODE_ANY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9]{4,}$").unwrap());
static RE_COLOR_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3,8}$").unwrap());
static RE_COLOR_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z0-9]{3,8}$").unwrap());
static RE_VARIANT_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.\d+$").unwrap());

fn material_code_score(code: &str) -> f64 {
    let code = code.trim().to_uppercase();
    if code.len() < 3 {
        return 0.0;
    }
    if RE_CODE_ALNUM_LONG.is_match(&code) {
        95.0
    } else if RE_CODE_NUMERIC_LONG.is_match(&code) {
        85.0
    } else if RE_CODE_MIXED.is_match(&code) {
        75.0
    } else if RE_CODE_SHORT.is_match(&code) {
        60.0
    } else if RE_CODE_ANY.is_match(&code) {
        40.0
    } else {
        10.0
    }
}

fn category_score(category: Option<&str>) -> f64 {
    let Some(category) = category else { return 0.0 };
    let upper = category.trim().to_uppercase();
    if upper.is_empty() {
        return 0.0;
    }
    if reference::is_known_category(&upper) {
        return 100.0;
    }
    if reference::CATEGORIES
        .iter()
        .any(|known| upper.contains(known) || known.contains(upper.as_str()))
    {
        return 80.0;
    }
    const MAPPABLE: &[&str] = &[
        "MAGLIA", "KNIT", "SWEATER", "ABITO", "DRESS", "CAPPOTTO", "COAT", "JACKET", "PANTALONE",
        "PANT", "TROUSER", "CAMICIA", "SHIRT", "GONNA", "SKIRT",
    ];
    if MAPPABLE.iter().any(|k| upper.contains(k)) {
        return 70.0;
    }
    20.0
}

fn colors_score(product: &Product) -> f64 {
    if product.colors.is_empty() {
        return 0.0;
    }

    let mut total = 0.0;
    let mut valid = 0usize;
    for color in &product.colors {
        let mut score = 0.0;
        let code = color.color_code.trim().to_uppercase();
        if !code.is_empty() {
            if RE_COLOR_NUMERIC.is_match(&code) || RE_COLOR_ALNUM.is_match(&code) {
                score += 40.0;
            } else {
                score += 20.0;
            }
        }
        if color.color_name.trim().len() > 1 {
            score += 30.0;
        }
        if !color.sizes.is_empty() {
            score += 30.0;
        }
        if score > 50.0 {
            valid += 1;
            total += score;
        }
    }

    if valid == 0 {
        0.0
    } else {
        (total / valid as f64).min(100.0)
    }
}

fn sizes_score(product: &Product) -> f64 {
    let mut total = 0.0_f64;
    let mut valid = 0.0_f64;
    for color in &product.colors {
        for entry in &color.sizes {
            total += 1.0;
            let label = sizes::normalize_size(&entry.size);
            let size_ok = sizes::is_valid_size(&label, sizes::SizeSystem::Unknown);
            let quantity_ok = entry.quantity.is_finite() && entry.quantity > 0.0;
            if size_ok && quantity_ok {
                valid += 1.0;
            } else if size_ok || quantity_ok {
                valid += 0.5;
            }
        }
    }
    if total == 0.0 {
        0.0
    } else {
        (valid / total * 100.0).min(100.0)
    }
}

/// Price plausibility against the category → expected-price table.
///
/// A unit price inside the `[0.3×, 3.0×]` band scores full marks, outside
/// it a quarter; with no table anchor, presence alone counts. Sales price
/// contributes half a weight.
fn prices_score(product: &Product) -> f64 {
    if product.colors.is_empty() {
        return 0.0;
    }
    let expected = product
        .category
        .as_deref()
        .and_then(reference::expected_price);

    let mut total = 0.0_f64;
    let mut valid = 0.0_f64;
    for color in &product.colors {
        total += 1.0;
        if let Some(unit) = color.unit_price.filter(|p| p.is_finite() && *p > 0.0) {
            valid += match expected {
                Some(anchor) if unit >= 0.3 * anchor && unit <= 3.0 * anchor => 1.0,
                Some(_) => 0.25,
                None => 1.0,
            };
        }

        total += 0.5;
        if color.sales_price.filter(|p| p.is_finite() && *p > 0.0).is_some() {
            valid += 0.5;
        }
    }
    (valid / total * 100.0).min(100.0)
}

/// Score one product across all weighted fields.
pub fn score_product(product: &Product) -> ConfidenceScore {
    let material = material_code_score(&product.material_code);
    let category = category_score(product.category.as_deref());
    let colors = colors_score(product);
    let sizes = sizes_score(product);
    let prices = prices_score(product);

    let overall =
        material * 0.25 + category * 0.15 + colors * 0.25 + sizes * 0.25 + prices * 0.10;

    let mut issues = Vec::new();
    if material < 50.0 {
        issues.push(format!(
            "Suspicious material code: '{}'",
            product.material_code
        ));
    }
    if category < 80.0 {
        issues.push(format!(
            "Invalid or suspicious category: '{}'",
            product.category.as_deref().unwrap_or("")
        ));
    }
    if colors < 70.0 {
        issues.push(format!(
            "Colour problems: {} colours found",
            product.colors.len()
        ));
    }
    if sizes < 70.0 {
        issues.push("Size/quantity problems".to_string());
    }
    if prices < 50.0 {
        issues.push("Prices missing or implausible".to_string());
    }

    ConfidenceScore {
        material_code_score: material,
        category_score: category,
        colors_score: colors,
        sizes_score: sizes,
        prices_score: prices,
        overall_score: overall,
        level: ConfidenceLevel::from_score(overall),
        issues,
    }
}

// ── Aggregate report ─────────────────────────────────────────────────────

fn aggregate_score(scores: &[ConfidenceScore]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|s| s.overall_score).sum::<f64>() / scores.len() as f64
}

fn recommendations_for(products: &[Product], scores: &[ConfidenceScore]) -> Vec<String> {
    let mut recommendations = Vec::new();
    let avg = aggregate_score(scores);

    if avg < 70.0 {
        recommendations.push("Low overall confidence, review the extraction".to_string());
    }
    let low = scores.iter().filter(|s| s.overall_score < 50.0).count();
    if !scores.is_empty() && low as f64 > scores.len() as f64 * 0.3 {
        recommendations
            .push("Many low-confidence products, check source document quality".to_string());
    }

    let count_issue = |needle: &str| {
        scores
            .iter()
            .flat_map(|s| &s.issues)
            .filter(|i| i.contains(needle))
            .count()
    };
    if count_issue("material code") > 2 {
        recommendations.push("Verify material code patterns in the document".to_string());
    }
    if count_issue("Size/quantity") > 2 {
        recommendations.push("Verify size and quantity extraction".to_string());
    }
    if count_issue("Colour") > 2 {
        recommendations.push("Improve colour mapping".to_string());
    }
    if count_issue("Prices") > 2 {
        recommendations.push("Verify price formatting in the document".to_string());
    }

    // Several codes sharing a base modulo a `.N` suffix point at one
    // product split per colour.
    let mut base_counts: HashMap<String, usize> = HashMap::new();
    for p in products {
        let base = RE_VARIANT_SUFFIX.replace(&p.material_code, "").to_string();
        *base_counts.entry(base).or_insert(0) += 1;
    }
    if base_counts.values().any(|c| *c > 1) {
        recommendations
            .push("Group colour variants of the same product under one code".to_string());
    }

    if recommendations.is_empty() {
        recommendations.push("Good extraction quality, no action needed".to_string());
    }
    recommendations
}

/// Pick the corrective angle from the recommendation text.
pub fn choose_corrective_focus(recommendations: &[String]) -> CorrectiveFocus {
    let joined = recommendations.join(" ").to_lowercase();
    if joined.contains("size") || joined.contains("quantity") {
        CorrectiveFocus::SizesAndQuantities
    } else if joined.contains("group") || joined.contains("variant") || joined.contains("duplicate")
    {
        CorrectiveFocus::Grouping
    } else {
        CorrectiveFocus::Conservative
    }
}

fn build_report(
    products: &[Product],
    scores: &[ConfidenceScore],
    corrections: Vec<String>,
    retries_used: u32,
) -> ValidationReport {
    let average = aggregate_score(scores);
    let mut issue_counts: HashMap<&str, usize> = HashMap::new();
    for issue in scores.iter().flat_map(|s| &s.issues) {
        *issue_counts.entry(issue.as_str()).or_insert(0) += 1;
    }
    let mut common_issues: Vec<IssueCount> = issue_counts
        .into_iter()
        .map(|(issue, count)| IssueCount {
            issue: issue.to_string(),
            count,
        })
        .collect();
    common_issues.sort_by(|a, b| b.count.cmp(&a.count).then(a.issue.cmp(&b.issue)));
    common_issues.truncate(5);

    ValidationReport {
        total_products: scores.len(),
        average_confidence: average,
        level: ConfidenceLevel::from_score(average),
        high_confidence: scores.iter().filter(|s| s.overall_score >= 80.0).count(),
        medium_confidence: scores
            .iter()
            .filter(|s| s.overall_score >= 50.0 && s.overall_score < 80.0)
            .count(),
        low_confidence: scores.iter().filter(|s| s.overall_score < 50.0).count(),
        common_issues,
        recommendations: recommendations_for(products, scores),
        corrections,
        retries_used,
    }
}

fn attach_scores(products: &mut [Product]) -> Vec<ConfidenceScore> {
    let scores: Vec<ConfidenceScore> = products.iter().map(score_product).collect();
    for (product, score) in products.iter_mut().zip(scores.iter()) {
        product.validation = Some(score.clone());
    }
    scores
}

// ── Corrective re-extraction ─────────────────────────────────────────────

/// Re-extract every page with a corrective prompt and consolidate the
/// candidate set. Pages that fail are skipped; the candidate may be
/// smaller than the original.
async fn corrective_reextraction(
    focus: CorrectiveFocus,
    doc: &DocumentInput,
    oracle: &OracleHandle,
    order_info: &OrderInfo,
    config: &ExtractionConfig,
) -> Consolidation {
    let total_pages = doc.page_count();
    let mut products = Vec::new();

    for page in &doc.pages {
        if config.cancel.is_cancelled() {
            break;
        }
        let page_num = page.index + 1;
        let prompt = prompts::corrective_prompt(focus, page_num, total_pages);

        match call_with_retry(oracle, &prompt, &page.image, page_num, config).await {
            Ok((text, _)) => match recovery::recover_page(&text, page_num) {
                Ok(recovered) => products.extend(recovered.extraction.products),
                Err(e) => warn!(page = page_num, error = %e, "corrective page unparsable, skipping"),
            },
            Err(e) => warn!(page = page_num, error = %e, "corrective oracle call failed, skipping"),
        }
    }

    consolidate::consolidate(products, order_info, config)
}

/// Validated products plus the aggregate report.
pub struct ValidationOutcome {
    pub products: Vec<Product>,
    pub report: ValidationReport,
}

/// Score the consolidated products; when the aggregate is LOW and budget
/// remains, run a bounded corrective re-extraction and keep whichever
/// candidate set scores higher.
pub async fn validate_and_correct(
    consolidation: Consolidation,
    doc: &DocumentInput,
    oracle: &OracleHandle,
    order_info: &OrderInfo,
    config: &ExtractionConfig,
) -> ValidationOutcome {
    let mut products = consolidation.products;
    let mut scores = attach_scores(&mut products);
    let mut aggregate = aggregate_score(&scores);

    let mut corrections: Vec<String> = consolidation.anomalies.clone();
    let mut retries_used = 0u32;

    while aggregate < 50.0
        && !products.is_empty()
        && retries_used < config.max_validation_retries
        && !config.cancel.is_cancelled()
    {
        let recommendations = recommendations_for(&products, &scores);
        let focus = choose_corrective_focus(&recommendations);
        retries_used += 1;
        info!(
            aggregate,
            ?focus,
            retry = retries_used,
            "aggregate confidence LOW, running corrective re-extraction"
        );
        corrections.push(format!(
            "corrective re-extraction #{retries_used} with focus {focus:?} (aggregate {aggregate:.1})"
        ));

        let candidate = corrective_reextraction(focus, doc, oracle, order_info, config).await;
        let mut candidate_products = candidate.products;
        let candidate_scores = attach_scores(&mut candidate_products);
        let candidate_aggregate = aggregate_score(&candidate_scores);

        if candidate_aggregate > aggregate && !candidate_products.is_empty() {
            corrections.push(format!(
                "corrective set kept: {candidate_aggregate:.1} > {aggregate:.1}"
            ));
            products = candidate_products;
            scores = candidate_scores;
            aggregate = candidate_aggregate;
        } else {
            // Conservative: the original is retained as fallback.
            corrections.push(format!(
                "corrective set discarded: {candidate_aggregate:.1} <= {aggregate:.1}"
            ));
        }
    }

    let report = build_report(&products, &scores, corrections, retries_used);
    info!(
        products = products.len(),
        average = report.average_confidence,
        level = ?report.level,
        "validation complete"
    );

    ValidationOutcome { products, report }
}
