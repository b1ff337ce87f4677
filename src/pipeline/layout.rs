//! Document layout analysis: three independent signals, one verdict.
//!
//! Layout detection drives strategy selection, so it deliberately does not
//! trust any single source:
//!
//! * **Technical** — geometry of the renderer's positioned text elements:
//!   1-D tolerance clustering of x-coordinates to count columns, row-spacing
//!   regularity via coefficient of variation, number grids, header keywords,
//!   repeated line signatures.
//! * **Visual** — one oracle call with a layout-classification prompt over
//!   the first page image.
//! * **Content** — regex densities over the plain text: product-code,
//!   size and price token counts, tabular line ratio, line-length
//!   consistency.
//!
//! Each signal adds weighted bonuses to the six candidate layout types and
//! [`determine_layout`] picks the winner. Any analyzer failure is captured
//! as an error-scored signal with zero weight; even total failure yields a
//! neutral hybrid analysis at confidence 0.3 — analysis never aborts a
//! document.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::model::{PageImage, TextElement};
use crate::oracle::{call_with_retry, OracleHandle};
use crate::pipeline::recovery;
use crate::prompts;
use crate::reference::HEADER_KEYWORDS;

/// The six candidate layout types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LayoutType {
    GridTabular,
    ListVertical,
    ListHorizontal,
    HybridMixed,
    FormFields,
    FreeText,
}

impl LayoutType {
    pub const ALL: [LayoutType; 6] = [
        LayoutType::GridTabular,
        LayoutType::ListVertical,
        LayoutType::ListHorizontal,
        LayoutType::HybridMixed,
        LayoutType::FormFields,
        LayoutType::FreeText,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LayoutType::GridTabular => "GRID_TABULAR",
            LayoutType::ListVertical => "LIST_VERTICAL",
            LayoutType::ListHorizontal => "LIST_HORIZONTAL",
            LayoutType::HybridMixed => "HYBRID_MIXED",
            LayoutType::FormFields => "FORM_FIELDS",
            LayoutType::FreeText => "FREE_TEXT",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        LayoutType::ALL
            .into_iter()
            .find(|l| l.as_str() == label.trim().to_uppercase())
    }
}

impl std::fmt::Display for LayoutType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signal that either produced data or failed with a reason.
/// Failed signals contribute zero weight to scoring.
pub type SignalResult<T> = Result<T, String>;

// ── Technical signal ─────────────────────────────────────────────────────

/// Column structure from x-coordinate clustering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnDetection {
    pub column_count: usize,
    /// Fraction of elements falling into significant clusters.
    pub confidence: f64,
    pub positions: Vec<f64>,
}

/// Row structure from y-spacing statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowDetection {
    pub row_count: usize,
    pub confidence: f64,
    pub avg_spacing: f64,
    pub spacing_regularity: f64,
    pub height_consistency: f64,
}

/// Left-edge alignment strength.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlignmentAnalysis {
    pub alignment_groups: usize,
    pub alignment_confidence: f64,
    pub strongest_alignment: usize,
}

/// A concrete hint that the page is a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableIndicator {
    NumberGrid {
        confidence: f64,
        columns: usize,
        rows: usize,
    },
    TableHeaders {
        confidence: f64,
        headers_found: usize,
    },
    RepetitiveStructure {
        confidence: f64,
        repetitions: usize,
    },
}

/// Output of the geometric analyzer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TechnicalSignal {
    pub columns: ColumnDetection,
    pub rows: RowDetection,
    pub alignment: AlignmentAnalysis,
    pub indicators: Vec<TableIndicator>,
}

/// x-cluster tolerance in page units.
const COLUMN_TOLERANCE: f64 = 10.0;
/// Alignment-group tolerance, tighter than column clustering.
const ALIGN_TOLERANCE: f64 = 5.0;
/// Minimum occurrences for a cluster to count.
const MIN_CLUSTER_SIZE: usize = 3;

/// Analyse the positioned text elements of a page.
pub fn analyze_technical(elements: &[TextElement]) -> SignalResult<TechnicalSignal> {
    if elements.is_empty() {
        return Err("no positioned text elements available".into());
    }

    let lines = group_lines(elements);

    Ok(TechnicalSignal {
        columns: detect_columns(elements),
        rows: detect_rows(&lines),
        alignment: analyze_alignment(elements),
        indicators: detect_table_indicators(elements, &lines),
    })
}

/// A reconstructed text line: elements sharing a y band, joined in x order.
#[derive(Debug, Clone)]
struct Line {
    y: f64,
    height: f64,
    text: String,
}

fn group_lines(elements: &[TextElement]) -> Vec<Line> {
    const LINE_TOLERANCE: f64 = 3.0;

    let mut sorted: Vec<&TextElement> = elements.iter().collect();
    sorted.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));

    let mut lines: Vec<(f64, f64, Vec<&TextElement>)> = Vec::new();
    for el in sorted {
        match lines.last_mut() {
            Some((y, _, members)) if (el.y - *y).abs() <= LINE_TOLERANCE => {
                members.push(el);
            }
            _ => lines.push((el.y, el.height, vec![el])),
        }
    }

    lines
        .into_iter()
        .map(|(y, height, members)| {
            let mut members = members;
            members.sort_by(|a, b| a.x.total_cmp(&b.x));
            let text = members
                .iter()
                .map(|e| e.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            Line { y, height, text }
        })
        .filter(|l| !l.text.is_empty())
        .collect()
}

fn detect_columns(elements: &[TextElement]) -> ColumnDetection {
    let mut xs: Vec<f64> = elements.iter().map(|e| e.x).collect();
    xs.sort_by(f64::total_cmp);

    // 1-D tolerance clustering with a running centre.
    struct Cluster {
        center: f64,
        sum: f64,
        count: usize,
    }
    let mut clusters: Vec<Cluster> = Vec::new();
    for x in xs {
        match clusters
            .iter_mut()
            .find(|c| (x - c.center).abs() <= COLUMN_TOLERANCE)
        {
            Some(c) => {
                c.sum += x;
                c.count += 1;
                c.center = c.sum / c.count as f64;
            }
            None => clusters.push(Cluster {
                center: x,
                sum: x,
                count: 1,
            }),
        }
    }

    let significant: Vec<&Cluster> = clusters.iter().filter(|c| c.count >= MIN_CLUSTER_SIZE).collect();
    let clustered: usize = significant.iter().map(|c| c.count).sum();
    let confidence = clustered as f64 / elements.len() as f64;

    ColumnDetection {
        column_count: significant.len(),
        confidence,
        positions: significant.iter().map(|c| c.center).collect(),
    }
}

fn detect_rows(lines: &[Line]) -> RowDetection {
    if lines.is_empty() {
        return RowDetection::default();
    }

    let mut ys: Vec<f64> = lines.iter().map(|l| l.y + l.height / 2.0).collect();
    ys.sort_by(f64::total_cmp);

    let spacings: Vec<f64> = ys.windows(2).map(|w| w[1] - w[0]).collect();
    if spacings.is_empty() {
        return RowDetection {
            row_count: lines.len(),
            ..Default::default()
        };
    }

    let avg = spacings.iter().sum::<f64>() / spacings.len() as f64;
    let variance = spacings.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / spacings.len() as f64;
    let cv = if avg > 0.0 { variance.sqrt() / avg } else { 1.0 };
    let spacing_regularity = (1.0 - cv).max(0.0);

    let heights: Vec<f64> = lines.iter().map(|l| l.height).collect();
    let avg_height = heights.iter().sum::<f64>() / heights.len() as f64;
    let spread = heights.iter().cloned().fold(f64::MIN, f64::max)
        - heights.iter().cloned().fold(f64::MAX, f64::min);
    let height_consistency = if avg_height > 0.0 {
        (1.0 - spread / avg_height).max(0.0)
    } else {
        0.0
    };

    RowDetection {
        row_count: lines.len(),
        confidence: (spacing_regularity + height_consistency) / 2.0,
        avg_spacing: avg,
        spacing_regularity,
        height_consistency,
    }
}

fn analyze_alignment(elements: &[TextElement]) -> AlignmentAnalysis {
    let mut groups: Vec<(f64, usize)> = Vec::new();
    for el in elements {
        match groups
            .iter_mut()
            .find(|(x, _)| (el.x - *x).abs() <= ALIGN_TOLERANCE)
        {
            Some((_, count)) => *count += 1,
            None => groups.push((el.x, 1)),
        }
    }

    let significant: Vec<usize> = groups
        .iter()
        .filter(|(_, c)| *c >= MIN_CLUSTER_SIZE)
        .map(|(_, c)| *c)
        .collect();
    let aligned: usize = significant.iter().sum();

    AlignmentAnalysis {
        alignment_groups: significant.len(),
        alignment_confidence: aligned as f64 / elements.len() as f64,
        strongest_alignment: significant.iter().copied().max().unwrap_or(0),
    }
}

static RE_WORDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z]+").unwrap());
static RE_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static RE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn detect_table_indicators(elements: &[TextElement], lines: &[Line]) -> Vec<TableIndicator> {
    let mut indicators = Vec::new();

    // Numbers organised in a grid: bucket positions to 10-unit cells and
    // count distinct columns/rows holding numeric content.
    let number_positions: Vec<(i64, i64)> = elements
        .iter()
        .filter(|e| RE_DIGITS.is_match(&e.text))
        .map(|e| ((e.x / 10.0) as i64, (e.y / 10.0) as i64))
        .collect();

    if number_positions.len() > 10 {
        let unique_x = number_positions
            .iter()
            .map(|(x, _)| *x)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let unique_y = number_positions
            .iter()
            .map(|(_, y)| *y)
            .collect::<std::collections::HashSet<_>>()
            .len();
        if unique_x >= 3 && unique_y >= 3 {
            indicators.push(TableIndicator::NumberGrid {
                confidence: ((unique_x * unique_y) as f64 / 50.0).min(0.9),
                columns: unique_x,
                rows: unique_y,
            });
        }
    }

    // Header keywords in the first five lines.
    let headers_found = lines
        .iter()
        .take(5)
        .filter(|l| {
            let upper = l.text.to_uppercase();
            HEADER_KEYWORDS.iter().any(|k| upper.contains(k))
        })
        .count();
    if headers_found > 0 {
        indicators.push(TableIndicator::TableHeaders {
            confidence: (headers_found as f64 / 3.0).min(0.8),
            headers_found,
        });
    }

    // Repeated line signatures: words→TEXT, digits→NUM.
    let mut signature_counts: std::collections::HashMap<String, usize> = Default::default();
    for line in lines {
        let sig = RE_WORDS.replace_all(&line.text, "TEXT");
        let sig = RE_DIGITS.replace_all(&sig, "NUM");
        let sig = RE_SPACES.replace_all(&sig, " ").trim().to_string();
        if sig.len() > 10 {
            *signature_counts.entry(sig).or_insert(0) += 1;
        }
    }
    if let Some(max_rep) = signature_counts.values().copied().filter(|c| *c >= 3).max() {
        indicators.push(TableIndicator::RepetitiveStructure {
            confidence: (max_rep as f64 / 10.0).min(0.9),
            repetitions: max_rep,
        });
    }

    indicators
}

// ── Visual signal ────────────────────────────────────────────────────────

/// Three-level quality/density scale reported by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    High,
    #[default]
    Medium,
    Low,
}

impl Grade {
    fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "high" => Grade::High,
            "low" => Grade::Low,
            _ => Grade::Medium,
        }
    }
}

/// Document complexity as judged by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

impl Complexity {
    fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "simple" => Complexity::Simple,
            "complex" => Complexity::Complex,
            _ => Complexity::Moderate,
        }
    }
}

/// Structural flags from the visual classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuralElements {
    pub has_clear_grid: bool,
    pub has_headers: bool,
    pub has_dividing_lines: bool,
    pub alignment_quality: Grade,
    pub data_density: Grade,
    pub repetitive_patterns: bool,
}

/// Output of the oracle layout-classification call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualSignal {
    pub primary_layout: Option<LayoutType>,
    pub confidence: f64,
    pub structural: StructuralElements,
    pub complexity: Complexity,
}

/// Parse the oracle's classification response, tolerating missing or
/// hallucinated fields. Field-by-field with defaults rather than a strict
/// deserialize: a half-valid answer still carries signal.
pub fn parse_visual_response(raw: &str) -> SignalResult<VisualSignal> {
    let value =
        recovery::extract_json_object(raw).ok_or_else(|| "no JSON object in visual response".to_string())?;

    let primary_layout = value
        .get("primary_layout")
        .and_then(|v| v.as_str())
        .and_then(LayoutType::from_label);

    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0)
        .clamp(0.0, 1.0);

    let s = value.get("structural_elements");
    let flag = |key: &str| {
        s.and_then(|v| v.get(key))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };
    let grade = |key: &str| {
        s.and_then(|v| v.get(key))
            .and_then(|v| v.as_str())
            .map(Grade::from_label)
            .unwrap_or_default()
    };

    let complexity = value
        .get("extraction_hints")
        .and_then(|v| v.get("complexity_level"))
        .and_then(|v| v.as_str())
        .map(Complexity::from_label)
        .unwrap_or_default();

    Ok(VisualSignal {
        primary_layout,
        confidence,
        structural: StructuralElements {
            has_clear_grid: flag("has_clear_grid"),
            has_headers: flag("has_headers"),
            has_dividing_lines: flag("has_dividing_lines"),
            alignment_quality: grade("alignment_quality"),
            data_density: grade("data_density"),
            repetitive_patterns: flag("repetitive_patterns"),
        },
        complexity,
    })
}

/// Run the visual classification oracle call on the first page.
pub async fn analyze_visual(
    oracle: &OracleHandle,
    page: &PageImage,
    config: &ExtractionConfig,
) -> SignalResult<VisualSignal> {
    let (text, _) = call_with_retry(
        oracle,
        prompts::LAYOUT_CLASSIFICATION_PROMPT,
        &page.image,
        page.index + 1,
        config,
    )
    .await
    .map_err(|e| e.to_string())?;

    parse_visual_response(&text)
}

// ── Content signal ───────────────────────────────────────────────────────

/// Product-token densities in the plain text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductIndicators {
    pub product_codes_found: usize,
    pub sizes_found: usize,
    pub prices_found: usize,
    pub product_density: f64,
    pub has_product_structure: bool,
}

/// Tabular-text indicators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableTextIndicators {
    pub tabular_line_ratio: f64,
    pub header_lines_found: usize,
    pub has_table_structure: bool,
    pub table_confidence: f64,
}

/// General structure indicators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureIndicators {
    pub line_consistency: f64,
    pub pattern_repetitions: usize,
    pub structure_score: f64,
    pub is_structured: bool,
}

/// Output of the textual content analyzer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentSignal {
    pub product: ProductIndicators,
    pub table: TableTextIndicators,
    pub structure: StructureIndicators,
}

static RE_CODE_ALPHA: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,}\d{4,}\b").unwrap());
static RE_CODE_NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{8,}\b").unwrap());
static RE_CODE_HYBRID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]\d+[A-Z]*\b").unwrap());
static RE_SIZE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(XS|S|M|L|XL|XXL|XXXL|\d{2})\b").unwrap());
static RE_PRICE_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+[,.]\d{2}\b").unwrap());
static RE_WIDE_GAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{3,}").unwrap());

/// Analyse the plain text of the document's leading pages.
pub fn analyze_content(text: &str) -> SignalResult<ContentSignal> {
    if text.trim().is_empty() {
        return Err("no text layer available".into());
    }

    let lines: Vec<&str> = text.lines().collect();
    let non_empty: Vec<&str> = lines.iter().filter(|l| !l.trim().is_empty()).copied().collect();

    // Product tokens.
    let unique = |re: &Regex| -> usize {
        re.find_iter(text)
            .map(|m| m.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len()
    };
    let codes = unique(&RE_CODE_ALPHA) + unique(&RE_CODE_NUMERIC) + unique(&RE_CODE_HYBRID);
    let sizes = unique(&RE_SIZE_TOKEN);
    let prices = unique(&RE_PRICE_TOKEN);
    let product = ProductIndicators {
        product_codes_found: codes,
        sizes_found: sizes,
        prices_found: prices,
        product_density: codes as f64 / lines.len().max(1) as f64,
        has_product_structure: codes > 3 && sizes > 3,
    };

    // Tabular lines: at least two runs of 3+ spaces.
    let tabular_lines = lines
        .iter()
        .filter(|l| RE_WIDE_GAP.find_iter(l).count() >= 2)
        .count();
    let tabular_line_ratio = tabular_lines as f64 / lines.len().max(1) as f64;
    let header_lines_found = lines
        .iter()
        .take(10)
        .filter(|l| {
            let upper = l.to_uppercase();
            HEADER_KEYWORDS.iter().filter(|k| upper.contains(*k)).count() >= 2
        })
        .count();
    let table = TableTextIndicators {
        tabular_line_ratio,
        header_lines_found,
        has_table_structure: tabular_lines as f64 > lines.len() as f64 * 0.3,
        table_confidence: (tabular_line_ratio + header_lines_found as f64 * 0.2).min(1.0),
    };

    // Line-length consistency and repeated signatures.
    let lengths: Vec<f64> = non_empty.iter().map(|l| l.len() as f64).collect();
    let line_consistency = if lengths.is_empty() {
        0.0
    } else {
        let avg = lengths.iter().sum::<f64>() / lengths.len() as f64;
        let variance = lengths.iter().map(|l| (l - avg).powi(2)).sum::<f64>() / lengths.len() as f64;
        if avg > 0.0 {
            (1.0 - (variance.sqrt() / avg).min(1.0)).max(0.0)
        } else {
            0.0
        }
    };

    let mut signature_counts: std::collections::HashMap<String, usize> = Default::default();
    for line in &non_empty {
        let sig = RE_WORDS.replace_all(line, "W");
        let sig = RE_DIGITS.replace_all(&sig, "N");
        let sig = RE_SPACES.replace_all(&sig, " ").trim().to_string();
        if sig.len() > 5 {
            *signature_counts.entry(sig).or_insert(0) += 1;
        }
    }
    let pattern_repetitions = signature_counts.values().copied().max().unwrap_or(0);
    let structure_score =
        (line_consistency + (pattern_repetitions as f64 / 10.0).min(1.0)) / 2.0;
    let structure = StructureIndicators {
        line_consistency,
        pattern_repetitions,
        structure_score,
        is_structured: line_consistency > 0.5 || pattern_repetitions > 3,
    };

    Ok(ContentSignal {
        product,
        table,
        structure,
    })
}

// ── Combination ──────────────────────────────────────────────────────────

/// Any analysis whose best score falls below this is forced to
/// hybrid-mixed at exactly this confidence — never lower, never zero.
pub const CONFIDENCE_FLOOR: f64 = 0.3;

/// Per-document layout verdict. Computed once, read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutAnalysis {
    pub layout_type: LayoutType,
    pub confidence: f64,
    /// Raw per-type scores for observability.
    pub scores: Vec<(LayoutType, f64)>,
    pub technical: SignalResult<TechnicalSignal>,
    pub visual: SignalResult<VisualSignal>,
    pub content: SignalResult<ContentSignal>,
    /// Free-text hints folded into extraction prompts.
    pub hints: Vec<String>,
}

impl LayoutAnalysis {
    /// Neutral analysis used when every signal failed.
    pub fn fallback(reason: &str) -> Self {
        LayoutAnalysis {
            layout_type: LayoutType::HybridMixed,
            confidence: CONFIDENCE_FLOOR,
            scores: Vec::new(),
            technical: Err(reason.to_string()),
            visual: Err(reason.to_string()),
            content: Err(reason.to_string()),
            hints: vec!["Multiple strategies advised: layout detection was inconclusive".into()],
        }
    }

    /// Render the layout block spliced into extraction prompts.
    pub fn instruction_block(&self) -> String {
        let mut out = vec![
            "## DETECTED LAYOUT".to_string(),
            format!("- Type: {}", self.layout_type),
            format!("- Confidence: {:.2}", self.confidence),
        ];
        if let Ok(t) = &self.technical {
            if t.columns.column_count > 0 {
                out.push(format!("- Columns detected: {}", t.columns.column_count));
                if t.columns.column_count > 6 {
                    out.push(
                        "- Many columns: likely sizes organised horizontally".to_string(),
                    );
                }
            }
        }
        for hint in &self.hints {
            out.push(format!("- {hint}"));
        }
        out.join("\n")
    }
}

/// Combine the three signals into the final verdict.
///
/// Deterministic pure function of its inputs; the returned confidence is
/// never below [`CONFIDENCE_FLOOR`].
pub fn determine_layout(
    technical: &SignalResult<TechnicalSignal>,
    visual: &SignalResult<VisualSignal>,
    content: &SignalResult<ContentSignal>,
) -> LayoutAnalysis {
    use LayoutType::*;

    let mut scores: std::collections::HashMap<LayoutType, f64> =
        LayoutType::ALL.into_iter().map(|l| (l, 0.0)).collect();
    let add = |layout: LayoutType, amount: f64, scores: &mut std::collections::HashMap<LayoutType, f64>| {
        *scores.get_mut(&layout).expect("all layouts present") += amount;
    };

    if let Ok(t) = technical {
        if t.columns.column_count >= 5 {
            add(GridTabular, 0.3 * t.columns.confidence, &mut scores);
        } else if t.columns.column_count >= 2 {
            add(ListVertical, 0.2 * t.columns.confidence, &mut scores);
        }
        if t.rows.confidence > 0.7 {
            add(GridTabular, 0.2, &mut scores);
            add(ListVertical, 0.1, &mut scores);
        }
        if t.alignment.alignment_confidence > 0.8 {
            add(GridTabular, 0.2, &mut scores);
        }
        for indicator in &t.indicators {
            match indicator {
                TableIndicator::NumberGrid { confidence, .. } => {
                    add(GridTabular, 0.3 * confidence, &mut scores)
                }
                TableIndicator::TableHeaders { confidence, .. } => {
                    add(GridTabular, 0.2 * confidence, &mut scores)
                }
                TableIndicator::RepetitiveStructure { confidence, .. } => {
                    add(ListVertical, 0.2 * confidence, &mut scores)
                }
            }
        }
    }

    if let Ok(v) = visual {
        if let Some(primary) = v.primary_layout {
            add(primary, 0.4 * v.confidence, &mut scores);
        }
        if v.structural.has_clear_grid {
            add(GridTabular, 0.2, &mut scores);
        }
        if v.structural.repetitive_patterns {
            add(ListVertical, 0.1, &mut scores);
            add(GridTabular, 0.1, &mut scores);
        }
    }

    if let Ok(c) = content {
        if c.product.has_product_structure {
            add(GridTabular, 0.1, &mut scores);
            add(ListVertical, 0.1, &mut scores);
        }
        if c.table.has_table_structure {
            add(GridTabular, 0.2 * c.table.table_confidence, &mut scores);
        }
        if c.structure.is_structured {
            add(GridTabular, 0.1 * c.structure.structure_score, &mut scores);
            add(ListVertical, 0.1 * c.structure.structure_score, &mut scores);
        }
    }

    let mut ordered: Vec<(LayoutType, f64)> = LayoutType::ALL
        .into_iter()
        .map(|l| (l, scores[&l]))
        .collect();
    ordered.sort_by(|a, b| b.1.total_cmp(&a.1));

    let (mut layout_type, best_score) = ordered[0];
    let confidence = if best_score < CONFIDENCE_FLOOR {
        layout_type = HybridMixed;
        CONFIDENCE_FLOOR
    } else {
        best_score.min(0.95)
    };

    let hints = collect_hints(technical, visual, content);

    LayoutAnalysis {
        layout_type,
        confidence,
        scores: ordered,
        technical: technical.clone(),
        visual: visual.clone(),
        content: content.clone(),
        hints,
    }
}

fn collect_hints(
    technical: &SignalResult<TechnicalSignal>,
    visual: &SignalResult<VisualSignal>,
    content: &SignalResult<ContentSignal>,
) -> Vec<String> {
    let mut hints = Vec::new();
    if let Ok(t) = technical {
        for indicator in &t.indicators {
            match indicator {
                TableIndicator::NumberGrid { .. } => {
                    hints.push("Numeric grid detected: quantities likely live in a table".into())
                }
                TableIndicator::TableHeaders { .. } => {
                    hints.push("Table headers found: use them to map columns".into())
                }
                TableIndicator::RepetitiveStructure { .. } => {}
            }
        }
    }
    if let Ok(v) = visual {
        if v.structural.has_dividing_lines {
            hints.push("Dividing lines present: respect section boundaries".into());
        }
        if v.structural.data_density == Grade::High {
            hints.push("High data density: watch for overlapping fields".into());
        }
    }
    if let Ok(c) = content {
        if c.product.product_density > 0.1 {
            hints.push("High product-code density detected".into());
        }
    }
    hints
}

/// Full document analysis: run all three analyzers and combine.
///
/// Never fails — analyzer errors become zero-weight signals, and a
/// completely silent document yields [`LayoutAnalysis::fallback`].
pub async fn analyze_document(
    doc: &crate::model::DocumentInput,
    oracle: &OracleHandle,
    config: &ExtractionConfig,
) -> LayoutAnalysis {
    let Some(first_page) = doc.pages.first() else {
        return LayoutAnalysis::fallback("document has no pages");
    };

    let technical = analyze_technical(&first_page.elements);
    if let Err(reason) = &technical {
        debug!(%reason, "technical layout signal unavailable");
    }

    let visual = if config.skip_visual_analysis {
        Err("visual analysis disabled by config".to_string())
    } else {
        analyze_visual(oracle, first_page, config).await
    };
    if let Err(reason) = &visual {
        warn!(%reason, "visual layout signal unavailable");
    }

    let content = analyze_content(&doc.leading_text(3));
    if let Err(reason) = &content {
        debug!(%reason, "content layout signal unavailable");
    }

    let analysis = determine_layout(&technical, &visual, &content);
    info!(
        layout = %analysis.layout_type,
        confidence = analysis.confidence,
        "layout detected"
    );
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(text: &str, x: f64, y: f64) -> TextElement {
        TextElement {
            text: text.into(),
            x,
            y,
            width: 30.0,
            height: 10.0,
            font_size: 10.0,
        }
    }

    /// A 6-column, 8-row numeric grid with a header row.
    fn grid_elements() -> Vec<TextElement> {
        let mut els = Vec::new();
        let headers = ["MODEL", "COLOR", "SIZE", "QTY", "PRICE", "TOTAL"];
        for (col, h) in headers.iter().enumerate() {
            els.push(el(h, 50.0 + col as f64 * 80.0, 40.0));
        }
        for row in 0..8 {
            for col in 0..6 {
                els.push(el(
                    &format!("{}", 10 + row * col),
                    50.0 + col as f64 * 80.0,
                    60.0 + row as f64 * 15.0,
                ));
            }
        }
        els
    }

    #[test]
    fn technical_detects_grid_columns() {
        let signal = analyze_technical(&grid_elements()).expect("elements present");
        assert!(signal.columns.column_count >= 5, "got {:?}", signal.columns);
        assert!(signal.columns.confidence > 0.8);
        assert!(signal
            .indicators
            .iter()
            .any(|i| matches!(i, TableIndicator::NumberGrid { .. })));
        assert!(signal
            .indicators
            .iter()
            .any(|i| matches!(i, TableIndicator::TableHeaders { .. })));
    }

    #[test]
    fn technical_requires_elements() {
        assert!(analyze_technical(&[]).is_err());
    }

    #[test]
    fn content_detects_tabular_text() {
        let text = "MODEL   COLOR   SIZE   QTY\n\
                    CF5015E0624   001   38   1\n\
                    CF5016E0624   002   40   2\n\
                    CF5017E0624   003   42   1\n\
                    CF5018E0624   004   44   3\n\
                    total 79,00";
        let signal = analyze_content(text).expect("text present");
        assert!(signal.product.product_codes_found > 3);
        assert!(signal.table.tabular_line_ratio > 0.5);
    }

    #[test]
    fn content_requires_text() {
        assert!(analyze_content("   ").is_err());
    }

    #[test]
    fn determine_layout_is_deterministic() {
        let technical = analyze_technical(&grid_elements());
        let visual: SignalResult<VisualSignal> = Ok(VisualSignal {
            primary_layout: Some(LayoutType::GridTabular),
            confidence: 0.9,
            structural: StructuralElements {
                has_clear_grid: true,
                has_headers: true,
                ..Default::default()
            },
            complexity: Complexity::Simple,
        });
        let content: SignalResult<ContentSignal> = Err("none".into());

        let a = determine_layout(&technical, &visual, &content);
        let b = determine_layout(&technical, &visual, &content);
        assert_eq!(a.layout_type, b.layout_type);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.layout_type, LayoutType::GridTabular);
    }

    #[test]
    fn all_signals_failed_floors_at_hybrid() {
        let technical: SignalResult<TechnicalSignal> = Err("x".into());
        let visual: SignalResult<VisualSignal> = Err("y".into());
        let content: SignalResult<ContentSignal> = Err("z".into());
        let analysis = determine_layout(&technical, &visual, &content);
        assert_eq!(analysis.layout_type, LayoutType::HybridMixed);
        assert_eq!(analysis.confidence, CONFIDENCE_FLOOR);
    }

    #[test]
    fn confidence_never_below_floor() {
        // A single weak signal still floors at 0.3.
        let technical: SignalResult<TechnicalSignal> = Ok(TechnicalSignal::default());
        let visual: SignalResult<VisualSignal> = Ok(VisualSignal {
            primary_layout: Some(LayoutType::FreeText),
            confidence: 0.1,
            ..Default::default()
        });
        let content: SignalResult<ContentSignal> = Err("none".into());
        let analysis = determine_layout(&technical, &visual, &content);
        assert!(analysis.confidence >= CONFIDENCE_FLOOR);
    }

    #[test]
    fn visual_response_parses_leniently() {
        let raw = r#"```json
{"primary_layout": "LIST_VERTICAL", "confidence": 0.75,
 "structural_elements": {"has_headers": true, "alignment_quality": "high",
 "hallucinated_field": 42},
 "extraction_hints": {"complexity_level": "complex"}}
```"#;
        let v = parse_visual_response(raw).expect("parses");
        assert_eq!(v.primary_layout, Some(LayoutType::ListVertical));
        assert_eq!(v.confidence, 0.75);
        assert!(v.structural.has_headers);
        assert!(!v.structural.has_clear_grid);
        assert_eq!(v.structural.alignment_quality, Grade::High);
        assert_eq!(v.complexity, Complexity::Complex);
    }

    #[test]
    fn visual_response_without_json_is_error() {
        assert!(parse_visual_response("the layout looks tabular to me").is_err());
    }
}
