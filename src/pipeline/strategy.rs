//! Extraction strategies: registry, scoring, and quality-driven adaptation.
//!
//! A strategy is a named bundle of prompt instructions plus a
//! layout-compatibility profile. Five fixed strategies exist; selection is
//! scoring, not branching: every strategy gets a score from the layout
//! analysis, page history, and the cross-document performance registry,
//! and the highest total wins.
//!
//! Adaptation happens between pages. After each page the measured quality
//! (fraction of complete products) either keeps the current strategy
//! (`quality >= 0.3`) or moves to its fallback edge / a fresh selection
//! (`quality < 0.3`). The performance registry is advisory only: it nudges
//! future scores by ±0.05 but never overrides a per-page transition.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::model::{PerformanceSnapshot, Product};
use crate::pipeline::layout::{Complexity, Grade, LayoutAnalysis, LayoutType};

/// Approach category a strategy belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approach {
    Table,
    List,
    Hybrid,
    Form,
    Adaptive,
}

/// A named extraction approach. Immutable; drawn from [`registry`].
#[derive(Debug)]
pub struct Strategy {
    /// Stable identifier, also the performance-registry key.
    pub name: &'static str,
    /// Human-readable name used in prompts and logs.
    pub display_name: &'static str,
    pub base_confidence: f64,
    pub approach: Approach,
    /// Ordered instruction-key → text map rendered into prompts.
    pub instructions: &'static [(&'static str, &'static str)],
    /// Fixed fallback edge followed on poor quality, when present.
    pub fallback: Option<&'static str>,
}

/// The fixed strategy registry.
pub const fn registry() -> &'static [Strategy] {
    &[
        Strategy {
            name: "structured_table",
            display_name: "Structured Table Extraction",
            base_confidence: 0.9,
            approach: Approach::Table,
            instructions: &[
                ("scanning_method", "Process the table systematically row by row"),
                ("column_mapping", "Identify columns by position and headers"),
                ("cell_interpretation", "Empty cells mean data not available"),
                ("header_detection", "Use the first row to map the structure"),
                ("row_processing", "Keep a strict row-to-data correspondence"),
            ],
            fallback: Some("adaptive_hybrid"),
        },
        Strategy {
            name: "sequential_list",
            display_name: "Sequential List Extraction",
            base_confidence: 0.8,
            approach: Approach::List,
            instructions: &[
                ("item_detection", "Each line is an independent item"),
                ("data_parsing", "Extract data in order of appearance"),
                ("pattern_recognition", "Identify the repeating per-line pattern"),
                ("grouping_logic", "Group related data within the same line"),
                ("line_processing", "Process each complete line as a unit"),
            ],
            fallback: Some("adaptive_hybrid"),
        },
        Strategy {
            name: "adaptive_hybrid",
            display_name: "Adaptive Hybrid Extraction",
            base_confidence: 0.7,
            approach: Approach::Hybrid,
            instructions: &[
                ("section_analysis", "Analyse each section independently"),
                ("strategy_switching", "Adapt the method per document region"),
                ("pattern_detection", "Detect structure changes between sections"),
                ("multi_approach", "Combine techniques as needed"),
                ("validation", "Check consistency across sections"),
            ],
            fallback: Some("conservative_scan"),
        },
        Strategy {
            name: "form_field",
            display_name: "Form Field Extraction",
            base_confidence: 0.6,
            approach: Approach::Form,
            instructions: &[
                ("field_mapping", "Map fields by position and labels"),
                ("value_extraction", "Extract the value associated with each field"),
                ("label_recognition", "Use labels to identify data types"),
                ("field_validation", "Check field completeness"),
            ],
            fallback: Some("adaptive_hybrid"),
        },
        Strategy {
            name: "conservative_scan",
            display_name: "Conservative Scan Extraction",
            base_confidence: 0.4,
            approach: Approach::Adaptive,
            instructions: &[
                ("broad_scanning", "Use several techniques simultaneously"),
                ("safe_extraction", "Extract only data you are confident about"),
                ("multiple_passes", "Make several passes with different techniques"),
                ("verification", "Verify each extraction independently"),
            ],
            fallback: None,
        },
    ]
}

/// Find a strategy by its stable name.
pub fn strategy_by_name(name: &str) -> Option<&'static Strategy> {
    registry().iter().find(|s| s.name == name)
}

/// Fixed approach ↔ layout compatibility matrix.
fn compatibility(approach: Approach, layout: LayoutType) -> f64 {
    use LayoutType::*;
    match approach {
        Approach::Table => match layout {
            GridTabular => 0.4,
            ListVertical => 0.1,
            ListHorizontal => 0.2,
            HybridMixed => 0.2,
            FormFields => 0.0,
            FreeText => 0.0,
        },
        Approach::List => match layout {
            GridTabular => 0.1,
            ListVertical => 0.4,
            ListHorizontal => 0.3,
            HybridMixed => 0.2,
            FormFields => 0.1,
            FreeText => 0.0,
        },
        Approach::Hybrid => match layout {
            GridTabular => 0.2,
            ListVertical => 0.2,
            ListHorizontal => 0.2,
            HybridMixed => 0.4,
            FormFields => 0.2,
            FreeText => 0.1,
        },
        Approach::Form => match layout {
            GridTabular => 0.0,
            ListVertical => 0.1,
            ListHorizontal => 0.1,
            HybridMixed => 0.1,
            FormFields => 0.4,
            FreeText => 0.0,
        },
        Approach::Adaptive => match layout {
            GridTabular => 0.1,
            ListVertical => 0.1,
            ListHorizontal => 0.1,
            HybridMixed => 0.1,
            FormFields => 0.1,
            FreeText => 0.3,
        },
    }
}

// ── Performance registry ─────────────────────────────────────────────────

/// Bounded samples kept per strategy name.
const MAX_SAMPLES: usize = 10;
/// Averages above this earn a scoring bonus.
const GOOD_HISTORY: f64 = 0.8;
/// Averages below this earn a scoring penalty.
const POOR_HISTORY: f64 = 0.3;
/// Advisory nudge applied to future scores.
const HISTORY_NUDGE: f64 = 0.05;

/// Cross-document strategy performance memory.
///
/// Process-wide, injected explicitly (no implicit singleton), guarded by a
/// single mutex, bounded to the last [`MAX_SAMPLES`] quality samples per
/// strategy name. Purely advisory: it shifts scoring by ±0.05 and never
/// overrides a per-page transition.
#[derive(Debug, Default)]
pub struct PerformanceRegistry {
    samples: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl PerformanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one page's quality under a strategy.
    pub fn record(&self, strategy_name: &str, quality: f64) {
        let mut samples = self.samples.lock().expect("registry mutex poisoned");
        let ring = samples.entry(strategy_name.to_string()).or_default();
        ring.push_back(quality.clamp(0.0, 1.0));
        while ring.len() > MAX_SAMPLES {
            ring.pop_front();
        }
        debug!(strategy = strategy_name, quality, "performance recorded");
    }

    /// Advisory score adjustment for a strategy: +0.05 for a strong
    /// history, −0.05 for a weak one, 0 otherwise or with no samples.
    pub fn adjustment(&self, strategy_name: &str) -> f64 {
        let samples = self.samples.lock().expect("registry mutex poisoned");
        match samples.get(strategy_name) {
            Some(ring) if !ring.is_empty() => {
                let avg = ring.iter().sum::<f64>() / ring.len() as f64;
                if avg > GOOD_HISTORY {
                    HISTORY_NUDGE
                } else if avg < POOR_HISTORY {
                    -HISTORY_NUDGE
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Serialisable copy of the current samples.
    pub fn snapshot(&self) -> PerformanceSnapshot {
        let samples = self.samples.lock().expect("registry mutex poisoned");
        samples
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().copied().collect()))
            .collect()
    }

    /// Drop all samples.
    pub fn reset(&self) {
        self.samples.lock().expect("registry mutex poisoned").clear();
    }
}

// ── Page quality ─────────────────────────────────────────────────────────

/// Strategy switches exactly below this quality; `0.3` itself keeps.
pub const QUALITY_SWITCH_THRESHOLD: f64 = 0.3;

/// Measured quality of one page: the fraction of products that are
/// complete (name + ≥1 colour + ≥1 sized entry). Errors and empty pages
/// score zero.
pub fn page_quality(products: &[Product], has_error: bool) -> f64 {
    if has_error || products.is_empty() {
        return 0.0;
    }
    let complete = products.iter().filter(|p| p.is_complete()).count();
    complete as f64 / products.len() as f64
}

/// One page's `(strategy, quality)` record, kept per document.
#[derive(Debug, Clone)]
pub struct PageSample {
    pub strategy: String,
    pub quality: f64,
}

// ── Scoring and selection ────────────────────────────────────────────────

/// Score one strategy against the layout analysis and page history.
///
/// base confidence + layout-compatibility × detected-confidence +
/// column/row bonuses + complexity bonus + history-consistency bonus +
/// cross-document adjustment, clamped to `[0, 1]`.
pub fn score_strategy(
    strategy: &Strategy,
    analysis: &LayoutAnalysis,
    history: &[PageSample],
    performance: Option<&PerformanceRegistry>,
) -> f64 {
    let mut score = strategy.base_confidence;

    score += compatibility(strategy.approach, analysis.layout_type) * analysis.confidence;

    // Technical: column/row bonuses.
    if let Ok(t) = &analysis.technical {
        let cols = t.columns.column_count;
        let col_conf = t.columns.confidence;
        match strategy.approach {
            Approach::Table if cols >= 5 => score += 0.3 * col_conf,
            Approach::Table if cols >= 3 => score += 0.2 * col_conf,
            Approach::List if (2..=4).contains(&cols) => score += 0.2 * col_conf,
            _ => {}
        }
        if t.rows.confidence > 0.7 && strategy.approach == Approach::Table {
            score += 0.1;
        }
    }

    // Visual: structural-element bonuses.
    if let Ok(v) = &analysis.visual {
        match strategy.approach {
            Approach::Table => {
                if v.structural.has_clear_grid {
                    score += 0.2;
                }
                if v.structural.has_headers {
                    score += 0.1;
                }
                if v.structural.alignment_quality == Grade::High {
                    score += 0.1;
                }
            }
            Approach::List => {
                if v.structural.repetitive_patterns {
                    score += 0.2;
                }
                if v.structural.data_density != Grade::Low {
                    score += 0.1;
                }
            }
            Approach::Form => {
                if v.primary_layout == Some(LayoutType::FormFields) {
                    score += 0.3;
                }
            }
            _ => {}
        }

        // Complexity bonus.
        match v.complexity {
            Complexity::Complex => match strategy.approach {
                Approach::Hybrid | Approach::Adaptive => score += 0.15,
                _ => score -= 0.05,
            },
            Complexity::Simple => {
                if matches!(strategy.approach, Approach::Table | Approach::List) {
                    score += 0.1;
                }
            }
            Complexity::Moderate => {}
        }
        if v.structural.data_density == Grade::High && strategy.approach == Approach::Adaptive {
            score += 0.1;
        }
    }

    // Content: data-pattern bonuses.
    if let Ok(c) = &analysis.content {
        if c.table.has_table_structure {
            match strategy.approach {
                Approach::Table => score += 0.2 * c.table.table_confidence,
                Approach::Hybrid => score += 0.1 * c.table.table_confidence,
                _ => {}
            }
        }
        if c.product.has_product_structure
            && matches!(strategy.approach, Approach::Table | Approach::List)
        {
            score += 0.1;
        }
    }

    // History consistency: how this strategy did on recent pages of THIS
    // document.
    let recent: Vec<&PageSample> = history
        .iter()
        .rev()
        .filter(|s| s.strategy == strategy.name)
        .take(2)
        .collect();
    if !recent.is_empty() {
        let avg = recent.iter().map(|s| s.quality).sum::<f64>() / recent.len() as f64;
        if avg >= 0.7 {
            score += 0.1;
        } else if avg < QUALITY_SWITCH_THRESHOLD {
            score -= 0.1;
        }
    }

    // Cross-document learning, advisory only.
    if let Some(registry) = performance {
        score += registry.adjustment(strategy.name);
    }

    score.clamp(0.0, 1.0)
}

/// Pick the highest-scoring strategy for the current analysis.
pub fn select_strategy(
    analysis: &LayoutAnalysis,
    history: &[PageSample],
    performance: Option<&PerformanceRegistry>,
) -> &'static Strategy {
    let mut best: (&'static Strategy, f64) = (&registry()[0], f64::MIN);
    for strategy in registry() {
        let score = score_strategy(strategy, analysis, history, performance);
        debug!(strategy = strategy.name, score, "strategy scored");
        if score > best.1 {
            best = (strategy, score);
        }
    }
    info!(strategy = best.0.name, score = best.1, "strategy selected");
    best.0
}

/// Decide whether to switch strategy after a page.
///
/// `quality >= 0.3` keeps the current strategy (the boundary itself keeps).
/// Below it, the strategy's fixed fallback edge is followed when present,
/// otherwise the scorer is re-run for a fresh pick. Returns the new
/// strategy, or `None` to keep.
pub fn adapt_strategy(
    current: &'static Strategy,
    quality: f64,
    analysis: &LayoutAnalysis,
    history: &[PageSample],
    performance: Option<&PerformanceRegistry>,
) -> Option<&'static Strategy> {
    if quality >= QUALITY_SWITCH_THRESHOLD {
        return None;
    }

    warn!(
        strategy = current.name,
        quality, "low page quality, switching strategy"
    );

    if let Some(fallback_name) = current.fallback {
        if let Some(fallback) = strategy_by_name(fallback_name) {
            info!(from = current.name, to = fallback.name, "following fallback edge");
            return Some(fallback);
        }
    }

    let fresh = select_strategy(analysis, history, performance);
    // Re-selection may land on the failing strategy again; that is still a
    // switch event for the caller to log, worst case oscillating.
    Some(fresh)
}

/// Render the strategy block spliced into extraction prompts.
pub fn instruction_block(strategy: &Strategy) -> String {
    let mut out = vec![
        format!("## STRATEGY: {}", strategy.display_name.to_uppercase()),
        format!("Base confidence: {:.2}", strategy.base_confidence),
        String::new(),
        "### SPECIFIC INSTRUCTIONS:".to_string(),
    ];
    for (key, text) in strategy.instructions {
        let title = key
            .split('_')
            .map(|w| {
                let mut chars = w.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        out.push(format!("- {title}: {text}"));
    }
    out.join("\n")
}
