//! Eager (full-document) extraction entry point.
//!
//! Pages are strictly sequential: the strategy used for page N depends on
//! the measured quality of page N−1, so there is no intra-document page
//! parallelism to exploit. Oracle calls are the suspension points; a
//! cancellation token is checked between pages and already-completed pages
//! are consolidated into a valid partial result on cancellation.
//!
//! Failure policy: only a total first-page failure is fatal. Every later
//! page failure degrades to an empty, error-tagged page outcome and
//! processing continues — partial results beat total failure.

use std::time::Instant;
use tracing::{info, warn};

use crate::config::ExtractionConfig;
use crate::error::OrderVisionError;
use crate::model::{
    DocumentInput, ExtractionMetadata, ExtractionOutput, OrderInfo, PageExtraction, PageImage,
    PageOutcome, RecoveryMethod,
};
use crate::oracle::{call_with_retry, OracleHandle};
use crate::pipeline::layout::{self, LayoutAnalysis};
use crate::pipeline::strategy::{self, PageSample, Strategy};
use crate::pipeline::{consolidate, recovery, validate};
use crate::prompts;

/// Extract a full order document.
///
/// This is the primary entry point of the library.
///
/// # Errors
/// Returns `Err(OrderVisionError)` only for fatal conditions: an empty
/// document or a first page that fails oracle call and every recovery
/// stage. All other page failures are embedded in the output.
pub async fn extract_order(
    doc: &DocumentInput,
    oracle: &OracleHandle,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, OrderVisionError> {
    let started = Instant::now();
    let total_pages = doc.page_count();
    if total_pages == 0 {
        return Err(OrderVisionError::EmptyDocument);
    }
    info!(pages = total_pages, oracle = oracle.name(), "starting extraction");

    if let Some(cb) = &config.progress_callback {
        cb.on_extraction_start(total_pages);
    }

    let mut processor = PageProcessor::new(doc, oracle.clone(), config.clone()).await;

    let mut combined_products = Vec::new();
    let mut order_info = OrderInfo::default();
    let mut outcomes: Vec<PageOutcome> = Vec::new();
    let mut cancelled = false;

    for page in &doc.pages {
        if config.cancel.is_cancelled() {
            warn!(page = page.index + 1, "cancellation requested, stopping before page");
            cancelled = true;
            break;
        }

        let (outcome, extraction) = processor.process(page).await;

        // First-page total failure carries no anchor to continue from.
        if outcome.page == 1 && outcome.error.is_some() && extraction.products.is_empty() {
            let detail = outcome
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            return Err(OrderVisionError::FirstPageFailed { detail });
        }

        combined_products.extend(extraction.products);
        order_info.absorb(&extraction.order_info);
        outcomes.push(outcome);
    }

    let consolidation = consolidate::consolidate(combined_products, &order_info, config);
    order_info.supplier = Some(consolidation.supplier_name.clone());

    let validated = validate::validate_and_correct(
        consolidation,
        doc,
        oracle,
        &order_info,
        config,
    )
    .await;

    let metadata = ExtractionMetadata {
        pages_processed: outcomes.len(),
        final_strategy: processor.current.name.to_string(),
        strategy_adaptations: processor.adaptations,
        layout_type: processor.layout.layout_type.to_string(),
        layout_confidence: processor.layout.confidence,
        layout_scores: processor
            .layout
            .scores
            .iter()
            .map(|(l, s)| (l.to_string(), *s))
            .collect(),
        failed_pages: outcomes
            .iter()
            .filter(|o| o.error.is_some())
            .map(|o| o.page)
            .collect(),
        recovered_pages: outcomes
            .iter()
            .filter(|o| o.recovery != RecoveryMethod::Normal && o.error.is_none())
            .map(|o| o.page)
            .collect(),
        cancelled,
        processing_time_ms: started.elapsed().as_millis() as u64,
    };

    if let Some(cb) = &config.progress_callback {
        cb.on_extraction_complete(total_pages, validated.products.len());
    }

    info!(
        products = validated.products.len(),
        pages = metadata.pages_processed,
        strategy = %metadata.final_strategy,
        adaptations = metadata.strategy_adaptations,
        elapsed_ms = metadata.processing_time_ms,
        "extraction complete"
    );

    Ok(ExtractionOutput {
        products: validated.products,
        order_info,
        validation: validated.report,
        metadata,
        pages: outcomes,
    })
}

// ── Per-page machinery ───────────────────────────────────────────────────

/// Sequential page processor: owns the layout verdict, the current
/// strategy, and the per-document page history. Shared by the eager
/// [`extract_order`] and the streaming API.
pub(crate) struct PageProcessor {
    oracle: OracleHandle,
    config: ExtractionConfig,
    pub(crate) layout: LayoutAnalysis,
    pub(crate) current: &'static Strategy,
    history: Vec<PageSample>,
    /// Context without adaptation notes, rebuilt on strategy change.
    base_context: String,
    /// Context actually sent, possibly carrying a strategy-change block.
    context: String,
    total_pages: usize,
    products_so_far: usize,
    pub(crate) adaptations: usize,
}

impl PageProcessor {
    /// Analyse the document and pick the opening strategy.
    pub(crate) async fn new(
        doc: &DocumentInput,
        oracle: OracleHandle,
        config: ExtractionConfig,
    ) -> PageProcessor {
        let layout = layout::analyze_document(doc, &oracle, &config).await;
        let current = strategy::select_strategy(&layout, &[], config.performance.as_deref());
        let base_context = build_context(&layout, current);
        let context = base_context.clone();

        PageProcessor {
            oracle,
            config,
            layout,
            current,
            history: Vec::new(),
            base_context,
            context,
            total_pages: doc.page_count(),
            products_so_far: 0,
            adaptations: 0,
        }
    }

    /// Process one page end to end: prompt, oracle, recovery, quality
    /// measurement and strategy adaptation for the following page.
    ///
    /// Never returns an error — failures are embedded in the outcome with
    /// an empty extraction.
    pub(crate) async fn process(&mut self, page: &PageImage) -> (PageOutcome, PageExtraction) {
        let page_num = page.index + 1;
        let page_started = Instant::now();

        if let Some(cb) = &self.config.progress_callback {
            cb.on_page_start(page_num, self.total_pages);
        }

        let prompt = if page_num == 1 {
            prompts::first_page_prompt(&self.context, page_num, self.total_pages)
        } else {
            prompts::additional_page_prompt(
                &self.context,
                page_num,
                self.total_pages,
                self.products_so_far,
            )
        };

        let (extraction, recovery_method, retries, error) =
            match call_with_retry(&self.oracle, &prompt, &page.image, page_num, &self.config).await {
                Ok((text, retries)) => match recovery::recover_page(&text, page_num) {
                    Ok(recovered) => {
                        if !recovered.warnings.is_empty() {
                            warn!(
                                page = page_num,
                                warnings = recovered.warnings.len(),
                                "sanitation produced warnings"
                            );
                        }
                        (recovered.extraction, recovered.method, retries, None)
                    }
                    Err(e) => (
                        PageExtraction::default(),
                        RecoveryMethod::Normal,
                        retries,
                        Some(e),
                    ),
                },
                Err(e) => (
                    PageExtraction::default(),
                    RecoveryMethod::Normal,
                    self.config.max_retries as u8,
                    Some(e),
                ),
            };

        let quality = strategy::page_quality(&extraction.products, error.is_some());
        self.products_so_far += extraction.products.len();

        match &error {
            Some(e) => {
                warn!(page = page_num, error = %e, "page degraded to empty result");
                if let Some(cb) = &self.config.progress_callback {
                    cb.on_page_error(page_num, self.total_pages, e.to_string());
                }
            }
            None => {
                info!(
                    page = page_num,
                    products = extraction.products.len(),
                    quality,
                    strategy = self.current.name,
                    "page processed"
                );
                if let Some(cb) = &self.config.progress_callback {
                    cb.on_page_complete(
                        page_num,
                        self.total_pages,
                        extraction.products.len(),
                        quality,
                    );
                }
            }
        }

        let outcome = PageOutcome {
            page: page_num,
            products_found: extraction.products.len(),
            strategy: self.current.name.to_string(),
            recovery: recovery_method,
            quality,
            error,
            duration_ms: page_started.elapsed().as_millis() as u64,
            retries,
        };

        self.record_and_adapt(page_num, quality);

        (outcome, extraction)
    }

    /// Record the page's quality and adapt the strategy for the next page.
    fn record_and_adapt(&mut self, page_num: usize, quality: f64) {
        self.history.push(PageSample {
            strategy: self.current.name.to_string(),
            quality,
        });
        if let Some(registry) = &self.config.performance {
            registry.record(self.current.name, quality);
        }

        if page_num >= self.total_pages {
            return; // nothing left to adapt for
        }

        if let Some(next) = strategy::adapt_strategy(
            self.current,
            quality,
            &self.layout,
            &self.history,
            self.config.performance.as_deref(),
        ) {
            info!(from = self.current.name, to = next.name, page = page_num, "strategy adapted");
            if let Some(cb) = &self.config.progress_callback {
                cb.on_strategy_change(page_num + 1, self.current.name, next.name);
            }
            self.adaptations += 1;
            self.current = next;
            self.base_context = build_context(&self.layout, next);
            self.context = format!(
                "{}{}",
                self.base_context,
                prompts::strategy_change_block(
                    page_num + 1,
                    next.display_name,
                    &strategy::instruction_block(next),
                )
            );
        } else {
            // Keep the strategy; drop any stale adaptation note.
            self.context = self.base_context.clone();
        }
    }
}

/// Render the shared context block: layout verdict + strategy guidance.
fn build_context(layout: &LayoutAnalysis, strategy: &Strategy) -> String {
    format!(
        "{}\n\n{}\n\n## CRITICAL RULES:\n\
         - Follow the selected strategy rigorously\n\
         - Adapt if the structure changes between pages\n\
         - Extract only clearly visible data",
        layout.instruction_block(),
        strategy::instruction_block(strategy),
    )
}
