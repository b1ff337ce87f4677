//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! real-time events as the pipeline works through a document.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a Tokio broadcast channel, a WebSocket, a job record,
//! or a terminal progress bar — without the library knowing anything about
//! how the host application communicates. The trait is `Send + Sync` so the
//! same callback can serve several concurrent documents.

use std::sync::Arc;

/// Called by the extraction pipeline as it processes each page.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Pages within one document are strictly sequential,
/// but one callback instance may serve multiple documents at once —
/// implementations must protect shared mutable state.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once before any page is sent to the oracle.
    fn on_extraction_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before the oracle request is sent for a page.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page yields a usable (possibly partial) result.
    ///
    /// `products_found` is the count after sanitation; `quality` is the
    /// fraction of those products that are complete.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, products_found: usize, quality: f64) {
        let _ = (page_num, total_pages, products_found, quality);
    }

    /// Called when a page fails after the whole recovery chain.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: String) {
        let _ = (page_num, total_pages, error);
    }

    /// Called when the adapter switches strategy for the next page.
    fn on_strategy_change(&self, page_num: usize, from: &str, to: &str) {
        let _ = (page_num, from, to);
    }

    /// Called once after all pages have been attempted.
    fn on_extraction_complete(&self, total_pages: usize, products: usize) {
        let _ = (total_pages, products);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in
/// [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
