//! Configuration types for order extraction.
//!
//! All pipeline behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. Keeping every knob in one struct
//! makes it trivial to share configs across jobs, log them, and diff two
//! runs to understand why their outputs differ.
//!
//! # Design choice: builder over constructor
//! A dozen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest.

use crate::error::OrderVisionError;
use crate::model::Product;
use crate::pipeline::strategy::PerformanceRegistry;
use crate::progress::ProgressCallback;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation signal, checked between pages.
///
/// Cancelling never discards work already done: the pipeline stops before
/// the next oracle call and consolidates the pages it has.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Optional external barcode assignment hook.
///
/// Failure is non-fatal: the consolidator logs and moves on.
pub trait BarcodeAssigner: Send + Sync {
    fn assign(&self, products: &mut [Product]) -> Result<(), String>;
}

/// Configuration for a document extraction.
///
/// Built via [`ExtractionConfig::builder()`] or
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use ordervision::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .max_retries(2)
///     .oracle_timeout_secs(90)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Maximum retry attempts on a transient oracle failure. Default: 3.
    ///
    /// Most 5xx and timeout errors are transient. Retrying 3 times catches
    /// the vast majority without blocking the pipeline for long. Auth
    /// errors are not retried — they surface immediately.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s.
    pub retry_backoff_ms: u64,

    /// Per-oracle-call timeout in seconds. Default: 60.
    pub oracle_timeout_secs: u64,

    /// Corrective re-extraction budget when the aggregate confidence is
    /// LOW. Default: 1.
    ///
    /// Each retry re-queries every page with a corrective prompt, so the
    /// budget is deliberately small; the better candidate set wins.
    pub max_validation_retries: u32,

    /// Markup applied when no supplier can be determined. Default: 2.73.
    pub default_markup: f64,

    /// Skip the visual (oracle) layout signal and rely on the technical
    /// and content analyzers only. Default: false.
    ///
    /// Saves one oracle call per document; the scorer treats the missing
    /// signal as an error with zero weight.
    pub skip_visual_analysis: bool,

    /// Progress callback. Default: none.
    pub progress_callback: Option<ProgressCallback>,

    /// Cross-document strategy performance registry. Default: none.
    ///
    /// Inject one shared registry per process to let strategy scoring
    /// learn across documents. Per-document behaviour never depends on it
    /// being present.
    pub performance: Option<Arc<PerformanceRegistry>>,

    /// External barcode assigner. Default: none.
    pub barcode_assigner: Option<Arc<dyn BarcodeAssigner>>,

    /// Cancellation signal checked between pages.
    pub cancel: CancelToken,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 500,
            oracle_timeout_secs: 60,
            max_validation_retries: 1,
            default_markup: crate::reference::DEFAULT_MARKUP,
            skip_visual_analysis: false,
            progress_callback: None,
            performance: None,
            barcode_assigner: None,
            cancel: CancelToken::new(),
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("oracle_timeout_secs", &self.oracle_timeout_secs)
            .field("max_validation_retries", &self.max_validation_retries)
            .field("default_markup", &self.default_markup)
            .field("skip_visual_analysis", &self.skip_visual_analysis)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn callback>"),
            )
            .field("performance", &self.performance.as_ref().map(|_| "<registry>"))
            .field(
                "barcode_assigner",
                &self.barcode_assigner.as_ref().map(|_| "<dyn assigner>"),
            )
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn oracle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.oracle_timeout_secs = secs.max(1);
        self
    }

    pub fn max_validation_retries(mut self, n: u32) -> Self {
        self.config.max_validation_retries = n;
        self
    }

    pub fn default_markup(mut self, markup: f64) -> Self {
        self.config.default_markup = markup;
        self
    }

    pub fn skip_visual_analysis(mut self, v: bool) -> Self {
        self.config.skip_visual_analysis = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    pub fn performance(mut self, registry: Arc<PerformanceRegistry>) -> Self {
        self.config.performance = Some(registry);
        self
    }

    pub fn barcode_assigner(mut self, assigner: Arc<dyn BarcodeAssigner>) -> Self {
        self.config.barcode_assigner = Some(assigner);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.config.cancel = token;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, OrderVisionError> {
        let c = &self.config;
        if c.default_markup <= 0.0 || !c.default_markup.is_finite() {
            return Err(OrderVisionError::InvalidConfig(format!(
                "default_markup must be a positive number, got {}",
                c.default_markup
            )));
        }
        if c.oracle_timeout_secs == 0 {
            return Err(OrderVisionError::InvalidConfig(
                "oracle_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}
