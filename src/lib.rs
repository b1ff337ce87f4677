//! # ordervision
//!
//! Extract structured line items from multi-page commercial order documents
//! using Vision Language Models (VLMs).
//!
//! ## Why this crate?
//!
//! Supplier order sheets are tables only a human (or a vision model) can
//! read: sizes in one row, quantities in the next, colour variants split
//! across pages, and every brand with its own layout. Classic text
//! extraction garbles them. Instead this crate sends each rendered page to
//! a vision oracle and treats the oracle as what it is — an unreliable,
//! non-deterministic text generator — recovering structured products from
//! whatever comes back.
//!
//! ## Pipeline Overview
//!
//! ```text
//! pages
//!  │
//!  ├─ 1. Layout    three-signal analysis (geometry, visual oracle, text)
//!  ├─ 2. Strategy  pick one of five extraction strategies per page
//!  ├─ 3. Oracle    one vision call per page, retry + backoff
//!  ├─ 4. Recovery  5-stage JSON fallback chain, never trust the output
//!  ├─ 5. Adapt     measure page quality, switch strategy when it drops
//!  ├─ 6. Merge     consolidate variants by material code
//!  └─ 7. Score     per-field confidence + bounded corrective retry
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ordervision::{extract_order, DocumentInput, ExtractionConfig, GeminiOracle, OracleHandle};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Pages come from an external renderer (PDF → images).
//!     let doc = DocumentInput::new(vec![/* PageImage, … */]);
//!     let oracle: OracleHandle = Arc::new(GeminiOracle::from_env()?);
//!     let config = ExtractionConfig::default();
//!
//!     let output = extract_order(&doc, &oracle, &config).await?;
//!     println!("{} products", output.products.len());
//!     println!("confidence: {:.1}", output.validation.average_confidence);
//!     Ok(())
//! }
//! ```
//!
//! ## Failure model
//!
//! Only a total first-page failure is fatal. Every later page degrades to
//! an empty, error-tagged result; the JSON recovery chain, strategy
//! adaptation and the bounded corrective re-extraction always change
//! approach rather than blindly repeating. Partial results beat total
//! failure.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ordervision` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! ordervision = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod extract;
pub mod model;
pub mod oracle;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod reference;
pub mod sizes;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{BarcodeAssigner, CancelToken, ExtractionConfig, ExtractionConfigBuilder};
pub use error::{OracleError, OrderVisionError, PageError};
pub use extract::extract_order;
pub use model::{
    ColorVariant, ConfidenceLevel, ConfidenceScore, DocumentInput, ExtractionMetadata,
    ExtractionOutput, ImageData, LineReference, OrderInfo, PageExtraction, PageImage, PageOutcome,
    Product, RecoveryMethod, SizeQuantity, TextElement, ValidationReport,
};
pub use oracle::{GeminiOracle, OracleHandle, VisionOracle};
pub use pipeline::layout::{LayoutAnalysis, LayoutType};
pub use pipeline::strategy::PerformanceRegistry;
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{extract_stream, PageStream, StreamedPage};
