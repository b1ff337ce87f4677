//! Error types for the ordervision library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`OrderVisionError`] — **Fatal**: the extraction cannot proceed at all
//!   (no pages, invalid configuration, total first-page failure). Returned as
//!   `Err(OrderVisionError)` from the top-level `extract*` functions.
//!
//! * [`PageError`] — **Non-fatal**: a single page failed (oracle glitch,
//!   unrecoverable response) but all other pages are fine. Stored inside
//!   [`crate::model::PageOutcome`] so callers can inspect partial success
//!   rather than losing the whole document to one bad page.
//!
//! The only page failure promoted to fatal is the first page: a document
//! whose opening page yields nothing carries no anchor for strategy
//! adaptation or consolidation, so the job is marked failed outright.

use thiserror::Error;

/// All fatal errors returned by the ordervision library.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::model::PageOutcome`] rather than propagated here.
#[derive(Debug, Error)]
pub enum OrderVisionError {
    /// The document contains no pages to process.
    #[error("Document has no pages to process")]
    EmptyDocument,

    /// The first page failed after the full recovery chain.
    ///
    /// First-page failure is fatal by design: every later page degrades to
    /// an empty error-tagged result instead.
    #[error("First page failed, document cannot be extracted: {detail}")]
    FirstPageFailed { detail: String },

    /// Every page failed; there is nothing to consolidate.
    #[error("All {total} pages failed.\nFirst error: {first_error}")]
    AllPagesFailed { total: usize, first_error: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The oracle rejected its configuration (missing API key etc.).
    #[error("Oracle '{oracle}' is not configured.\n{hint}")]
    OracleNotConfigured { oracle: String, hint: String },

    /// Could not write the result file (CLI path).
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Stored alongside the page outcome when a page fails. The overall
/// extraction continues unless the FIRST page fails.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Oracle call failed after all retries.
    #[error("Page {page}: oracle call failed after {retries} retries: {detail}")]
    OracleFailed {
        page: usize,
        retries: u8,
        detail: String,
    },

    /// Oracle call timed out.
    #[error("Page {page}: oracle call timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The response text survived no stage of the recovery chain.
    #[error("Page {page}: response unparsable after all recovery stages: {detail}")]
    Malformed { page: usize, detail: String },
}

impl PageError {
    /// 1-indexed page this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::OracleFailed { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::Malformed { page, .. } => *page,
        }
    }
}

/// Errors produced by a [`crate::oracle::VisionOracle`] implementation.
///
/// Transient variants (`RateLimited`, `Timeout`, `Api`) are retried with
/// exponential backoff by the adapter; `Auth` is surfaced immediately since
/// retrying an invalid key never helps.
#[derive(Debug, Error)]
pub enum OracleError {
    /// The oracle API returned an error response.
    #[error("Oracle API error: {0}")]
    Api(String),

    /// The HTTP call timed out.
    #[error("Oracle call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// HTTP 429 — caller should back off.
    #[error("Oracle rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Authentication failure (401/403) — retry unlikely to help.
    #[error("Oracle authentication error: {0}")]
    Auth(String),
}

impl OracleError {
    /// Whether the retry loop should attempt this call again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OracleError::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_page_failed_display() {
        let e = OrderVisionError::FirstPageFailed {
            detail: "no JSON markers".into(),
        };
        assert!(e.to_string().contains("First page"));
        assert!(e.to_string().contains("no JSON markers"));
    }

    #[test]
    fn page_error_reports_page() {
        let e = PageError::Malformed {
            page: 4,
            detail: "x".into(),
        };
        assert_eq!(e.page(), 4);
        assert!(e.to_string().contains("Page 4"));
    }

    #[test]
    fn auth_error_not_retryable() {
        assert!(!OracleError::Auth("bad key".into()).is_retryable());
        assert!(OracleError::Api("503".into()).is_retryable());
        assert!(OracleError::RateLimited {
            retry_after_secs: Some(3)
        }
        .is_retryable());
    }

    #[test]
    fn page_error_serialises() {
        let e = PageError::Timeout { page: 2, secs: 60 };
        let json = serde_json::to_string(&e).expect("serialise");
        let back: PageError = serde_json::from_str(&json).expect("deserialise");
        assert_eq!(back.page(), 2);
    }
}
