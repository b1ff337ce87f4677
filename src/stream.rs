//! Streaming extraction API: emit pages as they complete.
//!
//! Large order documents take a while — one oracle round-trip per page,
//! strictly in order. A stream-based API lets callers display partial
//! results immediately or persist pages incrementally instead of waiting
//! for the whole document.
//!
//! Unlike the eager [`crate::extract::extract_order`], the stream performs
//! no consolidation or validation: each item is one page's raw (sanitised)
//! extraction plus its outcome. Pages always arrive in page order because
//! the pipeline is inherently sequential — strategy adaptation for page N
//! needs page N−1's quality.

use futures::stream;
use std::collections::VecDeque;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::config::ExtractionConfig;
use crate::error::OrderVisionError;
use crate::extract::PageProcessor;
use crate::model::{DocumentInput, PageExtraction, PageImage, PageOutcome};
use crate::oracle::OracleHandle;

/// One streamed page: its summary outcome plus the sanitised extraction.
#[derive(Debug)]
pub struct StreamedPage {
    pub outcome: PageOutcome,
    pub extraction: PageExtraction,
}

/// A boxed stream of per-page results.
pub type PageStream = Pin<Box<dyn Stream<Item = StreamedPage> + Send>>;

struct StreamState {
    processor: Option<PageProcessor>,
    doc: DocumentInput,
    pages: VecDeque<PageImage>,
    oracle: OracleHandle,
    config: ExtractionConfig,
}

/// Extract a document page by page, yielding each result as it is ready.
///
/// Layout analysis and opening-strategy selection run lazily on the first
/// poll; each `next().await` then performs exactly one page's oracle
/// round-trip. Failed pages are yielded with their error embedded in the
/// outcome (first-page fatality is an eager-API policy — streaming callers
/// see every page and decide themselves). Cancellation ends the stream
/// early.
pub async fn extract_stream(
    doc: DocumentInput,
    oracle: OracleHandle,
    config: ExtractionConfig,
) -> Result<PageStream, OrderVisionError> {
    if doc.page_count() == 0 {
        return Err(OrderVisionError::EmptyDocument);
    }

    let state = StreamState {
        processor: None,
        pages: doc.pages.clone().into(),
        doc,
        oracle,
        config,
    };

    let s = stream::unfold(state, |mut st| async move {
        if st.config.cancel.is_cancelled() {
            return None;
        }
        let page = st.pages.pop_front()?;

        if st.processor.is_none() {
            st.processor =
                Some(PageProcessor::new(&st.doc, st.oracle.clone(), st.config.clone()).await);
        }
        let processor = st.processor.as_mut().expect("just constructed");

        let (outcome, extraction) = processor.process(&page).await;
        Some((
            StreamedPage {
                outcome,
                extraction,
            },
            st,
        ))
    });

    Ok(Box::pin(s))
}
