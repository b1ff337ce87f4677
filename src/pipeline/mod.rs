//! Pipeline stages for order extraction.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations without touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! pages ──▶ layout ──▶ strategy ──▶ oracle ──▶ recovery ──▶ consolidate ──▶ validate
//! (input)  (3 signals) (registry)   (VLM)     (5 stages)    (merge/dedupe)  (score/correct)
//! ```
//!
//! 1. [`layout`]      — three-signal layout analysis of the document
//! 2. [`strategy`]    — strategy registry, scoring, quality-driven adaptation
//! 3. [`recovery`]    — graded fallback chain from oracle text to data
//! 4. [`consolidate`] — merge per-page partials into canonical products
//! 5. [`validate`]    — confidence scoring and bounded corrective retry
//! 6. [`encode`]      — image → base64 payload helper for callers

pub mod consolidate;
pub mod encode;
pub mod layout;
pub mod recovery;
pub mod strategy;
pub mod validate;
