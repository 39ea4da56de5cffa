//! Ledger-to-bank reconciliation.
//!
//! Four matchers feed one persisted match table:
//! - direct: amount/date/vendor/reference pairing with a multi-factor
//!   confidence score, tier and auto-confirmation gate
//! - aggregate: several V/P/F vouchers summing to one bank entry
//! - proportional: ledger = bank x (VAT/withholding ratio)
//! - fuzzy-vector: embedding cosine similarity
//!
//! Confirmation is idempotent and audit-logged; auto-confirmation gates on
//! the reasoning string produced by the direct matcher.

pub mod currency;
pub mod intelligence;
pub mod matcher;
pub mod semantic;

pub use currency::CurrencyService;
pub use intelligence::{AutoGate, ClearingChannel, ConfidenceTier};
pub use matcher::{AutoConfirmSummary, ReconciliationMatcher, SuggestOutcome};
pub use semantic::{LexicalSemanticService, SemanticService};
