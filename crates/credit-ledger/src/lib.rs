//! Per-user token credit ledger for mathtop.
//!
//! This crate holds the metering core of the bot: an append-only usage log
//! with a signed running balance, the model pricing table, and a bounded
//! memoization cache in front of the completion service. Paid calls go
//! through [`MeteredCompletions::query_gated`], which checks credits and
//! records usage inside one per-user critical section.

pub mod cache;
pub mod completion;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod metered;
pub mod pricing;
pub mod store;
pub mod types;

pub use cache::{cache_key, MemoCache};
pub use completion::{ChatMessage, Completion, CompletionService, ContentPart, MessageContent, Role};
pub use error::{Error, Result, UpstreamError};
pub use ledger::CreditLedger;
pub use locks::UserLocks;
pub use metered::MeteredCompletions;
pub use pricing::{cost, ModelPrice, PricingTable};
pub use store::{LedgerStore, SqliteLedgerStore};
pub use types::{
    Balance, Gate, InvalidReferral, ReferralOutcome, TokenUsage, UsageEntry, User, UserId,
    INITIAL_TOKENS_TAG, REFERRAL_BONUS_TAG,
};
