use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque user identifier as claimed by the messaging gateway.
pub type UserId = i64;

/// Model tag of the one-time grant made at registration.
pub const INITIAL_TOKENS_TAG: &str = "INITIAL_TOKENS";

/// Model tag of the grant credited to a referrer.
pub const REFERRAL_BONUS_TAG: &str = "REFERRAL_BONUS";

/// A registered user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// One append-only ledger record.
///
/// `tokens` is signed: completions are positive (consumption), grants are
/// negative (credit). The stored column keeps this convention so existing
/// usage logs stay readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    /// Model identifier, or one of the grant sentinel tags
    pub model: String,
    pub tokens: i64,
    /// Cost in USD
    pub cost: f64,
}

impl UsageEntry {
    /// Consumption entry for a completed API call.
    pub fn consumption(user_id: UserId, model: impl Into<String>, tokens: u64, cost: f64) -> Self {
        Self {
            user_id,
            timestamp: Utc::now(),
            model: model.into(),
            tokens: clamp_tokens(tokens),
            cost: if cost.is_finite() && cost > 0.0 { cost } else { 0.0 },
        }
    }

    /// Credit entry under a sentinel tag. Grants are free.
    pub fn grant(user_id: UserId, tag: &str, amount: u64) -> Self {
        Self {
            user_id,
            timestamp: Utc::now(),
            model: tag.to_string(),
            tokens: -clamp_tokens(amount),
            cost: 0.0,
        }
    }
}

fn clamp_tokens(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

/// Running totals over a user's ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// Signed sum of token deltas (negative means credit left)
    pub tokens: i64,
    /// Sum of costs in USD
    pub cost: f64,
}

impl Balance {
    /// Tokens the user may still spend: `max(0, -tokens)`.
    pub fn available(&self) -> u64 {
        if self.tokens < 0 {
            self.tokens.unsigned_abs()
        } else {
            0
        }
    }

    pub fn has_credits(&self) -> bool {
        self.available() > 0
    }
}

/// Token usage of a single completion call, priced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Calculated cost in USD
    pub cost_usd: f64,
}

impl TokenUsage {
    fn sanitize_price(value: f64) -> f64 {
        if value.is_finite() && value > 0.0 {
            value
        } else {
            0.0
        }
    }

    /// Price a call from per-million-token input and output rates.
    pub fn new(
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        input_price_per_million: f64,
        output_price_per_million: f64,
    ) -> Self {
        let input_price_per_million = Self::sanitize_price(input_price_per_million);
        let output_price_per_million = Self::sanitize_price(output_price_per_million);

        // (tokens / 1M) * price_per_million
        let input_cost = (input_tokens as f64 / 1_000_000.0) * input_price_per_million;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * output_price_per_million;

        Self {
            model: model.into(),
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            cost_usd: input_cost + output_cost,
        }
    }
}

/// Why a referral grant was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReferral {
    SelfReferral,
    UnknownReferrer,
}

/// Result of [`crate::CreditLedger::apply_referral_bonus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferralOutcome {
    Granted,
    Invalid(InvalidReferral),
}

/// Outcome of a credit-gated operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Gate<T> {
    Granted(T),
    /// The user has no credits left; nothing was called or billed.
    Denied,
}

impl<T> Gate<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Gate<U> {
        match self {
            Gate::Granted(value) => Gate::Granted(f(value)),
            Gate::Denied => Gate::Denied,
        }
    }

    pub fn granted(self) -> Option<T> {
        match self {
            Gate::Granted(value) => Some(value),
            Gate::Denied => None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Gate::Denied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_calculation() {
        let usage = TokenUsage::new("gpt-4o", 1000, 500, 5.0, 15.0);

        // (1000/1M)*5 + (500/1M)*15 = 0.005 + 0.0075
        assert!((usage.cost_usd - 0.0125).abs() < 1e-9);
        assert_eq!(usage.total_tokens, 1500);
    }

    #[test]
    fn negative_or_non_finite_prices_are_clamped() {
        let usage = TokenUsage::new("test/model", 1000, 1000, -3.0, f64::NAN);
        assert!(usage.cost_usd.abs() < f64::EPSILON);
        assert_eq!(usage.total_tokens, 2000);
    }

    #[test]
    fn grant_entries_carry_negative_deltas() {
        let entry = UsageEntry::grant(7, INITIAL_TOKENS_TAG, 100);
        assert_eq!(entry.tokens, -100);
        assert_eq!(entry.cost, 0.0);
        assert_eq!(entry.model, INITIAL_TOKENS_TAG);

        let used = UsageEntry::consumption(7, "gpt-4o-mini", 40, 0.01);
        assert_eq!(used.tokens, 40);
        assert_eq!(used.model, "gpt-4o-mini");
    }

    #[test]
    fn available_balance_is_never_negative() {
        let overspent = Balance { tokens: 25, cost: 0.1 };
        assert_eq!(overspent.available(), 0);
        assert!(!overspent.has_credits());

        let credited = Balance { tokens: -60, cost: 0.0 };
        assert_eq!(credited.available(), 60);
        assert!(credited.has_credits());

        assert!(!Balance::default().has_credits());
    }

    #[test]
    fn gate_map_keeps_denial() {
        let denied: Gate<u32> = Gate::Denied;
        assert!(denied.map(|v| v + 1).is_denied());
        assert_eq!(Gate::Granted(1).map(|v| v + 1).granted(), Some(2));
    }
}
