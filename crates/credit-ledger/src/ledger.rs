use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::locks::UserLocks;
use crate::store::LedgerStore;
use crate::types::{
    Balance, InvalidReferral, ReferralOutcome, UsageEntry, UserId, INITIAL_TOKENS_TAG,
    REFERRAL_BONUS_TAG,
};

/// Answers "can this user act?" and records the cost of every API call.
///
/// All state lives in the [`LedgerStore`]; the ledger itself only adds the
/// per-user locks that callers use to make check-then-record atomic.
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    locks: UserLocks,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            locks: UserLocks::new(),
        }
    }

    /// Register a user on first contact. Returns `true` if the user is new.
    ///
    /// Existing users keep their ledger; only the display name is refreshed.
    /// The id is trusted as claimed by the messaging gateway.
    pub async fn register_user(&self, user_id: UserId, display_name: &str) -> Result<bool> {
        let created = self.store.upsert_user(user_id, display_name).await?;
        if created {
            info!(user_id, "Registered new user {display_name}");
        }
        Ok(created)
    }

    /// Register a user and, if new, grant `initial_tokens` in the same
    /// transaction. A failure leaves no user behind, so the next event
    /// retries both steps.
    pub async fn register_with_initial_credits(
        &self,
        user_id: UserId,
        display_name: &str,
        initial_tokens: u64,
    ) -> Result<bool> {
        let grant = UsageEntry::grant(user_id, INITIAL_TOKENS_TAG, initial_tokens);
        let created = self
            .store
            .upsert_user_with_grant(user_id, display_name, &grant)
            .await?;
        if created {
            info!(user_id, initial_tokens, "Registered new user {display_name}");
        }
        Ok(created)
    }

    /// Append the `INITIAL_TOKENS` grant. Not guarded: a second call grants again.
    pub async fn grant_initial_credits(&self, user_id: UserId, amount: u64) -> Result<()> {
        self.store
            .append(&UsageEntry::grant(user_id, INITIAL_TOKENS_TAG, amount))
            .await?;
        debug!(user_id, amount, "Granted initial credits");
        Ok(())
    }

    /// Credit `referrer_id` with a `REFERRAL_BONUS` grant on behalf of `caller_id`.
    ///
    /// Self-referrals and unregistered referrers are rejected without writing.
    /// The same referrer may be credited once per distinct caller.
    pub async fn apply_referral_bonus(
        &self,
        caller_id: UserId,
        referrer_id: UserId,
        amount: u64,
    ) -> Result<ReferralOutcome> {
        if caller_id == referrer_id {
            return Ok(ReferralOutcome::Invalid(InvalidReferral::SelfReferral));
        }
        if self.store.get_user(referrer_id).await?.is_none() {
            return Ok(ReferralOutcome::Invalid(InvalidReferral::UnknownReferrer));
        }

        self.store
            .append(&UsageEntry::grant(referrer_id, REFERRAL_BONUS_TAG, amount))
            .await?;
        info!(caller_id, referrer_id, amount, "Applied referral bonus");
        Ok(ReferralOutcome::Granted)
    }

    /// Append a consumption entry for one completed API call.
    pub async fn record_usage(
        &self,
        user_id: UserId,
        model: &str,
        total_tokens: u64,
        cost: f64,
    ) -> Result<()> {
        self.store
            .append(&UsageEntry::consumption(user_id, model, total_tokens, cost))
            .await?;
        debug!(user_id, model, total_tokens, cost, "Recorded usage");
        Ok(())
    }

    /// Signed running totals, or `None` for a user with no entries.
    pub async fn balance(&self, user_id: UserId) -> Result<Option<Balance>> {
        self.store.totals(user_id).await
    }

    /// Whether the user has any tokens left. No entries means no credits.
    pub async fn has_credits(&self, user_id: UserId) -> Result<bool> {
        Ok(self
            .balance(user_id)
            .await?
            .unwrap_or_default()
            .has_credits())
    }

    pub async fn entries(&self, user_id: UserId) -> Result<Vec<UsageEntry>> {
        self.store.entries(user_id).await
    }

    /// Enter `user_id`'s critical section.
    pub async fn lock_user(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        self.locks.acquire(user_id).await
    }

    /// Liveness signal for the health endpoint.
    pub async fn is_reachable(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Ledger store unreachable: {e}");
                false
            }
        }
    }
}
