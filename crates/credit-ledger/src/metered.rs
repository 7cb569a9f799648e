//! Memoized, billed access to the completion service.
//!
//! A cache miss runs "call, price, record usage, cache" as one spawned task
//! that the caller awaits through its `JoinHandle`. Dropping the caller
//! does not abort that task, so an answer is never billed without also
//! landing in the cache, and nothing is billed when the call fails.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{cache_key, MemoCache};
use crate::completion::{ChatMessage, CompletionService};
use crate::error::{Error, Result, UpstreamError};
use crate::ledger::CreditLedger;
use crate::pricing::PricingTable;
use crate::types::{Gate, UserId};

/// Completion service wrapped with pricing, billing and memoization.
#[derive(Clone)]
pub struct MeteredCompletions {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: Arc<CreditLedger>,
    service: Arc<dyn CompletionService>,
    pricing: PricingTable,
    cache: MemoCache,
}

impl MeteredCompletions {
    pub fn new(
        ledger: Arc<CreditLedger>,
        service: Arc<dyn CompletionService>,
        pricing: PricingTable,
        cache: MemoCache,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                service,
                pricing,
                cache,
            }),
        }
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.inner.ledger
    }

    pub fn cached_responses(&self) -> usize {
        self.inner.cache.len()
    }

    /// Return the memoized answer, or call the service and bill the user.
    ///
    /// A hit has no side effects. Not credit-gated; see [`Self::query_gated`].
    pub async fn query_cached(
        &self,
        messages: &[ChatMessage],
        model: &str,
        user_id: UserId,
    ) -> Result<String> {
        let key = cache_key(messages, model, user_id)?;
        if let Some(hit) = self.inner.cache.get(&key) {
            debug!(user_id, model, "Completion cache hit");
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let messages = messages.to_vec();
        let model = model.to_string();
        let task =
            tokio::spawn(async move { inner.fetch_and_bill(key, messages, model, user_id).await });
        join(task).await
    }

    /// Check credits and run the query inside the user's critical section.
    ///
    /// The lock is held by the spawned task until usage is recorded, so two
    /// concurrent requests can never both pass the check on the same credit.
    pub async fn query_gated(
        &self,
        messages: &[ChatMessage],
        model: &str,
        user_id: UserId,
    ) -> Result<Gate<String>> {
        let key = cache_key(messages, model, user_id)?;
        let guard = self.inner.ledger.lock_user(user_id).await;

        let inner = Arc::clone(&self.inner);
        let messages = messages.to_vec();
        let model = model.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.check_and_fetch(key, messages, model, user_id).await
        });
        join(task).await
    }
}

impl Inner {
    async fn check_and_fetch(
        &self,
        key: String,
        messages: Vec<ChatMessage>,
        model: String,
        user_id: UserId,
    ) -> Result<Gate<String>> {
        if !self.ledger.has_credits(user_id).await? {
            debug!(user_id, model = %model, "Denied: no credits left");
            return Ok(Gate::Denied);
        }
        if let Some(hit) = self.cache.get(&key) {
            debug!(user_id, model = %model, "Completion cache hit");
            return Ok(Gate::Granted(hit));
        }
        self.fetch_and_bill(key, messages, model, user_id)
            .await
            .map(Gate::Granted)
    }

    async fn fetch_and_bill(
        &self,
        key: String,
        messages: Vec<ChatMessage>,
        model: String,
        user_id: UserId,
    ) -> Result<String> {
        let completion = self.service.complete(&messages, &model).await?;
        let usage = self.pricing.usage(
            &model,
            completion.prompt_tokens,
            completion.completion_tokens,
        );

        self.ledger
            .record_usage(user_id, &model, usage.total_tokens, usage.cost_usd)
            .await?;
        self.cache.insert(key, completion.text.clone());
        Ok(completion.text)
    }
}

async fn join<T>(task: tokio::task::JoinHandle<Result<T>>) -> Result<T> {
    match task.await {
        Ok(result) => result,
        Err(e) => {
            warn!("Metered completion task failed: {e}");
            Err(Error::Upstream(UpstreamError::Transport(format!(
                "completion task failed: {e}"
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use crate::store::SqliteLedgerStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoService {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CompletionService for EchoService {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _model: &str,
        ) -> std::result::Result<Completion, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(UpstreamError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(Completion {
                text: format!("{} messages", messages.len()),
                prompt_tokens: 1_000_000,
                completion_tokens: 1_000_000,
            })
        }

        async fn embed(
            &self,
            _text: &str,
            _model: &str,
        ) -> std::result::Result<Vec<f32>, UpstreamError> {
            Ok(vec![0.0])
        }
    }

    fn metered(fail: bool) -> (MeteredCompletions, Arc<EchoService>) {
        let ledger = Arc::new(CreditLedger::new(Arc::new(
            SqliteLedgerStore::open_in_memory().unwrap(),
        )));
        let service = Arc::new(EchoService {
            calls: AtomicUsize::new(0),
            fail,
        });
        let metered = MeteredCompletions::new(
            ledger,
            service.clone(),
            PricingTable::default(),
            MemoCache::new(16),
        );
        (metered, service)
    }

    #[tokio::test]
    async fn miss_bills_with_table_pricing() {
        let (metered, _service) = metered(false);
        let text = metered
            .query_cached(&[ChatMessage::user("1+1")], "gpt-4o-mini", 1)
            .await
            .unwrap();
        assert_eq!(text, "1 messages");

        let balance = metered.ledger().balance(1).await.unwrap().unwrap();
        assert_eq!(balance.tokens, 2_000_000);
        assert!((balance.cost - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn upstream_failure_bills_nothing() {
        let (metered, service) = metered(true);
        let err = metered
            .query_cached(&[ChatMessage::user("1+1")], "gpt-4o", 1)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Upstream(_)));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert!(metered.ledger().balance(1).await.unwrap().is_none());
        assert_eq!(metered.cached_responses(), 0);
    }

    #[tokio::test]
    async fn gated_query_denies_without_credits() {
        let (metered, service) = metered(false);
        let gate = metered
            .query_gated(&[ChatMessage::user("1+1")], "gpt-4o", 1)
            .await
            .unwrap();

        assert!(gate.is_denied());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }
}
