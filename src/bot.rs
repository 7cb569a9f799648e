//! Event loop and per-event handlers of the tutoring bot.

use anyhow::{Context, Result};
use credit_ledger::{ChatMessage, CreditLedger, Gate, ReferralOutcome, UserId, UserLocks};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::assistant::{AssistantResult, MathAssistant};
use crate::channels::{EventKind, Gateway, Incoming};
use crate::config::{Config, CreditsConfig};
use crate::history::ConversationHistory;

const OUT_OF_CREDITS: &str = "Te has quedado sin créditos. \
    Invita a un amigo con /start y tu número de usuario para conseguir más.";
const APOLOGY: &str = "Lo siento, algo salió mal. Inténtalo de nuevo más tarde.";
const PARSED_PROBLEM: &str = "Esto es lo que entendí de tu imagen:";
const HELP: &str = "Envíame una foto de un problema de matemáticas y te daré la solución \
    y un video relacionado. También puedes escribirme tus dudas.\n\n\
    /start - Empezar\n\
    /balance - Ver tus créditos\n\
    /help - Ver esta ayuda";

const POLL_BACKOFF: Duration = Duration::from_secs(5);

pub struct Bot {
    gateway: Arc<dyn Gateway>,
    assistant: MathAssistant,
    ledger: Arc<CreditLedger>,
    history: ConversationHistory,
    /// Serializes each user's chat turns so a rollback only touches its own message.
    turns: UserLocks,
    credits: CreditsConfig,
}

impl Bot {
    pub fn new(config: &Config, gateway: Arc<dyn Gateway>, assistant: MathAssistant) -> Self {
        let ledger = Arc::clone(assistant.metered().ledger());
        Self {
            gateway,
            assistant,
            ledger,
            history: ConversationHistory::new(
                config.history.max_messages,
                Duration::from_secs(config.history.idle_secs),
            ),
            turns: UserLocks::new(),
            credits: config.credits.clone(),
        }
    }

    /// Poll the gateway forever, handling each event on its own task.
    pub async fn run(self: Arc<Self>) {
        info!("Bot is polling {} for updates", self.gateway.name());
        loop {
            match self.gateway.next_events().await {
                Ok(events) => {
                    for event in events {
                        let bot = Arc::clone(&self);
                        tokio::spawn(async move { bot.dispatch(event).await });
                    }
                }
                Err(e) => {
                    warn!("Polling {} failed: {e:#}", self.gateway.name());
                    tokio::time::sleep(POLL_BACKOFF).await;
                }
            }
        }
    }

    /// Handle one event; failures end in an apology, never a panic.
    pub async fn dispatch(&self, event: Incoming) {
        let chat_id = event.chat_id;
        let user_id = event.user_id;
        if let Err(e) = self.handle(event).await {
            error!(user_id, "Failed to handle event: {e:#}");
            if let Err(e) = self.gateway.send_text(chat_id, APOLOGY).await {
                warn!(user_id, "Failed to send apology: {e:#}");
            }
        }
    }

    async fn handle(&self, event: Incoming) -> Result<()> {
        let Incoming {
            chat_id,
            user_id,
            display_name,
            kind,
        } = event;

        let created = self
            .ledger
            .register_with_initial_credits(user_id, &display_name, self.credits.initial_tokens)
            .await?;

        match kind {
            EventKind::Command { name, args } => match name.as_str() {
                "start" => self.on_start(chat_id, user_id, &display_name, created, &args).await,
                "balance" => self.on_balance(chat_id, user_id).await,
                _ => self.gateway.send_text(chat_id, HELP).await,
            },
            EventKind::Text(text) => self.on_text(chat_id, user_id, text).await,
            EventKind::Photo { file_ref } => self.on_photo(chat_id, user_id, &file_ref).await,
        }
    }

    async fn on_start(
        &self,
        chat_id: i64,
        user_id: UserId,
        display_name: &str,
        created: bool,
        args: &[String],
    ) -> Result<()> {
        info!(user_id, "User {display_name} started the bot");

        // Referrals only count when they bring in a new user.
        if let Some(referrer) = args.first().and_then(|a| a.parse::<UserId>().ok()) {
            if created {
                let outcome = self
                    .ledger
                    .apply_referral_bonus(user_id, referrer, self.credits.referral_bonus)
                    .await?;
                if let ReferralOutcome::Invalid(reason) = outcome {
                    info!(user_id, referrer, "Ignored referral: {reason:?}");
                }
            } else {
                debug!(user_id, referrer, "Ignored referral from existing user");
            }
        }

        self.gateway
            .send_text(
                chat_id,
                &format!(
                    "Hola {display_name}! Envíame una imagen de una ecuación y la resolveré para ti."
                ),
            )
            .await
    }

    async fn on_balance(&self, chat_id: i64, user_id: UserId) -> Result<()> {
        let balance = self.ledger.balance(user_id).await?.unwrap_or_default();
        let reply = format!(
            "Te quedan {} tokens. Has gastado ${:.4}.\nTu número de usuario es {user_id}.",
            balance.available(),
            balance.cost
        );
        self.gateway.send_text(chat_id, &reply).await
    }

    async fn on_text(&self, chat_id: i64, user_id: UserId, text: String) -> Result<()> {
        let _turn = self.turns.acquire(user_id).await;
        self.history.push(user_id, ChatMessage::user(text)).await;
        let messages = self.history.messages(user_id).await;

        let result = self.assistant.chat(&messages, user_id).await;
        match self.granted_or_notify(chat_id, result).await {
            Ok(Some(reply)) => {
                self.history
                    .push(user_id, ChatMessage::assistant(reply.as_str()))
                    .await;
                self.gateway.send_text(chat_id, &reply).await
            }
            Ok(None) => {
                self.history.pop_last(user_id).await;
                Ok(())
            }
            Err(e) => {
                self.history.pop_last(user_id).await;
                Err(e)
            }
        }
    }

    async fn on_photo(&self, chat_id: i64, user_id: UserId, file_ref: &str) -> Result<()> {
        info!(user_id, "Received an image");
        if let Err(e) = self.gateway.send_typing(chat_id).await {
            debug!(user_id, "Typing indicator failed: {e:#}");
        }

        let path = self.gateway.download_file(file_ref).await?;
        let image = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        drop(path);

        let Some(problem) = self
            .granted_or_notify(chat_id, self.assistant.parse_image(&image, user_id).await)
            .await?
        else {
            return Ok(());
        };
        debug!(user_id, "Parsed problem: {problem}");

        let solution = match self.assistant.solve_problem(&problem, user_id).await? {
            Gate::Granted(solution) => solution,
            Gate::Denied => {
                // The parse was billed, so its result is still delivered.
                self.gateway
                    .send_text(chat_id, &format!("{PARSED_PROBLEM}\n{problem}"))
                    .await?;
                return self.gateway.send_text(chat_id, OUT_OF_CREDITS).await;
            }
        };
        self.gateway.send_text(chat_id, &solution).await?;

        if let Some(video) = self
            .granted_or_notify(chat_id, self.assistant.recommend_video(&problem, user_id).await)
            .await?
        {
            self.gateway.send_text(chat_id, &video).await?;
        }
        Ok(())
    }

    /// Unwrap a gated answer, telling the user when they ran out of credits.
    async fn granted_or_notify(
        &self,
        chat_id: i64,
        result: AssistantResult<String>,
    ) -> Result<Option<String>> {
        match result? {
            Gate::Granted(text) => Ok(Some(text)),
            Gate::Denied => {
                self.gateway.send_text(chat_id, OUT_OF_CREDITS).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::videos::{SqliteVideoIndex, VideoIndex};
    use async_trait::async_trait;
    use credit_ledger::{
        Balance, Completion, CompletionService, LedgerStore, MemoCache, MessageContent,
        MeteredCompletions, PricingTable, SqliteLedgerStore, UpstreamError, UsageEntry, User,
    };
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempPath;

    #[derive(Default)]
    struct FakeGateway {
        sent: Mutex<Vec<(i64, String)>>,
        typing: AtomicUsize,
    }

    impl FakeGateway {
        fn replies(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl Gateway for FakeGateway {
        fn name(&self) -> &str {
            "fake"
        }

        async fn next_events(&self) -> Result<Vec<Incoming>> {
            Ok(Vec::new())
        }

        async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
            self.sent.lock().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn send_typing(&self, _chat_id: i64) -> Result<()> {
            self.typing.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn download_file(&self, _file_ref: &str) -> Result<TempPath> {
            let mut tmp = tempfile::NamedTempFile::new()?;
            tmp.write_all(b"jpeg")?;
            Ok(tmp.into_temp_path())
        }
    }

    /// Answers by model and counts the messages it was given.
    #[derive(Default)]
    struct ScriptedService {
        fail: AtomicBool,
        /// Fail only requests whose last message is this text.
        fail_on: Mutex<Option<String>>,
        last_len: AtomicUsize,
    }

    #[async_trait]
    impl CompletionService for ScriptedService {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            model: &str,
        ) -> std::result::Result<Completion, UpstreamError> {
            tokio::task::yield_now().await;
            let last_text = match messages.last().map(|m| &m.content) {
                Some(MessageContent::Text(text)) => Some(text.clone()),
                _ => None,
            };
            if self.fail.load(Ordering::SeqCst)
                || (last_text.is_some() && *self.fail_on.lock() == last_text)
            {
                return Err(UpstreamError::Transport("connection reset".into()));
            }
            self.last_len.store(messages.len(), Ordering::SeqCst);
            Ok(Completion {
                text: format!("{model}#{}", messages.len()),
                prompt_tokens: 40,
                completion_tokens: 10,
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

    /// SQLite store that can be made to fail on demand.
    struct FlakyStore {
        inner: SqliteLedgerStore,
        /// Number of upcoming calls of any kind that fail.
        failures: AtomicUsize,
        /// Balance reads fail while set.
        totals_down: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: SqliteLedgerStore::open_in_memory().unwrap(),
                failures: AtomicUsize::new(0),
                totals_down: AtomicBool::new(false),
            }
        }

        fn trip(&self) -> credit_ledger::Result<()> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Err(credit_ledger::Error::StoreUnavailable("database is locked".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl LedgerStore for FlakyStore {
        async fn upsert_user(&self, user_id: UserId, name: &str) -> credit_ledger::Result<bool> {
            self.trip()?;
            self.inner.upsert_user(user_id, name).await
        }
        async fn upsert_user_with_grant(
            &self,
            user_id: UserId,
            name: &str,
            grant: &UsageEntry,
        ) -> credit_ledger::Result<bool> {
            self.trip()?;
            self.inner.upsert_user_with_grant(user_id, name, grant).await
        }
        async fn get_user(&self, user_id: UserId) -> credit_ledger::Result<Option<User>> {
            self.trip()?;
            self.inner.get_user(user_id).await
        }
        async fn append(&self, entry: &UsageEntry) -> credit_ledger::Result<()> {
            self.trip()?;
            self.inner.append(entry).await
        }
        async fn totals(&self, user_id: UserId) -> credit_ledger::Result<Option<Balance>> {
            self.trip()?;
            if self.totals_down.load(Ordering::SeqCst) {
                return Err(credit_ledger::Error::StoreUnavailable("disk I/O error".into()));
            }
            self.inner.totals(user_id).await
        }
        async fn entries(&self, user_id: UserId) -> credit_ledger::Result<Vec<UsageEntry>> {
            self.trip()?;
            self.inner.entries(user_id).await
        }
        async fn ping(&self) -> credit_ledger::Result<()> {
            self.trip()?;
            self.inner.ping().await
        }
    }

    struct Harness {
        bot: Bot,
        gateway: Arc<FakeGateway>,
        service: Arc<ScriptedService>,
        ledger: Arc<CreditLedger>,
        videos: Arc<SqliteVideoIndex>,
    }

    fn harness(initial_tokens: u64) -> Harness {
        harness_with(
            initial_tokens,
            Arc::new(SqliteLedgerStore::open_in_memory().unwrap()),
        )
    }

    fn harness_with(initial_tokens: u64, store: Arc<dyn LedgerStore>) -> Harness {
        let mut config = Config::default();
        config.credits.initial_tokens = initial_tokens;
        config.credits.referral_bonus = 500;

        let ledger = Arc::new(CreditLedger::new(store));
        let service = Arc::new(ScriptedService::default());
        let videos = Arc::new(SqliteVideoIndex::open_in_memory().unwrap());
        let metered = MeteredCompletions::new(
            Arc::clone(&ledger),
            service.clone(),
            PricingTable::default(),
            MemoCache::new(32),
        );
        let assistant = MathAssistant::new(&config, metered, service.clone(), videos.clone());
        let gateway = Arc::new(FakeGateway::default());
        let bot = Bot::new(&config, gateway.clone(), assistant);

        Harness {
            bot,
            gateway,
            service,
            ledger,
            videos,
        }
    }

    fn event(user_id: UserId, kind: EventKind) -> Incoming {
        Incoming {
            chat_id: user_id * 10,
            user_id,
            display_name: format!("user{user_id}"),
            kind,
        }
    }

    fn command(user_id: UserId, name: &str, args: &[&str]) -> Incoming {
        event(
            user_id,
            EventKind::Command {
                name: name.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
        )
    }

    #[tokio::test]
    async fn start_greets_and_grants_once() {
        let h = harness(1_000);
        h.bot.dispatch(command(1, "start", &[])).await;
        h.bot.dispatch(command(1, "start", &[])).await;

        let balance = h.ledger.balance(1).await.unwrap().unwrap();
        assert_eq!(balance.available(), 1_000);
        assert!(h.gateway.replies()[0].starts_with("Hola user1!"));
    }

    #[tokio::test]
    async fn referral_credits_the_referrer_for_new_users_only() {
        let h = harness(1_000);
        h.bot.dispatch(command(1, "start", &[])).await;
        h.bot.dispatch(command(2, "start", &["1"])).await;
        // Existing user replaying the referral.
        h.bot.dispatch(command(2, "start", &["1"])).await;
        // Self-referral and unknown referrer.
        h.bot.dispatch(command(3, "start", &["3"])).await;
        h.bot.dispatch(command(4, "start", &["999"])).await;

        assert_eq!(h.ledger.balance(1).await.unwrap().unwrap().available(), 1_500);
        assert_eq!(h.ledger.balance(3).await.unwrap().unwrap().available(), 1_000);
        assert!(h.ledger.balance(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn balance_reports_available_tokens() {
        let h = harness(1_000);
        h.bot.dispatch(command(1, "balance", &[])).await;
        assert!(h.gateway.replies()[0].contains("Te quedan 1000 tokens"));
    }

    #[tokio::test]
    async fn text_keeps_conversation_history() {
        let h = harness(1_000);
        h.bot.dispatch(event(1, EventKind::Text("hola".into()))).await;
        h.bot
            .dispatch(event(1, EventKind::Text("¿y 2+2?".into())))
            .await;

        // system + user + assistant + user
        assert_eq!(h.service.last_len.load(Ordering::SeqCst), 4);
        assert_eq!(h.gateway.replies(), vec!["gpt-4o-mini#2", "gpt-4o-mini#4"]);
    }

    #[tokio::test]
    async fn exhausted_user_gets_the_out_of_credits_reply() {
        let h = harness(0);
        h.bot.dispatch(event(1, EventKind::Text("hola".into()))).await;

        assert_eq!(h.gateway.replies(), vec![OUT_OF_CREDITS]);
        assert_eq!(h.bot.history.len(1).await, 0);
        assert_eq!(h.service.last_len.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upstream_failure_apologizes_and_bills_nothing() {
        let h = harness(1_000);
        h.service.fail.store(true, Ordering::SeqCst);
        h.bot.dispatch(event(1, EventKind::Text("hola".into()))).await;

        assert_eq!(h.gateway.replies(), vec![APOLOGY]);
        assert_eq!(h.ledger.entries(1).await.unwrap().len(), 1);
        assert_eq!(h.bot.history.len(1).await, 0);
    }

    #[tokio::test]
    async fn photo_sends_solution_then_video() {
        let h = harness(10_000);
        h.videos
            .insert("https://youtu.be/x", "Ecuaciones lineales", &[0.0])
            .await
            .unwrap();

        h.bot
            .dispatch(event(
                1,
                EventKind::Photo {
                    file_ref: "abc".into(),
                },
            ))
            .await;

        assert_eq!(h.gateway.typing.load(Ordering::SeqCst), 1);
        assert_eq!(h.gateway.replies(), vec!["gpt-4o#1", "gpt-4o-mini#1"]);
        // Grant plus three billed calls.
        assert_eq!(h.ledger.entries(1).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn failed_first_contact_grants_on_the_next_event() {
        let store = Arc::new(FlakyStore::new());
        let h = harness_with(1_000, store.clone());

        store.failures.store(1, Ordering::SeqCst);
        h.bot.dispatch(command(1, "start", &[])).await;
        h.bot.dispatch(command(1, "start", &[])).await;
        h.bot.dispatch(event(1, EventKind::Text("hola".into()))).await;

        let replies = h.gateway.replies();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], APOLOGY);
        assert!(replies[1].starts_with("Hola user1!"));
        assert_eq!(replies[2], "gpt-4o-mini#2");
        assert_eq!(h.ledger.balance(1).await.unwrap().unwrap().available(), 950);
    }

    #[tokio::test]
    async fn unreachable_store_apologizes_without_calling_the_model() {
        let store = Arc::new(FlakyStore::new());
        let h = harness_with(1_000, store.clone());
        h.bot.dispatch(command(1, "start", &[])).await;

        store.totals_down.store(true, Ordering::SeqCst);
        h.bot.dispatch(event(1, EventKind::Text("hola".into()))).await;
        store.failures.store(1, Ordering::SeqCst);
        h.bot.dispatch(event(1, EventKind::Text("hola".into()))).await;
        store.totals_down.store(false, Ordering::SeqCst);

        assert_eq!(&h.gateway.replies()[1..], &[APOLOGY, APOLOGY]);
        assert_eq!(h.service.last_len.load(Ordering::SeqCst), 0);
        assert_eq!(h.bot.history.len(1).await, 0);
        // Only the initial grant.
        assert_eq!(h.ledger.entries(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_turns_roll_back_only_their_own_message() {
        let h = harness(1_000);
        h.bot.dispatch(command(1, "start", &[])).await;
        *h.service.fail_on.lock() = Some("falla".into());

        tokio::join!(
            h.bot.dispatch(event(1, EventKind::Text("falla".into()))),
            h.bot.dispatch(event(1, EventKind::Text("ok".into()))),
        );

        assert_eq!(
            h.bot.history.messages(1).await,
            vec![
                ChatMessage::user("ok"),
                ChatMessage::assistant("gpt-4o-mini#2")
            ]
        );
        let replies = h.gateway.replies();
        assert!(replies.contains(&APOLOGY.to_string()));
        assert!(replies.contains(&"gpt-4o-mini#2".to_string()));
    }

    #[tokio::test]
    async fn photo_denied_at_solve_still_delivers_the_billed_parse() {
        // Exactly one 50-token call fits.
        let h = harness(50);
        h.bot
            .dispatch(event(
                1,
                EventKind::Photo {
                    file_ref: "abc".into(),
                },
            ))
            .await;

        assert_eq!(
            h.gateway.replies(),
            vec![format!("{PARSED_PROBLEM}\ngpt-4o#1"), OUT_OF_CREDITS.to_string()]
        );
        // Grant plus the parse.
        assert_eq!(h.ledger.entries(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_command_shows_help() {
        let h = harness(1_000);
        h.bot.dispatch(command(1, "foo", &[])).await;
        assert_eq!(h.gateway.replies(), vec![HELP]);
    }
}
