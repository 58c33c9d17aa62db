//! Per-bot handler pipeline: command dispatch, eligibility enforcement,
//! consent callbacks, and reply scheduling.
//!
//! One pipeline (worker task) exists per registered bot. Within a
//! pipeline, everything one user does (text messages and consent
//! button presses alike) is processed strictly in arrival order — a
//! user who double-sends before the first reply completes has the
//! second event buffered, never raced.

pub mod eligibility;
pub mod reply;

use aviary_core::{
    config::{AccessConfig, BotConfig, ReplyConfig},
    traits::{Button, Channel, Completion, Membership},
};
use aviary_memory::{ConsentStore, SessionStore};
use aviary_telegram::types::{CallbackQuery, Update};
use eligibility::{Eligibility, EligibilityGate};
use reply::ReplyEngine;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

/// Callback payloads for the consent keyboard.
const CONSENT_ACCEPT: &str = "consent:accept";
const CONSENT_DECLINE: &str = "consent:decline";

/// Queue depth for one bot's update pipeline.
const PIPELINE_DEPTH: usize = 256;

/// Slash commands the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Reset,
}

impl Command {
    /// Parse a command, tolerating the `/cmd@botname` form.
    fn parse(text: &str) -> Option<Self> {
        let first = text.trim().split_whitespace().next()?;
        let name = first.strip_prefix('/')?.split('@').next()?;
        match name {
            "start" => Some(Self::Start),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

/// One unit of per-user work. Text turns and consent callbacks share a
/// queue: an accept's membership re-check plus write can never be
/// overtaken by a later decline from the same user.
enum UserEvent {
    Text { chat_id: i64, text: String },
    Callback(CallbackQuery),
}

/// The conversation pipeline for one bot.
pub struct BotHandler {
    pub bot_id: String,
    persona: String,
    greeting: String,
    channel: Arc<dyn Channel>,
    gate: EligibilityGate,
    sessions: Arc<SessionStore>,
    engine: ReplyEngine,
    /// Subscribe prompt with `{channel}` already substituted.
    subscribe_message: String,
    consent_message: String,
    /// Users with work in flight, each with their buffered follow-ups.
    active_users: Mutex<HashMap<i64, VecDeque<UserEvent>>>,
}

impl BotHandler {
    pub fn new(
        bot: &BotConfig,
        access: &AccessConfig,
        reply_cfg: &ReplyConfig,
        channel: Arc<dyn Channel>,
        membership: Arc<dyn Membership>,
        consent: ConsentStore,
        sessions: Arc<SessionStore>,
        provider: Arc<dyn Completion>,
    ) -> Self {
        let engine = ReplyEngine::new(
            provider,
            sessions.clone(),
            reply_cfg.p_long,
            reply_cfg.fallback.clone(),
        );
        Self {
            bot_id: bot.id.to_lowercase(),
            persona: bot.persona.clone(),
            greeting: bot.greeting.clone(),
            channel,
            gate: EligibilityGate::new(membership, consent, access),
            sessions,
            engine,
            subscribe_message: access
                .subscribe_message
                .replace("{channel}", &access.required_channel),
            consent_message: access.consent_message.clone(),
            active_users: Mutex::new(HashMap::new()),
        }
    }

    /// Route one decoded update into the sender's per-user queue.
    /// Never blocks on reply generation.
    pub async fn handle_update(self: Arc<Self>, update: Update) {
        if let Some(cb) = update.callback_query {
            let user_id = cb.from.id;
            self.dispatch(user_id, UserEvent::Callback(cb)).await;
            return;
        }

        let Some(msg) = update.message else {
            debug!("[{}] update {} carries nothing to route", self.bot_id, update.update_id);
            return;
        };
        let (Some(user), Some(text)) = (msg.from, msg.text) else {
            return;
        };

        self.dispatch(
            user.id,
            UserEvent::Text {
                chat_id: msg.chat.id,
                text,
            },
        )
        .await;
    }

    /// Dispatch one unit of user work: buffer if the user already has
    /// work in flight, otherwise start a task that drains the queue in
    /// arrival order.
    async fn dispatch(self: Arc<Self>, user_id: i64, event: UserEvent) {
        {
            let mut active = self.active_users.lock().await;
            if let Some(pending) = active.get_mut(&user_id) {
                pending.push_back(event);
                info!(
                    "[{}] buffered event from {user_id} (work in progress)",
                    self.bot_id
                );
                return;
            }
            active.insert(user_id, VecDeque::new());
        }

        let handler = self;
        tokio::spawn(async move {
            let mut next = Some(event);
            while let Some(event) = next {
                handler.process(user_id, event).await;

                let mut active = handler.active_users.lock().await;
                next = active.get_mut(&user_id).and_then(|q| q.pop_front());
                if next.is_none() {
                    active.remove(&user_id);
                }
            }
        });
    }

    async fn process(&self, user_id: i64, event: UserEvent) {
        match event {
            UserEvent::Text { chat_id, text } => self.run_turn(chat_id, user_id, text).await,
            UserEvent::Callback(cb) => self.handle_callback(cb).await,
        }
    }

    /// One full conversational turn: command or gate, then reply.
    async fn run_turn(&self, chat_id: i64, user_id: i64, text: String) {
        if let Some(cmd) = Command::parse(&text) {
            self.run_command(cmd, chat_id, user_id).await;
            return;
        }

        match self.gate.check(user_id).await {
            Eligibility::NeedsSubscription => {
                self.send(chat_id, &self.subscribe_message).await;
            }
            Eligibility::NeedsConsent => {
                self.send_consent_prompt(chat_id).await;
            }
            Eligibility::Eligible => {
                // Best-effort typing indicator before generation starts.
                let _ = self.channel.send_typing(chat_id).await;
                let reply = self
                    .engine
                    .generate(&self.bot_id, user_id, &self.persona, &text)
                    .await;
                self.send(chat_id, &reply).await;
            }
        }
    }

    async fn run_command(&self, cmd: Command, chat_id: i64, user_id: i64) {
        match cmd {
            Command::Start => match self.gate.check(user_id).await {
                Eligibility::NeedsSubscription => {
                    self.send(chat_id, &self.subscribe_message).await;
                }
                Eligibility::NeedsConsent => {
                    self.send_consent_prompt(chat_id).await;
                }
                Eligibility::Eligible => {
                    self.send(chat_id, &self.greeting).await;
                }
            },
            Command::Reset => {
                self.sessions.reset(&self.bot_id, user_id).await;
                self.send(chat_id, "Начнём с чистого листа ✨").await;
            }
        }
    }

    /// Handle a consent keyboard press.
    async fn handle_callback(&self, cb: CallbackQuery) {
        let Some(data) = cb.data else {
            return;
        };
        let user_id = cb.from.id;
        let chat_id = cb.message.map(|m| m.chat.id).unwrap_or(user_id);

        let _ = self.channel.ack_callback(&cb.id).await;

        match data.as_str() {
            CONSENT_ACCEPT => match self.gate.accept(user_id).await {
                Ok(true) => {
                    self.send(chat_id, "Спасибо! Теперь можем общаться — напиши мне что-нибудь 💬")
                        .await;
                }
                Ok(false) => {
                    // Unsubscribed between prompts.
                    self.send(chat_id, &self.subscribe_message).await;
                }
                Err(e) => {
                    error!("[{}] consent accept failed for {user_id}: {e}", self.bot_id);
                    self.send(chat_id, "Не получилось сохранить ответ, попробуй ещё раз 🙏")
                        .await;
                }
            },
            CONSENT_DECLINE => {
                if let Err(e) = self.gate.decline(user_id).await {
                    error!("[{}] consent decline failed for {user_id}: {e}", self.bot_id);
                }
                self.send(
                    chat_id,
                    "Хорошо, я удалил твоё согласие. Передумаешь — напиши /start.",
                )
                .await;
            }
            other => debug!("[{}] unknown callback data: {other}", self.bot_id),
        }
    }

    async fn send_consent_prompt(&self, chat_id: i64) {
        let buttons = [
            Button::new("✅ Мне есть 18, принимаю", CONSENT_ACCEPT),
            Button::new("❌ Не принимаю", CONSENT_DECLINE),
        ];
        if let Err(e) = self
            .channel
            .send_keyboard(chat_id, &self.consent_message, &buttons)
            .await
        {
            error!("[{}] failed to send consent prompt: {e}", self.bot_id);
        }
    }

    async fn send(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.channel.send(chat_id, text).await {
            error!("[{}] send failed: {e}", self.bot_id);
        }
    }
}

/// Materialize the pipeline for one bot: a bounded queue and its single
/// consumer task. Returns the inbound sender stored in the registry.
pub fn spawn_pipeline(handler: Arc<BotHandler>) -> mpsc::Sender<Update> {
    let (tx, mut rx) = mpsc::channel::<Update>(PIPELINE_DEPTH);

    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            handler.clone().handle_update(update).await;
        }
        info!("[{}] pipeline stopped", handler.bot_id);
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use aviary_core::error::AviaryError;
    use aviary_core::turn::CompletionRequest;
    use aviary_telegram::types::{Chat, Message, User};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    // -----------------------------------------------------------------------
    // Mocks
    // -----------------------------------------------------------------------

    /// Records everything sent through the channel.
    #[derive(Default)]
    struct MockChannel {
        sent: StdMutex<Vec<(i64, String)>>,
        keyboards: StdMutex<Vec<(i64, String)>>,
    }

    impl MockChannel {
        fn sent_texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        async fn send(&self, chat_id: i64, text: &str) -> Result<(), AviaryError> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }

        async fn send_keyboard(
            &self,
            chat_id: i64,
            text: &str,
            _buttons: &[Button],
        ) -> Result<(), AviaryError> {
            self.keyboards.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    struct MockMembership(bool);

    #[async_trait]
    impl Membership for MockMembership {
        async fn is_member(&self, _channel: &str, _user_id: i64) -> Result<bool, AviaryError> {
            Ok(self.0)
        }
    }

    /// Membership check with network-like latency.
    struct SlowMembership {
        subscribed: bool,
        delay: Duration,
    }

    #[async_trait]
    impl Membership for SlowMembership {
        async fn is_member(&self, _channel: &str, _user_id: i64) -> Result<bool, AviaryError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.subscribed)
        }
    }

    /// Numbered replies with a configurable delay, counting calls.
    struct SlowCompletion {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Completion for SlowCompletion {
        fn name(&self) -> &str {
            "slow-mock"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<String, AviaryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            Ok(format!("r{n}"))
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn test_consent_store() -> ConsentStore {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap();
        ConsentStore::from_pool(pool, 1).await.unwrap()
    }

    struct Fixture {
        handler: Arc<BotHandler>,
        channel: Arc<MockChannel>,
        sessions: Arc<SessionStore>,
        completion: Arc<SlowCompletion>,
        consent: ConsentStore,
    }

    async fn fixture(subscribed: bool, delay_ms: u64) -> Fixture {
        fixture_with_membership(Arc::new(MockMembership(subscribed)), delay_ms).await
    }

    async fn fixture_with_membership(
        membership: Arc<dyn Membership>,
        delay_ms: u64,
    ) -> Fixture {
        let bot = BotConfig {
            id: "Love_Bot".to_string(),
            token: "000:test".to_string(),
            secret: "s3cret".to_string(),
            persona: "Ты — бот.".to_string(),
            greeting: "Привет!".to_string(),
        };
        let access = AccessConfig {
            required_channel: "@my_channel".to_string(),
            ..AccessConfig::default()
        };
        let reply_cfg = ReplyConfig::default();

        let channel = Arc::new(MockChannel::default());
        let sessions = Arc::new(SessionStore::new(12));
        let completion = Arc::new(SlowCompletion {
            delay: Duration::from_millis(delay_ms),
            calls: AtomicU32::new(0),
        });
        let consent = test_consent_store().await;

        let handler = Arc::new(BotHandler::new(
            &bot,
            &access,
            &reply_cfg,
            channel.clone(),
            membership,
            consent.clone(),
            sessions.clone(),
            completion.clone(),
        ));

        Fixture {
            handler,
            channel,
            sessions,
            completion,
            consent,
        }
    }

    fn text_update(update_id: i64, user_id: i64, text: &str) -> Update {
        Update {
            update_id,
            message: Some(Message {
                message_id: update_id,
                from: Some(User {
                    id: user_id,
                    first_name: "Аня".to_string(),
                    username: None,
                }),
                chat: Chat {
                    id: user_id,
                    chat_type: "private".to_string(),
                },
                text: Some(text.to_string()),
            }),
            callback_query: None,
        }
    }

    fn callback_update(user_id: i64, data: &str) -> CallbackQuery {
        CallbackQuery {
            id: "cb-1".to_string(),
            from: User {
                id: user_id,
                first_name: "Аня".to_string(),
                username: None,
            },
            message: Some(Message {
                message_id: 1,
                from: None,
                chat: Chat {
                    id: user_id,
                    chat_type: "private".to_string(),
                },
                text: None,
            }),
            data: Some(data.to_string()),
        }
    }

    fn callback_as_update(user_id: i64, data: &str) -> Update {
        Update {
            update_id: 1,
            message: None,
            callback_query: Some(callback_update(user_id, data)),
        }
    }

    async fn wait_for_history(sessions: &SessionStore, bot: &str, user: i64, len: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while sessions.history(bot, user).await.len() < len {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {len} history entries"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/start@love_bot"), Some(Command::Start));
        assert_eq!(Command::parse("  /reset  "), Some(Command::Reset));
        assert_eq!(Command::parse("/unknown"), None);
        assert_eq!(Command::parse("привет"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[tokio::test]
    async fn test_unsubscribed_user_gets_subscribe_prompt_only() {
        let fx = fixture(false, 0).await;
        fx.handler.clone().handle_update(text_update(1, 42, "привет")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while fx.channel.sent_texts().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no prompt sent");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let sent = fx.channel.sent_texts();
        assert!(sent[0].contains("@my_channel"));
        // The reply engine never ran and nothing was recorded.
        assert_eq!(fx.completion.calls.load(Ordering::SeqCst), 0);
        assert!(fx.sessions.history("love_bot", 42).await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribed_unconsented_user_gets_consent_keyboard() {
        let fx = fixture(true, 0).await;
        fx.handler.clone().handle_update(text_update(1, 42, "привет")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while fx.channel.keyboards.lock().unwrap().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no keyboard sent");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_eligible_user_gets_generated_reply() {
        let fx = fixture(true, 0).await;
        fx.consent.set_accepted(42, true).await.unwrap();

        fx.handler.clone().handle_update(text_update(1, 42, "привет")).await;
        wait_for_history(&fx.sessions, "love_bot", 42, 2).await;

        assert_eq!(fx.channel.sent_texts(), vec!["r1"]);
        let history = fx.sessions.history("love_bot", 42).await;
        assert_eq!(history[0].content, "привет");
        assert_eq!(history[1].content, "r1");
    }

    #[tokio::test]
    async fn test_double_send_is_serialized_in_order() {
        let fx = fixture(true, 100).await;
        fx.consent.set_accepted(42, true).await.unwrap();

        // Second message arrives while the first reply is generating.
        fx.handler.clone().handle_update(text_update(1, 42, "m1")).await;
        fx.handler.clone().handle_update(text_update(2, 42, "m2")).await;

        wait_for_history(&fx.sessions, "love_bot", 42, 4).await;

        let history = fx.sessions.history("love_bot", 42).await;
        let contents: Vec<&str> = history.iter().map(|t| t.content.as_str()).collect();
        // Exactly two intact pairs, in send order, never interleaved.
        assert_eq!(contents, vec!["m1", "r1", "m2", "r2"]);
    }

    #[tokio::test]
    async fn test_accept_then_decline_double_tap_ends_unconsented() {
        // Membership latency models the real getChatMember call: the
        // accept is still mid-re-check when the decline arrives.
        let fx = fixture_with_membership(
            Arc::new(SlowMembership {
                subscribed: true,
                delay: Duration::from_millis(100),
            }),
            0,
        )
        .await;

        fx.handler
            .clone()
            .handle_update(callback_as_update(42, CONSENT_ACCEPT))
            .await;
        fx.handler
            .clone()
            .handle_update(callback_as_update(42, CONSENT_DECLINE))
            .await;

        // Both button presses are answered, in press order.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while fx.channel.sent_texts().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "callbacks not drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = fx.channel.sent_texts();
        assert!(sent[0].contains("Спасибо"));
        assert!(sent[1].contains("/start"));

        // The later decline wins: no consent record remains.
        assert!(!fx.consent.has_accepted(42).await.unwrap());
    }

    #[tokio::test]
    async fn test_consent_accept_callback_records_and_confirms() {
        let fx = fixture(true, 0).await;
        fx.handler.handle_callback(callback_update(42, CONSENT_ACCEPT)).await;

        assert!(fx.consent.has_accepted(42).await.unwrap());
        let sent = fx.channel.sent_texts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Спасибо"));
    }

    #[tokio::test]
    async fn test_consent_accept_rechecks_subscription() {
        let fx = fixture(false, 0).await;
        fx.handler.handle_callback(callback_update(42, CONSENT_ACCEPT)).await;

        // No record written; user is pointed back at the channel.
        assert!(!fx.consent.has_accepted(42).await.unwrap());
        assert!(fx.channel.sent_texts()[0].contains("@my_channel"));
    }

    #[tokio::test]
    async fn test_consent_decline_callback_deletes_record() {
        let fx = fixture(true, 0).await;
        fx.consent.set_accepted(42, true).await.unwrap();

        fx.handler.handle_callback(callback_update(42, CONSENT_DECLINE)).await;
        assert!(!fx.consent.has_accepted(42).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_command_clears_history() {
        let fx = fixture(true, 0).await;
        fx.consent.set_accepted(42, true).await.unwrap();
        fx.sessions
            .append_exchange("love_bot", 42, aviary_core::turn::Turn::user("a"), aviary_core::turn::Turn::assistant("b"))
            .await;

        fx.handler.clone().handle_update(text_update(1, 42, "/reset")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while fx.channel.sent_texts().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no confirmation sent");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.sessions.history("love_bot", 42).await.is_empty());
    }

    #[tokio::test]
    async fn test_start_command_greets_eligible_user() {
        let fx = fixture(true, 0).await;
        fx.consent.set_accepted(42, true).await.unwrap();

        fx.handler.clone().handle_update(text_update(1, 42, "/start")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while fx.channel.sent_texts().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "no greeting sent");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.channel.sent_texts(), vec!["Привет!"]);
        assert_eq!(fx.completion.calls.load(Ordering::SeqCst), 0);
    }
}
