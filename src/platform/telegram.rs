// src/platform/telegram.rs
use std::{
    convert::Infallible,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use teloxide::{
    ApiError, RequestError,
    prelude::*,
    types::{ChatJoinRequest, Message as TelegramMessage},
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{ChatPlatform, HandlerSet, InboundEvent, PlatformApi, PlatformError, Session};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// How long `close` waits for the dispatcher to wind down before aborting it.
const DISPATCHER_GRACE: Duration = Duration::from_secs(2);

/// Telegram Bot API via long polling.
#[derive(Debug, Clone, Default)]
pub struct TelegramPlatform;

impl TelegramPlatform {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChatPlatform for TelegramPlatform {
    async fn open_session(
        &self,
        token: &str,
        handlers: HandlerSet,
    ) -> Result<Arc<dyn Session>, PlatformError> {
        let bot = Bot::new(token);

        // 1) Validate the token before we spawn anything
        let me = bot.get_me().await.map_err(map_request_error)?;
        let session_id = NEXT_SESSION.fetch_add(1, Ordering::SeqCst);
        info!(session_id, bot_user = %me.user.id, "telegram session authorized");

        // 2) Build the dptree handler: join requests and slash commands
        let api = TelegramApi { bot: bot.clone() };
        let handler = dptree::entry()
            .branch(Update::filter_chat_join_request().endpoint({
                let handlers = handlers.clone();
                let api = api.clone();
                move |req: ChatJoinRequest| {
                    let handlers = handlers.clone();
                    let api = api.clone();
                    async move {
                        let event = InboundEvent::JoinRequest {
                            chat_id: req.chat.id.to_string(),
                            user_id: req.from.id.to_string(),
                        };
                        handlers.dispatch(&api, event).await;
                        Ok::<(), Infallible>(())
                    }
                }
            }))
            .branch(Update::filter_message().endpoint({
                let handlers = handlers.clone();
                let api = api.clone();
                move |msg: TelegramMessage| {
                    let handlers = handlers.clone();
                    let api = api.clone();
                    async move {
                        if let Some(name) = msg.text().and_then(parse_command) {
                            let event = InboundEvent::Command {
                                chat_id: msg.chat.id.to_string(),
                                name,
                            };
                            handlers.dispatch(&api, event).await;
                        }
                        Ok::<(), Infallible>(())
                    }
                }
            }));

        // 3) Spawn the dispatcher; `close` wakes `shutdown` to stop it
        let shutdown = Arc::new(Notify::new());
        let shutdown_for_task = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut dispatcher = Dispatcher::builder(bot, handler)
                .default_handler(|_| async {})
                .build();
            tokio::select! {
                _ = dispatcher.dispatch() => {
                    error!(session_id, "Telegram dispatcher exited");
                }
                _ = shutdown_for_task.notified() => {
                    debug!(session_id, "Telegram dispatcher shutting down");
                }
            }
        });

        Ok(Arc::new(TelegramSession {
            id: session_id,
            api,
            shutdown,
            task: Mutex::new(Some(task)),
        }))
    }
}

#[derive(Clone)]
struct TelegramApi {
    bot: Bot,
}

#[async_trait]
impl PlatformApi for TelegramApi {
    async fn approve_join_request(&self, chat_id: &str, user_id: &str) -> Result<(), PlatformError> {
        let chat = parse_chat_id(chat_id)?;
        let user = user_id
            .parse::<u64>()
            .map_err(|e| PlatformError::Request(format!("bad user id `{user_id}`: {e}")))?;
        self.bot
            .approve_chat_join_request(chat, UserId(user))
            .await
            .map_err(map_request_error)?;
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), PlatformError> {
        let chat = parse_chat_id(chat_id)?;
        self.bot
            .send_message(chat, text)
            .await
            .map_err(map_request_error)?;
        Ok(())
    }
}

struct TelegramSession {
    id: u64,
    api: TelegramApi,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl PlatformApi for TelegramSession {
    async fn approve_join_request(&self, chat_id: &str, user_id: &str) -> Result<(), PlatformError> {
        self.api.approve_join_request(chat_id, user_id).await
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), PlatformError> {
        self.api.send_text(chat_id, text).await
    }
}

#[async_trait]
impl Session for TelegramSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn close(&self) {
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // already closed
        let Some(mut task) = task else { return };

        self.shutdown.notify_one();
        if tokio::time::timeout(DISPATCHER_GRACE, &mut task).await.is_err() {
            warn!(session_id = self.id, "Telegram dispatcher did not stop in time, aborting");
            task.abort();
        }
    }
}

fn parse_chat_id(chat_id: &str) -> Result<ChatId, PlatformError> {
    chat_id
        .parse::<i64>()
        .map(ChatId)
        .map_err(|e| PlatformError::Request(format!("bad chat id `{chat_id}`: {e}")))
}

fn map_request_error(err: RequestError) -> PlatformError {
    match err {
        RequestError::Api(ApiError::InvalidToken) => PlatformError::Unauthorized(err.to_string()),
        other => PlatformError::Request(other.to_string()),
    }
}

/// `/ping@my_bot extra` -> `ping`
fn parse_command(text: &str) -> Option<String> {
    let first = text.split_whitespace().next()?;
    let name = first.strip_prefix('/')?;
    let name = name.split('@').next().unwrap_or(name);
    if name.is_empty() {
        None
    } else {
        Some(name.to_lowercase())
    }
}
