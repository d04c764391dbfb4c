//! Telegram bot delivery and the `/update_now` command listener.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use super::ReportSink;
use crate::config::TelegramConfig;
use crate::orchestrator::Trigger;
use crate::types::{CycleReport, UpdateOutcome};

pub const UPDATE_COMMAND: &str = "/update_now";

/// Long-poll window for `getUpdates`, in seconds.
const POLL_SECS: u64 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telegram API error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotUpdate {
    pub update_id: i64,
    pub message: Option<BotMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotMessage {
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    chat_id: i64,
}

impl TelegramClient {
    pub fn new(
        api_base: impl Into<String>,
        token: impl Into<String>,
        chat_id: i64,
    ) -> Result<Self, TelegramError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_SECS + 15))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.into(),
            token: token.into(),
            chat_id,
        })
    }

    pub fn from_config(config: &TelegramConfig) -> anyhow::Result<Self> {
        let (Some(token), Some(chat_id)) = (&config.token, config.chat_id) else {
            anyhow::bail!("telegram needs both token and chat_id");
        };
        Ok(Self::new(&config.api_base, token, chat_id)?)
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.api_base.trim_end_matches('/'),
            self.token,
            method
        )
    }

    /// Sends MarkdownV2 `text` to the configured chat.
    pub async fn send_message(&self, text: &str) -> Result<(), TelegramError> {
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "MarkdownV2",
            }))
            .send()
            .await?;
        let _: serde_json::Value = unwrap_response(response.json().await?)?;
        Ok(())
    }

    /// Long-polls for bot updates after `offset`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<Vec<BotUpdate>, TelegramError> {
        let mut query = vec![("timeout", POLL_SECS.to_string())];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }
        let response = self
            .http
            .get(self.method_url("getUpdates"))
            .query(&query)
            .send()
            .await?;
        unwrap_response(response.json().await?)
    }
}

fn unwrap_response<T: DeserializeOwned>(response: ApiResponse<T>) -> Result<T, TelegramError> {
    match response {
        ApiResponse {
            ok: true,
            result: Some(result),
            ..
        } => Ok(result),
        ApiResponse { description, .. } => Err(TelegramError::Api(
            description.unwrap_or_else(|| "request rejected".to_string()),
        )),
    }
}

/// Escapes text for MarkdownV2.
pub fn escape_markdown(text: &str) -> String {
    const SPECIAL: &str = "_*[]()~`>#+-=|{}.!\\";
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if SPECIAL.contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escapes text for a MarkdownV2 code span.
fn escape_code(text: &str) -> String {
    text.replace('\\', "\\\\").replace('`', "\\`")
}

/// Cycle summary. `None` for quiet cycles where nothing changed.
pub fn report_message(report: &CycleReport) -> Option<String> {
    let counts = report.counts();
    let eventful =
        counts.updated + counts.rolled_back + counts.failed > 0 || report.fatal.is_some();
    if !eventful && !report.dry_run {
        return None;
    }

    let mut text = format!("🏠 Host: `{}`\n", escape_code(&report.host));
    if report.dry_run {
        text.push_str("🧪 *DRY RUN MODE*\n");
    }
    match &report.fatal {
        Some(fatal) => {
            text.push_str("⚠️ *Update cycle failed*\n");
            text.push_str(&format!("`{}`\n", escape_code(fatal)));
        }
        None => {
            text.push_str("🏁 *Update summary*\n");
            text.push_str(&escape_markdown(&report.summary()));
            text.push('\n');
        }
    }
    if let Some(bytes) = report.reclaimed_bytes {
        text.push_str(&escape_markdown(&format!(
            "🧹 Reclaimed {:.2} MB\n",
            bytes as f64 / 1_048_576.0
        )));
    }
    let when = report.finished_at.unwrap_or(report.started_at);
    text.push_str(&format!(
        "🕒 Time: `{}`",
        when.format("%Y-%m-%d %H:%M:%S")
    ));
    Some(text)
}

/// Alert for a container left down after a failed rollback.
pub fn escalation_message(host: &str, outcome: &UpdateOutcome) -> String {
    let error = outcome
        .error
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    format!(
        "🚨 *Container down*\n🏠 Host: `{}`\n📦 `{}` on `{}`\nDetails:\n`{}`",
        escape_code(host),
        escape_code(&outcome.action.container),
        escape_code(&outcome.action.image.to_string()),
        escape_code(&error)
    )
}

pub struct TelegramSink {
    client: TelegramClient,
}

impl TelegramSink {
    pub fn new(client: TelegramClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReportSink for TelegramSink {
    async fn publish(&self, report: &CycleReport) {
        if let Some(text) = report_message(report) {
            if let Err(e) = self.client.send_message(&text).await {
                warn!("Telegram notification failed: {}", e);
            }
        }
    }

    async fn escalate(&self, host: &str, outcome: &UpdateOutcome) {
        let text = escalation_message(host, outcome);
        if let Err(e) = self.client.send_message(&text).await {
            warn!("Telegram alert for {} failed: {}", outcome.action.container, e);
        }
    }
}

/// The command carried by `update`, if it came from `chat_id`. A trailing
/// `@botname` is dropped.
pub fn command_in(update: &BotUpdate, chat_id: i64) -> Option<String> {
    let message = update.message.as_ref()?;
    if message.chat.id != chat_id {
        return None;
    }
    let text = message.text.as_deref()?.trim();
    let command = text.split_whitespace().next()?;
    let command = command.split('@').next().unwrap_or(command);
    Some(command.to_lowercase())
}

/// Polls the bot for `/update_now` from the configured chat and queues a
/// cycle. At most one command waits behind a running cycle.
pub async fn listen_for_commands(
    client: TelegramClient,
    triggers: mpsc::Sender<Trigger>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        "Listening for {} on Telegram chat {}",
        UPDATE_COMMAND,
        client.chat_id()
    );
    let mut offset = None;
    loop {
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = client.get_updates(offset) => polled,
        };
        let updates = match polled {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Failed to fetch Telegram updates: {}", e);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = sleep(RETRY_DELAY) => continue,
                }
            }
        };

        for update in updates {
            offset = Some(update.update_id + 1);
            let Some(command) = command_in(&update, client.chat_id()) else {
                continue;
            };
            if command != UPDATE_COMMAND {
                debug!("Ignoring Telegram command {}", command);
                continue;
            }
            let reply = match triggers.try_send(Trigger::Command("telegram".into())) {
                Ok(()) => "⏳ *Manual update triggered*",
                Err(mpsc::error::TrySendError::Full(_)) => "⏳ An update is already queued",
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!("Update loop is gone, stopping Telegram listener");
                    return;
                }
            };
            info!("{} received from Telegram", UPDATE_COMMAND);
            if let Err(e) = client.send_message(reply).await {
                warn!("Telegram reply failed: {}", e);
            }
        }
    }
    info!("Telegram listener stopped");
}
