//! Telegram Bot API adapter.
//!
//! The daemon's only transport: long-poll `getUpdates` plus the handful of
//! send/answer calls the control loop needs. Wire structs cover exactly the
//! fields the dispatcher consumes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Telegram caps message text at 4096 chars; leave room for framing.
pub const MAX_REPLY_CHARS: usize = 3500;

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("telegram api error: {0}")]
    Api(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileInfo {
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

pub struct BotClient {
    http: reqwest::Client,
    base: String,
    file_base: String,
    poll_timeout: Duration,
}

impl BotClient {
    pub fn new(token: &str, poll_timeout_secs: u64) -> Result<Self, TelegramError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base: format!("{}/bot{}", API_BASE, token),
            file_base: format!("{}/file/bot{}", API_BASE, token),
            // The HTTP call must outlive the server-side long poll.
            poll_timeout: Duration::from_secs(poll_timeout_secs + 15),
        })
    }

    async fn call<T: DeserializeOwned + Default>(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<T, TelegramError> {
        let url = format!("{}/{}", self.base, method);
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(payload)
            .send()
            .await?;
        let api: ApiResponse<T> = response.json().await?;
        if !api.ok {
            return Err(TelegramError::Api(
                api.description
                    .unwrap_or_else(|| format!("{} returned ok=false", method)),
            ));
        }
        api.result
            .ok_or_else(|| TelegramError::Api(format!("{} returned no result", method)))
    }

    /// Fetch updates with ids >= `offset`, long-polling server-side.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
            self.poll_timeout,
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramError> {
        let _: Value = self
            .call(
                "sendMessage",
                &json!({ "chat_id": chat_id, "text": text }),
                SEND_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    pub async fn send_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        rows: &[Vec<InlineButton>],
    ) -> Result<(), TelegramError> {
        let _: Value = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": chat_id,
                    "text": text,
                    "reply_markup": { "inline_keyboard": rows },
                }),
                SEND_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    pub async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TelegramError> {
        let mut payload = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            payload["text"] = Value::String(text.to_string());
        }
        // answerCallbackQuery returns a bare boolean.
        let _: bool = self.call("answerCallbackQuery", &payload, SEND_TIMEOUT).await?;
        Ok(())
    }

    /// Upload a local file as a document with a caption.
    pub async fn send_document(
        &self,
        chat_id: i64,
        path: &Path,
        caption: &str,
    ) -> Result<(), TelegramError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output.txt".to_string());
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        let url = format!("{}/sendDocument", self.base);
        let response = self
            .http
            .post(&url)
            .timeout(DOWNLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;
        let api: ApiResponse<Value> = response.json().await?;
        if !api.ok {
            return Err(TelegramError::Api(
                api.description
                    .unwrap_or_else(|| "sendDocument returned ok=false".to_string()),
            ));
        }
        Ok(())
    }

    pub async fn get_file(&self, file_id: &str) -> Result<FileInfo, TelegramError> {
        self.call("getFile", &json!({ "file_id": file_id }), SEND_TIMEOUT)
            .await
    }

    /// Download a file previously resolved via `get_file` into `dest`.
    pub async fn download_file(&self, file_path: &str, dest: &Path) -> Result<(), TelegramError> {
        let url = format!("{}/{}", self.file_base, file_path);
        let response = self
            .http
            .get(&url)
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;
        let response = response.error_for_status()?;
        let bytes = response.bytes().await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}
