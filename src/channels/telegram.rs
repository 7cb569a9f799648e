//! Telegram Bot API gateway using long polling.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info};

use super::{parse_command, split_message, EventKind, Gateway, Incoming, MAX_MESSAGE_UNITS};
use crate::config::TelegramConfig;

pub struct TelegramGateway {
    client: Client,
    api_base: String,
    token: String,
    poll_timeout_secs: u64,
    offset: AtomicI64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    from: Option<Sender>,
    text: Option<String>,
    photo: Option<Vec<PhotoSize>>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: i64,
    first_name: String,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct File {
    file_path: Option<String>,
}

impl TelegramGateway {
    pub fn new(config: &TelegramConfig, token: &str) -> Result<Self> {
        // Must outlive the server-side long-poll timeout.
        let client = Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 15))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            poll_timeout_secs: config.poll_timeout_secs,
            offset: AtomicI64::new(0),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Telegram {method} request failed"))?;

        let status = response.status();
        let parsed: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Telegram {method} returned {status} with an unreadable body"))?;

        if !parsed.ok {
            anyhow::bail!(
                "Telegram {method} failed: {}",
                parsed.description.unwrap_or_else(|| status.to_string())
            );
        }
        parsed
            .result
            .with_context(|| format!("Telegram {method} returned no result"))
    }
}

/// Map one update to a bot event. Unsupported updates yield `None`.
fn parse_update(update: Update) -> Option<Incoming> {
    let message = update.message?;
    let sender = message.from?;
    let display_name = if sender.first_name.is_empty() {
        sender.username.unwrap_or_default()
    } else {
        sender.first_name
    };

    let kind = if let Some(photos) = message.photo {
        let largest = photos
            .into_iter()
            .max_by_key(|p| u64::from(p.width) * u64::from(p.height))?;
        EventKind::Photo {
            file_ref: largest.file_id,
        }
    } else {
        let text = message.text?;
        match parse_command(&text) {
            Some((name, args)) => EventKind::Command { name, args },
            None => EventKind::Text(text),
        }
    };

    Some(Incoming {
        chat_id: message.chat.id,
        user_id: sender.id,
        display_name,
        kind,
    })
}

#[async_trait]
impl Gateway for TelegramGateway {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn next_events(&self) -> Result<Vec<Incoming>> {
        let offset = self.offset.load(Ordering::SeqCst);
        let updates: Vec<Update> = self
            .call(
                "getUpdates",
                json!({
                    "offset": offset,
                    "timeout": self.poll_timeout_secs,
                    "allowed_updates": ["message"],
                }),
            )
            .await?;

        if let Some(last) = updates.iter().map(|u| u.update_id).max() {
            self.offset.store(last + 1, Ordering::SeqCst);
        }
        debug!("Received {} update(s)", updates.len());

        Ok(updates.into_iter().filter_map(parse_update).collect())
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_UNITS) {
            let _: serde_json::Value = self
                .call("sendMessage", json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let _: bool = self
            .call(
                "sendChatAction",
                json!({ "chat_id": chat_id, "action": "typing" }),
            )
            .await?;
        Ok(())
    }

    async fn download_file(&self, file_ref: &str) -> Result<TempPath> {
        let file: File = self.call("getFile", json!({ "file_id": file_ref })).await?;
        let file_path = file
            .file_path
            .context("Telegram getFile returned no file_path")?;

        let url = format!("{}/file/bot{}/{}", self.api_base, self.token, file_path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("File download failed")?
            .error_for_status()
            .context("File download failed")?;
        let bytes = response.bytes().await.context("File download failed")?;

        let mut tmp = tempfile::Builder::new()
            .prefix("mathtop-")
            .suffix(".jpg")
            .tempfile()
            .context("Failed to create temporary file")?;
        tmp.write_all(&bytes)
            .context("Failed to write temporary file")?;
        info!("Downloaded {} bytes for {file_ref}", bytes.len());

        Ok(tmp.into_temp_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> TelegramGateway {
        let config = TelegramConfig {
            bot_token: None,
            api_base: server.uri(),
            poll_timeout_secs: 0,
        };
        TelegramGateway::new(&config, "TOKEN").unwrap()
    }

    fn update(value: serde_json::Value) -> Update {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn text_update_becomes_text_event() {
        let incoming = parse_update(update(json!({
            "update_id": 1,
            "message": {
                "chat": {"id": 10},
                "from": {"id": 7, "first_name": "Ana"},
                "text": "¿cuánto es 2+2?"
            }
        })))
        .unwrap();

        assert_eq!(incoming.chat_id, 10);
        assert_eq!(incoming.user_id, 7);
        assert_eq!(incoming.display_name, "Ana");
        assert_eq!(incoming.kind, EventKind::Text("¿cuánto es 2+2?".into()));
    }

    #[test]
    fn photo_update_picks_the_largest_size() {
        let incoming = parse_update(update(json!({
            "update_id": 2,
            "message": {
                "chat": {"id": 10},
                "from": {"id": 7, "first_name": "Ana"},
                "photo": [
                    {"file_id": "small", "width": 90, "height": 90},
                    {"file_id": "large", "width": 1280, "height": 960},
                    {"file_id": "medium", "width": 320, "height": 240}
                ]
            }
        })))
        .unwrap();

        assert_eq!(
            incoming.kind,
            EventKind::Photo {
                file_ref: "large".into()
            }
        );
    }

    #[test]
    fn command_update_carries_args() {
        let incoming = parse_update(update(json!({
            "update_id": 3,
            "message": {
                "chat": {"id": 10},
                "from": {"id": 7, "first_name": "", "username": "ana"},
                "text": "/start 42"
            }
        })))
        .unwrap();

        assert_eq!(incoming.display_name, "ana");
        assert_eq!(
            incoming.kind,
            EventKind::Command {
                name: "start".into(),
                args: vec!["42".into()]
            }
        );
    }

    #[test]
    fn updates_without_message_are_skipped() {
        assert!(parse_update(update(json!({"update_id": 4}))).is_none());
    }

    #[tokio::test]
    async fn polling_advances_the_offset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getUpdates"))
            .and(body_partial_json(json!({"offset": 0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [
                    {"update_id": 5, "message": {"chat": {"id": 1}, "from": {"id": 1, "first_name": "A"}, "text": "hola"}},
                    {"update_id": 6}
                ]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getUpdates"))
            .and(body_partial_json(json!({"offset": 7})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": []
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server);
        let first = gateway.next_events().await.unwrap();
        assert_eq!(first.len(), 1);

        let second = gateway.next_events().await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn api_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "description": "Bad Request: chat not found"
            })))
            .mount(&server)
            .await;

        let err = gateway(&server).send_text(1, "hola").await.unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }

    #[tokio::test]
    async fn download_writes_a_temporary_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/getFile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": {"file_id": "abc", "file_path": "photos/file_1.jpg"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/file/botTOKEN/photos/file_1.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF]))
            .mount(&server)
            .await;

        let tmp = gateway(&server).download_file("abc").await.unwrap();
        assert_eq!(std::fs::read(&tmp).unwrap(), vec![0xFF, 0xD8, 0xFF]);

        let path = tmp.to_path_buf();
        drop(tmp);
        assert!(!path.exists());
    }
}
