use std::sync::Arc;

use reqwest::Client;
use serde::Deserialize;
use tokio::time::{sleep, Duration};

use super::{execute_command, Command};
use crate::context::AppContext;
use crate::Result;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const POLL_INTERVAL_SECS: u64 = 3;

/// Telegram Bot API client bound to one chat
#[derive(Clone)]
pub struct TelegramBot {
    client: Client,
    base_url: String,
    chat_id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

impl TelegramBot {
    pub fn new(token: &str, chat_id: i64) -> Self {
        Self::with_base_url(TELEGRAM_API_BASE, token, chat_id)
    }

    pub fn with_base_url(base_url: &str, token: &str, chat_id: i64) -> Self {
        Self {
            client: Client::new(),
            base_url: format!("{}/bot{}", base_url.trim_end_matches('/'), token),
            chat_id,
        }
    }

    /// Fetch updates newer than `offset`
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let url = format!("{}/getUpdates", self.base_url);
        let response: ApiResponse<Vec<Update>> = self
            .client
            .get(&url)
            .query(&[("offset", offset.to_string()), ("timeout", "0".to_string())])
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(response
                .description
                .unwrap_or_else(|| "getUpdates failed".to_string())
                .into());
        }
        Ok(response.result.unwrap_or_default())
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        let url = format!("{}/sendMessage", self.base_url);
        let response: ApiResponse<serde_json::Value> = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(response
                .description
                .unwrap_or_else(|| "sendMessage failed".to_string())
                .into());
        }
        Ok(())
    }

    /// Commands in `updates` that came from our chat, plus the next offset
    pub fn commands(&self, updates: &[Update], offset: i64) -> (Vec<Command>, i64) {
        let next = updates
            .iter()
            .map(|u| u.update_id + 1)
            .max()
            .unwrap_or(offset)
            .max(offset);

        let commands = updates
            .iter()
            .filter_map(|u| u.message.as_ref())
            .filter(|m| m.chat.id == self.chat_id)
            .filter_map(|m| m.text.as_deref())
            .filter_map(Command::parse)
            .collect();

        (commands, next)
    }

    /// Poll for commands while this node is MASTER, until shutdown
    pub async fn run(self, ctx: Arc<AppContext>) {
        let mut offset = 0;
        tracing::info!(chat_id = self.chat_id, "🤖 Telegram bot started");

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = sleep(Duration::from_secs(POLL_INTERVAL_SECS)) => {}
            }

            if !ctx.session.is_master() {
                continue;
            }

            let updates = match self.get_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    tracing::warn!("Telegram getUpdates failed: {}", e);
                    continue;
                }
            };

            let (commands, next) = self.commands(&updates, offset);
            offset = next;

            for command in commands {
                let reply = execute_command(&ctx, command).await;
                if let Err(e) = self.send_message(&reply).await {
                    tracing::warn!("Telegram reply failed: {}", e);
                }
            }
        }

        tracing::info!("Telegram bot stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn create_test_bot(server: &mockito::ServerGuard) -> TelegramBot {
        TelegramBot::with_base_url(&server.url(), "TOKEN", 42)
    }

    #[tokio::test]
    async fn test_get_updates_parses_commands() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/botTOKEN/getUpdates")
            .match_query(Matcher::UrlEncoded("offset".into(), "10".into()))
            .with_body(
                r#"{"ok":true,"result":[
                    {"update_id":10,"message":{"chat":{"id":42},"text":"/sell 55"}},
                    {"update_id":11,"message":{"chat":{"id":99},"text":"/stop"}},
                    {"update_id":12,"message":{"chat":{"id":42},"text":"hello"}}
                ]}"#,
            )
            .create_async()
            .await;

        let bot = create_test_bot(&server);
        let updates = bot.get_updates(10).await.unwrap();
        let (commands, next) = bot.commands(&updates, 10);

        mock.assert_async().await;
        assert_eq!(commands, vec![Command::Sell(Some(55))]);
        assert_eq!(next, 13);
    }

    #[tokio::test]
    async fn test_get_updates_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/botTOKEN/getUpdates")
            .match_query(Matcher::Any)
            .with_body(r#"{"ok":false,"description":"Unauthorized"}"#)
            .create_async()
            .await;

        let bot = create_test_bot(&server);
        let err = tokio_test::assert_err!(bot.get_updates(0).await);
        assert_eq!(err.to_string(), "Unauthorized");
    }

    #[tokio::test]
    async fn test_send_message_posts_to_chat() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::PartialJson(serde_json::json!({"chat_id": 42, "text": "hi"})))
            .with_body(r#"{"ok":true,"result":{}}"#)
            .create_async()
            .await;

        let bot = create_test_bot(&server);
        tokio_test::assert_ok!(bot.send_message("hi").await);
        mock.assert_async().await;
    }

    #[test]
    fn test_offset_never_goes_backwards() {
        let bot = TelegramBot::with_base_url("http://localhost", "T", 1);
        let (commands, next) = bot.commands(&[], 7);
        assert!(commands.is_empty());
        assert_eq!(next, 7);
    }
}
