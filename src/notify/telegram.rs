//! Telegram Bot API notifier.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::Notifier;

const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

pub struct TelegramNotifier {
    http: Client,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http, token, chat_id })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API, self.token);
        let response = self
            .http
            .post(&url)
            .json(&SendMessage { chat_id: &self.chat_id, text: message })
            .send()
            .await
            .context("Telegram request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram sendMessage failed: {} - {}", status, body);
        }
        Ok(())
    }
}
