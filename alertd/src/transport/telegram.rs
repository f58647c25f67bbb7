//! Telegram Bot API transport.
//!
//! Sends messages via `POST /bot<token>/sendMessage`. A bot can only write to
//! a chat that has started it, which gives this channel a real authorization
//! signal:
//! - `sendChatAction` probes whether a chat currently accepts us
//! - `403 Forbidden` on a send means the chat blocked or left the bot
//! - `my_chat_member` updates from `getUpdates` report joins and blocks
//!
//! Subscribers may be given as numeric chat ids or as `@username` for public
//! chats; membership updates are reported under both forms.
//!
//! 429 responses carry `parameters.retry_after`, which is handed back to the
//! agent so the whole channel pauses for that long.

use std::time::Duration;

use alert_queue::AuthorizationStatus;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ChannelTransport, OutboundMessage, TransportError, TransportEvent, truncate_message};
use crate::Result;
use crate::config::QueueSettings;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Pause after a failed `getUpdates` call.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

const DEFAULT_MAX_MSGS: i64 = 50;
const DEFAULT_MAX_AGE_SECS: i64 = 3600;

/// Telegram channel configuration (`[telegram]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Telegram Bot API token.
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Message template.
    #[serde(default = "default_message")]
    pub message: String,
    /// Parse mode for message formatting (HTML, Markdown, MarkdownV2).
    #[serde(default)]
    pub parse_mode: Option<String>,
    /// Long-poll timeout for `getUpdates`.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_max_msgs")]
    pub max_msgs: Option<i64>,
    #[serde(default = "default_max_age")]
    pub max_age_secs: Option<i64>,
    #[serde(default)]
    pub msgs_per_sec: Option<f64>,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_message() -> String {
    "${SEVERITY} ${category} alert on ${host} at ${time}:\n${msg}".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_max_msgs() -> Option<i64> {
    Some(DEFAULT_MAX_MSGS)
}

fn default_max_age() -> Option<i64> {
    Some(DEFAULT_MAX_AGE_SECS)
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            message: default_message(),
            parse_mode: None,
            poll_timeout_secs: default_poll_timeout(),
            max_msgs: default_max_msgs(),
            max_age_secs: default_max_age(),
            msgs_per_sec: None,
        }
    }
}

impl TelegramConfig {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_msgs: self.max_msgs,
            max_age_secs: self.max_age_secs,
            msgs_per_sec: self.msgs_per_sec,
        }
    }
}

/// Telegram Bot API transport.
pub struct TelegramTransport {
    config: TelegramConfig,
    client: Client,
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        if config.bot_token.trim().is_empty() {
            return Err(crate::Error::config("telegram config missing \"bot_token\""));
        }
        crate::install_rustls_provider();
        let client = Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 10))
            .build()
            .map_err(|e| crate::Error::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    async fn call(&self, method: &str, payload: &Value) -> std::result::Result<Value, TransportError> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(format!("Telegram request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or_default();
        classify_response(status, &body)?;
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn poll_updates(&self, events: mpsc::Sender<TransportEvent>, cancel: CancellationToken) {
        let mut offset: Option<i64> = None;

        loop {
            let payload = json!({
                "offset": offset,
                "timeout": self.config.poll_timeout_secs,
                "allowed_updates": ["my_chat_member"],
            });

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Telegram update poller shutting down");
                    return;
                }
                result = self.call("getUpdates", &payload) => result,
            };

            match result {
                Ok(updates) => {
                    let (parsed, next) = parse_updates(&updates);
                    if next.is_some() {
                        offset = next;
                    }
                    for event in parsed {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("Telegram getUpdates failed: {}", e);
                    let delay = match e {
                        TransportError::RateLimited {
                            retry_after: Some(d),
                        } => d,
                        _ => POLL_ERROR_BACKOFF,
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChannelTransport for TelegramTransport {
    fn channel_type(&self) -> &'static str {
        "telegram"
    }

    fn requires_authorization(&self) -> bool {
        true
    }

    async fn start(
        &self,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let me = self
            .call("getMe", &json!({}))
            .await
            .map_err(crate::Error::Transport)?;
        let username = me.get("username").and_then(Value::as_str).unwrap_or("?");
        info!("Telegram session started as @{}", username);

        let poller = Self {
            config: self.config.clone(),
            client: self.client.clone(),
        };
        let tx = events.clone();
        tokio::spawn(async move { poller.poll_updates(tx, cancel).await });

        let _ = events.send(TransportEvent::SessionStarted).await;
        Ok(())
    }

    async fn send(
        &self,
        address: &str,
        message: &OutboundMessage,
    ) -> std::result::Result<(), TransportError> {
        let mut payload = json!({
            "chat_id": address,
            "text": truncate_message(&message.body, TELEGRAM_MESSAGE_LIMIT),
        });
        if let Some(mode) = &self.config.parse_mode {
            payload["parse_mode"] = json!(mode);
        }
        self.call("sendMessage", &payload).await?;
        trace!("Telegram message sent to {}", address);
        Ok(())
    }

    async fn query_authorization(&self, address: &str) -> AuthorizationStatus {
        let payload = json!({ "chat_id": address, "action": "typing" });
        match self.call("sendChatAction", &payload).await {
            Ok(_) => AuthorizationStatus::Granted,
            Err(TransportError::AuthorizationLost(_)) => AuthorizationStatus::Denied,
            Err(e) => {
                debug!("cannot probe chat {}: {}", address, e);
                AuthorizationStatus::Unknown
            }
        }
    }

    async fn request_authorization(&self, address: &str) -> Result<()> {
        // A bot cannot invite a chat; the grant arrives as a my_chat_member update.
        info!("waiting for chat {} to start the bot", address);
        Ok(())
    }
}

/// Map a Bot API response to a transport outcome.
fn classify_response(status: u16, body: &Value) -> std::result::Result<(), TransportError> {
    let ok = body.get("ok").and_then(Value::as_bool).unwrap_or(false);
    if (200..300).contains(&status) && ok {
        return Ok(());
    }

    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description")
        .to_string();

    match status {
        403 => Err(TransportError::AuthorizationLost(description)),
        400 if description.contains("chat not found") => {
            Err(TransportError::AuthorizationLost(description))
        }
        429 => {
            let retry_after = body
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(Value::as_u64)
                .map(Duration::from_secs);
            Err(TransportError::RateLimited { retry_after })
        }
        400..=499 => Err(TransportError::Rejected(format!("{}: {}", status, description))),
        _ => Err(TransportError::Unavailable(format!("{}: {}", status, description))),
    }
}

/// A restricted bot can deliver while it is a member allowed to send messages.
fn can_post_while_restricted(member: &Value) -> bool {
    let flag = |name: &str| member.get(name).and_then(Value::as_bool);
    flag("is_member").unwrap_or(false) && flag("can_send_messages").unwrap_or(true)
}

/// Extract authorization events from a `getUpdates` result and the next offset.
fn parse_updates(result: &Value) -> (Vec<TransportEvent>, Option<i64>) {
    let Some(updates) = result.as_array() else {
        return (Vec::new(), None);
    };

    let mut events = Vec::new();
    let mut next_offset = None;

    for update in updates {
        if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
            next_offset = Some(next_offset.map_or(id + 1, |o: i64| o.max(id + 1)));
        }

        let Some(member) = update.get("my_chat_member") else {
            continue;
        };
        let Some(chat) = member.get("chat") else {
            continue;
        };
        let Some(chat_id) = chat.get("id").and_then(Value::as_i64) else {
            continue;
        };
        let mut addresses = vec![chat_id.to_string()];
        if let Some(username) = chat.get("username").and_then(Value::as_str) {
            addresses.push(format!("@{}", username));
        }

        let Some(new_member) = member.get("new_chat_member") else {
            continue;
        };
        let granted = match new_member.get("status").and_then(Value::as_str) {
            Some("member" | "administrator" | "creator") => true,
            Some("kicked" | "left") => false,
            // still in the chat, but possibly muted
            Some("restricted") => can_post_while_restricted(new_member),
            other => {
                trace!("ignoring chat member status {:?} for {}", other, chat_id);
                continue;
            }
        };

        for address in addresses {
            events.push(if granted {
                TransportEvent::AuthorizationGranted(address)
            } else {
                TransportEvent::AuthorizationRevoked(address)
            });
        }
    }

    (events, next_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_telegram_config_default() {
        let config = TelegramConfig::default();
        assert!(config.bot_token.is_empty());
        assert_eq!(config.api_base, "https://api.telegram.org");
        assert_eq!(config.max_msgs, Some(50));
        assert_eq!(config.max_age_secs, Some(3600));
        assert!(config.msgs_per_sec.is_none());
        assert!(config.message.contains("${SEVERITY} ${category} alert on ${host}"));
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let err = TelegramTransport::new(TelegramConfig::default()).err();
        assert!(matches!(err, Some(crate::Error::Configuration(_))));
    }

    #[test]
    fn test_method_url() {
        let transport = TelegramTransport::new(TelegramConfig {
            bot_token: "123:ABC".to_string(),
            api_base: "http://localhost:8081/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            transport.method_url("sendMessage"),
            "http://localhost:8081/bot123:ABC/sendMessage"
        );
    }

    #[test]
    fn test_classify_success() {
        assert!(classify_response(200, &json!({"ok": true, "result": true})).is_ok());
        assert!(classify_response(200, &json!({"ok": false})).is_err());
    }

    #[rstest]
    #[case(403, "Forbidden: bot was blocked by the user")]
    #[case(400, "Bad Request: chat not found")]
    fn test_classify_authorization_lost(#[case] status: u16, #[case] description: &str) {
        let err = classify_response(status, &json!({"ok": false, "description": description}))
            .unwrap_err();
        assert!(err.is_authorization_lost());
    }

    #[test]
    fn test_classify_rate_limit() {
        let body = json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 7",
            "parameters": {"retry_after": 7}
        });
        assert_eq!(
            classify_response(429, &body),
            Err(TransportError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            })
        );
    }

    #[rstest]
    #[case(400, false)]
    #[case(502, true)]
    fn test_classify_other_errors(#[case] status: u16, #[case] retryable: bool) {
        let err = classify_response(status, &json!({"ok": false, "description": "x"})).unwrap_err();
        assert_eq!(err.is_retryable(), retryable);
        assert!(!err.is_authorization_lost());
    }

    #[test]
    fn test_parse_updates() {
        let result = json!([
            {
                "update_id": 10,
                "my_chat_member": {
                    "chat": {"id": 42},
                    "new_chat_member": {"status": "member"}
                }
            },
            {
                "update_id": 11,
                "my_chat_member": {
                    "chat": {"id": -100},
                    "new_chat_member": {"status": "kicked"}
                }
            },
            {"update_id": 12, "message": {"text": "hi"}}
        ]);

        let (events, offset) = parse_updates(&result);
        assert_eq!(
            events,
            vec![
                TransportEvent::AuthorizationGranted("42".to_string()),
                TransportEvent::AuthorizationRevoked("-100".to_string()),
            ]
        );
        assert_eq!(offset, Some(13));
    }

    #[rstest]
    #[case(json!({"status": "restricted", "is_member": true, "can_send_messages": true}), true)]
    #[case(json!({"status": "restricted", "is_member": true, "can_send_messages": false}), false)]
    #[case(json!({"status": "restricted", "is_member": false}), false)]
    fn test_parse_updates_restricted(#[case] new_member: Value, #[case] granted: bool) {
        let result = json!([{
            "update_id": 1,
            "my_chat_member": {"chat": {"id": 7}, "new_chat_member": new_member}
        }]);
        let (events, _) = parse_updates(&result);
        let expected = if granted {
            TransportEvent::AuthorizationGranted("7".to_string())
        } else {
            TransportEvent::AuthorizationRevoked("7".to_string())
        };
        assert_eq!(events, vec![expected]);
    }

    #[test]
    fn test_parse_updates_reports_public_chat_username() {
        let result = json!([{
            "update_id": 5,
            "my_chat_member": {
                "chat": {"id": -1001, "username": "ops_alerts"},
                "new_chat_member": {"status": "administrator"}
            }
        }]);
        let (events, _) = parse_updates(&result);
        assert_eq!(
            events,
            vec![
                TransportEvent::AuthorizationGranted("-1001".to_string()),
                TransportEvent::AuthorizationGranted("@ops_alerts".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_updates_empty() {
        let (events, offset) = parse_updates(&json!([]));
        assert!(events.is_empty());
        assert_eq!(offset, None);
    }
}
