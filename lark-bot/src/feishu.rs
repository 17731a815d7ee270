//! Feishu/Lark platform adapter.
//!
//! Two halves: [`FeishuCodec`] decodes webhook deliveries (URL-verification
//! challenges, AES-256-CBC encrypted payloads, verification-token checks,
//! mapping wire events into [`InboundEvent`]), and [`FeishuClient`] sends
//! replies through the Open Platform Bot API with a cached tenant access
//! token. Everything downstream of the codec works on decoded events only.

use crate::event::InboundEvent;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::Engine;
use lark_common::FeishuConfig;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

// ============================================================================
// Constants
// ============================================================================

const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;

const EVENT_MESSAGE_RECEIVE: &str = "im.message.receive_v1";
const EVENT_MESSAGE_READ: &str = "im.message.message_read_v1";
const EVENT_CARD_ACTION: &str = "card.action.trigger";

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    header: Option<EventHeader>,
    event: Option<Value>,
    challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    event_id: String,
    event_type: String,
    create_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageReceiveEvent {
    sender: MessageSender,
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct MessageSender {
    sender_id: SenderIds,
}

#[derive(Debug, Deserialize)]
struct SenderIds {
    open_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    chat_id: String,
    message_type: String,
    content: String,
    /// Bot mentions; each carries the placeholder key embedded in the text
    #[serde(default)]
    mentions: Vec<Mention>,
}

#[derive(Debug, Deserialize)]
struct Mention {
    key: String,
}

#[derive(Debug, Deserialize)]
struct MessageReadEvent {
    reader: Reader,
}

#[derive(Debug, Deserialize)]
struct Reader {
    reader_id: SenderIds,
}

#[derive(Debug, Deserialize)]
struct CardActionEvent {
    operator: CardOperator,
    action: CardWireAction,
}

#[derive(Debug, Deserialize)]
struct CardOperator {
    open_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CardWireAction {
    value: Option<Value>,
    /// Chosen option for select menus; buttons leave this unset.
    option: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TenantAccessTokenResponse {
    code: i32,
    msg: String,
    tenant_access_token: Option<String>,
    expire: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    code: i32,
    msg: String,
}

// ============================================================================
// Codec
// ============================================================================

/// Result of decoding one webhook delivery.
#[derive(Debug)]
pub enum ParsedPayload {
    /// URL-verification handshake; echo the challenge back.
    Challenge(String),
    /// A delivery we route.
    Event(InboundEvent),
    /// A kind this service does not handle. Acknowledged and dropped.
    Unsupported { event_type: String },
}

/// Decodes and verifies inbound webhook payloads.
pub struct FeishuCodec {
    encrypt_key: Option<String>,
    verification_token: Option<String>,
}

impl FeishuCodec {
    pub fn new(config: &FeishuConfig) -> Self {
        Self {
            encrypt_key: config.encrypt_key.clone(),
            verification_token: config.verification_token.clone(),
        }
    }

    /// Decrypt (when needed) and verify the raw payload into JSON.
    fn decode(&self, payload: &str) -> anyhow::Result<Value> {
        let json_value: Value = serde_json::from_str(payload)?;

        let decoded = if let Some(encrypt) = json_value.get("encrypt").and_then(|e| e.as_str()) {
            match &self.encrypt_key {
                Some(key) => {
                    let decrypted = Self::decrypt_aes_cbc(key, encrypt)?;
                    tracing::debug!("Feishu event decrypted successfully");
                    serde_json::from_str(&decrypted)?
                }
                None => {
                    anyhow::bail!("Received encrypted Feishu event but no encrypt_key configured")
                }
            }
        } else {
            json_value
        };

        self.verify_token(&decoded)?;
        Ok(decoded)
    }

    /// Check the verification token when one is configured. Challenges carry
    /// it at the top level, event deliveries inside the header.
    fn verify_token(&self, payload: &Value) -> anyhow::Result<()> {
        let Some(expected) = &self.verification_token else {
            return Ok(());
        };

        let delivered = payload
            .get("token")
            .and_then(Value::as_str)
            .or_else(|| {
                payload
                    .get("header")
                    .and_then(|h| h.get("token"))
                    .and_then(Value::as_str)
            });

        match delivered {
            Some(token) if token == expected => Ok(()),
            Some(_) => anyhow::bail!("Feishu verification token mismatch"),
            None => anyhow::bail!("Feishu payload carried no verification token"),
        }
    }

    /// Decode one event-webhook delivery.
    pub fn parse_event(&self, payload: &str) -> anyhow::Result<ParsedPayload> {
        let decoded = self.decode(payload)?;
        let envelope: EventEnvelope = serde_json::from_value(decoded)?;

        if let Some(challenge) = envelope.challenge {
            tracing::info!("Feishu URL verification challenge received");
            return Ok(ParsedPayload::Challenge(challenge));
        }

        let (Some(header), Some(event)) = (envelope.header, envelope.event) else {
            anyhow::bail!("Feishu event payload missing header or event body");
        };
        let timestamp = header
            .create_time
            .as_deref()
            .and_then(|t| t.parse::<i64>().ok())
            .unwrap_or_default();

        match header.event_type.as_str() {
            EVENT_MESSAGE_RECEIVE => {
                let msg: MessageReceiveEvent = serde_json::from_value(event)?;
                if msg.message.message_type != "text" {
                    return Ok(ParsedPayload::Unsupported {
                        event_type: format!(
                            "{}/{}",
                            EVENT_MESSAGE_RECEIVE, msg.message.message_type
                        ),
                    });
                }
                let user_id = msg
                    .sender
                    .sender_id
                    .open_id
                    .ok_or_else(|| anyhow::anyhow!("message sender has no open_id"))?;
                let raw = Self::extract_text_content(&msg.message.content).unwrap_or_default();
                let text = Self::strip_mentions(&raw, &msg.message.mentions);

                Ok(ParsedPayload::Event(InboundEvent::MessageReceived {
                    event_id: header.event_id,
                    user_id,
                    chat_id: msg.message.chat_id,
                    timestamp,
                    text,
                }))
            }
            EVENT_MESSAGE_READ => {
                let read: MessageReadEvent = serde_json::from_value(event)?;
                let user_id = read
                    .reader
                    .reader_id
                    .open_id
                    .ok_or_else(|| anyhow::anyhow!("read receipt has no reader open_id"))?;

                Ok(ParsedPayload::Event(InboundEvent::MessageRead {
                    event_id: header.event_id,
                    user_id,
                    timestamp,
                }))
            }
            other => Ok(ParsedPayload::Unsupported {
                event_type: other.to_string(),
            }),
        }
    }

    /// Decode one card-callback delivery (card callback 2.0 schema, the one
    /// that carries an event id in its header).
    pub fn parse_card_action(&self, payload: &str) -> anyhow::Result<ParsedPayload> {
        let decoded = self.decode(payload)?;
        let envelope: EventEnvelope = serde_json::from_value(decoded)?;

        if let Some(challenge) = envelope.challenge {
            tracing::info!("Feishu card URL verification challenge received");
            return Ok(ParsedPayload::Challenge(challenge));
        }

        let (Some(header), Some(event)) = (envelope.header, envelope.event) else {
            anyhow::bail!("Feishu card callback missing header or event body");
        };
        if header.event_type != EVENT_CARD_ACTION {
            return Ok(ParsedPayload::Unsupported {
                event_type: header.event_type,
            });
        }
        let timestamp = header
            .create_time
            .as_deref()
            .and_then(|t| t.parse::<i64>().ok())
            .unwrap_or_default();

        let card: CardActionEvent = serde_json::from_value(event)?;
        let user_id = card
            .operator
            .open_id
            .ok_or_else(|| anyhow::anyhow!("card action has no operator open_id"))?;

        // The action code lives in the element's value map; a select menu
        // additionally delivers the chosen option
        let mut params = match card.action.value {
            Some(Value::Object(map)) => Value::Object(map),
            _ => Value::Object(serde_json::Map::new()),
        };
        let action = params
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(option) = card.action.option {
            if let Some(map) = params.as_object_mut() {
                map.insert("option".to_string(), Value::String(option));
            }
        }

        Ok(ParsedPayload::Event(InboundEvent::CardAction {
            event_id: header.event_id,
            user_id,
            timestamp,
            action,
            params,
        }))
    }

    /// Decrypt an encrypted event using AES-256-CBC. The key is the SHA-256
    /// digest of the configured encrypt key; the IV is the first block of
    /// the base64-decoded payload.
    fn decrypt_aes_cbc(encrypt_key: &str, ciphertext_b64: &str) -> anyhow::Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(encrypt_key.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(ciphertext_b64)
            .map_err(|e| anyhow::anyhow!("Failed to decode base64 ciphertext: {e}"))?;
        if decoded.len() <= 16 {
            anyhow::bail!("Encrypted payload too short to contain an IV");
        }
        let (iv, ciphertext) = decoded.split_at(16);
        let iv: [u8; 16] = iv.try_into()?;

        let decryptor = Aes256CbcDec::new(&key.into(), &iv.into());
        let mut buffer = ciphertext.to_vec();
        let decrypted = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| anyhow::anyhow!("AES decryption failed: {e}"))?;

        String::from_utf8(decrypted.to_vec())
            .map_err(|e| anyhow::anyhow!("Decrypted content is not valid UTF-8: {e}"))
    }

    /// Extract plain text from a message content JSON string.
    fn extract_text_content(content: &str) -> Option<String> {
        if let Ok(json) = serde_json::from_str::<Value>(content) {
            if let Some(text) = json.get("text").and_then(|t| t.as_str()) {
                return Some(text.to_string());
            }
        }
        None
    }

    /// Remove mention placeholders ("@_user_1" etc.) left in group-chat text
    /// when the bot is addressed, then tidy the whitespace.
    fn strip_mentions(text: &str, mentions: &[Mention]) -> String {
        if mentions.is_empty() {
            return text.to_string();
        }
        let mut cleaned = text.to_string();
        for mention in mentions {
            cleaned = cleaned.replace(&mention.key, "");
        }
        cleaned.trim().to_string()
    }
}

// ============================================================================
// Token Cache
// ============================================================================

struct TokenCache {
    token: String,
    expires_at: Instant,
}

// ============================================================================
// Outbound Client
// ============================================================================

/// Sends messages through the Feishu Open Platform Bot API.
pub struct FeishuClient {
    app_id: String,
    app_secret: String,
    base_url: String,
    client: reqwest::Client,
    token_cache: Arc<RwLock<Option<TokenCache>>>,
}

/// Address a reply by id prefix: `ou_` is a user open_id, `oc_` a chat id.
fn receive_id_type(receive_id: &str) -> &'static str {
    if receive_id.starts_with("oc_") {
        "chat_id"
    } else {
        "open_id"
    }
}

impl FeishuClient {
    pub fn new(config: &FeishuConfig) -> Self {
        Self {
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            token_cache: Arc::new(RwLock::new(None)),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Get or refresh the tenant access token.
    async fn get_access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some(ref cached) = *cache {
                let now = Instant::now();
                if cached.expires_at > now + Duration::from_secs(TOKEN_REFRESH_MARGIN_SECS) {
                    return Ok(cached.token.clone());
                }
            }
        }

        let url = self.api_url("/auth/v3/tenant_access_token/internal");
        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret
        });

        let resp = self.client.post(&url).json(&body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Failed to get Feishu access token ({status}): {text}");
        }

        let data: TenantAccessTokenResponse = resp.json().await?;

        if data.code != 0 {
            anyhow::bail!("Feishu API error ({}): {}", data.code, data.msg);
        }

        let token = data
            .tenant_access_token
            .ok_or_else(|| anyhow::anyhow!("Missing tenant_access_token in response"))?;
        let expire = data.expire.unwrap_or(7200);

        {
            let mut cache = self.token_cache.write().await;
            *cache = Some(TokenCache {
                token: token.clone(),
                expires_at: Instant::now() + Duration::from_secs(expire),
            });
        }

        tracing::debug!("Feishu access token refreshed, expires in {} seconds", expire);
        Ok(token)
    }

    /// Send a plain text message to a user or chat.
    pub async fn send_text(&self, receive_id: &str, text: &str) -> anyhow::Result<()> {
        let content = serde_json::json!({ "text": text });
        self.send_message(receive_id, "text", &content.to_string())
            .await
    }

    /// Send an interactive card to a user or chat.
    pub async fn send_card(&self, receive_id: &str, card: &Value) -> anyhow::Result<()> {
        self.send_message(receive_id, "interactive", &card.to_string())
            .await
    }

    async fn send_message(
        &self,
        receive_id: &str,
        msg_type: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        let token = self.get_access_token().await?;

        let url = format!(
            "{}?receive_id_type={}",
            self.api_url("/im/v1/messages"),
            receive_id_type(receive_id)
        );

        let body = serde_json::json!({
            "receive_id": receive_id,
            "msg_type": msg_type,
            "content": content
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Feishu sendMessage failed ({status}): {text}");
        }

        let data: SendMessageResponse = resp.json().await?;

        if data.code != 0 {
            anyhow::bail!("Feishu sendMessage error ({}): {}", data.code, data.msg);
        }

        tracing::info!("Feishu message sent to {}", receive_id);
        Ok(())
    }
}
