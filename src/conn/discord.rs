//! Discord adapter.
//!
//! Gateway v10 over a raw WebSocket for inbound events and the REST API
//! for everything outbound; no SDK crate. Intents are limited to guilds,
//! guild messages, message content, and reactions. Plugins can register
//! slash commands before boot; the adapter pushes them to Discord once
//! READY arrives. Forum threads are exposed through `open_thread`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::config::Config;
use crate::conn::{Backoff, Connector, EventCallback, SeenRing, DEFAULT_SEEN_WINDOW};
use crate::error::ConnectorError;
use crate::msg::{Kind, Message, ReplyTarget, SendPayload, User};

const API_BASE: &str = "https://discord.com/api/v10";
const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// guilds | guild messages | guild message reactions | message content
const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 10) | (1 << 15);

/// Gateway opcodes.
mod opcode {
    pub const DISPATCH: u64 = 0;
    pub const HEARTBEAT: u64 = 1;
    pub const IDENTIFY: u64 = 2;
    pub const RECONNECT: u64 = 7;
    pub const INVALID_SESSION: u64 = 9;
    pub const HELLO: u64 = 10;
    pub const HEARTBEAT_ACK: u64 = 11;
}

#[derive(Debug, Clone)]
pub struct DiscordSettings {
    pub token: String,
    /// Application ID for slash-command registration.
    pub application_id: String,
    pub backoff_cap: Duration,
}

impl DiscordSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            token: config.get("discord.token", ""),
            application_id: config.get("discord.application_id", ""),
            backoff_cap: Duration::from_secs(config.get_int("discord.backoff_cap", 300) as u64),
        }
    }
}

pub struct DiscordConnector {
    settings: DiscordSettings,
    http: reqwest::Client,
    callback: RwLock<Option<EventCallback>>,
    seen: Mutex<SeenRing>,
    /// Slash commands queued by plugins; flushed at READY.
    slash: Mutex<Vec<(String, String)>>,
    bot_user_id: RwLock<String>,
    /// channel -> author names seen there, backing `who`.
    members: RwLock<HashMap<String, HashSet<String>>>,
    prefix: String,
}

impl DiscordConnector {
    pub fn new(settings: DiscordSettings, prefix: String) -> Arc<Self> {
        Arc::new(Self {
            settings,
            http: reqwest::Client::new(),
            callback: RwLock::new(None),
            seen: Mutex::new(SeenRing::new(DEFAULT_SEEN_WINDOW)),
            slash: Mutex::new(Vec::new()),
            bot_user_id: RwLock::new(String::new()),
            members: RwLock::new(HashMap::new()),
            prefix,
        })
    }

    async fn emit(self: &Arc<Self>, kind: Kind, msg: Message) {
        let cb = self.callback.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(self.clone() as Arc<dyn Connector>, kind, msg).await;
        }
    }

    async fn rest(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ConnectorError> {
        let mut req = self
            .http
            .request(method, format!("{API_BASE}{path}"))
            .header("Authorization", format!("Bot {}", self.settings.token));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ConnectorError::Rejected(format!("{status}: {text}")));
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(serde_json::Value::Null);
        }
        Ok(resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    /// One gateway session; Err asks the serve loop to reconnect.
    async fn session(
        self: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let (ws, _) = connect_async(GATEWAY_URL).await.map_err(Box::new)?;
        let (mut sink, mut stream) = ws.split();

        let mut last_seq: Option<u64> = None;
        let mut heartbeat = tokio::time::interval(Duration::from_secs(41));
        let mut identified = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                }
                _ = heartbeat.tick() => {
                    if identified {
                        let beat = serde_json::json!({ "op": opcode::HEARTBEAT, "d": last_seq });
                        sink.send(WsMessage::Text(beat.to_string().into()))
                            .await
                            .map_err(Box::new)?;
                    }
                }
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | None => {
                            return Err(ConnectorError::NotConnected);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(Box::new(e).into()),
                    };
                    let payload: serde_json::Value = serde_json::from_str(&frame)?;
                    let op = payload.get("op").and_then(|v| v.as_u64()).unwrap_or(255);
                    if let Some(s) = payload.get("s").and_then(|v| v.as_u64()) {
                        last_seq = Some(s);
                    }
                    match op {
                        opcode::HELLO => {
                            let interval_ms = payload
                                .pointer("/d/heartbeat_interval")
                                .and_then(|v| v.as_u64())
                                .unwrap_or(41_000);
                            heartbeat = tokio::time::interval(
                                Duration::from_millis(interval_ms.max(1_000)),
                            );
                            let identify = serde_json::json!({
                                "op": opcode::IDENTIFY,
                                "d": {
                                    "token": self.settings.token,
                                    "intents": INTENTS,
                                    "properties": {
                                        "os": std::env::consts::OS,
                                        "browser": "hubbub",
                                        "device": "hubbub",
                                    },
                                },
                            });
                            sink.send(WsMessage::Text(identify.to_string().into()))
                                .await
                                .map_err(Box::new)?;
                            identified = true;
                        }
                        opcode::DISPATCH => {
                            let event = payload
                                .get("t")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            if let Some(data) = payload.get("d") {
                                self.dispatch(&event, data.clone()).await;
                            }
                        }
                        opcode::RECONNECT | opcode::INVALID_SESSION => {
                            return Err(ConnectorError::Protocol(
                                "gateway asked for a reconnect".into(),
                            ));
                        }
                        opcode::HEARTBEAT_ACK => {}
                        _ => {}
                    }
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, event: &str, data: serde_json::Value) {
        match event {
            "READY" => {
                if let Some(id) = data.pointer("/user/id").and_then(|v| v.as_str()) {
                    *self.bot_user_id.write().unwrap() = id.to_string();
                }
                tracing::info!("Discord gateway ready");
                self.flush_slash_commands().await;
            }
            "MESSAGE_CREATE" | "MESSAGE_UPDATE" => {
                let author_id = data
                    .pointer("/author/id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if author_id.is_empty() || author_id == *self.bot_user_id.read().unwrap() {
                    return;
                }
                let message_id = data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                // Updates reuse the original message id, so the edit
                // timestamp distinguishes one revision from the next.
                let dedup_key = if event == "MESSAGE_UPDATE" {
                    let edited = data
                        .get("edited_timestamp")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    format!("{event}:{message_id}:{edited}")
                } else {
                    format!("{event}:{message_id}")
                };
                if !self.seen.lock().unwrap().insert(&dedup_key) {
                    return;
                }
                let author = data
                    .pointer("/author/username")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&author_id)
                    .to_string();
                let channel = data
                    .get("channel_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let content = data
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();

                self.members
                    .write()
                    .unwrap()
                    .entry(channel.clone())
                    .or_default()
                    .insert(author.clone());

                let mut msg = Message::new(User::new(&author_id, &author), &channel, content)
                    .detect_command(&self.prefix);
                msg.channel_name = channel.clone();
                msg.direct = data.get("guild_id").is_none();
                msg.extra
                    .insert("backend_id".to_string(), message_id.clone());
                msg.extra.insert("discord.id".to_string(), message_id);

                let kind = if event == "MESSAGE_UPDATE" {
                    msg.extra.insert(
                        "edit_of".to_string(),
                        msg.extra.get("backend_id").cloned().unwrap_or_default(),
                    );
                    Kind::Edit
                } else if data.get("referenced_message").map(|v| !v.is_null()) == Some(true) {
                    if let Some(parent) = data
                        .pointer("/referenced_message/id")
                        .and_then(|v| v.as_str())
                    {
                        msg.extra
                            .insert("discord.reply_to".to_string(), parent.to_string());
                    }
                    Kind::Reply
                } else {
                    Kind::Message
                };
                self.emit(kind, msg).await;
            }
            "MESSAGE_REACTION_ADD" => {
                let user_id = data
                    .get("user_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if user_id == *self.bot_user_id.read().unwrap() {
                    return;
                }
                let channel = data
                    .get("channel_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let emoji = data
                    .pointer("/emoji/name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let mut msg = Message::new(User::new(&user_id, &user_id), &channel, emoji);
                if let Some(target) = data.get("message_id").and_then(|v| v.as_str()) {
                    msg.extra
                        .insert("discord.id".to_string(), target.to_string());
                }
                self.emit(Kind::Reaction, msg).await;
            }
            _ => {}
        }
    }

    async fn flush_slash_commands(&self) {
        let app_id = self.settings.application_id.clone();
        if app_id.is_empty() {
            return;
        }
        let pending: Vec<(String, String)> = self.slash.lock().unwrap().clone();
        for (name, description) in pending {
            let body = serde_json::json!({
                "name": name,
                "description": description,
                "type": 1,
            });
            if let Err(e) = self
                .rest(
                    reqwest::Method::POST,
                    &format!("/applications/{app_id}/commands"),
                    Some(body),
                )
                .await
            {
                tracing::warn!(command = %name, error = %e, "slash command registration failed");
            }
        }
    }

    fn target_id(target: &ReplyTarget) -> String {
        match target {
            ReplyTarget::Id(id) => id.clone(),
            ReplyTarget::Msg(m) => m
                .extra
                .get("discord.id")
                .cloned()
                .unwrap_or_else(|| m.id.clone()),
        }
    }
}

#[async_trait]
impl Connector for DiscordConnector {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn identity(&self) -> String {
        self.bot_user_id.read().unwrap().clone()
    }

    fn set_callback(&self, cb: EventCallback) {
        *self.callback.write().unwrap() = Some(cb);
    }

    async fn send(&self, payload: SendPayload) -> Result<String, ConnectorError> {
        match payload {
            SendPayload::Message {
                channel,
                body,
                attachments,
                ..
            } => {
                let mut req = serde_json::json!({ "content": body });
                if !attachments.is_empty() {
                    req["embeds"] = attachments
                        .iter()
                        .map(|a| serde_json::json!({ "image": { "url": a.url } }))
                        .collect::<Vec<_>>()
                        .into();
                }
                let resp = self
                    .rest(
                        reqwest::Method::POST,
                        &format!("/channels/{channel}/messages"),
                        Some(req),
                    )
                    .await?;
                Ok(resp
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string())
            }
            SendPayload::Action { channel, body } => {
                let req = serde_json::json!({ "content": format!("*{body}*") });
                let resp = self
                    .rest(
                        reqwest::Method::POST,
                        &format!("/channels/{channel}/messages"),
                        Some(req),
                    )
                    .await?;
                Ok(resp
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string())
            }
            SendPayload::Reply {
                channel,
                body,
                target,
            } => {
                let req = serde_json::json!({
                    "content": body,
                    "message_reference": { "message_id": Self::target_id(&target) },
                });
                let resp = self
                    .rest(
                        reqwest::Method::POST,
                        &format!("/channels/{channel}/messages"),
                        Some(req),
                    )
                    .await?;
                Ok(resp
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string())
            }
            SendPayload::Edit { channel, body, id } => {
                self.rest(
                    reqwest::Method::PATCH,
                    &format!("/channels/{channel}/messages/{id}"),
                    Some(serde_json::json!({ "content": body })),
                )
                .await?;
                Ok(id)
            }
            SendPayload::Reaction {
                channel,
                emoji,
                target,
            } => {
                let id = target
                    .extra
                    .get("discord.id")
                    .cloned()
                    .unwrap_or_else(|| target.id.clone());
                let encoded: String = emoji
                    .trim_matches(':')
                    .bytes()
                    .flat_map(|b| format!("%{b:02X}").into_bytes())
                    .map(char::from)
                    .collect();
                self.rest(
                    reqwest::Method::PUT,
                    &format!("/channels/{channel}/messages/{id}/reactions/{encoded}/@me"),
                    None,
                )
                .await?;
                Ok(id)
            }
            SendPayload::Delete { channel, id } => {
                self.rest(
                    reqwest::Method::DELETE,
                    &format!("/channels/{channel}/messages/{id}"),
                    None,
                )
                .await?;
                Ok(id)
            }
        }
    }

    async fn who(&self, channel: &str) -> Vec<String> {
        self.members
            .read()
            .unwrap()
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn profile(&self, user_id: &str) -> Result<User, ConnectorError> {
        let resp = self
            .rest(reqwest::Method::GET, &format!("/users/{user_id}"), None)
            .await?;
        let name = resp
            .get("username")
            .and_then(|v| v.as_str())
            .unwrap_or(user_id);
        let mut user = User::new(user_id, name);
        user.icon = resp
            .get("avatar")
            .and_then(|v| v.as_str())
            .map(|hash| format!("https://cdn.discordapp.com/avatars/{user_id}/{hash}.png"));
        Ok(user)
    }

    async fn serve(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let mut backoff = Backoff::new(self.settings.backoff_cap);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.session(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let wait = backoff.next();
                    tracing::warn!(error = %e, ?wait, "Discord gateway dropped; reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    async fn open_thread(
        &self,
        channel: &str,
        name: &str,
        body: &str,
    ) -> Result<String, ConnectorError> {
        let req = serde_json::json!({
            "name": name,
            "message": { "content": body },
        });
        let resp = self
            .rest(
                reqwest::Method::POST,
                &format!("/channels/{channel}/threads"),
                Some(req),
            )
            .await?;
        Ok(resp
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    async fn register_slash(&self, name: &str, description: &str) -> Result<(), ConnectorError> {
        self.slash
            .lock()
            .unwrap()
            .push((name.to_string(), description.to_string()));
        // Already connected: push immediately instead of waiting for READY.
        if !self.bot_user_id.read().unwrap().is_empty() {
            self.flush_slash_commands().await;
            self.slash.lock().unwrap().clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intents_cover_guilds_messages_reactions_content() {
        assert_eq!(INTENTS & 1, 1);
        assert_ne!(INTENTS & (1 << 9), 0);
        assert_ne!(INTENTS & (1 << 10), 0);
        assert_ne!(INTENTS & (1 << 15), 0);
    }

    #[tokio::test]
    async fn own_messages_are_ignored() {
        let conn = DiscordConnector::new(
            DiscordSettings {
                token: "t".into(),
                application_id: String::new(),
                backoff_cap: Duration::from_secs(10),
            },
            "!".to_string(),
        );
        *conn.bot_user_id.write().unwrap() = "42".to_string();

        let delivered = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count = delivered.clone();
        conn.set_callback(Arc::new(move |_c, _k, _m| {
            let count = count.clone();
            Box::pin(async move {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })
        }));

        conn.dispatch(
            "MESSAGE_CREATE",
            serde_json::json!({
                "id": "100", "channel_id": "C", "content": "hi",
                "author": { "id": "42", "username": "me" },
            }),
        )
        .await;
        assert_eq!(delivered.load(std::sync::atomic::Ordering::SeqCst), 0);

        conn.dispatch(
            "MESSAGE_CREATE",
            serde_json::json!({
                "id": "101", "channel_id": "C", "content": "hi",
                "author": { "id": "7", "username": "alice" },
            }),
        )
        .await;
        assert_eq!(delivered.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Replay of the same message ID is deduplicated.
        conn.dispatch(
            "MESSAGE_CREATE",
            serde_json::json!({
                "id": "101", "channel_id": "C", "content": "hi",
                "author": { "id": "7", "username": "alice" },
            }),
        )
        .await;
        assert_eq!(delivered.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_edits_of_one_message_all_deliver() {
        let conn = DiscordConnector::new(
            DiscordSettings {
                token: "t".into(),
                application_id: String::new(),
                backoff_cap: Duration::from_secs(10),
            },
            "!".to_string(),
        );
        let bodies: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = bodies.clone();
        conn.set_callback(Arc::new(move |_c, _k, m| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(m.body);
            })
        }));

        for (content, edited) in [("first edit", "ts-1"), ("second edit", "ts-2")] {
            conn.dispatch(
                "MESSAGE_UPDATE",
                serde_json::json!({
                    "id": "300", "channel_id": "C", "content": content,
                    "edited_timestamp": edited,
                    "author": { "id": "7", "username": "alice" },
                }),
            )
            .await;
        }
        assert_eq!(*bodies.lock().unwrap(), vec!["first edit", "second edit"]);

        // A gateway replay of the same revision still gets dropped.
        conn.dispatch(
            "MESSAGE_UPDATE",
            serde_json::json!({
                "id": "300", "channel_id": "C", "content": "second edit",
                "edited_timestamp": "ts-2",
                "author": { "id": "7", "username": "alice" },
            }),
        )
        .await;
        assert_eq!(bodies.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reply_kind_from_referenced_message() {
        let conn = DiscordConnector::new(
            DiscordSettings {
                token: "t".into(),
                application_id: String::new(),
                backoff_cap: Duration::from_secs(10),
            },
            "!".to_string(),
        );
        let seen: Arc<Mutex<Vec<Kind>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        conn.set_callback(Arc::new(move |_c, k, _m| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(k);
            })
        }));
        conn.dispatch(
            "MESSAGE_CREATE",
            serde_json::json!({
                "id": "200", "channel_id": "C", "content": "this",
                "author": { "id": "7", "username": "alice" },
                "referenced_message": { "id": "150" },
            }),
        )
        .await;
        assert_eq!(*seen.lock().unwrap(), vec![Kind::Reply]);
    }
}
