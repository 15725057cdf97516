//! Slack adapter: Events API in, Web API out.
//!
//! Inbound events arrive over HTTP on a router the boot code mounts into
//! the kernel's web multiplexer; the handler verifies the shared secret,
//! answers the URL-verification challenge, and queues decoded events for
//! the serve loop. The serve loop emits them into the kernel one at a
//! time, preserving arrival order. Outbound traffic uses the Web API
//! (`chat.postMessage`, `chat.update`, `reactions.add`, `chat.delete`,
//! `chat.meMessage`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, watch};

use crate::bot::web::web_err;
use crate::config::Config;
use crate::conn::{Connector, EventCallback, SeenRing, DEFAULT_SEEN_WINDOW};
use crate::error::ConnectorError;
use crate::msg::{Kind, Message, ReplyTarget, SendPayload, User};

const API_BASE: &str = "https://slack.com/api";

#[derive(Debug, Clone)]
pub struct SlackSettings {
    /// Bot token (`xoxb-…`) for the Web API.
    pub token: String,
    /// Shared secret the Events API request must carry.
    pub verification_token: String,
    /// Our own bot ID, used to drop our echoes.
    pub bot_id: String,
}

impl SlackSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            token: config.get("slack.token", ""),
            verification_token: config.get("slack.verification", ""),
            bot_id: config.get("slack.bot_id", ""),
        }
    }
}

/// Wire shape of an Events API POST.
#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    token: Option<String>,
    challenge: Option<String>,
    event_id: Option<String>,
    event: Option<SlackEvent>,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    kind: String,
    subtype: Option<String>,
    user: Option<String>,
    bot_id: Option<String>,
    channel: Option<String>,
    text: Option<String>,
    ts: Option<String>,
    thread_ts: Option<String>,
    message: Option<Box<SlackEvent>>,
    reaction: Option<String>,
    item: Option<ReactionItem>,
}

#[derive(Debug, Deserialize)]
struct ReactionItem {
    channel: Option<String>,
    ts: Option<String>,
}

pub struct SlackConnector {
    settings: SlackSettings,
    http: reqwest::Client,
    callback: RwLock<Option<EventCallback>>,
    /// Decoded events from the HTTP handler to the serve loop.
    queue_tx: mpsc::Sender<(Kind, Message)>,
    queue_rx: Mutex<Option<mpsc::Receiver<(Kind, Message)>>>,
    seen: Mutex<SeenRing>,
    /// U… -> display name, filled lazily from users.info.
    users: RwLock<HashMap<String, String>>,
    channels: RwLock<HashMap<String, String>>,
    prefix: String,
}

impl SlackConnector {
    pub fn new(settings: SlackSettings, prefix: String) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(256);
        Arc::new(Self {
            settings,
            http: reqwest::Client::new(),
            callback: RwLock::new(None),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            seen: Mutex::new(SeenRing::new(DEFAULT_SEEN_WINDOW)),
            users: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            prefix,
        })
    }

    /// Router for the Events API endpoint; the boot code mounts it under
    /// the kernel web multiplexer (e.g. at `/evt/slack`).
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", post(events_handler))
            .with_state(self.clone())
    }

    /// Decode one event into (kind, message). None for events we drop.
    async fn decode(&self, ev: SlackEvent) -> Option<(Kind, Message)> {
        if ev.kind == "reaction_added" {
            let item = ev.item?;
            let mut msg = Message::new(
                User::new(ev.user.clone().unwrap_or_default(), self.user_name(ev.user.as_deref()?).await),
                item.channel.unwrap_or_default(),
                ev.reaction.unwrap_or_default(),
            );
            if let Some(ts) = item.ts {
                msg.extra.insert("slack.ts".to_string(), ts);
            }
            return Some((Kind::Reaction, msg));
        }
        if ev.kind != "message" {
            return None;
        }
        // Our own traffic comes back with our bot_id.
        if let Some(bot_id) = &ev.bot_id {
            if *bot_id == self.settings.bot_id {
                return None;
            }
        }

        // message_changed wraps the new text one level down.
        if ev.subtype.as_deref() == Some("message_changed") {
            let inner = ev.message?;
            let user = inner.user.clone().unwrap_or_default();
            let name = self.user_name(&user).await;
            let channel = ev.channel.clone().unwrap_or_default();
            let mut msg = Message::new(
                User::new(user, name),
                channel,
                self.normalize(&inner.text.unwrap_or_default()).await,
            );
            if let Some(ts) = &inner.ts {
                msg.extra.insert("edit_of".to_string(), ts.clone());
                msg.extra.insert("backend_id".to_string(), ts.clone());
                msg.extra.insert("slack.ts".to_string(), ts.clone());
            }
            return Some((Kind::Edit, msg));
        }
        if ev.subtype.is_some() {
            return None;
        }

        let user = ev.user?;
        let name = self.user_name(&user).await;
        let channel = ev.channel.unwrap_or_default();
        let body = self.normalize(&ev.text.unwrap_or_default()).await;

        let mut msg = Message::new(User::new(user, name), channel.clone(), body)
            .detect_command(&self.prefix);
        msg.channel_name = self.channel_label(&channel).await;
        msg.direct = channel.starts_with('D');
        if let Some(ts) = &ev.ts {
            msg.extra.insert("slack.ts".to_string(), ts.clone());
            msg.extra.insert("backend_id".to_string(), ts.clone());
        }

        // Thread replies surface as Reply with the thread root as target.
        if let Some(thread_ts) = ev.thread_ts {
            if Some(&thread_ts) != ev.ts.as_ref() {
                msg.extra
                    .insert("slack.thread_ts".to_string(), thread_ts);
                return Some((Kind::Reply, msg));
            }
        }
        Some((Kind::Message, msg))
    }

    /// Strip Slack markup: `<@U…>` to `@name`, `<url|label>` to url,
    /// HTML entities decoded.
    async fn normalize(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find('<') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('>') {
                Some(close) => {
                    let token = &after[..close];
                    if let Some(user) = token.strip_prefix('@') {
                        let id = user.split('|').next().unwrap_or(user);
                        out.push('@');
                        out.push_str(&self.user_name(id).await);
                    } else {
                        out.push_str(token.split('|').next().unwrap_or(token));
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('<');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        html_escape::decode_html_entities(&out).into_owned()
    }

    async fn user_name(&self, id: &str) -> String {
        if let Some(name) = self.users.read().unwrap().get(id) {
            return name.clone();
        }
        let fetched = self
            .api(
                "users.info",
                serde_json::json!({ "user": id }),
            )
            .await
            .ok()
            .and_then(|v| {
                v.pointer("/user/profile/display_name")
                    .or_else(|| v.pointer("/user/name"))
                    .and_then(|n| n.as_str())
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| id.to_string());
        self.users
            .write()
            .unwrap()
            .insert(id.to_string(), fetched.clone());
        fetched
    }

    async fn channel_label(&self, id: &str) -> String {
        if let Some(name) = self.channels.read().unwrap().get(id) {
            return name.clone();
        }
        let fetched = self
            .api("conversations.info", serde_json::json!({ "channel": id }))
            .await
            .ok()
            .and_then(|v| {
                v.pointer("/channel/name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| id.to_string());
        self.channels
            .write()
            .unwrap()
            .insert(id.to_string(), fetched.clone());
        fetched
    }

    async fn api(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ConnectorError> {
        let resp: serde_json::Value = self
            .http
            .post(format!("{API_BASE}/{method}"))
            .bearer_auth(&self.settings.token)
            .json(&payload)
            .send()
            .await?
            .json()
            .await?;
        if resp.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let why = resp
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            return Err(ConnectorError::Rejected(format!("{method}: {why}")));
        }
        Ok(resp)
    }

    fn ts_of(resp: &serde_json::Value) -> String {
        resp.get("ts")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }

    fn reply_ts(target: &ReplyTarget) -> String {
        match target {
            ReplyTarget::Id(id) => id.clone(),
            ReplyTarget::Msg(m) => m
                .extra
                .get("slack.thread_ts")
                .or_else(|| m.extra.get("slack.ts"))
                .cloned()
                .unwrap_or_else(|| m.id.clone()),
        }
    }
}

/// The Events API endpoint.
async fn events_handler(
    State(conn): State<Arc<SlackConnector>>,
    body: String,
) -> Response {
    let envelope: EventEnvelope = match serde_json::from_str(&body) {
        Ok(e) => e,
        Err(e) => return web_err(StatusCode::BAD_REQUEST, format!("bad event: {e}")),
    };
    // Constant-time compare, same as the admin gate's secret check.
    let token_ok = envelope.token.as_deref().is_some_and(|t| {
        bool::from(
            t.as_bytes()
                .ct_eq(conn.settings.verification_token.as_bytes()),
        )
    });
    if !token_ok {
        return web_err(StatusCode::UNAUTHORIZED, "bad verification token");
    }
    if envelope.kind == "url_verification" {
        return Json(serde_json::json!({
            "challenge": envelope.challenge.unwrap_or_default()
        }))
        .into_response();
    }
    // Slack redelivers unacked events; drop replays by event_id.
    if let Some(id) = &envelope.event_id {
        if !conn.seen.lock().unwrap().insert(id) {
            return StatusCode::OK.into_response();
        }
    }
    if let Some(event) = envelope.event {
        if let Some((kind, msg)) = conn.decode(event).await {
            let _ = conn.queue_tx.send((kind, msg)).await;
        }
    }
    StatusCode::OK.into_response()
}

#[async_trait]
impl Connector for SlackConnector {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn identity(&self) -> String {
        self.settings.bot_id.clone()
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
                unfurl_links,
            } => {
                let mut req = serde_json::json!({ "channel": channel, "text": body });
                if let Some(unfurl) = unfurl_links {
                    req["unfurl_links"] = unfurl.into();
                }
                if !attachments.is_empty() {
                    req["blocks"] = attachments
                        .iter()
                        .map(|a| {
                            serde_json::json!({
                                "type": "image",
                                "image_url": a.url,
                                "alt_text": a.alt_text,
                            })
                        })
                        .collect::<Vec<_>>()
                        .into();
                }
                Ok(Self::ts_of(&self.api("chat.postMessage", req).await?))
            }
            SendPayload::Action { channel, body } => {
                let req = serde_json::json!({ "channel": channel, "text": body });
                Ok(Self::ts_of(&self.api("chat.meMessage", req).await?))
            }
            SendPayload::Reply {
                channel,
                body,
                target,
            } => {
                let req = serde_json::json!({
                    "channel": channel,
                    "text": body,
                    "thread_ts": Self::reply_ts(&target),
                });
                Ok(Self::ts_of(&self.api("chat.postMessage", req).await?))
            }
            SendPayload::Edit { channel, body, id } => {
                let req = serde_json::json!({ "channel": channel, "text": body, "ts": id });
                Ok(Self::ts_of(&self.api("chat.update", req).await?))
            }
            SendPayload::Reaction {
                channel,
                emoji,
                target,
            } => {
                let ts = target
                    .extra
                    .get("slack.ts")
                    .cloned()
                    .ok_or(ConnectorError::Unsupported("reaction without slack.ts"))?;
                self.api(
                    "reactions.add",
                    serde_json::json!({
                        "channel": channel,
                        "name": emoji.trim_matches(':'),
                        "timestamp": ts,
                    }),
                )
                .await?;
                Ok(ts)
            }
            SendPayload::Delete { channel, id } => {
                self.api(
                    "chat.delete",
                    serde_json::json!({ "channel": channel, "ts": id }),
                )
                .await?;
                Ok(id)
            }
        }
    }

    async fn who(&self, channel: &str) -> Vec<String> {
        let ids = match self
            .api(
                "conversations.members",
                serde_json::json!({ "channel": channel }),
            )
            .await
        {
            Ok(v) => v
                .get("members")
                .and_then(|m| m.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            Err(_) => return Vec::new(),
        };
        let mut names = Vec::with_capacity(ids.len());
        for id in ids {
            names.push(self.user_name(&id).await);
        }
        names
    }

    async fn profile(&self, user_id: &str) -> Result<User, ConnectorError> {
        let name = self.user_name(user_id).await;
        Ok(User::new(user_id, name))
    }

    fn format_url(&self, url: &str, label: &str) -> String {
        if label.is_empty() {
            url.to_string()
        } else {
            format!("<{url}|{label}>")
        }
    }

    async fn channel_name(&self, id: &str) -> String {
        self.channel_label(id).await
    }

    async fn serve(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let mut rx = self
            .queue_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(ConnectorError::Protocol("slack serve started twice".into()))?;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                event = rx.recv() => {
                    match event {
                        Some((kind, msg)) => {
                            let cb = self.callback.read().unwrap().clone();
                            if let Some(cb) = cb {
                                cb(self.clone() as Arc<dyn Connector>, kind, msg).await;
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}
