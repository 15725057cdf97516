//! HTTP "CLI" connector.
//!
//! A stateless-client console over plain HTTP: the caller POSTs
//! `{user, payload, password}` and gets back every line the bot produced
//! for that session. Each caller gets a session channel keyed by a UUID
//! the first response hands back; the caller echoes it on later requests
//! so counters and factoids see a stable channel.
//!
//! Auth is a scoped app password (`scope = "cli"`) checked with bcrypt
//! through the config store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use tokio::sync::watch;

use crate::bot::web::web_err;
use crate::config::Config;
use crate::conn::{Connector, EventCallback};
use crate::error::ConnectorError;
use crate::msg::{Kind, Message, SendPayload, User};

/// Most sessions kept at once; the oldest is evicted beyond this.
const MAX_SESSIONS: usize = 256;

/// Session output buffers with insertion-ordered eviction, so a client
/// that never reuses its session id cannot grow the map without bound.
#[derive(Default)]
struct Buffers {
    order: VecDeque<String>,
    by_session: HashMap<String, Vec<String>>,
}

impl Buffers {
    fn ensure(&mut self, session: &str) {
        if self.by_session.contains_key(session) {
            return;
        }
        self.by_session.insert(session.to_string(), Vec::new());
        self.order.push_back(session.to_string());
        while self.order.len() > MAX_SESSIONS {
            if let Some(oldest) = self.order.pop_front() {
                self.by_session.remove(&oldest);
            }
        }
    }

    fn push(&mut self, session: &str, line: String) {
        self.ensure(session);
        if let Some(buf) = self.by_session.get_mut(session) {
            buf.push(line);
        }
    }

    fn drain(&mut self, session: &str) -> Vec<String> {
        self.by_session
            .get_mut(session)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

pub struct CliConnector {
    config: Arc<Config>,
    callback: RwLock<Option<EventCallback>>,
    buffers: Mutex<Buffers>,
    prefix: String,
    next_id: std::sync::atomic::AtomicU64,
}

impl CliConnector {
    pub fn new(config: Arc<Config>, prefix: String) -> Arc<Self> {
        Arc::new(Self {
            config,
            callback: RwLock::new(None),
            buffers: Mutex::new(Buffers::default()),
            prefix,
            next_id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// Router for the console endpoint; mounted under the kernel web
    /// multiplexer (e.g. at `/cli`).
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/api", post(api_handler))
            .with_state(self.clone())
    }

    fn drain(&self, session: &str) -> Vec<String> {
        self.buffers.lock().unwrap().drain(session)
    }

    fn buffer(&self, session: &str, line: String) {
        self.buffers.lock().unwrap().push(session, line);
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.buffers.lock().unwrap().by_session.len()
    }
}

#[derive(Debug, Deserialize)]
struct CliRequest {
    user: String,
    payload: String,
    password: String,
    /// Absent on the first request; the response returns the assigned one.
    session: Option<String>,
}

/// One console round trip: authenticate, synthesize a message, await the
/// full dispatch, return whatever the bot said back.
async fn api_handler(
    State(conn): State<Arc<CliConnector>>,
    Json(req): Json<CliRequest>,
) -> Response {
    if req.user.trim().is_empty() {
        return web_err(StatusCode::BAD_REQUEST, "user is required");
    }
    if !conn.config.check_password("cli", &req.password) {
        return web_err(StatusCode::UNAUTHORIZED, "bad password");
    }

    let session = req
        .session
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("cli:{}", uuid::Uuid::new_v4()));
    conn.buffers.lock().unwrap().ensure(&session);

    let mut msg = Message::new(
        User::new(req.user.clone(), req.user.clone()),
        session.clone(),
        req.payload,
    )
    .detect_command(&conn.prefix);
    // Console input is always addressed at the bot.
    msg.command = true;
    msg.direct = true;
    msg.channel_name = session.clone();

    let cb = conn.callback.read().unwrap().clone();
    match cb {
        Some(cb) => cb(conn.clone() as Arc<dyn Connector>, Kind::Message, msg).await,
        None => return web_err(StatusCode::SERVICE_UNAVAILABLE, "bot not wired"),
    }

    Json(serde_json::json!({
        "session": session,
        "messages": conn.drain(&session),
    }))
    .into_response()
}

#[async_trait]
impl Connector for CliConnector {
    fn name(&self) -> &'static str {
        "cli"
    }

    fn identity(&self) -> String {
        self.config.get("bot.nick", "hubbub")
    }

    fn set_callback(&self, cb: EventCallback) {
        *self.callback.write().unwrap() = Some(cb);
    }

    async fn send(&self, payload: SendPayload) -> Result<String, ConnectorError> {
        let line = match &payload {
            SendPayload::Message { body, .. } | SendPayload::Reply { body, .. } => body.clone(),
            SendPayload::Action { body, .. } => format!("* {body}"),
            SendPayload::Reaction { emoji, .. } => format!("[reaction: {emoji}]"),
            SendPayload::Edit { .. } | SendPayload::Delete { .. } => {
                return Err(ConnectorError::Unsupported("cli"));
            }
        };
        self.buffer(payload.channel(), line);
        let n = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(format!("cli-{n}"))
    }

    async fn who(&self, _channel: &str) -> Vec<String> {
        Vec::new()
    }

    async fn profile(&self, user_id: &str) -> Result<User, ConnectorError> {
        Ok(User::new(user_id, user_id))
    }

    /// Inbound traffic arrives through the HTTP router; the serve loop
    /// only waits for shutdown.
    async fn serve(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            if shutdown.changed().await.is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Arc<CliConnector> {
        let config = Arc::new(Config::open_in_memory().unwrap());
        config.set("bot.bcrypt_cost", "4").unwrap();
        config.set_password("cli", "hunter2").unwrap();
        CliConnector::new(config, "!".to_string())
    }

    #[tokio::test]
    async fn sends_buffer_per_session() {
        let c = conn();
        c.send(SendPayload::message("cli:a", "one")).await.unwrap();
        c.send(SendPayload::action("cli:a", "waves")).await.unwrap();
        c.send(SendPayload::message("cli:b", "other")).await.unwrap();

        assert_eq!(c.drain("cli:a"), vec!["one".to_string(), "* waves".to_string()]);
        // Draining empties the buffer.
        assert!(c.drain("cli:a").is_empty());
        assert_eq!(c.drain("cli:b"), vec!["other".to_string()]);
    }

    #[tokio::test]
    async fn edits_are_rejected() {
        let c = conn();
        let err = c
            .send(SendPayload::Edit {
                channel: "cli:a".into(),
                body: "new".into(),
                id: "cli-1".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Unsupported("cli")));
    }

    #[tokio::test]
    async fn session_map_is_bounded() {
        let c = conn();
        for i in 0..(MAX_SESSIONS + 40) {
            c.send(SendPayload::message(format!("cli:{i}"), "hi"))
                .await
                .unwrap();
        }
        assert_eq!(c.session_count(), MAX_SESSIONS);
        // The oldest sessions were evicted, the newest kept.
        assert!(c.drain("cli:0").is_empty());
        assert_eq!(
            c.drain(&format!("cli:{}", MAX_SESSIONS + 39)),
            vec!["hi".to_string()]
        );
    }

    #[tokio::test]
    async fn handler_round_trip() {
        let c = conn();
        c.set_callback(Arc::new(move |conn, _kind, msg| {
            let conn = conn.clone();
            let body = msg.body.clone();
            let channel = msg.channel.clone();
            Box::pin(async move {
                let _ = conn
                    .send(SendPayload::message(channel, format!("echo: {body}")))
                    .await;
            })
        }));

        let resp = api_handler(
            State(c.clone()),
            Json(CliRequest {
                user: "alice".into(),
                payload: "!ping".into(),
                password: "hunter2".into(),
                session: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(json["session"].as_str().unwrap().starts_with("cli:"));
        assert_eq!(json["messages"][0], "echo: ping");
    }

    #[tokio::test]
    async fn bad_password_is_unauthorized() {
        let c = conn();
        let resp = api_handler(
            State(c),
            Json(CliRequest {
                user: "alice".into(),
                payload: "hi".into(),
                password: "wrong".into(),
                session: None,
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
