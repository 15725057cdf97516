//! Mock connector for tests.
//!
//! Records every outbound payload instead of talking to a backend, and
//! synthesizes inbound traffic through the same callback path a real
//! adapter uses, so tests exercise the full dispatch chain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::bot::request::{Request, Values};
use crate::bot::Bot;
use crate::conn::{Connector, EventCallback};
use crate::error::ConnectorError;
use crate::msg::{Kind, Message, SendPayload, User};

/// Connector that collects everything sent through it.
pub struct MockConnector {
    identity: String,
    callback: RwLock<Option<EventCallback>>,
    sent: Mutex<Vec<SendPayload>>,
    who: RwLock<Vec<String>>,
    next_id: AtomicU64,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            identity: "mockbot".to_string(),
            callback: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            who: RwLock::new(vec![]),
            next_id: AtomicU64::new(1),
        })
    }

    /// Set the member list returned by `who`.
    pub fn set_who(&self, members: Vec<&str>) {
        *self.who.write().unwrap() = members.into_iter().map(str::to_string).collect();
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<SendPayload> {
        self.sent.lock().unwrap().clone()
    }

    /// Bodies of sent Message payloads, in order.
    pub fn message_bodies(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|p| match p {
                SendPayload::Message { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Feed an inbound event through the registered callback, awaiting the
    /// full dispatch like a real serve loop does.
    pub async fn deliver(self: &Arc<Self>, kind: Kind, msg: Message) {
        let cb = self.callback.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(self.clone() as Arc<dyn Connector>, kind, msg).await;
        }
    }

    /// Inbound chat text from `nick`, with command detection against the
    /// kernel's configured prefix.
    pub async fn say(self: &Arc<Self>, bot: &Arc<Bot>, channel: &str, nick: &str, body: &str) {
        let prefix = bot.config().get("bot.prefix", "!");
        let mut msg = Message::new(User::new(nick, nick), channel, body).detect_command(&prefix);
        msg.channel_name = channel.to_string();
        self.deliver(Kind::Message, msg).await;
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn set_callback(&self, cb: EventCallback) {
        *self.callback.write().unwrap() = Some(cb);
    }

    async fn send(&self, payload: SendPayload) -> Result<String, ConnectorError> {
        self.sent.lock().unwrap().push(payload);
        Ok(format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn who(&self, _channel: &str) -> Vec<String> {
        self.who.read().unwrap().clone()
    }

    async fn profile(&self, user_id: &str) -> Result<User, ConnectorError> {
        Ok(User::new(user_id, user_id))
    }

    fn emojis(&self) -> HashMap<String, String> {
        HashMap::from([("tea".to_string(), "🍵".to_string())])
    }

    async fn serve(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let _ = shutdown.wait_for(|stop| *stop).await;
        Ok(())
    }
}

/// Build a Request directly, with values extracted by `pattern`, for
/// plugin tests that call a handler without a full kernel round-trip.
pub fn synth_request(
    bot: Arc<Bot>,
    conn: Arc<MockConnector>,
    kind: Kind,
    pattern: &str,
    channel: &str,
    nick: &str,
    body: &str,
) -> Option<Request> {
    let re = regex::Regex::new(pattern).expect("test regex must compile");
    let prefix = bot.config().get("bot.prefix", "!");
    let mut msg = Message::new(User::new(nick, nick), channel, body).detect_command(&prefix);
    msg.channel_name = channel.to_string();
    let caps = re.captures(&msg.body)?;
    let values = Values::from_captures(&re, &caps);
    Some(Request {
        bot,
        conn: conn as Arc<dyn Connector>,
        kind,
        msg,
        values,
        args: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_is_recorded_with_fresh_ids() {
        let conn = MockConnector::new();
        let id1 = conn.send(SendPayload::message("#a", "one")).await.unwrap();
        let id2 = conn.send(SendPayload::message("#a", "two")).await.unwrap();
        assert_ne!(id1, id2);
        assert_eq!(conn.message_bodies(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn synth_request_extracts_values() {
        let bot = Bot::new(Arc::new(crate::config::Config::open_in_memory().unwrap()));
        let conn = MockConnector::new();
        let req = synth_request(
            bot,
            conn,
            Kind::Message,
            r"^(?P<thing>\S+)\+\+$",
            "#bar",
            "alice",
            "beer++",
        )
        .unwrap();
        assert_eq!(req.values.get("thing"), "beer");
        assert!(!req.msg.command);
    }
}
