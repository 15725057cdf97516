//! Connector abstraction and shared adapter plumbing.
//!
//! A connector adapts one chat backend (IRC, Slack, Discord, the HTTP CLI)
//! to the canonical message model. Each runs its own serve loop on its own
//! task and pushes inbound events into the kernel through a registered
//! callback, so the kernel sees one connector's events in arrival order
//! without extra locking.

pub mod cli;
pub mod discord;
pub mod irc;
pub mod mock;
pub mod slack;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::ConnectorError;
use crate::msg::{Kind, Message, SendPayload, User};

/// Callback a connector invokes for every inbound event. The kernel
/// installs one per connector at wiring time; the connector awaits it
/// before reading its next event.
pub type EventCallback =
    Arc<dyn Fn(Arc<dyn Connector>, Kind, Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// A chat backend adapter.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short stable name ("irc", "slack", "discord", "cli", "mock").
    fn name(&self) -> &'static str;

    /// The bot's own identity on this backend (nick or user ID), used to
    /// ignore our own traffic and to exclude the bot from `$someone`.
    fn identity(&self) -> String;

    /// Install the inbound event callback. Called once, before `serve`.
    fn set_callback(&self, cb: EventCallback);

    /// Emit one outbound payload. Returns the backend message identifier
    /// usable for later Edit/Reply targeting. A backend that cannot express
    /// the payload kind returns [`ConnectorError::Unsupported`].
    async fn send(&self, payload: SendPayload) -> Result<String, ConnectorError>;

    /// Display names of users currently visible in `channel`.
    async fn who(&self, channel: &str) -> Vec<String>;

    /// Resolve a backend-scoped user ID to a profile.
    async fn profile(&self, user_id: &str) -> Result<User, ConnectorError>;

    /// Emoji table (name -> rendering) the backend supports.
    fn emojis(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Format a URL for display on this backend.
    fn format_url(&self, url: &str, label: &str) -> String {
        if label.is_empty() {
            url.to_string()
        } else {
            format!("{label} ({url})")
        }
    }

    /// Map channel ID to human name. Identity by default.
    async fn channel_name(&self, id: &str) -> String {
        id.to_string()
    }

    /// Map human channel name to backend ID. Identity by default.
    async fn channel_id(&self, name: &str) -> String {
        name.to_string()
    }

    /// Run the backend loop until fatally disconnected or `shutdown`
    /// flips. Reconnect policy for transient failures is internal. Takes
    /// `Arc<Self>` so the loop can hand clones of itself to the kernel
    /// callback.
    async fn serve(self: Arc<Self>, shutdown: watch::Receiver<bool>)
        -> Result<(), ConnectorError>;

    /// Open a forum thread (Discord). Returns the thread channel ID.
    async fn open_thread(
        &self,
        _channel: &str,
        _name: &str,
        _body: &str,
    ) -> Result<String, ConnectorError> {
        Err(ConnectorError::Unsupported("open_thread"))
    }

    /// Register a slash command (Discord).
    async fn register_slash(&self, _name: &str, _description: &str) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported("register_slash"))
    }
}

/// Default size of the per-connector replay dedup window.
pub const DEFAULT_SEEN_WINDOW: usize = 100;

/// Ring of recently seen backend event IDs. Backends redeliver on
/// reconnect; an event whose ID is already in the window is dropped.
pub struct SeenRing {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl SeenRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; returns false when it was already in the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// Token bucket for outbound rate limiting (IRC mainly).
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(0.1),
            burst: burst.max(1.0),
            tokens: burst.max(1.0),
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
        self.last = now;
    }

    /// Time to wait before the next send, consuming one token.
    pub fn reserve(&mut self) -> Duration {
        self.reserve_at(Instant::now())
    }

    fn reserve_at(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Duration::ZERO
        } else {
            let deficit = 1.0 - self.tokens;
            self.tokens -= 1.0;
            Duration::from_secs_f64(deficit / self.rate_per_sec)
        }
    }
}

/// Exponential reconnect backoff: base 2s, doubling to a cap, reset on
/// successful connect.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(cap: Duration) -> Self {
        let base = Duration::from_secs(2);
        Self {
            base,
            cap: cap.max(base),
            current: base,
        }
    }

    /// Delay to sleep before the next attempt.
    pub fn next(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(self.cap);
        d
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Split an oversize body into fragments of at most `max` bytes, breaking
/// on whitespace where possible and never inside a UTF-8 sequence.
pub fn split_message(body: &str, max: usize) -> Vec<String> {
    if max == 0 || body.len() <= max {
        return vec![body.to_string()];
    }
    let mut out = Vec::new();
    let mut rest = body;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(ws) = rest[..cut].rfind(char::is_whitespace) {
            if ws > 0 {
                cut = ws;
            }
        }
        out.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_ring_drops_replays() {
        let mut ring = SeenRing::new(3);
        assert!(ring.insert("a"));
        assert!(!ring.insert("a"));
        assert!(ring.insert("b"));
        assert!(ring.insert("c"));
        // "a" evicted after the window rolls.
        assert!(ring.insert("d"));
        assert!(ring.insert("a"));
    }

    #[test]
    fn token_bucket_spaces_sends() {
        let mut tb = TokenBucket::new(2.0, 1.0);
        let now = Instant::now();
        assert_eq!(tb.reserve_at(now), Duration::ZERO);
        let wait = tb.reserve_at(now);
        assert!(wait > Duration::from_millis(400) && wait <= Duration::from_millis(500));
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut b = Backoff::new(Duration::from_secs(10));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        assert_eq!(b.next(), Duration::from_secs(8));
        assert_eq!(b.next(), Duration::from_secs(10));
        assert_eq!(b.next(), Duration::from_secs(10));
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(2));
    }

    #[test]
    fn split_prefers_whitespace() {
        let parts = split_message("the quick brown fox jumps", 12);
        assert_eq!(parts, vec!["the quick", "brown fox", "jumps"]);
    }

    #[test]
    fn split_short_body_is_identity() {
        assert_eq!(split_message("short", 100), vec!["short"]);
    }

    #[test]
    fn split_never_breaks_utf8() {
        let parts = split_message("ééééééé", 5);
        for p in &parts {
            assert!(!p.is_empty());
        }
        assert_eq!(parts.concat(), "ééééééé");
    }
}
