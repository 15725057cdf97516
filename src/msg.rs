//! Canonical message model shared by every connector.
//!
//! Connectors decode backend events into [`Message`] values; the kernel
//! dispatches them and plugins answer with [`SendPayload`] records. All
//! backend quirks (Slack timestamps, Discord snowflakes) ride along in the
//! message's `extra` map so adapters can find them again on edit/react.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Dispatch channel and outbound semantics for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Message,
    Action,
    Reply,
    Reaction,
    Edit,
    Delete,
    Event,
    Help,
    Startup,
}

impl Kind {
    /// Kinds where a handler returning `true` stops the dispatch chain.
    /// Help and Startup are broadcast to every handler.
    pub fn short_circuits(self) -> bool {
        !matches!(self, Kind::Help | Kind::Startup)
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Kind::Message => "message",
            Kind::Action => "action",
            Kind::Reply => "reply",
            Kind::Reaction => "reaction",
            Kind::Edit => "edit",
            Kind::Delete => "delete",
            Kind::Event => "event",
            Kind::Help => "help",
            Kind::Startup => "startup",
        };
        f.write_str(s)
    }
}

/// A user as seen by one connector. Identity is backend-scoped; the kernel
/// never assumes IDs are comparable across connectors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    /// Stable backend-scoped ID (IRC nick, Slack `U…`, Discord snowflake).
    pub id: String,
    /// Display name.
    pub name: String,
    pub admin: bool,
    pub icon: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            admin: false,
            icon: None,
        }
    }
}

/// One inbound chat event in canonical form.
#[derive(Debug, Clone)]
pub struct Message {
    /// Kernel-assigned ID, used by the history ring and edit targeting.
    pub id: String,
    pub user: User,
    /// Backend-scoped channel ID.
    pub channel: String,
    /// Human-readable channel name, when the backend distinguishes it.
    pub channel_name: String,
    /// Body after markup normalization and prefix stripping.
    pub body: String,
    /// Body exactly as the backend delivered it.
    pub raw: String,
    pub direct: bool,
    /// True iff the body began with the command prefix (now stripped).
    pub command: bool,
    /// `/me`-style message.
    pub action: bool,
    pub time: DateTime<Utc>,
    /// Origin host, for connectors that report one (IRC).
    pub host: String,
    /// Connector-specific annotations (e.g. Slack raw `ts`).
    pub extra: HashMap<String, String>,
}

impl Message {
    pub fn new(user: User, channel: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user,
            channel: channel.into(),
            channel_name: String::new(),
            raw: body.clone(),
            body,
            direct: false,
            command: false,
            action: false,
            time: Utc::now(),
            host: String::new(),
            extra: HashMap::new(),
        }
    }

    /// Split off the command prefix. Marks the message as a command and
    /// strips the prefix when the body starts with it.
    pub fn detect_command(mut self, prefix: &str) -> Self {
        if !prefix.is_empty() {
            if let Some(rest) = self.body.strip_prefix(prefix) {
                self.command = true;
                self.body = rest.to_string();
            }
        }
        self
    }
}

/// An inline image attached to an outbound message.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ImageAttachment {
    pub url: String,
    pub alt_text: String,
    pub width: u32,
    pub height: u32,
}

/// Target of a reply: either an opaque backend ID (Slack thread_ts,
/// Discord message ID) or the message being replied to.
#[derive(Debug, Clone)]
pub enum ReplyTarget {
    Id(String),
    Msg(Box<Message>),
}

impl ReplyTarget {
    /// The backend identifier the adapter should thread on.
    pub fn id<'a>(&'a self, key: &str) -> &'a str {
        match self {
            ReplyTarget::Id(id) => id,
            ReplyTarget::Msg(m) => m.extra.get(key).map(String::as_str).unwrap_or(&m.id),
        }
    }
}

/// Outbound send arguments, tagged by kind so adapters fan out without
/// inspecting loose variadic values.
#[derive(Debug, Clone)]
pub enum SendPayload {
    Message {
        channel: String,
        body: String,
        attachments: Vec<ImageAttachment>,
        unfurl_links: Option<bool>,
    },
    Action {
        channel: String,
        body: String,
    },
    Reply {
        channel: String,
        body: String,
        target: ReplyTarget,
    },
    Edit {
        channel: String,
        body: String,
        id: String,
    },
    Reaction {
        channel: String,
        emoji: String,
        target: Box<Message>,
    },
    Delete {
        channel: String,
        id: String,
    },
}

impl SendPayload {
    /// Plain message with no attachments.
    pub fn message(channel: impl Into<String>, body: impl Into<String>) -> Self {
        SendPayload::Message {
            channel: channel.into(),
            body: body.into(),
            attachments: Vec::new(),
            unfurl_links: None,
        }
    }

    pub fn action(channel: impl Into<String>, body: impl Into<String>) -> Self {
        SendPayload::Action {
            channel: channel.into(),
            body: body.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            SendPayload::Message { .. } => Kind::Message,
            SendPayload::Action { .. } => Kind::Action,
            SendPayload::Reply { .. } => Kind::Reply,
            SendPayload::Edit { .. } => Kind::Edit,
            SendPayload::Reaction { .. } => Kind::Reaction,
            SendPayload::Delete { .. } => Kind::Delete,
        }
    }

    pub fn channel(&self) -> &str {
        match self {
            SendPayload::Message { channel, .. }
            | SendPayload::Action { channel, .. }
            | SendPayload::Reply { channel, .. }
            | SendPayload::Edit { channel, .. }
            | SendPayload::Reaction { channel, .. }
            | SendPayload::Delete { channel, .. } => channel,
        }
    }

    /// The filterable text body, when this kind carries one.
    pub fn body(&self) -> Option<&str> {
        match self {
            SendPayload::Message { body, .. }
            | SendPayload::Action { body, .. }
            | SendPayload::Reply { body, .. }
            | SendPayload::Edit { body, .. } => Some(body),
            _ => None,
        }
    }

    pub(crate) fn set_body(&mut self, new: String) {
        match self {
            SendPayload::Message { body, .. }
            | SendPayload::Action { body, .. }
            | SendPayload::Reply { body, .. }
            | SendPayload::Edit { body, .. } => *body = new,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_detection_strips_prefix() {
        let m = Message::new(User::new("u1", "alice"), "#general", "!roll 2d6")
            .detect_command("!");
        assert!(m.command);
        assert_eq!(m.body, "roll 2d6");
        assert_eq!(m.raw, "!roll 2d6");
    }

    #[test]
    fn non_command_left_alone() {
        let m = Message::new(User::new("u1", "alice"), "#general", "hello there")
            .detect_command("!");
        assert!(!m.command);
        assert_eq!(m.body, "hello there");
    }

    #[test]
    fn reply_target_prefers_metadata_key() {
        let mut m = Message::new(User::new("u", "n"), "C1", "hi");
        m.extra.insert("slack.ts".to_string(), "167.002".to_string());
        let t = ReplyTarget::Msg(Box::new(m));
        assert_eq!(t.id("slack.ts"), "167.002");
    }

    #[test]
    fn payload_kind_mapping() {
        assert_eq!(SendPayload::message("c", "b").kind(), Kind::Message);
        assert_eq!(SendPayload::action("c", "b").kind(), Kind::Action);
        assert!(Kind::Message.short_circuits());
        assert!(!Kind::Help.short_circuits());
        assert!(!Kind::Startup.short_circuits());
    }
}
