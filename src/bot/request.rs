//! Per-dispatch request bundle and handler types.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use regex::{Captures, Regex};

use crate::bot::Bot;
use crate::conn::Connector;
use crate::error::ConnectorError;
use crate::msg::{ImageAttachment, Kind, Message, ReplyTarget, SendPayload};

/// Captured regex group values for one dispatch. Named groups are keyed by
/// name, unnamed groups by their index as a string. Absent keys resolve to
/// the empty string, never an error.
#[derive(Debug, Clone, Default)]
pub struct Values(HashMap<String, String>);

impl Values {
    /// Extract all groups from a match.
    pub fn from_captures(re: &Regex, caps: &Captures<'_>) -> Self {
        let mut map = HashMap::new();
        for (i, name) in re.capture_names().enumerate() {
            if i == 0 {
                continue; // whole match
            }
            let text = caps.get(i).map(|m| m.as_str().to_string());
            if let Some(text) = text {
                match name {
                    Some(n) => map.insert(n.to_string(), text),
                    None => map.insert(i.to_string(), text),
                };
            }
        }
        Values(map)
    }

    /// Value of a capture group; "" when the group is absent or unmatched.
    pub fn get(&self, name: &str) -> &str {
        self.0.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Values(map)
    }
}

/// Everything a handler gets for one matched event. Lives for exactly one
/// dispatch chain.
pub struct Request {
    pub bot: Arc<Bot>,
    pub conn: Arc<dyn Connector>,
    pub kind: Kind,
    pub msg: Message,
    pub values: Values,
    /// Extra arguments (reply-target IDs, reaction names, …).
    pub args: Vec<String>,
}

impl Request {
    /// Send a plain message back to the originating channel, running the
    /// outbound filter chain with this request's author in scope.
    pub async fn say(&self, body: impl Into<String>) -> Result<String, ConnectorError> {
        self.bot
            .send_for(
                self.conn.clone(),
                SendPayload::message(self.msg.channel.clone(), body.into()),
                &self.msg.user.name,
            )
            .await
    }

    /// Send a `/me`-style action to the originating channel.
    pub async fn act(&self, body: impl Into<String>) -> Result<String, ConnectorError> {
        self.bot
            .send_for(
                self.conn.clone(),
                SendPayload::action(self.msg.channel.clone(), body.into()),
                &self.msg.user.name,
            )
            .await
    }

    /// Reply in-thread to the message that triggered this request.
    pub async fn reply(&self, body: impl Into<String>) -> Result<String, ConnectorError> {
        self.bot
            .send_for(
                self.conn.clone(),
                SendPayload::Reply {
                    channel: self.msg.channel.clone(),
                    body: body.into(),
                    target: ReplyTarget::Msg(Box::new(self.msg.clone())),
                },
                &self.msg.user.name,
            )
            .await
    }

    /// React to the triggering message.
    pub async fn react(&self, emoji: impl Into<String>) -> Result<String, ConnectorError> {
        self.bot
            .send_for(
                self.conn.clone(),
                SendPayload::Reaction {
                    channel: self.msg.channel.clone(),
                    emoji: emoji.into(),
                    target: Box::new(self.msg.clone()),
                },
                &self.msg.user.name,
            )
            .await
    }

    /// Send a message with an inline image.
    pub async fn say_with_image(
        &self,
        body: impl Into<String>,
        image: ImageAttachment,
    ) -> Result<String, ConnectorError> {
        self.bot
            .send_for(
                self.conn.clone(),
                SendPayload::Message {
                    channel: self.msg.channel.clone(),
                    body: body.into(),
                    attachments: vec![image],
                    unfurl_links: None,
                },
                &self.msg.user.name,
            )
            .await
    }

    /// Whether the requesting user is a configured admin.
    pub fn is_admin(&self) -> bool {
        self.bot.is_admin(&self.msg.user.name)
    }
}

/// A handler: consumes one request, returns whether it handled the event.
pub type HandlerFn = Arc<dyn Fn(Request) -> BoxFuture<'static, bool> + Send + Sync>;

/// Wrap an async closure into a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |req| f(req).boxed())
}

/// One row of a plugin's handler table.
#[derive(Clone)]
pub struct HandlerSpec {
    /// Owning plugin; filled in at registration.
    pub plugin: String,
    pub kind: Kind,
    /// Only fire for messages that carried the command prefix.
    pub cmd_only: bool,
    pub regex: Regex,
    pub help: String,
    pub handler: HandlerFn,
}

impl HandlerSpec {
    pub fn new<F, Fut>(kind: Kind, cmd_only: bool, regex: &str, help: &str, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            plugin: String::new(),
            kind,
            cmd_only,
            regex: Regex::new(regex).expect("handler regex must compile"),
            help: help.to_string(),
            handler: handler(f),
        }
    }

    /// Catch-all spec matching every body of `kind`.
    pub fn catch_all<F, Fut>(kind: Kind, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::new(kind, false, ".*", "", f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_and_unnamed_captures() {
        let re = Regex::new(r"^(?P<what>\w+)\+\+( (\w+))?$").unwrap();
        let caps = re.captures("beer++ cheers").unwrap();
        let v = Values::from_captures(&re, &caps);
        assert_eq!(v.get("what"), "beer");
        assert_eq!(v.get("3"), "cheers");
        assert_eq!(v.get("missing"), "");
    }

    #[test]
    fn unmatched_optional_group_is_empty() {
        let re = Regex::new(r"^(?P<what>\w+)(?P<rest> .*)?$").unwrap();
        let caps = re.captures("beer").unwrap();
        let v = Values::from_captures(&re, &caps);
        assert_eq!(v.get("what"), "beer");
        assert_eq!(v.get("rest"), "");
    }
}
