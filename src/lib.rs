//! hubbub: a multi-connector chat bot host.
//!
//! One kernel ([`bot::Bot`]) dispatches events from any number of chat
//! backends (IRC, Slack, Discord, an HTTP console) through an ordered
//! table of regex handlers owned by plugins. Outbound text runs through a
//! `$token` filter chain; configuration and plugin state persist in one
//! sqlite database; plugin dashboards mount on a shared axum router.

pub mod bot;
pub mod config;
pub mod conn;
pub mod error;
pub mod history;
pub mod msg;
pub mod plugins;

pub use bot::request::{handler, HandlerFn, HandlerSpec, Request, Values};
pub use bot::Bot;
pub use config::Config;
pub use conn::Connector;
pub use error::{BotError, ConfigError, ConnectorError};
pub use history::HistoryRing;
pub use msg::{ImageAttachment, Kind, Message, ReplyTarget, SendPayload, User};
