//! IRC adapter.
//!
//! TLS dial, NICK/USER registration, JOIN of each configured channel, and
//! a single writer task that throttles PRIVMSG with a token bucket and
//! splits oversize lines. PRIVMSG becomes Message (CTCP ACTION becomes an
//! action), channel lifecycle commands become Event. The serve loop
//! reconnects with exponential backoff until shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::Config;
use crate::conn::{
    split_message, Backoff, Connector, EventCallback, SeenRing, TokenBucket, DEFAULT_SEEN_WINDOW,
};
use crate::error::ConnectorError;
use crate::msg::{Kind, Message, SendPayload, User};

/// Seconds of read inactivity before we ping the server ourselves.
const IDLE_PING_SECS: u64 = 120;

/// Settings read from the config store under `irc.*`.
#[derive(Debug, Clone)]
pub struct IrcSettings {
    /// host:port, always dialed over TLS.
    pub server: String,
    pub nick: String,
    pub pass: Option<String>,
    pub channels: Vec<String>,
    /// Outbound PRIVMSG per second.
    pub rate_per_sec: f64,
    /// Max bytes of one PRIVMSG body before splitting.
    pub max_len: usize,
    pub backoff_cap: Duration,
}

impl IrcSettings {
    pub fn from_config(config: &Config) -> Self {
        let pass = config.get("irc.pass", "");
        Self {
            server: config.get("irc.server", "irc.libera.chat:6697"),
            nick: config.get("irc.nick", "hubbub"),
            pass: (!pass.is_empty()).then_some(pass),
            channels: config.get_array("irc.channels", vec![]),
            rate_per_sec: config.get_float("irc.rate", 2.0),
            max_len: config.get_int("irc.maxlen", 400) as usize,
            backoff_cap: Duration::from_secs(config.get_int("irc.backoff_cap", 300) as u64),
        }
    }
}

pub struct IrcConnector {
    settings: IrcSettings,
    callback: RwLock<Option<EventCallback>>,
    /// Raw lines to the writer task; None while disconnected.
    out_tx: RwLock<Option<mpsc::Sender<String>>>,
    /// channel -> nicks, maintained from NAMES/JOIN/PART.
    members: RwLock<HashMap<String, HashSet<String>>>,
    seen: Mutex<SeenRing>,
    next_id: AtomicU64,
    prefix: String,
}

impl IrcConnector {
    pub fn new(settings: IrcSettings, prefix: String) -> Arc<Self> {
        Arc::new(Self {
            settings,
            callback: RwLock::new(None),
            out_tx: RwLock::new(None),
            members: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenRing::new(DEFAULT_SEEN_WINDOW)),
            next_id: AtomicU64::new(1),
            prefix,
        })
    }

    async fn emit(self: &Arc<Self>, kind: Kind, msg: Message) {
        let cb = self.callback.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(self.clone() as Arc<dyn Connector>, kind, msg).await;
        }
    }

    async fn queue(&self, line: String) -> Result<(), ConnectorError> {
        let tx = self.out_tx.read().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(line)
                .await
                .map_err(|_| ConnectorError::NotConnected),
            None => Err(ConnectorError::NotConnected),
        }
    }

    async fn connect(
        &self,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ConnectorError> {
        let (host, _port) = self
            .settings
            .server
            .split_once(':')
            .unwrap_or((self.settings.server.as_str(), "6697"));
        let tcp = TcpStream::connect(&self.settings.server).await?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ConnectorError::Protocol(format!("bad server name: {e}")))?;
        let stream = TlsConnector::from(Arc::new(tls_config))
            .connect(server_name, tcp)
            .await?;
        Ok(stream)
    }

    /// One connected session. Returns Ok on clean shutdown, Err to
    /// trigger a reconnect.
    async fn session(
        self: &Arc<Self>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectorError> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        let (tx, mut rx) = mpsc::channel::<String>(256);
        *self.out_tx.write().unwrap() = Some(tx);

        // Registration goes out before the throttle loop starts.
        if let Some(pass) = &self.settings.pass {
            write_half
                .write_all(format!("PASS {pass}\r\n").as_bytes())
                .await?;
        }
        let nick = &self.settings.nick;
        write_half
            .write_all(format!("NICK {nick}\r\nUSER {nick} 0 * :{nick}\r\n").as_bytes())
            .await?;

        let mut bucket = TokenBucket::new(self.settings.rate_per_sec, 4.0);
        let idle = tokio::time::sleep(Duration::from_secs(IDLE_PING_SECS));
        tokio::pin!(idle);

        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write_half.write_all(b"QUIT :shutting down\r\n").await;
                        break Ok(());
                    }
                }
                outbound = rx.recv() => {
                    match outbound {
                        Some(line) => {
                            // PONGs jump the queue; chat traffic pays a token.
                            if line.starts_with("PRIVMSG") || line.starts_with("NOTICE") {
                                let wait = bucket.reserve();
                                if wait > Duration::ZERO {
                                    tokio::time::sleep(wait).await;
                                }
                            }
                            write_half.write_all(line.as_bytes()).await?;
                            write_half.write_all(b"\r\n").await?;
                        }
                        None => break Err(ConnectorError::NotConnected),
                    }
                }
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            idle.as_mut().reset(
                                tokio::time::Instant::now() + Duration::from_secs(IDLE_PING_SECS),
                            );
                            self.handle_line(&line).await?;
                        }
                        None => break Err(ConnectorError::NotConnected),
                    }
                }
                _ = &mut idle => {
                    self.queue(format!("PING :{nick}")).await?;
                    idle.as_mut().reset(
                        tokio::time::Instant::now() + Duration::from_secs(IDLE_PING_SECS),
                    );
                }
            }
        };
        *self.out_tx.write().unwrap() = None;
        result
    }

    async fn handle_line(self: &Arc<Self>, raw: &str) -> Result<(), ConnectorError> {
        let line = match IrcLine::parse(raw) {
            Some(line) => line,
            None => return Ok(()),
        };

        // Replays carry the same msgid tag across reconnects.
        if let Some(id) = line.tags.get("msgid") {
            if !self.seen.lock().unwrap().insert(id) {
                return Ok(());
            }
        }

        match line.command.as_str() {
            "PING" => {
                let token = line.trailing.clone().unwrap_or_default();
                self.queue(format!("PONG :{token}")).await?;
            }
            "001" => {
                tracing::info!(server = %self.settings.server, "IRC registered");
                for channel in &self.settings.channels {
                    self.queue(format!("JOIN {channel}")).await?;
                }
            }
            // NAMES reply: params are nick, symbol, channel.
            "353" => {
                if let (Some(channel), Some(names)) = (line.params.get(2), &line.trailing) {
                    let mut members = self.members.write().unwrap();
                    let set = members.entry(channel.clone()).or_default();
                    for name in names.split_whitespace() {
                        set.insert(name.trim_start_matches(['@', '+', '%']).to_string());
                    }
                }
            }
            "PRIVMSG" => {
                let from = match &line.nick {
                    Some(n) if *n != self.settings.nick => n.clone(),
                    _ => return Ok(()),
                };
                let target = line.params.first().cloned().unwrap_or_default();
                let body = line.trailing.clone().unwrap_or_default();
                let direct = !target.starts_with('#');
                // DMs come back on the sender's nick.
                let channel = if direct { from.clone() } else { target };

                let (body, action) = match body
                    .strip_prefix("\u{1}ACTION ")
                    .and_then(|b| b.strip_suffix('\u{1}'))
                {
                    Some(inner) => (inner.to_string(), true),
                    None => (body, false),
                };

                let mut msg = Message::new(User::new(&from, &from), &channel, body)
                    .detect_command(&self.prefix);
                msg.channel_name = msg.channel.clone();
                msg.direct = direct;
                // A DM is always addressed at the bot.
                if direct {
                    msg.command = true;
                }
                msg.action = action;
                msg.host = line.host.clone().unwrap_or_default();
                if let Some(id) = line.tags.get("msgid") {
                    msg.extra.insert("backend_id".to_string(), id.clone());
                }
                let kind = if action { Kind::Action } else { Kind::Message };
                self.emit(kind, msg).await;
            }
            "JOIN" | "PART" | "KICK" | "NICK" | "MODE" | "TOPIC" | "NOTICE" => {
                if let Some(nick) = &line.nick {
                    let channel = line.params.first().cloned().unwrap_or_default();
                    {
                        let mut members = self.members.write().unwrap();
                        match line.command.as_str() {
                            "JOIN" => {
                                members.entry(channel.clone()).or_default().insert(nick.clone());
                            }
                            "PART" => {
                                if let Some(set) = members.get_mut(&channel) {
                                    set.remove(nick);
                                }
                            }
                            // The kicked user is the second param; the
                            // prefix nick is whoever did the kicking.
                            "KICK" => {
                                if let (Some(set), Some(victim)) =
                                    (members.get_mut(&channel), line.params.get(1))
                                {
                                    set.remove(victim);
                                }
                            }
                            _ => {}
                        }
                    }
                    let mut msg = Message::new(
                        User::new(nick, nick),
                        &channel,
                        line.trailing.clone().unwrap_or_default(),
                    );
                    msg.channel_name = channel;
                    msg.extra
                        .insert("irc_command".to_string(), line.command.clone());
                    self.emit(Kind::Event, msg).await;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for IrcConnector {
    fn name(&self) -> &'static str {
        "irc"
    }

    fn identity(&self) -> String {
        self.settings.nick.clone()
    }

    fn set_callback(&self, cb: EventCallback) {
        *self.callback.write().unwrap() = Some(cb);
    }

    async fn send(&self, payload: SendPayload) -> Result<String, ConnectorError> {
        match payload {
            SendPayload::Message { channel, body, .. } => {
                for part in split_message(&body, self.settings.max_len) {
                    self.queue(format!("PRIVMSG {channel} :{part}")).await?;
                }
            }
            SendPayload::Action { channel, body } => {
                self.queue(format!("PRIVMSG {channel} :\u{1}ACTION {body}\u{1}"))
                    .await?;
            }
            // IRC has no threads; a reply is addressed at the target user.
            SendPayload::Reply { channel, body, target } => {
                let to = target.id("irc_nick");
                let body = if to.is_empty() {
                    body
                } else {
                    format!("{to}: {body}")
                };
                for part in split_message(&body, self.settings.max_len) {
                    self.queue(format!("PRIVMSG {channel} :{part}")).await?;
                }
            }
            SendPayload::Edit { .. } => return Err(ConnectorError::Unsupported("irc edit")),
            SendPayload::Reaction { .. } => {
                return Err(ConnectorError::Unsupported("irc reaction"))
            }
            SendPayload::Delete { .. } => return Err(ConnectorError::Unsupported("irc delete")),
        }
        Ok(format!("irc-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
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
        Ok(User::new(user_id, user_id))
    }

    fn format_url(&self, url: &str, label: &str) -> String {
        if label.is_empty() {
            url.to_string()
        } else {
            format!("{label}: {url}")
        }
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
                    tracing::warn!(error = %e, ?wait, "IRC disconnected; reconnecting");
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
}

/// One parsed IRC line: optional tags and prefix, command, params,
/// trailing.
#[derive(Debug, Default)]
struct IrcLine {
    tags: HashMap<String, String>,
    nick: Option<String>,
    host: Option<String>,
    command: String,
    params: Vec<String>,
    trailing: Option<String>,
}

impl IrcLine {
    fn parse(raw: &str) -> Option<Self> {
        let mut line = IrcLine::default();
        let mut rest = raw.trim_end_matches(['\r', '\n']);

        if let Some(tagged) = rest.strip_prefix('@') {
            let (tags, after) = tagged.split_once(' ')?;
            for tag in tags.split(';') {
                match tag.split_once('=') {
                    Some((k, v)) => line.tags.insert(k.to_string(), v.to_string()),
                    None => line.tags.insert(tag.to_string(), String::new()),
                };
            }
            rest = after;
        }

        if let Some(prefixed) = rest.strip_prefix(':') {
            let (prefix, after) = prefixed.split_once(' ')?;
            let nick_end = prefix.find(['!', '@']).unwrap_or(prefix.len());
            line.nick = Some(prefix[..nick_end].to_string());
            if let Some(at) = prefix.find('@') {
                line.host = Some(prefix[at + 1..].to_string());
            }
            rest = after;
        }

        let (front, trailing) = match rest.split_once(" :") {
            Some((front, trailing)) => (front, Some(trailing.to_string())),
            None => (rest, None),
        };
        line.trailing = trailing;

        let mut parts = front.split_whitespace();
        line.command = parts.next()?.to_string();
        line.params = parts.map(str::to_string).collect();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_privmsg_with_prefix() {
        let line =
            IrcLine::parse(":alice!ae@host.example PRIVMSG #bar :hello world").unwrap();
        assert_eq!(line.nick.as_deref(), Some("alice"));
        assert_eq!(line.host.as_deref(), Some("host.example"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#bar"]);
        assert_eq!(line.trailing.as_deref(), Some("hello world"));
    }

    #[test]
    fn parses_tags() {
        let line = IrcLine::parse("@msgid=abc;time=now :a!b@c PRIVMSG #x :hi").unwrap();
        assert_eq!(line.tags.get("msgid").map(String::as_str), Some("abc"));
        assert_eq!(line.command, "PRIVMSG");
    }

    #[test]
    fn parses_ping_without_prefix() {
        let line = IrcLine::parse("PING :server.example").unwrap();
        assert_eq!(line.command, "PING");
        assert_eq!(line.trailing.as_deref(), Some("server.example"));
    }

    #[test]
    fn parses_names_reply() {
        let line =
            IrcLine::parse(":srv 353 mynick = #bar :alice @bob +carol").unwrap();
        assert_eq!(line.command, "353");
        assert_eq!(line.params, vec!["mynick", "=", "#bar"]);
        assert_eq!(line.trailing.as_deref(), Some("alice @bob +carol"));
    }

    #[tokio::test]
    async fn kick_removes_the_kicked_user_not_the_kicker() {
        let config = Config::open_in_memory().unwrap();
        let conn = IrcConnector::new(IrcSettings::from_config(&config), "!".to_string());
        conn.handle_line(":srv 353 hubbub = #bar :@ops alice bob")
            .await
            .unwrap();
        conn.handle_line(":ops!o@host.example KICK #bar bob :flooding")
            .await
            .unwrap();
        let members = conn.who("#bar").await;
        assert!(members.contains(&"ops".to_string()));
        assert!(members.contains(&"alice".to_string()));
        assert!(!members.contains(&"bob".to_string()));
    }

    #[test]
    fn settings_from_config_defaults() {
        let config = Config::open_in_memory().unwrap();
        let s = IrcSettings::from_config(&config);
        assert_eq!(s.nick, "hubbub");
        assert!(s.pass.is_none());
        assert!((s.rate_per_sec - 2.0).abs() < f64::EPSILON);
    }
}
