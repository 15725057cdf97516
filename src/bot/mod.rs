//! The bot kernel: plugin registry, handler tables, ordered dispatch,
//! outbound filtering, blacklist, and admin checks.
//!
//! One kernel instance lives for the whole process. Connectors are wired
//! in at boot; each pushes inbound events through [`Bot::receive`] on its
//! own task and awaits the full dispatch before reading its next event,
//! so handlers observe a single connector's messages in arrival order.

pub mod filters;
pub mod request;
pub mod web;

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use tokio::sync::watch;

use crate::config::Config;
use crate::conn::Connector;
use crate::error::{BotError, ConnectorError};
use crate::history::HistoryRing;
use crate::msg::{Kind, Message, SendPayload};

use filters::{builtin_filters, FilterCtx, FilterFn, ItemSet};
use request::{HandlerFn, HandlerSpec, Request, Values};

/// Process-wide bot kernel. Shared as `Arc<Bot>`.
pub struct Bot {
    config: Arc<Config>,
    history: HistoryRing,
    handlers: RwLock<Vec<HandlerSpec>>,
    filters: RwLock<Vec<(String, FilterFn)>>,
    plugins: RwLock<HashSet<String>>,
    /// Copy-on-write set of (channel, plugin) pairs disabled by admins.
    blacklist: RwLock<Arc<HashSet<(String, String)>>>,
    web: Mutex<web::WebRegistry>,
    items: Arc<ItemSet>,
    default_conn: RwLock<Option<Arc<dyn Connector>>>,
    /// Registry freezes once the first connector serves.
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Bot {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let capacity = config.get_int("bot.history_size", 100).max(1) as usize;
        let items = Arc::new(ItemSet::default());
        let (shutdown_tx, _) = watch::channel(false);

        let mut blacklist = HashSet::new();
        for entry in config.get_array("bot.blacklist", vec![]) {
            if let Some((channel, plugin)) = entry.split_once(':') {
                blacklist.insert((channel.to_string(), plugin.to_string()));
            }
        }

        let bot = Self {
            config,
            history: HistoryRing::new(capacity),
            handlers: RwLock::new(Vec::new()),
            filters: RwLock::new(Vec::new()),
            plugins: RwLock::new(HashSet::new()),
            blacklist: RwLock::new(Arc::new(blacklist)),
            web: Mutex::new(web::WebRegistry::default()),
            items: items.clone(),
            default_conn: RwLock::new(None),
            started: AtomicBool::new(false),
            shutdown_tx,
        };
        for (name, f) in builtin_filters(items) {
            bot.register_filter(&name, f);
        }
        Arc::new(bot)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn history(&self) -> &HistoryRing {
        &self.history
    }

    /// The item set backing `$item`/`$giveitem`.
    pub fn items(&self) -> &Arc<ItemSet> {
        &self.items
    }

    /// First connector wired in, for plugins that send unprompted
    /// (reminders, pollers).
    pub fn default_connector(&self) -> Option<Arc<dyn Connector>> {
        self.default_conn.read().unwrap().clone()
    }

    // ---- plugin registration ------------------------------------------

    /// Claim `name` for a plugin. Panics on a duplicate: two plugins with
    /// one name is a boot-time wiring bug.
    pub fn register_plugin(&self, name: &str) {
        self.assert_not_started();
        let mut plugins = self.plugins.write().unwrap();
        assert!(
            plugins.insert(name.to_string()),
            "plugin {name:?} registered twice"
        );
    }

    /// Append a catch-all handler for `kind`.
    pub fn register(&self, plugin: &str, kind: Kind, handler: HandlerFn) {
        self.register_regex(plugin, kind, ".*", handler);
    }

    /// Append a non-command handler gated by `regex`.
    pub fn register_regex(&self, plugin: &str, kind: Kind, regex: &str, handler: HandlerFn) {
        self.push_spec(plugin, HandlerSpec {
            plugin: plugin.to_string(),
            kind,
            cmd_only: false,
            regex: regex::Regex::new(regex).expect("handler regex must compile"),
            help: String::new(),
            handler,
        });
    }

    /// Append a command handler gated by `regex`.
    pub fn register_regex_cmd(&self, plugin: &str, kind: Kind, regex: &str, handler: HandlerFn) {
        self.push_spec(plugin, HandlerSpec {
            plugin: plugin.to_string(),
            kind,
            cmd_only: true,
            regex: regex::Regex::new(regex).expect("handler regex must compile"),
            help: String::new(),
            handler,
        });
    }

    /// Append a whole handler table, order preserved.
    pub fn register_table(&self, plugin: &str, table: Vec<HandlerSpec>) {
        for mut spec in table {
            spec.plugin = plugin.to_string();
            self.push_spec(plugin, spec);
        }
    }

    fn push_spec(&self, plugin: &str, spec: HandlerSpec) {
        self.assert_not_started();
        debug_assert!(
            self.plugins.read().unwrap().contains(plugin),
            "plugin {plugin:?} must be registered before its handlers"
        );
        self.handlers.write().unwrap().push(spec);
    }

    /// Insert or replace a named filter. Replacement keeps the original
    /// chain position so expansion order stays stable.
    pub fn register_filter(&self, name: &str, f: FilterFn) {
        let mut filters = self.filters.write().unwrap();
        if let Some(slot) = filters.iter_mut().find(|(n, _)| n == name) {
            slot.1 = f;
        } else {
            filters.push((name.to_string(), f));
        }
    }

    /// Help strings of every registered handler, in registration order.
    pub fn help_entries(&self) -> Vec<(String, String)> {
        self.handlers
            .read()
            .unwrap()
            .iter()
            .filter(|s| !s.help.is_empty())
            .map(|s| (s.plugin.clone(), s.help.clone()))
            .collect()
    }

    fn assert_not_started(&self) {
        assert!(
            !self.started.load(Ordering::SeqCst),
            "registration after kernel start"
        );
    }

    // ---- connector wiring ---------------------------------------------

    /// Install this kernel as `conn`'s event callback. The first wired
    /// connector becomes the default.
    pub fn wire(self: &Arc<Self>, conn: Arc<dyn Connector>) {
        let mut default = self.default_conn.write().unwrap();
        if default.is_none() {
            *default = Some(conn.clone());
        }
        drop(default);

        let bot = self.clone();
        conn.set_callback(Arc::new(move |conn, kind, msg| {
            let bot = bot.clone();
            async move {
                bot.receive(conn, kind, msg).await;
            }
            .boxed()
        }));
    }

    /// Freeze the registry. Called once all plugins and connectors are in.
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Subscribe to the process shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Flip the shutdown signal; serve loops drain and return.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // ---- inbound dispatch ---------------------------------------------

    /// Dispatch one inbound event through the handler chain.
    pub async fn receive(self: &Arc<Self>, conn: Arc<dyn Connector>, kind: Kind, msg: Message) {
        match kind {
            Kind::Message | Kind::Action => self.history.append(msg.clone()),
            // An edit replaces the archived original in place.
            Kind::Edit => {
                if let Some(target) = msg.extra.get("edit_of").cloned() {
                    self.edit_history_by_backend_id(&target, msg.clone());
                }
            }
            _ => {}
        }

        let specs: Vec<HandlerSpec> = self.handlers.read().unwrap().clone();
        let blacklist = self.blacklist.read().unwrap().clone();
        let mut handled = false;

        for spec in &specs {
            if spec.kind != kind {
                continue;
            }
            if spec.cmd_only && !msg.command {
                continue;
            }
            if blacklist.contains(&(msg.channel.clone(), spec.plugin.clone()))
                || blacklist.contains(&(msg.channel_name.clone(), spec.plugin.clone()))
            {
                continue;
            }
            let caps = match spec.regex.captures(&msg.body) {
                Some(caps) => caps,
                None => continue,
            };
            let req = Request {
                bot: self.clone(),
                conn: conn.clone(),
                kind,
                msg: msg.clone(),
                values: Values::from_captures(&spec.regex, &caps),
                args: Vec::new(),
            };
            let outcome = AssertUnwindSafe((spec.handler)(req)).catch_unwind().await;
            let did_handle = match outcome {
                Ok(b) => b,
                Err(_) => {
                    tracing::error!(
                        plugin = %spec.plugin,
                        body = %redact(&msg.body),
                        "handler panicked; treating as unhandled"
                    );
                    false
                }
            };
            if did_handle && kind.short_circuits() {
                handled = true;
                break;
            }
            handled = handled || did_handle;
        }

        if !handled
            && msg.command
            && matches!(kind, Kind::Message | Kind::Action)
            && self.config.get_bool("bot.reply_unknown", false)
        {
            let payload = SendPayload::message(
                msg.channel.clone(),
                format!("I don't know what to do with {:?}.", msg.body),
            );
            let _ = self.send_for(conn, payload, &msg.user.name).await;
        }
    }

    fn edit_history_by_backend_id(&self, backend_id: &str, new: Message) {
        let candidates = self.history.in_channel(&new.channel);
        if let Some(orig) = candidates
            .iter()
            .find(|m| m.extra.get("backend_id").map(String::as_str) == Some(backend_id))
        {
            self.history.edit(&orig.id, new);
        }
    }

    // ---- outbound ------------------------------------------------------

    /// Send through `conn` with the filter chain applied to Message/Action
    /// bodies. `user` is the display name the filters treat as `$nick`.
    pub async fn send_for(
        &self,
        conn: Arc<dyn Connector>,
        mut payload: SendPayload,
        user: &str,
    ) -> Result<String, ConnectorError> {
        if matches!(payload.kind(), Kind::Message | Kind::Action) {
            if let Some(body) = payload.body() {
                let filtered = self
                    .filter_text(conn.clone(), payload.channel(), user, body.to_string())
                    .await;
                payload.set_body(filtered);
            }
        }
        match conn.send(payload).await {
            Ok(id) => Ok(id),
            Err(e) => {
                tracing::warn!(connector = conn.name(), error = %e, "send failed");
                Err(e)
            }
        }
    }

    /// Run `body` through the filter chain; used directly by plugins that
    /// expand stored text (factoids) outside a send.
    pub async fn filter_text(
        &self,
        conn: Arc<dyn Connector>,
        channel: &str,
        user: &str,
        body: String,
    ) -> String {
        // Cheap out: no tokens, no work.
        if !body.contains('$') {
            return body;
        }
        let ctx = FilterCtx {
            bot_nick: self.config.get("bot.nick", &conn.identity()),
            conn: Some(conn),
            channel: channel.to_string(),
            user: user.to_string(),
        };
        let chain: Vec<FilterFn> = self
            .filters
            .read()
            .unwrap()
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        let mut body = body;
        for f in chain {
            body = f(ctx.clone(), body).await;
        }
        body
    }

    // ---- admin / blacklist --------------------------------------------

    /// Whether `name` is in the configured `admins` array (case-insensitive).
    pub fn is_admin(&self, name: &str) -> bool {
        self.config
            .get_array("admins", vec![])
            .iter()
            .any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Verify a scoped app password (admin HTTP gate, CLI connector).
    pub fn check_password(&self, scope: &str, candidate: &str) -> bool {
        self.config.check_password(scope, candidate)
    }

    /// Disable or re-enable `plugin` in `channel`, persisting the set.
    pub fn set_blacklisted(&self, channel: &str, plugin: &str, off: bool) -> Result<(), BotError> {
        let mut next: HashSet<(String, String)> =
            self.blacklist.read().unwrap().as_ref().clone();
        let key = (channel.to_string(), plugin.to_string());
        if off {
            next.insert(key);
        } else {
            next.remove(&key);
        }
        let encoded: Vec<String> = next
            .iter()
            .map(|(c, p)| format!("{c}:{p}"))
            .collect();
        self.config.set_array("bot.blacklist", &encoded)?;
        *self.blacklist.write().unwrap() = Arc::new(next);
        Ok(())
    }

    pub fn is_blacklisted(&self, channel: &str, plugin: &str) -> bool {
        self.blacklist
            .read()
            .unwrap()
            .contains(&(channel.to_string(), plugin.to_string()))
    }

    // ---- web -----------------------------------------------------------

    /// Mount a plugin sub-router at `path`. With a display name the route
    /// also appears in the `/nav` index.
    pub fn register_web(&self, path: &str, router: axum::Router, display_name: Option<&str>) {
        self.web
            .lock()
            .unwrap()
            .mount(path, router, display_name);
    }

    /// Assemble and serve the process-wide router. Runs until shutdown.
    pub async fn serve_web(self: &Arc<Self>, addr: std::net::SocketAddr) -> Result<(), BotError> {
        let registry = std::mem::take(&mut *self.web.lock().unwrap());
        web::serve(self.clone(), registry, addr).await
    }
}

/// Truncate a body for panic logs so secrets pasted at a bot don't end up
/// in log storage.
fn redact(body: &str) -> String {
    const KEEP: usize = 32;
    if body.len() <= KEEP {
        body.to_string()
    } else {
        let mut cut = KEEP;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &body[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_truncates_long_bodies() {
        let long = "x".repeat(100);
        assert!(redact(&long).len() < 50);
        assert_eq!(redact("short"), "short");
    }

    #[test]
    fn admin_check_is_case_insensitive() {
        let config = Arc::new(Config::open_in_memory().unwrap());
        config
            .set_array("admins", &["Alice".to_string(), "bob".to_string()])
            .unwrap();
        let bot = Bot::new(config);
        assert!(bot.is_admin("alice"));
        assert!(bot.is_admin("BOB"));
        assert!(!bot.is_admin("mallory"));
    }

    #[test]
    fn blacklist_round_trips_through_config() {
        let config = Arc::new(Config::open_in_memory().unwrap());
        let bot = Bot::new(config.clone());
        bot.set_blacklisted("#quiet", "counter", true).unwrap();
        assert!(bot.is_blacklisted("#quiet", "counter"));
        assert!(!bot.is_blacklisted("#loud", "counter"));

        // A fresh kernel over the same store sees the persisted set.
        let bot2 = Bot::new(config);
        assert!(bot2.is_blacklisted("#quiet", "counter"));

        bot2.set_blacklisted("#quiet", "counter", false).unwrap();
        assert!(!bot2.is_blacklisted("#quiet", "counter"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_plugin_name_panics() {
        let bot = Bot::new(Arc::new(Config::open_in_memory().unwrap()));
        bot.register_plugin("counter");
        bot.register_plugin("counter");
    }
}
