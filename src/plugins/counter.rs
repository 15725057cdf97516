//! Per-user counters: `beer++`, `beer--`, aliases, and the three-sentence
//! tea pattern. Counts persist in sqlite; other plugins can watch changes
//! through the published update hooks.

use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::bot::request::HandlerSpec;
use crate::bot::Bot;
use crate::config::Config;
use crate::error::BotError;
use crate::msg::Kind;
use crate::plugins::Plugin;

/// Called after every count change with (nick, item, new value).
pub type UpdateHook = Arc<dyn Fn(&str, &str, i64) + Send + Sync>;

#[derive(Default)]
pub struct CounterPlugin {
    hooks: Arc<Mutex<Vec<UpdateHook>>>,
}

impl CounterPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to count changes. The counter owns this event; sibling
    /// plugins register here instead of polling the table.
    pub fn on_update(&self, hook: UpdateHook) {
        self.hooks.lock().unwrap().push(hook);
    }
}

fn ensure_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS counter (
             nick TEXT NOT NULL,
             item TEXT NOT NULL,
             count INTEGER NOT NULL DEFAULT 0,
             PRIMARY KEY (nick, item)
         );
         CREATE TABLE IF NOT EXISTS counter_alias (
             alias TEXT PRIMARY KEY,
             item TEXT NOT NULL
         );",
    )
}

/// Follow one alias hop; unaliased items resolve to themselves.
fn resolve(config: &Config, thing: &str) -> String {
    config
        .with_db(|conn| {
            conn.query_row(
                "SELECT item FROM counter_alias WHERE alias = ?1",
                params![thing],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .ok()
        .flatten()
        .unwrap_or_else(|| thing.to_string())
}

fn bump(config: &Config, nick: &str, item: &str, delta: i64) -> rusqlite::Result<i64> {
    config.with_db(|conn| {
        conn.execute(
            "INSERT INTO counter (nick, item, count) VALUES (?1, ?2, ?3)
             ON CONFLICT(nick, item) DO UPDATE SET count = count + ?3",
            params![nick, item, delta],
        )?;
        conn.query_row(
            "SELECT count FROM counter WHERE nick = ?1 AND item = ?2",
            params![nick, item],
            |row| row.get(0),
        )
    })
}

fn counts_for(config: &Config, nick: &str) -> rusqlite::Result<Vec<(String, i64)>> {
    config.with_db(|conn| {
        let mut stmt = conn.prepare(
            "SELECT item, count FROM counter WHERE nick = ?1 ORDER BY count DESC, item",
        )?;
        let rows = stmt.query_map(params![nick], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    })
}

/// `X. Y. Hot.`: exactly three sentences, the last one being "hot".
const TEA_RE: &str = r"(?i)^([^.!?]+[.!?])\s*([^.!?]+[.!?])\s*(hot[.!?])$";

impl Plugin for CounterPlugin {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn register(&self, bot: &Arc<Bot>) -> Result<(), BotError> {
        bot.config()
            .with_db(ensure_tables)
            .map_err(crate::error::ConfigError::Db)?;

        let hooks = self.hooks.clone();
        let run_hooks = move |nick: &str, item: &str, value: i64| {
            for hook in hooks.lock().unwrap().iter() {
                hook(nick, item, value);
            }
        };
        let hooks_up = run_hooks.clone();
        let hooks_down = run_hooks.clone();
        let hooks_tea = run_hooks;

        let table = vec![
            HandlerSpec::new(
                Kind::Message,
                false,
                r"(?:^|\s)(?P<thing>[\w:]+)\+\+(?:\s|$)",
                "<thing>++ gives you one more <thing>",
                move |req| {
                    let hooks = hooks_up.clone();
                    async move {
                        let nick = req.msg.user.name.clone();
                        let item = resolve(req.bot.config(), req.values.get("thing"));
                        match bump(req.bot.config(), &nick, &item, 1) {
                            Ok(n) => {
                                hooks(&nick, &item, n);
                                let _ = req.say(format!("{nick} has {n} {item}.")).await;
                                true
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "counter update failed");
                                false
                            }
                        }
                    }
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                false,
                r"(?:^|\s)(?P<thing>[\w:]+)--(?:\s|$)",
                "<thing>-- takes one away",
                move |req| {
                    let hooks = hooks_down.clone();
                    async move {
                        let nick = req.msg.user.name.clone();
                        let item = resolve(req.bot.config(), req.values.get("thing"));
                        match bump(req.bot.config(), &nick, &item, -1) {
                            Ok(n) => {
                                hooks(&nick, &item, n);
                                let _ = req.say(format!("{nick} has {n} {item}.")).await;
                                true
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "counter update failed");
                                false
                            }
                        }
                    }
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                false,
                TEA_RE,
                "",
                move |req| {
                    let hooks = hooks_tea.clone();
                    async move {
                        let nick = req.msg.user.name.clone();
                        match bump(req.bot.config(), &nick, ":tea:", 1) {
                            Ok(n) => {
                                hooks(&nick, ":tea:", n);
                                let _ = req.react("tea").await;
                                true
                            }
                            Err(_) => false,
                        }
                    }
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^mkalias (?P<alias>\S+) (?P<item>\S+)$",
                "!mkalias <alias> <item>: count <alias> as <item>",
                |req| async move {
                    let alias = req.values.get("alias").to_string();
                    let item = req.values.get("item").to_string();
                    let res = req.bot.config().with_db(|conn| {
                        conn.execute(
                            "INSERT INTO counter_alias (alias, item) VALUES (?1, ?2)
                             ON CONFLICT(alias) DO UPDATE SET item = excluded.item",
                            params![alias, item],
                        )
                    });
                    match res {
                        Ok(_) => {
                            let _ = req.say(format!("Okay, {alias} counts as {item}.")).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "alias insert failed");
                            let _ = req.say("I couldn't save that alias.").await;
                        }
                    }
                    true
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^rmalias (?P<alias>\S+)$",
                "!rmalias <alias>: drop an alias",
                |req| async move {
                    let alias = req.values.get("alias").to_string();
                    let removed = req
                        .bot
                        .config()
                        .with_db(|conn| {
                            conn.execute(
                                "DELETE FROM counter_alias WHERE alias = ?1",
                                params![alias],
                            )
                        })
                        .unwrap_or(0);
                    if removed > 0 {
                        let _ = req.say(format!("Forgot the alias {alias}.")).await;
                    } else {
                        let _ = req.say(format!("I don't have an alias {alias}.")).await;
                    }
                    true
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^inspect (?P<nick>\S+)$",
                "!inspect <nick>: everything they're counting",
                |req| async move {
                    let nick = req.values.get("nick").to_string();
                    let counts = counts_for(req.bot.config(), &nick).unwrap_or_default();
                    if counts.is_empty() {
                        let _ = req.say(format!("{nick} isn't counting anything.")).await;
                        return true;
                    }
                    let list = counts
                        .iter()
                        .map(|(item, n)| format!("{n} {item}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let _ = req.say(format!("{nick} has {list}.")).await;
                    true
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^clear (?P<thing>\S+)$",
                "!clear <thing>: zero out your own count",
                |req| async move {
                    let nick = req.msg.user.name.clone();
                    let item = resolve(req.bot.config(), req.values.get("thing"));
                    let res = req.bot.config().with_db(|conn| {
                        conn.execute(
                            "DELETE FROM counter WHERE nick = ?1 AND item = ?2",
                            params![nick, item],
                        )
                    });
                    match res {
                        Ok(_) => {
                            let _ = req.act(format!("chops a zero onto {nick}'s {item}")).await;
                        }
                        Err(e) => tracing::error!(error = %e, "counter clear failed"),
                    }
                    true
                },
            ),
        ];
        bot.register_table(self.name(), table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let c = Config::open_in_memory().unwrap();
        c.with_db(ensure_tables).unwrap();
        c
    }

    #[test]
    fn bump_creates_and_accumulates() {
        let c = config();
        assert_eq!(bump(&c, "alice", "beer", 1).unwrap(), 1);
        assert_eq!(bump(&c, "alice", "beer", 1).unwrap(), 2);
        assert_eq!(bump(&c, "alice", "beer", -1).unwrap(), 1);
        // Counts are per nick.
        assert_eq!(bump(&c, "bob", "beer", 1).unwrap(), 1);
    }

    #[test]
    fn alias_resolution_falls_through() {
        let c = config();
        c.with_db(|conn| {
            conn.execute(
                "INSERT INTO counter_alias (alias, item) VALUES ('beers', ':beer:')",
                [],
            )
        })
        .unwrap();
        assert_eq!(resolve(&c, "beers"), ":beer:");
        assert_eq!(resolve(&c, "tea"), "tea");
    }

    #[test]
    fn tea_pattern_needs_three_sentences() {
        let re = regex::Regex::new(TEA_RE).unwrap();
        assert!(re.is_match("Tea. Earl Grey. Hot."));
        assert!(re.is_match("Coffee. Black. Hot!"));
        assert!(!re.is_match("Tea. Earl Grey."));
        assert!(!re.is_match("Tea. Earl Grey. Iced."));
    }

    #[test]
    fn increment_regex_is_edge_anchored() {
        let re = regex::Regex::new(r"(?:^|\s)(?P<thing>[\w:]+)\+\+(?:\s|$)").unwrap();
        assert_eq!(&re.captures("beer++").unwrap()["thing"], "beer");
        assert_eq!(&re.captures("have a beer++ ok").unwrap()["thing"], "beer");
        assert!(re.captures("x = y+++z").is_none());
    }
}
