//! Factoids: taught triples of (fact, verb, tidbit) recalled whenever a
//! plain message matches a stored fact. Recall runs the outbound filter
//! chain, so a tidbit can carry `$nick`, `$someone`, `$item` and friends,
//! and `$and` splits one tidbit into up to four sends.
//!
//! `!remember <nick> <substr>` turns a line from the history ring into a
//! quote factoid; `!quote` pulls a random one back out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::bot::filters::split_and;
use crate::bot::request::HandlerSpec;
use crate::bot::Bot;
use crate::config::Config;
use crate::error::BotError;
use crate::msg::Kind;
use crate::plugins::Plugin;

#[derive(Debug, Clone)]
struct Factoid {
    id: i64,
    fact: String,
    verb: String,
    tidbit: String,
    owner: String,
}

#[derive(Default)]
pub struct FactoidPlugin {
    /// channel -> id of the factoid most recently spoken there, backing
    /// `forget that` and `what was that`.
    last: Arc<Mutex<HashMap<String, i64>>>,
}

impl FactoidPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ensure_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS factoid (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             fact TEXT NOT NULL,
             verb TEXT NOT NULL,
             tidbit TEXT NOT NULL,
             owner TEXT NOT NULL,
             created INTEGER NOT NULL,
             access_count INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS factoid_fact ON factoid (fact);",
    )
}

fn learn(config: &Config, fact: &str, verb: &str, tidbit: &str, owner: &str) -> rusqlite::Result<i64> {
    config.with_db(|conn| {
        conn.execute(
            "INSERT INTO factoid (fact, verb, tidbit, owner, created) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fact.to_lowercase(),
                verb,
                tidbit,
                owner,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Random factoid matching `fact`, access count bumped.
fn lookup(config: &Config, fact: &str) -> rusqlite::Result<Option<Factoid>> {
    config.with_db(|conn| {
        let found = conn
            .query_row(
                "SELECT id, fact, verb, tidbit, owner FROM factoid
                 WHERE fact = ?1 ORDER BY RANDOM() LIMIT 1",
                params![fact.to_lowercase()],
                |row| {
                    Ok(Factoid {
                        id: row.get(0)?,
                        fact: row.get(1)?,
                        verb: row.get(2)?,
                        tidbit: row.get(3)?,
                        owner: row.get(4)?,
                    })
                },
            )
            .optional()?;
        if let Some(f) = &found {
            conn.execute(
                "UPDATE factoid SET access_count = access_count + 1 WHERE id = ?1",
                params![f.id],
            )?;
        }
        Ok(found)
    })
}

fn by_id(config: &Config, id: i64) -> rusqlite::Result<Option<Factoid>> {
    config.with_db(|conn| {
        conn.query_row(
            "SELECT id, fact, verb, tidbit, owner FROM factoid WHERE id = ?1",
            params![id],
            |row| {
                Ok(Factoid {
                    id: row.get(0)?,
                    fact: row.get(1)?,
                    verb: row.get(2)?,
                    tidbit: row.get(3)?,
                    owner: row.get(4)?,
                })
            },
        )
        .optional()
    })
}

fn forget(config: &Config, id: i64) -> rusqlite::Result<()> {
    config.with_db(|conn| {
        conn.execute("DELETE FROM factoid WHERE id = ?1", params![id])?;
        Ok(())
    })
}

/// The line spoken for a recalled factoid. `reply` tidbits stand alone.
fn render(f: &Factoid) -> String {
    match f.verb.as_str() {
        "reply" => f.tidbit.clone(),
        verb => format!("{} {} {}", f.fact, verb, f.tidbit),
    }
}

impl Plugin for FactoidPlugin {
    fn name(&self) -> &'static str {
        "factoid"
    }

    fn register(&self, bot: &Arc<Bot>) -> Result<(), BotError> {
        bot.config()
            .with_db(ensure_tables)
            .map_err(crate::error::ConfigError::Db)?;

        let last_forget = self.last.clone();
        let last_debug = self.last.clone();
        let last_recall = self.last.clone();

        let table = vec![
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^what was that$",
                "!what was that: identify the last factoid spoken here",
                move |req| {
                    let last = last_debug.clone();
                    async move {
                        let id = last.lock().unwrap().get(&req.msg.channel).copied();
                        let line = match id.and_then(|id| by_id(req.bot.config(), id).ok().flatten())
                        {
                            Some(f) => format!(
                                "That was {} (#{}): {} {}",
                                f.fact, f.id, f.verb, f.tidbit
                            ),
                            None => "I haven't said anything lately.".to_string(),
                        };
                        let _ = req.say(line).await;
                        true
                    }
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^forget that$",
                "!forget that: delete the last factoid (owner or admin)",
                move |req| {
                    let last = last_forget.clone();
                    async move {
                        let id = last.lock().unwrap().get(&req.msg.channel).copied();
                        let f = match id.and_then(|id| by_id(req.bot.config(), id).ok().flatten()) {
                            Some(f) => f,
                            None => {
                                let _ = req.say("I haven't said anything lately.").await;
                                return true;
                            }
                        };
                        if f.owner != req.msg.user.name && !req.is_admin() {
                            let _ = req.say("You don't own that fact.").await;
                            return true;
                        }
                        match forget(req.bot.config(), f.id) {
                            Ok(()) => {
                                last.lock().unwrap().remove(&req.msg.channel);
                                let _ = req.say(format!("I forgot {}.", f.fact)).await;
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "factoid delete failed");
                            }
                        }
                        true
                    }
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^remember (?P<nick>\S+) (?P<substr>.+)$",
                "!remember <nick> <text>: quote their last line containing <text>",
                |req| async move {
                    let nick = req.values.get("nick").to_string();
                    let substr = req.values.get("substr").to_string();
                    let quoted = req
                        .bot
                        .history()
                        .in_channel(&req.msg.channel)
                        .into_iter()
                        .find(|m| {
                            m.id != req.msg.id
                                && m.user.name.eq_ignore_ascii_case(&nick)
                                && m.body.contains(&substr)
                        });
                    let quoted = match quoted {
                        Some(m) => m,
                        None => {
                            let _ = req
                                .say(format!("I don't remember {nick} saying {substr:?}."))
                                .await;
                            return true;
                        }
                    };
                    let tidbit = format!("<{}> {}", quoted.user.name, quoted.body);
                    match learn(req.bot.config(), "quote", "reply", &tidbit, &req.msg.user.name) {
                        Ok(_) => {
                            let _ = req
                                .say(format!("Okay, {}, remembering {:?}.", req.msg.user.name, quoted.body))
                                .await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "quote store failed");
                        }
                    }
                    true
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^quote$",
                "!quote: a random remembered line",
                |req| async move {
                    let line = match lookup(req.bot.config(), "quote") {
                        Ok(Some(f)) => f.tidbit,
                        Ok(None) => "I don't know any quotes.".to_string(),
                        Err(e) => {
                            tracing::error!(error = %e, "quote lookup failed");
                            return true;
                        }
                    };
                    let _ = req.say(line).await;
                    true
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^(?P<fact>.+?) (?P<verb>is|are|reply) (?P<tidbit>.+)$",
                "!<fact> is/are/reply <tidbit>: teach me something",
                |req| async move {
                    let fact = req.values.get("fact").to_string();
                    let verb = req.values.get("verb").to_string();
                    let tidbit = req.values.get("tidbit").to_string();
                    match learn(req.bot.config(), &fact, &verb, &tidbit, &req.msg.user.name) {
                        Ok(_) => {
                            let _ = req.say(format!("Okay, {}.", req.msg.user.name)).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "factoid store failed");
                            let _ = req.say("I couldn't remember that.").await;
                        }
                    }
                    true
                },
            ),
            // Plain-message recall. Last in the table so taught commands
            // never shadow other plugins' handlers.
            HandlerSpec::new(Kind::Message, false, r".*", "", move |req| {
                let last = last_recall.clone();
                async move {
                    if req.msg.command {
                        return false;
                    }
                    let f = match lookup(req.bot.config(), req.msg.body.trim()) {
                        Ok(Some(f)) => f,
                        _ => return false,
                    };
                    last.lock().unwrap().insert(req.msg.channel.clone(), f.id);
                    let expanded = req
                        .bot
                        .filter_text(
                            req.conn.clone(),
                            &req.msg.channel,
                            &req.msg.user.name,
                            render(&f),
                        )
                        .await;
                    for part in split_and(&expanded) {
                        let _ = req.say(part).await;
                    }
                    true
                }
            }),
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
    fn learn_and_lookup_are_case_insensitive_on_fact() {
        let c = config();
        learn(&c, "This", "is", "that", "alice").unwrap();
        let f = lookup(&c, "this").unwrap().unwrap();
        assert_eq!(f.fact, "this");
        assert_eq!(render(&f), "this is that");
        assert!(lookup(&c, "other").unwrap().is_none());
    }

    #[test]
    fn reply_verb_renders_bare_tidbit() {
        let f = Factoid {
            id: 1,
            fact: "hello".into(),
            verb: "reply".into(),
            tidbit: "hi there $nick".into(),
            owner: "alice".into(),
        };
        assert_eq!(render(&f), "hi there $nick");
    }

    #[test]
    fn forget_removes_by_id() {
        let c = config();
        let id = learn(&c, "this", "is", "that", "alice").unwrap();
        forget(&c, id).unwrap();
        assert!(lookup(&c, "this").unwrap().is_none());
    }

    #[test]
    fn access_count_tracks_recalls() {
        let c = config();
        let id = learn(&c, "this", "is", "that", "alice").unwrap();
        lookup(&c, "this").unwrap();
        lookup(&c, "this").unwrap();
        let n: i64 = c
            .with_db(|conn| {
                conn.query_row(
                    "SELECT access_count FROM factoid WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(n, 2);
    }
}
