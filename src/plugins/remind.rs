//! Reminders: `!remind <who> in <dur> <what>`. One tokio timer task per
//! reminder; the pending set lives in memory and supports listing and
//! cancellation by id. Deadlines fire in order because each task sleeps
//! its own duration from the moment of registration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bot::request::HandlerSpec;
use crate::bot::Bot;
use crate::error::BotError;
use crate::msg::{Kind, SendPayload};
use crate::plugins::Plugin;

#[derive(Debug, Clone)]
struct Reminder {
    id: u64,
    channel: String,
    asker: String,
    who: String,
    what: String,
    due: tokio::time::Instant,
}

#[derive(Default)]
struct State {
    next_id: u64,
    pending: Vec<Reminder>,
}

#[derive(Default)]
pub struct RemindPlugin {
    state: Arc<Mutex<State>>,
}

impl RemindPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `10s`, `5m`, `2h`, `1d`.
fn parse_duration(text: &str) -> Option<Duration> {
    let (count, unit) = text.split_at(text.len().checked_sub(1)?);
    let count: u64 = count.parse().ok()?;
    let secs = match unit {
        "s" => count,
        "m" => count * 60,
        "h" => count * 3600,
        "d" => count * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

fn take_pending(state: &Mutex<State>, id: u64) -> Option<Reminder> {
    let mut state = state.lock().unwrap();
    let idx = state.pending.iter().position(|r| r.id == id)?;
    Some(state.pending.remove(idx))
}

impl Plugin for RemindPlugin {
    fn name(&self) -> &'static str {
        "remind"
    }

    fn register(&self, bot: &Arc<Bot>) -> Result<(), BotError> {
        let state_add = self.state.clone();
        let state_list = self.state.clone();
        let state_cancel = self.state.clone();

        let table = vec![
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^remind (?P<who>\S+) in (?P<dur>\d+[smhd]) (?P<what>.+)$",
                "!remind <who> in <dur> <what>: dur like 10s, 5m, 2h, 1d",
                move |req| {
                    let state = state_add.clone();
                    async move {
                        let who = req.values.get("who").to_string();
                        let what = req.values.get("what").to_string();
                        let dur = match parse_duration(req.values.get("dur")) {
                            Some(d) => d,
                            None => {
                                let _ = req.say("I can't parse that duration.").await;
                                return true;
                            }
                        };
                        let asker = req.msg.user.name.clone();

                        let id = {
                            let mut s = state.lock().unwrap();
                            s.next_id += 1;
                            let id = s.next_id;
                            s.pending.push(Reminder {
                                id,
                                channel: req.msg.channel.clone(),
                                asker: asker.clone(),
                                who: who.clone(),
                                what,
                                due: tokio::time::Instant::now() + dur,
                            });
                            id
                        };
                        let _ = req.say(format!("Sure {asker}, I'll remind {who}.")).await;

                        let bot = req.bot.clone();
                        let conn = req.conn.clone();
                        let mut shutdown = req.bot.shutdown_signal();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = tokio::time::sleep(dur) => {}
                                // Timers die with the rest of the kernel.
                                _ = shutdown.wait_for(|stop| *stop) => return,
                            }
                            // Gone means cancelled in the meantime.
                            let r = match take_pending(&state, id) {
                                Some(r) => r,
                                None => return,
                            };
                            let line = format!(
                                "Hey {}, {} wanted you to be reminded: {}",
                                r.who, r.asker, r.what
                            );
                            if let Err(e) = bot
                                .send_for(conn, SendPayload::message(r.channel, line), &r.who)
                                .await
                            {
                                tracing::warn!(error = %e, "reminder delivery failed");
                            }
                        });
                        true
                    }
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^list reminders$",
                "!list reminders: what's still pending",
                move |req| {
                    let state = state_list.clone();
                    async move {
                        let lines: Vec<String> = {
                            let now = tokio::time::Instant::now();
                            let s = state.lock().unwrap();
                            s.pending
                                .iter()
                                .filter(|r| r.channel == req.msg.channel)
                                .map(|r| {
                                    let left = r.due.saturating_duration_since(now).as_secs();
                                    format!("#{}: {} in {}s: {}", r.id, r.who, left, r.what)
                                })
                                .collect()
                        };
                        if lines.is_empty() {
                            let _ = req.say("No reminders.").await;
                        } else {
                            for line in lines {
                                let _ = req.say(line).await;
                            }
                        }
                        true
                    }
                },
            ),
            HandlerSpec::new(
                Kind::Message,
                true,
                r"^cancel reminder (?P<id>\d+)$",
                "!cancel reminder <id>: drop a pending reminder",
                move |req| {
                    let state = state_cancel.clone();
                    async move {
                        let id: u64 = req.values.get("id").parse().unwrap_or(0);
                        match take_pending(&state, id) {
                            Some(r) => {
                                let _ = req
                                    .say(format!("Okay, I won't remind {} about that.", r.who))
                                    .await;
                            }
                            None => {
                                let _ = req.say(format!("No reminder #{id}.")).await;
                            }
                        }
                        true
                    }
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

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn cancellation_removes_from_pending() {
        let state = Mutex::new(State::default());
        {
            let mut s = state.lock().unwrap();
            s.next_id = 1;
            s.pending.push(Reminder {
                id: 1,
                channel: "#x".into(),
                asker: "a".into(),
                who: "b".into(),
                what: "w".into(),
                due: tokio::time::Instant::now(),
            });
        }
        assert!(take_pending(&state, 1).is_some());
        assert!(take_pending(&state, 1).is_none());
    }
}
