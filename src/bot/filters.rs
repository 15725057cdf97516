//! `$token` substitution over outbound message bodies.
//!
//! Filters run on every outbound Message/Action body and on factoid-style
//! expansions. Each filter makes a single left-to-right pass; a filter
//! that needs multi-pass expansion loops until no token remains. Bodies
//! with no `$` pass through untouched.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::conn::Connector;

/// Context a filter sees: originating user, channel, and the connector
/// (for `$someone` member lookups).
#[derive(Clone)]
pub struct FilterCtx {
    pub conn: Option<Arc<dyn Connector>>,
    pub channel: String,
    /// Display name of the user the outbound message is for.
    pub user: String,
    /// The bot's own nick, excluded from `$someone`.
    pub bot_nick: String,
}

impl FilterCtx {
    pub fn bare() -> Self {
        Self {
            conn: None,
            channel: String::new(),
            user: String::new(),
            bot_nick: String::new(),
        }
    }
}

/// A named text transformer. Free to consume or leave any token.
pub type FilterFn = Arc<dyn Fn(FilterCtx, String) -> BoxFuture<'static, String> + Send + Sync>;

/// Wrap an async closure into a [`FilterFn`].
pub fn filter<F, Fut>(f: F) -> FilterFn
where
    F: Fn(FilterCtx, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = String> + Send + 'static,
{
    Arc::new(move |ctx, body| f(ctx, body).boxed())
}

/// Replace every occurrence of `token`, drawing a fresh value each time so
/// repeated `$digit`s differ.
fn replace_each(mut body: String, token: &str, mut next: impl FnMut() -> String) -> String {
    while let Some(at) = body.find(token) {
        body.replace_range(at..at + token.len(), &next());
    }
    body
}

/// The reserved `$and` splitter: a tidbit containing it becomes up to four
/// separate messages, in order.
pub fn split_and(body: &str) -> Vec<String> {
    if !body.contains("$and") {
        return vec![body.to_string()];
    }
    body.split("$and")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(4)
        .map(str::to_string)
        .collect()
}

/// A plugin-fed set of items backing `$item` and `$giveitem`.
#[derive(Default)]
pub struct ItemSet {
    items: Mutex<Vec<String>>,
}

impl ItemSet {
    pub fn add(&self, item: impl Into<String>) {
        self.items.lock().unwrap().push(item.into());
    }

    pub fn fill(&self, items: Vec<String>) {
        *self.items.lock().unwrap() = items;
    }

    /// Random item, left in the set.
    pub fn peek(&self) -> Option<String> {
        let items = self.items.lock().unwrap();
        items.choose(&mut rand::thread_rng()).cloned()
    }

    /// Random item, removed from the set.
    pub fn take(&self) -> Option<String> {
        let mut items = self.items.lock().unwrap();
        if items.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..items.len());
        Some(items.swap_remove(idx))
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The built-in filter set, in registration order.
pub fn builtin_filters(items: Arc<ItemSet>) -> Vec<(String, FilterFn)> {
    let mut out: Vec<(String, FilterFn)> = Vec::new();

    out.push((
        "nick".to_string(),
        filter(|ctx: FilterCtx, body: String| async move {
            if body.contains("$nick") {
                body.replace("$nick", &ctx.user)
            } else {
                body
            }
        }),
    ));

    out.push((
        "someone".to_string(),
        filter(|ctx: FilterCtx, body: String| async move {
            if !body.contains("$someone") {
                return body;
            }
            let mut members = match &ctx.conn {
                Some(conn) => conn.who(&ctx.channel).await,
                None => Vec::new(),
            };
            members.retain(|m| !m.eq_ignore_ascii_case(&ctx.bot_nick));
            if members.is_empty() {
                // Nobody visible; fall back to the author.
                return body.replace("$someone", &ctx.user);
            }
            replace_each(body, "$someone", || {
                members
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .unwrap_or_default()
            })
        }),
    ));

    out.push((
        "digit".to_string(),
        filter(|_ctx, body: String| async move {
            replace_each(body, "$digit", || {
                rand::thread_rng().gen_range(0..=9).to_string()
            })
        }),
    ));

    out.push((
        "nonzero".to_string(),
        filter(|_ctx, body: String| async move {
            replace_each(body, "$nonzero", || {
                rand::thread_rng().gen_range(1..=9).to_string()
            })
        }),
    ));

    // $giveitem first: it is a prefix collision with $item otherwise.
    let give_items = items.clone();
    out.push((
        "giveitem".to_string(),
        filter(move |_ctx, body: String| {
            let items = give_items.clone();
            async move {
                replace_each(body, "$giveitem", || {
                    items.take().unwrap_or_else(|| "nothing".to_string())
                })
            }
        }),
    ));

    let peek_items = items;
    out.push((
        "item".to_string(),
        filter(move |_ctx, body: String| {
            let items = peek_items.clone();
            async move {
                replace_each(body, "$item", || {
                    items.peek().unwrap_or_else(|| "nothing".to_string())
                })
            }
        }),
    ));

    out
}
