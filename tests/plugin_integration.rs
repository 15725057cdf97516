//! End-to-end plugin scenarios through the mock connector: counters and
//! aliases, the tea pattern, factoid learn/recall/forget, quote capture,
//! and `$and` fan-out.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use hubbub::conn::mock::MockConnector;
use hubbub::msg::SendPayload;
use hubbub::plugins::counter::CounterPlugin;
use hubbub::plugins::factoid::FactoidPlugin;
use hubbub::plugins::{self, Plugin};
use hubbub::{Bot, Config};

fn kernel_with(install: &[&dyn Plugin]) -> (Arc<Bot>, Arc<MockConnector>) {
    let config = Arc::new(Config::open_in_memory().unwrap());
    let bot = Bot::new(config);
    plugins::install(&bot, install).unwrap();
    let conn = MockConnector::new();
    bot.wire(conn.clone());
    bot.start();
    (bot, conn)
}

#[tokio::test]
async fn counter_increments_per_user() {
    let counter = CounterPlugin::new();
    let (bot, conn) = kernel_with(&[&counter]);

    conn.say(&bot, "#bar", "alice", "beer++").await;
    assert_eq!(conn.message_bodies(), vec!["alice has 1 beer."]);

    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "beer++").await;
    assert_eq!(conn.message_bodies(), vec!["alice has 2 beer."]);

    // Counts are per user.
    conn.clear_sent();
    conn.say(&bot, "#bar", "bob", "beer++").await;
    assert_eq!(conn.message_bodies(), vec!["bob has 1 beer."]);

    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "beer--").await;
    assert_eq!(conn.message_bodies(), vec!["alice has 1 beer."]);
}

#[tokio::test]
async fn alias_credits_the_target_item() {
    let counter = CounterPlugin::new();
    let (bot, conn) = kernel_with(&[&counter]);

    conn.say(&bot, "#bar", "alice", "!mkalias beers :beer:").await;
    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "beers++").await;
    assert_eq!(conn.message_bodies(), vec!["alice has 1 :beer:."]);
}

#[tokio::test]
async fn tea_pattern_takes_three_sentences() {
    let counter = CounterPlugin::new();
    let (bot, conn) = kernel_with(&[&counter]);

    conn.say(&bot, "#bar", "alice", "Tea. Earl Grey. Hot.").await;
    let reacted = conn
        .sent()
        .iter()
        .any(|p| matches!(p, SendPayload::Reaction { emoji, .. } if emoji == "tea"));
    assert!(reacted);

    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "Tea. Earl Grey.").await;
    assert!(conn.sent().is_empty());
}

#[tokio::test]
async fn counter_update_hooks_observe_changes() {
    let counter = CounterPlugin::new();
    let last = Arc::new(AtomicI64::new(0));
    let sink = last.clone();
    counter.on_update(Arc::new(move |_nick, _item, value| {
        sink.store(value, Ordering::SeqCst);
    }));
    let (bot, conn) = kernel_with(&[&counter]);

    conn.say(&bot, "#bar", "alice", "beer++").await;
    conn.say(&bot, "#bar", "alice", "beer++").await;
    assert_eq!(last.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn factoid_learn_recall_and_forget() {
    let factoid = FactoidPlugin::new();
    let (bot, conn) = kernel_with(&[&factoid]);

    conn.say(&bot, "#bar", "alice", "!this is that").await;
    assert_eq!(conn.message_bodies(), vec!["Okay, alice."]);

    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "this").await;
    assert_eq!(conn.message_bodies(), vec!["this is that"]);

    // A stranger can't delete it.
    conn.clear_sent();
    conn.say(&bot, "#bar", "mallory", "!forget that").await;
    assert_eq!(conn.message_bodies(), vec!["You don't own that fact."]);

    // The owner can.
    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "!forget that").await;
    assert_eq!(conn.message_bodies(), vec!["I forgot this."]);

    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "this").await;
    assert!(conn.message_bodies().is_empty());
}

#[tokio::test]
async fn admin_can_forget_someone_elses_fact() {
    let factoid = FactoidPlugin::new();
    let (bot, conn) = kernel_with(&[&factoid]);
    bot.config()
        .set_array("admins", &["root".to_string()])
        .unwrap();

    conn.say(&bot, "#bar", "alice", "!cake is a lie").await;
    conn.say(&bot, "#bar", "bob", "cake").await;
    conn.clear_sent();
    conn.say(&bot, "#bar", "root", "!forget that").await;
    assert_eq!(conn.message_bodies(), vec!["I forgot cake."]);
}

#[tokio::test]
async fn remember_quotes_from_history() {
    let factoid = FactoidPlugin::new();
    let (bot, conn) = kernel_with(&[&factoid]);

    conn.say(&bot, "#bar", "bob", "horse dick").await;
    conn.clear_sent();

    // Substring must actually appear in one of bob's lines.
    conn.say(&bot, "#bar", "tester", "!remember bob touch").await;
    assert_eq!(
        conn.message_bodies(),
        vec!["I don't remember bob saying \"touch\"."]
    );

    conn.clear_sent();
    conn.say(&bot, "#bar", "tester", "!remember bob horse").await;
    let bodies = conn.message_bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("horse dick"), "got {bodies:?}");

    conn.clear_sent();
    conn.say(&bot, "#bar", "tester", "!quote").await;
    assert_eq!(conn.message_bodies(), vec!["<bob> horse dick"]);
}

#[tokio::test]
async fn and_token_splits_a_recall_into_multiple_sends() {
    let factoid = FactoidPlugin::new();
    let (bot, conn) = kernel_with(&[&factoid]);

    conn.say(&bot, "#bar", "alice", "!combo reply one $and two $and three")
        .await;
    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "combo").await;
    assert_eq!(conn.message_bodies(), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn nick_token_expands_on_recall() {
    let factoid = FactoidPlugin::new();
    let (bot, conn) = kernel_with(&[&factoid]);

    conn.say(&bot, "#bar", "alice", "!hello reply hi there $nick")
        .await;
    conn.clear_sent();
    conn.say(&bot, "#bar", "bob", "hello").await;
    assert_eq!(conn.message_bodies(), vec!["hi there bob"]);
}

#[tokio::test]
async fn what_was_that_names_the_last_factoid() {
    let factoid = FactoidPlugin::new();
    let (bot, conn) = kernel_with(&[&factoid]);

    conn.say(&bot, "#bar", "alice", "!this is that").await;
    conn.say(&bot, "#bar", "alice", "this").await;
    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "!what was that").await;
    let bodies = conn.message_bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].starts_with("That was this"), "got {bodies:?}");
}
