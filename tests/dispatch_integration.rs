//! Kernel dispatch behavior through the mock connector: ordering,
//! short-circuiting, Help fan-out, panic isolation, blacklist, and the
//! unknown-command fallback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hubbub::conn::mock::MockConnector;
use hubbub::{handler, Bot, Config, Kind, Message, User};

fn kernel() -> (Arc<Bot>, Arc<MockConnector>) {
    let config = Arc::new(Config::open_in_memory().unwrap());
    let bot = Bot::new(config);
    let conn = MockConnector::new();
    bot.wire(conn.clone());
    (bot, conn)
}

#[tokio::test]
async fn handlers_fire_in_registration_order_and_short_circuit() {
    let (bot, conn) = kernel();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    bot.register_plugin("first");
    let log = order.clone();
    bot.register_regex(
        "first",
        Kind::Message,
        r"ping",
        handler(move |_req| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("first");
                true
            }
        }),
    );

    bot.register_plugin("second");
    let log = order.clone();
    bot.register_regex(
        "second",
        Kind::Message,
        r"ping",
        handler(move |_req| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("second");
                true
            }
        }),
    );
    bot.start();

    conn.say(&bot, "#bar", "alice", "ping").await;
    assert_eq!(*order.lock().unwrap(), vec!["first"]);
}

#[tokio::test]
async fn returning_false_lets_the_chain_continue() {
    let (bot, conn) = kernel();
    let hits = Arc::new(AtomicUsize::new(0));

    bot.register_plugin("pass");
    bot.register_regex("pass", Kind::Message, r".*", handler(|_req| async { false }));

    bot.register_plugin("sink");
    let count = hits.clone();
    bot.register_regex(
        "sink",
        Kind::Message,
        r".*",
        handler(move |_req| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                true
            }
        }),
    );
    bot.start();

    conn.say(&bot, "#bar", "alice", "anything").await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn help_is_broadcast_to_every_handler() {
    let (bot, conn) = kernel();
    let hits = Arc::new(AtomicUsize::new(0));

    for name in ["one", "two"] {
        bot.register_plugin(name);
        let count = hits.clone();
        bot.register_regex(
            name,
            Kind::Help,
            r".*",
            handler(move |_req| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    true
                }
            }),
        );
    }
    bot.start();

    let msg = Message::new(User::new("alice", "alice"), "#bar", "help");
    conn.deliver(Kind::Help, msg).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_panicking_handler_does_not_stop_later_handlers() {
    let (bot, conn) = kernel();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    bot.register_plugin("bomb");
    bot.register_regex(
        "bomb",
        Kind::Message,
        r"^boom$",
        handler(|_req| async { panic!("kaboom") }),
    );

    bot.register_plugin("logger");
    let sink = seen.clone();
    bot.register_regex(
        "logger",
        Kind::Message,
        r".*",
        handler(move |req| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(req.msg.body.clone());
                true
            }
        }),
    );
    bot.start();

    conn.say(&bot, "#bar", "alice", "boom").await;
    assert_eq!(*seen.lock().unwrap(), vec!["boom".to_string()]);
}

#[tokio::test]
async fn blacklisted_plugin_is_silent_in_that_channel_only() {
    let (bot, conn) = kernel();

    bot.register_plugin("echo");
    bot.register_regex(
        "echo",
        Kind::Message,
        r".*",
        handler(|req| async move {
            let _ = req.say(format!("echo: {}", req.msg.body)).await;
            true
        }),
    );
    bot.set_blacklisted("#quiet", "echo", true).unwrap();
    bot.start();

    conn.say(&bot, "#quiet", "alice", "hello").await;
    assert!(conn.message_bodies().is_empty());

    conn.say(&bot, "#loud", "alice", "hello").await;
    assert_eq!(conn.message_bodies(), vec!["echo: hello"]);
}

#[tokio::test]
async fn unhandled_command_gets_a_fallback_when_enabled() {
    let (bot, conn) = kernel();
    bot.config().set("bot.reply_unknown", "true").unwrap();
    bot.start();

    conn.say(&bot, "#bar", "alice", "!frobnicate").await;
    assert_eq!(
        conn.message_bodies(),
        vec!["I don't know what to do with \"frobnicate\"."]
    );

    // Plain chatter never triggers the fallback.
    conn.clear_sent();
    conn.say(&bot, "#bar", "alice", "frobnicate").await;
    assert!(conn.message_bodies().is_empty());
}

#[tokio::test]
async fn edits_replace_the_archived_message_in_place() {
    let (bot, conn) = kernel();
    bot.start();

    let mut original = Message::new(User::new("alice", "alice"), "#bar", "teh typo");
    original.extra.insert("backend_id".into(), "b-1".into());
    conn.deliver(Kind::Message, original).await;

    let mut edit = Message::new(User::new("alice", "alice"), "#bar", "the typo");
    edit.extra.insert("backend_id".into(), "b-1".into());
    edit.extra.insert("edit_of".into(), "b-1".into());
    conn.deliver(Kind::Edit, edit).await;

    let archived = bot.history().in_channel("#bar");
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].body, "the typo");
}
