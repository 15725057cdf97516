//! Reminder scheduling through the mock connector, with real (short)
//! timers.

use std::sync::Arc;
use std::time::Duration;

use hubbub::conn::mock::MockConnector;
use hubbub::plugins::remind::RemindPlugin;
use hubbub::plugins::{self, Plugin};
use hubbub::{Bot, Config};

fn kernel() -> (Arc<Bot>, Arc<MockConnector>) {
    let config = Arc::new(Config::open_in_memory().unwrap());
    let bot = Bot::new(config);
    let remind = RemindPlugin::new();
    plugins::install(&bot, &[&remind as &dyn Plugin]).unwrap();
    let conn = MockConnector::new();
    bot.wire(conn.clone());
    bot.start();
    (bot, conn)
}

#[tokio::test]
async fn ack_then_delivery() {
    let (bot, conn) = kernel();

    conn.say(&bot, "#bar", "tester", "!remind testuser in 1s don't fail")
        .await;
    assert_eq!(
        conn.message_bodies(),
        vec!["Sure tester, I'll remind testuser."]
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        conn.message_bodies(),
        vec![
            "Sure tester, I'll remind testuser.",
            "Hey testuser, tester wanted you to be reminded: don't fail",
        ]
    );
}

#[tokio::test]
async fn reminders_deliver_in_deadline_order() {
    let (bot, conn) = kernel();

    conn.say(&bot, "#bar", "tester", "!remind a in 2s second").await;
    conn.say(&bot, "#bar", "tester", "!remind b in 1s first").await;
    conn.clear_sent();

    tokio::time::sleep(Duration::from_millis(2600)).await;
    assert_eq!(
        conn.message_bodies(),
        vec![
            "Hey b, tester wanted you to be reminded: first",
            "Hey a, tester wanted you to be reminded: second",
        ]
    );
}

#[tokio::test]
async fn cancelled_reminders_never_fire() {
    let (bot, conn) = kernel();

    conn.say(&bot, "#bar", "tester", "!remind a in 1s doomed").await;
    conn.say(&bot, "#bar", "tester", "!cancel reminder 1").await;
    conn.clear_sent();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(conn.message_bodies().is_empty());
}

#[tokio::test]
async fn shutdown_stops_pending_timers() {
    let (bot, conn) = kernel();

    conn.say(&bot, "#bar", "tester", "!remind a in 1s too late").await;
    conn.clear_sent();
    bot.shutdown();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(conn.message_bodies().is_empty());
}

#[tokio::test]
async fn list_reminders_shows_pending_then_empties() {
    let (bot, conn) = kernel();

    conn.say(&bot, "#bar", "tester", "!remind a in 1h later").await;
    conn.clear_sent();
    conn.say(&bot, "#bar", "tester", "!list reminders").await;
    let bodies = conn.message_bodies();
    assert_eq!(bodies.len(), 1);
    assert!(bodies[0].contains("a in"), "got {bodies:?}");
    assert!(bodies[0].contains("later"), "got {bodies:?}");

    conn.say(&bot, "#bar", "tester", "!cancel reminder 1").await;
    conn.clear_sent();
    conn.say(&bot, "#bar", "tester", "!list reminders").await;
    assert_eq!(conn.message_bodies(), vec!["No reminders."]);
}
