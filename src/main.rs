//! hubbub entry point: config, kernel, plugins, connectors, web.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use hubbub::bot::Bot;
use hubbub::config::Config;
use hubbub::conn::cli::CliConnector;
use hubbub::conn::discord::{DiscordConnector, DiscordSettings};
use hubbub::conn::irc::{IrcConnector, IrcSettings};
use hubbub::conn::slack::{SlackConnector, SlackSettings};
use hubbub::conn::Connector;
use hubbub::msg::{Kind, Message, User};
use hubbub::plugins::{self, counter::CounterPlugin, factoid::FactoidPlugin, remind::RemindPlugin, HelpPlugin};

#[derive(Debug, Parser)]
#[command(name = "hubbub", about = "Multi-connector chat bot host")]
struct Cli {
    /// Sqlite database path for config and plugin state.
    #[arg(long, default_value = "hubbub.db")]
    db: String,

    /// Bind address for the web multiplexer.
    #[arg(long, default_value = "127.0.0.1:8080")]
    http: SocketAddr,

    /// Command prefix.
    #[arg(long, default_value = "!")]
    prefix: String,

    #[arg(long)]
    irc: bool,

    #[arg(long)]
    slack: bool,

    #[arg(long)]
    discord: bool,

    /// Enable the HTTP console connector at /cli.
    #[arg(long)]
    cli: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Cli::parse();
    let config = Arc::new(Config::open(&args.db)?);
    let bot = Bot::new(config.clone());

    let counter = CounterPlugin::new();
    let factoid = FactoidPlugin::new();
    let remind = RemindPlugin::new();
    plugins::install(&bot, &[&counter, &factoid, &remind, &HelpPlugin])?;

    let mut conns: Vec<Arc<dyn Connector>> = Vec::new();
    if args.irc {
        let conn = IrcConnector::new(IrcSettings::from_config(&config), args.prefix.clone());
        conns.push(conn);
    }
    if args.slack {
        let conn = SlackConnector::new(SlackSettings::from_config(&config), args.prefix.clone());
        bot.register_web("/evt/slack", conn.router(), None);
        conns.push(conn);
    }
    if args.discord {
        let conn = DiscordConnector::new(DiscordSettings::from_config(&config), args.prefix.clone());
        conns.push(conn);
    }
    if args.cli {
        let conn = CliConnector::new(config.clone(), args.prefix.clone());
        bot.register_web("/cli", conn.router(), None);
        conns.push(conn);
    }
    if conns.is_empty() {
        anyhow::bail!("no connectors enabled; pass --irc, --slack, --discord or --cli");
    }

    for conn in &conns {
        bot.wire(conn.clone());
    }
    bot.start();

    let mut tasks = tokio::task::JoinSet::new();
    for conn in conns {
        let shutdown = bot.shutdown_signal();
        let name = conn.name();
        tasks.spawn(async move {
            if let Err(e) = conn.serve(shutdown).await {
                tracing::error!(connector = name, error = %e, "connector exited");
            }
        });
    }

    // Boot broadcast so plugins can announce or warm caches.
    if let Some(conn) = bot.default_connector() {
        let startup = Message::new(User::new("", ""), "", "");
        bot.receive(conn, Kind::Startup, startup).await;
    }

    let web_bot = bot.clone();
    let web_addr = args.http;
    tasks.spawn(async move {
        if let Err(e) = web_bot.serve_web(web_addr).await {
            tracing::error!(error = %e, "web server exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    bot.shutdown();
    while tasks.join_next().await.is_some() {}
    Ok(())
}
