//! Bundled plugins and the registration contract they share.
//!
//! Plugins only talk to the kernel: handler tables, filters, config, the
//! sqlite handle, and web mounts. Inter-plugin signaling goes through
//! explicit hooks a plugin publishes (see the counter's update hooks),
//! never through direct references.

pub mod counter;
pub mod factoid;
pub mod remind;

use std::sync::Arc;

use crate::bot::Bot;
use crate::error::BotError;

pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Claim tables, handlers, filters and web routes. Runs once at boot,
    /// before the kernel starts.
    fn register(&self, bot: &Arc<Bot>) -> Result<(), BotError>;
}

/// Register each plugin under its unique name. Panics on a duplicate name;
/// that is a boot wiring bug, not a runtime condition.
pub fn install(bot: &Arc<Bot>, plugins: &[&dyn Plugin]) -> Result<(), BotError> {
    for plugin in plugins {
        bot.register_plugin(plugin.name());
        plugin.register(bot)?;
        tracing::debug!(plugin = plugin.name(), "registered");
    }
    Ok(())
}

/// `!help`: one line per handler that carries help text.
pub struct HelpPlugin;

impl Plugin for HelpPlugin {
    fn name(&self) -> &'static str {
        "help"
    }

    fn register(&self, bot: &Arc<Bot>) -> Result<(), BotError> {
        bot.register_regex_cmd(
            self.name(),
            crate::msg::Kind::Message,
            r"^help$",
            crate::bot::request::handler(|req| async move {
                let entries = req.bot.help_entries();
                if entries.is_empty() {
                    let _ = req.say("I have nothing to say for myself.").await;
                    return true;
                }
                for (plugin, help) in entries {
                    let _ = req.say(format!("{plugin}: {help}")).await;
                }
                true
            }),
        );
        Ok(())
    }
}
