use poise::serenity_prelude as serenity;
use tracing::info;

use crate::{Context, Error};

/// Check if the bot is running
#[poise::command(prefix_command, slash_command)]
pub async fn ping(ctx: Context<'_>) -> Result<(), Error> {
    info!("Ping command called by {}", ctx.author().name);
    let pending = &ctx.data().pending;
    let content = if pending.is_empty() {
        "Pong! Nobody is awaiting verification.".to_string()
    } else {
        format!("Pong! {} member(s) currently awaiting verification.", pending.len())
    };
    ctx.send(poise::CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}

/// Show help information
#[poise::command(prefix_command, slash_command)]
pub async fn help(ctx: Context<'_>) -> Result<(), Error> {
    let embed = serenity::CreateEmbed::new()
        .title("Bot Commands")
        .description("New members are muted until they verify.")
        .field("/ping", "Check if the bot is running", false)
        .field("/start <token>", "Verify with the token from your challenge link", false)
        .color(0x3498db);

    ctx.send(poise::CreateReply::default().embed(embed).ephemeral(true)).await?;
    Ok(())
}
