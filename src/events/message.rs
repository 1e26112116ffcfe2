use poise::serenity_prelude as serenity;
use tracing::{debug, error};

use crate::messages;
use crate::state::VerifyToken;
use crate::{Data, Error};

/// Handle incoming messages
pub async fn handle_message(
    ctx: &serenity::Context,
    msg: &serenity::Message,
    data: &Data,
) -> Result<(), Error> {
    // Ignore bot messages
    if msg.author.bot {
        return Ok(());
    }

    // Verification only happens in DMs
    if msg.guild_id.is_none() {
        return handle_dm_message(ctx, msg, data).await;
    }

    Ok(())
}

/// Whether a DM is meant for the verification flow
fn is_start_request(content: &str) -> bool {
    let first = content.split_whitespace().next().unwrap_or_default();
    matches!(first, "/start" | "start" | "!start") || VerifyToken::find_in(content).is_some()
}

/// Handle DM messages such as `verify_123` or `/start verify_123`
async fn handle_dm_message(
    ctx: &serenity::Context,
    msg: &serenity::Message,
    data: &Data,
) -> Result<(), Error> {
    if !is_start_request(&msg.content) {
        return Ok(());
    }

    debug!("Processing DM verify attempt from: {}", msg.author.name);

    let text = match data.events.verify(msg.author.id, msg.content.clone()).await {
        Ok(reply) => messages::reply_message(reply, &data.bot_name),
        Err(e) => {
            error!("Verify attempt from {} failed: {}", msg.author.id, e);
            messages::internal_error_message()
        }
    };

    msg.channel_id.say(&ctx.http, text).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_detection() {
        assert!(is_start_request("/start verify_12"));
        assert!(is_start_request("verify_12"));
        assert!(is_start_request("start"));
        assert!(!is_start_request("hello bot"));
        assert!(!is_start_request(""));
    }
}
