use tracing::error;

use crate::messages;
use crate::{Context, Error};

/// Verify with the token from your challenge link
///
/// Runs the same check as the link button: the token must name you and still be valid.
#[poise::command(prefix_command, slash_command)]
pub async fn start(
    ctx: Context<'_>,
    #[description = "Token from your verification link, e.g. verify_123"] token: Option<String>,
) -> Result<(), Error> {
    let text = token.unwrap_or_default();

    let content = match ctx.data().events.verify(ctx.author().id, text).await {
        Ok(reply) => messages::reply_message(reply, &ctx.data().bot_name),
        Err(e) => {
            error!("Verify attempt from {} failed: {}", ctx.author().id, e);
            messages::internal_error_message()
        }
    };

    ctx.send(poise::CreateReply::default().content(content).ephemeral(true))
        .await?;
    Ok(())
}
