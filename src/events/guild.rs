use poise::serenity_prelude as serenity;
use tracing::{info, warn};

use crate::managers::JoiningMember;
use crate::state::ChatRef;
use crate::{Data, Error};

/// Handle when a new member joins the guild
pub async fn handle_member_add(
    ctx: &serenity::Context,
    new_member: &serenity::Member,
    data: &Data,
) -> Result<(), Error> {
    let guild_id = new_member.guild_id;

    info!(
        "New member joined: {} in guild {}",
        new_member.user.name, guild_id
    );

    let Some(channel_id) = find_challenge_channel(
        ctx,
        guild_id,
        data.settings.verification_channel.as_deref(),
    )
    .await
    else {
        warn!(
            "No text channel to post a challenge in guild {}, {} is not gated",
            guild_id, new_member.user.name
        );
        return Ok(());
    };

    let member = JoiningMember {
        user_id: new_member.user.id,
        display_name: new_member.display_name().to_string(),
        is_bot: new_member.user.bot,
    };

    data.events
        .join(ChatRef::new(guild_id, channel_id), vec![member])
        .await?;

    Ok(())
}

/// Find the channel challenges are posted in
pub async fn find_challenge_channel(
    ctx: &serenity::Context,
    guild_id: serenity::GuildId,
    preferred: Option<&str>,
) -> Option<serenity::ChannelId> {
    let channels = guild_id.channels(&ctx.http).await.ok()?;

    let text_channels: Vec<(serenity::ChannelId, String, u16)> = channels
        .values()
        .filter(|c| c.kind == serenity::ChannelType::Text)
        .map(|c| (c.id, c.name.clone(), c.position))
        .collect();

    pick_challenge_channel(&text_channels, preferred)
}

/// Configured name first, then "welcome", then the top-most text channel
fn pick_challenge_channel(
    text_channels: &[(serenity::ChannelId, String, u16)],
    preferred: Option<&str>,
) -> Option<serenity::ChannelId> {
    let by_name = |name: &str| {
        text_channels
            .iter()
            .find(|(_, n, _)| n.eq_ignore_ascii_case(name))
            .map(|(id, _, _)| *id)
    };

    preferred
        .and_then(by_name)
        .or_else(|| by_name("welcome"))
        .or_else(|| {
            text_channels
                .iter()
                .min_by_key(|(_, _, position)| *position)
                .map(|(id, _, _)| *id)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use poise::serenity_prelude::ChannelId;

    fn channels() -> Vec<(ChannelId, String, u16)> {
        vec![
            (ChannelId::new(3), "general".to_string(), 2),
            (ChannelId::new(4), "Welcome".to_string(), 5),
            (ChannelId::new(5), "gate".to_string(), 7),
            (ChannelId::new(6), "rules".to_string(), 1),
        ]
    }

    #[test]
    fn test_prefers_configured_channel() {
        assert_eq!(
            pick_challenge_channel(&channels(), Some("gate")),
            Some(ChannelId::new(5))
        );
    }

    #[test]
    fn test_falls_back_to_welcome_then_topmost() {
        assert_eq!(
            pick_challenge_channel(&channels(), Some("missing")),
            Some(ChannelId::new(4))
        );

        let without_welcome: Vec<_> = channels()
            .into_iter()
            .filter(|(_, name, _)| name != "Welcome")
            .collect();
        assert_eq!(
            pick_challenge_channel(&without_welcome, None),
            Some(ChannelId::new(6))
        );
        assert_eq!(pick_challenge_channel(&[], None), None);
    }
}
