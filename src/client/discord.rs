use async_trait::async_trait;
use poise::serenity_prelude::{
    self as serenity, ChannelId, CreateActionRow, CreateButton, CreateMessage, EditMember,
    GuildId, Http, MessageId, UserId,
};
use std::sync::Arc;
use tracing::debug;

use super::{ChatClient, OutgoingMessage};
use crate::config::MAX_TIMEOUT_DAYS;
use crate::error::{BotError, Result};
use crate::managers::permission_checker::check_guild_permissions;
use crate::state::VerifyToken;


/// `ChatClient` over the serenity HTTP client
pub struct DiscordClient {
    http: Arc<Http>,
    base_url: String,
}

impl DiscordClient {
    pub fn new(http: Arc<Http>, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChatClient for DiscordClient {
    async fn is_admin(&self, guild_id: GuildId) -> Result<bool> {
        let check = check_guild_permissions(&self.http, guild_id)
            .await
            .map_err(|message| BotError::Discord { message })?;
        Ok(check.can_moderate())
    }

    async fn restrict(
        &self,
        guild_id: GuildId,
        member_id: UserId,
        can_send_messages: bool,
    ) -> Result<()> {
        let builder = if can_send_messages {
            EditMember::new().enable_communication()
        } else {
            let until = chrono::Utc::now() + chrono::Duration::days(MAX_TIMEOUT_DAYS as i64)
                - chrono::Duration::minutes(1);
            EditMember::new().disable_communication_until(until.to_rfc3339())
        };

        guild_id.edit_member(&self.http, member_id, builder).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        channel_id: ChannelId,
        message: OutgoingMessage,
    ) -> Result<MessageId> {
        let mut builder = CreateMessage::new().content(message.content);
        if let Some(button) = message.link_button {
            builder = builder.components(vec![CreateActionRow::Buttons(vec![
                CreateButton::new_link(button.url).label(button.label),
            ])]);
        }

        let sent: serenity::Message = channel_id.send_message(&self.http, builder).await?;
        Ok(sent.id)
    }

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()> {
        channel_id.delete_message(&self.http, message_id).await?;
        Ok(())
    }

    async fn remove_member(&self, guild_id: GuildId, member_id: UserId) -> Result<()> {
        guild_id.ban(&self.http, member_id, 0).await?;
        debug!("Banned {} from {}, lifting ban", member_id, guild_id);
        guild_id.unban(&self.http, member_id).await?;
        Ok(())
    }

    fn build_deep_link(&self, token: &VerifyToken) -> String {
        format!("{}/verify/{}", self.base_url, token)
    }
}
