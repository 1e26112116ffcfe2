//! Chat platform capabilities the verification flow depends on.

pub mod discord;

use async_trait::async_trait;
use poise::serenity_prelude::{ChannelId, GuildId, MessageId, UserId};

use crate::error::Result;
use crate::state::VerifyToken;

pub use discord::DiscordClient;

/// A message to post, optionally with a single link button
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub content: String,
    pub link_button: Option<LinkButton>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkButton {
    pub label: String,
    pub url: String,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            link_button: None,
        }
    }

    pub fn with_link(mut self, label: impl Into<String>, url: impl Into<String>) -> Self {
        self.link_button = Some(LinkButton {
            label: label.into(),
            url: url.into(),
        });
        self
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync + 'static {
    /// Whether the bot can moderate members in the guild
    async fn is_admin(&self, guild_id: GuildId) -> Result<bool>;

    async fn restrict(
        &self,
        guild_id: GuildId,
        member_id: UserId,
        can_send_messages: bool,
    ) -> Result<()>;

    async fn send_message(&self, channel_id: ChannelId, message: OutgoingMessage)
        -> Result<MessageId>;

    async fn delete_message(&self, channel_id: ChannelId, message_id: MessageId) -> Result<()>;

    /// Remove without a lasting ban
    async fn remove_member(&self, guild_id: GuildId, member_id: UserId) -> Result<()>;

    fn build_deep_link(&self, token: &VerifyToken) -> String;
}
