use chrono::{DateTime, Utc};
use poise::serenity_prelude::{ChannelId, GuildId, MessageId, UserId};

/// Where a member is being gated: the guild they are restricted in and the
/// channel their challenge is posted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatRef {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

impl ChatRef {
    pub fn new(guild_id: GuildId, channel_id: ChannelId) -> Self {
        Self {
            guild_id,
            channel_id,
        }
    }
}

/// Lifecycle of a pending verification record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Muted, waiting for the member to verify
    Pending,
    /// A verify attempt is being evaluated against this record
    Verifying,
    /// Claimed by exactly one resolution path and removed from the store
    Resolved,
}

/// A muted member awaiting verification
#[derive(Debug, Clone, PartialEq)]
pub struct PendingVerification {
    pub member_id: UserId,
    pub chat: ChatRef,
    /// Message carrying the verify link, once the send has returned
    pub challenge_message_id: Option<MessageId>,
    /// Cached so notices can name the member after they are gone
    pub display_name: String,
    /// Fixed at creation
    pub expires_at: DateTime<Utc>,
    pub state: RecordState,
}

impl PendingVerification {
    pub fn new(
        member_id: UserId,
        chat: ChatRef,
        display_name: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            member_id,
            chat,
            challenge_message_id: None,
            display_name: display_name.into(),
            expires_at,
            state: RecordState::Pending,
        }
    }

    /// Strictly after `expires_at`; a record is still valid at its exact expiry instant
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
