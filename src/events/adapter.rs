use chrono::{DateTime, Utc};
use poise::serenity_prelude::{ChannelId, MessageId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{ChatClient, OutgoingMessage};
use crate::error::BotError;
use crate::logging::AUDIT_TARGET;
use crate::managers::verification_manager::{Effect, JoiningMember, Reply, SharedVerificationManager};
use crate::messages;
use crate::state::ChatRef;

/// Bridges platform events to the verification state machine and carries out
/// the effects it requests against the chat client.
///
/// Client failures are logged and never abort the rest of a batch.
pub struct EventAdapter<C: ChatClient> {
    manager: SharedVerificationManager,
    client: Arc<C>,
    challenge_minutes: u64,
}

impl<C: ChatClient> EventAdapter<C> {
    pub fn new(manager: SharedVerificationManager, client: Arc<C>, challenge_ttl: Duration) -> Self {
        Self {
            manager,
            client,
            challenge_minutes: challenge_ttl.as_secs().div_ceil(60).max(1),
        }
    }

    pub fn manager(&self) -> &SharedVerificationManager {
        &self.manager
    }

    pub async fn on_join(&self, chat: ChatRef, members: &[JoiningMember]) {
        let bot_is_admin = match self.client.is_admin(chat.guild_id).await {
            Ok(is_admin) => is_admin,
            Err(e) => {
                error!(
                    target: AUDIT_TARGET,
                    kind = "ERROR",
                    event = "CHECK_BOT_ADMIN",
                    guild = %chat.guild_id,
                    error = %e,
                    "Could not check bot permissions"
                );
                false
            }
        };

        let effects = self.manager.on_join(chat, members, bot_is_admin, Utc::now());
        self.execute(effects).await;
    }

    pub async fn on_verify_attempt(&self, requester: UserId, text: &str) -> Reply {
        let outcome = self.manager.on_verify_attempt(requester, text, Utc::now());
        self.execute(outcome.effects).await;
        outcome.reply
    }

    /// One sweep pass; returns how many effects were requested
    pub async fn on_tick(&self, now: DateTime<Utc>) -> usize {
        let effects = self.manager.on_tick(now);
        let count = effects.len();
        self.execute(effects).await;
        count
    }

    /// Drop every pending verification and write the shutdown marker.
    /// Abandoned members stay muted.
    pub fn on_shutdown(&self, reason: &str) -> usize {
        debug!(
            "{} verification(s) pending at shutdown",
            self.manager.pending_count()
        );
        let store = self.manager().store();
        let mut abandoned = 0;
        store.for_each(|record| {
            if store.delete(record.member_id).is_some() {
                info!("Abandoning verification of {} in {}", record.member_id, record.chat.guild_id);
                abandoned += 1;
            }
        });
        info!(
            target: AUDIT_TARGET,
            kind = "SYSTEM",
            abandoned = abandoned,
            "Bot stopped by {}",
            reason
        );
        abandoned
    }

    pub async fn execute(&self, effects: Vec<Effect>) {
        for effect in effects {
            self.apply(effect).await;
        }
    }

    async fn apply(&self, effect: Effect) {
        match effect {
            Effect::Restrict {
                guild_id,
                member_id,
                can_send_messages,
            } => {
                if let Err(e) = self
                    .client
                    .restrict(guild_id, member_id, can_send_messages)
                    .await
                {
                    report_failure(
                        if can_send_messages { "UNMUTE" } else { "MUTE" },
                        member_id,
                        &e,
                    );
                }
            }
            Effect::SendChallenge {
                chat,
                member_id,
                display_name,
                expires_at,
                token,
            } => {
                let message = OutgoingMessage::text(messages::challenge_message(
                    member_id,
                    &display_name,
                    self.challenge_minutes,
                ))
                .with_link(
                    messages::challenge_button_label(),
                    self.client.build_deep_link(&token),
                );

                match self.client.send_message(chat.channel_id, message).await {
                    Ok(message_id) => {
                        self.manager.attach_challenge(member_id, expires_at, message_id);
                    }
                    Err(e) => report_failure("SEND_CHALLENGE", member_id, &e),
                }
            }
            Effect::DeleteMessage {
                channel_id,
                message_id,
            } => {
                if let Err(e) = self.client.delete_message(channel_id, message_id).await {
                    debug!("Could not delete message {} in {}: {}", message_id, channel_id, e);
                }
            }
            Effect::RemoveMember {
                guild_id,
                member_id,
            } => {
                if let Err(e) = self.client.remove_member(guild_id, member_id).await {
                    report_failure("REMOVE_MEMBER", member_id, &e);
                }
            }
            Effect::SendNotice {
                channel_id,
                content,
                delete_after,
            } => match self
                .client
                .send_message(channel_id, OutgoingMessage::text(content))
                .await
            {
                Ok(message_id) => self.schedule_delete(channel_id, message_id, delete_after),
                Err(e) => error!(
                    target: AUDIT_TARGET,
                    kind = "ERROR",
                    event = "SEND_NOTICE",
                    channel = %channel_id,
                    error = %e,
                    "Could not post notice"
                ),
            },
        }
    }

    fn schedule_delete(&self, channel_id: ChannelId, message_id: MessageId, after: Duration) {
        let client = self.client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Err(e) = client.delete_message(channel_id, message_id).await {
                debug!("Could not retract notice {}: {}", message_id, e);
            }
        });
    }
}

fn report_failure(event: &str, member_id: UserId, e: &BotError) {
    error!(
        target: AUDIT_TARGET,
        kind = "ERROR",
        event = event,
        member = %member_id,
        error = %e,
        "Chat client call failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{Call, RecordingClient};
    use crate::managers::verification_manager::VerificationManager;
    use crate::state::create_shared_pending_store;
    use poise::serenity_prelude::GuildId;

    fn chat() -> ChatRef {
        ChatRef::new(GuildId::new(1), ChannelId::new(2))
    }

    fn member(id: u64, is_bot: bool) -> JoiningMember {
        JoiningMember {
            user_id: UserId::new(id),
            display_name: format!("m{}", id),
            is_bot,
        }
    }

    fn adapter(client: RecordingClient, notice: Duration) -> EventAdapter<RecordingClient> {
        let manager = Arc::new(VerificationManager::new(
            create_shared_pending_store(),
            Duration::from_secs(180),
            notice,
        )
        .unwrap());
        EventAdapter::new(manager, Arc::new(client), Duration::from_secs(180))
    }

    #[tokio::test]
    async fn test_join_mutes_and_records_challenge_id() {
        let a = adapter(RecordingClient::new(), Duration::from_secs(30));
        a.on_join(chat(), &[member(5, false), member(6, true)]).await;

        let calls = a.client.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Call::Restrict(GuildId::new(1), UserId::new(5), false));
        match &calls[1] {
            Call::Send(channel, message) => {
                assert_eq!(*channel, ChannelId::new(2));
                assert!(message.content.contains("<@5>"));
                assert!(message.content.contains("**3** minute"));
                let button = message.link_button.as_ref().unwrap();
                assert_eq!(button.url, "https://gate.test/verify/verify_5");
            }
            other => panic!("unexpected call {:?}", other),
        }

        let record = a.manager().store().get(UserId::new(5)).unwrap();
        assert_eq!(record.challenge_message_id, Some(MessageId::new(1000)));
        assert!(a.manager().store().get(UserId::new(6)).is_none());
    }

    #[tokio::test]
    async fn test_join_without_admin_does_nothing() {
        let mut client = RecordingClient::new();
        client.admin = false;
        let a = adapter(client, Duration::from_secs(30));

        a.on_join(chat(), &[member(5, false)]).await;

        assert!(a.client.calls().is_empty());
        assert_eq!(a.manager().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_mute_does_not_abort_batch() {
        let mut client = RecordingClient::new();
        client.fail_restrict = true;
        let a = adapter(client, Duration::from_secs(30));

        a.on_join(chat(), &[member(5, false), member(7, false)]).await;

        let sends = a
            .client
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Send(..)))
            .count();
        assert_eq!(sends, 2);
        assert_eq!(a.manager().pending_count(), 2);
    }

    #[tokio::test]
    async fn test_verify_unmutes_and_retracts_challenge() {
        let a = adapter(RecordingClient::new(), Duration::from_secs(30));
        a.on_join(chat(), &[member(5, false)]).await;

        let reply = a.on_verify_attempt(UserId::new(5), "verify_5").await;

        assert_eq!(reply, Reply::Success);
        assert_eq!(a.client.unmuted(), vec![UserId::new(5)]);
        assert!(a
            .client
            .calls()
            .contains(&Call::Delete(ChannelId::new(2), MessageId::new(1000))));
        assert!(a.client.removed().is_empty());
        assert_eq!(a.manager().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_requester_gets_no_effects() {
        let a = adapter(RecordingClient::new(), Duration::from_secs(30));
        a.on_join(chat(), &[member(5, false)]).await;
        let before = a.client.calls().len();

        let reply = a.on_verify_attempt(UserId::new(8), "verify_5").await;

        assert_eq!(reply, Reply::NotYours);
        assert_eq!(a.client.calls().len(), before);
        assert_eq!(a.manager().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_tick_kicks_and_retracts_notice() {
        let mut client = RecordingClient::new();
        client.fail_delete = true;
        let a = adapter(client, Duration::from_millis(10));
        a.on_join(chat(), &[member(5, false)]).await;

        let requested = a.on_tick(Utc::now() + chrono::Duration::seconds(181)).await;
        assert_eq!(requested, 3);
        assert_eq!(a.client.removed(), vec![UserId::new(5)]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let deletes = a
            .client
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Delete(..)))
            .count();
        // challenge + notice, both attempted even though deletion fails
        assert_eq!(deletes, 2);
        assert_eq!(a.on_tick(Utc::now() + chrono::Duration::seconds(400)).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_reports_abandoned_records() {
        let a = adapter(RecordingClient::new(), Duration::from_secs(30));
        a.on_join(chat(), &[member(5, false), member(9, false)]).await;
        let before = a.client.calls().len();

        assert_eq!(a.on_shutdown("SIGTERM"), 2);
        assert_eq!(a.manager().pending_count(), 0);
        assert_eq!(a.client.calls().len(), before);
        assert!(a.client.removed().is_empty());
    }

    #[tokio::test]
    async fn test_unsent_challenge_still_times_out() {
        let mut client = RecordingClient::new();
        client.fail_send = true;
        let a = adapter(client, Duration::from_secs(30));

        a.on_join(chat(), &[member(5, false)]).await;

        let record = a.manager().store().get(UserId::new(5)).unwrap();
        assert!(record.challenge_message_id.is_none());

        let effects = a
            .manager()
            .on_tick(Utc::now() + chrono::Duration::seconds(181));
        assert!(effects.contains(&Effect::RemoveMember {
            guild_id: GuildId::new(1),
            member_id: UserId::new(5),
        }));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::DeleteMessage { .. })));
        assert_eq!(a.manager().pending_count(), 0);
    }
}
