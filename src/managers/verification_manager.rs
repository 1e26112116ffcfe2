use chrono::{DateTime, Utc};
use poise::serenity_prelude::{ChannelId, GuildId, MessageId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{BotError, Result};
use crate::logging::AUDIT_TARGET;
use crate::messages;
use crate::state::{ChatRef, PendingVerification, SharedPendingStore, VerifyToken};

/// A member from a join event
#[derive(Debug, Clone)]
pub struct JoiningMember {
    pub user_id: UserId,
    pub display_name: String,
    pub is_bot: bool,
}

/// Side effect requested by the state machine, executed by the event adapter
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Mute (`can_send_messages: false`) or unmute a member
    Restrict {
        guild_id: GuildId,
        member_id: UserId,
        can_send_messages: bool,
    },
    /// Post the challenge with a deep link for `token`; the resulting message id
    /// is handed back through `attach_challenge`
    SendChallenge {
        chat: ChatRef,
        member_id: UserId,
        display_name: String,
        expires_at: DateTime<Utc>,
        token: VerifyToken,
    },
    DeleteMessage {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    /// Kick: ban followed immediately by unban
    RemoveMember { guild_id: GuildId, member_id: UserId },
    /// Post a notice that deletes itself after `delete_after`
    SendNotice {
        channel_id: ChannelId,
        content: String,
        delete_after: Duration,
    },
}

/// Answer to the member who made a verify attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// No record for the target member
    NotFound,
    /// Requester is not the member the token names
    NotYours,
    /// Record existed but its window had passed
    Expired,
    Success,
    /// The text carried no verification token
    Unrecognized,
}

impl Reply {
    /// Whether this outcome takes resolution rights over the record
    fn claims(self) -> bool {
        matches!(self, Reply::Expired | Reply::Success)
    }
}

/// Result of a verify attempt
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub reply: Reply,
    pub effects: Vec<Effect>,
}

impl VerifyOutcome {
    fn reply_only(reply: Reply) -> Self {
        Self {
            reply,
            effects: Vec::new(),
        }
    }
}

/// Pure transition for a verify attempt against a live record, first match wins
fn transition(record: &PendingVerification, requester: UserId, now: DateTime<Utc>) -> Reply {
    if requester != record.member_id {
        Reply::NotYours
    } else if record.is_expired(now) {
        Reply::Expired
    } else {
        Reply::Success
    }
}

/// Verification lifecycle: decides transitions and the effects they request.
/// Never performs I/O; effects are returned for the adapter to execute.
pub struct VerificationManager {
    store: SharedPendingStore,
    challenge_ttl: chrono::Duration,
    notice_display: Duration,
}

impl VerificationManager {
    pub fn new(
        store: SharedPendingStore,
        challenge_ttl: Duration,
        notice_display: Duration,
    ) -> Result<Self> {
        let challenge_ttl =
            chrono::Duration::from_std(challenge_ttl).map_err(|_| BotError::ConfigValidation {
                message: format!("challenge window {:?} is out of range", challenge_ttl),
            })?;

        Ok(Self {
            store,
            challenge_ttl,
            notice_display,
        })
    }

    pub fn from_settings(store: SharedPendingStore, settings: &Settings) -> Result<Self> {
        Self::new(store, settings.challenge_ttl(), settings.notice_display())
    }

    pub fn store(&self) -> &SharedPendingStore {
        &self.store
    }

    pub fn pending_count(&self) -> usize {
        self.store.len()
    }

    /// Handle members joining `chat`
    pub fn on_join(
        &self,
        chat: ChatRef,
        members: &[JoiningMember],
        bot_is_admin: bool,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        if !bot_is_admin {
            warn!(
                target: AUDIT_TARGET,
                kind = "CAPABILITY_MISSING",
                guild = %chat.guild_id,
                members = members.len(),
                "Bot lacks moderation rights, skipping join batch"
            );
            return Vec::new();
        }

        let mut effects = Vec::new();

        for member in members {
            info!(
                target: AUDIT_TARGET,
                kind = "NEW_MEMBER",
                member = %member.user_id,
                guild = %chat.guild_id,
                name = %member.display_name,
                is_bot = member.is_bot,
                "New member joined"
            );

            if member.is_bot {
                info!(
                    target: AUDIT_TARGET,
                    kind = "BOT_FILTERED",
                    member = %member.user_id,
                    guild = %chat.guild_id,
                    name = %member.display_name,
                    "Skipping bot account"
                );
                continue;
            }

            let Some(fresh_expiry) = now.checked_add_signed(self.challenge_ttl) else {
                error!(
                    target: AUDIT_TARGET,
                    kind = "ERROR",
                    event = "CHALLENGE_DEADLINE",
                    member = %member.user_id,
                    "Challenge deadline is not representable, member not gated"
                );
                continue;
            };
            let (record, previous) = self.store.replace_with(member.user_id, |previous| {
                // A rejoin always moves the deadline forward
                let expires_at = match previous {
                    Some(p) if p.expires_at >= fresh_expiry => p
                        .expires_at
                        .checked_add_signed(chrono::Duration::milliseconds(1))
                        .unwrap_or(p.expires_at),
                    _ => fresh_expiry,
                };
                PendingVerification::new(member.user_id, chat, member.display_name.clone(), expires_at)
            });

            if let Some(previous) = previous {
                info!(
                    "Member {} rejoined during an active challenge, restarting the clock",
                    member.user_id
                );
                if let Some(message_id) = previous.challenge_message_id {
                    effects.push(Effect::DeleteMessage {
                        channel_id: previous.chat.channel_id,
                        message_id,
                    });
                }
            }

            effects.push(Effect::Restrict {
                guild_id: chat.guild_id,
                member_id: member.user_id,
                can_send_messages: false,
            });
            effects.push(Effect::SendChallenge {
                chat,
                member_id: member.user_id,
                display_name: record.display_name.clone(),
                expires_at: record.expires_at,
                token: VerifyToken::new(member.user_id),
            });
        }

        effects
    }

    /// Store the id of a posted challenge on the record it was sent for
    pub fn attach_challenge(
        &self,
        member_id: UserId,
        expires_at: DateTime<Utc>,
        message_id: MessageId,
    ) -> bool {
        let attached = self.store.attach_message(member_id, expires_at, message_id);
        if attached {
            info!(
                target: AUDIT_TARGET,
                kind = "VERIFICATION_SENT",
                member = %member_id,
                message_id = %message_id,
                expires_at = %expires_at.to_rfc3339(),
                "Challenge sent"
            );
        } else {
            debug!(
                "Challenge {} for {} no longer matches a pending record",
                message_id, member_id
            );
        }
        attached
    }

    /// Handle a verify attempt whose token is embedded in `text`
    pub fn on_verify_attempt(
        &self,
        requester: UserId,
        text: &str,
        now: DateTime<Utc>,
    ) -> VerifyOutcome {
        match VerifyToken::find_in(text) {
            Some(token) => self.verify(requester, token, now),
            None => {
                info!(
                    target: AUDIT_TARGET,
                    kind = "UNKNOWN_START",
                    requester = %requester,
                    "Start without a verification token"
                );
                VerifyOutcome::reply_only(Reply::Unrecognized)
            }
        }
    }

    /// Run the verify transition table for `token`
    pub fn verify(&self, requester: UserId, token: VerifyToken, now: DateTime<Utc>) -> VerifyOutcome {
        let target = token.member_id;
        info!(
            target: AUDIT_TARGET,
            kind = "VERIFICATION_STARTED",
            member = %target,
            requester = %requester,
            "Verify attempt"
        );

        let mut reply = Reply::NotFound;
        let claimed = self.store.resolve_with(target, |record| {
            reply = transition(record, requester, now);
            reply.claims()
        });

        match (reply, claimed) {
            (Reply::Success, Some(record)) => {
                info!(
                    target: AUDIT_TARGET,
                    kind = "VERIFICATION_SUCCESS",
                    member = %target,
                    guild = %record.chat.guild_id,
                    "Member verified"
                );
                VerifyOutcome {
                    reply,
                    effects: self.success_effects(&record),
                }
            }
            (Reply::Expired, Some(_)) => {
                info!(
                    target: AUDIT_TARGET,
                    kind = "VERIFICATION_EXPIRED",
                    member = %target,
                    "Verify attempt after expiry"
                );
                VerifyOutcome::reply_only(reply)
            }
            (Reply::NotYours, _) => {
                warn!(
                    target: AUDIT_TARGET,
                    kind = "VERIFICATION_MISMATCH",
                    expected = %target,
                    actual = %requester,
                    "Verify attempt for another member"
                );
                VerifyOutcome::reply_only(reply)
            }
            _ => {
                info!(
                    target: AUDIT_TARGET,
                    kind = "VERIFICATION_INVALID",
                    member = %target,
                    "No pending verification"
                );
                VerifyOutcome::reply_only(Reply::NotFound)
            }
        }
    }

    /// Evict every record expired at `now` that this call manages to claim
    pub fn on_tick(&self, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();

        for candidate in self.store.snapshot() {
            if !candidate.is_expired(now) {
                continue;
            }

            match self.store.claim_expired(candidate.member_id, now) {
                Some(record) => {
                    info!(
                        target: AUDIT_TARGET,
                        kind = "VERIFICATION_CLEANUP",
                        member = %record.member_id,
                        guild = %record.chat.guild_id,
                        message_id = ?record.challenge_message_id.map(|m| m.get()),
                        name = %record.display_name,
                        "Verification timed out"
                    );
                    effects.extend(self.timeout_effects(&record));
                }
                None => {
                    debug!(
                        "Record for {} was resolved before the sweep could claim it",
                        candidate.member_id
                    );
                }
            }
        }

        effects
    }

    fn success_effects(&self, record: &PendingVerification) -> Vec<Effect> {
        let mut effects = vec![Effect::Restrict {
            guild_id: record.chat.guild_id,
            member_id: record.member_id,
            can_send_messages: true,
        }];
        if let Some(message_id) = record.challenge_message_id {
            effects.push(Effect::DeleteMessage {
                channel_id: record.chat.channel_id,
                message_id,
            });
        }
        effects.push(Effect::SendNotice {
            channel_id: record.chat.channel_id,
            content: messages::welcome_notice(record.member_id, &record.display_name),
            delete_after: self.notice_display,
        });
        effects
    }

    fn timeout_effects(&self, record: &PendingVerification) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(message_id) = record.challenge_message_id {
            effects.push(Effect::DeleteMessage {
                channel_id: record.chat.channel_id,
                message_id,
            });
        }
        effects.push(Effect::RemoveMember {
            guild_id: record.chat.guild_id,
            member_id: record.member_id,
        });
        effects.push(Effect::SendNotice {
            channel_id: record.chat.channel_id,
            content: messages::timeout_notice(record.member_id, &record.display_name),
            delete_after: self.notice_display,
        });
        effects
    }
}

/// Shared verification manager type
pub type SharedVerificationManager = Arc<VerificationManager>;

pub fn create_shared_verification_manager(
    store: SharedPendingStore,
    settings: &Settings,
) -> Result<SharedVerificationManager> {
    Ok(Arc::new(VerificationManager::from_settings(store, settings)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::create_shared_pending_store;
    use crate::state::pending::RecordState;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn chat() -> ChatRef {
        ChatRef::new(GuildId::new(100), ChannelId::new(200))
    }

    fn manager() -> VerificationManager {
        VerificationManager::new(
            create_shared_pending_store(),
            Duration::from_secs(180),
            Duration::from_secs(30),
        )
        .unwrap()
    }

    fn human(id: u64) -> JoiningMember {
        JoiningMember {
            user_id: UserId::new(id),
            display_name: format!("user{}", id),
            is_bot: false,
        }
    }

    fn bot(id: u64) -> JoiningMember {
        JoiningMember {
            user_id: UserId::new(id),
            display_name: format!("bot{}", id),
            is_bot: true,
        }
    }

    fn has_remove(effects: &[Effect]) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, Effect::RemoveMember { .. }))
    }

    fn has_unmute(effects: &[Effect]) -> bool {
        effects.iter().any(|e| {
            matches!(
                e,
                Effect::Restrict {
                    can_send_messages: true,
                    ..
                }
            )
        })
    }

    #[test]
    fn test_bots_never_recorded_or_muted() {
        let m = manager();
        let effects = m.on_join(chat(), &[bot(1), human(2), bot(3)], true, t0());

        assert_eq!(m.pending_count(), 1);
        assert!(m.store().get(UserId::new(1)).is_none());
        assert!(m.store().get(UserId::new(3)).is_none());
        for effect in &effects {
            if let Effect::Restrict { member_id, .. } = effect {
                assert_eq!(*member_id, UserId::new(2));
            }
        }
    }

    #[test]
    fn test_not_admin_skips_batch() {
        let m = manager();
        let effects = m.on_join(chat(), &[human(1), human(2)], false, t0());
        assert!(effects.is_empty());
        assert_eq!(m.pending_count(), 0);
    }

    #[test]
    fn test_join_mutes_then_challenges() {
        let m = manager();
        let effects = m.on_join(chat(), &[human(1)], true, t0());

        assert_eq!(
            effects[0],
            Effect::Restrict {
                guild_id: GuildId::new(100),
                member_id: UserId::new(1),
                can_send_messages: false,
            }
        );
        match &effects[1] {
            Effect::SendChallenge {
                member_id,
                expires_at,
                token,
                ..
            } => {
                assert_eq!(*member_id, UserId::new(1));
                assert_eq!(*expires_at, t0() + secs(180));
                assert_eq!(token.to_string(), "verify_1");
            }
            other => panic!("expected challenge, got {:?}", other),
        }
        let record = m.store().get(UserId::new(1)).unwrap();
        assert_eq!(record.expires_at, t0() + secs(180));
        assert_eq!(record.state, RecordState::Pending);
    }

    #[test]
    fn test_rejoin_restarts_clock_and_retracts_old_challenge() {
        let m = manager();
        m.on_join(chat(), &[human(1)], true, t0());
        m.attach_challenge(UserId::new(1), t0() + secs(180), MessageId::new(55));

        let effects = m.on_join(chat(), &[human(1)], true, t0() + secs(60));

        assert_eq!(m.pending_count(), 1);
        let record = m.store().get(UserId::new(1)).unwrap();
        assert!(record.expires_at > t0() + secs(180));
        assert!(record.challenge_message_id.is_none());
        assert!(effects.contains(&Effect::DeleteMessage {
            channel_id: ChannelId::new(200),
            message_id: MessageId::new(55),
        }));
    }

    #[test]
    fn test_rejoin_at_same_instant_still_moves_deadline() {
        let m = manager();
        m.on_join(chat(), &[human(1)], true, t0());
        m.on_join(chat(), &[human(1)], true, t0());

        let record = m.store().get(UserId::new(1)).unwrap();
        assert!(record.expires_at > t0() + secs(180));
        assert_eq!(m.pending_count(), 1);
    }

    #[test]
    fn test_stale_attach_is_ignored() {
        let m = manager();
        m.on_join(chat(), &[human(1)], true, t0());
        m.on_join(chat(), &[human(1)], true, t0() + secs(10));

        assert!(!m.attach_challenge(UserId::new(1), t0() + secs(180), MessageId::new(9)));
        assert!(m.attach_challenge(UserId::new(1), t0() + secs(190), MessageId::new(10)));
    }

    #[test]
    fn test_mismatched_requester_never_mutates() {
        let m = manager();
        m.on_join(chat(), &[human(1)], true, t0());
        let before = m.store().get(UserId::new(1)).unwrap();

        let outcome = m.on_verify_attempt(UserId::new(2), "verify_1", t0() + secs(10));

        assert_eq!(outcome.reply, Reply::NotYours);
        assert!(outcome.effects.is_empty());
        assert_eq!(m.store().get(UserId::new(1)), Some(before));
    }

    #[test]
    fn test_scenario_verify_in_time() {
        let m = manager();
        let join = m.on_join(chat(), &[human(1)], true, t0());
        assert!(join.iter().any(|e| matches!(
            e,
            Effect::Restrict {
                can_send_messages: false,
                ..
            }
        )));
        m.attach_challenge(UserId::new(1), t0() + secs(180), MessageId::new(77));

        let outcome = m.on_verify_attempt(UserId::new(1), "/start verify_1", t0() + secs(60));

        assert_eq!(outcome.reply, Reply::Success);
        assert!(m.store().is_empty());
        assert!(has_unmute(&outcome.effects));
        assert!(!has_remove(&outcome.effects));
        assert!(outcome.effects.contains(&Effect::DeleteMessage {
            channel_id: ChannelId::new(200),
            message_id: MessageId::new(77),
        }));
        assert!(outcome.effects.iter().any(|e| matches!(
            e,
            Effect::SendNotice { delete_after, .. } if *delete_after == Duration::from_secs(30)
        )));
    }

    #[test]
    fn test_scenario_sweep_kicks_unverified() {
        let m = manager();
        m.on_join(chat(), &[human(2)], true, t0());

        assert!(m.on_tick(t0() + secs(170)).is_empty());
        let effects = m.on_tick(t0() + secs(190));

        assert!(has_remove(&effects));
        assert!(!has_unmute(&effects));
        assert!(m.store().get(UserId::new(2)).is_none());
        assert!(m.on_tick(t0() + secs(200)).is_empty());
    }

    #[test]
    fn test_verify_after_expiry_deletes_without_unmute() {
        let m = manager();
        m.on_join(chat(), &[human(4)], true, t0());

        let outcome = m.on_verify_attempt(UserId::new(4), "verify_4", t0() + secs(181));

        assert_eq!(outcome.reply, Reply::Expired);
        assert!(outcome.effects.is_empty());
        assert!(m.store().is_empty());
        assert!(m.on_tick(t0() + secs(200)).is_empty());
    }

    #[test]
    fn test_unknown_member_token() {
        let m = manager();
        m.on_join(chat(), &[human(1)], true, t0());

        let outcome = m.on_verify_attempt(UserId::new(9), "verify_9", t0());

        assert_eq!(outcome.reply, Reply::NotFound);
        assert!(outcome.effects.is_empty());
        assert_eq!(m.pending_count(), 1);
    }

    #[test]
    fn test_start_without_token() {
        let m = manager();
        let outcome = m.on_verify_attempt(UserId::new(1), "/start", t0());
        assert_eq!(outcome.reply, Reply::Unrecognized);
        assert!(outcome.effects.is_empty());
    }

    #[test]
    fn test_scenario_race_resolves_once() {
        for round in 0..40 {
            let m = manager();
            m.on_join(chat(), &[human(3)], true, t0());

            let (outcome, tick_effects) = std::thread::scope(|s| {
                let verify = s.spawn(|| m.on_verify_attempt(UserId::new(3), "verify_3", t0() + secs(170)));
                let sweep = s.spawn(|| m.on_tick(t0() + secs(181)));
                (verify.join().unwrap(), sweep.join().unwrap())
            });

            let verified = has_unmute(&outcome.effects);
            let kicked = has_remove(&tick_effects);
            assert!(verified != kicked, "round {}: both or neither resolved", round);
            if kicked {
                assert_eq!(outcome.reply, Reply::NotFound);
                assert!(outcome.effects.is_empty());
            }
            assert!(m.store().is_empty());
        }
    }

    #[test]
    fn test_race_on_expired_record_resolves_once() {
        for _ in 0..40 {
            let m = manager();
            m.on_join(chat(), &[human(5)], true, t0());
            let late = t0() + secs(190);

            let (outcome, tick_effects) = std::thread::scope(|s| {
                let verify = s.spawn(|| m.on_verify_attempt(UserId::new(5), "verify_5", late));
                let sweep = s.spawn(|| m.on_tick(late));
                (verify.join().unwrap(), sweep.join().unwrap())
            });

            let verify_claimed = outcome.reply == Reply::Expired;
            let sweep_claimed = has_remove(&tick_effects);
            assert!(verify_claimed != sweep_claimed);
            assert!(!has_unmute(&outcome.effects));
        }
    }

    #[test]
    fn test_out_of_range_window_rejected() {
        let result = VerificationManager::new(
            create_shared_pending_store(),
            Duration::from_secs(u64::MAX),
            Duration::from_secs(30),
        );
        assert!(matches!(result, Err(BotError::ConfigValidation { .. })));
    }

    #[test]
    fn test_unrepresentable_deadline_skips_member() {
        let m = manager();
        let near_end = DateTime::<Utc>::MAX_UTC - secs(60);

        let effects = m.on_join(chat(), &[human(1)], true, near_end);

        assert!(effects.is_empty());
        assert_eq!(m.pending_count(), 0);
    }
}
