use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use poise::serenity_prelude::{MessageId, UserId};
use std::sync::Arc;

use super::pending::{PendingVerification, RecordState};

/// Concurrency-safe table of pending verifications, keyed by member.
///
/// Every compound operation (replace, claim, resolve) runs under the map's
/// per-key exclusion, so a record can be handed out by a claim at most once
/// no matter how the event path and the sweeper interleave.
#[derive(Debug, Default)]
pub struct PendingStore {
    records: DashMap<UserId, PendingVerification>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or atomically replace the record for its member.
    /// Joins go through `replace_with`, which also sees the displaced record.
    #[cfg(test)]
    pub fn put(&self, record: PendingVerification) -> Option<PendingVerification> {
        self.records.insert(record.member_id, record)
    }

    /// Build the new record from whatever is currently stored and swap it in as one step.
    /// Returns the stored record and the one it displaced.
    pub fn replace_with<F>(
        &self,
        member_id: UserId,
        build: F,
    ) -> (PendingVerification, Option<PendingVerification>)
    where
        F: FnOnce(Option<&PendingVerification>) -> PendingVerification,
    {
        match self.records.entry(member_id) {
            Entry::Occupied(mut entry) => {
                let record = build(Some(entry.get()));
                let previous = entry.insert(record.clone());
                (record, Some(previous))
            }
            Entry::Vacant(entry) => {
                let record = build(None);
                entry.insert(record.clone());
                (record, None)
            }
        }
    }

    pub fn get(&self, member_id: UserId) -> Option<PendingVerification> {
        self.records.get(&member_id).map(|r| r.value().clone())
    }

    pub fn delete(&self, member_id: UserId) -> Option<PendingVerification> {
        self.records.remove(&member_id).map(|(_, record)| record)
    }

    /// Snapshot of every record. Later mutation does not affect the returned list
    pub fn snapshot(&self) -> Vec<PendingVerification> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Visit a snapshot, so `visit` may itself mutate the store
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&PendingVerification),
    {
        for record in self.snapshot() {
            visit(&record);
        }
    }

    /// Atomic check-and-delete. Only one caller ever receives a given record
    pub fn claim_if<F>(&self, member_id: UserId, predicate: F) -> Option<PendingVerification>
    where
        F: FnOnce(&PendingVerification) -> bool,
    {
        self.records
            .remove_if(&member_id, |_, record| predicate(record))
            .map(|(_, mut record)| {
                record.state = RecordState::Resolved;
                record
            })
    }

    /// Claim the member's record if it is past its expiry at `now`
    pub fn claim_expired(
        &self,
        member_id: UserId,
        now: DateTime<Utc>,
    ) -> Option<PendingVerification> {
        self.claim_if(member_id, |record| record.is_expired(now))
    }

    /// Evaluate `decide` against the live record with the key held exclusively.
    /// The record reads as `Verifying` while `decide` runs; returning true claims it.
    pub fn resolve_with<F>(&self, member_id: UserId, decide: F) -> Option<PendingVerification>
    where
        F: FnOnce(&PendingVerification) -> bool,
    {
        match self.records.entry(member_id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().state = RecordState::Verifying;
                if decide(entry.get()) {
                    let mut record = entry.remove();
                    record.state = RecordState::Resolved;
                    Some(record)
                } else {
                    entry.get_mut().state = RecordState::Pending;
                    None
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Record the challenge message on the record created at `expires_at`.
    /// False when that record has since been resolved or replaced.
    pub fn attach_message(
        &self,
        member_id: UserId,
        expires_at: DateTime<Utc>,
        message_id: MessageId,
    ) -> bool {
        match self.records.get_mut(&member_id) {
            Some(mut record) if record.expires_at == expires_at => {
                record.challenge_message_id = Some(message_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Shared store type
pub type SharedPendingStore = Arc<PendingStore>;

pub fn create_shared_pending_store() -> SharedPendingStore {
    Arc::new(PendingStore::new())
}
