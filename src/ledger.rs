// 📒 Vote Ledger - one live vote per (entity, field, voter)
//
// The ledger and the entity store are external collaborators: the engine
// only talks to them through the traits below. `MemoryStore` is the
// in-process implementation; `db::SqliteStore` is the durable one.

use crate::entity::{EntityRef, RatedEntity};
use crate::identity::VoterIdentity;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

// ============================================================================
// RECORDS
// ============================================================================

/// Unique key of a live vote
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoteKey {
    pub entity: EntityRef,
    pub field_key: String,
    pub identity: VoterIdentity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub key: VoteKey,
    pub score: i64,
    /// Address the vote came from, kept for users too
    pub ip: IpAddr,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VoteRecord {
    pub fn new(key: VoteKey, score: i64, ip: IpAddr, at: DateTime<Utc>) -> Self {
        VoteRecord {
            key,
            score,
            ip,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn user(&self) -> Option<&str> {
        match &self.key.identity {
            VoterIdentity::User { id } => Some(id),
            VoterIdentity::Anonymous { .. } => None,
        }
    }

    pub fn cookie(&self) -> Option<&str> {
        match &self.key.identity {
            VoterIdentity::Anonymous { cookie, .. } => cookie.as_deref(),
            VoterIdentity::User { .. } => None,
        }
    }

    /// "alice (10.0.0.1)" or just the address for anonymous votes
    pub fn voter_display(&self) -> String {
        match self.user() {
            Some(user) => format!("{} ({})", user, self.ip),
            None => self.ip.to_string(),
        }
    }
}

// ============================================================================
// FILTERS (bulk maintenance + lookups)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerFilter {
    pub entity_type: Option<i64>,
    pub object_ids: Option<Vec<i64>>,
    pub field_key: Option<String>,
    pub user: Option<String>,
    pub ip: Option<IpAddr>,
    /// Only votes last changed strictly before this instant
    pub changed_before: Option<DateTime<Utc>>,
}

impl LedgerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, entity: EntityRef) -> Self {
        self.entity_type = Some(entity.entity_type);
        self.object_ids = Some(vec![entity.object_id]);
        self
    }

    pub fn entity_type(mut self, entity_type: i64) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn object_ids(mut self, ids: Vec<i64>) -> Self {
        self.object_ids = Some(ids);
        self
    }

    pub fn field_key(mut self, key: impl Into<String>) -> Self {
        self.field_key = Some(key.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn changed_before(mut self, at: DateTime<Utc>) -> Self {
        self.changed_before = Some(at);
        self
    }

    pub fn matches(&self, record: &VoteRecord) -> bool {
        let entity = &record.key.entity;

        self.entity_type.map_or(true, |t| t == entity.entity_type)
            && self
                .object_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&entity.object_id))
            && self
                .field_key
                .as_ref()
                .map_or(true, |k| *k == record.key.field_key)
            && self
                .user
                .as_ref()
                .map_or(true, |u| record.user() == Some(u.as_str()))
            && self.ip.map_or(true, |ip| ip == record.ip)
            && self.changed_before.map_or(true, |t| record.updated_at < t)
    }
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

pub trait VoteLedger {
    fn find(&self, key: &VoteKey) -> Result<Option<VoteRecord>>;

    /// Insert a new live vote; fails if the key is already taken
    fn create(&mut self, record: &VoteRecord) -> Result<()>;

    fn update(&mut self, key: &VoteKey, score: i64, at: DateTime<Utc>) -> Result<()>;

    fn delete(&mut self, key: &VoteKey) -> Result<()>;

    /// Live votes from `ip` changed at or after `since`, across all entities
    fn count_by_ip(&self, ip: IpAddr, since: DateTime<Utc>) -> Result<u64>;

    fn find_matching(&self, filter: &LedgerFilter) -> Result<Vec<VoteRecord>>;

    /// Remove and return every matching record
    fn bulk_delete(&mut self, filter: &LedgerFilter) -> Result<Vec<VoteRecord>>;
}

pub trait EntityStore {
    /// Entity with its aggregates; an unknown entity comes back empty
    fn load(&self, entity: EntityRef) -> Result<RatedEntity>;

    fn save(&mut self, entity: &RatedEntity) -> Result<()>;
}

/// Ledger + entity store sharing one transactional boundary
pub trait RatingStore: VoteLedger + EntityStore {
    /// Run `work` as one unit: everything it wrote commits, or none of it does
    fn atomically<T, E, F>(&mut self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<T, E>,
        E: From<anyhow::Error>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Prior value of one touched entry, replayed backwards on rollback
#[derive(Debug, Clone)]
enum Undo {
    Vote(VoteKey, Option<VoteRecord>),
    Entity(EntityRef, Option<RatedEntity>),
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    votes: HashMap<VoteKey, VoteRecord>,
    entities: HashMap<EntityRef, RatedEntity>,
    /// Open while `atomically` runs
    journal: Option<Vec<Undo>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vote_count(&self) -> usize {
        self.votes.len()
    }

    fn remember_vote(&mut self, key: &VoteKey) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(Undo::Vote(key.clone(), self.votes.get(key).cloned()));
        }
    }

    fn remember_entity(&mut self, entity: EntityRef) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(Undo::Entity(entity, self.entities.get(&entity).cloned()));
        }
    }

    fn roll_back(&mut self, journal: Vec<Undo>) {
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Vote(key, Some(record)) => {
                    self.votes.insert(key, record);
                }
                Undo::Vote(key, None) => {
                    self.votes.remove(&key);
                }
                Undo::Entity(entity, Some(rated)) => {
                    self.entities.insert(entity, rated);
                }
                Undo::Entity(entity, None) => {
                    self.entities.remove(&entity);
                }
            }
        }
    }
}

impl VoteLedger for MemoryStore {
    fn find(&self, key: &VoteKey) -> Result<Option<VoteRecord>> {
        Ok(self.votes.get(key).cloned())
    }

    fn create(&mut self, record: &VoteRecord) -> Result<()> {
        if self.votes.contains_key(&record.key) {
            bail!(
                "vote already recorded for {} on {}",
                record.key.identity,
                record.key.entity
            );
        }
        self.remember_vote(&record.key);
        self.votes.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn update(&mut self, key: &VoteKey, score: i64, at: DateTime<Utc>) -> Result<()> {
        self.remember_vote(key);
        match self.votes.get_mut(key) {
            Some(record) => {
                record.score = score;
                record.updated_at = at;
                Ok(())
            }
            None => bail!("no vote by {} on {}", key.identity, key.entity),
        }
    }

    fn delete(&mut self, key: &VoteKey) -> Result<()> {
        self.remember_vote(key);
        match self.votes.remove(key) {
            Some(_) => Ok(()),
            None => bail!("no vote by {} on {}", key.identity, key.entity),
        }
    }

    fn count_by_ip(&self, ip: IpAddr, since: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .votes
            .values()
            .filter(|v| v.ip == ip && v.updated_at >= since)
            .count() as u64)
    }

    fn find_matching(&self, filter: &LedgerFilter) -> Result<Vec<VoteRecord>> {
        let mut found: Vec<VoteRecord> = self
            .votes
            .values()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }

    fn bulk_delete(&mut self, filter: &LedgerFilter) -> Result<Vec<VoteRecord>> {
        let removed = self.find_matching(filter)?;
        for record in &removed {
            self.remember_vote(&record.key);
            self.votes.remove(&record.key);
        }
        Ok(removed)
    }
}

impl EntityStore for MemoryStore {
    fn load(&self, entity: EntityRef) -> Result<RatedEntity> {
        Ok(self
            .entities
            .get(&entity)
            .cloned()
            .unwrap_or_else(|| RatedEntity::new(entity)))
    }

    fn save(&mut self, entity: &RatedEntity) -> Result<()> {
        self.remember_entity(entity.entity);
        self.entities.insert(entity.entity, entity.clone());
        Ok(())
    }
}

impl RatingStore for MemoryStore {
    fn atomically<T, E, F>(&mut self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<T, E>,
        E: From<anyhow::Error>,
    {
        // Nested units join the outer journal
        if self.journal.is_some() {
            return work(self);
        }

        self.journal = Some(Vec::new());
        let result = work(self);
        let journal = self.journal.take().unwrap_or_default();

        if result.is_err() {
            self.roll_back(journal);
        }
        result
    }
}

// ============================================================================
// TESTS
// ============================================================================
