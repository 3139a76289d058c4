// ⚖️ Rating Engine - the vote state machine
//
// Per (entity, field, voter):  NoVote → Voted → {Changed, Deleted}
//
// Every accepted ballot mutates the ledger and the entity's aggregate inside
// one `RatingStore::atomically` unit, so a failed write leaves both untouched.

use crate::aggregate::{AggregateSnapshot, AggregateState};
use crate::config::EngineConfig;
use crate::entity::{EntityRef, RatedEntity};
use crate::error::{VoteError, ABORTED_MESSAGE, ABORTED_STATUS};
use crate::field::{FieldRegistry, RatingField};
use crate::hooks::{HookDecision, VoteEvent, VoteHook};
use crate::identity::{self, mint_cookie_token, RateLimit, ResolvedVoter, Voter, VoterIdentity};
use crate::ledger::{EntityStore, LedgerFilter, RatingStore, VoteKey, VoteLedger, VoteRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

// ============================================================================
// BALLOT
// ============================================================================

/// What a voter asks for: a score, or removal of their current vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ballot {
    Score(i64),
    Delete,
}

impl Ballot {
    /// Wire form: `0` means delete unless 0 is a real score on this field
    pub fn from_raw(score: i64, field: &RatingField) -> Self {
        if score == 0 && !field.check_range(0) {
            Ballot::Delete
        } else {
            Ballot::Score(score)
        }
    }

    /// Wire form with an explicit delete flag, which wins over the score
    pub fn from_request(score: Option<i64>, delete: bool, field: &RatingField) -> Option<Self> {
        match (delete, score) {
            (true, _) => Some(Ballot::Delete),
            (false, Some(score)) => Some(Ballot::from_raw(score, field)),
            (false, None) => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Ballot::Delete)
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Cookie the HTTP layer has to hand back to an anonymous voter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteCookie {
    pub name: String,
    pub value: String,
    pub max_age_secs: i64,
    /// Vote is gone, drop the cookie instead of setting it
    pub clear: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteResult {
    pub entity: EntityRef,
    pub field: String,
    pub ballot: Ballot,
    pub score: f64,
    pub score_avg: f64,
    pub score_sum: i64,
    pub distribution: Vec<u64>,
    pub created: bool,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<VoteCookie>,
}

impl VoteResult {
    pub fn status_code(&self) -> u8 {
        0
    }

    pub fn message(&self) -> &'static str {
        if self.created {
            "Vote recorded."
        } else if self.deleted {
            "Vote deleted."
        } else {
            "Vote modified."
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    Applied(VoteResult),
    /// A `will_rate` hook vetoed the vote; nothing was written
    Aborted { reason: String },
}

impl VoteOutcome {
    pub fn applied(&self) -> Option<&VoteResult> {
        match self {
            VoteOutcome::Applied(result) => Some(result),
            VoteOutcome::Aborted { .. } => None,
        }
    }

    pub fn status_code(&self) -> u8 {
        match self {
            VoteOutcome::Applied(result) => result.status_code(),
            VoteOutcome::Aborted { .. } => ABORTED_STATUS,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            VoteOutcome::Applied(result) => result.message(),
            VoteOutcome::Aborted { .. } => ABORTED_MESSAGE,
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct RatingEngine<S: RatingStore> {
    store: S,
    registry: FieldRegistry,
    config: EngineConfig,
    hooks: Vec<Box<dyn VoteHook>>,
}

impl<S: RatingStore> RatingEngine<S> {
    pub fn new(store: S, registry: FieldRegistry, config: EngineConfig) -> Self {
        RatingEngine {
            store,
            registry,
            config,
            hooks: Vec::new(),
        }
    }

    pub fn add_hook(&mut self, hook: impl VoteHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn with_hook(mut self, hook: impl VoteHook + 'static) -> Self {
        self.add_hook(hook);
        self
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn field(&self, entity_type: i64, name: &str) -> Result<&RatingField, VoteError> {
        self.registry
            .get(entity_type, name)
            .ok_or_else(|| VoteError::UnknownField {
                entity_type,
                field: name.to_string(),
            })
    }

    pub fn submit_vote(
        &mut self,
        entity: EntityRef,
        field: &str,
        ballot: Ballot,
        voter: &Voter,
    ) -> Result<VoteOutcome, VoteError> {
        self.submit_vote_at(entity, field, ballot, voter, Utc::now())
    }

    /// `submit_vote` with an explicit clock
    pub fn submit_vote_at(
        &mut self,
        entity: EntityRef,
        field_name: &str,
        ballot: Ballot,
        voter: &Voter,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome, VoteError> {
        let result = self.try_submit(entity, field_name, ballot, voter, now);

        match &result {
            Ok(VoteOutcome::Applied(applied)) => info!(
                %entity,
                field = field_name,
                created = applied.created,
                deleted = applied.deleted,
                score = applied.score,
                "vote applied"
            ),
            Ok(VoteOutcome::Aborted { reason }) => {
                info!(%entity, field = field_name, reason = %reason, "vote vetoed by hook")
            }
            Err(err) if err.is_fatal() => {
                warn!(%entity, field = field_name, error = %err, "vote failed")
            }
            Err(err) => debug!(%entity, field = field_name, error = %err, "vote rejected"),
        }

        result
    }

    fn try_submit(
        &mut self,
        entity: EntityRef,
        field_name: &str,
        ballot: Ballot,
        voter: &Voter,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome, VoteError> {
        let field = self.field(entity.entity_type, field_name)?.clone();

        match ballot {
            Ballot::Delete if !field.allows_delete() => {
                return Err(VoteError::CannotDeleteVote {
                    field: field.name().to_string(),
                    reason: "votes on this field cannot be deleted".to_string(),
                });
            }
            Ballot::Score(score) if !field.check_range(score) => {
                return Err(VoteError::InvalidRating {
                    field: field.name().to_string(),
                    score,
                });
            }
            _ => {}
        }

        let event = VoteEvent {
            entity,
            field: field.name(),
            ballot,
            voter,
        };
        for hook in &self.hooks {
            if let HookDecision::Veto { reason } = hook.will_rate(&event) {
                return Ok(VoteOutcome::Aborted { reason });
            }
        }

        let resolved = identity::resolve(&field, &entity, voter)?;

        let limit = self.config.rate_limit();
        let cookie_max_age = self.config.cookie_max_age_secs;
        let result = self.store.atomically(|store| {
            apply_ballot(store, &field, entity, ballot, &resolved, limit, cookie_max_age, now)
        })?;

        for hook in &self.hooks {
            hook.rated(&event, &result);
        }

        Ok(VoteOutcome::Applied(result))
    }

    /// Score the voter currently has in effect, if any
    pub fn rating_for_voter(
        &self,
        entity: EntityRef,
        field_name: &str,
        voter: &Voter,
    ) -> Result<Option<i64>, VoteError> {
        let field = self.field(entity.entity_type, field_name)?;

        let resolved = match identity::resolve(field, &entity, voter) {
            Ok(resolved) => resolved,
            Err(VoteError::AuthRequired { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        let key = VoteKey {
            entity,
            field_key: field.key().to_string(),
            identity: resolved.identity,
        };

        Ok(self.store.find(&key)?.map(|record| record.score))
    }

    pub fn aggregate(
        &self,
        entity: EntityRef,
        field_name: &str,
    ) -> Result<AggregateSnapshot, VoteError> {
        let field = self.field(entity.entity_type, field_name)?;
        let mut rated = self.store.load(entity)?;
        resync_aggregate(&self.store, &mut rated, field)?;

        let snapshot = match rated.rating(field.name()) {
            Some(state) => state.snapshot(field.range()),
            None => AggregateState::zeroed(field.range().len()).snapshot(field.range()),
        };

        Ok(snapshot)
    }

    /// Correct aggregates for records some maintenance job already removed
    pub fn apply_bulk_removal(&mut self, records: &[VoteRecord]) -> Result<usize, VoteError> {
        let registry = &self.registry;
        self.store
            .atomically(|store| correct_aggregates(store, registry, records))
    }

    /// Delete matching votes and correct every affected aggregate
    pub fn bulk_delete(&mut self, filter: &LedgerFilter) -> Result<Vec<VoteRecord>, VoteError> {
        let registry = &self.registry;
        let removed = self.store.atomically(|store| {
            let removed = store.bulk_delete(filter)?;
            correct_aggregates(store, registry, &removed)?;
            Ok::<_, VoteError>(removed)
        })?;

        info!(removed = removed.len(), "bulk vote deletion");
        Ok(removed)
    }

    /// A user's votes on one field over many objects, keyed by object id
    pub fn votes_for_user_in_bulk(
        &self,
        entity_type: i64,
        field_name: &str,
        object_ids: &[i64],
        user: &str,
    ) -> Result<HashMap<i64, VoteRecord>, VoteError> {
        if object_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let field = self.field(entity_type, field_name)?;
        let filter = LedgerFilter::new()
            .entity_type(entity_type)
            .object_ids(object_ids.to_vec())
            .field_key(field.key())
            .user(user);

        Ok(self
            .store
            .find_matching(&filter)?
            .into_iter()
            .map(|record| (record.key.entity.object_id, record))
            .collect())
    }
}

// ============================================================================
// TRANSITIONS
// ============================================================================

fn bucket(field: &RatingField, score: i64) -> Result<usize, VoteError> {
    field.index_of(score).ok_or_else(|| VoteError::InvalidRating {
        field: field.name().to_string(),
        score,
    })
}

#[allow(clippy::too_many_arguments)]
fn apply_ballot<S: RatingStore>(
    store: &mut S,
    field: &RatingField,
    entity: EntityRef,
    ballot: Ballot,
    resolved: &ResolvedVoter,
    limit: RateLimit,
    cookie_max_age: i64,
    now: DateTime<Utc>,
) -> Result<VoteResult, VoteError> {
    let mut key = VoteKey {
        entity,
        field_key: field.key().to_string(),
        identity: resolved.identity.clone(),
    };

    let existing = store.find(&key)?;
    let mut rated = store.load(entity)?;
    resync_aggregate(&*store, &mut rated, field)?;

    let (created, token) = match (existing, ballot) {
        (None, Ballot::Delete) => {
            return Err(VoteError::CannotDeleteVote {
                field: field.name().to_string(),
                reason: "no vote found".to_string(),
            });
        }
        (None, Ballot::Score(score)) => {
            let index = bucket(field, score)?;

            if resolved.identity.is_anonymous() {
                limit.enforce(&*store, resolved.ip, now)?;
            }

            let token = if resolved.cookie_mode() {
                let token = mint_cookie_token();
                key.identity = VoterIdentity::Anonymous {
                    ip: resolved.ip,
                    cookie: Some(token.clone()),
                };
                Some(token)
            } else {
                None
            };

            store.create(&VoteRecord::new(key, score, resolved.ip, now))?;
            rated.rating_mut(field).add_vote(index);
            (true, token)
        }
        (Some(previous), ballot) => {
            if !field.allows_change() {
                return Err(VoteError::CannotChangeVote {
                    field: field.name().to_string(),
                });
            }

            let new_index = match ballot {
                Ballot::Score(score) => Some(bucket(field, score)?),
                Ballot::Delete => None,
            };

            match ballot {
                Ballot::Score(score) => store.update(&key, score, now)?,
                Ballot::Delete => store.delete(&key)?,
            }

            let state = rated.rating_mut(field);
            match field.index_of(previous.score) {
                Some(old_index) => state.remove_vote(old_index),
                None => warn!(
                    field = field.name(),
                    score = previous.score,
                    "stored vote is outside the field range"
                ),
            }
            if let Some(index) = new_index {
                state.add_vote(index);
            }

            (false, previous.cookie().map(str::to_string))
        }
    };

    let state = rated.rating_mut(field);
    let score = field.compute(&state.distribution);
    state.set_score(score);
    let snapshot = state.snapshot(field.range());

    store.save(&rated)?;

    let deleted = ballot.is_delete();
    let cookie = match (&resolved.cookie_name, token) {
        (Some(name), Some(value)) => Some(VoteCookie {
            name: name.clone(),
            value,
            max_age_secs: cookie_max_age,
            clear: deleted,
        }),
        _ => None,
    };

    Ok(VoteResult {
        entity,
        field: field.name().to_string(),
        ballot,
        score: snapshot.score,
        score_avg: snapshot.score_avg,
        score_sum: snapshot.score_sum,
        distribution: snapshot.distribution,
        created,
        deleted,
        cookie,
    })
}

/// Live votes per range slot, straight from the ledger
fn ledger_distribution<L: VoteLedger + ?Sized>(
    ledger: &L,
    entity: EntityRef,
    field: &RatingField,
) -> Result<Vec<u64>, VoteError> {
    let filter = LedgerFilter::new().entity(entity).field_key(field.key());
    let mut distribution = vec![0; field.range().len()];

    for record in ledger.find_matching(&filter)? {
        match field.index_of(record.score) {
            Some(index) => distribution[index] += 1,
            None => warn!(
                %entity,
                field = field.name(),
                score = record.score,
                "live vote is outside the field range"
            ),
        }
    }

    Ok(distribution)
}

/// Recount a stored aggregate whose bucket count no longer matches the field's range.
/// Returns whether a rebuild happened.
fn resync_aggregate<L: VoteLedger + ?Sized>(
    ledger: &L,
    rated: &mut RatedEntity,
    field: &RatingField,
) -> Result<bool, VoteError> {
    let stale = rated
        .rating(field.name())
        .map_or(false, |state| state.distribution.len() != field.range().len());
    if !stale {
        return Ok(false);
    }

    let distribution = ledger_distribution(ledger, rated.entity, field)?;
    if let Some(state) = rated.ratings.get_mut(field.name()) {
        warn!(
            entity = %rated.entity,
            field = field.name(),
            stored = state.distribution.len(),
            expected = distribution.len(),
            "range changed, rebuilding distribution from the ledger"
        );
        state.distribution = distribution;
        let score = field.compute(&state.distribution);
        state.set_score(score);
    }

    Ok(true)
}

/// One decrement per removed record, one recompute + save per entity
fn correct_aggregates<S: RatingStore>(
    store: &mut S,
    registry: &FieldRegistry,
    records: &[VoteRecord],
) -> Result<usize, VoteError> {
    let mut groups: BTreeMap<EntityRef, Vec<&VoteRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key.entity).or_default().push(record);
    }

    for (entity, removed) in &groups {
        let mut rated = store.load(*entity)?;
        let mut touched = BTreeSet::new();

        for field in registry.fields_for(entity.entity_type) {
            if !removed.iter().any(|r| r.key.field_key == field.key()) {
                continue;
            }
            touched.insert(field.name());

            // A rebuilt distribution already reflects the removal
            if resync_aggregate(&*store, &mut rated, field)? {
                continue;
            }

            for record in removed.iter().filter(|r| r.key.field_key == field.key()) {
                match field.index_of(record.score) {
                    Some(index) => rated.rating_mut(field).remove_vote(index),
                    None => warn!(
                        %entity,
                        field = field.name(),
                        score = record.score,
                        "removed vote is outside the field range"
                    ),
                }
            }
        }

        for field in registry.fields_for(entity.entity_type) {
            if touched.contains(field.name()) {
                let state = rated.rating_mut(field);
                let score = field.compute(&state.distribution);
                state.set_score(score);
            }
        }

        store.save(&rated)?;
        debug!(%entity, removed = removed.len(), "aggregates corrected");
    }

    Ok(groups.len())
}

// ============================================================================
// TESTS
// ============================================================================
