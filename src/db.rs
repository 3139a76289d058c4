// 🗄️ SQLite persistence - vote ledger + per-entity aggregates
//
// `votes` holds one row per live vote, unique on (entity, field, voter key).
// `rating_aggregates` holds the denormalized summary per entity + dimension.
// Both live in the same database so one transaction covers a whole vote.

use crate::aggregate::AggregateState;
use crate::entity::{EntityRef, RatedEntity};
use crate::identity::VoterIdentity;
use crate::ledger::{EntityStore, LedgerFilter, RatingStore, VoteKey, VoteLedger, VoteRecord};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Votes (the ledger)
    // voter_key: "user:<id>" or "anon:<ip>[#<cookie>]"
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS votes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type INTEGER NOT NULL,
            object_id INTEGER NOT NULL,
            field_key TEXT NOT NULL,
            voter_key TEXT NOT NULL,
            user_id TEXT,
            ip_address TEXT NOT NULL,
            cookie TEXT,
            score INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (entity_type, object_id, field_key, voter_key)
        )",
        [],
    )?;

    // ==========================================================================
    // Aggregates (one row per entity + rating dimension)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS rating_aggregates (
            entity_type INTEGER NOT NULL,
            object_id INTEGER NOT NULL,
            field_name TEXT NOT NULL,
            score REAL NOT NULL DEFAULT 0,
            score_day REAL NOT NULL DEFAULT 0,
            score_week REAL NOT NULL DEFAULT 0,
            score_month REAL NOT NULL DEFAULT 0,
            distribution TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (entity_type, object_id, field_name)
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_votes_ip ON votes(ip_address, updated_at)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_votes_user ON votes(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aggregates_score ON rating_aggregates(field_name, score)",
        [],
    )?;

    Ok(())
}

/// Fixed-width UTC timestamps so text comparison orders correctly
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const VOTE_COLUMNS: &str = "entity_type, object_id, field_key, user_id, ip_address, cookie,
                            score, created_at, updated_at";

fn vote_from_row(row: &Row<'_>) -> rusqlite::Result<VoteRecord> {
    let user_id: Option<String> = row.get(3)?;
    let ip_str: String = row.get(4)?;
    let cookie: Option<String> = row.get(5)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    let ip: IpAddr = ip_str
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    let identity = match user_id {
        Some(id) => VoterIdentity::User { id },
        None => VoterIdentity::Anonymous { ip, cookie },
    };

    Ok(VoteRecord {
        key: VoteKey {
            entity: EntityRef::new(row.get(0)?, row.get(1)?),
            field_key: row.get(2)?,
            identity,
        },
        score: row.get(6)?,
        ip,
        created_at: parse_timestamp(7, &created_str)?,
        updated_at: parse_timestamp(8, &updated_str)?,
    })
}

/// WHERE clause + positional values for a ledger filter
fn filter_clause(filter: &LedgerFilter) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(entity_type) = filter.entity_type {
        clauses.push("entity_type = ?".to_string());
        values.push(Value::Integer(entity_type));
    }
    if let Some(ids) = &filter.object_ids {
        if ids.is_empty() {
            clauses.push("1 = 0".to_string());
        } else {
            let marks = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("object_id IN ({})", marks));
            values.extend(ids.iter().map(|id| Value::Integer(*id)));
        }
    }
    if let Some(key) = &filter.field_key {
        clauses.push("field_key = ?".to_string());
        values.push(Value::Text(key.clone()));
    }
    if let Some(user) = &filter.user {
        clauses.push("user_id = ?".to_string());
        values.push(Value::Text(user.clone()));
    }
    if let Some(ip) = filter.ip {
        clauses.push("ip_address = ?".to_string());
        values.push(Value::Text(ip.to_string()));
    }
    if let Some(before) = filter.changed_before {
        clauses.push("updated_at < ?".to_string());
        values.push(Value::Text(timestamp(before)));
    }

    if clauses.is_empty() {
        ("1 = 1".to_string(), values)
    } else {
        (clauses.join(" AND "), values)
    }
}

// ============================================================================
// STORE
// ============================================================================

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database: {:?}", path.as_ref()))?;
        SqliteStore::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        SqliteStore::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn).context("Failed to set up rating tables")?;
        Ok(SqliteStore { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn vote_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM votes", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl VoteLedger for SqliteStore {
    fn find(&self, key: &VoteKey) -> Result<Option<VoteRecord>> {
        let sql = format!(
            "SELECT {} FROM votes
             WHERE entity_type = ?1 AND object_id = ?2 AND field_key = ?3 AND voter_key = ?4",
            VOTE_COLUMNS
        );

        let record = self
            .conn
            .query_row(
                &sql,
                params![
                    key.entity.entity_type,
                    key.entity.object_id,
                    key.field_key,
                    key.identity.to_string(),
                ],
                vote_from_row,
            )
            .optional()
            .context("Failed to look up vote")?;

        Ok(record)
    }

    fn create(&mut self, record: &VoteRecord) -> Result<()> {
        let key = &record.key;

        let result = self.conn.execute(
            "INSERT INTO votes (
                entity_type, object_id, field_key, voter_key, user_id, ip_address, cookie,
                score, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                key.entity.entity_type,
                key.entity.object_id,
                key.field_key,
                key.identity.to_string(),
                record.user(),
                record.ip.to_string(),
                record.cookie(),
                record.score,
                timestamp(record.created_at),
                timestamp(record.updated_at),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                bail!("vote already recorded for {} on {}", key.identity, key.entity)
            }
            Err(e) => Err(anyhow::Error::new(e).context("Failed to insert vote")),
        }
    }

    fn update(&mut self, key: &VoteKey, score: i64, at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE votes SET score = ?1, updated_at = ?2
             WHERE entity_type = ?3 AND object_id = ?4 AND field_key = ?5 AND voter_key = ?6",
            params![
                score,
                timestamp(at),
                key.entity.entity_type,
                key.entity.object_id,
                key.field_key,
                key.identity.to_string(),
            ],
        )?;

        if changed == 0 {
            bail!("no vote by {} on {}", key.identity, key.entity);
        }
        Ok(())
    }

    fn delete(&mut self, key: &VoteKey) -> Result<()> {
        let removed = self.conn.execute(
            "DELETE FROM votes
             WHERE entity_type = ?1 AND object_id = ?2 AND field_key = ?3 AND voter_key = ?4",
            params![
                key.entity.entity_type,
                key.entity.object_id,
                key.field_key,
                key.identity.to_string(),
            ],
        )?;

        if removed == 0 {
            bail!("no vote by {} on {}", key.identity, key.entity);
        }
        Ok(())
    }

    fn count_by_ip(&self, ip: IpAddr, since: DateTime<Utc>) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM votes WHERE ip_address = ?1 AND updated_at >= ?2",
            params![ip.to_string(), timestamp(since)],
            |row| row.get(0),
        )?;

        Ok(count as u64)
    }

    fn find_matching(&self, filter: &LedgerFilter) -> Result<Vec<VoteRecord>> {
        let (clause, values) = filter_clause(filter);
        let sql = format!(
            "SELECT {} FROM votes WHERE {} ORDER BY created_at, id",
            VOTE_COLUMNS, clause
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values.iter()), vote_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn bulk_delete(&mut self, filter: &LedgerFilter) -> Result<Vec<VoteRecord>> {
        let removed = self.find_matching(filter)?;

        let (clause, values) = filter_clause(filter);
        let deleted = self.conn.execute(
            &format!("DELETE FROM votes WHERE {}", clause),
            params_from_iter(values.iter()),
        )?;

        if deleted != removed.len() {
            warn!(
                selected = removed.len(),
                deleted, "ledger changed during bulk delete"
            );
        }
        debug!(deleted, "bulk deleted votes");

        Ok(removed)
    }
}

impl EntityStore for SqliteStore {
    fn load(&self, entity: EntityRef) -> Result<RatedEntity> {
        let mut stmt = self.conn.prepare(
            "SELECT field_name, score, score_day, score_week, score_month, distribution
             FROM rating_aggregates
             WHERE entity_type = ?1 AND object_id = ?2",
        )?;

        let ratings = stmt
            .query_map(params![entity.entity_type, entity.object_id], |row| {
                let distribution_json: String = row.get(5)?;
                let distribution: Vec<u64> = serde_json::from_str(&distribution_json)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                    })?;

                Ok((
                    row.get::<_, String>(0)?,
                    AggregateState {
                        distribution,
                        score: row.get(1)?,
                        score_day: row.get(2)?,
                        score_week: row.get(3)?,
                        score_month: row.get(4)?,
                    },
                ))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()
            .with_context(|| format!("Failed to load aggregates for {}", entity))?;

        Ok(RatedEntity { entity, ratings })
    }

    fn save(&mut self, entity: &RatedEntity) -> Result<()> {
        let now = timestamp(Utc::now());

        for (field_name, state) in &entity.ratings {
            let distribution_json = serde_json::to_string(&state.distribution)?;

            self.conn.execute(
                "INSERT INTO rating_aggregates (
                    entity_type, object_id, field_name,
                    score, score_day, score_week, score_month, distribution, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT (entity_type, object_id, field_name) DO UPDATE SET
                    score = excluded.score,
                    score_day = excluded.score_day,
                    score_week = excluded.score_week,
                    score_month = excluded.score_month,
                    distribution = excluded.distribution,
                    updated_at = excluded.updated_at",
                params![
                    entity.entity.entity_type,
                    entity.entity.object_id,
                    field_name,
                    state.score,
                    state.score_day,
                    state.score_week,
                    state.score_month,
                    distribution_json,
                    now,
                ],
            )?;
        }

        Ok(())
    }
}

impl RatingStore for SqliteStore {
    fn atomically<T, E, F>(&mut self, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<T, E>,
        E: From<anyhow::Error>,
    {
        // IMMEDIATE takes the write lock up front: read-decide-write is serialized
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin vote transaction")?;

        let result = work(self);

        match &result {
            Ok(_) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(E::from(
                        anyhow::Error::new(e).context("Failed to commit vote transaction"),
                    ));
                }
            }
            Err(_) => {
                if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                    warn!(error = %e, "rollback failed");
                }
            }
        }

        result
    }
}

// ============================================================================
// TESTS
// ============================================================================
