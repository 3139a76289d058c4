// 📥 CSV vote import
// Replays a CSV export of votes through the engine, so every row goes through
// the same rules (range, permissions, rate limit) as a live vote.
//
// Columns: entity_type,object_id,field,score,user,ip,cookie[,delete]
// `user` and `cookie` may be empty. `delete=true` removes the voter's vote;
// without that column a score of 0 deletes only on ranges that lack 0.

use crate::engine::{Ballot, RatingEngine, VoteOutcome};
use crate::entity::EntityRef;
use crate::identity::Voter;
use crate::ledger::RatingStore;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRow {
    pub entity_type: i64,
    pub object_id: i64,
    pub field: String,
    pub score: Option<i64>,
    pub user: Option<String>,
    pub ip: String,
    pub cookie: Option<String>,
    #[serde(default)]
    pub delete: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub applied: usize,
    pub rejected: usize,
    pub aborted: usize,
}

pub fn load_votes_csv(csv_path: &Path) -> Result<Vec<VoteRow>> {
    let rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;
    read_rows(rdr)
}

pub fn read_votes<R: Read>(reader: R) -> Result<Vec<VoteRow>> {
    read_rows(csv::Reader::from_reader(reader))
}

fn read_rows<R: Read>(mut rdr: csv::Reader<R>) -> Result<Vec<VoteRow>> {
    let mut rows = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: VoteRow =
            result.with_context(|| format!("Failed to deserialize vote row {}", line + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Submit every row; business rejections are counted, storage failures abort
pub fn replay<S: RatingStore>(
    engine: &mut RatingEngine<S>,
    rows: &[VoteRow],
) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    for row in rows {
        let ip: IpAddr = match row.ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(ip = %row.ip, "skipping row with invalid IP address");
                report.rejected += 1;
                continue;
            }
        };

        let entity = EntityRef::new(row.entity_type, row.object_id);
        let delete = row.delete.unwrap_or(false);
        let (ballot, cookie_name) = match engine.field(row.entity_type, &row.field) {
            Ok(field) => match Ballot::from_request(row.score, delete, field) {
                Some(ballot) => (ballot, field.cookie_name(&entity)),
                None => {
                    warn!(field = %row.field, "skipping row without score");
                    report.rejected += 1;
                    continue;
                }
            },
            Err(err) => {
                debug!(error = %err, "skipping row");
                report.rejected += 1;
                continue;
            }
        };

        let mut voter = match row.user.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => Voter::user(user, ip),
            None => Voter::anonymous(ip),
        };
        if let Some(cookie) = row.cookie.as_deref().filter(|c| !c.is_empty()) {
            voter = voter.with_cookie(cookie_name, cookie);
        }

        match engine.submit_vote(entity, &row.field, ballot, &voter) {
            Ok(VoteOutcome::Applied(_)) => report.applied += 1,
            Ok(VoteOutcome::Aborted { .. }) => report.aborted += 1,
            Err(err) if err.is_fatal() => {
                return Err(anyhow::Error::new(err).context("Import aborted"));
            }
            Err(_) => report.rejected += 1,
        }
    }

    Ok(report)
}
