// Rating Engine - Core Library
// Vote ledger + aggregation engine, exposed for the CLI, the API server and tests

pub mod aggregate;
pub mod config;
pub mod db;
pub mod engine;
pub mod entity;
pub mod error;
pub mod field;
pub mod formula;
pub mod hooks;
pub mod identity;
pub mod import;
pub mod ledger;

// Re-export commonly used types
pub use aggregate::{AggregateSnapshot, AggregateState};
pub use config::{EngineConfig, FieldDefinition, Settings};
pub use db::{setup_database, SqliteStore};
pub use engine::{Ballot, RatingEngine, VoteCookie, VoteOutcome, VoteResult};
pub use entity::{EntityRef, RatedEntity};
pub use error::{ConfigError, VoteError};
pub use field::{FieldRegistry, RatingField};
pub use formula::{Formula, FormulaKind};
pub use hooks::{HookDecision, VoteEvent, VoteHook};
pub use identity::{RateLimit, Voter, VoterIdentity};
pub use import::{load_votes_csv, replay, ImportReport, VoteRow};
pub use ledger::{
    EntityStore, LedgerFilter, MemoryStore, RatingStore, VoteKey, VoteLedger, VoteRecord,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
