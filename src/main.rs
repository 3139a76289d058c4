use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rating_engine::{
    load_votes_csv, replay, Ballot, EntityRef, LedgerFilter, RatingEngine, Settings, SqliteStore,
    Voter, VoteOutcome,
};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rating-engine")]
#[command(about = "Vote ledger and rating aggregation", version)]
struct Args {
    /// SQLite database file
    #[arg(long, default_value = "ratings.db")]
    db: PathBuf,

    /// Settings JSON (engine limits + rating fields)
    #[arg(long, default_value = "ratings.json")]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database tables
    Init,
    /// Replay a CSV of votes through the engine
    Import { csv: PathBuf },
    /// Cast, change or delete a single vote
    Vote {
        entity_type: i64,
        object_id: i64,
        field: String,
        /// Score 0 deletes only when 0 is not part of the field's range
        #[arg(required_unless_present = "delete", allow_hyphen_values = true)]
        score: Option<i64>,
        /// Remove the voter's current vote
        #[arg(long, conflicts_with = "score")]
        delete: bool,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value = "127.0.0.1")]
        ip: IpAddr,
    },
    /// Print the aggregate of one rating field
    Show {
        entity_type: i64,
        object_id: i64,
        field: String,
    },
    /// Delete every vote cast from an IP address
    PurgeIp { ip: IpAddr },
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .init();

    if let Command::Init = args.command {
        SqliteStore::open(&args.db)?;
        println!("✓ Database initialized with WAL mode: {:?}", args.db);
        return Ok(());
    }

    let mut engine = open_engine(&args)?;

    match args.command {
        Command::Init => {}
        Command::Import { csv } => {
            println!("📂 Loading CSV...");
            let rows = load_votes_csv(&csv)?;
            println!("✓ Loaded {} votes from CSV", rows.len());

            let report = replay(&mut engine, &rows)?;
            println!("✓ Applied:  {}", report.applied);
            println!("✓ Rejected: {}", report.rejected);
            println!("✓ Aborted:  {}", report.aborted);
        }
        Command::Vote {
            entity_type,
            object_id,
            field,
            score,
            delete,
            user,
            ip,
        } => {
            let entity = EntityRef::new(entity_type, object_id);
            let ballot = Ballot::from_request(score, delete, engine.field(entity_type, &field)?)
                .context("Either a score or --delete is required")?;
            let voter = match user {
                Some(user) => Voter::user(user, ip),
                None => Voter::anonymous(ip),
            };

            match engine.submit_vote(entity, &field, ballot, &voter) {
                Ok(VoteOutcome::Applied(result)) => {
                    println!("{}", result.message());
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                Ok(VoteOutcome::Aborted { reason }) => println!("Vote aborted: {}", reason),
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => println!("{} ({})", err.public_message(), err),
            }
        }
        Command::Show {
            entity_type,
            object_id,
            field,
        } => {
            let snapshot = engine.aggregate(EntityRef::new(entity_type, object_id), &field)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::PurgeIp { ip } => {
            let removed = engine.bulk_delete(&LedgerFilter::new().ip(ip))?;
            println!("✓ Removed {} votes from {}", removed.len(), ip);
        }
    }

    Ok(())
}

fn open_engine(args: &Args) -> Result<RatingEngine<SqliteStore>> {
    let settings = Settings::from_file(&args.config)?;
    let registry = settings
        .registry()
        .context("Invalid rating field configuration")?;
    let store = SqliteStore::open(&args.db)?;

    Ok(RatingEngine::new(store, registry, settings.engine))
}
