//! Command surface for the attribution store.
//!
//! Host tooling can embed execution through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`AttributionCommand`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteAttributionStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use attribution_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Agent, AgentId, EndBound, IntervalId,
    MembershipInterval, RecomputeOptions, SaleId, SaleInput, SaleLedgerEntry, Supervisor,
    SupervisorId, SupervisorSnapshot,
};
use attribution_store_sqlite::SqliteAttributionStore;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "attrib")]
#[command(about = "Supervisor attribution CLI")]
pub struct Cli {
    #[arg(long, default_value = "./attribution.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: AttributionCommand,
}

#[derive(Debug, Subcommand)]
pub enum AttributionCommand {
    Agent {
        #[command(subcommand)]
        command: Box<AgentCommand>,
    },
    Supervisor {
        #[command(subcommand)]
        command: Box<SupervisorCommand>,
    },
    Assignment {
        #[command(subcommand)]
        command: Box<AssignmentCommand>,
    },
    Resolve(ResolveArgs),
    Sale {
        #[command(subcommand)]
        command: Box<SaleCommand>,
    },
    Backfill {
        #[command(subcommand)]
        command: Box<BackfillCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    Add(AgentAddArgs),
    Deactivate(AgentRefArgs),
    Show(AgentRefArgs),
}

#[derive(Debug, Args)]
pub struct AgentAddArgs {
    #[arg(long)]
    display_name: String,
    /// Explicit id; generated when omitted.
    #[arg(long)]
    agent_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct AgentRefArgs {
    #[arg(long)]
    agent_id: String,
}

#[derive(Debug, Subcommand)]
pub enum SupervisorCommand {
    Add(SupervisorAddArgs),
    Show(SupervisorRefArgs),
}

#[derive(Debug, Args)]
pub struct SupervisorAddArgs {
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    team_number: u32,
    /// Explicit id; generated when omitted.
    #[arg(long)]
    supervisor_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct SupervisorRefArgs {
    #[arg(long)]
    supervisor_id: String,
}

#[derive(Debug, Subcommand)]
pub enum AssignmentCommand {
    Set(AssignmentSetArgs),
    History(AgentRefArgs),
    Correct(AssignmentCorrectArgs),
}

#[derive(Debug, Args)]
pub struct AssignmentSetArgs {
    #[arg(long)]
    agent_id: String,
    #[arg(long)]
    team_number: u32,
    #[arg(long)]
    supervisor_id: String,
    /// RFC3339 UTC; defaults to now.
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    note: Option<String>,
}

#[derive(Debug, Args)]
pub struct AssignmentCorrectArgs {
    #[arg(long)]
    agent_id: String,
    #[arg(long)]
    interval_id: String,
    #[arg(long)]
    new_start: Option<String>,
    #[arg(long, conflicts_with = "reopen")]
    new_end: Option<String>,
    /// Clear the end bound, making this the agent's OPEN interval.
    #[arg(long)]
    reopen: bool,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    #[arg(long)]
    agent_id: String,
    /// RFC3339 UTC instant to resolve at.
    #[arg(long)]
    at: String,
}

#[derive(Debug, Subcommand)]
pub enum SaleCommand {
    Ingest(SaleIngestArgs),
    Capture(SaleRefArgs),
    Show(SaleRefArgs),
    List(SaleListArgs),
}

#[derive(Debug, Args)]
pub struct SaleIngestArgs {
    #[arg(long)]
    agent_id: Option<String>,
    /// RFC3339 UTC; defaults to now.
    #[arg(long)]
    event_time: Option<String>,
    #[arg(long)]
    amount_cents: i64,
    #[arg(long)]
    description: String,
    /// Explicit id; generated when omitted.
    #[arg(long)]
    sale_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct SaleRefArgs {
    #[arg(long)]
    sale_id: String,
}

#[derive(Debug, Args)]
pub struct SaleListArgs {
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    unattributed: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum BackfillCommand {
    Run(BackfillRunArgs),
    Pending,
}

#[derive(Debug, Args)]
pub struct BackfillRunArgs {
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    /// Rewrite snapshots whose attribution changed; without this the run
    /// only fills missing snapshots.
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    dry_run: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &std::path::Path, command: AttributionCommand) -> Result<()> {
    let mut store = SqliteAttributionStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or resolution fails.
pub fn run_command(command: AttributionCommand, store: &mut SqliteAttributionStore) -> Result<()> {
    match command {
        AttributionCommand::Agent { command } => run_agent(*command, store),
        AttributionCommand::Supervisor { command } => run_supervisor(*command, store),
        AttributionCommand::Assignment { command } => run_assignment(*command, store),
        AttributionCommand::Resolve(args) => run_resolve(&args, store),
        AttributionCommand::Sale { command } => run_sale(*command, store),
        AttributionCommand::Backfill { command } => run_backfill(*command, store),
    }
}

fn run_agent(command: AgentCommand, store: &mut SqliteAttributionStore) -> Result<()> {
    match command {
        AgentCommand::Add(args) => {
            let agent = Agent {
                agent_id: match args.agent_id {
                    Some(raw) => parse_agent_id(&raw)?,
                    None => AgentId::generate(),
                },
                display_name: args.display_name,
                active: true,
                created_at: now_utc(),
            };
            store.upsert_agent(&agent)?;
            println!("{}", serde_json::to_string_pretty(&agent_payload(&agent)?)?);
            Ok(())
        }
        AgentCommand::Deactivate(args) => {
            let agent = store.deactivate_agent(parse_agent_id(&args.agent_id)?)?;
            println!("{}", serde_json::to_string_pretty(&agent_payload(&agent)?)?);
            Ok(())
        }
        AgentCommand::Show(args) => {
            let agent_id = parse_agent_id(&args.agent_id)?;
            let agent = store
                .get_agent(agent_id)?
                .ok_or_else(|| anyhow!("unknown agent {agent_id}"))?;
            let current = store.current_assignment(agent_id)?;

            let mut payload = agent_payload(&agent)?;
            payload.insert(
                "current_assignment".to_string(),
                match current {
                    Some(interval) => interval_payload(&interval)?,
                    None => serde_json::Value::Null,
                },
            );
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn run_supervisor(command: SupervisorCommand, store: &mut SqliteAttributionStore) -> Result<()> {
    match command {
        SupervisorCommand::Add(args) => {
            let supervisor = Supervisor {
                supervisor_id: match args.supervisor_id {
                    Some(raw) => parse_supervisor_id(&raw)?,
                    None => SupervisorId::generate(),
                },
                display_name: args.display_name,
                team_number: args.team_number,
                created_at: now_utc(),
            };
            store.upsert_supervisor(&supervisor)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&supervisor_payload(&supervisor)?)?
            );
            Ok(())
        }
        SupervisorCommand::Show(args) => {
            let supervisor_id = parse_supervisor_id(&args.supervisor_id)?;
            let supervisor = store
                .get_supervisor(supervisor_id)?
                .ok_or_else(|| anyhow!("unknown supervisor {supervisor_id}"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&supervisor_payload(&supervisor)?)?
            );
            Ok(())
        }
    }
}

fn run_assignment(command: AssignmentCommand, store: &mut SqliteAttributionStore) -> Result<()> {
    match command {
        AssignmentCommand::Set(args) => {
            let outcome = store.append_assignment(
                parse_agent_id(&args.agent_id)?,
                args.team_number,
                parse_supervisor_id(&args.supervisor_id)?,
                parse_optional_utc(args.start.as_deref())?,
                args.note,
            )?;

            let mut payload = serde_json::Map::new();
            payload.insert("opened".to_string(), interval_payload(&outcome.opened)?);
            payload.insert(
                "closed".to_string(),
                match outcome.closed {
                    Some(closed) => interval_payload(&closed)?,
                    None => serde_json::Value::Null,
                },
            );
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        AssignmentCommand::History(args) => {
            let timeline = store.list_timeline(parse_agent_id(&args.agent_id)?)?;
            let payload = timeline
                .iter()
                .map(interval_payload)
                .collect::<Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        AssignmentCommand::Correct(args) => {
            let new_start = args
                .new_start
                .as_deref()
                .map(parse_utc_arg)
                .transpose()?;
            let new_end = if args.reopen {
                Some(EndBound::Open)
            } else {
                args.new_end
                    .as_deref()
                    .map(|raw| parse_utc_arg(raw).map(EndBound::At))
                    .transpose()?
            };

            let receipt = store.correct_interval(
                parse_agent_id(&args.agent_id)?,
                parse_interval_id(&args.interval_id)?,
                new_start,
                new_end,
            )?;

            eprintln!(
                "{}",
                backfill_hint(receipt.affected_start, receipt.affected_end)?
            );

            let mut payload = serde_json::Map::new();
            payload.insert(
                "corrected".to_string(),
                interval_payload(&receipt.corrected)?,
            );
            payload.insert(
                "affected_start".to_string(),
                serde_json::Value::String(format_ts(receipt.affected_start)?),
            );
            payload.insert(
                "affected_end".to_string(),
                match receipt.affected_end {
                    Some(end) => serde_json::Value::String(format_ts(end)?),
                    None => serde_json::Value::Null,
                },
            );
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn run_resolve(args: &ResolveArgs, store: &SqliteAttributionStore) -> Result<()> {
    let resolution =
        store.resolve_supervisor(parse_agent_id(&args.agent_id)?, parse_utc_arg(&args.at)?)?;

    if let Some(warning) = &resolution.warning {
        eprintln!("warning: {warning}");
    }

    let payload = ResolutionPayload {
        agent_id: resolution.agent_id.to_string(),
        at: format_ts(resolution.queried_at)?,
        supervisor_id: resolution
            .supervisor
            .as_ref()
            .map(|s| s.supervisor_id.to_string()),
        supervisor_name: resolution
            .supervisor
            .as_ref()
            .map(|s| s.supervisor_name.clone()),
        team_number: resolution.supervisor.as_ref().map(|s| s.team_number),
        interval_id: resolution.interval_id.map(|id| id.to_string()),
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_sale(command: SaleCommand, store: &mut SqliteAttributionStore) -> Result<()> {
    match command {
        SaleCommand::Ingest(args) => {
            let input = SaleInput {
                sale_id: args.sale_id.as_deref().map(parse_sale_id).transpose()?,
                agent_id: args.agent_id.as_deref().map(parse_agent_id).transpose()?,
                event_time: parse_optional_utc(args.event_time.as_deref())?,
                amount_cents: args.amount_cents,
                description: args.description,
            };

            let entry = store.ingest_sale(&input)?;
            let snapshot = store.capture_snapshot(entry.sale_id)?;
            if snapshot.is_unattributed() {
                eprintln!(
                    "warning: sale {} stored with the unattributed sentinel snapshot",
                    entry.sale_id
                );
            }

            let stored = store
                .get_sale(entry.sale_id)?
                .ok_or_else(|| anyhow!("sale {} missing after ingestion", entry.sale_id))?;
            println!("{}", serde_json::to_string_pretty(&sale_payload(&stored)?)?);
            Ok(())
        }
        SaleCommand::Capture(args) => {
            let snapshot = store.capture_snapshot(parse_sale_id(&args.sale_id)?)?;
            if snapshot.is_unattributed() {
                eprintln!("warning: sale {} is unattributed", args.sale_id);
            }
            println!("{}", serde_json::to_string_pretty(&snapshot_payload(&snapshot)?)?);
            Ok(())
        }
        SaleCommand::Show(args) => {
            let sale_id = parse_sale_id(&args.sale_id)?;
            let sale = store
                .get_sale(sale_id)?
                .ok_or_else(|| anyhow!("unknown sale {sale_id}"))?;
            println!("{}", serde_json::to_string_pretty(&sale_payload(&sale)?)?);
            Ok(())
        }
        SaleCommand::List(args) => {
            let sales = store.list_sales(
                args.from.as_deref().map(parse_utc_arg).transpose()?,
                args.to.as_deref().map(parse_utc_arg).transpose()?,
                args.unattributed,
            )?;

            if args.json {
                let payload = sales
                    .iter()
                    .map(sale_payload)
                    .collect::<Result<Vec<_>>>()?;
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_sale_table(&sales)?;
            }
            Ok(())
        }
    }
}

fn run_backfill(command: BackfillCommand, store: &mut SqliteAttributionStore) -> Result<()> {
    match command {
        BackfillCommand::Run(args) => {
            let summary = store.recompute(
                parse_utc_arg(&args.from)?,
                parse_utc_arg(&args.to)?,
                RecomputeOptions {
                    overwrite: args.overwrite,
                    dry_run: args.dry_run,
                },
            )?;

            for warning in &summary.warnings {
                eprintln!("warning: {warning}");
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if !summary.errors.is_empty() {
                eprintln!(
                    "{} entr{} could not be recomputed; see errors in the summary",
                    summary.errors.len(),
                    if summary.errors.len() == 1 { "y" } else { "ies" }
                );
            }
            Ok(())
        }
        BackfillCommand::Pending => {
            let pending = store.pending_backfill()?;
            let payload = pending
                .iter()
                .map(|request| {
                    Ok(serde_json::json!({
                        "queue_id": request.queue_id.to_string(),
                        "agent_id": request.agent_id.to_string(),
                        "range_start": format_ts(request.range_start)?,
                        "range_end": match request.range_end {
                            Some(end) => serde_json::Value::String(format_ts(end)?),
                            None => serde_json::Value::Null,
                        },
                        "requested_at": format_ts(request.requested_at)?,
                    }))
                })
                .collect::<Result<Vec<_>>>()?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ResolutionPayload {
    agent_id: String,
    at: String,
    supervisor_id: Option<String>,
    supervisor_name: Option<String>,
    team_number: Option<u32>,
    interval_id: Option<String>,
}

fn agent_payload(agent: &Agent) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut payload = serde_json::Map::new();
    payload.insert("agent_id".to_string(), agent.agent_id.to_string().into());
    payload.insert("display_name".to_string(), agent.display_name.clone().into());
    payload.insert("active".to_string(), agent.active.into());
    payload.insert(
        "created_at".to_string(),
        format_ts(agent.created_at)?.into(),
    );
    Ok(payload)
}

fn supervisor_payload(supervisor: &Supervisor) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "supervisor_id": supervisor.supervisor_id.to_string(),
        "display_name": supervisor.display_name,
        "team_number": supervisor.team_number,
        "created_at": format_ts(supervisor.created_at)?,
    }))
}

fn interval_payload(interval: &MembershipInterval) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "interval_id": interval.interval_id.to_string(),
        "agent_id": interval.agent_id.to_string(),
        "team_number": interval.team_number,
        "supervisor_id": interval.supervisor_id.to_string(),
        "start_time": format_ts(interval.start_time)?,
        "end_time": match interval.end_time {
            Some(end) => serde_json::Value::String(format_ts(end)?),
            None => serde_json::Value::Null,
        },
        "note": interval.note,
        "recorded_at": format_ts(interval.recorded_at)?,
    }))
}

fn snapshot_payload(snapshot: &SupervisorSnapshot) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "supervisor_id": snapshot.supervisor_id.map(|id| id.to_string()),
        "supervisor_name": snapshot.supervisor_name,
        "team_number": snapshot.team_number,
        "captured_at": format_ts(snapshot.captured_at)?,
    }))
}

fn sale_payload(sale: &SaleLedgerEntry) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "sale_id": sale.sale_id.to_string(),
        "agent_id": sale.agent_id.map(|id| id.to_string()),
        "event_time": format_ts(sale.event_time)?,
        "amount_cents": sale.amount_cents,
        "description": sale.description,
        "recorded_at": format_ts(sale.recorded_at)?,
        "snapshot": match &sale.snapshot {
            Some(snapshot) => snapshot_payload(snapshot)?,
            None => serde_json::Value::Null,
        },
    }))
}

fn print_sale_table(sales: &[SaleLedgerEntry]) -> Result<()> {
    println!(
        "{:<28} {:<22} {:<12} {:<28} supervisor",
        "sale_id", "event_time", "amount", "agent_id"
    );
    println!("{}", "-".repeat(120));

    for sale in sales {
        let supervisor = match &sale.snapshot {
            None => "(uncaptured)".to_string(),
            Some(snapshot) if snapshot.is_unattributed() => "(unattributed)".to_string(),
            Some(snapshot) => format!(
                "team {} / {}",
                snapshot
                    .team_number
                    .map_or_else(|| "?".to_string(), |team| team.to_string()),
                snapshot.supervisor_name.as_deref().unwrap_or("?")
            ),
        };
        println!(
            "{:<28} {:<22} {:<12} {:<28} {}",
            sale.sale_id,
            format_ts(sale.event_time)?,
            sale.amount_cents,
            sale.agent_id
                .map_or_else(|| "(none)".to_string(), |id| id.to_string()),
            supervisor
        );
    }
    Ok(())
}

fn parse_agent_id(raw: &str) -> Result<AgentId> {
    AgentId::parse(raw).map_err(|err| anyhow!("invalid --agent-id: {err}"))
}

fn parse_supervisor_id(raw: &str) -> Result<SupervisorId> {
    SupervisorId::parse(raw).map_err(|err| anyhow!("invalid --supervisor-id: {err}"))
}

fn parse_interval_id(raw: &str) -> Result<IntervalId> {
    IntervalId::parse(raw).map_err(|err| anyhow!("invalid --interval-id: {err}"))
}

fn parse_sale_id(raw: &str) -> Result<SaleId> {
    SaleId::parse(raw).map_err(|err| anyhow!("invalid --sale-id: {err}"))
}

fn parse_utc_arg(raw: &str) -> Result<time::OffsetDateTime> {
    parse_rfc3339_utc(raw).map_err(|err| anyhow!("invalid timestamp: {err}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_utc_arg(value),
        None => Ok(now_utc()),
    }
}

fn format_ts(value: time::OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

/// Operator hint after a correction, with concrete bounds so the
/// suggested command runs as printed. An open-ended affected range
/// falls back to the current instant as its end.
fn backfill_hint(
    affected_start: time::OffsetDateTime,
    affected_end: Option<time::OffsetDateTime>,
) -> Result<String> {
    Ok(format!(
        "backfill queued; run `attrib backfill run --from {} --to {} --overwrite` to repair affected snapshots",
        format_ts(affected_start)?,
        format_ts(affected_end.unwrap_or_else(now_utc))?
    ))
}
