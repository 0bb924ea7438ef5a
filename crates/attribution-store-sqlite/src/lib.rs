#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use attribution_core::{
    append_assignment as timeline_append, correct_interval as timeline_correct, format_rfc3339,
    now_utc, parse_rfc3339_utc, resolve_at, Agent, AgentId, AppendOutcome, EndBound, IntervalId,
    MembershipInterval, RecomputeEntryError, RecomputeOptions, RecomputeSummary,
    ResolvedSupervisor, SaleId, SaleInput, SaleLedgerEntry, Supervisor, SupervisorId,
    SupervisorSnapshot,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use ulid::Ulid;

const ATTRIBUTION_MIGRATION_VERSION: i64 = 1;

// RFC3339 TEXT columns are for reading; range scans and ordering use the
// unix-nanosecond columns, which compare correctly regardless of
// fractional-second formatting.
const SCHEMA_ATTRIBUTION_V1: &str = r"
CREATE TABLE IF NOT EXISTS agents (
  agent_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS supervisors (
  supervisor_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  team_number INTEGER NOT NULL CHECK (team_number >= 0),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS membership_intervals (
  interval_id TEXT PRIMARY KEY,
  agent_id TEXT NOT NULL,
  team_number INTEGER NOT NULL CHECK (team_number >= 0),
  supervisor_id TEXT NOT NULL,
  start_time TEXT NOT NULL,
  end_time TEXT,
  note TEXT,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id),
  FOREIGN KEY (supervisor_id) REFERENCES supervisors(supervisor_id)
);

CREATE INDEX IF NOT EXISTS idx_membership_intervals_agent_start
  ON membership_intervals(agent_id, start_time);

CREATE TRIGGER IF NOT EXISTS trg_membership_intervals_no_delete
BEFORE DELETE ON membership_intervals
BEGIN
  SELECT RAISE(FAIL, 'membership history is append-only; use corrections');
END;

CREATE TABLE IF NOT EXISTS sale_ledger (
  sale_id TEXT PRIMARY KEY,
  agent_id TEXT,
  event_time TEXT NOT NULL,
  event_time_unix_ns INTEGER NOT NULL,
  amount_cents INTEGER NOT NULL,
  description TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  snapshot_supervisor_id TEXT,
  snapshot_supervisor_name TEXT,
  snapshot_team_number INTEGER,
  snapshot_captured_at TEXT,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE INDEX IF NOT EXISTS idx_sale_ledger_event_time
  ON sale_ledger(event_time_unix_ns, sale_id);

CREATE TRIGGER IF NOT EXISTS trg_sale_ledger_identity_frozen
BEFORE UPDATE OF sale_id, agent_id, event_time, event_time_unix_ns,
  amount_cents, description, recorded_at ON sale_ledger
BEGIN
  SELECT RAISE(FAIL, 'sale ledger identity fields are immutable');
END;

CREATE TABLE IF NOT EXISTS backfill_queue (
  queue_id TEXT PRIMARY KEY,
  agent_id TEXT NOT NULL,
  range_start TEXT NOT NULL,
  range_start_unix_ns INTEGER NOT NULL,
  range_end TEXT,
  range_end_unix_ns INTEGER,
  requested_at TEXT NOT NULL,
  completed_at TEXT,
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE TABLE IF NOT EXISTS backfill_runs (
  run_id TEXT PRIMARY KEY,
  range_start TEXT NOT NULL,
  range_end TEXT NOT NULL,
  overwrite INTEGER NOT NULL CHECK (overwrite IN (0, 1)),
  started_at TEXT NOT NULL,
  finished_at TEXT NOT NULL,
  summary_json TEXT NOT NULL
);
";

pub struct SqliteAttributionStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SupervisorResolution {
    pub agent_id: AgentId,
    pub queried_at: OffsetDateTime,
    pub supervisor: Option<ResolvedSupervisor>,
    pub interval_id: Option<IntervalId>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct BackfillRequest {
    pub queue_id: Ulid,
    pub agent_id: AgentId,
    pub range_start: OffsetDateTime,
    pub range_end: Option<OffsetDateTime>,
    pub requested_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CorrectionReceipt {
    pub corrected: MembershipInterval,
    pub affected_start: OffsetDateTime,
    pub affected_end: Option<OffsetDateTime>,
    pub backfill_queued: BackfillRequest,
}

impl SqliteAttributionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_ATTRIBUTION_V1)
            .context("failed to apply attribution schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![ATTRIBUTION_MIGRATION_VERSION, now],
            )
            .context("failed to register attribution schema migration")?;

        Ok(())
    }

    pub fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO agents(agent_id, display_name, active, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(agent_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   active = excluded.active",
                params![
                    agent.agent_id.to_string(),
                    agent.display_name,
                    bool_to_sql(agent.active),
                    format_rfc3339(agent.created_at).map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to upsert agent")?;
        Ok(())
    }

    pub fn deactivate_agent(&self, agent_id: AgentId) -> Result<Agent> {
        let changed = self
            .conn
            .execute(
                "UPDATE agents SET active = 0 WHERE agent_id = ?1",
                params![agent_id.to_string()],
            )
            .context("failed to deactivate agent")?;

        if changed == 0 {
            return Err(anyhow!("unknown agent {agent_id}"));
        }

        self.get_agent(agent_id)?
            .ok_or_else(|| anyhow!("agent {agent_id} missing after deactivation"))
    }

    pub fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, display_name, active, created_at
             FROM agents WHERE agent_id = ?1",
        )?;
        let row = stmt
            .query_row(params![agent_id.to_string()], parse_agent_row)
            .optional()?;
        Ok(row)
    }

    pub fn upsert_supervisor(&self, supervisor: &Supervisor) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO supervisors(supervisor_id, display_name, team_number, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(supervisor_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   team_number = excluded.team_number",
                params![
                    supervisor.supervisor_id.to_string(),
                    supervisor.display_name,
                    i64::from(supervisor.team_number),
                    format_rfc3339(supervisor.created_at)
                        .map_err(|err| anyhow!(err.to_string()))?,
                ],
            )
            .context("failed to upsert supervisor")?;
        Ok(())
    }

    pub fn get_supervisor(&self, supervisor_id: SupervisorId) -> Result<Option<Supervisor>> {
        let mut stmt = self.conn.prepare(
            "SELECT supervisor_id, display_name, team_number, created_at
             FROM supervisors WHERE supervisor_id = ?1",
        )?;
        let row = stmt
            .query_row(params![supervisor_id.to_string()], parse_supervisor_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_timeline(&self, agent_id: AgentId) -> Result<Vec<MembershipInterval>> {
        query_timeline(&self.conn, agent_id)
    }

    /// The agent's current assignment is its OPEN interval, never a
    /// separately stored field.
    pub fn current_assignment(&self, agent_id: AgentId) -> Result<Option<MembershipInterval>> {
        let timeline = query_timeline(&self.conn, agent_id)?;
        Ok(timeline.into_iter().find(MembershipInterval::is_open))
    }

    pub fn append_assignment(
        &mut self,
        agent_id: AgentId,
        team_number: u32,
        supervisor_id: SupervisorId,
        start_time: OffsetDateTime,
        note: Option<String>,
    ) -> Result<AppendOutcome> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start assignment transaction")?;

        let agent = query_agent(&tx, agent_id)?.ok_or_else(|| anyhow!("unknown agent {agent_id}"))?;
        if !agent.active {
            return Err(anyhow!(
                "agent {agent_id} is deactivated and cannot receive assignments"
            ));
        }
        if query_supervisor(&tx, supervisor_id)?.is_none() {
            return Err(anyhow!("unknown supervisor {supervisor_id}"));
        }

        let timeline = query_timeline(&tx, agent_id)?;
        let outcome = timeline_append(
            &timeline,
            agent_id,
            team_number,
            supervisor_id,
            start_time,
            note,
            now_utc(),
        )?;

        if let Some(closed) = &outcome.closed {
            let end = closed
                .end_time
                .ok_or_else(|| anyhow!("closed interval {} lost its end bound", closed.interval_id))?;
            tx.execute(
                "UPDATE membership_intervals SET end_time = ?1 WHERE interval_id = ?2",
                params![
                    format_rfc3339(end).map_err(|err| anyhow!(err.to_string()))?,
                    closed.interval_id.to_string(),
                ],
            )
            .context("failed to close the OPEN interval")?;
        }

        insert_interval(&tx, &outcome.opened)?;
        tx.commit().context("failed to commit assignment transaction")?;

        Ok(outcome)
    }

    /// Administrative correction of one interval's bounds. Atomic: on any
    /// invariant violation the transaction rolls back and the stored
    /// timeline is unchanged. Schedules the affected range for backfill.
    pub fn correct_interval(
        &mut self,
        agent_id: AgentId,
        interval_id: IntervalId,
        new_start: Option<OffsetDateTime>,
        new_end: Option<EndBound>,
    ) -> Result<CorrectionReceipt> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start correction transaction")?;

        let timeline = query_timeline(&tx, agent_id)?;
        let outcome = timeline_correct(&timeline, interval_id, new_start, new_end)?;

        tx.execute(
            "UPDATE membership_intervals SET start_time = ?1, end_time = ?2
             WHERE interval_id = ?3",
            params![
                format_rfc3339(outcome.corrected.start_time)
                    .map_err(|err| anyhow!(err.to_string()))?,
                outcome
                    .corrected
                    .end_time
                    .map(format_rfc3339)
                    .transpose()
                    .map_err(|err| anyhow!(err.to_string()))?,
                interval_id.to_string(),
            ],
        )
        .context("failed to apply interval correction")?;

        let request = BackfillRequest {
            queue_id: Ulid::new(),
            agent_id,
            range_start: outcome.affected_start,
            range_end: outcome.affected_end,
            requested_at: now_utc(),
            completed_at: None,
        };
        insert_backfill_request(&tx, &request)?;

        tx.commit().context("failed to commit correction transaction")?;

        Ok(CorrectionReceipt {
            corrected: outcome.corrected,
            affected_start: outcome.affected_start,
            affected_end: outcome.affected_end,
            backfill_queued: request,
        })
    }

    /// Resolves who supervised `agent_id` at `at`. The assignment is read
    /// from history; the supervisor's display name is a current-value
    /// lookup. `supervisor = None` means no assignment covered the instant.
    pub fn resolve_supervisor(
        &self,
        agent_id: AgentId,
        at: OffsetDateTime,
    ) -> Result<SupervisorResolution> {
        if query_agent(&self.conn, agent_id)?.is_none() {
            return Err(anyhow!("unknown agent {agent_id}"));
        }

        let timeline = query_timeline(&self.conn, agent_id)?;
        let resolution = resolve_at(&timeline, at);

        let warning = resolution.overlap_detected.then(|| {
            format!("overlapping intervals found for agent {agent_id} at {at}; resolved to the most recently recorded interval")
        });

        let Some(interval) = resolution.interval else {
            return Ok(SupervisorResolution {
                agent_id,
                queried_at: at,
                supervisor: None,
                interval_id: None,
                warning,
            });
        };

        let supervisor = query_supervisor(&self.conn, interval.supervisor_id)?.ok_or_else(|| {
            anyhow!(
                "interval {} references unknown supervisor {}",
                interval.interval_id,
                interval.supervisor_id
            )
        })?;

        Ok(SupervisorResolution {
            agent_id,
            queried_at: at,
            supervisor: Some(ResolvedSupervisor {
                supervisor_id: interval.supervisor_id,
                supervisor_name: supervisor.display_name,
                team_number: interval.team_number,
            }),
            interval_id: Some(interval.interval_id),
            warning,
        })
    }

    pub fn ingest_sale(&mut self, input: &SaleInput) -> Result<SaleLedgerEntry> {
        input
            .validate()
            .map_err(|err| anyhow!("sale validation failed: {err}"))?;

        let sale_id = input.sale_id.unwrap_or_else(SaleId::generate);
        let recorded_at = now_utc();

        let tx = self
            .conn
            .transaction()
            .context("failed to start ingestion transaction")?;

        if query_sale(&tx, sale_id)?.is_some() {
            return Err(anyhow!("sale {sale_id} already ingested"));
        }

        if let Some(agent_id) = input.agent_id {
            if query_agent(&tx, agent_id)?.is_none() {
                return Err(anyhow!("unknown agent {agent_id}"));
            }
        }

        tx.execute(
            "INSERT INTO sale_ledger(
                sale_id, agent_id, event_time, event_time_unix_ns,
                amount_cents, description, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sale_id.to_string(),
                input.agent_id.map(|id| id.to_string()),
                format_rfc3339(input.event_time).map_err(|err| anyhow!(err.to_string()))?,
                unix_ns(input.event_time)?,
                input.amount_cents,
                input.description,
                format_rfc3339(recorded_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .context("failed to insert sale ledger entry")?;

        tx.commit().context("failed to commit ingestion transaction")?;

        Ok(SaleLedgerEntry {
            sale_id,
            agent_id: input.agent_id,
            event_time: input.event_time,
            amount_cents: input.amount_cents,
            description: input.description.clone(),
            recorded_at,
            snapshot: None,
        })
    }

    pub fn get_sale(&self, sale_id: SaleId) -> Result<Option<SaleLedgerEntry>> {
        query_sale(&self.conn, sale_id)
    }

    pub fn list_sales(
        &self,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
        unattributed_only: bool,
    ) -> Result<Vec<SaleLedgerEntry>> {
        let mut query = String::from(
            "SELECT sale_id, agent_id, event_time, amount_cents, description, recorded_at,
                    snapshot_supervisor_id, snapshot_supervisor_name, snapshot_team_number,
                    snapshot_captured_at
             FROM sale_ledger WHERE 1 = 1",
        );
        let mut bound: Vec<i64> = Vec::new();

        if let Some(from) = from {
            bound.push(unix_ns(from)?);
            query.push_str(&format!(" AND event_time_unix_ns >= ?{}", bound.len()));
        }
        if let Some(to) = to {
            bound.push(unix_ns(to)?);
            query.push_str(&format!(" AND event_time_unix_ns < ?{}", bound.len()));
        }
        if unattributed_only {
            query.push_str(" AND (snapshot_captured_at IS NULL OR snapshot_supervisor_id IS NULL)");
        }
        query.push_str(" ORDER BY event_time_unix_ns ASC, sale_id ASC");

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bound), parse_sale_row)?;
        collect_rows(rows)
    }

    /// Captures the supervisor snapshot for one sale, exactly once.
    ///
    /// A sale is never rejected for lack of attribution: when no
    /// assignment covers its event time the sentinel snapshot is stored
    /// and the sale stays reportable as unattributed. Repeat calls return
    /// the stored snapshot unchanged; only [`Self::recompute`] may
    /// overwrite.
    pub fn capture_snapshot(&mut self, sale_id: SaleId) -> Result<SupervisorSnapshot> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start capture transaction")?;

        let sale = query_sale(&tx, sale_id)?.ok_or_else(|| anyhow!("unknown sale {sale_id}"))?;

        if let Some(existing) = sale.snapshot {
            return Ok(existing);
        }

        let captured_at = now_utc();
        let snapshot = match sale.agent_id {
            None => SupervisorSnapshot::unattributed(captured_at),
            Some(agent_id) => {
                let timeline = query_timeline(&tx, agent_id)?;
                let resolution = resolve_at(&timeline, sale.event_time);
                match resolution.interval {
                    None => SupervisorSnapshot::unattributed(captured_at),
                    Some(interval) => {
                        let supervisor =
                            query_supervisor(&tx, interval.supervisor_id)?.ok_or_else(|| {
                                anyhow!(
                                    "interval {} references unknown supervisor {}",
                                    interval.interval_id,
                                    interval.supervisor_id
                                )
                            })?;
                        ResolvedSupervisor {
                            supervisor_id: interval.supervisor_id,
                            supervisor_name: supervisor.display_name,
                            team_number: interval.team_number,
                        }
                        .into_snapshot(captured_at)
                    }
                }
            }
        };

        write_snapshot(&tx, sale_id, &snapshot)?;
        tx.commit().context("failed to commit capture transaction")?;

        Ok(snapshot)
    }

    /// Re-derives snapshots for every sale whose event time falls in
    /// `[range_start, range_end)`, in ascending event-time order.
    ///
    /// Per-entry failures are aggregated and never abort the run; only a
    /// failure reading the agent timeline set itself is fatal. Running
    /// twice with identical timeline state and `overwrite = true` is a
    /// no-op on the second run.
    #[allow(clippy::too_many_lines)]
    pub fn recompute(
        &mut self,
        range_start: OffsetDateTime,
        range_end: OffsetDateTime,
        options: RecomputeOptions,
    ) -> Result<RecomputeSummary> {
        let started_at = now_utc();

        // Timeline set and supervisor registry load up front; failure here
        // aborts the whole run.
        let timelines = self.load_all_timelines()?;
        let supervisors = self.load_all_supervisors()?;

        let raw_sales = self.load_raw_sales(range_start, range_end)?;

        let mut summary = RecomputeSummary::default();

        for raw in raw_sales {
            summary.scanned += 1;

            let entry = match raw.typed() {
                Ok(entry) => entry,
                Err(err) => {
                    summary.errors.push(RecomputeEntryError {
                        sale_id: raw.sale_id.clone(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let Some(agent_id) = entry.agent_id else {
                summary.no_agent += 1;
                continue;
            };

            let timeline = timelines.get(&agent_id).map_or(&[][..], Vec::as_slice);
            let resolution = resolve_at(timeline, entry.event_time);
            if resolution.overlap_detected {
                summary.warnings.push(format!(
                    "sale {}: overlapping intervals for agent {} at {}; used the most recently recorded",
                    entry.sale_id, agent_id, entry.event_time
                ));
            }

            let Some(interval) = resolution.interval else {
                summary.unattributed += 1;
                continue;
            };

            let Some(supervisor) = supervisors.get(&interval.supervisor_id) else {
                summary.errors.push(RecomputeEntryError {
                    sale_id: entry.sale_id.to_string(),
                    error: format!(
                        "interval {} references unknown supervisor {}",
                        interval.interval_id, interval.supervisor_id
                    ),
                });
                continue;
            };

            let fresh = ResolvedSupervisor {
                supervisor_id: interval.supervisor_id,
                supervisor_name: supervisor.display_name.clone(),
                team_number: interval.team_number,
            }
            .into_snapshot(now_utc());

            let should_write = match &entry.snapshot {
                None => true,
                Some(existing) if existing.same_attribution(&fresh) => false,
                Some(_) => options.overwrite,
            };

            if !should_write {
                summary.skipped += 1;
                continue;
            }

            if options.dry_run {
                summary.updated += 1;
                continue;
            }

            match write_snapshot(&self.conn, entry.sale_id, &fresh) {
                Ok(()) => summary.updated += 1,
                Err(err) => summary.errors.push(RecomputeEntryError {
                    sale_id: entry.sale_id.to_string(),
                    error: format!("failed to write snapshot: {err}"),
                }),
            }
        }

        if !options.dry_run {
            self.record_backfill_run(range_start, range_end, options, started_at, &summary)?;
            if options.overwrite {
                self.complete_queued_backfill(range_start, range_end)?;
            }
        }

        Ok(summary)
    }

    pub fn pending_backfill(&self) -> Result<Vec<BackfillRequest>> {
        let mut stmt = self.conn.prepare(
            "SELECT queue_id, agent_id, range_start, range_end, requested_at, completed_at
             FROM backfill_queue
             WHERE completed_at IS NULL
             ORDER BY requested_at ASC, queue_id ASC",
        )?;
        let rows = stmt.query_map([], parse_backfill_row)?;
        collect_rows(rows)
    }

    fn load_all_timelines(&self) -> Result<BTreeMap<AgentId, Vec<MembershipInterval>>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT interval_id, agent_id, team_number, supervisor_id,
                        start_time, end_time, note, recorded_at
                 FROM membership_intervals
                 ORDER BY agent_id ASC, start_time ASC",
            )
            .context("failed to prepare timeline set query")?;

        let rows = stmt
            .query_map([], parse_interval_row)
            .context("failed to read the agent timeline set")?;

        let mut timelines: BTreeMap<AgentId, Vec<MembershipInterval>> = BTreeMap::new();
        for row in rows {
            let interval = row.context("failed to read the agent timeline set")?;
            timelines.entry(interval.agent_id).or_default().push(interval);
        }
        Ok(timelines)
    }

    fn load_all_supervisors(&self) -> Result<BTreeMap<SupervisorId, Supervisor>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT supervisor_id, display_name, team_number, created_at
                 FROM supervisors ORDER BY supervisor_id ASC",
            )
            .context("failed to prepare supervisor registry query")?;

        let rows = stmt
            .query_map([], parse_supervisor_row)
            .context("failed to read the supervisor registry")?;

        let mut supervisors = BTreeMap::new();
        for row in rows {
            let supervisor: Supervisor = row.context("failed to read the supervisor registry")?;
            supervisors.insert(supervisor.supervisor_id, supervisor);
        }
        Ok(supervisors)
    }

    fn load_raw_sales(
        &self,
        range_start: OffsetDateTime,
        range_end: OffsetDateTime,
    ) -> Result<Vec<RawSaleRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT sale_id, agent_id, event_time, amount_cents, description, recorded_at,
                    snapshot_supervisor_id, snapshot_supervisor_name, snapshot_team_number,
                    snapshot_captured_at
             FROM sale_ledger
             WHERE event_time_unix_ns >= ?1 AND event_time_unix_ns < ?2
             ORDER BY event_time_unix_ns ASC, sale_id ASC",
        )?;

        let rows = stmt.query_map(
            params![unix_ns(range_start)?, unix_ns(range_end)?],
            |row| {
                Ok(RawSaleRow {
                    sale_id: row.get(0)?,
                    agent_id: row.get(1)?,
                    event_time: row.get(2)?,
                    amount_cents: row.get(3)?,
                    description: row.get(4)?,
                    recorded_at: row.get(5)?,
                    snapshot_supervisor_id: row.get(6)?,
                    snapshot_supervisor_name: row.get(7)?,
                    snapshot_team_number: row.get(8)?,
                    snapshot_captured_at: row.get(9)?,
                })
            },
        )?;

        collect_rows(rows)
    }

    fn record_backfill_run(
        &self,
        range_start: OffsetDateTime,
        range_end: OffsetDateTime,
        options: RecomputeOptions,
        started_at: OffsetDateTime,
        summary: &RecomputeSummary,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO backfill_runs(
                    run_id, range_start, range_end, overwrite,
                    started_at, finished_at, summary_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Ulid::new().to_string(),
                    format_rfc3339(range_start).map_err(|err| anyhow!(err.to_string()))?,
                    format_rfc3339(range_end).map_err(|err| anyhow!(err.to_string()))?,
                    bool_to_sql(options.overwrite),
                    format_rfc3339(started_at).map_err(|err| anyhow!(err.to_string()))?,
                    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
                    serde_json::to_string(summary).context("failed to serialize run summary")?,
                ],
            )
            .context("failed to record backfill run")?;
        Ok(())
    }

    /// Marks queued requests done when the overwrite run covered their
    /// whole range. An open-ended request is covered once the run's end
    /// passes every recorded sale event time: no sale exists whose
    /// snapshot the old bounds could still be misattributing.
    fn complete_queued_backfill(
        &self,
        range_start: OffsetDateTime,
        range_end: OffsetDateTime,
    ) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "UPDATE backfill_queue SET completed_at = ?1
                 WHERE completed_at IS NULL
                   AND range_start_unix_ns >= ?2
                   AND (
                     (range_end_unix_ns IS NOT NULL AND range_end_unix_ns <= ?3)
                     OR (range_end_unix_ns IS NULL
                         AND ?3 > COALESCE(
                           (SELECT MAX(event_time_unix_ns) FROM sale_ledger), ?2))
                   )",
                params![now, unix_ns(range_start)?, unix_ns(range_end)?],
            )
            .context("failed to mark queued backfill requests complete")?;
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Sale row read with no interpretation; typed conversion happens per
/// entry so one corrupt row cannot abort a batch.
#[derive(Debug, Clone)]
struct RawSaleRow {
    sale_id: String,
    agent_id: Option<String>,
    event_time: String,
    amount_cents: i64,
    description: String,
    recorded_at: String,
    snapshot_supervisor_id: Option<String>,
    snapshot_supervisor_name: Option<String>,
    snapshot_team_number: Option<i64>,
    snapshot_captured_at: Option<String>,
}

impl RawSaleRow {
    fn typed(&self) -> Result<SaleLedgerEntry> {
        let sale_id = SaleId::parse(&self.sale_id).map_err(|err| anyhow!(err.to_string()))?;
        let agent_id = self
            .agent_id
            .as_deref()
            .map(AgentId::parse)
            .transpose()
            .map_err(|err| anyhow!(err.to_string()))?;
        let event_time =
            parse_rfc3339_utc(&self.event_time).map_err(|err| anyhow!(err.to_string()))?;
        let recorded_at =
            parse_rfc3339_utc(&self.recorded_at).map_err(|err| anyhow!(err.to_string()))?;

        let snapshot = match &self.snapshot_captured_at {
            None => None,
            Some(captured_raw) => {
                let captured_at =
                    parse_rfc3339_utc(captured_raw).map_err(|err| anyhow!(err.to_string()))?;
                let supervisor_id = self
                    .snapshot_supervisor_id
                    .as_deref()
                    .map(SupervisorId::parse)
                    .transpose()
                    .map_err(|err| anyhow!(err.to_string()))?;
                let team_number = self
                    .snapshot_team_number
                    .map(|value| {
                        u32::try_from(value)
                            .map_err(|_| anyhow!("invalid snapshot team_number: {value}"))
                    })
                    .transpose()?;
                Some(SupervisorSnapshot {
                    supervisor_id,
                    supervisor_name: self.snapshot_supervisor_name.clone(),
                    team_number,
                    captured_at,
                })
            }
        };

        Ok(SaleLedgerEntry {
            sale_id,
            agent_id,
            event_time,
            amount_cents: self.amount_cents,
            description: self.description.clone(),
            recorded_at,
            snapshot,
        })
    }
}

fn query_timeline(conn: &Connection, agent_id: AgentId) -> Result<Vec<MembershipInterval>> {
    let mut stmt = conn.prepare(
        "SELECT interval_id, agent_id, team_number, supervisor_id,
                start_time, end_time, note, recorded_at
         FROM membership_intervals
         WHERE agent_id = ?1
         ORDER BY start_time ASC",
    )?;
    let rows = stmt.query_map(params![agent_id.to_string()], parse_interval_row)?;
    collect_rows(rows)
}

fn query_agent(conn: &Connection, agent_id: AgentId) -> Result<Option<Agent>> {
    let mut stmt = conn.prepare(
        "SELECT agent_id, display_name, active, created_at FROM agents WHERE agent_id = ?1",
    )?;
    let row = stmt
        .query_row(params![agent_id.to_string()], parse_agent_row)
        .optional()?;
    Ok(row)
}

fn query_supervisor(conn: &Connection, supervisor_id: SupervisorId) -> Result<Option<Supervisor>> {
    let mut stmt = conn.prepare(
        "SELECT supervisor_id, display_name, team_number, created_at
         FROM supervisors WHERE supervisor_id = ?1",
    )?;
    let row = stmt
        .query_row(params![supervisor_id.to_string()], parse_supervisor_row)
        .optional()?;
    Ok(row)
}

fn query_sale(conn: &Connection, sale_id: SaleId) -> Result<Option<SaleLedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT sale_id, agent_id, event_time, amount_cents, description, recorded_at,
                snapshot_supervisor_id, snapshot_supervisor_name, snapshot_team_number,
                snapshot_captured_at
         FROM sale_ledger WHERE sale_id = ?1",
    )?;
    let row = stmt
        .query_row(params![sale_id.to_string()], parse_sale_row)
        .optional()?;
    Ok(row)
}

fn insert_interval(conn: &Connection, interval: &MembershipInterval) -> Result<()> {
    conn.execute(
        "INSERT INTO membership_intervals(
            interval_id, agent_id, team_number, supervisor_id,
            start_time, end_time, note, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            interval.interval_id.to_string(),
            interval.agent_id.to_string(),
            i64::from(interval.team_number),
            interval.supervisor_id.to_string(),
            format_rfc3339(interval.start_time).map_err(|err| anyhow!(err.to_string()))?,
            interval
                .end_time
                .map(format_rfc3339)
                .transpose()
                .map_err(|err| anyhow!(err.to_string()))?,
            interval.note,
            format_rfc3339(interval.recorded_at).map_err(|err| anyhow!(err.to_string()))?,
        ],
    )
    .context("failed to insert membership interval")?;
    Ok(())
}

fn insert_backfill_request(conn: &Connection, request: &BackfillRequest) -> Result<()> {
    conn.execute(
        "INSERT INTO backfill_queue(
            queue_id, agent_id, range_start, range_start_unix_ns,
            range_end, range_end_unix_ns, requested_at, completed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            request.queue_id.to_string(),
            request.agent_id.to_string(),
            format_rfc3339(request.range_start).map_err(|err| anyhow!(err.to_string()))?,
            unix_ns(request.range_start)?,
            request
                .range_end
                .map(format_rfc3339)
                .transpose()
                .map_err(|err| anyhow!(err.to_string()))?,
            request.range_end.map(unix_ns).transpose()?,
            format_rfc3339(request.requested_at).map_err(|err| anyhow!(err.to_string()))?,
            request
                .completed_at
                .map(format_rfc3339)
                .transpose()
                .map_err(|err| anyhow!(err.to_string()))?,
        ],
    )
    .context("failed to queue backfill request")?;
    Ok(())
}

fn write_snapshot(conn: &Connection, sale_id: SaleId, snapshot: &SupervisorSnapshot) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE sale_ledger SET
                snapshot_supervisor_id = ?1,
                snapshot_supervisor_name = ?2,
                snapshot_team_number = ?3,
                snapshot_captured_at = ?4
             WHERE sale_id = ?5",
            params![
                snapshot.supervisor_id.map(|id| id.to_string()),
                snapshot.supervisor_name,
                snapshot.team_number.map(i64::from),
                format_rfc3339(snapshot.captured_at).map_err(|err| anyhow!(err.to_string()))?,
                sale_id.to_string(),
            ],
        )
        .context("failed to write supervisor snapshot")?;

    if changed == 0 {
        return Err(anyhow!("unknown sale {sale_id}"));
    }
    Ok(())
}

fn parse_agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let agent_id_raw: String = row.get(0)?;
    Ok(Agent {
        agent_id: AgentId::parse(&agent_id_raw).map_err(|err| invalid_column(0, &err))?,
        display_name: row.get(1)?,
        active: row.get::<_, i64>(2)? == 1,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(3)?)
            .map_err(|err| invalid_column(3, &err))?,
    })
}

fn parse_supervisor_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Supervisor> {
    let supervisor_id_raw: String = row.get(0)?;
    let team_number_i64: i64 = row.get(2)?;
    Ok(Supervisor {
        supervisor_id: SupervisorId::parse(&supervisor_id_raw)
            .map_err(|err| invalid_column(0, &err))?,
        display_name: row.get(1)?,
        team_number: u32::try_from(team_number_i64).map_err(|_| {
            invalid_column(2, &format!("invalid team_number: {team_number_i64}"))
        })?,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(3)?)
            .map_err(|err| invalid_column(3, &err))?,
    })
}

fn parse_interval_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MembershipInterval> {
    let interval_id_raw: String = row.get(0)?;
    let agent_id_raw: String = row.get(1)?;
    let team_number_i64: i64 = row.get(2)?;
    let supervisor_id_raw: String = row.get(3)?;

    Ok(MembershipInterval {
        interval_id: IntervalId::parse(&interval_id_raw).map_err(|err| invalid_column(0, &err))?,
        agent_id: AgentId::parse(&agent_id_raw).map_err(|err| invalid_column(1, &err))?,
        team_number: u32::try_from(team_number_i64).map_err(|_| {
            invalid_column(2, &format!("invalid team_number: {team_number_i64}"))
        })?,
        supervisor_id: SupervisorId::parse(&supervisor_id_raw)
            .map_err(|err| invalid_column(3, &err))?,
        start_time: parse_rfc3339_utc(&row.get::<_, String>(4)?)
            .map_err(|err| invalid_column(4, &err))?,
        end_time: row
            .get::<_, Option<String>>(5)?
            .as_deref()
            .map(|value| parse_rfc3339_utc(value).map_err(|err| invalid_column(5, &err)))
            .transpose()?,
        note: row.get(6)?,
        recorded_at: parse_rfc3339_utc(&row.get::<_, String>(7)?)
            .map_err(|err| invalid_column(7, &err))?,
    })
}

fn parse_sale_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SaleLedgerEntry> {
    let raw = RawSaleRow {
        sale_id: row.get(0)?,
        agent_id: row.get(1)?,
        event_time: row.get(2)?,
        amount_cents: row.get(3)?,
        description: row.get(4)?,
        recorded_at: row.get(5)?,
        snapshot_supervisor_id: row.get(6)?,
        snapshot_supervisor_name: row.get(7)?,
        snapshot_team_number: row.get(8)?,
        snapshot_captured_at: row.get(9)?,
    };

    raw.typed().map_err(|err| invalid_column(0, &err))
}

fn parse_backfill_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackfillRequest> {
    let queue_id_raw: String = row.get(0)?;
    let agent_id_raw: String = row.get(1)?;

    let queue_id = Ulid::from_string(&queue_id_raw)
        .map_err(|_| invalid_column(0, &format!("invalid queue_id ULID: {queue_id_raw}")))?;

    Ok(BackfillRequest {
        queue_id,
        agent_id: AgentId::parse(&agent_id_raw).map_err(|err| invalid_column(1, &err))?,
        range_start: parse_rfc3339_utc(&row.get::<_, String>(2)?)
            .map_err(|err| invalid_column(2, &err))?,
        range_end: row
            .get::<_, Option<String>>(3)?
            .as_deref()
            .map(|value| parse_rfc3339_utc(value).map_err(|err| invalid_column(3, &err)))
            .transpose()?,
        requested_at: parse_rfc3339_utc(&row.get::<_, String>(4)?)
            .map_err(|err| invalid_column(4, &err))?,
        completed_at: row
            .get::<_, Option<String>>(5)?
            .as_deref()
            .map(|value| parse_rfc3339_utc(value).map_err(|err| invalid_column(5, &err)))
            .transpose()?,
    })
}

fn invalid_column(index: usize, err: &dyn std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn unix_ns(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of supported range: {value}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
