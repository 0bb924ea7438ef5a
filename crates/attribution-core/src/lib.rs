use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AttributionError {
    #[error("invalid timeline operation: {0}")]
    InvalidTimelineOperation(String),
    #[error("overlap violation: {0}")]
    OverlapViolation(String),
    #[error("validation error: {0}")]
    Validation(String),
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Parses the id from its canonical ULID string form.
            ///
            /// # Errors
            /// Returns [`AttributionError::Validation`] when the input is not
            /// a valid ULID.
            pub fn parse(raw: &str) -> Result<Self, AttributionError> {
                Ulid::from_string(raw)
                    .map(Self)
                    .map_err(|_| AttributionError::Validation(format!("invalid ULID: {raw}")))
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(AgentId);
ulid_id!(SupervisorId);
ulid_id!(SaleId);
ulid_id!(IntervalId);

/// A salesperson. The current team/supervisor is never stored here; it
/// is always the agent's OPEN membership interval, so registry state
/// cannot drift out of sync with history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub agent_id: AgentId,
    pub display_name: String,
    pub active: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Supervisor {
    pub supervisor_id: SupervisorId,
    pub display_name: String,
    pub team_number: u32,
    pub created_at: OffsetDateTime,
}

/// One team/supervisor assignment in an agent's membership history.
///
/// `end_time = None` marks the OPEN interval, the agent's current
/// assignment. Intervals cover the half-open range `[start_time,
/// end_time)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipInterval {
    pub interval_id: IntervalId,
    pub agent_id: AgentId,
    pub team_number: u32,
    pub supervisor_id: SupervisorId,
    pub start_time: OffsetDateTime,
    pub end_time: Option<OffsetDateTime>,
    pub note: Option<String>,
    pub recorded_at: OffsetDateTime,
}

impl MembershipInterval {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    #[must_use]
    pub fn contains(&self, at: OffsetDateTime) -> bool {
        at >= self.start_time && self.end_time.map_or(true, |end| at < end)
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let self_end_after_other_start = self.end_time.map_or(true, |end| end > other.start_time);
        let other_end_after_self_start = other.end_time.map_or(true, |end| end > self.start_time);
        self_end_after_other_start && other_end_after_self_start
    }

    /// Validates the interval's own bounds.
    ///
    /// # Errors
    /// Returns [`AttributionError::Validation`] when a closed interval does
    /// not satisfy `start_time < end_time`.
    pub fn validate(&self) -> Result<(), AttributionError> {
        if let Some(end) = self.end_time {
            if self.start_time >= end {
                return Err(AttributionError::Validation(format!(
                    "interval {} has start_time {} >= end_time {}",
                    self.interval_id, self.start_time, end
                )));
            }
        }
        Ok(())
    }

    fn bounds_label(&self) -> String {
        match self.end_time {
            Some(end) => format!("[{}, {})", self.start_time, end),
            None => format!("[{}, OPEN)", self.start_time),
        }
    }
}

/// Validates the full-timeline invariants for one agent.
///
/// # Errors
/// Returns [`AttributionError::OverlapViolation`] when two intervals
/// intersect or more than one interval is OPEN, and
/// [`AttributionError::Validation`] for bad per-interval bounds or a
/// foreign agent's interval in the slice.
pub fn validate_timeline(timeline: &[MembershipInterval]) -> Result<(), AttributionError> {
    let Some(first) = timeline.first() else {
        return Ok(());
    };

    let mut open_count = 0_usize;
    for interval in timeline {
        interval.validate()?;
        if interval.agent_id != first.agent_id {
            return Err(AttributionError::Validation(format!(
                "timeline mixes agents {} and {}",
                first.agent_id, interval.agent_id
            )));
        }
        if interval.is_open() {
            open_count += 1;
        }
    }

    if open_count > 1 {
        return Err(AttributionError::OverlapViolation(
            "timeline has more than one OPEN interval".to_string(),
        ));
    }

    let mut ordered: Vec<&MembershipInterval> = timeline.iter().collect();
    ordered.sort_by_key(|interval| interval.start_time);

    for pair in ordered.windows(2) {
        if pair[0].overlaps(pair[1]) {
            return Err(AttributionError::OverlapViolation(format!(
                "interval {} {} overlaps interval {} {}",
                pair[0].interval_id,
                pair[0].bounds_label(),
                pair[1].interval_id,
                pair[1].bounds_label()
            )));
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The previously OPEN interval, now closed at the new start.
    pub closed: Option<MembershipInterval>,
    pub opened: MembershipInterval,
}

/// Opens a new assignment interval at `start_time`, closing the current
/// OPEN interval at that instant.
///
/// This is the forward-only path: it never rewrites resolved history.
/// Retroactive edits go through [`correct_interval`].
///
/// # Errors
/// Returns [`AttributionError::InvalidTimelineOperation`] when
/// `start_time` precedes the end of a closed interval or does not come
/// strictly after the OPEN interval's start.
pub fn append_assignment(
    timeline: &[MembershipInterval],
    agent_id: AgentId,
    team_number: u32,
    supervisor_id: SupervisorId,
    start_time: OffsetDateTime,
    note: Option<String>,
    recorded_at: OffsetDateTime,
) -> Result<AppendOutcome, AttributionError> {
    for interval in timeline {
        match interval.end_time {
            Some(end) if start_time < end => {
                return Err(AttributionError::InvalidTimelineOperation(format!(
                    "start_time {} precedes the end of closed interval {} {}",
                    start_time,
                    interval.interval_id,
                    interval.bounds_label()
                )));
            }
            Some(_) => {}
            None if start_time <= interval.start_time => {
                return Err(AttributionError::InvalidTimelineOperation(format!(
                    "start_time {} does not come after the OPEN interval {} started at {}",
                    start_time, interval.interval_id, interval.start_time
                )));
            }
            None => {}
        }
    }

    let closed = timeline.iter().find(|interval| interval.is_open()).map(|interval| {
        let mut closed = interval.clone();
        closed.end_time = Some(start_time);
        closed
    });

    let opened = MembershipInterval {
        interval_id: IntervalId::generate(),
        agent_id,
        team_number,
        supervisor_id,
        start_time,
        end_time: None,
        note,
        recorded_at,
    };

    Ok(AppendOutcome { closed, opened })
}

/// Requested end bound for a corrective edit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EndBound {
    Open,
    At(OffsetDateTime),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrectionOutcome {
    pub corrected: MembershipInterval,
    pub timeline: Vec<MembershipInterval>,
    /// Union of the old and new bounds; sales in this range need backfill.
    pub affected_start: OffsetDateTime,
    /// `None` when either the old or the new bound was OPEN.
    pub affected_end: Option<OffsetDateTime>,
}

/// Applies an administrative correction to one interval's bounds and
/// re-validates the whole timeline.
///
/// The input slice is never modified; on error the caller's stored
/// timeline is untouched by construction.
///
/// # Errors
/// Returns [`AttributionError::InvalidTimelineOperation`] for an unknown
/// interval or an edit with no new bounds, and
/// [`AttributionError::OverlapViolation`] when the corrected timeline
/// would violate the non-overlap or single-OPEN invariants.
pub fn correct_interval(
    timeline: &[MembershipInterval],
    interval_id: IntervalId,
    new_start: Option<OffsetDateTime>,
    new_end: Option<EndBound>,
) -> Result<CorrectionOutcome, AttributionError> {
    if new_start.is_none() && new_end.is_none() {
        return Err(AttributionError::InvalidTimelineOperation(
            "correction requires a new start bound, a new end bound, or both".to_string(),
        ));
    }

    let position = timeline
        .iter()
        .position(|interval| interval.interval_id == interval_id)
        .ok_or_else(|| {
            AttributionError::InvalidTimelineOperation(format!(
                "unknown interval {interval_id} in timeline"
            ))
        })?;

    let previous = &timeline[position];
    let mut corrected = previous.clone();
    if let Some(start) = new_start {
        corrected.start_time = start;
    }
    match new_end {
        Some(EndBound::Open) => corrected.end_time = None,
        Some(EndBound::At(end)) => corrected.end_time = Some(end),
        None => {}
    }

    let mut candidate: Vec<MembershipInterval> = timeline.to_vec();
    candidate[position] = corrected.clone();
    validate_timeline(&candidate)?;

    let affected_start = previous.start_time.min(corrected.start_time);
    let affected_end = match (previous.end_time, corrected.end_time) {
        (Some(old_end), Some(new_end)) => Some(old_end.max(new_end)),
        _ => None,
    };

    Ok(CorrectionOutcome {
        corrected,
        timeline: candidate,
        affected_start,
        affected_end,
    })
}

/// Outcome of a point-in-time timeline lookup.
///
/// `interval = None` means no assignment existed at the queried instant
/// (before the first interval, or inside an explicit gap). That is a
/// data-quality signal for the caller, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<'a> {
    pub interval: Option<&'a MembershipInterval>,
    /// Set when more than one interval contained the instant. Resolution
    /// stays deterministic (most recently recorded interval wins) but the
    /// caller should log a consistency warning.
    pub overlap_detected: bool,
}

#[must_use]
pub fn resolve_at(timeline: &[MembershipInterval], at: OffsetDateTime) -> Resolution<'_> {
    let mut containing: Vec<&MembershipInterval> = timeline
        .iter()
        .filter(|interval| interval.contains(at))
        .collect();

    let overlap_detected = containing.len() > 1;
    containing.sort_by_key(|interval| (interval.recorded_at, interval.interval_id));

    Resolution {
        interval: containing.last().copied(),
        overlap_detected,
    }
}

/// Supervisor identity resolved for an instant: the assignment is
/// temporally exact, the display name is a current-value lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedSupervisor {
    pub supervisor_id: SupervisorId,
    pub supervisor_name: String,
    pub team_number: u32,
}

impl ResolvedSupervisor {
    #[must_use]
    pub fn into_snapshot(self, captured_at: OffsetDateTime) -> SupervisorSnapshot {
        SupervisorSnapshot {
            supervisor_id: Some(self.supervisor_id),
            supervisor_name: Some(self.supervisor_name),
            team_number: Some(self.team_number),
            captured_at,
        }
    }
}

/// Immutable attribution record embedded in a sale ledger entry.
///
/// The sentinel form (`supervisor_id = None`) marks a sale that could
/// not be attributed at capture time; it is reportable, never silently
/// replaced outside the backfill job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorSnapshot {
    pub supervisor_id: Option<SupervisorId>,
    pub supervisor_name: Option<String>,
    pub team_number: Option<u32>,
    pub captured_at: OffsetDateTime,
}

impl SupervisorSnapshot {
    #[must_use]
    pub fn unattributed(captured_at: OffsetDateTime) -> Self {
        Self {
            supervisor_id: None,
            supervisor_name: None,
            team_number: None,
            captured_at,
        }
    }

    #[must_use]
    pub fn is_unattributed(&self) -> bool {
        self.supervisor_id.is_none()
    }

    /// Compares the identity fields, ignoring `captured_at`. Backfill uses
    /// this to distinguish value-changing rewrites from no-op re-writes.
    #[must_use]
    pub fn same_attribution(&self, other: &Self) -> bool {
        self.supervisor_id == other.supervisor_id
            && self.supervisor_name == other.supervisor_name
            && self.team_number == other.team_number
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaleLedgerEntry {
    pub sale_id: SaleId,
    pub agent_id: Option<AgentId>,
    pub event_time: OffsetDateTime,
    pub amount_cents: i64,
    pub description: String,
    pub recorded_at: OffsetDateTime,
    pub snapshot: Option<SupervisorSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaleInput {
    pub sale_id: Option<SaleId>,
    pub agent_id: Option<AgentId>,
    pub event_time: OffsetDateTime,
    pub amount_cents: i64,
    pub description: String,
}

impl SaleInput {
    /// Validates a sale before ingestion.
    ///
    /// # Errors
    /// Returns [`AttributionError::Validation`] when required fields are
    /// missing or the event time is not UTC.
    pub fn validate(&self) -> Result<(), AttributionError> {
        if self.description.trim().is_empty() {
            return Err(AttributionError::Validation(
                "description MUST be provided for every sale".to_string(),
            ));
        }

        if self.event_time.offset() != UtcOffset::UTC {
            return Err(AttributionError::Validation(
                "event_time MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecomputeOptions {
    pub overwrite: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecomputeEntryError {
    /// Raw stored id so even a corrupt row stays reportable.
    pub sale_id: String,
    pub error: String,
}

/// The sole contract a backfill run surfaces to operational tooling.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecomputeSummary {
    pub scanned: usize,
    /// Snapshot writes that changed the attribution identity.
    pub updated: usize,
    /// Entries left alone: snapshot present and equal, or overwrite off.
    pub skipped: usize,
    pub unattributed: usize,
    pub no_agent: usize,
    pub errors: Vec<RecomputeEntryError>,
    pub warnings: Vec<String>,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AttributionError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AttributionError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AttributionError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AttributionError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AttributionError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AttributionError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T, E>(result: Result<T, E>) -> E {
        match result {
            Ok(_) => panic!("expected Err(..), got Ok"),
            Err(err) => err,
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn fixture_agent_id() -> AgentId {
        AgentId(must_ok(Ulid::from_string("01J0SQQP7M70P6Y3R4T8D8G8M2")))
    }

    fn fixture_supervisor_a() -> SupervisorId {
        SupervisorId(must_ok(Ulid::from_string("01J0SQQP7M70P6Y3R4T8D8G8N3")))
    }

    fn fixture_supervisor_b() -> SupervisorId {
        SupervisorId(must_ok(Ulid::from_string("01J0SQQP7M70P6Y3R4T8D8G8P4")))
    }

    fn fixture_interval(
        start: &str,
        end: Option<&str>,
        team_number: u32,
        supervisor_id: SupervisorId,
        recorded_at: &str,
    ) -> MembershipInterval {
        MembershipInterval {
            interval_id: IntervalId::generate(),
            agent_id: fixture_agent_id(),
            team_number,
            supervisor_id,
            start_time: must_utc(start),
            end_time: end.map(must_utc),
            note: None,
            recorded_at: must_utc(recorded_at),
        }
    }

    /// Jan1..Mar1 Team7/A, Mar1..OPEN Team9/B — the canonical handover.
    fn fixture_timeline() -> Vec<MembershipInterval> {
        vec![
            fixture_interval(
                "2026-01-01T00:00:00Z",
                Some("2026-03-01T00:00:00Z"),
                7,
                fixture_supervisor_a(),
                "2026-01-01T00:00:00Z",
            ),
            fixture_interval(
                "2026-03-01T00:00:00Z",
                None,
                9,
                fixture_supervisor_b(),
                "2026-03-01T00:00:00Z",
            ),
        ]
    }

    #[test]
    fn timeline_fixture_satisfies_invariants() {
        must_ok(validate_timeline(&fixture_timeline()));
    }

    #[test]
    fn validate_rejects_overlapping_intervals() {
        let mut timeline = fixture_timeline();
        timeline[0].end_time = Some(must_utc("2026-03-15T00:00:00Z"));

        let err = must_err(validate_timeline(&timeline));
        assert!(matches!(err, AttributionError::OverlapViolation(_)));
    }

    #[test]
    fn validate_rejects_double_open_timeline() {
        let mut timeline = fixture_timeline();
        timeline[0].end_time = None;

        let err = must_err(validate_timeline(&timeline));
        assert!(matches!(err, AttributionError::OverlapViolation(_)));
    }

    #[test]
    fn validate_rejects_inverted_bounds() {
        let interval = fixture_interval(
            "2026-03-01T00:00:00Z",
            Some("2026-01-01T00:00:00Z"),
            7,
            fixture_supervisor_a(),
            "2026-01-01T00:00:00Z",
        );

        let err = must_err(validate_timeline(&[interval]));
        assert!(matches!(err, AttributionError::Validation(_)));
    }

    #[test]
    fn append_closes_open_interval_at_new_start() {
        let timeline = fixture_timeline();
        let start = must_utc("2026-05-01T00:00:00Z");

        let outcome = must_ok(append_assignment(
            &timeline,
            fixture_agent_id(),
            12,
            fixture_supervisor_a(),
            start,
            Some("promotion shuffle".to_string()),
            must_utc("2026-05-01T00:00:01Z"),
        ));

        let closed = match outcome.closed {
            Some(value) => value,
            None => panic!("expected the OPEN interval to be closed"),
        };
        assert_eq!(closed.end_time, Some(start));
        assert_eq!(outcome.opened.start_time, start);
        assert!(outcome.opened.is_open());
        assert_eq!(outcome.opened.team_number, 12);
    }

    #[test]
    fn append_then_resolve_at_start_returns_new_interval() {
        let mut timeline = fixture_timeline();
        let start = must_utc("2026-05-01T00:00:00Z");

        let outcome = must_ok(append_assignment(
            &timeline,
            fixture_agent_id(),
            12,
            fixture_supervisor_a(),
            start,
            None,
            must_utc("2026-05-01T00:00:01Z"),
        ));

        timeline.retain(|interval| !interval.is_open());
        if let Some(closed) = outcome.closed.clone() {
            timeline.push(closed);
        }
        timeline.push(outcome.opened.clone());
        must_ok(validate_timeline(&timeline));

        let resolution = resolve_at(&timeline, start);
        assert_eq!(resolution.interval, Some(&outcome.opened));
        assert!(!resolution.overlap_detected);
    }

    #[test]
    fn append_rejects_start_inside_closed_history() {
        let timeline = fixture_timeline();

        let err = must_err(append_assignment(
            &timeline,
            fixture_agent_id(),
            12,
            fixture_supervisor_a(),
            must_utc("2026-02-15T00:00:00Z"),
            None,
            must_utc("2026-05-01T00:00:00Z"),
        ));
        assert!(matches!(err, AttributionError::InvalidTimelineOperation(_)));
    }

    #[test]
    fn append_rejects_start_at_or_before_open_interval_start() {
        let timeline = fixture_timeline();

        let err = must_err(append_assignment(
            &timeline,
            fixture_agent_id(),
            12,
            fixture_supervisor_a(),
            must_utc("2026-03-01T00:00:00Z"),
            None,
            must_utc("2026-05-01T00:00:00Z"),
        ));
        assert!(matches!(err, AttributionError::InvalidTimelineOperation(_)));
    }

    #[test]
    fn append_onto_empty_timeline_opens_first_interval() {
        let outcome = must_ok(append_assignment(
            &[],
            fixture_agent_id(),
            7,
            fixture_supervisor_a(),
            must_utc("2026-01-01T00:00:00Z"),
            None,
            must_utc("2026-01-01T00:00:00Z"),
        ));

        assert!(outcome.closed.is_none());
        assert!(outcome.opened.is_open());
    }

    #[test]
    fn resolve_is_historically_exact_across_the_handover() {
        let timeline = fixture_timeline();

        let feb = resolve_at(&timeline, must_utc("2026-02-15T00:00:00Z"));
        let feb_interval = match feb.interval {
            Some(value) => value,
            None => panic!("expected Feb 15 to resolve"),
        };
        assert_eq!(feb_interval.supervisor_id, fixture_supervisor_a());
        assert_eq!(feb_interval.team_number, 7);

        let apr = resolve_at(&timeline, must_utc("2026-04-01T00:00:00Z"));
        let apr_interval = match apr.interval {
            Some(value) => value,
            None => panic!("expected Apr 1 to resolve"),
        };
        assert_eq!(apr_interval.supervisor_id, fixture_supervisor_b());
        assert_eq!(apr_interval.team_number, 9);
    }

    #[test]
    fn resolve_before_history_and_inside_gap_returns_none() {
        let timeline = vec![
            fixture_interval(
                "2026-01-01T00:00:00Z",
                Some("2026-02-01T00:00:00Z"),
                7,
                fixture_supervisor_a(),
                "2026-01-01T00:00:00Z",
            ),
            // Explicit one-month gap before the next assignment.
            fixture_interval(
                "2026-03-01T00:00:00Z",
                None,
                9,
                fixture_supervisor_b(),
                "2026-03-01T00:00:00Z",
            ),
        ];
        must_ok(validate_timeline(&timeline));

        let before = resolve_at(&timeline, must_utc("2025-12-01T00:00:00Z"));
        assert!(before.interval.is_none());

        let gap = resolve_at(&timeline, must_utc("2026-02-15T00:00:00Z"));
        assert!(gap.interval.is_none());
        assert!(!gap.overlap_detected);
    }

    #[test]
    fn resolve_boundary_belongs_to_the_later_interval() {
        let timeline = fixture_timeline();
        let boundary = resolve_at(&timeline, must_utc("2026-03-01T00:00:00Z"));
        let interval = match boundary.interval {
            Some(value) => value,
            None => panic!("expected the boundary instant to resolve"),
        };
        assert_eq!(interval.supervisor_id, fixture_supervisor_b());
    }

    #[test]
    fn corrupt_overlap_resolves_to_most_recently_recorded_with_warning() {
        // Overlap injected directly, bypassing validation, to model a data
        // bug in stored history.
        let timeline = vec![
            fixture_interval(
                "2026-01-01T00:00:00Z",
                Some("2026-04-01T00:00:00Z"),
                7,
                fixture_supervisor_a(),
                "2026-01-01T00:00:00Z",
            ),
            fixture_interval(
                "2026-03-01T00:00:00Z",
                None,
                9,
                fixture_supervisor_b(),
                "2026-03-01T00:00:00Z",
            ),
        ];

        let resolution = resolve_at(&timeline, must_utc("2026-03-15T00:00:00Z"));
        assert!(resolution.overlap_detected);
        let interval = match resolution.interval {
            Some(value) => value,
            None => panic!("expected deterministic resolution despite overlap"),
        };
        assert_eq!(interval.supervisor_id, fixture_supervisor_b());
    }

    #[test]
    fn correction_moves_boundary_and_reports_affected_range() {
        let timeline = fixture_timeline();
        let new_boundary = must_utc("2026-03-15T00:00:00Z");

        // Move the handover from Mar 1 to Mar 15: close A later, start B later.
        let first = must_ok(correct_interval(
            &timeline,
            timeline[1].interval_id,
            Some(new_boundary),
            None,
        ));
        let second = must_ok(correct_interval(
            &first.timeline,
            timeline[0].interval_id,
            None,
            Some(EndBound::At(new_boundary)),
        ));

        must_ok(validate_timeline(&second.timeline));
        assert_eq!(second.affected_start, must_utc("2026-01-01T00:00:00Z"));
        assert_eq!(second.affected_end, Some(new_boundary));

        let resolution = resolve_at(&second.timeline, must_utc("2026-03-10T00:00:00Z"));
        let interval = match resolution.interval {
            Some(value) => value,
            None => panic!("expected Mar 10 to resolve after correction"),
        };
        assert_eq!(interval.supervisor_id, fixture_supervisor_a());
    }

    #[test]
    fn correction_causing_overlap_is_rejected_and_input_unchanged() {
        let timeline = fixture_timeline();
        let before = timeline.clone();

        let err = must_err(correct_interval(
            &timeline,
            timeline[0].interval_id,
            None,
            Some(EndBound::At(must_utc("2026-03-15T00:00:00Z"))),
        ));

        assert!(matches!(err, AttributionError::OverlapViolation(_)));
        assert_eq!(timeline, before);
    }

    #[test]
    fn correction_reopening_next_to_an_open_interval_is_rejected() {
        let timeline = fixture_timeline();

        let err = must_err(correct_interval(
            &timeline,
            timeline[0].interval_id,
            None,
            Some(EndBound::Open),
        ));
        assert!(matches!(err, AttributionError::OverlapViolation(_)));
    }

    #[test]
    fn correction_with_no_bounds_is_rejected() {
        let timeline = fixture_timeline();
        let err = must_err(correct_interval(&timeline, timeline[0].interval_id, None, None));
        assert!(matches!(err, AttributionError::InvalidTimelineOperation(_)));
    }

    #[test]
    fn correction_of_unknown_interval_is_rejected() {
        let timeline = fixture_timeline();
        let err = must_err(correct_interval(
            &timeline,
            IntervalId::generate(),
            Some(must_utc("2026-01-02T00:00:00Z")),
            None,
        ));
        assert!(matches!(err, AttributionError::InvalidTimelineOperation(_)));
    }

    #[test]
    fn snapshot_attribution_comparison_ignores_captured_at() {
        let resolved = ResolvedSupervisor {
            supervisor_id: fixture_supervisor_a(),
            supervisor_name: "Supervisor A".to_string(),
            team_number: 7,
        };

        let first = resolved.clone().into_snapshot(must_utc("2026-02-01T00:00:00Z"));
        let second = resolved.into_snapshot(must_utc("2026-06-01T00:00:00Z"));
        assert!(first.same_attribution(&second));
        assert_ne!(first.captured_at, second.captured_at);

        let sentinel = SupervisorSnapshot::unattributed(must_utc("2026-02-01T00:00:00Z"));
        assert!(sentinel.is_unattributed());
        assert!(!sentinel.same_attribution(&first));
    }

    #[test]
    fn sale_input_requires_description() {
        let input = SaleInput {
            sale_id: None,
            agent_id: Some(fixture_agent_id()),
            event_time: must_utc("2026-02-15T00:00:00Z"),
            amount_cents: 12_500,
            description: "  ".to_string(),
        };

        let err = must_err(input.validate());
        assert!(matches!(err, AttributionError::Validation(_)));
    }
}
