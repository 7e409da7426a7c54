use chrono::TimeDelta;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Build a half-open span, rejecting empty or inverted intervals.
pub(crate) fn validate_interval(start: Timestamp, end: Timestamp) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInterval(format!(
            "end {} must be after start {}",
            end.to_rfc3339(),
            start.to_rfc3339()
        )));
    }
    Ok(Span::new(start, end))
}

/// Validate a read-only query window.
pub(crate) fn validate_window(start: Timestamp, end: Timestamp) -> Result<Span, EngineError> {
    let span = validate_interval(start, end)?;
    if span.duration() > TimeDelta::days(MAX_QUERY_WINDOW_DAYS) {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

fn describe(cal: &Calendar, interval: &Interval) -> String {
    match interval.kind {
        IntervalKind::Reservation => match cal.reservations.get(&interval.id) {
            Some(r) if r.is_recurring() => {
                format!("{} reservation by {} (recurring)", r.status.as_str(), r.reservable)
            }
            Some(r) => format!("{} reservation by {}", r.status.as_str(), r.reservable),
            None => "reservation".to_string(),
        },
        IntervalKind::Production => cal
            .productions
            .get(&interval.id)
            .map(|p| format!("production \"{}\"", p.title))
            .unwrap_or_else(|| "production".to_string()),
        IntervalKind::Closure => match cal.closures.get(&interval.id) {
            Some(c) => match &c.notes {
                Some(notes) => format!("{} closure: {notes}", c.closure_type.as_str()),
                None => format!("{} closure", c.closure_type.as_str()),
            },
            None => "closure".to_string(),
        },
    }
}

/// Everything blocking `span`, optionally ignoring one reservation.
/// Cancelled reservations are never in the index, so they never conflict.
pub(crate) fn collect_conflicts(cal: &Calendar, span: &Span, exclude: Option<Ulid>) -> ConflictReport {
    let mut report = ConflictReport::default();
    for interval in cal.overlapping(span) {
        if Some(interval.id) == exclude {
            continue;
        }
        let conflict = Conflict {
            kind: interval.kind,
            id: interval.id,
            span: interval.span,
            label: describe(cal, interval),
        };
        match interval.kind {
            IntervalKind::Reservation => report.reservations.push(conflict),
            IntervalKind::Production => report.productions.push(conflict),
            IntervalKind::Closure => report.closures.push(conflict),
        }
    }
    report
}

pub(crate) fn check_no_conflict(cal: &Calendar, span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
    let report = collect_conflicts(cal, span, exclude);
    if report.is_empty() {
        Ok(())
    } else {
        Err(EngineError::SlotUnavailable(report))
    }
}

impl Engine {
    /// `true` when nothing but (optionally) `exclude` occupies `[start, end)`.
    pub async fn check_time_slot_availability(
        &self,
        start: Timestamp,
        end: Timestamp,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let span = validate_window(start, end)?;
        let cal = self.calendar.read().await;
        Ok(collect_conflicts(&cal, &span, exclude).is_empty())
    }

    pub async fn get_all_conflicts(
        &self,
        start: Timestamp,
        end: Timestamp,
        exclude: Option<Ulid>,
    ) -> Result<ConflictReport, EngineError> {
        let span = validate_window(start, end)?;
        let cal = self.calendar.read().await;
        Ok(collect_conflicts(&cal, &span, exclude))
    }

    /// Validation shared by every path that creates a reservation.
    pub(super) fn validate_booking_span(&self, span: &Span, at: Timestamp) -> Result<(), EngineError> {
        if span.start <= at {
            return Err(EngineError::InvalidInterval(
                "reservation must start in the future".into(),
            ));
        }
        if span.start > at + TimeDelta::days(MAX_BOOKING_HORIZON_DAYS) {
            return Err(EngineError::LimitExceeded("reservation too far in the future"));
        }
        let length = span.duration();
        if length < self.policy.min_duration {
            return Err(EngineError::InvalidInterval(format!(
                "reservation shorter than {} minutes",
                self.policy.min_duration.num_minutes()
            )));
        }
        if length > self.policy.max_duration {
            return Err(EngineError::InvalidInterval(format!(
                "reservation longer than {} minutes",
                self.policy.max_duration.num_minutes()
            )));
        }
        Ok(())
    }
}
