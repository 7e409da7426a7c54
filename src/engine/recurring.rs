use chrono::{Days, NaiveDate, NaiveTime};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::recurrence::Pattern;

use super::conflict::collect_conflicts;
use super::reservations::ReservationRequest;
use super::{now, Engine, EngineError};

const SERIES_CANCELLED_REASON: &str = "Recurring series cancelled";

/// Input for setting up (or validating) a recurring booking.
#[derive(Debug, Clone)]
pub struct SeriesRequest {
    pub id: Ulid,
    pub user_id: Ulid,
    /// Defaults to the member.
    pub reservable: Option<Reservable>,
    pub recurrence_rule: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub series_start_date: NaiveDate,
    pub series_end_date: Option<NaiveDate>,
    /// Falls back to the policy default.
    pub max_advance_days: Option<u32>,
    pub notes: Option<String>,
}

impl SeriesRequest {
    pub fn new(
        user_id: Ulid,
        recurrence_rule: impl Into<String>,
        start_time: NaiveTime,
        end_time: NaiveTime,
        series_start_date: NaiveDate,
    ) -> Self {
        Self {
            id: Ulid::new(),
            user_id,
            reservable: None,
            recurrence_rule: recurrence_rule.into(),
            start_time,
            end_time,
            series_start_date,
            series_end_date: None,
            max_advance_days: None,
            notes: None,
        }
    }

    fn pattern(&self) -> Pattern<'_> {
        Pattern {
            rule: &self.recurrence_rule,
            start_date: self.series_start_date,
            end_date: self.series_end_date,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

/// What one generation pass over a single series did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub created: Vec<Ulid>,
    pub skipped_existing: u32,
    pub skipped_past: u32,
    pub skipped_conflicts: u32,
    pub failed: u32,
}

/// Totals of a periodic scan across every active series.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    pub series_scanned: u32,
    pub series_completed: u32,
    pub series_failed: u32,
    pub created: u32,
    pub skipped_existing: u32,
    pub skipped_conflicts: u32,
    pub failed: u32,
}

impl GenerationSummary {
    fn absorb(&mut self, report: &GenerationReport) {
        self.created += report.created.len() as u32;
        self.skipped_existing += report.skipped_existing;
        self.skipped_conflicts += report.skipped_conflicts;
        self.failed += report.failed;
    }
}

fn validate_notes(notes: &Option<String>) -> Result<(), EngineError> {
    if notes.as_ref().is_some_and(|n| n.len() > MAX_TEXT_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}

fn add_days(day: NaiveDate, days: u32) -> NaiveDate {
    day.checked_add_days(Days::new(days.into())).unwrap_or(NaiveDate::MAX)
}

impl Engine {
    fn validate_series_request(&self, req: &SeriesRequest) -> Result<(), EngineError> {
        req.pattern().validate(self.policy.timezone)?;
        if req.series_end_date.is_some_and(|end| end < req.series_start_date) {
            return Err(EngineError::InvalidSeries(
                "series end date is before its start date".into(),
            ));
        }
        let length = req.end_time - req.start_time;
        if length < self.policy.min_duration || length > self.policy.max_duration {
            return Err(EngineError::InvalidSeries(format!(
                "occurrence length must be between {} and {} minutes",
                self.policy.min_duration.num_minutes(),
                self.policy.max_duration.num_minutes()
            )));
        }
        if req.max_advance_days.is_some_and(|d| d == 0 || d > MAX_ADVANCE_DAYS) {
            return Err(EngineError::LimitExceeded("max_advance_days out of range"));
        }
        validate_notes(&req.notes)
    }

    /// Project the pattern forward `occurrences` times (default 8) and report
    /// every collision with one-off bookings or other active series. Warnings only;
    /// nothing is written.
    pub async fn validate_recurring_pattern(
        &self,
        req: &SeriesRequest,
        occurrences: Option<usize>,
    ) -> Result<Vec<RecurringConflictWarning>, EngineError> {
        self.validate_series_request(req)?;
        let count = occurrences
            .unwrap_or(DEFAULT_VALIDATION_OCCURRENCES)
            .clamp(1, MAX_VALIDATION_OCCURRENCES);
        let tz = self.policy.timezone;
        let today = self.policy.local_date(now());
        let projected = req.pattern().expand(tz, today, None, count)?;
        let (Some(first), Some(last)) = (projected.first(), projected.last()) else {
            return Ok(Vec::new());
        };
        let window = (self.policy.local_date(first.start), self.policy.local_date(last.start));

        let cal = self.calendar.read().await;
        let mut others: Vec<(Ulid, Vec<Span>)> = Vec::new();
        for series in cal.series.values() {
            if series.id == req.id || series.status != SeriesStatus::Active {
                continue;
            }
            let spans = Pattern::of(series).expand(
                tz,
                window.0,
                Some(window.1),
                MAX_OCCURRENCES_PER_EXPANSION,
            )?;
            others.push((series.id, spans));
        }
        others.sort_by_key(|(id, _)| *id);

        let mut warnings = Vec::new();
        for occurrence in &projected {
            let report = collect_conflicts(&cal, occurrence, None);
            for conflict in report.iter() {
                warnings.push(RecurringConflictWarning {
                    occurrence: *occurrence,
                    source: WarningSource::Booking(conflict.clone()),
                });
            }
            let day = self.policy.local_date(occurrence.start);
            for (series_id, spans) in &others {
                for other in spans {
                    if self.policy.local_date(other.start) != day || !other.overlaps(occurrence) {
                        continue;
                    }
                    // already generated instances were reported as bookings above
                    let generated = report.reservations.iter().any(|c| {
                        c.span == *other
                            && cal
                                .reservations
                                .get(&c.id)
                                .is_some_and(|r| r.recurring_series_id == Some(*series_id))
                    });
                    if !generated {
                        warnings.push(RecurringConflictWarning {
                            occurrence: *occurrence,
                            source: WarningSource::Series {
                                series_id: *series_id,
                                occurrence: *other,
                            },
                        });
                    }
                }
            }
        }
        Ok(warnings)
    }

    /// Create the series and seed its instances. Proceeds despite warnings, which
    /// are returned alongside the generation report.
    pub async fn create_recurring_series(
        &self,
        req: SeriesRequest,
    ) -> Result<(RecurringSeries, Vec<RecurringConflictWarning>, GenerationReport), EngineError> {
        let warnings = self.validate_recurring_pattern(&req, None).await?;
        let at = now();

        let mut cal = self.calendar.write().await;
        if cal.series.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let series = RecurringSeries {
            id: req.id,
            user_id: req.user_id,
            reservable: req.reservable.unwrap_or(Reservable::user(req.user_id)),
            recurrence_rule: req.recurrence_rule,
            start_time: req.start_time,
            end_time: req.end_time,
            series_start_date: req.series_start_date,
            series_end_date: req.series_end_date,
            max_advance_days: req
                .max_advance_days
                .unwrap_or(self.policy.default_max_advance_days),
            status: SeriesStatus::Active,
            notes: req.notes,
            created_at: at,
        };
        let event = Event::SeriesCreated {
            series: series.clone(),
        };
        self.persist_and_apply(Some(&mut cal), None, Some(series.user_id), &event)
            .await?;
        info!(series = %series.id, rule = %series.recurrence_rule, warnings = warnings.len(), "recurring series created");

        let report = self.generate_locked(&mut cal, series.id, at).await?;
        Ok((series, warnings, report))
    }

    /// Fill the series' rolling window up to `max_advance_days` ahead. Safe to re-run.
    pub async fn generate_recurring_instances(
        &self,
        series_id: Ulid,
        at: Timestamp,
    ) -> Result<GenerationReport, EngineError> {
        let mut cal = self.calendar.write().await;
        self.generate_locked(&mut cal, series_id, at).await
    }

    async fn generate_locked(
        &self,
        cal: &mut Calendar,
        series_id: Ulid,
        at: Timestamp,
    ) -> Result<GenerationReport, EngineError> {
        let series = cal
            .series
            .get(&series_id)
            .cloned()
            .ok_or(EngineError::NotFound(series_id))?;
        let mut report = GenerationReport::default();
        if series.status != SeriesStatus::Active {
            return Ok(report);
        }

        let today = self.policy.local_date(at);
        let resume_from = cal
            .series_instances
            .get(&series_id)
            .and_then(|instances| instances.keys().next_back())
            .and_then(|last| self.policy.local_date(*last).succ_opt());
        let from = resume_from.map_or(today, |d| d.max(today));
        let until = add_days(today, series.max_advance_days);
        let occurrences = Pattern::of(&series).expand(
            self.policy.timezone,
            from,
            Some(until),
            MAX_OCCURRENCES_PER_EXPANSION,
        )?;

        for span in occurrences {
            if span.start <= at {
                report.skipped_past += 1;
                continue;
            }
            if cal
                .series_instances
                .get(&series_id)
                .is_some_and(|instances| instances.contains_key(&span.start))
            {
                report.skipped_existing += 1;
                continue;
            }
            let conflicts = collect_conflicts(cal, &span, None);
            if !conflicts.is_empty() {
                warn!(series = %series_id, occurrence = %span, "skipping occurrence: {conflicts}");
                report.skipped_conflicts += 1;
                continue;
            }
            let req = ReservationRequest {
                reservable: Some(series.reservable),
                notes: series.notes.clone(),
                ..ReservationRequest::new(series.user_id, span.start, span.end)
            };
            match self.book_locked(cal, req, Some(series_id), at).await {
                Ok(reservation) => report.created.push(reservation.id),
                Err(e @ EngineError::WalError(_)) => return Err(e),
                Err(e) => {
                    warn!(series = %series_id, occurrence = %span, "occurrence not booked: {e}");
                    report.failed += 1;
                }
            }
        }

        metrics::counter!(crate::observability::SERIES_INSTANCES_CREATED_TOTAL)
            .increment(report.created.len() as u64);
        if !report.created.is_empty() || report.skipped_conflicts > 0 {
            info!(
                series = %series_id,
                created = report.created.len(),
                skipped_conflicts = report.skipped_conflicts,
                "recurring instances generated"
            );
        }
        Ok(report)
    }

    /// Periodic scan: advance every active series' window, and mark series whose
    /// end date has passed as completed. One failing series never stops the rest.
    pub async fn generate_future_recurring_instances(
        &self,
        at: Timestamp,
    ) -> Result<GenerationSummary, EngineError> {
        let today = self.policy.local_date(at);
        let mut ids: Vec<Ulid> = {
            let cal = self.calendar.read().await;
            cal.series
                .values()
                .filter(|s| s.status == SeriesStatus::Active)
                .map(|s| s.id)
                .collect()
        };
        ids.sort();

        let mut summary = GenerationSummary::default();
        for id in ids {
            let mut cal = self.calendar.write().await;
            let Some(series) = cal.series.get(&id) else {
                continue;
            };
            if series.status != SeriesStatus::Active {
                continue;
            }
            summary.series_scanned += 1;
            if series.series_end_date.is_some_and(|end| end < today) {
                let user_id = series.user_id;
                let event = Event::SeriesStatusChanged {
                    id,
                    status: SeriesStatus::Completed,
                };
                self.persist_and_apply(Some(&mut cal), None, Some(user_id), &event)
                    .await?;
                info!(series = %id, "recurring series completed");
                summary.series_completed += 1;
                continue;
            }
            match self.generate_locked(&mut cal, id, at).await {
                Ok(report) => summary.absorb(&report),
                Err(e @ EngineError::WalError(_)) => return Err(e),
                Err(e) => {
                    warn!(series = %id, "recurring generation failed: {e}");
                    summary.series_failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Cancel the series and every future, still-active instance in chronological
    /// order. Past instances stay as they are. Returns the cancelled reservation ids.
    pub async fn cancel_recurring_series(
        &self,
        id: Ulid,
        reason: Option<String>,
        at: Timestamp,
    ) -> Result<Vec<Ulid>, EngineError> {
        validate_notes(&reason)?;
        let mut cal = self.calendar.write().await;
        let series = cal.series.get(&id).ok_or(EngineError::NotFound(id))?;
        if !matches!(series.status, SeriesStatus::Active | SeriesStatus::Paused) {
            return Err(EngineError::InvalidSeries(format!(
                "series {id} is already {}",
                series.status.as_str()
            )));
        }
        let user_id = series.user_id;
        let event = Event::SeriesStatusChanged {
            id,
            status: SeriesStatus::Cancelled,
        };
        self.persist_and_apply(Some(&mut cal), None, Some(user_id), &event)
            .await?;

        let future: Vec<Ulid> = cal
            .series_reservations(&id)
            .into_iter()
            .filter(|r| r.span.start > at && r.status.is_active())
            .map(|r| r.id)
            .collect();
        let reason = reason.unwrap_or_else(|| SERIES_CANCELLED_REASON.to_string());
        let mut cancelled = Vec::with_capacity(future.len());
        for reservation_id in future {
            match self
                .cancel_locked(&mut cal, reservation_id, Some(reason.clone()), at)
                .await
            {
                Ok(_) => cancelled.push(reservation_id),
                Err(e @ EngineError::WalError(_)) => return Err(e),
                Err(e) => warn!(series = %id, reservation = %reservation_id, "instance not cancelled: {e}"),
            }
        }
        info!(series = %id, cancelled = cancelled.len(), "recurring series cancelled");
        Ok(cancelled)
    }

    /// Stop generating new instances. Existing ones are left alone.
    pub async fn pause_recurring_series(&self, id: Ulid) -> Result<RecurringSeries, EngineError> {
        self.toggle_series(id, SeriesStatus::Active, SeriesStatus::Paused)
            .await
    }

    pub async fn resume_recurring_series(&self, id: Ulid) -> Result<RecurringSeries, EngineError> {
        self.toggle_series(id, SeriesStatus::Paused, SeriesStatus::Active)
            .await
    }

    async fn toggle_series(
        &self,
        id: Ulid,
        from: SeriesStatus,
        to: SeriesStatus,
    ) -> Result<RecurringSeries, EngineError> {
        let mut cal = self.calendar.write().await;
        let series = cal.series.get(&id).ok_or(EngineError::NotFound(id))?;
        if series.status != from {
            return Err(EngineError::InvalidSeries(format!(
                "series {id} is {}, expected {}",
                series.status.as_str(),
                from.as_str()
            )));
        }
        let user_id = series.user_id;
        let event = Event::SeriesStatusChanged { id, status: to };
        self.persist_and_apply(Some(&mut cal), None, Some(user_id), &event)
            .await?;
        info!(series = %id, status = to.as_str(), "recurring series status changed");
        cal.series.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Move the end date, then fill the newly opened window if the series is active.
    pub async fn extend_recurring_series(
        &self,
        id: Ulid,
        series_end_date: Option<NaiveDate>,
        at: Timestamp,
    ) -> Result<(RecurringSeries, GenerationReport), EngineError> {
        let mut cal = self.calendar.write().await;
        let series = cal.series.get(&id).ok_or(EngineError::NotFound(id))?;
        if !matches!(series.status, SeriesStatus::Active | SeriesStatus::Paused) {
            return Err(EngineError::InvalidSeries(format!(
                "cannot extend {} series {id}",
                series.status.as_str()
            )));
        }
        if series_end_date.is_some_and(|end| end < series.series_start_date) {
            return Err(EngineError::InvalidSeries(
                "series end date is before its start date".into(),
            ));
        }
        let user_id = series.user_id;
        let event = Event::SeriesExtended { id, series_end_date };
        self.persist_and_apply(Some(&mut cal), None, Some(user_id), &event)
            .await?;

        let report = self.generate_locked(&mut cal, id, at).await?;
        let series = cal.series.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        Ok((series, report))
    }
}
