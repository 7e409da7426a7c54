//! RRULE expansion for recurring series using the `rrule` crate.

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use thiserror::Error;

use crate::limits::{MAX_OCCURRENCES_PER_EXPANSION, MAX_RRULE_LEN};
use crate::model::{RecurringSeries, Span, Timestamp};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("failed to parse RRULE: {0}")]
    Parse(String),
    #[error("RRULE must be a single rule body without DTSTART")]
    Malformed,
    #[error("RRULE longer than {MAX_RRULE_LEN} bytes")]
    TooLong,
    #[error("end time {end} must be after start time {start}")]
    InvalidTimes { start: NaiveTime, end: NaiveTime },
}

/// The recurrence-relevant part of a series.
#[derive(Debug, Clone, Copy)]
pub struct Pattern<'a> {
    pub rule: &'a str,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl<'a> Pattern<'a> {
    pub fn of(series: &'a RecurringSeries) -> Self {
        Self {
            rule: &series.recurrence_rule,
            start_date: series.series_start_date,
            end_date: series.series_end_date,
            start_time: series.start_time,
            end_time: series.end_time,
        }
    }

    pub fn validate(&self, tz: Tz) -> Result<(), RecurrenceError> {
        if self.end_time <= self.start_time {
            return Err(RecurrenceError::InvalidTimes {
                start: self.start_time,
                end: self.end_time,
            });
        }
        self.rule_set(tz).map(|_| ())
    }

    fn rule_set(&self, tz: Tz) -> Result<rrule::RRuleSet, RecurrenceError> {
        let rule = self.rule.trim();
        let rule = rule.strip_prefix("RRULE:").unwrap_or(rule);
        if rule.len() > MAX_RRULE_LEN {
            return Err(RecurrenceError::TooLong);
        }
        if rule.is_empty() || rule.contains(['\n', '\r']) || rule.to_ascii_uppercase().contains("DTSTART") {
            return Err(RecurrenceError::Malformed);
        }
        let text = format!(
            "DTSTART;TZID={}:{}\nRRULE:{}",
            tz.name(),
            self.start_date.and_time(self.start_time).format("%Y%m%dT%H%M%S"),
            rule
        );
        text.parse::<rrule::RRuleSet>()
            .map_err(|e| RecurrenceError::Parse(e.to_string()))
    }

    /// Occurrences whose local date falls in `[from, until]`, clipped to the
    /// series date range, in chronological order. At most `limit` are returned.
    pub fn expand(
        &self,
        tz: Tz,
        from: NaiveDate,
        until: Option<NaiveDate>,
        limit: usize,
    ) -> Result<Vec<Span>, RecurrenceError> {
        if self.end_time <= self.start_time {
            return Err(RecurrenceError::InvalidTimes {
                start: self.start_time,
                end: self.end_time,
            });
        }
        let from = from.max(self.start_date);
        let until = match (until, self.end_date) {
            (Some(u), Some(e)) => Some(u.min(e)),
            (u, e) => u.or(e),
        };
        if until.is_some_and(|u| u < from) {
            return Ok(Vec::new());
        }
        let limit = limit.min(MAX_OCCURRENCES_PER_EXPANSION);

        let rrule_tz = rrule::Tz::Tz(tz);
        let mut set = self.rule_set(tz)?;
        if let Some(after) = local_midnight(tz, from) {
            set = set.after(after.with_timezone(&rrule_tz));
        }
        let until_bound = until
            .and_then(|u| u.succ_opt())
            .and_then(|next| local_midnight(tz, next));
        if let Some(before) = until_bound {
            set = set.before(before.with_timezone(&rrule_tz));
        }
        let limit_u16 = u16::try_from(limit).unwrap_or(u16::MAX);
        let result = set.all(limit_u16);

        let mut spans = Vec::with_capacity(result.dates.len());
        for dt in result.dates {
            let day = dt.date_naive();
            if day < from || until.is_some_and(|u| day > u) {
                continue;
            }
            // Skipped when a DST gap swallows the local start or end.
            let (Some(start), Some(end)) = (
                to_utc(tz, day, self.start_time),
                to_utc(tz, day, self.end_time),
            ) else {
                continue;
            };
            if start < end {
                spans.push(Span::new(start, end));
            }
            if spans.len() >= limit {
                break;
            }
        }
        spans.sort_by_key(|s| s.start);
        spans.dedup();
        Ok(spans)
    }
}

fn to_utc(tz: Tz, day: NaiveDate, time: NaiveTime) -> Option<Timestamp> {
    use chrono::TimeZone;
    tz.from_local_datetime(&day.and_time(time))
        .earliest()
        .map(|dt| dt.to_utc())
}

fn local_midnight(tz: Tz, day: NaiveDate) -> Option<Timestamp> {
    to_utc(tz, day, NaiveTime::MIN)
}
