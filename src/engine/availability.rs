use chrono::{NaiveDate, TimeDelta};

use crate::cache::conflicts_key;
use crate::model::*;

use super::{Engine, EngineError};

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove sorted `to_remove` spans from sorted, disjoint `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        for r in to_remove[ri..].iter().take_while(|r| r.start < b.end) {
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

/// Free spans of `window` once every blocking interval is taken out.
pub(crate) fn free_spans(cal: &Calendar, window: &Span) -> Vec<Span> {
    let mut blocked: Vec<Span> = cal
        .overlapping(window)
        .map(|i| Span::new(i.span.start.max(window.start), i.span.end.min(window.end)))
        .collect();
    blocked.sort_by_key(|s| s.start);
    subtract_intervals(&[*window], &merge_overlapping(&blocked))
}

impl Engine {
    /// Bookable gaps within a local day's operating hours, at least `min_length` long.
    pub async fn available_slots(
        &self,
        day: NaiveDate,
        min_length: Option<TimeDelta>,
    ) -> Result<Vec<Span>, EngineError> {
        let (open, close) = self.policy.operating_hours(day).ok_or_else(|| {
            EngineError::InvalidInterval(format!("no operating hours on {day}"))
        })?;
        let key = conflicts_key(day);
        let free = match self.cache.free_slots.get(&key) {
            Some(hit) => hit,
            None => {
                let cal = self.calendar.read().await;
                let free = free_spans(&cal, &Span::new(open, close));
                // stored under the read guard so a concurrent writer's invalidation lands after us
                self.cache.free_slots.insert(key, free.clone());
                free
            }
        };
        let min_length = min_length.unwrap_or(TimeDelta::zero());
        Ok(free.into_iter().filter(|s| s.duration() >= min_length).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn at(h: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 11, 3, h, 0, 0).unwrap()
    }

    fn span(a: u32, b: u32) -> Span {
        Span::new(at(a), at(b))
    }

    #[test]
    fn merge_joins_overlapping_and_adjacent() {
        let merged = merge_overlapping(&[span(9, 11), span(10, 12), span(12, 13), span(15, 16)]);
        assert_eq!(merged, vec![span(9, 13), span(15, 16)]);
    }

    #[test]
    fn subtract_cuts_holes() {
        let free = subtract_intervals(&[span(9, 22)], &[span(10, 12), span(14, 15), span(21, 23)]);
        assert_eq!(free, vec![span(9, 10), span(12, 14), span(15, 21)]);
    }

    #[test]
    fn subtract_with_nothing_to_remove() {
        assert_eq!(subtract_intervals(&[span(9, 12)], &[]), vec![span(9, 12)]);
        assert!(subtract_intervals(&[span(9, 12)], &[span(8, 13)]).is_empty());
    }

    #[test]
    fn free_spans_clamps_blockers_to_window() {
        let mut cal = Calendar::new();
        cal.insert_interval(Interval {
            id: Ulid::new(),
            span: span(7, 10),
            kind: IntervalKind::Closure,
        });
        cal.insert_interval(Interval {
            id: Ulid::new(),
            span: span(13, 15),
            kind: IntervalKind::Reservation,
        });
        cal.insert_interval(Interval {
            id: Ulid::new(),
            span: span(14, 16),
            kind: IntervalKind::Production,
        });
        let free = free_spans(&cal, &span(9, 22));
        assert_eq!(free, vec![span(10, 13), span(16, 22)]);
    }
}
