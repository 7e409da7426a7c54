use chrono::{Datelike, TimeDelta};
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::cache::user_stats_key;
use crate::model::*;

use super::conflict::validate_window;
use super::{Engine, EngineError};

/// Narrowing for reservation listings. Empty filter lists everything.
#[derive(Debug, Clone, Default)]
pub struct ReservationFilter {
    pub user_id: Option<Ulid>,
    pub reservable: Option<Reservable>,
    pub series_id: Option<Ulid>,
    pub status: Option<ReservationStatus>,
    /// Only reservations overlapping `[from, to)`.
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.user_id.is_none_or(|u| r.user_id == u)
            && self.reservable.is_none_or(|who| r.reservable == who)
            && self.series_id.is_none_or(|s| r.recurring_series_id == Some(s))
            && self.status.is_none_or(|s| r.status == s)
            && self.from.is_none_or(|from| r.span.end > from)
            && self.to.is_none_or(|to| r.span.start < to)
    }
}

impl Engine {
    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        self.calendar.read().await.reservations.get(&id).cloned()
    }

    /// Matching reservations ordered by start time.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, EngineError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            validate_window(from, to)?;
        }
        let cal = self.calendar.read().await;
        let mut out: Vec<Reservation> = cal
            .reservations
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.span.start, r.id));
        Ok(out)
    }

    pub async fn get_charge(&self, id: Ulid) -> Option<Charge> {
        self.calendar.read().await.charges.get(&id).cloned()
    }

    pub async fn charge_for_reservation(&self, reservation_id: Ulid) -> Option<Charge> {
        self.calendar
            .read()
            .await
            .charge_for(&Chargeable::reservation(reservation_id))
            .cloned()
    }

    pub async fn list_charges(&self, user_id: Option<Ulid>, status: Option<ChargeStatus>) -> Vec<Charge> {
        let cal = self.calendar.read().await;
        let mut out: Vec<Charge> = cal
            .charges
            .values()
            .filter(|c| user_id.is_none_or(|u| c.user_id == u))
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|c| (c.created_at, c.id));
        out
    }

    pub async fn get_series(&self, id: Ulid) -> Option<RecurringSeries> {
        self.calendar.read().await.series.get(&id).cloned()
    }

    pub async fn list_series(&self, user_id: Option<Ulid>) -> Vec<RecurringSeries> {
        let cal = self.calendar.read().await;
        let mut out: Vec<RecurringSeries> = cal
            .series
            .values()
            .filter(|s| user_id.is_none_or(|u| s.user_id == u))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// A series' generated instances, any status, in chronological order.
    pub async fn series_instances(&self, series_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let cal = self.calendar.read().await;
        if !cal.series.contains_key(&series_id) {
            return Err(EngineError::NotFound(series_id));
        }
        Ok(cal.series_reservations(&series_id).into_iter().cloned().collect())
    }

    pub async fn list_closures(&self) -> Vec<SpaceClosure> {
        let cal = self.calendar.read().await;
        let mut out: Vec<SpaceClosure> = cal.closures.values().cloned().collect();
        out.sort_by_key(|c| (c.span.start, c.id));
        out
    }

    pub async fn list_productions(&self) -> Vec<Production> {
        let cal = self.calendar.read().await;
        let mut out: Vec<Production> = cal.productions.values().cloned().collect();
        out.sort_by_key(|p| (p.span.start, p.id));
        out
    }

    /// Scheduled reservations starting within the reminder lead that haven't
    /// been reminded yet, soonest first.
    pub async fn reminder_candidates(&self, at: Timestamp) -> Vec<Reservation> {
        let horizon = at + TimeDelta::days(self.policy.reminder_lead_days);
        let cal = self.calendar.read().await;
        let mut out: Vec<Reservation> = cal
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Scheduled && r.reminder_sent_at.is_none())
            .filter(|r| r.span.start > at && r.span.start <= horizon)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    pub fn get_member(&self, user_id: Ulid) -> Option<MemberProfile> {
        self.members.get(&user_id).map(|m| m.value().clone())
    }

    pub fn list_members(&self) -> Vec<MemberProfile> {
        let mut out: Vec<MemberProfile> = self.members.iter().map(|m| m.value().clone()).collect();
        out.sort_by_key(|m| m.user_id);
        out
    }

    /// This local month's booking totals for a member plus their remaining free blocks.
    pub async fn user_stats(&self, user_id: Ulid, at: Timestamp) -> UserStats {
        let key = user_stats_key(user_id);
        let month = self.month_key(at);
        if let Some(stats) = self.cache.user_stats.get(&key)
            && stats.month == month
        {
            return stats;
        }

        let this_month = self.policy.local_date(at);
        let cal = self.calendar.read().await;
        let mut stats = UserStats {
            user_id,
            month,
            reservations: 0,
            hours_booked: Decimal::ZERO,
            free_hours_used: Decimal::ZERO,
            free_blocks_remaining: 0,
        };
        for r in cal.reservations.values() {
            if r.user_id != user_id || !r.status.is_active() {
                continue;
            }
            let day = self.policy.local_date(r.span.start);
            if (day.year(), day.month()) != (this_month.year(), this_month.month()) {
                continue;
            }
            stats.reservations += 1;
            stats.hours_booked += r.hours_used;
            stats.free_hours_used += r.free_hours_used;
        }
        // stored under both guards so any writer's invalidation lands after us
        let account = self.account(user_id);
        let ledger = account.read().await;
        stats.free_blocks_remaining = ledger.balance(CreditType::FreeHours);
        self.cache.user_stats.insert(key, stats.clone());
        stats
    }
}
