use std::collections::BTreeMap;

use chrono::TimeDelta;
use rust_decimal::Decimal;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_interval};
use super::cost::calculate_cost;
use super::ledger::new_transaction;
use super::{now, Engine, EngineError};

/// Input to the booking action.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub id: Ulid,
    /// Member whose credits and charge the booking uses.
    pub user_id: Ulid,
    /// Who the room is booked for. Defaults to the member.
    pub reservable: Option<Reservable>,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Forces the initial status instead of deriving it from the lead time.
    pub status: Option<ReservationStatus>,
    pub notes: Option<String>,
}

impl ReservationRequest {
    pub fn new(user_id: Ulid, start: Timestamp, end: Timestamp) -> Self {
        Self {
            id: Ulid::new(),
            user_id,
            reservable: None,
            start,
            end,
            status: None,
            notes: None,
        }
    }
}

impl Engine {
    /// Near-term bookings skip the manual confirmation step.
    pub fn determine_reservation_status(&self, start: Timestamp, at: Timestamp) -> ReservationStatus {
        if start - at <= TimeDelta::days(self.policy.auto_confirm_days) {
            ReservationStatus::Confirmed
        } else {
            ReservationStatus::Scheduled
        }
    }

    pub(super) fn invalidate_span_days(&self, span: &Span) {
        self.cache.invalidate_days(
            self.policy.local_date(span.start),
            self.policy.local_date(span.end),
        );
    }

    /// Book a slot: re-check availability, price it, record the charge and take
    /// free-hour credits, all as one committed event.
    pub async fn create_reservation(&self, req: ReservationRequest) -> Result<Reservation, EngineError> {
        let mut cal = self.calendar.write().await;
        self.book_locked(&mut cal, req, None, now()).await
    }

    /// Booking path shared with series generation. Caller holds the calendar write lock.
    pub(super) async fn book_locked(
        &self,
        cal: &mut Calendar,
        req: ReservationRequest,
        series_id: Option<Ulid>,
        at: Timestamp,
    ) -> Result<Reservation, EngineError> {
        let span = validate_interval(req.start, req.end)?;
        self.validate_booking_span(&span, at)?;
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_TEXT_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if cal.reservations.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let status = req
            .status
            .unwrap_or_else(|| self.determine_reservation_status(span.start, at));
        if status == ReservationStatus::Cancelled {
            return Err(EngineError::InvalidReservationTransition {
                id: req.id,
                from: status,
                action: "create",
            });
        }
        check_no_conflict(cal, &span, None)?;

        let account = self.account(req.user_id);
        let mut guard = account.write().await;
        let balance = guard.balance(CreditType::FreeHours);
        let quote = calculate_cost(&span, balance, self.policy.hourly_rate);

        let debit = (status != ReservationStatus::Reserved && quote.free_blocks > 0).then(|| {
            new_transaction(
                req.user_id,
                CreditType::FreeHours,
                -quote.free_blocks,
                CreditSource::ReservationCharge,
                Some(EntityRef::reservation(req.id)),
                Some(format!(
                    "Practice space {}",
                    span.start.with_timezone(&self.policy.timezone).format("%Y-%m-%d %H:%M")
                )),
                at,
            )
        });

        let reservation = Reservation {
            id: req.id,
            reservable: req.reservable.unwrap_or(Reservable::user(req.user_id)),
            user_id: req.user_id,
            span,
            status,
            hours_used: quote.total_hours,
            free_hours_used: quote.free_hours,
            free_blocks: quote.free_blocks,
            credits_deducted: debit.as_ref().map_or(0, |t| -t.amount),
            cost: quote.cost,
            cancellation_reason: None,
            recurring_series_id: series_id,
            notes: req.notes,
            created_at: at,
            confirmed_at: (status == ReservationStatus::Confirmed).then_some(at),
            cancelled_at: None,
            reminder_sent_at: None,
        };

        let mut credits_applied = BTreeMap::new();
        if quote.free_blocks > 0 {
            credits_applied.insert(CreditType::FreeHours, quote.free_blocks);
        }
        // Deferred credits settle the charge only once confirmation takes them.
        let deferred = status == ReservationStatus::Reserved && quote.free_blocks > 0;
        let settled = quote.cost == Decimal::ZERO && !deferred;
        let charge = Charge {
            id: Ulid::new(),
            chargeable: Chargeable::reservation(req.id),
            user_id: req.user_id,
            amount: quote.gross,
            net_amount: quote.cost,
            credits_applied,
            status: if settled { ChargeStatus::Paid } else { ChargeStatus::Pending },
            payment_method: settled.then_some(PaymentMethod::Credits),
            payment_reference: None,
            paid_at: settled.then_some(at),
            notes: deferred.then(|| "free hours taken on confirmation".to_string()),
            created_at: at,
            updated_at: at,
        };

        let event = Event::ReservationBooked {
            reservation: reservation.clone(),
            charge,
            debit,
        };
        self.persist_and_apply(Some(cal), Some(&mut guard), Some(req.user_id), &event)
            .await?;
        self.cache.invalidate_user(req.user_id);
        self.invalidate_span_days(&span);

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL, "status" => status.as_str())
            .increment(1);
        if reservation.credits_deducted > 0 {
            metrics::counter!(crate::observability::CREDITS_DEDUCTED_TOTAL)
                .increment(reservation.credits_deducted as u64);
        }
        info!(
            reservation = %reservation.id,
            user = %reservation.user_id,
            status = status.as_str(),
            hours = %reservation.hours_used,
            cost = %reservation.cost,
            "reservation booked"
        );
        Ok(reservation)
    }

    /// `Scheduled`/`Reserved` → `Confirmed`. Deferred credits are taken now, for the
    /// quoted number of blocks; if the balance no longer covers them nothing changes.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let mut cal = self.calendar.write().await;
        let reservation = cal.reservations.get(&id).ok_or(EngineError::NotFound(id))?;
        let (user_id, from, free_blocks, span) = (
            reservation.user_id,
            reservation.status,
            reservation.free_blocks,
            reservation.span,
        );
        if !matches!(from, ReservationStatus::Scheduled | ReservationStatus::Reserved) {
            return Err(EngineError::InvalidReservationTransition {
                id,
                from,
                action: "confirm",
            });
        }

        let at = now();
        let account = self.account(user_id);
        let mut guard = account.write().await;
        let debit = if from == ReservationStatus::Reserved && free_blocks > 0 {
            let balance = guard.balance(CreditType::FreeHours);
            if balance < free_blocks {
                return Err(EngineError::InsufficientCredit {
                    credit_type: CreditType::FreeHours,
                    balance,
                    requested: free_blocks,
                });
            }
            Some(new_transaction(
                user_id,
                CreditType::FreeHours,
                -free_blocks,
                CreditSource::ReservationCharge,
                Some(EntityRef::reservation(id)),
                Some("Deferred free hours taken on confirmation".into()),
                at,
            ))
        } else {
            None
        };

        let event = Event::ReservationConfirmed { id, at, debit };
        self.persist_and_apply(Some(&mut cal), Some(&mut guard), Some(user_id), &event)
            .await?;
        self.cache.invalidate_user(user_id);
        self.invalidate_span_days(&span);
        info!(reservation = %id, from = from.as_str(), "reservation confirmed");

        cal.reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Cancel and refund exactly what was taken from the ledger. The linked charge
    /// is cancelled if nothing was collected, or marked refunded if it was paid.
    pub async fn cancel_reservation(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let mut cal = self.calendar.write().await;
        self.cancel_locked(&mut cal, id, reason, now()).await
    }

    pub(super) async fn cancel_locked(
        &self,
        cal: &mut Calendar,
        id: Ulid,
        reason: Option<String>,
        at: Timestamp,
    ) -> Result<Reservation, EngineError> {
        if reason.as_ref().is_some_and(|r| r.len() > MAX_TEXT_LEN) {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let reservation = cal.reservations.get(&id).ok_or(EngineError::NotFound(id))?;
        if reservation.status == ReservationStatus::Cancelled {
            return Err(EngineError::InvalidReservationTransition {
                id,
                from: reservation.status,
                action: "cancel",
            });
        }
        let (user_id, deducted, span) = (reservation.user_id, reservation.credits_deducted, reservation.span);

        let refund = (deducted > 0).then(|| {
            new_transaction(
                user_id,
                CreditType::FreeHours,
                deducted,
                CreditSource::ReservationRefund,
                Some(EntityRef::reservation(id)),
                Some("Refund for cancelled reservation".into()),
                at,
            )
        });
        let charge_status = match cal.charge_for(&Chargeable::reservation(id)).map(|c| c.status) {
            Some(ChargeStatus::Pending) => Some(ChargeStatus::Cancelled),
            Some(ChargeStatus::Paid) => Some(ChargeStatus::Refunded),
            _ => None,
        };

        let account = self.account(user_id);
        let mut guard = account.write().await;
        let event = Event::ReservationCancelled {
            id,
            at,
            reason,
            refund,
            charge_status,
        };
        self.persist_and_apply(Some(cal), Some(&mut guard), Some(user_id), &event)
            .await?;
        self.cache.invalidate_user(user_id);
        self.invalidate_span_days(&span);

        metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
        info!(reservation = %id, refunded_blocks = deducted, "reservation cancelled");

        cal.reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Mark that a confirmation reminder went out. Repeat calls are no-ops.
    pub async fn record_reminder_sent(&self, id: Ulid, at: Timestamp) -> Result<(), EngineError> {
        let mut cal = self.calendar.write().await;
        let reservation = cal.reservations.get(&id).ok_or(EngineError::NotFound(id))?;
        if reservation.reminder_sent_at.is_some() {
            debug!(reservation = %id, "reminder already recorded");
            return Ok(());
        }
        let user_id = reservation.user_id;
        let event = Event::ReminderRecorded { id, at };
        self.persist_and_apply(Some(&mut cal), None, Some(user_id), &event)
            .await
    }
}
