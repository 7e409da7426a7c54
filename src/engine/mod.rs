mod availability;
mod blocking;
mod charges;
mod compact;
mod conflict;
mod cost;
mod error;
mod ledger;
mod queries;
mod recurring;
mod reservations;

pub use availability::{merge_overlapping, subtract_intervals};
pub use cost::{calculate_cost, CostBreakdown};
pub use error::EngineError;
pub use ledger::AllocationReport;
pub use queries::ReservationFilter;
pub use recurring::{GenerationReport, GenerationSummary, SeriesRequest};
pub use reservations::ReservationRequest;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::cache::EngineCache;
use crate::config::BookingPolicy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedAccount = Arc<RwLock<Account>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is queued, then
/// syncs once and answers every sender with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so partial bytes never leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file(events.len() as u64));
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed to control path")));
        }
    }
}

/// One practice space: its calendar, its members' ledgers, and the log behind them.
///
/// Lock order is always calendar, then account. Ledger-only actions hold the
/// calendar lock shared, which lets compaction fence out every writer.
pub struct Engine {
    pub(super) calendar: RwLock<Calendar>,
    pub(super) accounts: DashMap<Ulid, SharedAccount>,
    pub(super) members: DashMap<Ulid, MemberProfile>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub policy: BookingPolicy,
    pub(super) cache: EngineCache,
}

/// Apply an event to the calendar (no locking, caller holds the write guard).
fn apply_to_calendar(cal: &mut Calendar, event: &Event) {
    match event {
        Event::ReservationBooked {
            reservation,
            charge,
            ..
        } => {
            if reservation.status.is_active() {
                cal.insert_interval(Interval {
                    id: reservation.id,
                    span: reservation.span,
                    kind: IntervalKind::Reservation,
                });
            }
            if let Some(series_id) = reservation.recurring_series_id {
                cal.series_instances
                    .entry(series_id)
                    .or_default()
                    .insert(reservation.span.start, reservation.id);
            }
            cal.charge_index.insert(charge.chargeable, charge.id);
            cal.charges.insert(charge.id, charge.clone());
            cal.reservations.insert(reservation.id, reservation.clone());
        }
        Event::ReservationConfirmed { id, at, debit } => {
            if let Some(r) = cal.reservations.get_mut(id) {
                r.status = ReservationStatus::Confirmed;
                r.confirmed_at = Some(*at);
                if let Some(debit) = debit {
                    r.credits_deducted += -debit.amount;
                }
            }
            // a fully credit-covered charge is settled once the deferred debit lands
            let charge_id = cal.charge_index.get(&Chargeable::reservation(*id)).copied();
            if let (Some(_), Some(charge)) = (debit, charge_id.and_then(|c| cal.charges.get_mut(&c))) {
                if charge.status == ChargeStatus::Pending && charge.net_amount.is_zero() {
                    charge.status = ChargeStatus::Paid;
                    charge.payment_method = Some(PaymentMethod::Credits);
                    charge.paid_at = Some(*at);
                    charge.updated_at = *at;
                }
            }
        }
        Event::ReservationCancelled {
            id,
            at,
            reason,
            charge_status,
            ..
        } => {
            if let Some(r) = cal.reservations.get_mut(id) {
                r.status = ReservationStatus::Cancelled;
                r.cancelled_at = Some(*at);
                r.cancellation_reason = reason.clone();
            }
            cal.remove_interval(*id);
            if let Some(status) = charge_status
                && let Some(charge_id) = cal.charge_index.get(&Chargeable::reservation(*id)).copied()
                && let Some(charge) = cal.charges.get_mut(&charge_id)
            {
                charge.status = *status;
                charge.updated_at = *at;
            }
        }
        Event::ReminderRecorded { id, at } => {
            if let Some(r) = cal.reservations.get_mut(id) {
                r.reminder_sent_at = Some(*at);
            }
        }
        Event::ChargeUpdated {
            id,
            status,
            payment_method,
            payment_reference,
            notes,
            at,
        } => {
            if let Some(charge) = cal.charges.get_mut(id) {
                charge.status = *status;
                if *status == ChargeStatus::Paid {
                    charge.paid_at = Some(*at);
                    charge.payment_method = *payment_method;
                    charge.payment_reference = payment_reference.clone();
                }
                if notes.is_some() {
                    charge.notes = notes.clone();
                }
                charge.updated_at = *at;
            }
        }
        Event::SeriesCreated { series } => {
            cal.series_instances.entry(series.id).or_default();
            cal.series.insert(series.id, series.clone());
        }
        Event::SeriesStatusChanged { id, status } => {
            if let Some(s) = cal.series.get_mut(id) {
                s.status = *status;
            }
        }
        Event::SeriesExtended { id, series_end_date } => {
            if let Some(s) = cal.series.get_mut(id) {
                s.series_end_date = *series_end_date;
            }
        }
        Event::ClosureAdded { closure } => {
            cal.insert_interval(Interval {
                id: closure.id,
                span: closure.span,
                kind: IntervalKind::Closure,
            });
            cal.closures.insert(closure.id, closure.clone());
        }
        Event::ClosureRemoved { id } => {
            cal.remove_interval(*id);
            cal.closures.remove(id);
        }
        Event::ProductionUpserted { production } => {
            cal.remove_interval(production.id);
            cal.insert_interval(Interval {
                id: production.id,
                span: production.span,
                kind: IntervalKind::Production,
            });
            cal.productions.insert(production.id, production.clone());
        }
        Event::ProductionRemoved { id } => {
            cal.remove_interval(*id);
            cal.productions.remove(id);
        }
        // Ledger and membership events don't touch the calendar
        Event::MemberUpserted { .. } | Event::CreditsRecorded { .. } => {}
    }
}

fn apply_to_account(account: &mut Account, event: &Event) {
    for txn in event.transactions() {
        debug_assert_eq!(txn.user_id, account.user_id);
        account.transactions.push(txn.clone());
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        policy: BookingPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            calendar: RwLock::new(Calendar::new()),
            accounts: DashMap::new(),
            members: DashMap::new(),
            wal_tx,
            notify,
            cache: EngineCache::new(policy.cache_ttl),
            policy,
        };

        // Sole owner during replay, so try_write never contends. Never block here:
        // lazy tenant creation runs inside the async runtime.
        {
            let mut cal = engine
                .calendar
                .try_write()
                .map_err(|_| io::Error::other("replay: calendar lock contended"))?;
            for event in &events {
                if let Event::MemberUpserted { profile, .. } = event {
                    engine.members.insert(profile.user_id, profile.clone());
                }
                apply_to_calendar(&mut cal, event);
                if let Some(user_id) = event.transactions().first().map(|t| t.user_id) {
                    let account = engine.account(user_id);
                    let mut guard = account
                        .try_write()
                        .map_err(|_| io::Error::other("replay: account lock contended"))?;
                    apply_to_account(&mut guard, event);
                }
            }
        }
        tracing::debug!(events = events.len(), path = %wal_path.display(), "engine replayed");

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Ledger account for a user, created empty on first touch.
    pub(super) fn account(&self, user_id: Ulid) -> SharedAccount {
        self.accounts
            .entry(user_id)
            .or_insert_with(|| Arc::new(RwLock::new(Account::new(user_id))))
            .clone()
    }

    /// WAL-append, then apply to whichever state the caller has locked, then notify.
    /// Nothing is applied when the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        calendar: Option<&mut Calendar>,
        account: Option<&mut Account>,
        user_id: Option<Ulid>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        if let Some(cal) = calendar {
            apply_to_calendar(cal, event);
        }
        if let Some(account) = account {
            apply_to_account(account, event);
        }
        if let Event::MemberUpserted { profile, .. } = event {
            self.members.insert(profile.user_id, profile.clone());
        }
        self.notify.publish(event, user_id);
        Ok(())
    }

    pub(super) async fn send_wal_command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(build(tx))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }
}

pub(crate) fn now() -> Timestamp {
    chrono::Utc::now()
}
