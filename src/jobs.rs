//! Periodic batch work for one space: rolling series generation, monthly credit
//! allocation, confirmation reminders and WAL compaction. Every job is safe to
//! re-run after a partial failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::{AllocationReport, Engine, GenerationSummary};
use crate::model::{Reservation, Timestamp};
use crate::notify::{Notice, NotifyHub, Topic};

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// A confirmation reminder ready to hand to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub reservation_id: Ulid,
    pub user_id: Ulid,
    pub starts_at: Timestamp,
    pub message: String,
}

/// Where reminders go. Delivery failures are returned, never panicked on.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn deliver(&self, reminder: &Reminder) -> Result<(), String>;
}

/// Publishes reminders on the space's change feed.
pub struct HubReminderSink {
    hub: Arc<NotifyHub>,
}

impl HubReminderSink {
    pub fn new(hub: Arc<NotifyHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl ReminderSink for HubReminderSink {
    async fn deliver(&self, reminder: &Reminder) -> Result<(), String> {
        info!(reservation = %reminder.reservation_id, user = %reminder.user_id, "{}", reminder.message);
        self.hub.send(
            Topic::Reminders,
            &Notice::Reminder {
                reservation_id: reminder.reservation_id,
                user_id: reminder.user_id,
                message: reminder.message.clone(),
            },
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReminderOutcome {
    Sent,
    Failed(String),
    DryRun,
}

impl ReminderOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReminderOutcome::Sent => "sent",
            ReminderOutcome::Failed(_) => "failed",
            ReminderOutcome::DryRun => "dry_run",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReminderReport {
    pub rows: Vec<(Ulid, ReminderOutcome)>,
}

impl ReminderReport {
    pub fn count(&self, outcome: &str) -> usize {
        self.rows.iter().filter(|(_, o)| o.label() == outcome).count()
    }
}

fn reminder_for(engine: &Engine, reservation: &Reservation) -> Reminder {
    let local = reservation.span.start.with_timezone(&engine.policy.timezone);
    Reminder {
        reservation_id: reservation.id,
        user_id: reservation.user_id,
        starts_at: reservation.span.start,
        message: format!(
            "Please confirm your practice space reservation on {}",
            local.format("%A %B %-d at %-I:%M %p")
        ),
    }
}

/// Remind every scheduled reservation inside the reminder lead that hasn't been
/// reminded yet. Each row's outcome stands alone; delivered rows are marked so a
/// re-run skips them. A dry run delivers and marks nothing.
pub async fn send_confirmation_reminders(
    engine: &Engine,
    sink: &dyn ReminderSink,
    at: Timestamp,
    dry_run: bool,
) -> ReminderReport {
    let mut report = ReminderReport::default();
    for reservation in engine.reminder_candidates(at).await {
        let reminder = reminder_for(engine, &reservation);
        let outcome = if dry_run {
            debug!(reservation = %reservation.id, "dry run: {}", reminder.message);
            ReminderOutcome::DryRun
        } else {
            match sink.deliver(&reminder).await {
                Ok(()) => {
                    if let Err(e) = engine.record_reminder_sent(reservation.id, at).await {
                        warn!(reservation = %reservation.id, "reminder sent but not recorded: {e}");
                    }
                    ReminderOutcome::Sent
                }
                Err(reason) => {
                    warn!(reservation = %reservation.id, "reminder failed: {reason}");
                    ReminderOutcome::Failed(reason)
                }
            }
        };
        metrics::counter!(crate::observability::REMINDERS_TOTAL, "outcome" => outcome.label())
            .increment(1);
        report.rows.push((reservation.id, outcome));
    }
    info!(
        sent = report.count("sent"),
        failed = report.count("failed"),
        dry_run = report.count("dry_run"),
        "confirmation reminders processed"
    );
    report
}

/// What one scheduler tick did. A `None` job failed as a whole and was logged.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub generation: Option<GenerationSummary>,
    pub allocation: Option<AllocationReport>,
    pub reminders: ReminderReport,
}

fn record_run<T, E: std::fmt::Display>(job: &'static str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => {
            metrics::counter!(crate::observability::JOB_RUNS_TOTAL, "job" => job, "status" => "ok")
                .increment(1);
            Some(value)
        }
        Err(e) => {
            metrics::counter!(crate::observability::JOB_RUNS_TOTAL, "job" => job, "status" => "error")
                .increment(1);
            error!(job, "batch job failed: {e}");
            None
        }
    }
}

/// One pass of every periodic job. A failing job never prevents the others.
pub async fn run_batch(engine: &Engine, sink: &dyn ReminderSink, at: Timestamp) -> BatchReport {
    let generation = record_run(
        "recurring_generation",
        engine.generate_future_recurring_instances(at).await,
    );
    if let Some(summary) = &generation {
        info!(
            scanned = summary.series_scanned,
            created = summary.created,
            completed = summary.series_completed,
            skipped_conflicts = summary.skipped_conflicts,
            "recurring generation finished"
        );
    }
    let allocation = record_run("monthly_allocation", engine.allocate_monthly_credits(at).await);
    let reminders = send_confirmation_reminders(engine, sink, at, false).await;
    BatchReport {
        generation,
        allocation,
        reminders,
    }
}

/// Scheduler loop for one space.
pub async fn run_scheduler(engine: Arc<Engine>, sink: Arc<dyn ReminderSink>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        run_batch(&engine, sink.as_ref(), chrono::Utc::now()).await;
    }
}

/// Compact the WAL whenever `threshold` appends have piled up on top of the last snapshot.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    let mut snapshot_len = 0;
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < snapshot_len + threshold {
            continue;
        }
        debug!(appends, threshold, "compaction threshold reached");
        match engine.compact_wal().await {
            Ok(len) => snapshot_len = len,
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BookingPolicy;
    use crate::engine::ReservationRequest;
    use chrono::{TimeDelta, Utc};
    use std::path::PathBuf;
    use std::sync::Mutex;

    fn test_engine(name: &str) -> Engine {
        let dir = std::env::temp_dir().join("jamroom_test_jobs");
        std::fs::create_dir_all(&dir).unwrap();
        let path: PathBuf = dir.join(name);
        let _ = std::fs::remove_file(&path);
        Engine::new(path, Arc::new(NotifyHub::new()), BookingPolicy::default()).unwrap()
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<Reminder>>,
        fail: bool,
    }

    #[async_trait]
    impl ReminderSink for RecordingSink {
        async fn deliver(&self, reminder: &Reminder) -> Result<(), String> {
            if self.fail {
                return Err("mail server down".into());
            }
            self.delivered.lock().unwrap().push(reminder.clone());
            Ok(())
        }
    }

    async fn scheduled_in(engine: &Engine, days: i64) -> Reservation {
        let start = Utc::now() + TimeDelta::days(days);
        engine
            .create_reservation(ReservationRequest::new(Ulid::new(), start, start + TimeDelta::hours(2)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reminds_each_scheduled_reservation_once() {
        let engine = test_engine("reminders_once.wal");
        let soon = scheduled_in(&engine, 4).await;
        let later = scheduled_in(&engine, 12).await;
        assert_eq!(soon.status, crate::model::ReservationStatus::Scheduled);

        let sink = RecordingSink::default();
        let report = send_confirmation_reminders(&engine, &sink, Utc::now(), false).await;
        assert_eq!(report.rows, vec![(soon.id, ReminderOutcome::Sent)]);
        let delivered = sink.delivered.lock().unwrap().clone();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].message.starts_with("Please confirm"));
        assert!(engine.get_reservation(soon.id).await.unwrap().reminder_sent_at.is_some());
        assert!(engine.get_reservation(later.id).await.unwrap().reminder_sent_at.is_none());

        let again = send_confirmation_reminders(&engine, &sink, Utc::now(), false).await;
        assert!(again.rows.is_empty());
    }

    #[tokio::test]
    async fn dry_run_and_failures_leave_rows_unmarked() {
        let engine = test_engine("reminders_dry.wal");
        let r = scheduled_in(&engine, 4).await;

        let sink = RecordingSink::default();
        let report = send_confirmation_reminders(&engine, &sink, Utc::now(), true).await;
        assert_eq!(report.count("dry_run"), 1);
        assert!(sink.delivered.lock().unwrap().is_empty());

        let broken = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let report = send_confirmation_reminders(&engine, &broken, Utc::now(), false).await;
        assert_eq!(report.count("failed"), 1);
        assert!(engine.get_reservation(r.id).await.unwrap().reminder_sent_at.is_none());

        let report = send_confirmation_reminders(&engine, &sink, Utc::now(), false).await;
        assert_eq!(report.count("sent"), 1);
    }

    #[tokio::test]
    async fn hub_sink_publishes_reminders() {
        let hub = Arc::new(NotifyHub::new());
        let mut rx = hub.subscribe(Topic::Reminders);
        let sink = HubReminderSink::new(hub);
        let reminder = Reminder {
            reservation_id: Ulid::new(),
            user_id: Ulid::new(),
            starts_at: Utc::now(),
            message: "Please confirm".into(),
        };
        sink.deliver(&reminder).await.unwrap();
        let Notice::Reminder { reservation_id, .. } = rx.recv().await.unwrap() else {
            panic!("expected reminder notice");
        };
        assert_eq!(reservation_id, reminder.reservation_id);
    }

    #[tokio::test]
    async fn batch_runs_every_job() {
        let engine = test_engine("batch.wal");
        let member = Ulid::new();
        engine
            .upsert_member(crate::model::MemberProfile {
                user_id: member,
                name: None,
                sustaining: true,
                monthly_free_blocks: 8,
            })
            .await
            .unwrap();
        scheduled_in(&engine, 4).await;

        let sink = RecordingSink::default();
        let report = run_batch(&engine, &sink, Utc::now()).await;
        assert_eq!(report.generation.unwrap().series_scanned, 0);
        assert_eq!(report.allocation.unwrap().allocated, 1);
        assert_eq!(report.reminders.count("sent"), 1);
        assert_eq!(
            engine
                .get_credit_balance(member, crate::model::CreditType::FreeHours)
                .await,
            8
        );
    }
}
