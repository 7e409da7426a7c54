use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "jamroom_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "jamroom_query_duration_seconds";

// ── Resource utilization ────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "jamroom_connections_active";

pub const CONNECTIONS_TOTAL: &str = "jamroom_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "jamroom_connections_rejected_total";

/// Gauge: spaces with a loaded engine.
pub const TENANTS_ACTIVE: &str = "jamroom_tenants_active";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "jamroom_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "jamroom_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "jamroom_wal_compactions_total";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: reservations booked. Labels: status.
pub const RESERVATIONS_CREATED_TOTAL: &str = "jamroom_reservations_created_total";

pub const RESERVATIONS_CANCELLED_TOTAL: &str = "jamroom_reservations_cancelled_total";

/// Counter: free-hour blocks taken from the ledger.
pub const CREDITS_DEDUCTED_TOTAL: &str = "jamroom_credits_deducted_blocks_total";

pub const SERIES_INSTANCES_CREATED_TOTAL: &str = "jamroom_series_instances_created_total";

/// Counter: batch job runs. Labels: job, status.
pub const JOB_RUNS_TOTAL: &str = "jamroom_job_runs_total";

/// Counter: reminder rows handled. Labels: outcome.
pub const REMINDERS_TOTAL: &str = "jamroom_reminders_total";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertMember { .. } => "upsert_member",
        Command::SelectMembers { .. } => "select_members",
        Command::CreateReservation { .. } => "create_reservation",
        Command::ConfirmReservation { .. } => "confirm_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectCost { .. } => "select_cost",
        Command::SelectBalances { .. } => "select_balances",
        Command::SelectTransactions { .. } => "select_transactions",
        Command::AdjustCredit { .. } => "adjust_credit",
        Command::SelectCharges { .. } => "select_charges",
        Command::UpdateCharge { .. } => "update_charge",
        Command::CreateSeries { .. } => "create_series",
        Command::UpdateSeries { .. } => "update_series",
        Command::CancelSeries { .. } => "cancel_series",
        Command::SelectSeries { .. } => "select_series",
        Command::SelectSeriesConflicts { .. } => "select_series_conflicts",
        Command::AddClosure { .. } => "add_closure",
        Command::RemoveClosure { .. } => "remove_closure",
        Command::SelectClosures => "select_closures",
        Command::UpsertProduction { .. } => "upsert_production",
        Command::RemoveProduction { .. } => "remove_production",
        Command::SelectProductions => "select_productions",
        Command::SelectUserStats { .. } => "select_user_stats",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
