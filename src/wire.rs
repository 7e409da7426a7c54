use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::{NoticeResponse, NotificationResponse};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::JamroomAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{Notice, Topic};
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, ChargeUpdate, Command, SeriesChange, SqlError};
use crate::tenant::TenantManager;

/// One subscription made with LISTEN.
struct Listener {
    channel: String,
    rx: broadcast::Receiver<Notice>,
}

/// Statement handler for a single connection. LISTEN subscriptions live here and
/// are flushed to the client alongside each statement's response.
pub struct JamroomHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<JamroomQueryParser>,
    listeners: Mutex<Vec<Listener>>,
}

impl JamroomHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(JamroomQueryParser),
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("3D000", format!("space error: {e}")))
    }

    /// Parse, execute and time one statement.
    async fn run(
        &self,
        engine: &Engine,
        query: &str,
        format: Option<&Format>,
        notices: &mut Vec<ErrorInfo>,
    ) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format, notices).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(command = label, "statement failed: {e:?}");
        }
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: Option<&Format>,
        notices: &mut Vec<ErrorInfo>,
    ) -> PgWireResult<Vec<Response>> {
        let schema = |table: &str| schema_for(table, format);
        let response = match cmd {
            Command::UpsertMember { profiles } => {
                let count = profiles.len();
                for profile in profiles {
                    let user_id = profile.user_id;
                    if let Some(txn) = engine.upsert_member(profile).await.map_err(engine_err)? {
                        notices.push(notice(format!(
                            "granted {} extra free-hour blocks to member {user_id}",
                            txn.amount
                        )));
                    }
                }
                Response::Execution(Tag::new("INSERT").with_rows(count))
            }
            Command::SelectMembers { user_id } => {
                let members = match user_id {
                    Some(id) => engine.get_member(id).into_iter().collect(),
                    None => engine.list_members(),
                };
                rows(schema("members"), members, |enc, m| {
                    enc.encode_field(&m.user_id.to_string())?;
                    enc.encode_field(&m.name)?;
                    enc.encode_field(&m.sustaining)?;
                    enc.encode_field(&m.monthly_free_blocks)
                })
            }
            Command::CreateReservation { request } => {
                let reservation = engine.create_reservation(request).await.map_err(engine_err)?;
                debug!(reservation = %reservation.id, status = reservation.status.as_str(), "booked over the wire");
                Response::Execution(Tag::new("INSERT").with_rows(1))
            }
            Command::ConfirmReservation { id } => {
                engine.confirm_reservation(id).await.map_err(engine_err)?;
                Response::Execution(Tag::new("UPDATE").with_rows(1))
            }
            Command::CancelReservation { id, reason } => {
                engine.cancel_reservation(id, reason).await.map_err(engine_err)?;
                Response::Execution(Tag::new("UPDATE").with_rows(1))
            }
            Command::SelectReservations { id, filter } => {
                let found = match id {
                    Some(id) => engine
                        .get_reservation(id)
                        .await
                        .into_iter()
                        .filter(|r| filter.matches(r))
                        .collect(),
                    None => engine.list_reservations(&filter).await.map_err(engine_err)?,
                };
                rows(schema("reservations"), found, encode_reservation)
            }
            Command::SelectConflicts { start, end, exclude } => {
                let report = engine
                    .get_all_conflicts(start, end, exclude)
                    .await
                    .map_err(engine_err)?;
                rows(schema("conflicts"), report.iter().cloned().collect(), |enc, c| {
                    enc.encode_field(&c.kind.as_str())?;
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&ts(c.span.start))?;
                    enc.encode_field(&ts(c.span.end))?;
                    enc.encode_field(&c.label)
                })
            }
            Command::SelectAvailability { day, min_length } => {
                let slots = engine
                    .available_slots(day, min_length)
                    .await
                    .map_err(engine_err)?;
                rows(schema("availability"), slots, |enc, slot| {
                    enc.encode_field(&ts(slot.start))?;
                    enc.encode_field(&ts(slot.end))?;
                    enc.encode_field(&slot.duration().num_minutes())
                })
            }
            Command::SelectCost { user_id, start, end } => {
                let quote = engine
                    .calculate_reservation_cost(user_id, start, end)
                    .await
                    .map_err(engine_err)?;
                rows(schema("cost"), vec![quote], |enc, q| {
                    enc.encode_field(&user_id.to_string())?;
                    enc.encode_field(&ts(start))?;
                    enc.encode_field(&ts(end))?;
                    enc.encode_field(&q.total_hours.to_string())?;
                    enc.encode_field(&q.free_hours.to_string())?;
                    enc.encode_field(&q.paid_hours.to_string())?;
                    enc.encode_field(&q.free_blocks)?;
                    enc.encode_field(&q.gross.to_string())?;
                    enc.encode_field(&q.cost.to_string())
                })
            }
            Command::SelectBalances { user_id } => {
                let balances = engine.credit_balances(user_id).await;
                rows(schema("credit_balances"), balances, |enc, (credit_type, balance)| {
                    enc.encode_field(&user_id.to_string())?;
                    enc.encode_field(&credit_type.as_str())?;
                    enc.encode_field(balance)
                })
            }
            Command::SelectTransactions { user_id, credit_type } => {
                let txns = engine.credit_transactions(user_id, credit_type).await;
                rows(schema("credit_transactions"), txns, |enc, t| {
                    enc.encode_field(&t.id.to_string())?;
                    enc.encode_field(&t.user_id.to_string())?;
                    enc.encode_field(&t.credit_type.as_str())?;
                    enc.encode_field(&t.amount)?;
                    enc.encode_field(&t.source.as_str())?;
                    enc.encode_field(&t.reference.map(|r| r.to_string()))?;
                    enc.encode_field(&t.description)?;
                    enc.encode_field(&serde_json::to_string(&t.metadata).ok())?;
                    enc.encode_field(&ts(t.created_at))
                })
            }
            Command::AdjustCredit {
                user_id,
                credit_type,
                amount,
                description,
            } => {
                let balance = if amount < 0 {
                    engine
                        .deduct_credit(user_id, -amount, credit_type, CreditSource::AdminAdjustment, None, description)
                        .await
                } else {
                    engine
                        .add_credit(user_id, amount, credit_type, CreditSource::AdminAdjustment, None, description)
                        .await
                }
                .map_err(engine_err)?;
                notices.push(notice(format!(
                    "{} balance for {user_id} is now {balance}",
                    credit_type.as_str()
                )));
                Response::Execution(Tag::new("INSERT").with_rows(1))
            }
            Command::SelectCharges {
                id,
                user_id,
                reservation_id,
                status,
            } => {
                let charges: Vec<Charge> = if let Some(id) = id {
                    engine.get_charge(id).await.into_iter().collect()
                } else if let Some(reservation_id) = reservation_id {
                    engine.charge_for_reservation(reservation_id).await.into_iter().collect()
                } else {
                    engine.list_charges(user_id, status).await
                };
                let charges = charges
                    .into_iter()
                    .filter(|c| user_id.is_none_or(|u| c.user_id == u))
                    .filter(|c| status.is_none_or(|s| c.status == s))
                    .collect();
                rows(schema("charges"), charges, encode_charge)
            }
            Command::UpdateCharge { id, update } => {
                match update {
                    ChargeUpdate::Paid { method, reference, notes } => {
                        engine.mark_charge_paid(id, method, reference, notes).await
                    }
                    ChargeUpdate::Comped { notes } => engine.mark_charge_comped(id, notes).await,
                    ChargeUpdate::Refunded { notes } => engine.mark_charge_refunded(id, notes).await,
                }
                .map_err(engine_err)?;
                Response::Execution(Tag::new("UPDATE").with_rows(1))
            }
            Command::CreateSeries { request } => {
                let (series, warnings, report) = engine
                    .create_recurring_series(request)
                    .await
                    .map_err(engine_err)?;
                notices.extend(warnings.iter().map(|w| warning(w.to_string())));
                notices.push(notice(format!(
                    "series {} created {} reservations, skipped {} conflicting occurrences",
                    series.id,
                    report.created.len(),
                    report.skipped_conflicts
                )));
                Response::Execution(Tag::new("INSERT").with_rows(1))
            }
            Command::UpdateSeries { id, change } => {
                match change {
                    SeriesChange::Pause => {
                        engine.pause_recurring_series(id).await.map_err(engine_err)?;
                    }
                    SeriesChange::Resume => {
                        engine.resume_recurring_series(id).await.map_err(engine_err)?;
                    }
                    SeriesChange::Extend { series_end_date } => {
                        let (_, report) = engine
                            .extend_recurring_series(id, series_end_date, chrono::Utc::now())
                            .await
                            .map_err(engine_err)?;
                        if report.skipped_conflicts > 0 {
                            notices.push(warning(format!(
                                "{} occurrences of series {id} skipped due to conflicts",
                                report.skipped_conflicts
                            )));
                        }
                    }
                }
                Response::Execution(Tag::new("UPDATE").with_rows(1))
            }
            Command::CancelSeries { id, reason } => {
                let cancelled = engine
                    .cancel_recurring_series(id, reason, chrono::Utc::now())
                    .await
                    .map_err(engine_err)?;
                notices.push(notice(format!(
                    "cancelled {} upcoming reservations of series {id}",
                    cancelled.len()
                )));
                Response::Execution(Tag::new("UPDATE").with_rows(1))
            }
            Command::SelectSeries { id, user_id } => {
                let series: Vec<RecurringSeries> = match id {
                    Some(id) => engine
                        .get_series(id)
                        .await
                        .into_iter()
                        .filter(|s| user_id.is_none_or(|u| s.user_id == u))
                        .collect(),
                    None => engine.list_series(user_id).await,
                };
                rows(schema("recurring_series"), series, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.user_id.to_string())?;
                    enc.encode_field(&reservable_kind(&s.reservable))?;
                    enc.encode_field(&s.reservable.id.to_string())?;
                    enc.encode_field(&s.recurrence_rule)?;
                    enc.encode_field(&s.start_time.to_string())?;
                    enc.encode_field(&s.end_time.to_string())?;
                    enc.encode_field(&s.series_start_date.to_string())?;
                    enc.encode_field(&s.series_end_date.map(|d| d.to_string()))?;
                    enc.encode_field(&i64::from(s.max_advance_days))?;
                    enc.encode_field(&s.status.as_str())?;
                    enc.encode_field(&s.notes)?;
                    enc.encode_field(&ts(s.created_at))
                })
            }
            Command::SelectSeriesConflicts { request, occurrences } => {
                let warnings = engine
                    .validate_recurring_pattern(&request, occurrences)
                    .await
                    .map_err(engine_err)?;
                rows(schema("series_conflicts"), warnings, |enc, w| {
                    enc.encode_field(&ts(w.occurrence.start))?;
                    enc.encode_field(&ts(w.occurrence.end))?;
                    let (source, source_id, span, label) = match &w.source {
                        WarningSource::Booking(c) => (c.kind.as_str(), c.id, c.span, c.label.clone()),
                        WarningSource::Series { series_id, occurrence } => {
                            ("recurring_series", *series_id, *occurrence, "recurring series".to_string())
                        }
                    };
                    enc.encode_field(&source)?;
                    enc.encode_field(&source_id.to_string())?;
                    enc.encode_field(&ts(span.start))?;
                    enc.encode_field(&ts(span.end))?;
                    enc.encode_field(&label)
                })
            }
            Command::AddClosure { closure } => {
                let affected = engine.add_closure(closure).await.map_err(engine_err)?;
                notices.extend(affected.iter().map(|r| overlap_warning("closure", r)));
                Response::Execution(Tag::new("INSERT").with_rows(1))
            }
            Command::RemoveClosure { id } => {
                engine.remove_closure(id).await.map_err(engine_err)?;
                Response::Execution(Tag::new("DELETE").with_rows(1))
            }
            Command::SelectClosures => {
                let closures = engine.list_closures().await;
                rows(schema("closures"), closures, |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&ts(c.span.start))?;
                    enc.encode_field(&ts(c.span.end))?;
                    enc.encode_field(&c.closure_type.as_str())?;
                    enc.encode_field(&c.notes)
                })
            }
            Command::UpsertProduction { production } => {
                let affected = engine.upsert_production(production).await.map_err(engine_err)?;
                notices.extend(affected.iter().map(|r| overlap_warning("production", r)));
                Response::Execution(Tag::new("INSERT").with_rows(1))
            }
            Command::RemoveProduction { id } => {
                engine.remove_production(id).await.map_err(engine_err)?;
                Response::Execution(Tag::new("DELETE").with_rows(1))
            }
            Command::SelectProductions => {
                let productions = engine.list_productions().await;
                rows(schema("productions"), productions, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.title)?;
                    enc.encode_field(&ts(p.span.start))?;
                    enc.encode_field(&ts(p.span.end))
                })
            }
            Command::SelectUserStats { user_id } => {
                let stats = engine.user_stats(user_id, chrono::Utc::now()).await;
                rows(schema("user_stats"), vec![stats], |enc, s| {
                    enc.encode_field(&s.user_id.to_string())?;
                    enc.encode_field(&s.month)?;
                    enc.encode_field(&i64::from(s.reservations))?;
                    enc.encode_field(&s.hours_booked.to_string())?;
                    enc.encode_field(&s.free_hours_used.to_string())?;
                    enc.encode_field(&s.free_blocks_remaining)
                })
            }
            Command::Listen { channel } => {
                let topic = topic_for(&channel)?;
                let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
                if !listeners.iter().any(|l| l.channel == channel) {
                    let rx = engine.notify.subscribe(topic);
                    listeners.push(Listener { channel, rx });
                }
                Response::Execution(Tag::new("LISTEN"))
            }
            Command::Unlisten { channel } => {
                self.listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|l| l.channel != channel);
                Response::Execution(Tag::new("UNLISTEN"))
            }
            Command::UnlistenAll => {
                self.listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                Response::Execution(Tag::new("UNLISTEN"))
            }
        };
        Ok(vec![response])
    }

    /// Pending change-feed messages for this connection's LISTEN channels.
    fn drain_notifications(&self) -> Vec<NotificationResponse> {
        let pid = std::process::id() as i32;
        let mut out = Vec::new();
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter_mut() {
            loop {
                match listener.rx.try_recv() {
                    Ok(notice) => out.push(NotificationResponse::new(
                        pid,
                        listener.channel.clone(),
                        notice_payload(&notice),
                    )),
                    Err(TryRecvError::Lagged(missed)) => {
                        warn!(channel = %listener.channel, missed, "listener lagged, notifications dropped");
                    }
                    Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                }
            }
        }
        out
    }

    /// Send statement notices, then any notifications that arrived meanwhile.
    async fn flush<C>(&self, client: &mut C, notices: Vec<ErrorInfo>) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for info in notices {
            client
                .send(PgWireBackendMessage::NoticeResponse(NoticeResponse::from(info)))
                .await?;
        }
        for notification in self.drain_notifications() {
            client
                .send(PgWireBackendMessage::NotificationResponse(notification))
                .await?;
        }
        Ok(())
    }
}

fn topic_for(channel: &str) -> PgWireResult<Topic> {
    match channel.to_ascii_lowercase().as_str() {
        "calendar" => Ok(Topic::Calendar),
        "reminders" => Ok(Topic::Reminders),
        lower => {
            let id = lower.strip_prefix("user_").ok_or_else(|| {
                user_error(
                    "42000",
                    format!("invalid channel: {channel} (expected calendar, reminders or user_{{id}})"),
                )
            })?;
            Ulid::from_string(&id.to_ascii_uppercase())
                .map(Topic::User)
                .map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
        }
    }
}

fn notice_payload(notice: &Notice) -> String {
    let value = match notice {
        Notice::Changed(event) => serde_json::to_value(event),
        Notice::Reminder {
            reservation_id,
            user_id,
            message,
        } => Ok(serde_json::json!({
            "Reminder": {
                "reservation_id": reservation_id.to_string(),
                "user_id": user_id.to_string(),
                "message": message,
            }
        })),
    };
    match value {
        Ok(value) => value.to_string(),
        Err(e) => serde_json::json!({ "error": e.to_string() }).to_string(),
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_reservation(enc: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.user_id.to_string())?;
    enc.encode_field(&reservable_kind(&r.reservable))?;
    enc.encode_field(&r.reservable.id.to_string())?;
    enc.encode_field(&ts(r.span.start))?;
    enc.encode_field(&ts(r.span.end))?;
    enc.encode_field(&r.status.as_str())?;
    enc.encode_field(&r.hours_used.to_string())?;
    enc.encode_field(&r.free_hours_used.to_string())?;
    enc.encode_field(&r.free_blocks)?;
    enc.encode_field(&r.credits_deducted)?;
    enc.encode_field(&r.cost.to_string())?;
    enc.encode_field(&r.recurring_series_id.map(|s| s.to_string()))?;
    enc.encode_field(&r.notes)?;
    enc.encode_field(&r.cancellation_reason)?;
    enc.encode_field(&ts(r.created_at))?;
    enc.encode_field(&opt_ts(r.confirmed_at))?;
    enc.encode_field(&opt_ts(r.cancelled_at))?;
    enc.encode_field(&opt_ts(r.reminder_sent_at))
}

fn encode_charge(enc: &mut DataRowEncoder, c: &Charge) -> PgWireResult<()> {
    let credits: Vec<String> = c
        .credits_applied
        .iter()
        .map(|(credit_type, blocks)| format!("{}:{blocks}", credit_type.as_str()))
        .collect();
    enc.encode_field(&c.id.to_string())?;
    enc.encode_field(&c.chargeable.id.to_string())?;
    enc.encode_field(&c.user_id.to_string())?;
    enc.encode_field(&c.amount.to_string())?;
    enc.encode_field(&c.net_amount.to_string())?;
    enc.encode_field(&credits.join(","))?;
    enc.encode_field(&c.status.as_str())?;
    enc.encode_field(&c.payment_method.map(|m| m.as_str()))?;
    enc.encode_field(&c.payment_reference)?;
    enc.encode_field(&opt_ts(c.paid_at))?;
    enc.encode_field(&c.notes)?;
    enc.encode_field(&ts(c.created_at))?;
    enc.encode_field(&ts(c.updated_at))
}

fn ts(t: Timestamp) -> String {
    t.to_rfc3339()
}

fn opt_ts(t: Option<Timestamp>) -> Option<String> {
    t.map(ts)
}

fn reservable_kind(r: &Reservable) -> &'static str {
    match r.kind {
        ReservableKind::User => "user",
        ReservableKind::Band => "band",
    }
}

fn fields(columns: &[(&str, Type)], format: Option<&Format>) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = format.map_or(FieldFormat::Text, |f| f.format_for(i));
            FieldInfo::new((*name).into(), None, None, ty.clone(), field_format)
        })
        .collect()
}

/// Result columns of each queryable table, in the client's requested format.
/// Empty for anything else.
fn schema_for(table: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    use Type as T;
    let cols = |columns: &[(&str, Type)]| fields(columns, format);
    match table {
        "members" => cols(&[
            ("user_id", T::VARCHAR),
            ("name", T::VARCHAR),
            ("sustaining", T::BOOL),
            ("monthly_free_blocks", T::INT8),
        ]),
        "reservations" => cols(&[
            ("id", T::VARCHAR),
            ("user_id", T::VARCHAR),
            ("reservable_type", T::VARCHAR),
            ("reservable_id", T::VARCHAR),
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
            ("status", T::VARCHAR),
            ("hours_used", T::VARCHAR),
            ("free_hours_used", T::VARCHAR),
            ("free_blocks", T::INT8),
            ("credits_deducted", T::INT8),
            ("cost", T::VARCHAR),
            ("series_id", T::VARCHAR),
            ("notes", T::VARCHAR),
            ("cancellation_reason", T::VARCHAR),
            ("created_at", T::VARCHAR),
            ("confirmed_at", T::VARCHAR),
            ("cancelled_at", T::VARCHAR),
            ("reminder_sent_at", T::VARCHAR),
        ]),
        "conflicts" => cols(&[
            ("kind", T::VARCHAR),
            ("id", T::VARCHAR),
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
            ("label", T::VARCHAR),
        ]),
        "availability" => cols(&[
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
            ("minutes", T::INT8),
        ]),
        "cost" => cols(&[
            ("user_id", T::VARCHAR),
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
            ("total_hours", T::VARCHAR),
            ("free_hours", T::VARCHAR),
            ("paid_hours", T::VARCHAR),
            ("free_blocks", T::INT8),
            ("gross", T::VARCHAR),
            ("cost", T::VARCHAR),
        ]),
        "credit_balances" => cols(&[
            ("user_id", T::VARCHAR),
            ("credit_type", T::VARCHAR),
            ("balance", T::INT8),
        ]),
        "credit_transactions" => cols(&[
            ("id", T::VARCHAR),
            ("user_id", T::VARCHAR),
            ("credit_type", T::VARCHAR),
            ("amount", T::INT8),
            ("source", T::VARCHAR),
            ("reference", T::VARCHAR),
            ("description", T::VARCHAR),
            ("metadata", T::VARCHAR),
            ("created_at", T::VARCHAR),
        ]),
        "charges" => cols(&[
            ("id", T::VARCHAR),
            ("reservation_id", T::VARCHAR),
            ("user_id", T::VARCHAR),
            ("amount", T::VARCHAR),
            ("net_amount", T::VARCHAR),
            ("credits_applied", T::VARCHAR),
            ("status", T::VARCHAR),
            ("payment_method", T::VARCHAR),
            ("payment_reference", T::VARCHAR),
            ("paid_at", T::VARCHAR),
            ("notes", T::VARCHAR),
            ("created_at", T::VARCHAR),
            ("updated_at", T::VARCHAR),
        ]),
        "recurring_series" => cols(&[
            ("id", T::VARCHAR),
            ("user_id", T::VARCHAR),
            ("reservable_type", T::VARCHAR),
            ("reservable_id", T::VARCHAR),
            ("recurrence_rule", T::VARCHAR),
            ("start_time", T::VARCHAR),
            ("end_time", T::VARCHAR),
            ("series_start_date", T::VARCHAR),
            ("series_end_date", T::VARCHAR),
            ("max_advance_days", T::INT8),
            ("status", T::VARCHAR),
            ("notes", T::VARCHAR),
            ("created_at", T::VARCHAR),
        ]),
        "series_conflicts" => cols(&[
            ("occurrence_start", T::VARCHAR),
            ("occurrence_end", T::VARCHAR),
            ("source", T::VARCHAR),
            ("source_id", T::VARCHAR),
            ("source_start", T::VARCHAR),
            ("source_end", T::VARCHAR),
            ("label", T::VARCHAR),
        ]),
        "closures" => cols(&[
            ("id", T::VARCHAR),
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
            ("closure_type", T::VARCHAR),
            ("notes", T::VARCHAR),
        ]),
        "productions" => cols(&[
            ("id", T::VARCHAR),
            ("title", T::VARCHAR),
            ("start", T::VARCHAR),
            ("end", T::VARCHAR),
        ]),
        "user_stats" => cols(&[
            ("user_id", T::VARCHAR),
            ("month", T::VARCHAR),
            ("reservations", T::INT8),
            ("hours_booked", T::VARCHAR),
            ("free_hours_used", T::VARCHAR),
            ("free_blocks_remaining", T::INT8),
        ]),
        _ => Vec::new(),
    }
}

fn statement_schema(sql: &str, format: Option<&Format>) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .map(|table| schema_for(&table, format))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for JamroomHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let mut notices = Vec::new();
        let result = self.run(&engine, query, None, &mut notices).await;
        self.flush(client, notices).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct JamroomQueryParser;

#[async_trait]
impl QueryParser for JamroomQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        count_params(sql)?;
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)?])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format))
    }
}

#[async_trait]
impl ExtendedQueryHandler for JamroomHandler {
    type Statement = String;
    type QueryParser = JamroomQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal)?;
        let mut notices = Vec::new();
        let result = self
            .run(&engine, &sql, Some(&portal.result_column_format), &mut notices)
            .await;
        self.flush(client, notices).await?;
        result?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)?];
        Ok(DescribeStatementResponse::new(
            param_types,
            statement_schema(&target.statement, None),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            Some(&target.result_column_format),
        )))
    }
}

/// Highest placeholder index the protocol can bind (Bind carries an i16 count).
const MAX_PARAMS: usize = 65_535;

enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split `sql` into literal text and `$N` placeholders in one pass. Quoted
/// strings, quoted identifiers and comments are text even when they contain `$N`.
fn scan_placeholders(sql: &str) -> PgWireResult<Vec<Piece<'_>>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 2;
            }
            b'$' => {
                let digits = i + 1;
                let mut end = digits;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end == digits {
                    i += 1;
                    continue;
                }
                let index = sql[digits..end]
                    .parse::<usize>()
                    .ok()
                    .filter(|n| (1..=MAX_PARAMS).contains(n))
                    .ok_or_else(|| {
                        user_error("42P02", format!("there is no parameter {}", &sql[i..end]))
                    })?;
                pieces.push(Piece::Text(&sql[text_start..i]));
                pieces.push(Piece::Param(index));
                i = end;
                text_start = end;
            }
            _ => i += 1,
        }
    }
    pieces.push(Piece::Text(&sql[text_start..]));
    Ok(pieces)
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> PgWireResult<usize> {
    Ok(scan_placeholders(sql)?
        .iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(*n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0))
}

/// Replace placeholders with quoted literals of the bound values (text format).
/// Values are never rescanned, so a value containing `$N` stays as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> PgWireResult<String> {
    let mut out = String::with_capacity(sql.len());
    for piece in scan_placeholders(sql)? {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Param(n) => match params.get(n - 1) {
                Some(Some(value)) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                Some(None) => out.push_str("NULL"),
                None => {
                    return Err(user_error(
                        "08P01",
                        format!("${n} referenced but {} parameters bound", params.len()),
                    ));
                }
            },
        }
    }
    Ok(out)
}

fn substitute_params(portal: &Portal<String>) -> PgWireResult<String> {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

/// Handlers for one connection.
pub struct JamroomFactory {
    handler: Arc<JamroomHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<JamroomAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl JamroomFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = JamroomAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(JamroomHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for JamroomFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = JamroomFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn warning(message: String) -> ErrorInfo {
    ErrorInfo::new("WARNING".into(), "01000".into(), message)
}

fn notice(message: String) -> ErrorInfo {
    ErrorInfo::new("NOTICE".into(), "00000".into(), message)
}

fn overlap_warning(what: &str, r: &Reservation) -> ErrorInfo {
    warning(format!(
        "{what} overlaps reservation {} for {} at {}",
        r.id, r.reservable, r.span
    ))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
