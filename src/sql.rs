use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta};
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{ReservationFilter, ReservationRequest, SeriesRequest};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, Clone)]
pub enum Command {
    /// One or more membership rows pushed by the membership collaborator.
    UpsertMember {
        profiles: Vec<MemberProfile>,
    },
    SelectMembers {
        user_id: Option<Ulid>,
    },
    CreateReservation {
        request: ReservationRequest,
    },
    ConfirmReservation {
        id: Ulid,
    },
    /// `DELETE FROM reservations` cancels; nothing is ever hard-deleted.
    CancelReservation {
        id: Ulid,
        reason: Option<String>,
    },
    SelectReservations {
        id: Option<Ulid>,
        filter: ReservationFilter,
    },
    SelectConflicts {
        start: Timestamp,
        end: Timestamp,
        exclude: Option<Ulid>,
    },
    SelectAvailability {
        day: NaiveDate,
        min_length: Option<TimeDelta>,
    },
    SelectCost {
        user_id: Ulid,
        start: Timestamp,
        end: Timestamp,
    },
    SelectBalances {
        user_id: Ulid,
    },
    SelectTransactions {
        user_id: Ulid,
        credit_type: Option<CreditType>,
    },
    /// Signed admin adjustment. Negative amounts must be covered by the balance.
    AdjustCredit {
        user_id: Ulid,
        credit_type: CreditType,
        amount: i64,
        description: Option<String>,
    },
    SelectCharges {
        id: Option<Ulid>,
        user_id: Option<Ulid>,
        reservation_id: Option<Ulid>,
        status: Option<ChargeStatus>,
    },
    UpdateCharge {
        id: Ulid,
        update: ChargeUpdate,
    },
    CreateSeries {
        request: SeriesRequest,
    },
    UpdateSeries {
        id: Ulid,
        change: SeriesChange,
    },
    CancelSeries {
        id: Ulid,
        reason: Option<String>,
    },
    SelectSeries {
        id: Option<Ulid>,
        user_id: Option<Ulid>,
    },
    /// Dry run of a recurring pattern: every projected collision, nothing written.
    SelectSeriesConflicts {
        request: SeriesRequest,
        occurrences: Option<usize>,
    },
    AddClosure {
        closure: SpaceClosure,
    },
    RemoveClosure {
        id: Ulid,
    },
    SelectClosures,
    UpsertProduction {
        production: Production,
    },
    RemoveProduction {
        id: Ulid,
    },
    SelectProductions,
    SelectUserStats {
        user_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

/// Outcome the payment collaborator records on a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeUpdate {
    Paid {
        method: PaymentMethod,
        reference: Option<String>,
        notes: Option<String>,
    },
    Comped {
        notes: Option<String>,
    },
    Refunded {
        notes: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesChange {
    Pause,
    Resume,
    /// `None` makes the series open-ended.
    Extend { series_end_date: Option<NaiveDate> },
}

// Column order assumed when an INSERT names no columns.
const MEMBER_COLUMNS: &[&str] = &["user_id", "name", "sustaining", "monthly_free_blocks"];
const RESERVATION_COLUMNS: &[&str] = &["id", "user_id", "start", "end", "status", "band_id", "notes"];
const TRANSACTION_COLUMNS: &[&str] = &["user_id", "credit_type", "amount", "description"];
const SERIES_COLUMNS: &[&str] = &[
    "id",
    "user_id",
    "recurrence_rule",
    "start_time",
    "end_time",
    "series_start_date",
    "series_end_date",
    "max_advance_days",
    "band_id",
    "notes",
];
const CLOSURE_COLUMNS: &[&str] = &["id", "start", "end", "closure_type", "notes"];
const PRODUCTION_COLUMNS: &[&str] = &["id", "title", "start", "end"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(channel) = strip_keyword(trimmed, "LISTEN ") {
        return Ok(Command::Listen { channel });
    }
    if let Some(channel) = strip_keyword(trimmed, "UNLISTEN ") {
        if channel == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Channel name following a case-insensitive `keyword`.
fn strip_keyword(sql: &str, keyword: &str) -> Option<String> {
    let prefix = sql.get(..keyword.len())?;
    if !prefix.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let channel = sql[keyword.len()..].trim().trim_matches('"');
    Some(channel.to_string())
}

/// The logical table a SELECT reads from, if `sql` is one. Placeholders are
/// fine here, which is what statement description needs.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "members" => {
            let rows = insert_rows(insert, "members", MEMBER_COLUMNS)?;
            let mut profiles = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                profiles.push(member_row(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?);
            }
            Ok(Command::UpsertMember { profiles })
        }
        "reservations" => {
            let row = single_row(insert, "reservations", RESERVATION_COLUMNS)?;
            let user_id = parse_ulid_expr(row.required("user_id")?)?;
            let mut request = ReservationRequest::new(
                user_id,
                parse_timestamp_expr(row.required("start")?)?,
                parse_timestamp_expr(row.required("end")?)?,
            );
            if let Some(id) = row.optional("id") {
                request.id = parse_ulid_expr(id)?;
            }
            request.reservable = row
                .optional("band_id")
                .map(parse_ulid_expr)
                .transpose()?
                .map(Reservable::band);
            request.status = row
                .optional("status")
                .map(|e| parse_keyword(e, "reservation status", ReservationStatus::parse))
                .transpose()?;
            request.notes = row.optional("notes").map(parse_string_expr).transpose()?;
            Ok(Command::CreateReservation { request })
        }
        "credit_transactions" => {
            let row = single_row(insert, "credit_transactions", TRANSACTION_COLUMNS)?;
            Ok(Command::AdjustCredit {
                user_id: parse_ulid_expr(row.required("user_id")?)?,
                credit_type: match row.optional("credit_type") {
                    Some(e) => parse_keyword(e, "credit type", CreditType::parse)?,
                    None => CreditType::FreeHours,
                },
                amount: parse_i64_expr(row.required("amount")?)?,
                description: row.optional("description").map(parse_string_expr).transpose()?,
            })
        }
        "recurring_series" => {
            let row = single_row(insert, "recurring_series", SERIES_COLUMNS)?;
            let mut request = SeriesRequest::new(
                parse_ulid_expr(row.required("user_id")?)?,
                parse_string_expr(row.required("recurrence_rule")?)?,
                parse_time_expr(row.required("start_time")?)?,
                parse_time_expr(row.required("end_time")?)?,
                parse_date_expr(row.required("series_start_date")?)?,
            );
            if let Some(id) = row.optional("id") {
                request.id = parse_ulid_expr(id)?;
            }
            request.series_end_date = row.optional("series_end_date").map(parse_date_expr).transpose()?;
            request.max_advance_days = row.optional("max_advance_days").map(parse_u32).transpose()?;
            request.reservable = row
                .optional("band_id")
                .map(parse_ulid_expr)
                .transpose()?
                .map(Reservable::band);
            request.notes = row.optional("notes").map(parse_string_expr).transpose()?;
            Ok(Command::CreateSeries { request })
        }
        "closures" => {
            let row = single_row(insert, "closures", CLOSURE_COLUMNS)?;
            let start = parse_timestamp_expr(row.required("start")?)?;
            let end = parse_timestamp_expr(row.required("end")?)?;
            Ok(Command::AddClosure {
                closure: SpaceClosure {
                    id: row.optional("id").map(parse_ulid_expr).transpose()?.unwrap_or_else(Ulid::new),
                    span: span_of(start, end)?,
                    closure_type: match row.optional("closure_type") {
                        Some(e) => parse_keyword(e, "closure type", ClosureType::parse)?,
                        None => ClosureType::Other,
                    },
                    notes: row.optional("notes").map(parse_string_expr).transpose()?,
                },
            })
        }
        "productions" => {
            let row = single_row(insert, "productions", PRODUCTION_COLUMNS)?;
            let start = parse_timestamp_expr(row.required("start")?)?;
            let end = parse_timestamp_expr(row.required("end")?)?;
            Ok(Command::UpsertProduction {
                production: Production {
                    id: parse_ulid_expr(row.required("id")?)?,
                    title: parse_string_expr(row.required("title")?)?,
                    span: span_of(start, end)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn member_row(row: &Row<'_>) -> Result<MemberProfile, SqlError> {
    Ok(MemberProfile {
        user_id: parse_ulid_expr(row.required("user_id")?)?,
        name: row.optional("name").map(parse_string_expr).transpose()?,
        sustaining: row.optional("sustaining").map(parse_bool).transpose()?.unwrap_or(false),
        monthly_free_blocks: row
            .optional("monthly_free_blocks")
            .map(parse_i64_expr)
            .transpose()?
            .unwrap_or(0),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let set = Assignments::of(assignments)?;

    match table.as_str() {
        "reservations" => {
            let status = set.required_keyword("reservations", "status", "reservation status", ReservationStatus::parse)?;
            match status {
                ReservationStatus::Confirmed => Ok(Command::ConfirmReservation { id }),
                ReservationStatus::Cancelled => Ok(Command::CancelReservation {
                    id,
                    reason: set.text("cancellation_reason")?,
                }),
                other => Err(SqlError::Unsupported(format!(
                    "setting reservation status to {}",
                    other.as_str()
                ))),
            }
        }
        "charges" => {
            let status = set.required_keyword("charges", "status", "charge status", ChargeStatus::parse)?;
            let notes = set.text("notes")?;
            let update = match status {
                ChargeStatus::Paid => ChargeUpdate::Paid {
                    method: set.required_keyword("charges", "payment_method", "payment method", PaymentMethod::parse)?,
                    reference: set.text("payment_reference")?,
                    notes,
                },
                ChargeStatus::Comped => ChargeUpdate::Comped { notes },
                ChargeStatus::Refunded => ChargeUpdate::Refunded { notes },
                other => {
                    return Err(SqlError::Unsupported(format!(
                        "setting charge status to {}",
                        other.as_str()
                    )));
                }
            };
            Ok(Command::UpdateCharge { id, update })
        }
        "recurring_series" => {
            if let Some(end) = set.get("series_end_date") {
                let series_end_date = if is_null(end) { None } else { Some(parse_date_expr(end)?) };
                return Ok(Command::UpdateSeries {
                    id,
                    change: SeriesChange::Extend { series_end_date },
                });
            }
            let status = set.required_keyword("recurring_series", "status", "series status", SeriesStatus::parse)?;
            match status {
                SeriesStatus::Paused => Ok(Command::UpdateSeries { id, change: SeriesChange::Pause }),
                SeriesStatus::Active => Ok(Command::UpdateSeries { id, change: SeriesChange::Resume }),
                SeriesStatus::Cancelled => Ok(Command::CancelSeries {
                    id,
                    reason: set.text("cancellation_reason")?,
                }),
                SeriesStatus::Completed => Err(SqlError::Unsupported(
                    "series are completed by the scheduler".into(),
                )),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `SET column = value` pairs of an UPDATE.
struct Assignments<'a> {
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Assignments<'a> {
    fn of(assignments: &'a [ast::Assignment]) -> Result<Self, SqlError> {
        let mut pairs = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let AssignmentTarget::ColumnName(name) = &assignment.target else {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            };
            let column = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?;
            pairs.push((column, &assignment.value));
        }
        Ok(Self { pairs })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.pairs.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn text(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column)
            .filter(|e| !is_null(e))
            .map(parse_string_expr)
            .transpose()
    }

    fn required_keyword<T>(
        &self,
        table: &'static str,
        column: &'static str,
        what: &str,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<T, SqlError> {
        let expr = self
            .get(column)
            .filter(|e| !is_null(e))
            .ok_or(SqlError::MissingColumn(table, column))?;
        parse_keyword(expr, what, parse)
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "reservations" => Ok(Command::CancelReservation { id, reason: None }),
        "recurring_series" => Ok(Command::CancelSeries { id, reason: None }),
        "closures" => Ok(Command::RemoveClosure { id }),
        "productions" => Ok(Command::RemoveProduction { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::of(select.selection.as_ref())?;

    match table.as_str() {
        "members" => Ok(Command::SelectMembers {
            user_id: filters.ulid("user_id")?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            id: filters.ulid("id")?,
            filter: ReservationFilter {
                user_id: filters.ulid("user_id")?,
                reservable: filters.ulid("band_id")?.map(Reservable::band),
                series_id: filters.ulid("series_id")?,
                status: filters
                    .eq("status")
                    .map(|e| parse_keyword(e, "reservation status", ReservationStatus::parse))
                    .transpose()?,
                from: filters.lower("start").map(parse_timestamp_expr).transpose()?,
                to: filters.upper("end").map(parse_timestamp_expr).transpose()?,
            },
        }),
        "conflicts" => Ok(Command::SelectConflicts {
            start: filters.required("start", Filters::lower).and_then(parse_timestamp_expr)?,
            end: filters.required("end", Filters::upper).and_then(parse_timestamp_expr)?,
            exclude: filters.ulid("exclude")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            day: filters.required("day", Filters::eq).and_then(parse_date_expr)?,
            min_length: filters
                .eq("min_minutes")
                .map(parse_i64_expr)
                .transpose()?
                .map(TimeDelta::minutes),
        }),
        "cost" => Ok(Command::SelectCost {
            user_id: filters.required_ulid("user_id")?,
            start: filters.required("start", Filters::lower).and_then(parse_timestamp_expr)?,
            end: filters.required("end", Filters::upper).and_then(parse_timestamp_expr)?,
        }),
        "credit_balances" => Ok(Command::SelectBalances {
            user_id: filters.required_ulid("user_id")?,
        }),
        "credit_transactions" => Ok(Command::SelectTransactions {
            user_id: filters.required_ulid("user_id")?,
            credit_type: filters
                .eq("credit_type")
                .map(|e| parse_keyword(e, "credit type", CreditType::parse))
                .transpose()?,
        }),
        "charges" => Ok(Command::SelectCharges {
            id: filters.ulid("id")?,
            user_id: filters.ulid("user_id")?,
            reservation_id: filters.ulid("reservation_id")?,
            status: filters
                .eq("status")
                .map(|e| parse_keyword(e, "charge status", ChargeStatus::parse))
                .transpose()?,
        }),
        "recurring_series" => Ok(Command::SelectSeries {
            id: filters.ulid("id")?,
            user_id: filters.ulid("user_id")?,
        }),
        "series_conflicts" => {
            let mut request = SeriesRequest::new(
                filters.required_ulid("user_id")?,
                filters.required("recurrence_rule", Filters::eq).and_then(parse_string_expr)?,
                filters.required("start_time", Filters::eq).and_then(parse_time_expr)?,
                filters.required("end_time", Filters::eq).and_then(parse_time_expr)?,
                filters.required("series_start_date", Filters::eq).and_then(parse_date_expr)?,
            );
            request.series_end_date = filters.eq("series_end_date").map(parse_date_expr).transpose()?;
            request.reservable = filters.ulid("band_id")?.map(Reservable::band);
            let occurrences = filters
                .eq("occurrences")
                .map(parse_u32)
                .transpose()?
                .map(|n| n as usize);
            Ok(Command::SelectSeriesConflicts { request, occurrences })
        }
        "closures" => Ok(Command::SelectClosures),
        "productions" => Ok(Command::SelectProductions),
        "user_stats" => Ok(Command::SelectUserStats {
            user_id: filters.required_ulid("user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cmp {
    Eq,
    /// `>=` or `>`
    Lower,
    /// `<=` or `<`
    Upper,
}

/// Conjunction of `column <op> value` predicates from a WHERE clause.
struct Filters<'a> {
    predicates: Vec<(String, Cmp, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn of(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut predicates = Vec::new();
        if let Some(expr) = selection {
            collect_predicates(expr, &mut predicates)?;
        }
        Ok(Self { predicates })
    }

    fn find(&self, column: &str, cmp: Cmp) -> Option<&'a Expr> {
        self.predicates
            .iter()
            .find(|(c, op, _)| c == column && *op == cmp)
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, Cmp::Eq)
    }

    fn lower(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, Cmp::Lower).or_else(|| self.eq(column))
    }

    fn upper(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, Cmp::Upper).or_else(|| self.eq(column))
    }

    fn required(
        &self,
        column: &'static str,
        lookup: impl Fn(&Self, &str) -> Option<&'a Expr>,
    ) -> Result<&'a Expr, SqlError> {
        lookup(self, column).ok_or(SqlError::MissingFilter(column))
    }

    fn ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq(column).map(parse_ulid_expr).transpose()
    }

    fn required_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.ulid(column)?.ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_predicates<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, Cmp, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                BinaryOperator::And => {
                    collect_predicates(left, out)?;
                    return collect_predicates(right, out);
                }
                BinaryOperator::Eq => Cmp::Eq,
                BinaryOperator::GtEq | BinaryOperator::Gt => Cmp::Lower,
                BinaryOperator::LtEq | BinaryOperator::Lt => Cmp::Upper,
                other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("WHERE {left}")))?;
            out.push((column, cmp, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// One VALUES row addressed by column name.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Present and not NULL.
    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.get(column).filter(|e| !is_null(e))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    known: &[&str],
) -> Result<Vec<Row<'a>>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        known.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }

    let rows = extract_all_insert_rows(insert)?;
    let mut out = Vec::with_capacity(rows.len());
    for values in rows {
        // positional inserts may leave trailing optional columns off
        let arity_ok = if insert.columns.is_empty() {
            values.len() <= columns.len()
        } else {
            values.len() == columns.len()
        };
        if !arity_ok {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        out.push(Row {
            table,
            columns: columns.clone(),
            values,
        });
    }
    Ok(out)
}

fn single_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    known: &[&str],
) -> Result<Row<'a>, SqlError> {
    let mut rows = insert_rows(insert, table, known)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    rows.pop().ok_or(SqlError::Parse("empty VALUES".into()))
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = Filters::of(selection.as_ref())?;
    filters.required_ulid("id")
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn span_of(start: Timestamp, end: Timestamp) -> Result<Span, SqlError> {
    if start >= end {
        return Err(SqlError::Parse("start must be before end".into()));
    }
    Ok(Span::new(start, end))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::EscapedStringLiteral(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_keyword<T>(expr: &Expr, what: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T, SqlError> {
    let s = parse_string_expr(expr)?;
    parse(&s).ok_or_else(|| SqlError::Parse(format!("unknown {what}: {s}")))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// RFC 3339, or the `2026-11-03 18:00:00+00` form Postgres clients print.
pub fn parse_timestamp(s: &str) -> Result<Timestamp, SqlError> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%#z"))
        .map(|dt| dt.to_utc())
        .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")))
}

fn parse_timestamp_expr(expr: &Expr) -> Result<Timestamp, SqlError> {
    parse_timestamp(&parse_string_expr(expr)?)
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string_expr(expr)?;
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing value for {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_reservation() {
        let sql = format!(
            r#"INSERT INTO reservations (id, user_id, start, "end", notes) VALUES ('{ID}', '{OTHER}', '2026-11-03T18:00:00Z', '2026-11-03T20:00:00Z', 'drums')"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::CreateReservation { request } => {
                assert_eq!(request.id.to_string(), ID);
                assert_eq!(request.user_id.to_string(), OTHER);
                assert_eq!((request.end - request.start).num_hours(), 2);
                assert_eq!(request.status, None);
                assert_eq!(request.reservable, None);
                assert_eq!(request.notes.as_deref(), Some("drums"));
            }
            _ => panic!("expected CreateReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation_for_band_deferred() {
        let sql = format!(
            r#"INSERT INTO reservations (user_id, start, "end", status, band_id) VALUES ('{OTHER}', '2026-11-03 18:00:00+00', '2026-11-03 19:30:00+00', 'reserved', '{ID}')"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::CreateReservation { request } => {
                assert_eq!(request.status, Some(ReservationStatus::Reserved));
                assert_eq!(request.reservable, Some(Reservable::band(Ulid::from_string(ID).unwrap())));
                assert_eq!((request.end - request.start).num_minutes(), 90);
            }
            _ => panic!("expected CreateReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation_missing_end() {
        let sql = format!("INSERT INTO reservations (user_id, start) VALUES ('{OTHER}', '2026-11-03T18:00:00Z')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("reservations", "end"))
        ));
    }

    #[test]
    fn parse_insert_members_batch() {
        let sql = format!(
            "INSERT INTO members (user_id, sustaining, monthly_free_blocks) VALUES ('{ID}', true, 8), ('{OTHER}', false, 0)"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpsertMember { profiles } => {
                assert_eq!(profiles.len(), 2);
                assert!(profiles[0].sustaining);
                assert_eq!(profiles[0].monthly_free_blocks, 8);
                assert!(!profiles[1].sustaining);
                assert_eq!(profiles[1].name, None);
            }
            _ => panic!("expected UpsertMember, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_positional_member_insert() {
        let sql = format!("INSERT INTO members VALUES ('{ID}', 'Robin', 't', 4)");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::UpsertMember { profiles } => {
                assert_eq!(profiles[0].name.as_deref(), Some("Robin"));
                assert!(profiles[0].sustaining);
                assert_eq!(profiles[0].monthly_free_blocks, 4);
            }
            _ => panic!("expected UpsertMember, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_unknown_column_errors() {
        let sql = format!("INSERT INTO members (user_id, tier) VALUES ('{ID}', 'gold')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("members", _))));
    }

    #[test]
    fn parse_negative_credit_adjustment() {
        let sql = format!(
            "INSERT INTO credit_transactions (user_id, credit_type, amount, description) VALUES ('{ID}', 'free_hours', -3, 'no-show')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::AdjustCredit {
                credit_type,
                amount,
                description,
                ..
            } => {
                assert_eq!(credit_type, CreditType::FreeHours);
                assert_eq!(amount, -3);
                assert_eq!(description.as_deref(), Some("no-show"));
            }
            _ => panic!("expected AdjustCredit, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_confirm_and_cancel_reservation() {
        let sql = format!("UPDATE reservations SET status = 'confirmed' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::ConfirmReservation { .. }));

        let sql = format!(
            "UPDATE reservations SET status = 'cancelled', cancellation_reason = 'sick' WHERE id = '{ID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::CancelReservation { reason, .. } => assert_eq!(reason.as_deref(), Some("sick")),
            other => panic!("expected CancelReservation, got {other:?}"),
        }

        let sql = format!("DELETE FROM reservations WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::CancelReservation { id, reason } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(reason, None);
            }
            other => panic!("expected CancelReservation, got {other:?}"),
        }
    }

    #[test]
    fn parse_reservation_back_to_scheduled_is_unsupported() {
        let sql = format!("UPDATE reservations SET status = 'scheduled' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_charge_paid() {
        let sql = format!(
            "UPDATE charges SET status = 'paid', payment_method = 'stripe', payment_reference = 'cs_123' WHERE id = '{ID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateCharge { update, .. } => assert_eq!(
                update,
                ChargeUpdate::Paid {
                    method: PaymentMethod::Stripe,
                    reference: Some("cs_123".into()),
                    notes: None,
                }
            ),
            other => panic!("expected UpdateCharge, got {other:?}"),
        }

        let sql = format!("UPDATE charges SET status = 'paid' WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("charges", "payment_method"))
        ));
    }

    #[test]
    fn parse_insert_series() {
        let sql = format!(
            "INSERT INTO recurring_series (user_id, recurrence_rule, start_time, end_time, series_start_date, max_advance_days) \
             VALUES ('{ID}', 'FREQ=WEEKLY;BYDAY=TU', '19:00', '21:00:00', '2026-11-03', 30)"
        );
        match parse_sql(&sql).unwrap() {
            Command::CreateSeries { request } => {
                assert_eq!(request.recurrence_rule, "FREQ=WEEKLY;BYDAY=TU");
                assert_eq!(request.start_time, NaiveTime::from_hms_opt(19, 0, 0).unwrap());
                assert_eq!(request.end_time, NaiveTime::from_hms_opt(21, 0, 0).unwrap());
                assert_eq!(request.max_advance_days, Some(30));
                assert_eq!(request.series_end_date, None);
            }
            other => panic!("expected CreateSeries, got {other:?}"),
        }
    }

    #[test]
    fn parse_series_updates() {
        let sql = format!("UPDATE recurring_series SET status = 'paused' WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::UpdateSeries { change: SeriesChange::Pause, .. }
        ));

        let sql = format!("UPDATE recurring_series SET series_end_date = '2027-03-01' WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateSeries {
                change: SeriesChange::Extend { series_end_date },
                ..
            } => assert_eq!(series_end_date, NaiveDate::from_ymd_opt(2027, 3, 1)),
            other => panic!("expected Extend, got {other:?}"),
        }

        let sql = format!("UPDATE recurring_series SET series_end_date = NULL WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::UpdateSeries {
                change: SeriesChange::Extend { series_end_date: None },
                ..
            }
        ));

        let sql = format!("DELETE FROM recurring_series WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::CancelSeries { .. }));
    }

    #[test]
    fn parse_select_reservations_filters() {
        let sql = format!(
            r#"SELECT * FROM reservations WHERE user_id = '{ID}' AND status = 'scheduled' AND start >= '2026-11-01T00:00:00Z' AND "end" <= '2026-12-01T00:00:00Z'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectReservations { id, filter } => {
                assert_eq!(id, None);
                assert_eq!(filter.user_id.map(|u| u.to_string()).as_deref(), Some(ID));
                assert_eq!(filter.status, Some(ReservationStatus::Scheduled));
                assert!(filter.from.is_some());
                assert!(filter.to.is_some());
                assert_eq!(filter.series_id, None);
            }
            other => panic!("expected SelectReservations, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_conflicts() {
        let sql = r#"SELECT * FROM conflicts WHERE start >= '2026-11-03T18:00:00Z' AND ("end" <= '2026-11-03T20:00:00Z')"#;
        match parse_sql(sql).unwrap() {
            Command::SelectConflicts { start, end, exclude } => {
                assert_eq!((end - start).num_hours(), 2);
                assert_eq!(exclude, None);
            }
            other => panic!("expected SelectConflicts, got {other:?}"),
        }

        let sql = r#"SELECT * FROM conflicts WHERE start >= '2026-11-03T18:00:00Z'"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_select_availability() {
        let sql = "SELECT * FROM availability WHERE day = '2026-11-03' AND min_minutes = 90";
        match parse_sql(sql).unwrap() {
            Command::SelectAvailability { day, min_length } => {
                assert_eq!(day, NaiveDate::from_ymd_opt(2026, 11, 3).unwrap());
                assert_eq!(min_length, Some(TimeDelta::minutes(90)));
            }
            other => panic!("expected SelectAvailability, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_cost_accepts_equality() {
        let sql = format!(
            r#"SELECT * FROM cost WHERE user_id = '{ID}' AND start = '2026-11-03T18:00:00Z' AND "end" = '2026-11-03T20:30:00Z'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectCost { start, end, .. } => assert_eq!((end - start).num_minutes(), 150),
            other => panic!("expected SelectCost, got {other:?}"),
        }
    }

    #[test]
    fn parse_select_series_conflicts() {
        let sql = format!(
            "SELECT * FROM series_conflicts WHERE user_id = '{ID}' AND recurrence_rule = 'FREQ=WEEKLY;BYDAY=MO' \
             AND start_time = '18:00' AND end_time = '20:00' AND series_start_date = '2026-11-02' AND occurrences = 12"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectSeriesConflicts { request, occurrences } => {
                assert_eq!(request.recurrence_rule, "FREQ=WEEKLY;BYDAY=MO");
                assert_eq!(occurrences, Some(12));
            }
            other => panic!("expected SelectSeriesConflicts, got {other:?}"),
        }
    }

    #[test]
    fn parse_closure_insert_and_delete() {
        let sql = r#"INSERT INTO closures (start, "end", closure_type, notes) VALUES ('2026-12-25T00:00:00Z', '2026-12-26T00:00:00Z', 'holiday', 'Christmas')"#;
        match parse_sql(sql).unwrap() {
            Command::AddClosure { closure } => {
                assert_eq!(closure.closure_type, ClosureType::Holiday);
                assert_eq!(closure.span.duration().num_hours(), 24);
            }
            other => panic!("expected AddClosure, got {other:?}"),
        }

        let sql = r#"INSERT INTO closures (start, "end") VALUES ('2026-12-26T00:00:00Z', '2026-12-25T00:00:00Z')"#;
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));

        let sql = format!("DELETE FROM closures WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::RemoveClosure { .. }));
    }

    #[test]
    fn parse_where_or_is_unsupported() {
        let sql = format!("SELECT * FROM charges WHERE user_id = '{ID}' OR status = 'paid'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_listen_and_unlisten() {
        match parse_sql("LISTEN calendar;").unwrap() {
            Command::Listen { channel } => assert_eq!(channel, "calendar"),
            other => panic!("expected Listen, got {other:?}"),
        }
        match parse_sql(&format!("unlisten user_{ID}")).unwrap() {
            Command::Unlisten { channel } => assert_eq!(channel, format!("user_{ID}")),
            other => panic!("expected Unlisten, got {other:?}"),
        }
        assert!(matches!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll));
    }

    #[test]
    fn select_table_tolerates_placeholders() {
        assert_eq!(
            select_table("SELECT * FROM credit_balances WHERE user_id = $1").as_deref(),
            Some("credit_balances")
        );
        assert_eq!(select_table("DELETE FROM closures WHERE id = $1"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO bookings (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
