use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// UTC instant. Every stored timestamp uses this.
pub type Timestamp = DateTime<Utc>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

// ── Members & credits ───────────────────────────────────────

/// Membership facts pushed in by the membership collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub user_id: Ulid,
    pub name: Option<String>,
    pub sustaining: bool,
    /// Free-hour blocks granted each month while sustaining.
    pub monthly_free_blocks: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CreditType {
    /// Counted in 30-minute blocks.
    FreeHours,
    EquipmentCredits,
}

impl CreditType {
    pub const ALL: [CreditType; 2] = [CreditType::FreeHours, CreditType::EquipmentCredits];

    pub fn as_str(self) -> &'static str {
        match self {
            CreditType::FreeHours => "free_hours",
            CreditType::EquipmentCredits => "equipment_credits",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "free_hours" => Some(CreditType::FreeHours),
            "equipment_credits" => Some(CreditType::EquipmentCredits),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreditSource {
    MonthlyAllocation,
    MonthlyReset,
    AdminAdjustment,
    ReservationCharge,
    ReservationRefund,
    UpgradeAdjustment,
}

impl CreditSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CreditSource::MonthlyAllocation => "monthly_allocation",
            CreditSource::MonthlyReset => "monthly_reset",
            CreditSource::AdminAdjustment => "admin_adjustment",
            CreditSource::ReservationCharge => "reservation_charge",
            CreditSource::ReservationRefund => "reservation_refund",
            CreditSource::UpgradeAdjustment => "upgrade_adjustment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "monthly_allocation" => Some(CreditSource::MonthlyAllocation),
            "monthly_reset" => Some(CreditSource::MonthlyReset),
            "admin_adjustment" => Some(CreditSource::AdminAdjustment),
            "reservation_charge" => Some(CreditSource::ReservationCharge),
            "reservation_refund" => Some(CreditSource::ReservationRefund),
            "upgrade_adjustment" => Some(CreditSource::UpgradeAdjustment),
            _ => None,
        }
    }
}

/// Polymorphic link from a ledger row to whatever caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Reservation,
    RecurringSeries,
    Charge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: Ulid,
}

impl EntityRef {
    pub fn reservation(id: Ulid) -> Self {
        Self { kind: EntityKind::Reservation, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EntityKind::Reservation => "reservation",
            EntityKind::RecurringSeries => "recurring_series",
            EntityKind::Charge => "charge",
        };
        write!(f, "{kind}:{}", self.id)
    }
}

/// Immutable ledger row. Balances are always the signed sum of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Ulid,
    pub user_id: Ulid,
    pub credit_type: CreditType,
    pub amount: i64,
    pub source: CreditSource,
    pub reference: Option<EntityRef>,
    pub description: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: Timestamp,
}

/// One user's slice of the ledger.
#[derive(Debug, Clone)]
pub struct Account {
    pub user_id: Ulid,
    pub transactions: Vec<CreditTransaction>,
}

impl Account {
    pub fn new(user_id: Ulid) -> Self {
        Self {
            user_id,
            transactions: Vec::new(),
        }
    }

    pub fn balance(&self, credit_type: CreditType) -> i64 {
        self.transactions
            .iter()
            .filter(|t| t.credit_type == credit_type)
            .map(|t| t.amount)
            .sum()
    }
}

// ── Reservations ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservableKind {
    User,
    Band,
}

/// Who the slot is booked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reservable {
    pub kind: ReservableKind,
    pub id: Ulid,
}

impl Reservable {
    pub fn user(id: Ulid) -> Self {
        Self { kind: ReservableKind::User, id }
    }

    pub fn band(id: Ulid) -> Self {
        Self { kind: ReservableKind::Band, id }
    }
}

impl fmt::Display for Reservable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ReservableKind::User => write!(f, "member {}", self.id),
            ReservableKind::Band => write!(f, "band {}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Credits deducted at creation, awaiting confirmation.
    Scheduled,
    /// Credits deferred until confirmation.
    Reserved,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Scheduled => "scheduled",
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Some(ReservationStatus::Scheduled),
            "reserved" => Some(ReservationStatus::Reserved),
            "confirmed" => Some(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub reservable: Reservable,
    /// Member whose credits and charge this reservation uses.
    pub user_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub hours_used: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub free_hours_used: Decimal,
    /// Blocks quoted at creation.
    pub free_blocks: i64,
    /// Blocks actually taken from the ledger (0 while deferred).
    pub credits_deducted: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub cost: Decimal,
    pub cancellation_reason: Option<String>,
    pub recurring_series_id: Option<Ulid>,
    pub notes: Option<String>,
    pub created_at: Timestamp,
    pub confirmed_at: Option<Timestamp>,
    pub cancelled_at: Option<Timestamp>,
    pub reminder_sent_at: Option<Timestamp>,
}

impl Reservation {
    pub fn is_recurring(&self) -> bool {
        self.recurring_series_id.is_some()
    }

    pub fn credits_deferred(&self) -> bool {
        self.status == ReservationStatus::Reserved
    }
}

// ── Charges ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargeableKind {
    Reservation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chargeable {
    pub kind: ChargeableKind,
    pub id: Ulid,
}

impl Chargeable {
    pub fn reservation(id: Ulid) -> Self {
        Self {
            kind: ChargeableKind::Reservation,
            id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargeStatus {
    Pending,
    Paid,
    Comped,
    Cancelled,
    Refunded,
}

impl ChargeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChargeStatus::Pending => "pending",
            ChargeStatus::Paid => "paid",
            ChargeStatus::Comped => "comped",
            ChargeStatus::Cancelled => "cancelled",
            ChargeStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(ChargeStatus::Pending),
            "paid" => Some(ChargeStatus::Paid),
            "comped" => Some(ChargeStatus::Comped),
            "cancelled" | "canceled" => Some(ChargeStatus::Cancelled),
            "refunded" => Some(ChargeStatus::Refunded),
            _ => None,
        }
    }

    /// `Pending → {Paid, Comped, Cancelled}`, `Paid → Refunded`.
    pub fn can_transition_to(self, next: ChargeStatus) -> bool {
        matches!(
            (self, next),
            (ChargeStatus::Pending, ChargeStatus::Paid)
                | (ChargeStatus::Pending, ChargeStatus::Comped)
                | (ChargeStatus::Pending, ChargeStatus::Cancelled)
                | (ChargeStatus::Paid, ChargeStatus::Refunded)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentMethod {
    Stripe,
    Cash,
    Card,
    Check,
    /// Fully covered by free-hour credits.
    Credits,
    Other,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Check => "check",
            PaymentMethod::Credits => "credits",
            PaymentMethod::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stripe" => Some(PaymentMethod::Stripe),
            "cash" => Some(PaymentMethod::Cash),
            "card" => Some(PaymentMethod::Card),
            "check" => Some(PaymentMethod::Check),
            "credits" => Some(PaymentMethod::Credits),
            "other" => Some(PaymentMethod::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: Ulid,
    pub chargeable: Chargeable,
    pub user_id: Ulid,
    /// Gross amount before credits.
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub net_amount: Decimal,
    pub credits_applied: BTreeMap<CreditType, i64>,
    pub status: ChargeStatus,
    pub payment_method: Option<PaymentMethod>,
    /// Provider session / transaction id recorded by the payment collaborator.
    pub payment_reference: Option<String>,
    pub paid_at: Option<Timestamp>,
    pub notes: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ── Recurring series ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesStatus {
    Active,
    Paused,
    Cancelled,
    Completed,
}

impl SeriesStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SeriesStatus::Active => "active",
            SeriesStatus::Paused => "paused",
            SeriesStatus::Cancelled => "cancelled",
            SeriesStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Some(SeriesStatus::Active),
            "paused" => Some(SeriesStatus::Paused),
            "cancelled" | "canceled" => Some(SeriesStatus::Cancelled),
            "completed" => Some(SeriesStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringSeries {
    pub id: Ulid,
    pub user_id: Ulid,
    /// Which kind of reservation the series generates, and for whom.
    pub reservable: Reservable,
    /// RFC 5545 RRULE body, e.g. `FREQ=WEEKLY;INTERVAL=1;BYDAY=TU`.
    pub recurrence_rule: String,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub series_start_date: NaiveDate,
    pub series_end_date: Option<NaiveDate>,
    pub max_advance_days: u32,
    pub status: SeriesStatus,
    pub notes: Option<String>,
    pub created_at: Timestamp,
}

impl RecurringSeries {
    pub fn recurable_type(&self) -> ReservableKind {
        self.reservable.kind
    }
}

// ── Blocking inputs ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClosureType {
    Holiday,
    Maintenance,
    Event,
    Emergency,
    Other,
}

impl ClosureType {
    pub fn as_str(self) -> &'static str {
        match self {
            ClosureType::Holiday => "holiday",
            ClosureType::Maintenance => "maintenance",
            ClosureType::Event => "event",
            ClosureType::Emergency => "emergency",
            ClosureType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "holiday" => Some(ClosureType::Holiday),
            "maintenance" => Some(ClosureType::Maintenance),
            "event" => Some(ClosureType::Event),
            "emergency" => Some(ClosureType::Emergency),
            "other" => Some(ClosureType::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceClosure {
    pub id: Ulid,
    pub span: Span,
    pub closure_type: ClosureType,
    pub notes: Option<String>,
}

/// An approved production occupying the space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Production {
    pub id: Ulid,
    pub title: String,
    pub span: Span,
}

/// Per-member aggregate for the current local month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStats {
    pub user_id: Ulid,
    pub month: String,
    pub reservations: u32,
    pub hours_booked: Decimal,
    pub free_hours_used: Decimal,
    pub free_blocks_remaining: i64,
}

// ── Calendar index ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntervalKind {
    Reservation,
    Production,
    Closure,
}

impl IntervalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IntervalKind::Reservation => "reservation",
            IntervalKind::Production => "production",
            IntervalKind::Closure => "closure",
        }
    }
}

/// A blocking entry on the room's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

/// Everything that lives on the room's calendar. Guarded by a single lock.
#[derive(Debug, Default)]
pub struct Calendar {
    /// Active reservations, productions and closures, sorted by `span.start`.
    pub intervals: Vec<Interval>,
    pub reservations: HashMap<Ulid, Reservation>,
    pub charges: HashMap<Ulid, Charge>,
    pub charge_index: HashMap<Chargeable, Ulid>,
    pub series: HashMap<Ulid, RecurringSeries>,
    /// Idempotency key: series id → occurrence start → reservation id.
    pub series_instances: HashMap<Ulid, BTreeMap<Timestamp, Ulid>>,
    pub closures: HashMap<Ulid, SpaceClosure>,
    pub productions: HashMap<Ulid, Production>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        if let Some(pos) = self.intervals.iter().position(|i| i.id == id) {
            Some(self.intervals.remove(pos))
        } else {
            None
        }
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn charge_for(&self, chargeable: &Chargeable) -> Option<&Charge> {
        self.charge_index
            .get(chargeable)
            .and_then(|id| self.charges.get(id))
    }

    /// Reservations of a series in chronological order.
    pub fn series_reservations(&self, series_id: &Ulid) -> Vec<&Reservation> {
        self.series_instances
            .get(series_id)
            .map(|instances| {
                instances
                    .values()
                    .filter_map(|id| self.reservations.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── Conflicts ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub kind: IntervalKind,
    pub id: Ulid,
    pub span: Span,
    /// Human-readable description of who/what is blocking.
    pub label: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}: {}", self.kind.as_str(), self.id, self.span, self.label)
    }
}

/// Everything overlapping a candidate interval, grouped by source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    pub reservations: Vec<Conflict>,
    pub productions: Vec<Conflict>,
    pub closures: Vec<Conflict>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty() && self.productions.is_empty() && self.closures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.reservations.len() + self.productions.len() + self.closures.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.reservations
            .iter()
            .chain(self.productions.iter())
            .chain(self.closures.iter())
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for conflict in self.iter() {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{conflict}")?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarningSource {
    /// A one-off reservation, production or closure.
    Booking(Conflict),
    /// Another active series projects an overlapping occurrence on the same date.
    Series { series_id: Ulid, occurrence: Span },
}

/// Non-fatal: a projected occurrence of a candidate pattern collides with something.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringConflictWarning {
    pub occurrence: Span,
    pub source: WarningSource,
}

impl fmt::Display for RecurringConflictWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            WarningSource::Booking(conflict) => {
                write!(f, "occurrence {} conflicts with {conflict}", self.occurrence)
            }
            WarningSource::Series {
                series_id,
                occurrence,
            } => write!(
                f,
                "occurrence {} overlaps recurring series {series_id} at {occurrence}",
                self.occurrence
            ),
        }
    }
}

// ── WAL record format ───────────────────────────────────────

/// Flat event types, no nesting beyond the records they carry.
/// One event per committed action, so multi-row actions commit atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MemberUpserted {
        profile: MemberProfile,
        /// Mid-month top-up when the member's allocation went up.
        adjustment: Option<CreditTransaction>,
    },
    /// Ledger-only entries (grants, admin adjustments, monthly resets),
    /// committed together.
    CreditsRecorded {
        transactions: Vec<CreditTransaction>,
    },
    ReservationBooked {
        reservation: Reservation,
        charge: Charge,
        debit: Option<CreditTransaction>,
    },
    ReservationConfirmed {
        id: Ulid,
        at: Timestamp,
        debit: Option<CreditTransaction>,
    },
    ReservationCancelled {
        id: Ulid,
        at: Timestamp,
        reason: Option<String>,
        refund: Option<CreditTransaction>,
        charge_status: Option<ChargeStatus>,
    },
    ReminderRecorded {
        id: Ulid,
        at: Timestamp,
    },
    ChargeUpdated {
        id: Ulid,
        status: ChargeStatus,
        payment_method: Option<PaymentMethod>,
        payment_reference: Option<String>,
        notes: Option<String>,
        at: Timestamp,
    },
    SeriesCreated {
        series: RecurringSeries,
    },
    SeriesStatusChanged {
        id: Ulid,
        status: SeriesStatus,
    },
    SeriesExtended {
        id: Ulid,
        series_end_date: Option<NaiveDate>,
    },
    ClosureAdded {
        closure: SpaceClosure,
    },
    ClosureRemoved {
        id: Ulid,
    },
    ProductionUpserted {
        production: Production,
    },
    ProductionRemoved {
        id: Ulid,
    },
}

impl Event {
    /// Ledger rows carried by this event, in append order.
    pub fn transactions(&self) -> Vec<&CreditTransaction> {
        match self {
            Event::CreditsRecorded { transactions } => transactions.iter().collect(),
            Event::ReservationBooked { debit, .. } | Event::ReservationConfirmed { debit, .. } => {
                debit.iter().collect()
            }
            Event::ReservationCancelled { refund, .. } => refund.iter().collect(),
            Event::MemberUpserted { adjustment, .. } => adjustment.iter().collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 11, 3, h, m, 0).unwrap()
    }

    #[test]
    fn touching_spans_do_not_overlap() {
        let a = Span::new(at(10, 0), at(12, 0));
        let b = Span::new(at(12, 0), at(14, 0));
        assert!(!a.overlaps(&b));
        assert!(!b.overlaps(&a));
    }

    #[test]
    fn nested_and_partial_spans_overlap() {
        let outer = Span::new(at(10, 0), at(14, 0));
        let inner = Span::new(at(11, 0), at(12, 0));
        let partial = Span::new(at(13, 30), at(15, 0));
        assert!(outer.overlaps(&inner));
        assert!(outer.overlaps(&partial));
    }

    #[test]
    fn overlapping_uses_sorted_index() {
        let mut cal = Calendar::new();
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        cal.insert_interval(Interval { id: ids[2], span: Span::new(at(16, 0), at(18, 0)), kind: IntervalKind::Closure });
        cal.insert_interval(Interval { id: ids[0], span: Span::new(at(9, 0), at(11, 0)), kind: IntervalKind::Reservation });
        cal.insert_interval(Interval { id: ids[1], span: Span::new(at(12, 0), at(13, 0)), kind: IntervalKind::Production });

        let starts: Vec<_> = cal.intervals.iter().map(|i| i.span.start).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]));

        let hits: Vec<Ulid> = cal
            .overlapping(&Span::new(at(10, 30), at(12, 30)))
            .map(|i| i.id)
            .collect();
        assert_eq!(hits, vec![ids[0], ids[1]]);

        assert!(cal.remove_interval(ids[1]).is_some());
        assert!(cal.remove_interval(ids[1]).is_none());
    }

    #[test]
    fn charge_transitions_are_one_directional() {
        use ChargeStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Comped));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Paid.can_transition_to(Refunded));
        assert!(!Paid.can_transition_to(Pending));
        assert!(!Paid.can_transition_to(Cancelled));
        assert!(!Refunded.can_transition_to(Paid));
        assert!(!Cancelled.can_transition_to(Paid));
        assert!(!Comped.can_transition_to(Refunded));
        assert!(!Pending.can_transition_to(Refunded));
    }

    #[test]
    fn account_balance_is_signed_sum_per_type() {
        let user = Ulid::new();
        let mut account = Account::new(user);
        let mk = |credit_type, amount| CreditTransaction {
            id: Ulid::new(),
            user_id: user,
            credit_type,
            amount,
            source: CreditSource::AdminAdjustment,
            reference: None,
            description: None,
            metadata: BTreeMap::new(),
            created_at: at(9, 0),
        };
        account.transactions.push(mk(CreditType::FreeHours, 8));
        account.transactions.push(mk(CreditType::FreeHours, -3));
        account.transactions.push(mk(CreditType::EquipmentCredits, 5));
        assert_eq!(account.balance(CreditType::FreeHours), 5);
        assert_eq!(account.balance(CreditType::EquipmentCredits), 5);
    }

    #[test]
    fn status_names_parse_back() {
        for s in ["scheduled", "reserved", "confirmed", "cancelled"] {
            assert_eq!(ReservationStatus::parse(s).unwrap().as_str(), s);
        }
        assert_eq!(ReservationStatus::parse("canceled"), Some(ReservationStatus::Cancelled));
        assert_eq!(ChargeStatus::parse("PAID"), Some(ChargeStatus::Paid));
        assert_eq!(SeriesStatus::parse("bogus"), None);
    }
}
