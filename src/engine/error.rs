use thiserror::Error;
use ulid::Ulid;

use crate::model::{ChargeStatus, ConflictReport, CreditType, ReservationStatus};
use crate::recurrence::RecurrenceError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    /// Carries everything that blocks the requested slot.
    #[error("time slot unavailable: {0}")]
    SlotUnavailable(ConflictReport),
    #[error(
        "insufficient {} credit: balance {balance}, requested {requested}",
        .credit_type.as_str()
    )]
    InsufficientCredit {
        credit_type: CreditType,
        balance: i64,
        requested: i64,
    },
    #[error("cannot {action} reservation {id} in status {}", .from.as_str())]
    InvalidReservationTransition {
        id: Ulid,
        from: ReservationStatus,
        action: &'static str,
    },
    #[error("charge {id} cannot move from {} to {}", .from.as_str(), .to.as_str())]
    InvalidChargeTransition {
        id: Ulid,
        from: ChargeStatus,
        to: ChargeStatus,
    },
    #[error("invalid recurring series: {0}")]
    InvalidSeries(String),
    #[error(transparent)]
    InvalidRecurrence(#[from] RecurrenceError),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::InvalidInterval(_)
            | EngineError::InvalidSeries(_)
            | EngineError::InvalidRecurrence(_) => "22023",
            EngineError::SlotUnavailable(_) => "23P01",
            EngineError::InsufficientCredit { .. } => "23514",
            EngineError::InvalidReservationTransition { .. }
            | EngineError::InvalidChargeTransition { .. } => "55000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}
