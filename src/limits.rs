/// Free-form text columns (notes, reasons, descriptions, titles).
pub const MAX_TEXT_LEN: usize = 2_000;

pub const MAX_NAME_LEN: usize = 256;

pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_TENANTS: usize = 256;

/// Widest window a conflict/availability/listing query may scan.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;

/// Reservations further out than this are rejected outright.
pub const MAX_BOOKING_HORIZON_DAYS: i64 = 730;

pub const MAX_RRULE_LEN: usize = 512;

/// Upper bound on occurrences a single series expansion may produce.
pub const MAX_OCCURRENCES_PER_EXPANSION: usize = 1_000;

/// Occurrences projected by recurring pattern validation when the caller gives none.
pub const DEFAULT_VALIDATION_OCCURRENCES: usize = 8;

pub const MAX_VALIDATION_OCCURRENCES: usize = 104;

pub const MAX_ADVANCE_DAYS: u32 = 365;

/// Largest single credit transaction, in blocks.
pub const MAX_CREDIT_AMOUNT: i64 = 10_000;
