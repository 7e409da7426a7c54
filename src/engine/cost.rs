use rust_decimal::{Decimal, RoundingStrategy};
use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_interval;
use super::{Engine, EngineError};

const SECONDS_PER_BLOCK: i64 = 1_800;
const SECONDS_PER_HOUR: i64 = 3_600;

/// Quote for one interval. Pure: nothing here touches the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostBreakdown {
    pub total_hours: Decimal,
    pub free_hours: Decimal,
    pub paid_hours: Decimal,
    /// 30-minute blocks to take from the FreeHours balance.
    pub free_blocks: i64,
    /// Price of the whole interval before credits.
    pub gross: Decimal,
    pub cost: Decimal,
}

impl CostBreakdown {
    pub fn is_free(&self) -> bool {
        self.cost.is_zero()
    }
}

pub(crate) fn round_2dp(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Quote `span` against `available_blocks` of free-hour credit at `hourly_rate`.
///
/// Free hours are consumed in whole blocks (a partial block rounds up), cash
/// hours use the exact duration. Only the money is rounded; the hour fields are
/// rounded to 2dp for display and storage.
pub fn calculate_cost(span: &Span, available_blocks: i64, hourly_rate: Decimal) -> CostBreakdown {
    let seconds = span.duration().num_seconds();
    let requested_blocks = (seconds + SECONDS_PER_BLOCK - 1) / SECONDS_PER_BLOCK;
    let free_blocks = available_blocks.max(0).min(requested_blocks);
    let free_seconds = (free_blocks * SECONDS_PER_BLOCK).min(seconds);
    let paid_seconds = seconds - free_seconds;
    CostBreakdown {
        total_hours: round_2dp(hours(seconds)),
        free_hours: round_2dp(hours(free_seconds)),
        paid_hours: round_2dp(hours(paid_seconds)),
        free_blocks,
        gross: price(seconds, hourly_rate),
        cost: price(paid_seconds, hourly_rate),
    }
}

fn hours(seconds: i64) -> Decimal {
    Decimal::from(seconds) / Decimal::from(SECONDS_PER_HOUR)
}

fn price(seconds: i64, hourly_rate: Decimal) -> Decimal {
    round_2dp(Decimal::from(seconds) * hourly_rate / Decimal::from(SECONDS_PER_HOUR))
}

impl Engine {
    /// Quote `[start, end)` for `user_id` using their current FreeHours balance.
    pub async fn calculate_reservation_cost(
        &self,
        user_id: Ulid,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<CostBreakdown, EngineError> {
        let span = validate_interval(start, end)?;
        let balance = self.get_credit_balance(user_id, CreditType::FreeHours).await;
        Ok(calculate_cost(&span, balance, self.policy.hourly_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};

    fn rate() -> Decimal {
        Decimal::new(1500, 2)
    }

    fn minutes(m: i64) -> Span {
        let start = Utc.with_ymd_and_hms(2026, 11, 3, 18, 0, 0).unwrap();
        Span::new(start, start + TimeDelta::minutes(m))
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn non_member_pays_full_price() {
        let quote = calculate_cost(&minutes(120), 0, rate());
        assert_eq!(quote.total_hours, dec("2"));
        assert_eq!(quote.free_hours, Decimal::ZERO);
        assert_eq!(quote.free_blocks, 0);
        assert_eq!(quote.cost, dec("30.00"));
        assert_eq!(quote.gross, dec("30.00"));
        assert!(!quote.is_free());
    }

    #[test]
    fn sustaining_member_covered_by_blocks() {
        let quote = calculate_cost(&minutes(120), 8, rate());
        assert_eq!(quote.free_blocks, 4);
        assert_eq!(quote.free_hours, dec("2"));
        assert_eq!(quote.cost, Decimal::ZERO);
        assert_eq!(quote.gross, dec("30.00"));
        assert!(quote.is_free());
    }

    #[test]
    fn exact_balance_is_fully_free() {
        let quote = calculate_cost(&minutes(120), 4, rate());
        assert_eq!(quote.free_blocks, 4);
        assert!(quote.is_free());
    }

    #[test]
    fn one_block_short_bills_the_remainder() {
        let quote = calculate_cost(&minutes(120), 3, rate());
        assert_eq!(quote.free_blocks, 3);
        assert_eq!(quote.free_hours, dec("1.5"));
        assert_eq!(quote.paid_hours, dec("0.5"));
        assert_eq!(quote.cost, dec("7.50"));
    }

    #[test]
    fn partial_block_rounds_up_but_never_exceeds_hours() {
        // 75 minutes = 2.5 blocks -> 3 blocks requested
        let quote = calculate_cost(&minutes(75), 10, rate());
        assert_eq!(quote.free_blocks, 3);
        assert_eq!(quote.total_hours, dec("1.25"));
        assert_eq!(quote.free_hours, dec("1.25"));
        assert!(quote.free_hours <= quote.total_hours);
        assert_eq!(quote.cost, Decimal::ZERO);
    }

    #[test]
    fn cash_hours_use_exact_duration() {
        // 80 minutes shows as 1.33 hours but bills 4/3 h * 15.00
        let quote = calculate_cost(&minutes(80), 0, rate());
        assert_eq!(quote.total_hours, dec("1.33"));
        assert_eq!(quote.cost, dec("20.00"));
        assert_eq!(quote.gross, dec("20.00"));

        let quote = calculate_cost(&minutes(70), 0, rate());
        assert_eq!(quote.total_hours, dec("1.17"));
        assert_eq!(quote.cost, dec("17.50"));
    }

    #[test]
    fn free_blocks_leave_exact_cash_remainder() {
        // 70 minutes with 2 blocks: 10 paid minutes
        let quote = calculate_cost(&minutes(70), 2, rate());
        assert_eq!(quote.free_hours, dec("1"));
        assert_eq!(quote.paid_hours, dec("0.17"));
        assert_eq!(quote.cost, dec("2.50"));
        assert_eq!(quote.gross, dec("17.50"));
    }

    #[test]
    fn negative_balance_counts_as_zero() {
        let quote = calculate_cost(&minutes(60), -4, rate());
        assert_eq!(quote.free_blocks, 0);
        assert_eq!(quote.cost, dec("15.00"));
    }

    #[test]
    fn cost_invariant_holds_across_durations() {
        for m in (30..=480).step_by(15) {
            for blocks in [0, 1, 3, 8, 20] {
                let q = calculate_cost(&minutes(m), blocks, rate());
                assert!(q.free_hours >= Decimal::ZERO && q.free_hours <= q.total_hours);
                assert!(q.cost >= Decimal::ZERO);
                let paid_minutes = m - (blocks.max(0) * 30).min(m);
                assert_eq!(q.cost, round_2dp(Decimal::from(paid_minutes) * rate() / Decimal::from(60)));
                assert!(q.cost <= q.gross);
            }
        }
    }
}
