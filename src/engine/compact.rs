use tokio::sync::OwnedRwLockReadGuard;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

/// Ledger rows per snapshot event, keeping frames well under the replay limit.
const TRANSACTIONS_PER_EVENT: usize = 1_000;

impl Engine {
    /// Rewrite the WAL with only the events needed to rebuild the current state.
    /// Returns the number of events in the snapshot.
    ///
    /// Holds the calendar write lock throughout. Ledger-only writers take the
    /// calendar lock shared, so nothing can commit between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<u64, EngineError> {
        let cal = self.calendar.write().await;
        let mut events = Vec::new();

        let mut members: Vec<MemberProfile> = self.members.iter().map(|m| m.value().clone()).collect();
        members.sort_by_key(|m| m.user_id);
        events.extend(members.into_iter().map(|profile| Event::MemberUpserted {
            profile,
            adjustment: None,
        }));

        let mut closures: Vec<&SpaceClosure> = cal.closures.values().collect();
        closures.sort_by_key(|c| (c.span.start, c.id));
        events.extend(closures.into_iter().map(|c| Event::ClosureAdded { closure: c.clone() }));

        let mut productions: Vec<&Production> = cal.productions.values().collect();
        productions.sort_by_key(|p| (p.span.start, p.id));
        events.extend(
            productions
                .into_iter()
                .map(|p| Event::ProductionUpserted { production: p.clone() }),
        );

        let mut series: Vec<&RecurringSeries> = cal.series.values().collect();
        series.sort_by_key(|s| s.id);
        events.extend(series.into_iter().map(|s| Event::SeriesCreated { series: s.clone() }));

        let mut reservations: Vec<&Reservation> = cal.reservations.values().collect();
        reservations.sort_by_key(|r| (r.created_at, r.id));
        for r in reservations {
            let Some(charge) = cal.charge_for(&Chargeable::reservation(r.id)) else {
                return Err(EngineError::WalError(format!("reservation {} has no charge", r.id)));
            };
            events.push(Event::ReservationBooked {
                reservation: r.clone(),
                charge: charge.clone(),
                debit: None,
            });
        }

        let mut user_ids: Vec<Ulid> = self.accounts.iter().map(|a| *a.key()).collect();
        user_ids.sort();
        let mut guards: Vec<OwnedRwLockReadGuard<Account>> = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            guards.push(self.account(user_id).read_owned().await);
        }
        let mut transaction_count = 0;
        for account in &guards {
            transaction_count += account.transactions.len();
            for chunk in account.transactions.chunks(TRANSACTIONS_PER_EVENT) {
                events.push(Event::CreditsRecorded {
                    transactions: chunk.to_vec(),
                });
            }
        }

        let event_count = events.len();
        self.send_wal_command(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        drop(cal);

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events = event_count, transactions = transaction_count, "WAL compacted");
        Ok(event_count as u64)
    }

    /// Entries written since the last compaction (the snapshot counts).
    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.send_wal_command(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}
