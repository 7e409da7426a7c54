use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{CreditType, Span, UserStats};

/// String-keyed read cache with a fixed time-to-live.
/// Entries are dropped explicitly by the writer that made them stale.
pub struct TtlCache<V> {
    entries: DashMap<String, (Instant, V)>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let hit = self.entries.get(key).and_then(|entry| {
            let (stored_at, value) = entry.value();
            (stored_at.elapsed() < self.ttl).then(|| value.clone())
        });
        if hit.is_none() {
            self.entries.remove(key);
        }
        hit
    }

    pub fn insert(&self, key: String, value: V) {
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn get_or_insert_with(&self, key: String, compute: impl FnOnce() -> V) -> V {
        if let Some(v) = self.get(&key) {
            return v;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn credit_key(user_id: Ulid, credit_type: CreditType) -> String {
    format!("user.{user_id}.credit.{}", credit_type.as_str())
}

pub fn user_stats_key(user_id: Ulid) -> String {
    format!("user_stats.{user_id}")
}

pub fn conflicts_key(day: NaiveDate) -> String {
    format!("reservations.conflicts.{day}")
}

/// The engine's read caches. Every mutating action calls the matching
/// `invalidate_*` helper itself.
pub struct EngineCache {
    pub balances: TtlCache<i64>,
    pub user_stats: TtlCache<UserStats>,
    pub free_slots: TtlCache<Vec<Span>>,
}

impl EngineCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            balances: TtlCache::new(ttl),
            user_stats: TtlCache::new(ttl),
            free_slots: TtlCache::new(ttl),
        }
    }

    pub fn invalidate_user(&self, user_id: Ulid) {
        for credit_type in CreditType::ALL {
            self.balances.invalidate(&credit_key(user_id, credit_type));
        }
        self.user_stats.invalidate(&user_stats_key(user_id));
    }

    /// Drop cached free slots for every local day in `[first, last]`.
    pub fn invalidate_days(&self, first: NaiveDate, last: NaiveDate) {
        for day in first.iter_days().take_while(|d| *d <= last) {
            self.free_slots.invalidate(&conflicts_key(day));
        }
    }

    pub fn invalidate_day(&self, day: NaiveDate) {
        self.free_slots.invalidate(&conflicts_key(day));
    }
}
