use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::BookingPolicy;
use crate::engine::Engine;
use crate::jobs::{self, HubReminderSink, ReminderSink};
use crate::limits::*;
use crate::notify::NotifyHub;

/// One engine per practice space, keyed by the connection's sanitized database name.
/// Each space gets its own WAL, change feed, scheduler and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    job_interval: Duration,
    policy: BookingPolicy,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "space name too long"));
    }
    let safe: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty space name"));
    }
    Ok(safe)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, job_interval: Duration, policy: BookingPolicy) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            job_interval,
            policy,
        }
    }

    /// Get or lazily open the engine for `tenant`, starting its background jobs.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many spaces"));
        }

        // The entry guard makes sure a WAL is only ever opened by one engine.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify.clone(), self.policy.clone())?);

                let sink: Arc<dyn ReminderSink> = Arc::new(HubReminderSink::new(notify));
                tokio::spawn(jobs::run_scheduler(engine.clone(), sink, self.job_interval));
                tokio::spawn(jobs::run_compactor(engine.clone(), self.compact_threshold));

                slot.insert(engine.clone());
                engine
            }
        };
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(space = %safe_name, "space opened");
        Ok(engine)
    }
}
