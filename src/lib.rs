pub mod config;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod models;
pub mod policy;
pub mod store;
pub mod threats;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{info, warn};

use config::Config;
use ledger::ReputationLedger;
use models::{
    DailyStat, Decision, Event, EventStatus, EventType, ListStatus, ReputationEntry, Signal,
};
use policy::{PolicyCoordinator, RequestContext};
use store::EventStore;

/// Core autoban instance
pub struct Autoban {
    config: Config,
    store: EventStore,
    ledger: ReputationLedger,
    coordinator: PolicyCoordinator,
}

impl Autoban {
    /// Create a new autoban instance backed by the configured database path
    pub fn new(config: Config) -> Result<Self> {
        let store = EventStore::open(config.db_path())?;
        Self::with_store(config, store)
    }

    /// Create an instance over an already opened store
    pub fn with_store(config: Config, store: EventStore) -> Result<Self> {
        let ledger = ReputationLedger::new(store.clone());
        let coordinator = PolicyCoordinator::new(store.clone(), &config)?;

        Ok(Self {
            config,
            store,
            ledger,
            coordinator,
        })
    }

    /// Create an in-memory instance (for testing)
    pub fn open_memory(config: Config) -> Result<Self> {
        Self::with_store(config, EventStore::open_memory()?)
    }

    /// Evaluate an inbound request signal. Returns the per-request context
    /// alongside the decision so follow-up calls (login outcome recording,
    /// error sanitizing) see the same state.
    pub fn evaluate(&self, signal: &Signal) -> (RequestContext, Decision) {
        let mut ctx = RequestContext::new();
        let decision = self.coordinator.handle(&mut ctx, signal);
        (ctx, decision)
    }

    /// Record the outcome of a login attempt. On failure this feeds the rate
    /// limiter and may lock the IP out.
    pub fn record_login(
        &self,
        ctx: &mut RequestContext,
        signal: &Signal,
        success: bool,
    ) -> Decision {
        self.coordinator.record_login(ctx, signal, success)
    }

    /// Replace credential errors with a generic message unless a custom
    /// lockout message was already produced this request.
    pub fn sanitize_login_error<'a>(
        &self,
        ctx: &RequestContext,
        code: &str,
        message: &'a str,
    ) -> &'a str {
        self.coordinator.sanitize_login_error(ctx, code, message)
    }

    /// Manually blacklist an IP until `expire_at`
    pub fn ban(&self, ip: &str, expire_at: DateTime<Utc>, details: &str) -> Result<()> {
        let details = if details.is_empty() {
            "Manually blacklisted."
        } else {
            details
        };
        self.ledger.ban(ip, expire_at, details)?;
        Ok(())
    }

    /// Manually whitelist an IP until `expire_at`
    pub fn allow(&self, ip: &str, expire_at: DateTime<Utc>, details: &str) -> Result<()> {
        let details = if details.is_empty() {
            "Manually whitelisted."
        } else {
            details
        };
        self.ledger.allow(ip, expire_at, details)?;
        Ok(())
    }

    pub fn is_blacklisted(&self, ip: &str) -> Result<bool> {
        Ok(self.ledger.is_blacklisted(ip)?)
    }

    pub fn is_whitelisted(&self, ip: &str) -> Result<bool> {
        Ok(self.ledger.is_whitelisted(ip)?)
    }

    /// Current listing for an IP, deny first
    pub fn listing(&self, ip: &str) -> Result<Option<ReputationEntry>> {
        if let Some(entry) = self.ledger.listed(ip, ListStatus::Deny)? {
            return Ok(Some(entry));
        }
        Ok(self.ledger.listed(ip, ListStatus::Allow)?)
    }

    /// Get recent events, newest first
    pub fn recent_events(&self, limit: u32) -> Result<Vec<Event>> {
        Ok(self.store.recent_events(limit)?)
    }

    /// Aggregate counters for one day
    pub fn daily_stat(&self, day: NaiveDate) -> Result<Option<DailyStat>> {
        Ok(self.store.daily_stat(day)?)
    }

    /// Count of stored events of a type
    pub fn count_events(&self, kind: EventType) -> Result<u64> {
        Ok(self.store.count_events(kind)?)
    }

    /// Daily maintenance: cap per-type row counts and sweep long-expired
    /// allow/deny rows. Idempotent; safe to run more than once a day and
    /// alongside live traffic.
    pub fn daily_cleanup(&self) -> Result<u64> {
        let retention = &self.config.retention;
        let mut total = 0;

        for (kind, retain) in [
            (EventType::NotFound, retention.e404s),
            (EventType::Login, retention.logins),
            (EventType::AllowDeny, retention.allow_deny),
            (EventType::Activity, retention.activity),
        ] {
            match self.store.cleanup(kind, retain) {
                Ok(deleted) if deleted > 0 => {
                    total += deleted;
                    self.log_activity(&format!(
                        "[removed-{deleted}-limit-{retain}] {kind} database maintenance."
                    ));
                }
                Ok(_) => {}
                Err(err) => warn!(%kind, %err, "cleanup failed"),
            }
        }

        match self
            .store
            .expire_stale_allow_deny(Duration::days(i64::from(retention.grace_days)))
        {
            Ok(deleted) if deleted > 0 => {
                total += deleted;
                self.log_activity(&format!("[removed-{deleted}-expired] allow_deny database maintenance."));
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "expiry sweep failed"),
        }

        if total > 0 {
            info!(total, "daily cleanup removed rows");
        }

        Ok(total)
    }

    fn log_activity(&self, details: &str) {
        let mut event = Event::new(EventType::Activity, Some(EventStatus::Automatic));
        event.details = details.to_string();
        if let Err(err) = self.store.record(&event) {
            warn!(%err, "failed to record activity");
        }
    }

    /// Get configuration reference
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Direct access to the backing event store
    pub fn store(&self) -> &EventStore {
        &self.store
    }
}
