use chrono::{DateTime, Utc};
use std::net::IpAddr;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::models::{Event, EventStatus, EventType, ListStatus, ReputationEntry};
use crate::store::EventStore;

/// Allow/deny reputation view over the event store.
///
/// Listings are ordinary `allow_deny` events; the ledger reads the most recent
/// unexpired row per IP and appends new deny rows when the rate limiter asks
/// for a ban. Rows are never updated in place.
#[derive(Clone)]
pub struct ReputationLedger {
    store: EventStore,
}

impl ReputationLedger {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Current unexpired listing of the given status for an IP.
    ///
    /// A malformed IP yields `None` rather than an error: an unparseable
    /// address can never have earned a listing, and the caller treats `None`
    /// as "not listed" on both the allow and the deny path.
    pub fn listed(&self, ip: &str, status: ListStatus) -> Result<Option<ReputationEntry>> {
        if ip.parse::<IpAddr>().is_err() {
            warn!(ip, "refusing reputation lookup for malformed address");
            return Ok(None);
        }

        self.store.latest_listed(ip, status, Utc::now())
    }

    pub fn is_whitelisted(&self, ip: &str) -> Result<bool> {
        Ok(self.listed(ip, ListStatus::Allow)?.is_some())
    }

    pub fn is_blacklisted(&self, ip: &str) -> Result<bool> {
        Ok(self.listed(ip, ListStatus::Deny)?.is_some())
    }

    /// Most recent timed deny row for an IP, expired or not. Used by the rate
    /// limiter to pick the escalation tier.
    pub fn last_timed_deny(&self, ip: &str) -> Result<Option<ReputationEntry>> {
        if ip.parse::<IpAddr>().is_err() {
            return Ok(None);
        }

        self.store.last_timed_deny(ip)
    }

    /// Append a timed deny row for an IP.
    ///
    /// Silently skipped for malformed addresses: a garbage IP cannot be
    /// banned, and the request pipeline must not error over it. The skip is
    /// logged so the defect stays visible.
    pub fn ban(&self, ip: &str, expire_at: DateTime<Utc>, details: impl Into<String>) -> Result<()> {
        if ip.parse::<IpAddr>().is_err() {
            warn!(ip, "skipping ban of malformed address");
            return Ok(());
        }

        let mut event = Event::new(EventType::AllowDeny, Some(EventStatus::Deny));
        event.ip = ip.to_string();
        event.expire_at = Some(expire_at);
        event.details = details.into();

        self.store.record(&event)?;
        info!(ip, expire = %expire_at, "address blacklisted");
        Ok(())
    }

    /// Append an allow row for an IP, exempting it from all blocking.
    pub fn allow(
        &self,
        ip: &str,
        expire_at: DateTime<Utc>,
        details: impl Into<String>,
    ) -> Result<()> {
        if ip.parse::<IpAddr>().is_err() {
            return Err(EngineError::InvalidIp(ip.to_string()));
        }

        let mut event = Event::new(EventType::AllowDeny, Some(EventStatus::Allow));
        event.ip = ip.to_string();
        event.expire_at = Some(expire_at);
        event.details = details.into();

        self.store.record(&event)?;
        info!(ip, expire = %expire_at, "address whitelisted");
        Ok(())
    }
}
