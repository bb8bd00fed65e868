use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::config::AutoblockConfig;
use crate::error::Result;
use crate::ledger::ReputationLedger;
use crate::store::EventStore;

/// Escalation bracket for a new ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanTier {
    Minutes,
    Hours,
    Days,
}

/// Outcome of a rate-limit evaluation that resulted in a ban.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanDecision {
    pub tier: BanTier,
    pub duration: Duration,
    pub expire_at: DateTime<Utc>,
    pub details: String,
}

/// The adaptive banning engine. Aggregates threat-flagged login failures over
/// a sliding window and escalates a timed deny listing when the configured
/// threshold is reached.
///
/// Callers must check the reputation ledger first: `evaluate` assumes the IP
/// is not currently listed and never re-checks, so calling it for a banned IP
/// would record a second overlapping ban.
pub struct RateLimiter {
    store: EventStore,
    ledger: ReputationLedger,
    config: AutoblockConfig,
}

impl RateLimiter {
    pub fn new(store: EventStore, ledger: ReputationLedger, config: AutoblockConfig) -> Self {
        Self {
            store,
            ledger,
            config,
        }
    }

    /// Evaluate an IP's recent failure history and ban it if over threshold.
    ///
    /// Returns `Some` when a new ban was recorded, `None` when the IP stays
    /// under the threshold or the feature is disabled.
    pub fn evaluate(&self, ip: &str) -> Result<Option<BanDecision>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let now = Utc::now();
        let since = now - Duration::minutes(i64::from(self.config.timespan_minutes));
        let total = self.store.login_failure_score(ip, since, now)?;

        debug!(
            ip,
            total,
            threshold = self.config.threat_threshold,
            "rate limit window evaluated"
        );

        if total < self.config.threat_threshold {
            return Ok(None);
        }

        let decision = self.pick_tier(ip, now)?;
        self.ledger
            .ban(ip, decision.expire_at, decision.details.clone())?;

        info!(ip, tier = ?decision.tier, expire = %decision.expire_at, "rate limit exceeded");
        Ok(Some(decision))
    }

    /// Pick the escalation tier from the single most recent timed deny row.
    ///
    /// There is no persistent strike counter. The tier is re-derived each time
    /// from the last ban's duration, so after a long ban ages out the sequence
    /// starts over at tier 1. That reset is intentional decay behavior.
    fn pick_tier(&self, ip: &str, now: DateTime<Utc>) -> Result<BanDecision> {
        let prior = self.ledger.last_timed_deny(ip)?;

        let tier = match prior {
            None => BanTier::Minutes,
            Some(entry) => {
                let diff = entry.duration_minutes();
                if diff != 0 && diff < i64::from(self.config.ban_1_minutes) + 1 {
                    BanTier::Hours
                } else {
                    BanTier::Days
                }
            }
        };

        let (duration, span) = match tier {
            BanTier::Minutes => (
                Duration::minutes(i64::from(self.config.ban_1_minutes)),
                span_text(self.config.ban_1_minutes, "minute"),
            ),
            BanTier::Hours => (
                Duration::hours(i64::from(self.config.ban_2_hours)),
                span_text(self.config.ban_2_hours, "hour"),
            ),
            BanTier::Days => (
                Duration::days(i64::from(self.config.ban_3_days)),
                span_text(self.config.ban_3_days, "day"),
            ),
        };

        Ok(BanDecision {
            tier,
            duration,
            expire_at: now + duration,
            details: format!("Too many offenses. Blacklisted for {span}."),
        })
    }
}

/// "1 minute", "10 minutes", "2 hours".
pub fn span_text(amount: u32, unit: &str) -> String {
    if amount == 1 {
        format!("1 {unit}")
    } else {
        format!("{amount} {unit}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Event, EventStatus, EventType};

    fn setup() -> (EventStore, RateLimiter) {
        let store = EventStore::open_memory().unwrap();
        let ledger = ReputationLedger::new(store.clone());
        let limiter = RateLimiter::new(store.clone(), ledger, AutoblockConfig::default());
        (store, limiter)
    }

    fn record_failures(store: &EventStore, ip: &str, count: usize) {
        for _ in 0..count {
            let mut ev = Event::new(EventType::Login, Some(EventStatus::Failed));
            ev.ip = ip.to_string();
            ev.threats = true;
            ev.score = 1;
            store.record(&ev).unwrap();
        }
    }

    fn seed_deny(store: &EventStore, ip: &str, age: Duration, length: Duration) {
        let mut ev = Event::new(EventType::AllowDeny, Some(EventStatus::Deny));
        ev.ip = ip.to_string();
        ev.date = Utc::now() - age;
        ev.expire_at = Some(ev.date + length);
        store.record(&ev).unwrap();
    }

    #[test]
    fn test_under_threshold_no_ban() {
        let (store, limiter) = setup();
        record_failures(&store, "203.0.113.5", 4);
        assert_eq!(limiter.evaluate("203.0.113.5").unwrap(), None);
    }

    #[test]
    fn test_first_offense_is_tier_1() {
        let (store, limiter) = setup();
        record_failures(&store, "203.0.113.5", 5);

        let decision = limiter.evaluate("203.0.113.5").unwrap().unwrap();
        assert_eq!(decision.tier, BanTier::Minutes);
        assert_eq!(
            decision.details,
            "Too many offenses. Blacklisted for 10 minutes."
        );

        let minutes = (decision.expire_at - Utc::now()).num_minutes();
        assert!((9..=10).contains(&minutes));
    }

    #[test]
    fn test_short_prior_ban_escalates_to_tier_2() {
        let (store, limiter) = setup();
        // Expired 10-minute ban on record.
        seed_deny(
            &store,
            "203.0.113.5",
            Duration::hours(2),
            Duration::minutes(10),
        );
        record_failures(&store, "203.0.113.5", 5);

        let decision = limiter.evaluate("203.0.113.5").unwrap().unwrap();
        assert_eq!(decision.tier, BanTier::Hours);
        assert_eq!(
            decision.details,
            "Too many offenses. Blacklisted for 1 hour."
        );
    }

    #[test]
    fn test_long_prior_ban_escalates_to_tier_3() {
        let (store, limiter) = setup();
        // Expired 1-hour ban on record.
        seed_deny(
            &store,
            "203.0.113.5",
            Duration::hours(5),
            Duration::hours(1),
        );
        record_failures(&store, "203.0.113.5", 5);

        let decision = limiter.evaluate("203.0.113.5").unwrap().unwrap();
        assert_eq!(decision.tier, BanTier::Days);
        assert_eq!(decision.details, "Too many offenses. Blacklisted for 1 day.");
    }

    #[test]
    fn test_only_most_recent_prior_ban_is_inspected() {
        let (store, limiter) = setup();
        // Older 1-day ban, then a newer 10-minute one. Tier derives from the
        // newer row only, so the next ban is tier 2, not tier 3.
        seed_deny(&store, "203.0.113.5", Duration::days(10), Duration::days(1));
        seed_deny(
            &store,
            "203.0.113.5",
            Duration::hours(1),
            Duration::minutes(10),
        );
        record_failures(&store, "203.0.113.5", 5);

        let decision = limiter.evaluate("203.0.113.5").unwrap().unwrap();
        assert_eq!(decision.tier, BanTier::Hours);
    }

    #[test]
    fn test_disabled_never_bans() {
        let store = EventStore::open_memory().unwrap();
        let ledger = ReputationLedger::new(store.clone());
        let config = AutoblockConfig {
            enabled: false,
            ..Default::default()
        };
        let limiter = RateLimiter::new(store.clone(), ledger, config);

        record_failures(&store, "203.0.113.5", 20);
        assert_eq!(limiter.evaluate("203.0.113.5").unwrap(), None);
    }

    #[test]
    fn test_span_text_pluralizes() {
        assert_eq!(span_text(1, "minute"), "1 minute");
        assert_eq!(span_text(10, "minute"), "10 minutes");
        assert_eq!(span_text(1, "day"), "1 day");
        assert_eq!(span_text(3, "hour"), "3 hours");
    }
}
