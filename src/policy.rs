use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::Result;
use crate::ledger::ReputationLedger;
use crate::limiter::{span_text, RateLimiter};
use crate::models::{Decision, Event, EventStatus, EventType, ListStatus, Signal, SignalKind};
use crate::store::EventStore;
use crate::threats::ThreatScorer;

/// Per-request state threaded through every policy check. One context per
/// inbound request; never shared across requests.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// IP holds an unexpired allow listing; all checks are skipped.
    pub whitelisted: bool,
    /// IP holds an unexpired deny listing, found at request start or created
    /// mid-request by the rate limiter.
    pub blacklisted: bool,
    /// A custom login error was already produced this request. Failed-login
    /// recording is skipped (the event exists) and error sanitizing leaves
    /// the custom message in place.
    pub login_error: bool,
    /// The rate limiter already ran this request; checked before re-running
    /// so a login failure and an XML-RPC check never double-evaluate.
    pub evaluated: bool,
    /// Expiry of the listing that blacklisted this request, for wait text.
    pub ban_expires: Option<DateTime<Utc>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of one policy's look at a request.
pub enum PolicyOutcome {
    /// Nothing to object to; the next policy runs.
    Continue,
    /// Terminal verdict for this request.
    Block(Decision),
}

/// A single firewall check. Policies are registered at startup and iterated
/// in a fixed order for every signal kind they claim.
pub trait FirewallPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    fn handles(&self, kind: SignalKind) -> bool;
    fn check(&self, ctx: &mut RequestContext, signal: &Signal) -> Result<PolicyOutcome>;
}

/// Hard-blocks login attempts using an admin-listed username before password
/// verification is ever reached.
struct BlockUsernamesPolicy {
    scorer: Arc<ThreatScorer>,
    store: EventStore,
    enabled: bool,
}

impl FirewallPolicy for BlockUsernamesPolicy {
    fn name(&self) -> &'static str {
        "block_usernames"
    }

    fn handles(&self, kind: SignalKind) -> bool {
        matches!(kind, SignalKind::Login | SignalKind::XmlRpc)
    }

    fn check(&self, ctx: &mut RequestContext, signal: &Signal) -> Result<PolicyOutcome> {
        if !self.enabled {
            return Ok(PolicyOutcome::Continue);
        }

        let username = signal.username.as_deref().unwrap_or("");
        if !self.scorer.is_blocked_username(username) {
            return Ok(PolicyOutcome::Continue);
        }

        let mut event = Event::from_signal(EventType::Login, Some(EventStatus::Failed), signal);
        event.threats = true;
        event.score = 10;
        event.details = "Username is blocked.".to_string();
        self.store.record(&event)?;

        ctx.login_error = true;
        info!(ip = %signal.ip, username, "blocked username rejected");

        Ok(PolicyOutcome::Block(Decision::block(
            "Please contact the site administrator for assistance.",
        )))
    }
}

/// Scores 404 requests and blocks the plainly hostile ones. Everything else
/// is logged with its score so repeat probing stays visible.
struct NotFoundPolicy {
    scorer: Arc<ThreatScorer>,
    store: EventStore,
}

impl FirewallPolicy for NotFoundPolicy {
    fn name(&self) -> &'static str {
        "404s"
    }

    fn handles(&self, kind: SignalKind) -> bool {
        kind == SignalKind::NotFound
    }

    fn check(&self, _ctx: &mut RequestContext, signal: &Signal) -> Result<PolicyOutcome> {
        let uri = signal.uri.as_deref().unwrap_or("");
        let filename = uri
            .split('?')
            .next()
            .and_then(|path| path.rsplit('/').next())
            .unwrap_or("");

        let score = self.scorer.score_filename(filename) + self.scorer.score_uri(uri);

        let mut event = Event::from_signal(EventType::NotFound, None, signal);
        event.threats = score > 0;
        event.score = score;

        if score > 1 {
            event.status = Some(EventStatus::Blocked);
            event.details = "Multiple threat detection.".to_string();
            self.store.record(&event)?;

            info!(ip = %signal.ip, uri, score, "hostile 404 blocked");
            return Ok(PolicyOutcome::Block(Decision::block(
                "Multiple threat detection.",
            )));
        }

        self.store.record(&event)?;
        Ok(PolicyOutcome::Continue)
    }
}

/// Treats every XML-RPC request as a threat: records it, feeds the rate
/// limiter, then blocks unconditionally.
struct XmlRpcPolicy {
    store: EventStore,
    limiter: Arc<RateLimiter>,
}

impl FirewallPolicy for XmlRpcPolicy {
    fn name(&self) -> &'static str {
        "xmlrpc"
    }

    fn handles(&self, kind: SignalKind) -> bool {
        kind == SignalKind::XmlRpc
    }

    fn check(&self, ctx: &mut RequestContext, signal: &Signal) -> Result<PolicyOutcome> {
        let mut event = Event::from_signal(EventType::XmlRpc, Some(EventStatus::Blocked), signal);
        event.threats = true;
        event.score = 1;
        event.details = "XML-RPC services are disabled.".to_string();
        self.store.record(&event)?;

        if let Some(ban) = rate_limit_once(&self.limiter, ctx, &signal.ip)? {
            return Ok(PolicyOutcome::Block(ban));
        }

        Ok(PolicyOutcome::Block(Decision::block(
            "XML-RPC services are disabled.",
        )))
    }
}

/// Run the rate limiter at most once per request. A second call in the same
/// request observes the first call's outcome through the context.
fn rate_limit_once(
    limiter: &RateLimiter,
    ctx: &mut RequestContext,
    ip: &str,
) -> Result<Option<Decision>> {
    if ctx.evaluated {
        if ctx.blacklisted {
            return Ok(Some(lockout_decision(ctx.ban_expires, Utc::now())));
        }
        return Ok(None);
    }

    ctx.evaluated = true;
    if ctx.blacklisted || ctx.whitelisted {
        return Ok(None);
    }

    match limiter.evaluate(ip)? {
        Some(ban) => {
            ctx.blacklisted = true;
            ctx.ban_expires = Some(ban.expire_at);
            ctx.login_error = true;
            // Fresh bans report their nominal duration; an elapsed-time
            // calculation here would floor "10 minutes" down to 9.
            Ok(Some(Decision::lockout(
                format!(
                    "Too many failed attempts. Please try again in {}.",
                    wait_text(ban.duration)
                ),
                ban.duration,
            )))
        }
        None => Ok(None),
    }
}

/// Lockout message with a humanized remaining-time estimate.
fn lockout_decision(expire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Decision {
    match expire_at {
        Some(expire) => {
            let wait = expire - now;
            Decision::lockout(
                format!(
                    "Too many failed attempts. Please try again in {}.",
                    wait_text(wait)
                ),
                wait,
            )
        }
        None => Decision::block("Access denied."),
    }
}

/// "3 days", "1 hour", "10 minutes". Rounds down to the largest whole unit
/// and never reports less than one minute.
pub fn wait_text(wait: Duration) -> String {
    if wait.num_days() >= 1 {
        span_text(wait.num_days() as u32, "day")
    } else if wait.num_hours() >= 1 {
        span_text(wait.num_hours() as u32, "hour")
    } else {
        span_text(wait.num_minutes().max(1) as u32, "minute")
    }
}

/// Sequences the firewall checks for each request category and records the
/// outcomes. One coordinator per process; contexts are per-request.
pub struct PolicyCoordinator {
    store: EventStore,
    ledger: ReputationLedger,
    limiter: Arc<RateLimiter>,
    scorer: Arc<ThreatScorer>,
    policies: Vec<Box<dyn FirewallPolicy>>,
    debug: bool,
}

impl PolicyCoordinator {
    /// Build the policy registry from config. Registration order is fixed:
    /// username blocks run before anything that would merely log or
    /// rate-limit the same attempt.
    pub fn new(store: EventStore, config: &Config) -> Result<Self> {
        let scorer = Arc::new(ThreatScorer::new(
            &config.usernames.normalized_block_list(),
        )?);
        let ledger = ReputationLedger::new(store.clone());
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            ledger.clone(),
            config.autoblock.clone(),
        ));

        let policies: Vec<Box<dyn FirewallPolicy>> = vec![
            Box::new(BlockUsernamesPolicy {
                scorer: scorer.clone(),
                store: store.clone(),
                enabled: config.usernames.block_enabled,
            }),
            Box::new(NotFoundPolicy {
                scorer: scorer.clone(),
                store: store.clone(),
            }),
            Box::new(XmlRpcPolicy {
                store: store.clone(),
                limiter: limiter.clone(),
            }),
        ];

        Ok(Self {
            store,
            ledger,
            limiter,
            scorer,
            policies,
            debug: config.general.debug,
        })
    }

    /// Evaluate an inbound signal against the reputation ledger and the
    /// policy registry.
    ///
    /// Never errors into the request pipeline: a failing store or policy is
    /// logged and treated as permissive.
    pub fn handle(&self, ctx: &mut RequestContext, signal: &Signal) -> Decision {
        match self.ledger.is_whitelisted(&signal.ip) {
            Ok(true) => {
                ctx.whitelisted = true;
                return Decision::allow();
            }
            Ok(false) => {}
            Err(err) => error!(ip = %signal.ip, %err, "whitelist lookup failed, treating as not listed"),
        }

        match self.ledger.listed(&signal.ip, ListStatus::Deny) {
            Ok(Some(entry)) => {
                ctx.blacklisted = true;
                ctx.ban_expires = entry.expire_at;
                if matches!(signal.kind, SignalKind::Login | SignalKind::XmlRpc) {
                    ctx.login_error = true;
                }

                self.record_blocked(signal, &entry.details);

                let mut decision = lockout_decision(entry.expire_at, Utc::now());
                if self.debug && !entry.details.is_empty() {
                    if let Some(reason) = decision.block_reason.as_mut() {
                        reason.push(' ');
                        reason.push_str(&entry.details);
                    }
                }
                return decision;
            }
            Ok(None) => {}
            Err(err) => error!(ip = %signal.ip, %err, "blacklist lookup failed, treating as not listed"),
        }

        for policy in &self.policies {
            if !policy.handles(signal.kind) {
                continue;
            }

            match policy.check(ctx, signal) {
                Ok(PolicyOutcome::Continue) => {}
                Ok(PolicyOutcome::Block(decision)) => {
                    debug!(policy = policy.name(), ip = %signal.ip, "request blocked");
                    return decision;
                }
                Err(err) => {
                    error!(policy = policy.name(), ip = %signal.ip, %err, "policy check failed, continuing");
                }
            }
        }

        Decision::allow()
    }

    /// Record the outcome of a login attempt and, on failure, run the rate
    /// limiter over the updated history.
    ///
    /// The returned decision is `allow` unless this very failure tipped the
    /// IP over the ban threshold.
    pub fn record_login(&self, ctx: &mut RequestContext, signal: &Signal, success: bool) -> Decision {
        if !success && ctx.login_error {
            // Already recorded by the policy that produced the custom error.
            return Decision::allow();
        }

        let username = signal.username.as_deref().unwrap_or("");
        // Whitelisted visitors are logged but never scored or flagged.
        let mut score = 0;
        if !ctx.whitelisted {
            if !success {
                score += 1;
            }
            score += self.scorer.score_username(username);
            if signal.kind == SignalKind::XmlRpc {
                score += 1;
            }
        }

        let status = if success {
            EventStatus::Success
        } else {
            EventStatus::Failed
        };

        let mut event = Event::from_signal(EventType::Login, Some(status), signal);
        event.threats = score > 0;
        event.score = score;
        if success && score > 0 {
            event.details = "Username is too common.".to_string();
        }

        if let Err(err) = self.store.record(&event) {
            error!(ip = %signal.ip, %err, "failed to record login event");
        }

        if success {
            return Decision::allow();
        }

        match rate_limit_once(&self.limiter, ctx, &signal.ip) {
            Ok(Some(decision)) => decision,
            Ok(None) => Decision::allow(),
            Err(err) => {
                error!(ip = %signal.ip, %err, "rate limit evaluation failed, allowing");
                Decision::allow()
            }
        }
    }

    /// Replace credential errors with a generic message so the response does
    /// not reveal whether the username or the password was wrong. Custom
    /// lockout and block messages pass through untouched.
    pub fn sanitize_login_error<'a>(&self, ctx: &RequestContext, code: &str, message: &'a str) -> &'a str {
        if ctx.login_error {
            return message;
        }

        match code {
            "invalid_username" | "incorrect_password" | "invalid_email" => {
                "Invalid username or password."
            }
            _ => message,
        }
    }

    fn record_blocked(&self, signal: &Signal, details: &str) {
        let kind = match signal.kind {
            SignalKind::Login => EventType::Login,
            SignalKind::NotFound => EventType::NotFound,
            SignalKind::XmlRpc => EventType::XmlRpc,
        };

        let mut event = Event::from_signal(kind, Some(EventStatus::Blocked), signal);
        event.threats = true;
        event.score = 0;
        event.details = details.to_string();

        if let Err(err) = self.store.record(&event) {
            error!(ip = %signal.ip, %err, "failed to record blocked request");
        }
    }
}
