use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Category of a recorded security event.
///
/// The string forms double as the `type` column values of the events table and
/// must stay stable for compatibility with existing deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "404s")]
    NotFound,
    #[serde(rename = "logins")]
    Login,
    #[serde(rename = "xmlrpc")]
    XmlRpc,
    #[serde(rename = "allow_deny")]
    AllowDeny,
    #[serde(rename = "activity")]
    Activity,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NotFound => "404s",
            EventType::Login => "logins",
            EventType::XmlRpc => "xmlrpc",
            EventType::AllowDeny => "allow_deny",
            EventType::Activity => "activity",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "404s" => Ok(EventType::NotFound),
            "logins" => Ok(EventType::Login),
            "xmlrpc" => Ok(EventType::XmlRpc),
            "allow_deny" => Ok(EventType::AllowDeny),
            "activity" => Ok(EventType::Activity),
            other => Err(EngineError::UnknownEventType(other.to_string())),
        }
    }
}

/// Outcome attached to an event. Plain log entries (e.g. an ordinary 404)
/// carry no status at all, stored as an empty string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Failed,
    Blocked,
    Allow,
    Deny,
    Test,
    Manual,
    Automatic,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Failed => "failed",
            EventStatus::Blocked => "blocked",
            EventStatus::Allow => "allow",
            EventStatus::Deny => "deny",
            EventStatus::Test => "test",
            EventStatus::Manual => "manual",
            EventStatus::Automatic => "automatic",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(EventStatus::Success),
            "failed" => Ok(EventStatus::Failed),
            "blocked" => Ok(EventStatus::Blocked),
            "allow" => Ok(EventStatus::Allow),
            "deny" => Ok(EventStatus::Deny),
            "test" => Ok(EventStatus::Test),
            "manual" => Ok(EventStatus::Manual),
            "automatic" => Ok(EventStatus::Automatic),
            other => Err(EngineError::UnknownEventStatus(other.to_string())),
        }
    }
}

/// One recorded security event. Rows are append-only: never mutated after
/// insert, removed only by retention cleanup or the allow/deny expiry sweep.
///
/// `expire_at` is meaningful only for `allow_deny` rows; the store writes NULL
/// for every other type regardless of what the caller sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    pub kind: EventType,
    pub date: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub ip: String,
    pub username: String,
    pub uri: String,
    pub referer: String,
    pub user_agent: String,
    pub threats: bool,
    pub status: Option<EventStatus>,
    pub details: String,
    pub score: u8,
}

impl Event {
    pub fn new(kind: EventType, status: Option<EventStatus>) -> Self {
        Self {
            id: None,
            kind,
            date: Utc::now(),
            expire_at: None,
            ip: String::new(),
            username: String::new(),
            uri: String::new(),
            referer: String::new(),
            user_agent: String::new(),
            threats: false,
            status,
            details: String::new(),
            score: 0,
        }
    }

    /// Build an event carrying the request identity of an inbound signal.
    pub fn from_signal(kind: EventType, status: Option<EventStatus>, signal: &Signal) -> Self {
        let mut event = Self::new(kind, status);
        event.ip = signal.ip.clone();
        event.username = signal.username.clone().unwrap_or_default();
        event.uri = signal.uri.clone().unwrap_or_default();
        event.referer = signal.referer.clone().unwrap_or_default();
        event.user_agent = signal.user_agent.clone().unwrap_or_default();
        event
    }
}

/// Request category of an inbound signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Login,
    NotFound,
    XmlRpc,
}

/// Inbound request signal from the HTTP/login layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub ip: String,
    pub kind: SignalKind,
    pub username: Option<String>,
    pub uri: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

impl Signal {
    pub fn login(ip: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            kind: SignalKind::Login,
            username: Some(username.into()),
            uri: None,
            referer: None,
            user_agent: None,
        }
    }

    pub fn not_found(ip: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            kind: SignalKind::NotFound,
            username: None,
            uri: Some(uri.into()),
            referer: None,
            user_agent: None,
        }
    }

    pub fn xmlrpc(ip: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            kind: SignalKind::XmlRpc,
            username: Some(username.into()),
            uri: Some("/xmlrpc.php".to_string()),
            referer: None,
            user_agent: None,
        }
    }
}

/// Outbound decision handed back to the HTTP/login layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub block_reason: Option<String>,
    pub retry_after: Option<Duration>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            block_reason: None,
            retry_after: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            block_reason: Some(reason.into()),
            retry_after: None,
        }
    }

    pub fn lockout(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            block_reason: Some(reason.into()),
            retry_after: Some(retry_after),
        }
    }
}

/// Allow/deny projection of the reputation ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListStatus {
    Allow,
    Deny,
}

impl ListStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListStatus::Allow => "allow",
            ListStatus::Deny => "deny",
        }
    }
}

/// Materialized view over the most relevant `allow_deny` row for an IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationEntry {
    pub status: ListStatus,
    pub created_at: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub details: String,
}

impl ReputationEntry {
    /// Whole-minute duration of a timed listing, zero when untimed.
    pub fn duration_minutes(&self) -> i64 {
        self.expire_at
            .map(|exp| (exp - self.created_at).num_minutes())
            .unwrap_or(0)
    }
}

/// Per-day aggregate counters, one row per calendar day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: Option<NaiveDate>,
    pub e404s: u64,
    pub e404s_threats: u64,
    pub blocked: u64,
    pub threats: u64,
    pub logins: u64,
    pub logins_failed: u64,
    pub logins_success: u64,
    pub logins_threats: u64,
    pub logins_blocked: u64,
}
