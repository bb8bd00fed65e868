use chrono::{Duration, Utc};

use autoban::config::{Config, UsernameConfig};
use autoban::models::{Event, EventStatus, EventType, Signal};
use autoban::Autoban;

fn instance(config: Config) -> Autoban {
    Autoban::open_memory(config).unwrap()
}

fn fail_login(autoban: &Autoban, ip: &str, username: &str) -> autoban::models::Decision {
    let signal = Signal::login(ip, username);
    let (mut ctx, decision) = autoban.evaluate(&signal);
    if !decision.allowed {
        return decision;
    }
    autoban.record_login(&mut ctx, &signal, false)
}

#[test]
fn unknown_ip_is_not_listed() {
    let autoban = instance(Config::default());
    assert!(!autoban.is_whitelisted("203.0.113.5").unwrap());
    assert!(!autoban.is_blacklisted("203.0.113.5").unwrap());
}

#[test]
fn six_rapid_failures_earn_a_ten_minute_ban() {
    let autoban = instance(Config::default());

    let mut locked = None;
    for _ in 0..6 {
        let decision = fail_login(&autoban, "203.0.113.5", "admin");
        if !decision.allowed {
            locked = Some(decision);
            break;
        }
    }

    let decision = locked.expect("ban threshold never reached");
    assert_eq!(decision.retry_after, Some(Duration::minutes(10)));
    assert!(autoban.is_blacklisted("203.0.113.5").unwrap());

    let entry = autoban.listing("203.0.113.5").unwrap().unwrap();
    assert!((9..=10).contains(&entry.duration_minutes()));
    assert_eq!(entry.details, "Too many offenses. Blacklisted for 10 minutes.");
}

#[test]
fn banned_ip_stays_banned_under_further_attempts() {
    let autoban = instance(Config::default());

    for _ in 0..6 {
        fail_login(&autoban, "203.0.113.5", "admin");
    }
    let first = autoban.listing("203.0.113.5").unwrap().unwrap();

    // Further attempts while banned must not stack a second ban.
    for _ in 0..3 {
        let decision = fail_login(&autoban, "203.0.113.5", "admin");
        assert!(!decision.allowed);
    }

    let after = autoban.listing("203.0.113.5").unwrap().unwrap();
    assert_eq!(after.created_at, first.created_at);
    assert_eq!(after.expire_at, first.expire_at);
}

#[test]
fn tier_escalates_with_each_expired_ban() {
    let autoban = instance(Config::default());
    let now = Utc::now();

    // Simulate a prior 10-minute ban that has since expired.
    let mut prior = Event::new(EventType::AllowDeny, Some(EventStatus::Deny));
    prior.ip = "203.0.113.5".to_string();
    prior.date = now - Duration::hours(2);
    prior.expire_at = Some(prior.date + Duration::minutes(10));
    autoban.store().record(&prior).unwrap();

    for _ in 0..5 {
        fail_login(&autoban, "203.0.113.5", "admin");
    }

    let entry = autoban.listing("203.0.113.5").unwrap().unwrap();
    assert!((59..=60).contains(&entry.duration_minutes()));
    assert_eq!(entry.details, "Too many offenses. Blacklisted for 1 hour.");
}

#[test]
fn long_prior_ban_escalates_to_days() {
    let autoban = instance(Config::default());
    let now = Utc::now();

    let mut prior = Event::new(EventType::AllowDeny, Some(EventStatus::Deny));
    prior.ip = "203.0.113.5".to_string();
    prior.date = now - Duration::days(2);
    prior.expire_at = Some(prior.date + Duration::hours(1));
    autoban.store().record(&prior).unwrap();

    for _ in 0..5 {
        fail_login(&autoban, "203.0.113.5", "admin");
    }

    let entry = autoban.listing("203.0.113.5").unwrap().unwrap();
    assert!((1439..=1440).contains(&entry.duration_minutes()));
    assert_eq!(entry.details, "Too many offenses. Blacklisted for 1 day.");
}

#[test]
fn plain_usernames_still_trigger_the_ban() {
    let autoban = instance(Config::default());

    // "alice" is neither common nor blocked; the failure itself scores 1,
    // so rotating uncommon usernames cannot dodge the limiter.
    let mut locked = None;
    for _ in 0..6 {
        let decision = fail_login(&autoban, "203.0.113.5", "alice");
        if !decision.allowed {
            locked = Some(decision);
            break;
        }
    }

    assert!(locked.is_some(), "failures under rotating usernames must ban");
    assert!(autoban.is_blacklisted("203.0.113.5").unwrap());
}

#[test]
fn unflagged_failure_rows_do_not_count_toward_the_ban() {
    let autoban = instance(Config::default());

    // Rows written without the threat flag (the window query sums flags,
    // not rows) never advance the limiter.
    for _ in 0..10 {
        let mut ev = Event::new(EventType::Login, Some(EventStatus::Failed));
        ev.ip = "203.0.113.5".to_string();
        autoban.store().record(&ev).unwrap();
    }

    let decision = fail_login(&autoban, "203.0.113.5", "alice");
    // One flagged failure on top of ten unflagged rows stays under threshold.
    assert!(decision.allowed);
    assert!(!autoban.is_blacklisted("203.0.113.5").unwrap());
}

#[test]
fn whitelisted_ip_is_never_banned() {
    let autoban = instance(Config::default());
    autoban
        .allow("203.0.113.5", Utc::now() + Duration::days(30), "office")
        .unwrap();

    for _ in 0..10 {
        let decision = fail_login(&autoban, "203.0.113.5", "admin");
        assert!(decision.allowed);
    }

    assert!(!autoban.is_blacklisted("203.0.113.5").unwrap());
}

#[test]
fn blocked_username_short_circuits_authentication() {
    let config = Config {
        usernames: UsernameConfig {
            block_enabled: true,
            block_list: vec!["admin".to_string()],
        },
        ..Default::default()
    };
    let autoban = instance(config);

    let signal = Signal::login("203.0.113.5", "admin");
    let (ctx, decision) = autoban.evaluate(&signal);

    assert!(!decision.allowed);
    assert!(ctx.login_error);
    assert_eq!(
        decision.block_reason.as_deref(),
        Some("Please contact the site administrator for assistance.")
    );

    let events = autoban.recent_events(1).unwrap();
    assert_eq!(events[0].kind, EventType::Login);
    assert_eq!(events[0].status, Some(EventStatus::Failed));
    assert_eq!(events[0].score, 10);
    assert_eq!(events[0].details, "Username is blocked.");
}

#[test]
fn hostile_404_is_blocked_and_probing_404_is_logged() {
    let autoban = instance(Config::default());

    let (_, decision) = autoban.evaluate(&Signal::not_found("203.0.113.5", "/wp-config.php"));
    assert!(!decision.allowed);
    assert_eq!(decision.block_reason.as_deref(), Some("Multiple threat detection."));

    // A backup-extension probe scores 1: logged with the threat flag, allowed.
    let (_, decision) = autoban.evaluate(&Signal::not_found("203.0.113.5", "/db-backup.sql"));
    assert!(decision.allowed);

    let events = autoban.recent_events(2).unwrap();
    assert!(events[0].threats);
    assert_eq!(events[0].status, None);
    assert_eq!(events[1].status, Some(EventStatus::Blocked));
    assert_eq!(events[1].score, 2);
}

#[test]
fn xmlrpc_requests_are_blocked_and_feed_the_limiter() {
    let autoban = instance(Config::default());

    for _ in 0..6 {
        let signal = Signal::xmlrpc("203.0.113.5", "admin");
        let (mut ctx, decision) = autoban.evaluate(&signal);
        assert!(!decision.allowed);
        // The XML-RPC login failure is recorded alongside the xmlrpc event.
        autoban.record_login(&mut ctx, &signal, false);
    }

    // Each recorded failure carried a threat flag, so the limiter bans.
    assert!(autoban.is_blacklisted("203.0.113.5").unwrap());
    assert!(autoban.count_events(EventType::XmlRpc).unwrap() >= 1);
}

#[test]
fn details_are_truncated_at_512_characters() {
    let autoban = instance(Config::default());
    autoban
        .ban(
            "203.0.113.5",
            Utc::now() + Duration::hours(1),
            &"x".repeat(600),
        )
        .unwrap();

    let entry = autoban.listing("203.0.113.5").unwrap().unwrap();
    assert_eq!(entry.details.chars().count(), 512);
}

#[test]
fn daily_stats_track_the_attack() {
    let autoban = instance(Config::default());

    // Five recorded failures trigger the ban; the sixth attempt arrives
    // already blacklisted and is logged as a blocked login.
    for _ in 0..6 {
        fail_login(&autoban, "203.0.113.5", "admin");
    }

    let stats = autoban
        .daily_stat(Utc::now().date_naive())
        .unwrap()
        .unwrap();
    assert_eq!(stats.logins, 6);
    assert_eq!(stats.logins_failed, 5);
    assert_eq!(stats.logins_threats, 6);
    assert_eq!(stats.logins_blocked, 1);
    assert_eq!(stats.blocked, 1);
}
