use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::IpAddr;
use std::path::PathBuf;
use tabled::{settings::Style, Table, Tabled};

use autoban::config::Config;
use autoban::models::{EventType, Signal};
use autoban::Autoban;

#[derive(Parser)]
#[command(name = "autoban")]
#[command(author, version, about = "Adaptive IP reputation and rate-limiting engine")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show current listing and recent failure history for an IP
    Check {
        /// IP address to look up
        ip: IpAddr,
    },

    /// Blacklist an IP address
    Ban {
        /// IP address to ban
        ip: IpAddr,

        /// Ban duration in minutes
        #[arg(short, long, default_value = "1440")]
        minutes: u32,

        /// Reason for the ban
        #[arg(short, long, default_value = "")]
        reason: String,
    },

    /// Whitelist an IP address
    Allow {
        /// IP address to whitelist
        ip: IpAddr,

        /// Listing duration in days
        #[arg(long, default_value = "365")]
        days: u32,

        /// Comment/reason
        #[arg(short, long, default_value = "")]
        reason: String,
    },

    /// Report a failed login attempt (for log-shipper integration)
    Report {
        /// Source IP of the attempt
        ip: IpAddr,

        /// Username that was tried
        #[arg(short, long, default_value = "")]
        username: String,
    },

    /// Show recent events
    Events {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show daily statistics
    Stats {
        /// Day to report (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Run the daily retention cleanup
    Cleanup,

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Table row for the events listing
#[derive(Tabled)]
struct EventRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "User")]
    username: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Score")]
    score: u8,
    #[tabled(rename = "Details")]
    details: String,
}

pub fn run_command(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    match cli.command {
        Commands::Check { ip } => cmd_check(config, ip),
        Commands::Ban {
            ip,
            minutes,
            reason,
        } => cmd_ban(config, ip, minutes, reason),
        Commands::Allow { ip, days, reason } => cmd_allow(config, ip, days, reason),
        Commands::Report { ip, username } => cmd_report(config, ip, username),
        Commands::Events { limit } => cmd_events(config, limit),
        Commands::Stats { date } => cmd_stats(config, date),
        Commands::Cleanup => cmd_cleanup(config),
        Commands::GenConfig { output } => cmd_gen_config(output),
    }
}

fn cmd_check(config: Config, ip: IpAddr) -> Result<()> {
    let autoban = Autoban::new(config)?;
    let ip = ip.to_string();

    match autoban.listing(&ip)? {
        Some(entry) => {
            let label = format!("{}: {}", ip, entry.status.as_str().to_uppercase());
            match entry.status {
                autoban::models::ListStatus::Deny => println!("{}", label.red().bold()),
                autoban::models::ListStatus::Allow => println!("{}", label.green().bold()),
            }
            if let Some(expire) = entry.expire_at {
                println!("Expires: {}", expire.to_rfc3339());
            }
            if !entry.details.is_empty() {
                println!("Details: {}", entry.details);
            }
        }
        None => println!("{}", format!("{ip}: not listed").dimmed()),
    }

    Ok(())
}

fn cmd_ban(config: Config, ip: IpAddr, minutes: u32, reason: String) -> Result<()> {
    let autoban = Autoban::new(config)?;
    let expire = Utc::now() + Duration::minutes(i64::from(minutes));

    autoban.ban(&ip.to_string(), expire, &reason)?;
    println!("Banned {} until {}", ip, expire.to_rfc3339());
    Ok(())
}

fn cmd_allow(config: Config, ip: IpAddr, days: u32, reason: String) -> Result<()> {
    let autoban = Autoban::new(config)?;
    let expire = Utc::now() + Duration::days(i64::from(days));

    autoban.allow(&ip.to_string(), expire, &reason)?;
    println!("Whitelisted {} until {}", ip, expire.to_rfc3339());
    Ok(())
}

fn cmd_report(config: Config, ip: IpAddr, username: String) -> Result<()> {
    let autoban = Autoban::new(config)?;
    let signal = Signal::login(ip.to_string(), username);

    let (mut ctx, decision) = autoban.evaluate(&signal);
    if !decision.allowed {
        println!(
            "{}",
            decision
                .block_reason
                .unwrap_or_else(|| "Blocked.".to_string())
                .red()
        );
        return Ok(());
    }

    let outcome = autoban.record_login(&mut ctx, &signal, false);
    match outcome.block_reason {
        Some(reason) => println!("{}", reason.red().bold()),
        None => println!("Recorded failed login from {ip}"),
    }

    Ok(())
}

fn cmd_events(config: Config, limit: u32) -> Result<()> {
    let autoban = Autoban::new(config)?;
    let events = autoban.recent_events(limit)?;

    if events.is_empty() {
        println!("No events recorded");
        return Ok(());
    }

    let rows: Vec<EventRow> = events
        .iter()
        .map(|e| EventRow {
            time: e.date.format("%Y-%m-%d %H:%M:%S").to_string(),
            kind: e.kind.to_string(),
            ip: e.ip.clone(),
            username: e.username.clone(),
            status: e.status.map(|s| s.to_string()).unwrap_or_default(),
            score: e.score,
            details: e.details.clone(),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    Ok(())
}

fn cmd_stats(config: Config, date: Option<NaiveDate>) -> Result<()> {
    let autoban = Autoban::new(config)?;
    let day = date.unwrap_or_else(|| Utc::now().date_naive());

    match autoban.daily_stat(day)? {
        Some(stats) => {
            println!("{}", format!("Statistics for {day}").bold());
            println!("404s:            {}", stats.e404s);
            println!("404 threats:     {}", stats.e404s_threats);
            println!("Blocked:         {}", stats.blocked);
            println!("Threats:         {}", stats.threats);
            println!("Logins:          {}", stats.logins);
            println!("  failed:        {}", stats.logins_failed);
            println!("  success:       {}", stats.logins_success);
            println!("  threats:       {}", stats.logins_threats);
            println!("  blocked:       {}", stats.logins_blocked);
        }
        None => println!("No statistics recorded for {day}"),
    }

    Ok(())
}

fn cmd_cleanup(config: Config) -> Result<()> {
    let autoban = Autoban::new(config)?;
    let removed = autoban.daily_cleanup()?;

    println!("Cleanup removed {removed} rows");
    for kind in [
        EventType::NotFound,
        EventType::Login,
        EventType::AllowDeny,
        EventType::Activity,
    ] {
        println!("  {}: {} rows retained", kind, autoban.count_events(kind)?);
    }

    Ok(())
}

fn cmd_gen_config(output: Option<PathBuf>) -> Result<()> {
    let config = Config::default();
    let content = toml::to_string_pretty(&config)?;

    match output {
        Some(path) => {
            std::fs::write(&path, content)?;
            println!("Wrote default config to {}", path.display());
        }
        None => print!("{content}"),
    }

    Ok(())
}
