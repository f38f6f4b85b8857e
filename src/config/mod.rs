//! Runtime configuration loaded from environment variables.
//!
//! The `Config` struct is a read-only snapshot of every tunable the server
//! consults. It is populated once by `from_env` before the acceptor starts
//! and then shared immutably across all sessions; nothing re-reads the
//! environment after startup. Variables may also come from a `.env` file
//! via the `dotenv` crate.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Read-only snapshot of the server tunables.
///
/// Every field maps to one `MAILRECV_*` environment variable; unset
/// variables take the defaults documented on each field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address the SMTP listener binds to. (`MAILRECV_LISTEN_IP`, default `127.0.0.1`)
    pub listen_ip: String,

    /// Port the SMTP listener binds to. (`MAILRECV_LISTEN_PORT`, default `25`)
    pub listen_port: u16,

    /// Per-read deadline in milliseconds; `0` means no deadline.
    /// (`MAILRECV_RECEIVE_TIMEOUT_MS`, default `20000`)
    pub receive_timeout_ms: u64,

    /// Hostname used in the banner and in the HELO spoof check.
    /// (`MAILRECV_HOST_NAME`, default `localhost`)
    pub host_name: String,

    /// Concurrent session ceiling; excess connections get a 421 tempfail.
    /// (`MAILRECV_MAX_SESSIONS`, default `16`)
    pub max_sessions: usize,

    /// Messages accepted per session before further MAIL commands are refused.
    /// (`MAILRECV_MAX_MESSAGES`, default `10`)
    pub max_messages: u32,

    /// Per-session protocol-error ceiling. (`MAILRECV_MAX_SMTP_ERR`, default `4`)
    pub max_smtp_err: u32,

    /// Per-session NOOP ceiling. (`MAILRECV_MAX_SMTP_NOOP`, default `7`)
    pub max_smtp_noop: u32,

    /// Per-session VRFY/EXPN ceiling. (`MAILRECV_MAX_SMTP_VRFY`, default `10`)
    pub max_smtp_vrfy: u32,

    /// Per-message recipient ceiling. (`MAILRECV_MAX_SMTP_RCPT`, default `100`)
    pub max_smtp_rcpt: usize,

    /// Tarpit pause before the banner, in milliseconds.
    /// (`MAILRECV_BANNER_DELAY_MS`, default `0`)
    pub banner_delay_ms: u64,

    /// Tarpit pause multiplied by the session error count after each reply.
    /// (`MAILRECV_ERROR_DELAY_MS`, default `250`)
    pub error_delay_ms: u64,

    /// Bytes of message body kept; a larger body aborts the message with 422.
    /// (`MAILRECV_MAX_DATA_SIZE`, default `65536`)
    pub max_data_size: usize,

    /// Persist envelope and body of each accepted message.
    /// (`MAILRECV_STORE_DATA`, default `false`)
    pub store_data: bool,

    /// Directory message files are written to. (`MAILRECV_STORE_PATH`, default `mailstore`)
    pub store_path: String,

    /// Session log file; unset routes records through the `log` facade only.
    /// (`MAILRECV_LOG_PATH`)
    pub log_path: Option<String>,

    /// Also log every SMTP line exchanged, tagged SND/RCV.
    /// (`MAILRECV_LOG_VERBOSE`, default `false`)
    pub log_verbose: bool,

    /// Reply 421 on DATA (or after storing the body) and close.
    /// (`MAILRECV_DO_TEMPFAIL`, default `false`)
    pub do_tempfail: bool,

    /// Run the lexical HELO/EHLO validation. (`MAILRECV_CHECK_HELO_FORMAT`, default `true`)
    pub check_helo_format: bool,

    /// Detect clients that talk before reading our replies.
    /// (`MAILRECV_EARLY_TALKERS`, default `true`)
    pub early_talkers: bool,

    /// Ordered DNSWL zones, probed before any blacklist.
    /// (`MAILRECV_WHITELISTS`, comma-separated, default empty)
    pub whitelists: Vec<String>,

    /// Ordered DNSBL zones. (`MAILRECV_BLACKLISTS`, comma-separated, default empty)
    pub blacklists: Vec<String>,

    /// Domains mail is accepted for; empty accepts any.
    /// (`MAILRECV_LOCAL_DOMAINS`, comma-separated, default empty)
    pub local_domains: Vec<String>,

    /// Mailboxes mail is accepted for; empty accepts any.
    /// (`MAILRECV_LOCAL_MAILBOXES`, comma-separated, default empty)
    pub local_mailboxes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_ip: "127.0.0.1".to_string(),
            listen_port: 25,
            receive_timeout_ms: 20_000,
            host_name: "localhost".to_string(),
            max_sessions: 16,
            max_messages: 10,
            max_smtp_err: 4,
            max_smtp_noop: 7,
            max_smtp_vrfy: 10,
            max_smtp_rcpt: 100,
            banner_delay_ms: 0,
            error_delay_ms: 250,
            max_data_size: 65_536,
            store_data: false,
            store_path: "mailstore".to_string(),
            log_path: None,
            log_verbose: false,
            do_tempfail: false,
            check_helo_format: true,
            early_talkers: true,
            whitelists: Vec::new(),
            blacklists: Vec::new(),
            local_domains: Vec::new(),
            local_mailboxes: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the configuration snapshot from `MAILRECV_*` environment
    /// variables, falling back to the documented default for each unset key.
    ///
    /// # Errors
    ///
    /// Returns an `Err` naming the offending variable when a numeric or
    /// boolean value fails to parse.
    pub fn from_env() -> Result<Self> {
        // Load variables from a .env file if one exists; ignore absence.
        let _ = dotenv::dotenv();

        let defaults = Config::default();

        let config = Config {
            listen_ip: env_string("MAILRECV_LISTEN_IP", defaults.listen_ip),
            listen_port: env_parse("MAILRECV_LISTEN_PORT", defaults.listen_port)?,
            receive_timeout_ms: env_parse(
                "MAILRECV_RECEIVE_TIMEOUT_MS",
                defaults.receive_timeout_ms,
            )?,
            host_name: env_string("MAILRECV_HOST_NAME", defaults.host_name),
            max_sessions: env_parse("MAILRECV_MAX_SESSIONS", defaults.max_sessions)?,
            max_messages: env_parse("MAILRECV_MAX_MESSAGES", defaults.max_messages)?,
            max_smtp_err: env_parse("MAILRECV_MAX_SMTP_ERR", defaults.max_smtp_err)?,
            max_smtp_noop: env_parse("MAILRECV_MAX_SMTP_NOOP", defaults.max_smtp_noop)?,
            max_smtp_vrfy: env_parse("MAILRECV_MAX_SMTP_VRFY", defaults.max_smtp_vrfy)?,
            max_smtp_rcpt: env_parse("MAILRECV_MAX_SMTP_RCPT", defaults.max_smtp_rcpt)?,
            banner_delay_ms: env_parse("MAILRECV_BANNER_DELAY_MS", defaults.banner_delay_ms)?,
            error_delay_ms: env_parse("MAILRECV_ERROR_DELAY_MS", defaults.error_delay_ms)?,
            max_data_size: env_parse("MAILRECV_MAX_DATA_SIZE", defaults.max_data_size)?,
            store_data: env_bool("MAILRECV_STORE_DATA", defaults.store_data)?,
            store_path: env_string("MAILRECV_STORE_PATH", defaults.store_path),
            log_path: env::var("MAILRECV_LOG_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            log_verbose: env_bool("MAILRECV_LOG_VERBOSE", defaults.log_verbose)?,
            do_tempfail: env_bool("MAILRECV_DO_TEMPFAIL", defaults.do_tempfail)?,
            check_helo_format: env_bool("MAILRECV_CHECK_HELO_FORMAT", defaults.check_helo_format)?,
            early_talkers: env_bool("MAILRECV_EARLY_TALKERS", defaults.early_talkers)?,
            whitelists: env_list("MAILRECV_WHITELISTS"),
            blacklists: env_list("MAILRECV_BLACKLISTS"),
            local_domains: env_list("MAILRECV_LOCAL_DOMAINS"),
            local_mailboxes: env_list("MAILRECV_LOCAL_MAILBOXES"),
        };

        log::info!(
            "Config: listening on {}, host_name {}, max_sessions {}, store_data {}, do_tempfail {}",
            config.listen_addr(),
            config.host_name,
            config.max_sessions,
            config.store_data,
            config.do_tempfail
        );
        if !config.whitelists.is_empty() || !config.blacklists.is_empty() {
            log::info!(
                "Config: DNS lists, white {:?}, black {:?}",
                config.whitelists,
                config.blacklists
            );
        }

        Ok(config)
    }

    /// The per-read socket deadline, or `None` when reads may block forever.
    pub fn receive_timeout(&self) -> Option<Duration> {
        match self.receive_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// The `ip:port` string the listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.listen_port)
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} ('{raw}') is not a valid number")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(anyhow!("{key} ('{other}') is not a valid boolean")),
        },
        Err(_) => Ok(default),
    }
}

/// Splits a comma-separated variable into trimmed, non-empty entries.
fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|val| {
            val.split(',')
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

// Include the tests defined in tests.rs
#[cfg(test)]
mod tests;
