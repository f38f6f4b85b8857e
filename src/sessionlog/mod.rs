//! Session logging.
//!
//! One pipe-delimited record per end-of-message, plus one per session
//! that closed without any message. When verbose logging is on, every
//! SMTP line exchanged is also written, tagged with its direction.
//! Without a configured file, records and traces go through the `log`
//! facade instead. Logging failures are reported and swallowed; they
//! never disturb the SMTP dialogue.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, trace};
use std::net::IpAddr;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::store::Envelope;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Direction tag for verbose trace lines.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    /// Server to client.
    Snd,
    /// Client to server.
    Rcv,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Snd => write!(f, "SND"),
            Direction::Rcv => write!(f, "RCV"),
        }
    }
}

/// Append-only session log shared by every session.
pub struct SessionLog {
    file: Option<Mutex<File>>,
    verbose: bool,
}

impl SessionLog {
    /// Opens the log for appending, creating it if needed. With no path,
    /// records are routed through the `log` facade.
    pub async fn open(path: Option<&str>, verbose: bool) -> Result<Self> {
        let file = match path {
            Some(path) => Some(Mutex::new(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("opening session log {path}"))?,
            )),
            None => None,
        };
        Ok(SessionLog { file, verbose })
    }

    /// In-memory log for tests and for sessions with logging disabled.
    pub fn disabled() -> Self {
        SessionLog {
            file: None,
            verbose: false,
        }
    }

    /// Writes one session record. `msg_file` is the store identifier of
    /// the message just completed, or `None` when there is nothing on
    /// disk (no store configured, quota rejection, or session close
    /// without a message).
    pub async fn record(&self, envelope: &Envelope, msg_file: Option<&str>) {
        let line = format_record(Utc::now(), envelope, msg_file);
        match &self.file {
            Some(file) => {
                let mut file = file.lock().await;
                if let Err(err) = write_line(&mut file, &line).await {
                    error!("session log write failed: {err}");
                }
            }
            None => info!("session {line}"),
        }
    }

    /// Writes one verbose trace line when verbose logging is enabled.
    pub async fn verbose(
        &self,
        direction: Direction,
        client_ip: IpAddr,
        session_id: &str,
        line: &str,
    ) {
        if !self.verbose {
            return;
        }
        let record = format!(
            "{}|{direction}|{client_ip}|{session_id}|{line}",
            Utc::now().format(TIME_FORMAT)
        );
        match &self.file {
            Some(file) => {
                let mut file = file.lock().await;
                if let Err(err) = write_line(&mut file, &record).await {
                    error!("verbose log write failed: {err}");
                }
            }
            None => trace!("{record}"),
        }
    }
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

/// Renders the pipe-delimited record for one session snapshot.
///
/// Column order: now-UTC, start-UTC, session-id, client-ip, helo,
/// mail-from, rcpt-count, rcpt-list, msg-count, msg-file, dns-list-type,
/// dns-list-name, dns-list-value, early-talker-flag, noop-count,
/// vrfy-count, err-count.
pub fn format_record(now: DateTime<Utc>, envelope: &Envelope, msg_file: Option<&str>) -> String {
    let rcpt_list = if envelope.rcpt_to.is_empty() {
        "-no-rcpt-".to_string()
    } else {
        envelope.rcpt_to.join(",")
    };
    let (list_type, list_name, list_value) = match &envelope.dns_verdict {
        Some(verdict) => (
            verdict.list_type.to_string(),
            verdict.list_name.clone(),
            verdict.list_value.clone(),
        ),
        None => (
            "-not-listed-".to_string(),
            "-none-".to_string(),
            "-none-".to_string(),
        ),
    };

    format!(
        "{now}|{start}|{id}|{ip}|{helo}|{from}|{rcpt_count}|{rcpt_list}|{msgs}|{file}|{list_type}|{list_name}|{list_value}|{early}|{noops}|{vrfys}|{errs}",
        now = now.format(TIME_FORMAT),
        start = envelope.started_at.format(TIME_FORMAT),
        id = envelope.session_id,
        ip = envelope
            .client_ip
            .map_or_else(|| "0.0.0.0".to_string(), |ip| ip.to_string()),
        helo = envelope.helo.as_deref().unwrap_or("-no-helo-"),
        from = envelope.mail_from.as_deref().unwrap_or("-no-from-"),
        rcpt_count = envelope.rcpt_to.len(),
        msgs = envelope.msg_count,
        file = msg_file.unwrap_or("-no-file-"),
        early = u8::from(envelope.early_talker),
        noops = envelope.noop_count,
        vrfys = envelope.vrfy_count,
        errs = envelope.err_count,
    )
}
