//! Message persistence.
//!
//! The session hands an [`Envelope`] and the raw body bytes to a
//! [`MessageStore`] and gets back an opaque identifier for its log record.
//! The session never chooses file names or paths; a failed store is the
//! store's problem to report, the client's 250 has already been earned.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::dnsxl::DnsVerdict;

/// Sentinel identifier recorded when a store attempt fails.
pub const WRITE_ERROR_MARKER: &str = "write_error";

/// Everything known about a session at a hand-off point: identity, DNSxL
/// verdict, the SMTP envelope proper, and the per-session counters.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub session_index: u64,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub client_ip: Option<IpAddr>,
    pub dns_verdict: Option<DnsVerdict>,
    pub helo: Option<String>,
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    pub msg_count: u32,
    pub noop_count: u32,
    pub vrfy_count: u32,
    pub err_count: u32,
    pub early_talker: bool,
}

impl Envelope {
    /// Renders the header block that precedes the raw body in a stored
    /// message file: one `X-MailRecv-*` line per field, CRLF terminated.
    pub fn render_headers(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "X-MailRecv-Session-Index: {}\r\n",
            self.session_index
        ));
        out.push_str(&format!("X-MailRecv-Session-Id: {}\r\n", self.session_id));
        out.push_str(&format!(
            "X-MailRecv-Start-Time: {}\r\n",
            self.started_at.format("%Y-%m-%dT%H:%M:%SZ")
        ));
        out.push_str(&format!(
            "X-MailRecv-Client-Ip: {}\r\n",
            self.client_ip
                .map_or_else(|| "0.0.0.0".to_string(), |ip| ip.to_string())
        ));
        match &self.dns_verdict {
            Some(verdict) => out.push_str(&format!(
                "X-MailRecv-Dns-List: {} {} {}\r\n",
                verdict.list_type, verdict.list_name, verdict.list_value
            )),
            None => out.push_str("X-MailRecv-Dns-List: -not-listed-\r\n"),
        }
        out.push_str(&format!(
            "X-MailRecv-Helo: {}\r\n",
            self.helo.as_deref().unwrap_or("-no-helo-")
        ));
        out.push_str(&format!(
            "X-MailRecv-Mail-From: {}\r\n",
            self.mail_from.as_deref().unwrap_or("-no-from-")
        ));
        for rcpt in &self.rcpt_to {
            out.push_str(&format!("X-MailRecv-Rcpt-To: {rcpt}\r\n"));
        }
        out.push_str(&format!(
            "X-MailRecv-Counters: msg={} noop={} vrfy={} err={}\r\n",
            self.msg_count, self.noop_count, self.vrfy_count, self.err_count
        ));
        out
    }
}

/// Destination for accepted messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists one message and returns the opaque identifier the session
    /// records in its log.
    async fn store(&self, envelope: &Envelope, body: &[u8]) -> Result<String>;
}

/// Stores each message as a text file under a root directory: the
/// envelope header block, a blank line, then the raw body lines.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens the store, creating the root directory if needed.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating message store directory {}", root.display()))?;
        Ok(FileStore { root })
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn store(&self, envelope: &Envelope, body: &[u8]) -> Result<String> {
        let name = format!("msg-{}.eml", Uuid::new_v4());
        let path = self.root.join(&name);

        let mut file = fs::File::create(&path)
            .await
            .with_context(|| format!("creating message file {}", path.display()))?;
        file.write_all(envelope.render_headers().as_bytes()).await?;
        file.write_all(b"\r\n").await?;
        file.write_all(body).await?;
        file.flush().await?;

        log::debug!(
            "stored message from session {} as {name}",
            envelope.session_id
        );
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnsxl::ListKind;

    fn sample_envelope() -> Envelope {
        Envelope {
            session_index: 7,
            session_id: "abc-123".to_string(),
            started_at: DateTime::parse_from_rfc3339("2024-05-01T10:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            client_ip: Some("203.0.113.9".parse().unwrap()),
            dns_verdict: None,
            helo: Some("client.example".to_string()),
            mail_from: Some("a@b.example".to_string()),
            rcpt_to: vec!["x@local.test".to_string(), "y@local.test".to_string()],
            msg_count: 1,
            noop_count: 0,
            vrfy_count: 2,
            err_count: 1,
            early_talker: false,
        }
    }

    #[test]
    fn headers_carry_identity_envelope_and_counters() {
        let headers = sample_envelope().render_headers();

        assert!(headers.contains("X-MailRecv-Session-Index: 7\r\n"));
        assert!(headers.contains("X-MailRecv-Session-Id: abc-123\r\n"));
        assert!(headers.contains("X-MailRecv-Start-Time: 2024-05-01T10:30:00Z\r\n"));
        assert!(headers.contains("X-MailRecv-Client-Ip: 203.0.113.9\r\n"));
        assert!(headers.contains("X-MailRecv-Dns-List: -not-listed-\r\n"));
        assert!(headers.contains("X-MailRecv-Helo: client.example\r\n"));
        assert!(headers.contains("X-MailRecv-Mail-From: a@b.example\r\n"));
        assert!(headers.contains("X-MailRecv-Rcpt-To: x@local.test\r\n"));
        assert!(headers.contains("X-MailRecv-Rcpt-To: y@local.test\r\n"));
        assert!(headers.contains("X-MailRecv-Counters: msg=1 noop=0 vrfy=2 err=1\r\n"));
    }

    #[test]
    fn headers_use_sentinels_and_verdicts() {
        let mut envelope = sample_envelope();
        envelope.helo = None;
        envelope.mail_from = None;
        envelope.client_ip = None;
        envelope.dns_verdict = Some(DnsVerdict {
            list_type: ListKind::Black,
            list_name: "bl.example.net".to_string(),
            list_value: "127.0.0.2".to_string(),
        });

        let headers = envelope.render_headers();
        assert!(headers.contains("X-MailRecv-Helo: -no-helo-\r\n"));
        assert!(headers.contains("X-MailRecv-Mail-From: -no-from-\r\n"));
        assert!(headers.contains("X-MailRecv-Client-Ip: 0.0.0.0\r\n"));
        assert!(headers.contains("X-MailRecv-Dns-List: black bl.example.net 127.0.0.2\r\n"));
    }

    #[tokio::test]
    async fn file_store_writes_headers_blank_line_then_body() {
        let root = std::env::temp_dir().join(format!("mailrecv-store-test-{}", Uuid::new_v4()));
        let store = FileStore::open(&root).await.unwrap();

        let name = store
            .store(&sample_envelope(), b"Subject: hi\r\n\r\nbody\r\n")
            .await
            .unwrap();
        assert!(name.starts_with("msg-") && name.ends_with(".eml"));

        let contents = fs::read_to_string(root.join(&name)).await.unwrap();
        assert!(contents.starts_with("X-MailRecv-Session-Index: 7\r\n"));
        assert!(contents.contains("\r\n\r\nSubject: hi\r\n"));
        assert!(contents.ends_with("body\r\n"));

        fs::remove_dir_all(&root).await.unwrap();
    }
}
