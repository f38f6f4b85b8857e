//! The per-connection SMTP protocol engine.
//!
//! One `Session` is constructed per accepted socket and consumed by
//! `handle`. It owns the whole dialogue: pre-banner checks (admission,
//! DNS lists, early talker), the command loop, the body sub-loop, tarpit
//! pacing, and the hand-off to the store and session log. Nothing here is
//! shared with other sessions except the process-wide counters and the
//! immutable config.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::Config;
use crate::dnsxl::{DnsListProber, DnsVerdict, ListKind};
use crate::sessionlog::{Direction, SessionLog};
use crate::store::{Envelope, MessageStore, WRITE_ERROR_MARKER};

use super::protocol::{parse_command, reply, Command, ReadOutcome, SmtpStream, TARPIT_BASE};
use super::{Counters, LiveGuard};

/// Collaborators every session shares; cloned cheaply per connection.
pub(crate) struct Shared {
    pub(crate) config: Arc<Config>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) store: Option<Arc<dyn MessageStore>>,
    pub(crate) log: Arc<SessionLog>,
    pub(crate) prober: Arc<DnsListProber>,
}

/// Where the command loop stands between messages.
///
/// `READ_BODY` is not represented here: the engine only switches to body
/// framing for the duration of the sub-loop that follows an accepted DATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No usable HELO/EHLO yet.
    WaitHelo,
    /// Greeted; waiting for MAIL FROM.
    WaitMail,
    /// Envelope open; waiting for RCPT TO or DATA.
    WaitRcptOrData,
}

/// What the caller of a dispatch step does next.
enum Flow {
    Continue,
    /// Enter the body sub-loop (354 already sent).
    BeginData,
    /// Stop reading and end the session.
    Close,
}

/// One SMTP client connection.
pub(crate) struct Session<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    shared: Arc<Shared>,
    stream: SmtpStream<R, W>,

    // Identity.
    index: u64,
    id: String,
    started_at: DateTime<Utc>,
    peer: IpAddr,

    // Protocol state.
    state: State,
    helo: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    msg_count: u32,
    noop_count: u32,
    vrfy_count: u32,
    err_count: u32,
    timed_out: bool,
    early_talker: bool,
    dns_verdict: Option<DnsVerdict>,

    /// Whether an end-of-message record has been written; sessions that
    /// never reach one still get a single record on close.
    recorded: bool,
    receive_timeout: Option<Duration>,
    _live: LiveGuard,
}

impl<R, W> Session<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(shared: Arc<Shared>, stream: SmtpStream<R, W>, peer: IpAddr) -> Self {
        let (index, live) = shared.counters.acquire();
        let receive_timeout = shared.config.receive_timeout();
        Session {
            shared,
            stream,
            index,
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            peer,
            state: State::WaitHelo,
            helo: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            msg_count: 0,
            noop_count: 0,
            vrfy_count: 0,
            err_count: 0,
            timed_out: false,
            early_talker: false,
            dns_verdict: None,
            recorded: false,
            receive_timeout,
            _live: live,
        }
    }

    /// Drives the connection to completion.
    ///
    /// I/O errors end the dialogue but are not fatal to the server; every
    /// exit path still writes the end-of-session log record, and the live
    /// gauge is released when the session drops.
    pub(crate) async fn handle(mut self) {
        if let Err(err) = self.run().await {
            debug!("session {} ended on I/O error: {err:#}", self.id);
        }
        if !self.recorded {
            let envelope = self.envelope();
            self.shared.log.record(&envelope, None).await;
        }
        debug!(
            "session {} from {} closed: msgs={} errs={} timed_out={} early_talker={}",
            self.id, self.peer, self.msg_count, self.err_count, self.timed_out, self.early_talker
        );
    }

    async fn run(&mut self) -> Result<()> {
        let config = Arc::clone(&self.shared.config);
        debug!("session {} ({}) opened from {}", self.index, self.id, self.peer);

        // Admission: this session is already counted, so the gauge holds
        // max_sessions + 1 when we are one over the cap.
        if self.shared.counters.live() > config.max_sessions {
            info!("session {}: over session cap, tempfailing", self.id);
            self.reply(reply::TEMPFAIL).await?;
            return Ok(());
        }

        if !config.whitelists.is_empty() || !config.blacklists.is_empty() {
            let prober = Arc::clone(&self.shared.prober);
            self.dns_verdict = prober
                .check(self.peer, &config.whitelists, &config.blacklists)
                .await;
        }
        if let Some(verdict) = self.dns_verdict.clone() {
            info!(
                "session {}: {} listed by {} ({})",
                self.id, self.peer, verdict.list_name, verdict.list_value
            );
            // A blacklisted peer is refused outright unless we are in
            // capture mode, where its mail is worth keeping.
            if verdict.list_type == ListKind::Black && !config.store_data {
                let line = reply::blacklisted(&verdict.list_name);
                self.reply(&line).await?;
                return Ok(());
            }
        }

        if config.banner_delay_ms > 0 {
            sleep(Duration::from_millis(config.banner_delay_ms)).await;
        }
        if config.early_talkers && self.stream.has_pending_input().await {
            return self.refuse_early_talker().await;
        }

        let banner = reply::banner(
            &config.host_name,
            &Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        self.reply(&banner).await?;

        loop {
            // Post-reply early-talker poll, then the tarpit pause. A peer
            // that wrote before reading our reply shows up here.
            if config.early_talkers && self.stream.has_pending_input().await {
                return self.refuse_early_talker().await;
            }
            self.tarpit().await;

            let line = match self.next_line().await? {
                ReadOutcome::Eof => return Ok(()),
                ReadOutcome::TimedOut => {
                    self.on_timeout().await;
                    return Ok(());
                }
                ReadOutcome::Line(line) => line,
            };

            let (command, arg) = parse_command(&line);
            let mut flow = self.dispatch(command, arg).await?;
            if let Flow::BeginData = flow {
                flow = self.read_body().await?;
            }
            if let Flow::Close = flow {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, command: Command, arg: String) -> Result<Flow> {
        match command {
            Command::Helo | Command::Ehlo => self.on_helo(command, arg).await,
            Command::MailFrom => self.on_mail(arg).await,
            Command::RcptTo => self.on_rcpt(arg).await,
            Command::Data => self.on_data().await,
            Command::Rset => {
                self.reset_message();
                self.reply(reply::RESET_OK).await?;
                Ok(Flow::Continue)
            }
            Command::Quit => {
                self.reply(reply::GOODBYE).await?;
                Ok(Flow::Close)
            }
            Command::Noop => {
                self.noop_count += 1;
                if self.noop_count > self.shared.config.max_smtp_noop {
                    self.reply(reply::TOO_MANY_NOOP).await?;
                    return Ok(Flow::Close);
                }
                self.reply(reply::NOOP_OK).await?;
                Ok(Flow::Continue)
            }
            // VRFY and EXPN share one ceiling; neither discloses anything.
            Command::Vrfy | Command::Expn => {
                self.vrfy_count += 1;
                if self.vrfy_count > self.shared.config.max_smtp_vrfy {
                    self.reply(reply::TOO_MANY_VRFY).await?;
                    return Ok(Flow::Close);
                }
                self.reply(reply::VRFY_OK).await?;
                Ok(Flow::Continue)
            }
            Command::Help => {
                self.reply(reply::HELP).await?;
                Ok(Flow::Continue)
            }
            Command::Invalid => self.protocol_error(reply::UNRECOGNIZED).await,
        }
    }

    async fn on_helo(&mut self, command: Command, arg: String) -> Result<Flow> {
        let config = Arc::clone(&self.shared.config);
        if config.check_helo_format
            && !super::validate::check_helo(&arg, &config.host_name, &config.listen_ip)
        {
            return self.protocol_error(reply::BAD_HELO).await;
        }

        // A fresh greeting abandons any open envelope; the session
        // counters survive.
        self.helo = Some(arg);
        self.mail_from = None;
        self.rcpt_to.clear();
        self.state = State::WaitMail;

        let helo_reply = if command == Command::Ehlo {
            reply::ehlo_ok(&config.host_name, &self.peer)
        } else {
            vec![reply::helo_ok(&config.host_name, &self.peer)]
        };
        for line in &helo_reply {
            self.reply(line).await?;
        }
        Ok(Flow::Continue)
    }

    async fn on_mail(&mut self, arg: String) -> Result<Flow> {
        if self.state != State::WaitMail {
            return self.protocol_error(reply::BAD_SEQUENCE).await;
        }
        if self.msg_count >= self.shared.config.max_messages {
            self.reply(reply::TOO_MANY_MESSAGES).await?;
            return Ok(Flow::Close);
        }
        match super::validate::check_address(&arg) {
            Some(mailbox) => {
                self.mail_from = Some(mailbox.address());
                self.state = State::WaitRcptOrData;
                self.reply(reply::SENDER_OK).await?;
                Ok(Flow::Continue)
            }
            None => self.protocol_error(reply::BAD_ADDRESS).await,
        }
    }

    async fn on_rcpt(&mut self, arg: String) -> Result<Flow> {
        if self.state != State::WaitRcptOrData {
            return self.protocol_error(reply::BAD_SEQUENCE).await;
        }
        if self.rcpt_to.len() >= self.shared.config.max_smtp_rcpt {
            self.reply(reply::TOO_MANY_RCPT).await?;
            return Ok(Flow::Close);
        }

        let mailbox = match super::validate::check_address(&arg) {
            Some(mailbox) => mailbox,
            None => return self.protocol_error(reply::BAD_ADDRESS).await,
        };
        if !super::validate::is_local_domain(&mailbox.domain, &self.shared.config.local_domains) {
            return self.protocol_error(reply::RELAY_DENIED).await;
        }
        if !super::validate::is_local_mailbox(&mailbox, &self.shared.config.local_mailboxes) {
            return self.protocol_error(reply::MAILBOX_DENIED).await;
        }

        // Duplicates are allowed; the envelope keeps arrival order.
        self.rcpt_to.push(mailbox.address());
        self.reply(reply::RECIPIENT_OK).await?;
        Ok(Flow::Continue)
    }

    async fn on_data(&mut self) -> Result<Flow> {
        if self.state != State::WaitRcptOrData {
            return self.protocol_error(reply::BAD_SEQUENCE).await;
        }
        if self.rcpt_to.is_empty() {
            return self.protocol_error(reply::NO_RECIPIENTS).await;
        }
        // With nothing to store, a configured tempfail refuses the body
        // outright; otherwise the body is captured first and the 421
        // follows the store (see finish_message).
        if self.shared.config.do_tempfail && !self.shared.config.store_data {
            self.reply(reply::TEMPFAIL).await?;
            return Ok(Flow::Close);
        }
        self.reply(reply::START_DATA).await?;
        Ok(Flow::BeginData)
    }

    /// Body sub-loop: runs after a 354 until the terminal dot.
    ///
    /// Lines are stored verbatim, including any dot-stuffing the client
    /// applied. Once the running size passes `max_data_size` the buffer
    /// is abandoned and the remaining lines are drained up to the dot,
    /// which then earns a 422 instead of a 250.
    async fn read_body(&mut self) -> Result<Flow> {
        let storing = self.shared.store.is_some();
        let max_size = self.shared.config.max_data_size;
        let mut buffer: Vec<u8> = Vec::new();
        let mut size: usize = 0;

        loop {
            match self.next_line().await? {
                ReadOutcome::Eof => return Ok(Flow::Close),
                ReadOutcome::TimedOut => {
                    self.on_timeout().await;
                    return Ok(Flow::Close);
                }
                ReadOutcome::Line(line) => {
                    if line == "." {
                        let oversize = size > max_size;
                        return self.finish_message(buffer, oversize).await;
                    }
                    size += line.len() + 2; // account for the CRLF
                    if storing && size <= max_size {
                        buffer.extend_from_slice(line.as_bytes());
                        buffer.extend_from_slice(b"\r\n");
                    }
                }
            }
        }
    }

    /// End-of-data: store, log, reply, and reset for the next message.
    async fn finish_message(&mut self, body: Vec<u8>, oversize: bool) -> Result<Flow> {
        if oversize {
            // The message is rejected but it still ends a message: one
            // record, no file, and the session carries on.
            let envelope = self.envelope();
            self.shared.log.record(&envelope, None).await;
            self.recorded = true;
            self.reset_message();
            self.reply(reply::QUOTA_EXCEEDED).await?;
            return Ok(Flow::Continue);
        }

        self.msg_count += 1;
        let envelope = self.envelope();

        let msg_file = match &self.shared.store {
            Some(store) => match store.store(&envelope, &body).await {
                Ok(name) => Some(name),
                Err(err) => {
                    // The client already earned its 250; record the
                    // failure and move on.
                    error!("session {}: message store failed: {err:#}", self.id);
                    Some(WRITE_ERROR_MARKER.to_string())
                }
            },
            None => None,
        };

        self.shared.log.record(&envelope, msg_file.as_deref()).await;
        self.recorded = true;
        self.reset_message();

        if self.shared.config.do_tempfail {
            self.reply(reply::TEMPFAIL).await?;
            return Ok(Flow::Close);
        }
        self.reply(reply::QUEUED).await?;
        Ok(Flow::Continue)
    }

    /// Counts a client protocol error and answers it, or trips the error
    /// ceiling: past `max_smtp_err` the specific reply is replaced by a
    /// final 550 and the connection ends.
    async fn protocol_error(&mut self, line: &'static str) -> Result<Flow> {
        self.err_count += 1;
        if self.err_count > self.shared.config.max_smtp_err {
            self.reply(reply::MAX_ERRORS).await?;
            return Ok(Flow::Close);
        }
        self.reply(line).await?;
        Ok(Flow::Continue)
    }

    async fn refuse_early_talker(&mut self) -> Result<()> {
        info!("session {}: early talker from {}", self.id, self.peer);
        self.early_talker = true;
        self.err_count += 1;
        self.reply(reply::EARLY_TALKER).await?;
        Ok(())
    }

    /// Read timeout: best-effort 442, then the caller closes.
    async fn on_timeout(&mut self) {
        self.timed_out = true;
        self.err_count += 1;
        if let Err(err) = self.reply(reply::TIMED_OUT).await {
            debug!("session {}: timeout reply not delivered: {err:#}", self.id);
        }
    }

    /// Per-message reset: end-of-data, 422, or RSET. The HELO string,
    /// message total, and session identity survive.
    fn reset_message(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        self.noop_count = 0;
        self.vrfy_count = 0;
        self.err_count = 0;
        self.state = if self.helo.is_some() {
            State::WaitMail
        } else {
            State::WaitHelo
        };
    }

    /// Tarpit pause after a reply: errored sessions wait in proportion to
    /// their error count, clean ones get the baseline pause.
    async fn tarpit(&self) {
        let pause = if self.err_count > 0 {
            Duration::from_millis(self.shared.config.error_delay_ms * u64::from(self.err_count))
        } else {
            TARPIT_BASE
        };
        if !pause.is_zero() {
            sleep(pause).await;
        }
    }

    /// Reads one line under the receive deadline, tracing it when verbose.
    async fn next_line(&mut self) -> Result<ReadOutcome> {
        let outcome = self.stream.read_line(self.receive_timeout).await?;
        if let ReadOutcome::Line(line) = &outcome {
            self.shared
                .log
                .verbose(Direction::Rcv, self.peer, &self.id, line)
                .await;
        }
        Ok(outcome)
    }

    /// Writes one reply line, tracing it when verbose.
    async fn reply(&mut self, line: &str) -> Result<()> {
        self.shared
            .log
            .verbose(Direction::Snd, self.peer, &self.id, line)
            .await;
        self.stream.write_line(line).await
    }

    /// Snapshot of everything the store and log need right now.
    fn envelope(&self) -> Envelope {
        Envelope {
            session_index: self.index,
            session_id: self.id.clone(),
            started_at: self.started_at,
            client_ip: Some(self.peer),
            dns_verdict: self.dns_verdict.clone(),
            helo: self.helo.clone(),
            mail_from: self.mail_from.clone(),
            rcpt_to: self.rcpt_to.clone(),
            msg_count: self.msg_count,
            noop_count: self.noop_count,
            vrfy_count: self.vrfy_count,
            err_count: self.err_count,
            early_talker: self.early_talker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnsxl::Resolve;
    use async_trait::async_trait;
    use hickory_resolver::error::ResolveError;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

    struct NeverListed;

    #[async_trait]
    impl Resolve for NeverListed {
        async fn lookup_ipv4(&self, _name: &str) -> Result<Vec<Ipv4Addr>, ResolveError> {
            Err(ResolveError::from("not listed"))
        }
    }

    fn test_config() -> Config {
        Config {
            host_name: "mx.local.test".to_string(),
            receive_timeout_ms: 2_000,
            error_delay_ms: 0,
            banner_delay_ms: 0,
            early_talkers: false,
            ..Config::default()
        }
    }

    fn shared(config: Config) -> Arc<Shared> {
        Arc::new(Shared {
            config: Arc::new(config),
            counters: Counters::shared(),
            store: None,
            log: Arc::new(SessionLog::disabled()),
            prober: Arc::new(DnsListProber::new(Arc::new(NeverListed))),
        })
    }

    /// Feeds the whole script up front and returns every reply line the
    /// session produced before closing.
    async fn run_script(config: Config, script: &str) -> Vec<String> {
        let shared = shared(config);
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(server);
        let session = Session::new(
            shared,
            SmtpStream::new(BufReader::new(read_half), write_half),
            "198.51.100.7".parse().unwrap(),
        );

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(script.as_bytes()).await.unwrap();

        let handle = tokio::spawn(session.handle());
        let mut raw = Vec::new();
        client_read.read_to_end(&mut raw).await.unwrap();
        handle.await.unwrap();

        String::from_utf8(raw)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn banner_then_full_transaction() {
        let replies = run_script(
            test_config(),
            "EHLO client.example\r\n\
             MAIL FROM:<a@b.example>\r\n\
             RCPT TO:<x@local.test>\r\n\
             DATA\r\n\
             Subject: hi\r\n\
             \r\n\
             body\r\n\
             .\r\n\
             QUIT\r\n",
        )
        .await;

        assert!(replies[0].starts_with("220 mx.local.test MailRecv"));
        assert_eq!(replies[1], "250-mx.local.test Hello [198.51.100.7]");
        assert_eq!(replies[2], "250-HELP");
        assert_eq!(replies[5], "250 NOOP");
        assert_eq!(replies[6], "250 Sender ok");
        assert_eq!(replies[7], "250 Recipient ok");
        assert!(replies[8].starts_with("354 "));
        assert_eq!(replies[9], "250 Queued mail for delivery");
        assert_eq!(replies[10], "221 Closing connection.");
    }

    #[tokio::test]
    async fn commands_out_of_order_get_503() {
        let replies = run_script(
            test_config(),
            "MAIL FROM:<a@b.example>\r\n\
             RCPT TO:<x@local.test>\r\n\
             DATA\r\n\
             QUIT\r\n",
        )
        .await;

        // Banner, then three 503s, then the goodbye.
        assert_eq!(replies[1], "503 Bad sequence of commands");
        assert_eq!(replies[2], "503 Bad sequence of commands");
        assert_eq!(replies[3], "503 Bad sequence of commands");
        assert_eq!(replies[4], "221 Closing connection.");
    }

    #[tokio::test]
    async fn rset_is_idempotent_and_mail_works_after_it() {
        let replies = run_script(
            test_config(),
            "EHLO client.example\r\n\
             MAIL FROM:<a@b.example>\r\n\
             RSET\r\n\
             RSET\r\n\
             MAIL FROM:<c@d.example>\r\n\
             QUIT\r\n",
        )
        .await;

        assert_eq!(replies[6], "250 Sender ok");
        assert_eq!(replies[7], "250 Reset state");
        assert_eq!(replies[8], "250 Reset state");
        assert_eq!(replies[9], "250 Sender ok");
    }

    #[tokio::test]
    async fn error_ceiling_closes_with_550() {
        let config = Config {
            max_smtp_err: 2,
            ..test_config()
        };
        let replies = run_script(config, "FOO\r\nBAR\r\nBAZ\r\nQUIT\r\n").await;

        assert_eq!(replies[1], "500 Command unrecognized");
        assert_eq!(replies[2], "500 Command unrecognized");
        assert_eq!(replies[3], "550 Max errors exceeded");
        // Closed before QUIT was read.
        assert_eq!(replies.len(), 4);
    }

    #[tokio::test]
    async fn data_without_recipients_gets_471() {
        let replies = run_script(
            test_config(),
            "EHLO client.example\r\n\
             MAIL FROM:<a@b.example>\r\n\
             DATA\r\n\
             QUIT\r\n",
        )
        .await;

        assert_eq!(replies[7], "471 Bad or missing RCPT command");
        assert_eq!(replies[8], "221 Closing connection.");
    }

    #[tokio::test]
    async fn tempfail_refuses_data_when_not_storing() {
        let config = Config {
            do_tempfail: true,
            ..test_config()
        };
        let replies = run_script(
            config,
            "EHLO client.example\r\n\
             MAIL FROM:<a@b.example>\r\n\
             RCPT TO:<x@local.test>\r\n\
             DATA\r\n\
             QUIT\r\n",
        )
        .await;

        let last = replies.last().unwrap();
        assert!(last.starts_with("421 "), "expected 421, got {last}");
        assert!(!replies.iter().any(|r| r.starts_with("354")));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_with_422_and_session_continues() {
        let config = Config {
            max_data_size: 16,
            ..test_config()
        };
        let replies = run_script(
            config,
            "EHLO client.example\r\n\
             MAIL FROM:<a@b.example>\r\n\
             RCPT TO:<x@local.test>\r\n\
             DATA\r\n\
             0123456789abcdef0123456789abcdef\r\n\
             .\r\n\
             NOOP\r\n\
             QUIT\r\n",
        )
        .await;

        assert!(replies.iter().any(|r| r == "422 Recipient mailbox exceeded quota limit."));
        // The session survived the rejection.
        assert!(replies.iter().any(|r| r == "250 OK"));
        assert_eq!(replies.last().unwrap(), "221 Closing connection.");
    }

    #[tokio::test]
    async fn early_talker_is_refused_before_the_banner() {
        let config = Config {
            early_talkers: true,
            ..test_config()
        };
        let shared = shared(config);
        let (client, server) = tokio::io::duplex(64 * 1024);

        // Write before the session even starts: bytes are pending when
        // the pre-banner poll runs.
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"EHLO x\r\nNOOP\r\n").await.unwrap();

        let (read_half, write_half) = tokio::io::split(server);
        let session = Session::new(
            shared,
            SmtpStream::new(BufReader::new(read_half), write_half),
            "198.51.100.7".parse().unwrap(),
        );
        let handle = tokio::spawn(session.handle());

        let mut raw = Vec::new();
        client_read.read_to_end(&mut raw).await.unwrap();
        handle.await.unwrap();

        let text = String::from_utf8(raw).unwrap();
        assert_eq!(text, "554 Misbehaved SMTP session (EarlyTalker)\r\n");
    }

    #[tokio::test]
    async fn relay_and_mailbox_policy_replies() {
        let config = Config {
            local_domains: vec!["local.test".to_string()],
            local_mailboxes: vec!["inbox@local.test".to_string()],
            ..test_config()
        };
        let replies = run_script(
            config,
            "EHLO client.example\r\n\
             MAIL FROM:<a@b.example>\r\n\
             RCPT TO:<x@other.test>\r\n\
             RCPT TO:<stranger@local.test>\r\n\
             RCPT TO:<inbox@local.test>\r\n\
             QUIT\r\n",
        )
        .await;

        assert_eq!(replies[7], "530 Relaying not allowed for policy reasons");
        assert_eq!(replies[8], "553 Requested action not taken: mailbox not allowed");
        assert_eq!(replies[9], "250 Recipient ok");
    }

    #[tokio::test]
    async fn helo_format_violations_get_501() {
        let replies = run_script(
            test_config(),
            "HELO bad!name\r\n\
             HELO client.example\r\n\
             QUIT\r\n",
        )
        .await;

        assert_eq!(replies[1], "501 Invalid HELO/EHLO argument");
        assert_eq!(replies[2], "250 mx.local.test Hello [198.51.100.7]");
    }

    #[tokio::test]
    async fn live_gauge_is_released_on_every_exit_path() {
        let counters = Counters::shared();
        let shared = Arc::new(Shared {
            config: Arc::new(test_config()),
            counters: Arc::clone(&counters),
            store: None,
            log: Arc::new(SessionLog::disabled()),
            prober: Arc::new(DnsListProber::new(Arc::new(NeverListed))),
        });

        let (client, server) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(server);
        let session = Session::new(
            Arc::clone(&shared),
            SmtpStream::new(BufReader::new(read_half), write_half),
            "198.51.100.7".parse().unwrap(),
        );
        assert_eq!(counters.live(), 1);

        // Abandon the client: the session sees EOF after the banner.
        drop(client);
        session.handle().await;
        assert_eq!(counters.live(), 0);
    }
}
