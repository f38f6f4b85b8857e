//! SMTP line framing and command recognition.
//!
//! Lines terminate on CRLF. Reads honor an optional per-read deadline;
//! writes always append CRLF and flush before returning. Command
//! recognition matches the longest known prefix of the line, ignoring
//! ASCII case, and hands back whatever follows as the collapsed argument
//! string.

use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Baseline tarpit pause applied after replies in well-behaved sessions.
pub const TARPIT_BASE: Duration = Duration::from_millis(25);

/// The SMTP verbs this server recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Invalid,
    Helo,
    Ehlo,
    MailFrom,
    RcptTo,
    Data,
    Rset,
    Quit,
    Vrfy,
    Expn,
    Help,
    Noop,
}

/// Prefix table consulted in order; `MAIL FROM:`/`RCPT TO:` carry their
/// colon so the argument starts right after it.
const COMMAND_TABLE: &[(&str, Command)] = &[
    ("MAIL FROM:", Command::MailFrom),
    ("RCPT TO:", Command::RcptTo),
    ("HELO", Command::Helo),
    ("EHLO", Command::Ehlo),
    ("DATA", Command::Data),
    ("RSET", Command::Rset),
    ("QUIT", Command::Quit),
    ("VRFY", Command::Vrfy),
    ("EXPN", Command::Expn),
    ("HELP", Command::Help),
    ("NOOP", Command::Noop),
];

/// Matches `line` against the command table, ASCII case-insensitively.
///
/// Returns the recognized command and its argument, trimmed and with runs
/// of whitespace collapsed to single spaces. Empty and unknown lines map
/// to `Command::Invalid`. Matching stays byte-wise so a crafted non-ASCII
/// line can never split a char boundary.
pub fn parse_command(line: &str) -> (Command, String) {
    for (prefix, command) in COMMAND_TABLE {
        if line.len() >= prefix.len()
            && line.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
        {
            let arg = collapse_whitespace(&line[prefix.len()..]);
            return (*command, arg);
        }
    }
    (Command::Invalid, String::new())
}

/// Trims and collapses internal whitespace runs to a single space.
pub fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Outcome of one framed read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete line, CR/LF stripped.
    Line(String),
    /// The peer closed its half of the connection.
    Eof,
    /// The configured receive deadline elapsed before a full line arrived.
    TimedOut,
}

/// Buffered line-oriented view of one client connection.
///
/// Generic over the reader and writer so tests can drive a session with
/// in-memory streams instead of sockets.
pub struct SmtpStream<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    reader: R,
    writer: W,
}

impl<R, W> SmtpStream<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        SmtpStream { reader, writer }
    }

    /// Reads one CRLF-terminated line, bounded by `deadline` when given.
    ///
    /// A timed-out read may leave a partial line in the buffer; callers
    /// treat `TimedOut` as fatal to the session, so nothing rereads it.
    pub async fn read_line(&mut self, deadline: Option<Duration>) -> Result<ReadOutcome> {
        let mut buffer = String::new();
        let bytes_read = match deadline {
            Some(limit) => match timeout(limit, self.reader.read_line(&mut buffer)).await {
                Ok(read) => read?,
                Err(_) => return Ok(ReadOutcome::TimedOut),
            },
            None => self.reader.read_line(&mut buffer).await?,
        };

        if bytes_read == 0 {
            return Ok(ReadOutcome::Eof);
        }
        Ok(ReadOutcome::Line(
            buffer.trim_end_matches(['\r', '\n']).to_string(),
        ))
    }

    /// Writes `line` followed by CRLF and flushes before returning.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reports whether the client has already sent bytes we have not read.
    ///
    /// Used by early-talker detection. This is a single zero-wait poll of
    /// the read buffer; nothing is consumed, so a pending command line is
    /// still read normally afterwards, and a client that merely answers
    /// quickly is never flagged.
    pub async fn has_pending_input(&mut self) -> bool {
        std::future::poll_fn(|cx| {
            match Pin::new(&mut self.reader).poll_fill_buf(cx) {
                Poll::Ready(Ok(buffered)) => Poll::Ready(!buffered.is_empty()),
                // An I/O error here surfaces on the next real read.
                Poll::Ready(Err(_)) => Poll::Ready(false),
                Poll::Pending => Poll::Ready(false),
            }
        })
        .await
    }
}

/// Reply lines, named for the dialogue step that emits them.
pub mod reply {
    /// The 220 banner sent once the pre-banner checks pass.
    pub fn banner(host_name: &str, date_rfc1123: &str) -> String {
        format!(
            "220 {host_name} MailRecv {}-b4; {date_rfc1123}",
            env!("CARGO_PKG_VERSION")
        )
    }

    pub fn helo_ok(host_name: &str, client_ip: &std::net::IpAddr) -> String {
        format!("250 {host_name} Hello [{client_ip}]")
    }

    /// EHLO multiline reply advertising the supported verbs, one per
    /// continuation line.
    pub fn ehlo_ok(host_name: &str, client_ip: &std::net::IpAddr) -> Vec<String> {
        vec![
            format!("250-{host_name} Hello [{client_ip}]"),
            "250-HELP".to_string(),
            "250-VRFY".to_string(),
            "250-EXPN".to_string(),
            "250 NOOP".to_string(),
        ]
    }

    pub fn blacklisted(list_name: &str) -> String {
        format!("442 Connection denied, listed by {list_name}")
    }

    pub const HELP: &str =
        "211 Commands supported: HELO EHLO MAIL RCPT DATA RSET NOOP VRFY EXPN HELP QUIT";
    pub const GOODBYE: &str = "221 Closing connection.";
    pub const SENDER_OK: &str = "250 Sender ok";
    pub const RECIPIENT_OK: &str = "250 Recipient ok";
    pub const RESET_OK: &str = "250 Reset state";
    pub const NOOP_OK: &str = "250 OK";
    pub const QUEUED: &str = "250 Queued mail for delivery";
    pub const VRFY_OK: &str = "252 Cannot VRFY user, but will accept message and attempt delivery";
    pub const START_DATA: &str = "354 Start mail input; end with <CRLF>.<CRLF>";
    pub const TEMPFAIL: &str = "421 Service temporarily unavailable, closing transmission channel.";
    pub const QUOTA_EXCEEDED: &str = "422 Recipient mailbox exceeded quota limit.";
    pub const TIMED_OUT: &str = "442 Connection timed out, closing transmission channel.";
    pub const TOO_MANY_MESSAGES: &str = "451 Requested action aborted: too many messages";
    pub const TOO_MANY_NOOP: &str = "451 Requested action aborted: too many NOOP commands";
    pub const TOO_MANY_VRFY: &str = "451 Requested action aborted: too many VRFY commands";
    pub const TOO_MANY_RCPT: &str = "452 Too many recipients";
    pub const NO_RECIPIENTS: &str = "471 Bad or missing RCPT command";
    pub const UNRECOGNIZED: &str = "500 Command unrecognized";
    pub const BAD_HELO: &str = "501 Invalid HELO/EHLO argument";
    pub const BAD_ADDRESS: &str = "501 Bad address syntax";
    pub const BAD_SEQUENCE: &str = "503 Bad sequence of commands";
    pub const RELAY_DENIED: &str = "530 Relaying not allowed for policy reasons";
    pub const MAX_ERRORS: &str = "550 Max errors exceeded";
    pub const MAILBOX_DENIED: &str = "553 Requested action not taken: mailbox not allowed";
    pub const EARLY_TALKER: &str = "554 Misbehaved SMTP session (EarlyTalker)";
}
