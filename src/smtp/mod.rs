//! The SMTP listener: socket acceptance and per-connection sessions.
//!
//! The `Server` owns one listening socket and hands every accepted
//! connection to a freshly constructed `Session` on its own task. The
//! only state sessions share are the process-wide atomic counters and
//! the immutable configuration.

mod session;

pub mod protocol;
pub mod validate;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dnsxl::DnsListProber;
use crate::sessionlog::SessionLog;
use crate::store::{FileStore, MessageStore};

use protocol::SmtpStream;
use session::{Session, Shared};

/// Process-wide session accounting: a live-session gauge and a strictly
/// increasing session index. Shared by the acceptor and every session.
#[derive(Debug, Default)]
pub struct Counters {
    live: AtomicUsize,
    next_index: AtomicU64,
}

impl Counters {
    /// One shared instance per server, handed to every session.
    pub fn shared() -> Arc<Counters> {
        Arc::new(Counters::default())
    }

    /// Sessions currently between construction and release.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Registers a new session: bumps the gauge, hands out the next index
    /// and the guard whose drop releases the gauge exactly once.
    pub(crate) fn acquire(self: &Arc<Self>) -> (u64, LiveGuard) {
        self.live.fetch_add(1, Ordering::SeqCst);
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        (
            index,
            LiveGuard {
                counters: Arc::clone(self),
            },
        )
    }
}

/// Releases the live-session gauge when the owning session drops,
/// whatever exit path it took.
pub(crate) struct LiveGuard {
    counters: Arc<Counters>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The connection acceptor.
pub struct Server {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl Server {
    /// Builds the server and its collaborators: the message store (when
    /// persistence is on), the session log, and the DNS list prober.
    pub async fn new(config: Config) -> Result<Server> {
        let config = Arc::new(config);

        let store: Option<Arc<dyn MessageStore>> = if config.store_data {
            Some(Arc::new(FileStore::open(&config.store_path).await?))
        } else {
            None
        };
        let log = Arc::new(SessionLog::open(config.log_path.as_deref(), config.log_verbose).await?);
        let prober = Arc::new(DnsListProber::from_system());

        Ok(Server {
            shared: Arc::new(Shared {
                config,
                counters: Counters::shared(),
                store,
                log,
                prober,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    /// Runs the accept loop until `stop` is called or the listener fails.
    ///
    /// Returns the process exit code: `0` on a requested shutdown, `1`
    /// when the bind fails, `2` when accepting fails. Sessions still in
    /// flight at shutdown are not interrupted; they end on their own.
    pub async fn start(&self) -> i32 {
        let addr = self.shared.config.listen_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("failed to bind {addr}: {err}");
                return 1;
            }
        };
        info!("SMTP server listening on {addr}");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutdown requested, closing listener");
                    return 0;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("new connection from {peer}");
                        self.spawn_session(stream, peer.ip());
                    }
                    Err(err) => {
                        error!("error accepting connection: {err}");
                        return 2;
                    }
                },
            }
        }
    }

    /// Requests shutdown; asynchronous and idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn spawn_session(&self, stream: TcpStream, peer: std::net::IpAddr) {
        let (read_half, write_half) = stream.into_split();
        let session = Session::new(
            Arc::clone(&self.shared),
            SmtpStream::new(BufReader::new(read_half), write_half),
            peer,
        );
        // The acceptor never waits for a session; each one runs, logs,
        // and releases its counters on its own task.
        tokio::spawn(session.handle());
    }
}
