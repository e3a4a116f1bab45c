//! Out-of-band cancellation of an in-flight exchange.
//!
//! The normal channel is blocked reading the reply, so the kill travels over
//! a brand-new, non-pooled session dialed to the *resolved address* of the
//! target's server (never re-resolving the host name, which could reach a
//! different server behind a load balancer). Failure to cancel is logged and
//! swallowed: the worst outcome is that the query runs to completion.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ConnectOptions;
use crate::error::Error;
use crate::metrics::metrics;
use crate::protocol::{is_ok_packet, Command};
use crate::session::Session;

/// Cancellation progress for one pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    NotCanceling,
    CancelRequested,
    CancelAttempted,
}

#[derive(Debug)]
struct FlagInner {
    state: CancelState,
    /// Whether an operation is currently in flight; requests outside an
    /// operation are no-ops.
    armed: bool,
    /// One retry is allowed after a retryable kill failure.
    retried: bool,
}

/// The per-operation cancel flag, shared between the session and cancellers.
#[derive(Debug)]
pub struct CancelFlag {
    inner: Mutex<FlagInner>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FlagInner {
                state: CancelState::NotCanceling,
                armed: false,
                retried: false,
            }),
        }
    }

    /// Called by the session when an exchange starts.
    pub(crate) fn arm(&self) {
        let mut inner = self.inner.lock();
        inner.state = CancelState::NotCanceling;
        inner.armed = true;
        inner.retried = false;
    }

    /// Called by the session when the exchange finishes (either way). Any
    /// cancel request arriving after this is a no-op.
    pub(crate) fn complete(&self) {
        let mut inner = self.inner.lock();
        inner.armed = false;
        inner.state = CancelState::NotCanceling;
    }

    /// Record a cancellation request. Returns `true` if this request is the
    /// one that should drive a side-channel attempt.
    pub fn request(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.armed || inner.state != CancelState::NotCanceling {
            return false;
        }
        inner.state = CancelState::CancelRequested;
        true
    }

    /// Claim the single allowed kill attempt.
    fn begin_attempt(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.armed || inner.state != CancelState::CancelRequested {
            return false;
        }
        inner.state = CancelState::CancelAttempted;
        true
    }

    /// After a retryable failure, re-open the window for exactly one more
    /// attempt.
    fn allow_retry(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.armed || inner.retried || inner.state != CancelState::CancelAttempted {
            return false;
        }
        inner.retried = true;
        inner.state = CancelState::CancelRequested;
        true
    }

    /// Whether a cancel has been requested for the current operation.
    pub fn is_requested(&self) -> bool {
        let inner = self.inner.lock();
        inner.armed && inner.state != CancelState::NotCanceling
    }

    pub fn state(&self) -> CancelState {
        self.inner.lock().state
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a canceller needs, captured from a live session up front so
/// the blocked session itself is never touched.
#[derive(Debug, Clone)]
pub struct CancelTicket {
    /// Resolved address of the session's server.
    pub addr: SocketAddr,
    /// Server-assigned connection id of the session to kill.
    pub connection_id: u32,
    pub(crate) flag: Arc<CancelFlag>,
}

/// Abort the exchange identified by `ticket`.
///
/// Never fails from the caller's perspective: every outcome short of a
/// delivered kill is logged and dropped.
pub async fn cancel(ticket: &CancelTicket, options: &ConnectOptions) {
    if !ticket.flag.request() {
        debug!(
            connection_id = ticket.connection_id,
            "cancel request ignored (operation finished or cancel already underway)"
        );
        return;
    }

    while ticket.flag.begin_attempt() {
        match kill_query(ticket, options).await {
            Ok(()) => {
                debug!(connection_id = ticket.connection_id, "kill query delivered");
                metrics().cancellations_total.with_label_values(&["ok"]).inc();
                return;
            }
            Err(e) => {
                warn!(
                    connection_id = ticket.connection_id,
                    error = %e,
                    "kill query attempt failed"
                );
                metrics()
                    .cancellations_total
                    .with_label_values(&["failed"])
                    .inc();
                if !is_retryable(&e) || !ticket.flag.allow_retry() {
                    return;
                }
            }
        }
    }
}

/// One side-channel attempt: dial, authenticate, `KILL QUERY`, quit.
async fn kill_query(ticket: &CancelTicket, options: &ConnectOptions) -> Result<(), Error> {
    let mut side = Session::connect_addr(options, ticket.addr).await?;

    let sql = format!("KILL QUERY {}", ticket.connection_id);
    let mut payload = Vec::with_capacity(1 + sql.len());
    payload.push(Command::Query.as_byte());
    payload.extend_from_slice(sql.as_bytes());

    let reply = match side.exchange(Bytes::from(payload)).await {
        Ok(reply) => reply,
        // "Unknown thread id": the target finished and logged off first.
        Err(Error::Server { code: 1094, .. }) => {
            side.quit().await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let delivered = is_ok_packet(&reply);
    side.quit().await;
    if delivered {
        Ok(())
    } else {
        Err(Error::Protocol("unexpected reply to KILL QUERY".into()))
    }
}

fn is_retryable(e: &Error) -> bool {
    matches!(
        e,
        Error::Io(_) | Error::Connect(_) | Error::ConnectTimeout(_) | Error::Disconnected
    )
}
