//! Bounded session pool.
//!
//! Capacity is enforced by a fair semaphore: every leased session holds an
//! owned permit, so leased + idle can never exceed `max_size` and waiters
//! are admitted in arrival order. Idle sessions sit in a LIFO stack so the
//! most recently used (warmest) session is handed out first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::balancer::{selector_for, HostEndpoint, HostSelector};
use crate::config::{ConnectOptions, PoolOptions};
use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::session::Session;

struct PoolInner {
    connect: ConnectOptions,
    options: PoolOptions,
    hosts: Vec<Arc<HostEndpoint>>,
    selector: Box<dyn HostSelector>,
    /// LIFO stack of idle sessions; permits are NOT held while idle.
    idle: Mutex<Vec<Session>>,
    semaphore: Arc<Semaphore>,
    /// Bumped by `clear`; sessions from older generations are discarded
    /// instead of being reused or returned.
    generation: AtomicU64,
    closed: AtomicBool,
}

/// A bounded pool of sessions to one logical server (one set of connect
/// options). Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create an empty pool. No sessions are dialed here; the reaper tops
    /// the pool up to `min_size` in the background, and `acquire` connects
    /// on demand.
    pub fn new(connect: ConnectOptions, options: PoolOptions) -> Pool {
        let hosts: Vec<Arc<HostEndpoint>> = connect
            .hosts
            .iter()
            .map(|h| Arc::new(HostEndpoint::new(h.clone(), connect.port)))
            .collect();
        let selector = selector_for(options.load_balance);
        let max = options.max_size.max(1);

        let inner = Arc::new(PoolInner {
            connect,
            options,
            hosts,
            selector,
            idle: Mutex::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(max)),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&inner);
            let interval = inner.options.reap_interval_duration();
            handle.spawn(reaper(weak, interval));
        }

        Pool { inner }
    }

    /// Lease a session, waiting as long as it takes for a slot.
    pub async fn acquire(&self) -> Result<PooledSession> {
        self.acquire_deadline(None).await
    }

    /// Lease a session, giving up at `Instant::now() + timeout` with
    /// [`Error::PoolTimeout`]. `pool_full` in the error tells whether the
    /// deadline passed while waiting for a slot (true) or while dialing a
    /// fresh session (false).
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledSession> {
        self.acquire_deadline(Some(Instant::now() + timeout)).await
    }

    async fn acquire_deadline(&self, deadline: Option<Instant>) -> Result<PooledSession> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }

        let wait_started = Instant::now();
        let permit_fut = Arc::clone(&inner.semaphore).acquire_owned();
        let permit = match deadline {
            Some(deadline) => match time::timeout_at(deadline, permit_fut).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Error::PoolClosed),
                Err(_) => {
                    metrics().pool_acquire_timeouts_total.inc();
                    return Err(Error::PoolTimeout { pool_full: true });
                }
            },
            None => permit_fut.await.map_err(|_| Error::PoolClosed)?,
        };
        metrics()
            .pool_acquire_wait_seconds
            .observe(wait_started.elapsed().as_secs_f64());

        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }

        // Warmest idle session first, discarding any that went stale while
        // parked.
        while let Some(session) = inner.pop_idle() {
            match inner.validate_idle(session).await {
                Some(session) => {
                    metrics()
                        .pool_acquires_total
                        .with_label_values(&["idle"])
                        .inc();
                    return Ok(PooledSession::new(session, Arc::clone(inner), permit));
                }
                None => continue,
            }
        }

        let connect_fut = inner.connect_session();
        let session = match deadline {
            Some(deadline) => match time::timeout_at(deadline, connect_fut).await {
                Ok(result) => result?,
                Err(_) => {
                    metrics().pool_acquire_timeouts_total.inc();
                    return Err(Error::PoolTimeout { pool_full: false });
                }
            },
            None => connect_fut.await?,
        };
        metrics()
            .pool_acquires_total
            .with_label_values(&["fresh"])
            .inc();
        Ok(PooledSession::new(session, Arc::clone(inner), permit))
    }

    /// Invalidate every pooled session: idle ones are closed now, leased
    /// ones are closed when their guards release them.
    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let drained = self.inner.drain_idle();
        for session in drained {
            self.inner.discard(session, "cleared");
        }
    }

    /// Close the pool. In-flight leases finish normally but are not
    /// returned; subsequent `acquire` calls fail with [`Error::PoolClosed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();
        let drained = self.inner.drain_idle();
        for session in drained {
            self.inner.discard(session, "cleared");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Sessions currently leased out.
    pub fn leased_count(&self) -> usize {
        self.inner
            .options
            .max_size
            .max(1)
            .saturating_sub(self.inner.semaphore.available_permits())
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle_count())
            .field("leased", &self.leased_count())
            .field("max_size", &self.inner.options.max_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PoolInner {
    fn pop_idle(&self) -> Option<Session> {
        let session = self.idle.lock().pop();
        if session.is_some() {
            metrics().pool_idle.dec();
        }
        session
    }

    fn drain_idle(&self) -> Vec<Session> {
        let drained: Vec<Session> = {
            let mut idle = self.idle.lock();
            std::mem::take(&mut *idle)
        };
        metrics().pool_idle.sub(drained.len() as i64);
        drained
    }

    /// Check a parked session before handing it out; `None` means it was
    /// discarded and the caller should look at the next candidate.
    async fn validate_idle(&self, mut session: Session) -> Option<Session> {
        if session.generation != self.generation.load(Ordering::SeqCst) {
            self.discard(session, "cleared");
            return None;
        }
        if !session.is_usable() {
            self.discard(session, "failed");
            return None;
        }
        if session.age() >= self.options.max_lifetime_duration() {
            self.discard(session, "expired");
            return None;
        }
        if session.idle_for() >= self.options.idle_timeout_duration() {
            self.discard(session, "idle");
            return None;
        }
        if session.idle_for() >= self.options.ping_threshold_duration()
            && !session.try_ping().await
        {
            debug!(session_id = session.id(), "idle session failed liveness probe");
            self.discard(session, "failed");
            return None;
        }
        Some(session)
    }

    async fn connect_session(&self) -> Result<Session> {
        let endpoint = self
            .selector
            .select(&self.hosts)
            .ok_or_else(|| Error::Config("no hosts configured".into()))?;

        let mut session =
            Session::connect(&self.connect, &endpoint.host, endpoint.port).await?;
        session.generation = self.generation.load(Ordering::SeqCst);
        session.host = Some(Arc::clone(endpoint));
        session.set_statement_cache_capacity(self.options.statement_cache_capacity);
        endpoint.session_opened();
        Ok(session)
    }

    /// Requeue a session coming back from a lease, or discard it if it is
    /// no longer fit for reuse.
    pub(super) fn return_session(&self, mut session: Session) {
        if self.closed.load(Ordering::SeqCst) {
            self.discard(session, "cleared");
            return;
        }
        if session.generation != self.generation.load(Ordering::SeqCst) {
            self.discard(session, "cleared");
            return;
        }
        if !session.state().is_idle() {
            self.discard(session, "failed");
            return;
        }
        if session.age() >= self.options.max_lifetime_duration() {
            self.discard(session, "expired");
            return;
        }
        session.mark_returned();
        self.idle.lock().push(session);
        metrics().pool_idle.inc();
    }

    pub(super) fn discard(&self, session: Session, reason: &'static str) {
        metrics()
            .sessions_closed_total
            .with_label_values(&[reason])
            .inc();
        // COM_QUIT is a courtesy; dropping the session closes the socket
        // either way.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(session.quit());
        }
    }

    pub(super) fn reset_on_return(&self) -> bool {
        self.options.reset_on_return
    }
}

/// Background maintenance: evict idle sessions past their idle timeout or
/// max lifetime, then top the pool back up to `min_size`.
async fn reaper(pool: Weak<PoolInner>, interval: Duration) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else { break };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        reap_once(&inner).await;
    }
    debug!("pool reaper exiting");
}

async fn reap_once(inner: &Arc<PoolInner>) {
    let idle_timeout = inner.options.idle_timeout_duration();
    let max_lifetime = inner.options.max_lifetime_duration();
    let generation = inner.generation.load(Ordering::SeqCst);

    let mut evicted = Vec::new();
    {
        let mut idle = inner.idle.lock();
        let mut i = 0;
        while i < idle.len() {
            let s = &idle[i];
            if s.generation != generation
                || !s.is_usable()
                || s.age() >= max_lifetime
                || s.idle_for() >= idle_timeout
            {
                evicted.push(idle.remove(i));
            } else {
                i += 1;
            }
        }
    }
    metrics().pool_idle.sub(evicted.len() as i64);
    for session in evicted {
        let reason = if session.age() >= max_lifetime {
            "expired"
        } else {
            "idle"
        };
        inner.discard(session, reason);
    }

    // Live = leased (permits out) + idle. Top-up connects hold a permit for
    // their duration so the bound is never exceeded.
    loop {
        let leased = inner
            .options
            .max_size
            .max(1)
            .saturating_sub(inner.semaphore.available_permits());
        let idle_count = inner.idle.lock().len();
        if leased + idle_count >= inner.options.min_size {
            break;
        }

        let Ok(permit) = Arc::clone(&inner.semaphore).try_acquire_owned() else {
            break;
        };
        match inner.connect_session().await {
            Ok(mut session) => {
                session.mark_returned();
                inner.idle.lock().push(session);
                metrics().pool_idle.inc();
                drop(permit);
            }
            Err(e) => {
                warn!(error = %e, "pool top-up connect failed");
                drop(permit);
                break;
            }
        }
    }
}

/// A leased session. Dereferences to [`Session`]; going out of scope
/// returns the session to the pool in the background, while the async
/// [`release`](PooledSession::release) method returns it inline (running
/// the optional connection reset before requeueing).
pub struct PooledSession {
    session: Option<Session>,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledSession {
    fn new(session: Session, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            session: Some(session),
            pool,
            permit: Some(permit),
        }
    }

    /// Return the session to the pool, resetting server-side session state
    /// first when the pool is configured to (`reset_on_return`). A session
    /// that fails the reset is closed instead of requeued.
    pub async fn release(mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let permit = self.permit.take();
        drop(self);

        if pool.reset_on_return() && session.state().is_idle() {
            if let Err(e) = session.reset().await {
                debug!(session_id = session.id(), error = %e, "reset on return failed");
                pool.discard(session, "failed");
                drop(permit);
                return;
            }
        }
        pool.return_session(session);
        // Released only after the session is back on the idle stack, so an
        // admitted waiter finds it there.
        drop(permit);
    }

    /// Detach the session from the pool. The slot is freed immediately and
    /// the session will not be returned.
    pub fn detach(mut self) -> Session {
        // The session is always present until release/detach consumes the
        // guard.
        match self.session.take() {
            Some(session) => session,
            None => unreachable!("guard already consumed"),
        }
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.session {
            Some(session) => std::fmt::Debug::fmt(session, f),
            None => f.debug_struct("PooledSession").finish_non_exhaustive(),
        }
    }
}

impl std::ops::Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        match &self.session {
            Some(session) => session,
            None => unreachable!("guard already consumed"),
        }
    }
}

impl std::ops::DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        match &mut self.session {
            Some(session) => session,
            None => unreachable!("guard already consumed"),
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let permit = self.permit.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if pool.reset_on_return() && session.state().is_idle() {
                        if session.reset().await.is_err() {
                            pool.discard(session, "failed");
                            drop(permit);
                            return;
                        }
                    }
                    pool.return_session(session);
                    drop(permit);
                });
            }
            // No runtime to return on; the socket closes with the session.
            Err(_) => pool.discard(session, "failed"),
        }
    }
}
