//! Host selection strategies for multi-host option sets.
//!
//! When a pool needs a brand-new session it asks its selector which of the
//! configured hosts to dial. `LeastConnections` reads the live-session
//! counters the pool maintains per host.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::config::LoadBalancePolicy;

/// One configured host plus the number of live sessions dialed to it.
#[derive(Debug)]
pub struct HostEndpoint {
    pub host: String,
    pub port: u16,
    active: AtomicUsize,
}

impl HostEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            active: AtomicUsize::new(0),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn session_opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Strategy for choosing the host a new session connects to.
pub trait HostSelector: Send + Sync {
    /// Returns None if the host list is empty.
    fn select<'a>(&self, hosts: &'a [Arc<HostEndpoint>]) -> Option<&'a Arc<HostEndpoint>>;
}

/// Cycle through the host list.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl HostSelector for RoundRobinSelector {
    fn select<'a>(&self, hosts: &'a [Arc<HostEndpoint>]) -> Option<&'a Arc<HostEndpoint>> {
        if hosts.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Some(&hosts[idx])
    }
}

/// Pick a host uniformly at random.
#[derive(Debug, Default)]
pub struct RandomSelector;

impl HostSelector for RandomSelector {
    fn select<'a>(&self, hosts: &'a [Arc<HostEndpoint>]) -> Option<&'a Arc<HostEndpoint>> {
        if hosts.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..hosts.len());
        Some(&hosts[idx])
    }
}

/// Pick the host with the fewest live sessions; ties go to the earlier host.
#[derive(Debug, Default)]
pub struct LeastConnectionsSelector;

impl HostSelector for LeastConnectionsSelector {
    fn select<'a>(&self, hosts: &'a [Arc<HostEndpoint>]) -> Option<&'a Arc<HostEndpoint>> {
        hosts.iter().min_by_key(|h| h.active())
    }
}

/// Always use the first host (failover topologies where order is priority).
#[derive(Debug, Default)]
pub struct InOrderSelector;

impl HostSelector for InOrderSelector {
    fn select<'a>(&self, hosts: &'a [Arc<HostEndpoint>]) -> Option<&'a Arc<HostEndpoint>> {
        hosts.first()
    }
}

/// Build the selector for a configured policy.
pub fn selector_for(policy: LoadBalancePolicy) -> Box<dyn HostSelector> {
    match policy {
        LoadBalancePolicy::RoundRobin => Box::new(RoundRobinSelector::default()),
        LoadBalancePolicy::Random => Box::new(RandomSelector),
        LoadBalancePolicy::LeastConnections => Box::new(LeastConnectionsSelector),
        LoadBalancePolicy::InOrder => Box::new(InOrderSelector),
    }
}
