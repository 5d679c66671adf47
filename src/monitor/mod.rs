//! Shared server roster and monitor-published status.
//!
//! Each configured server has one [`ServerInfo`] whose status, replication
//! depth and replication lag are published by the monitor through
//! sequentially-consistent stores of machine-word fields. Sessions read them
//! without locking and tolerate brief staleness by re-checking the primary
//! flag at the moment of dispatch.

mod checker;

pub use checker::ServerMonitor;

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::config::SelectionCriterion;

/// Replication lag is unknown (server never reported one)
pub const RLAG_UNKNOWN: i32 = -1;

/// Server status bits
pub mod server_status {
    pub const RUNNING: u32 = 1;
    pub const MASTER: u32 = 1 << 1;
    pub const SLAVE: u32 = 1 << 2;
    pub const RELAY: u32 = 1 << 3;
    pub const MAINT: u32 = 1 << 4;
}

/// Monitor-published view of one database server.
///
/// Mutable fields are atomics so the monitor thread can publish while
/// sessions read. Counters feeding the selection criteria live here too
/// because they aggregate across sessions.
pub struct ServerInfo {
    name: String,
    addr: String,
    status: AtomicU32,
    depth: AtomicU32,
    rlag: AtomicI32,
    connections: AtomicU64,
    current_ops: AtomicU64,
    routed_total: AtomicU64,
    avg_response_us: AtomicU64,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            status: AtomicU32::new(0),
            depth: AtomicU32::new(0),
            rlag: AtomicI32::new(RLAG_UNKNOWN),
            connections: AtomicU64::new(0),
            current_ops: AtomicU64::new(0),
            routed_total: AtomicU64::new(0),
            avg_response_us: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: u32) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn set_depth(&self, depth: u32) {
        self.depth.store(depth, Ordering::SeqCst);
    }

    /// Replication lag in seconds, or None when the server has not reported
    pub fn replication_lag(&self) -> Option<i32> {
        let rlag = self.rlag.load(Ordering::SeqCst);
        (rlag != RLAG_UNKNOWN).then_some(rlag)
    }

    pub fn set_replication_lag(&self, rlag: Option<i32>) {
        self.rlag.store(rlag.unwrap_or(RLAG_UNKNOWN), Ordering::SeqCst);
    }

    /// Running primary that is not in maintenance
    pub fn is_master(&self) -> bool {
        let s = self.status();
        s & server_status::RUNNING != 0
            && s & server_status::MASTER != 0
            && s & server_status::MAINT == 0
    }

    /// Running replica that is not in maintenance
    pub fn is_slave(&self) -> bool {
        let s = self.status();
        s & server_status::RUNNING != 0
            && s & server_status::SLAVE != 0
            && s & server_status::MAINT == 0
    }

    pub fn is_relay(&self) -> bool {
        let s = self.status();
        s & server_status::RUNNING != 0
            && s & server_status::RELAY != 0
            && s & server_status::MAINT == 0
    }

    pub fn is_usable(&self) -> bool {
        let s = self.status();
        s & server_status::RUNNING != 0 && s & server_status::MAINT == 0
    }

    pub fn incr_connections(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn incr_current_ops(&self) {
        self.current_ops.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_current_ops(&self) {
        self.current_ops.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn note_routed(&self) {
        self.routed_total.fetch_add(1, Ordering::SeqCst);
    }

    /// Fold one observed response time into the running average
    pub fn note_response_time(&self, micros: u64) {
        let prev = self.avg_response_us.load(Ordering::SeqCst);
        let next = if prev == 0 { micros } else { (prev * 7 + micros) / 8 };
        self.avg_response_us.store(next, Ordering::SeqCst);
    }

    /// The value the backend selector minimises under the given criterion
    pub fn criterion_value(&self, criterion: SelectionCriterion) -> u64 {
        match criterion {
            SelectionCriterion::LeastGlobalConnections => {
                self.connections.load(Ordering::SeqCst)
            }
            SelectionCriterion::LeastBehindMaster => {
                self.replication_lag().map(|l| l.max(0) as u64).unwrap_or(u64::MAX)
            }
            SelectionCriterion::LeastCurrentOperations => {
                self.current_ops.load(Ordering::SeqCst)
            }
            SelectionCriterion::LeastRoutedOperations => {
                self.routed_total.load(Ordering::SeqCst)
            }
            SelectionCriterion::AdaptiveRouting => self.avg_response_us.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInfo")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("status", &self.status())
            .field("depth", &self.depth())
            .field("rlag", &self.replication_lag())
            .finish()
    }
}

/// Registry of all configured servers, in configuration order.
///
/// Failover detection: after each monitor sweep the registry recomputes the
/// set of primary-flagged servers and bumps a generation counter when it
/// changed. Sessions subscribe and react without polling.
pub struct ServerRegistry {
    by_name: DashMap<String, Arc<ServerInfo>>,
    roster: RwLock<Vec<Arc<ServerInfo>>>,
    primaries: RwLock<Vec<String>>,
    failover_tx: watch::Sender<u64>,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    pub fn new() -> Self {
        let (failover_tx, _) = watch::channel(0);
        Self {
            by_name: DashMap::new(),
            roster: RwLock::new(Vec::new()),
            primaries: RwLock::new(Vec::new()),
            failover_tx,
        }
    }

    /// Register a server under its unique name. Idempotent per name.
    pub fn register(&self, name: &str, addr: &str) -> Arc<ServerInfo> {
        let mut inserted = false;
        let info = self
            .by_name
            .entry(name.to_string())
            .or_insert_with(|| {
                inserted = true;
                Arc::new(ServerInfo::new(name, addr))
            })
            .clone();
        if inserted {
            self.roster.write().push(info.clone());
        }
        info
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerInfo>> {
        self.by_name.get(name).map(|e| e.clone())
    }

    /// Snapshot of all servers in registration order
    pub fn roster(&self) -> Vec<Arc<ServerInfo>> {
        self.roster.read().clone()
    }

    /// Subscribe to failover generation bumps
    pub fn subscribe_failover(&self) -> watch::Receiver<u64> {
        self.failover_tx.subscribe()
    }

    /// Recompute the primary set; bump the failover generation on change.
    /// Called by the monitor after publishing a sweep of results.
    pub fn refresh_primaries(&self) {
        let current: Vec<String> = self
            .roster
            .read()
            .iter()
            .filter(|s| s.is_master())
            .map(|s| s.name().to_string())
            .collect();

        let mut primaries = self.primaries.write();
        if *primaries != current {
            *primaries = current;
            self.failover_tx.send_modify(|gen| *gen += 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_status() -> u32 {
        server_status::RUNNING | server_status::MASTER
    }

    fn slave_status() -> u32 {
        server_status::RUNNING | server_status::SLAVE
    }

    #[test]
    fn test_status_predicates() {
        let info = ServerInfo::new("db-1", "10.0.0.1:3306");
        assert!(!info.is_master());
        assert!(!info.is_usable());

        info.set_status(master_status());
        assert!(info.is_master());
        assert!(info.is_usable());
        assert!(!info.is_slave());

        info.set_status(master_status() | server_status::MAINT);
        assert!(!info.is_master());
        assert!(!info.is_usable());
    }

    #[test]
    fn test_replication_lag_sentinel() {
        let info = ServerInfo::new("db-1", "10.0.0.1:3306");
        assert_eq!(info.replication_lag(), None);

        info.set_replication_lag(Some(12));
        assert_eq!(info.replication_lag(), Some(12));

        info.set_replication_lag(None);
        assert_eq!(info.replication_lag(), None);
    }

    #[test]
    fn test_criterion_values() {
        let info = ServerInfo::new("db-1", "10.0.0.1:3306");
        info.incr_connections();
        info.incr_connections();
        info.incr_current_ops();
        info.note_routed();
        info.note_routed();
        info.note_routed();

        assert_eq!(
            info.criterion_value(SelectionCriterion::LeastGlobalConnections),
            2
        );
        assert_eq!(
            info.criterion_value(SelectionCriterion::LeastCurrentOperations),
            1
        );
        assert_eq!(
            info.criterion_value(SelectionCriterion::LeastRoutedOperations),
            3
        );
        // unknown lag sorts last
        assert_eq!(
            info.criterion_value(SelectionCriterion::LeastBehindMaster),
            u64::MAX
        );
        info.set_replication_lag(Some(4));
        assert_eq!(
            info.criterion_value(SelectionCriterion::LeastBehindMaster),
            4
        );
    }

    #[test]
    fn test_registry_roster_order() {
        let registry = ServerRegistry::new();
        registry.register("db-1", "10.0.0.1:3306");
        registry.register("db-2", "10.0.0.2:3306");
        registry.register("db-1", "10.0.0.1:3306"); // duplicate ignored

        let roster = registry.roster();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].name(), "db-1");
        assert_eq!(roster[1].name(), "db-2");
    }

    #[test]
    fn test_failover_generation_bumps_on_primary_change() {
        let registry = ServerRegistry::new();
        let a = registry.register("db-1", "10.0.0.1:3306");
        let b = registry.register("db-2", "10.0.0.2:3306");
        let rx = registry.subscribe_failover();

        a.set_status(master_status());
        b.set_status(slave_status());
        registry.refresh_primaries();
        assert_eq!(*rx.borrow(), 1);

        // no change, no bump
        registry.refresh_primaries();
        assert_eq!(*rx.borrow(), 1);

        // failover: db-2 promoted
        a.set_status(slave_status());
        b.set_status(master_status());
        registry.refresh_primaries();
        assert_eq!(*rx.borrow(), 2);
    }
}
