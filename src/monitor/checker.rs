//! Built-in server monitor.
//!
//! One long-running probe task per configured server keeps a dedicated
//! connection, classifies the server as primary or replica, reads its
//! replication lag and publishes the result into the shared [`ServerInfo`].

use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, MySqlConn};
use crate::config::{BackendConfig, MonitorConfig};

use super::{server_status, ServerInfo, ServerRegistry};

/// Spawns and owns the per-server probe tasks
pub struct ServerMonitor {
    registry: Arc<ServerRegistry>,
    backends: Vec<BackendConfig>,
    config: MonitorConfig,
}

/// What one probe learned about a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Probe {
    is_master: bool,
    rlag: Option<i32>,
}

impl ServerMonitor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        backends: Vec<BackendConfig>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            backends,
            config,
        }
    }

    /// Start one probe task per server. The returned token stops them all.
    pub fn spawn(self) -> CancellationToken {
        let token = CancellationToken::new();

        if !self.config.enabled {
            info!("Server monitor disabled by configuration");
            return token;
        }

        let interval = Duration::from_millis(self.config.interval_ms);
        let probe_timeout = Duration::from_millis(self.config.timeout_ms);

        for backend in self.backends {
            let info = self.registry.register(&backend.name, &backend.addr());
            let registry = self.registry.clone();
            let task_token = token.clone();

            tokio::spawn(async move {
                // stagger probes so servers are not hit in lockstep
                let initial_delay =
                    rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
                tokio::time::sleep(Duration::from_millis(initial_delay)).await;

                let mut conn: Option<MySqlConn> = None;

                loop {
                    tokio::select! {
                        _ = task_token.cancelled() => {
                            debug!(server = %backend.name, "Monitor task stopping");
                            return;
                        }
                        result = timeout(probe_timeout, probe(&mut conn, &backend)) => {
                            match result {
                                Ok(Ok(probe)) => publish(&info, probe),
                                Ok(Err(e)) => {
                                    warn!(server = %backend.name, error = %e, "Server probe failed");
                                    conn = None;
                                    publish_down(&info);
                                }
                                Err(_) => {
                                    warn!(server = %backend.name, "Server probe timed out");
                                    conn = None;
                                    publish_down(&info);
                                }
                            }
                            registry.refresh_primaries();
                        }
                    }

                    tokio::select! {
                        _ = task_token.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            });
        }

        token
    }
}

/// Probe one server, reconnecting when the cached connection is gone.
///
/// A server is the primary when `@@read_only` is 0 and it reports no
/// replication source; otherwise it is a replica whose lag comes from
/// `Seconds_Behind_Master` (NULL while the SQL thread is down).
async fn probe(
    conn: &mut Option<MySqlConn>,
    backend: &BackendConfig,
) -> Result<Probe, BackendError> {
    if conn.is_none() {
        *conn = Some(
            MySqlConn::connect(
                &backend.addr(),
                &backend.user,
                &backend.password,
                backend.database.as_deref(),
            )
            .await?,
        );
    }
    let c = conn.as_mut().ok_or(BackendError::NotConnected)?;

    let read_only = c.query("SELECT @@read_only").await?;
    let read_only = read_only
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(|v| v.as_deref())
        .map(|v| v != "0")
        .unwrap_or(true);

    let slave_status = c.query("SHOW SLAVE STATUS").await?;
    let replicates = !slave_status.rows.is_empty();

    if !read_only && !replicates {
        return Ok(Probe {
            is_master: true,
            rlag: Some(0),
        });
    }

    let rlag = slave_status
        .first("Seconds_Behind_Master")
        .and_then(|v| v.parse::<i32>().ok());

    Ok(Probe {
        is_master: false,
        rlag,
    })
}

fn publish(info: &ServerInfo, probe: Probe) {
    let maint = info.status() & server_status::MAINT;
    let role = if probe.is_master {
        server_status::MASTER
    } else {
        server_status::SLAVE
    };
    info.set_depth(if probe.is_master { 0 } else { 1 });
    info.set_replication_lag(probe.rlag);
    info.set_status(maint | server_status::RUNNING | role);
}

fn publish_down(info: &ServerInfo) {
    let maint = info.status() & server_status::MAINT;
    info.set_status(maint);
    info.set_replication_lag(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_master() {
        let info = ServerInfo::new("db-1", "10.0.0.1:3306");
        publish(
            &info,
            Probe {
                is_master: true,
                rlag: Some(0),
            },
        );
        assert!(info.is_master());
        assert_eq!(info.depth(), 0);
        assert_eq!(info.replication_lag(), Some(0));
    }

    #[test]
    fn test_publish_replica_preserves_maintenance() {
        let info = ServerInfo::new("db-2", "10.0.0.2:3306");
        info.set_status(server_status::MAINT);
        publish(
            &info,
            Probe {
                is_master: false,
                rlag: Some(7),
            },
        );
        // still flagged for maintenance, so not selectable
        assert!(!info.is_slave());
        assert_ne!(info.status() & server_status::MAINT, 0);
        assert_eq!(info.replication_lag(), Some(7));
    }

    #[test]
    fn test_publish_down_clears_running_and_lag() {
        let info = ServerInfo::new("db-3", "10.0.0.3:3306");
        publish(
            &info,
            Probe {
                is_master: false,
                rlag: Some(1),
            },
        );
        assert!(info.is_slave());

        publish_down(&info);
        assert!(!info.is_usable());
        assert_eq!(info.replication_lag(), None);
        assert_eq!(
            info.criterion_value(crate::config::SelectionCriterion::LeastBehindMaster),
            u64::MAX
        );
    }
}
