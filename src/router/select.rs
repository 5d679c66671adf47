//! Backend selection.
//!
//! Given the session's backend set and a desired role, pick the handle the
//! statement should be forwarded to. Selection is deterministic: on equal
//! criterion values the earlier-registered handle wins, and the primary
//! flag is re-checked at the moment of return because the monitor publishes
//! status concurrently.

use tracing::{debug, info};

use crate::backend::{BackendId, RouterBackend};
use crate::config::SelectionCriterion;

/// Role the statement needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendRole {
    Master,
    Slave,
}

/// Session state the selector reads
pub struct SelectContext<'a> {
    pub backends: &'a [RouterBackend],
    pub current_master: Option<BackendId>,
    pub target_node: Option<BackendId>,
    pub trx_read_only: bool,
    pub master_accept_reads: bool,
    pub criterion: SelectionCriterion,
    /// Total session commands issued so far
    pub sescmd_count: u64,
    /// History has been dropped: only backends with consistent session
    /// state (cursor caught up) may serve statements
    pub history_disabled: bool,
}

impl SelectContext<'_> {
    /// In consistent-replica-only mode a backend whose cursor fell behind
    /// can no longer be brought up to date
    fn is_consistent(&self, backend: &RouterBackend) -> bool {
        !self.history_disabled
            || backend.is_replaying()
            || backend.cursor() >= self.sescmd_count
    }
}

/// Select a backend for the given role, optionally by server name, bounded
/// by the maximum acceptable replication lag.
pub fn select(
    ctx: &SelectContext<'_>,
    role: BackendRole,
    name: Option<&str>,
    max_rlag: Option<i32>,
) -> Option<BackendId> {
    // An open read-only transaction stays on its pinned node
    if let Some(pinned) = ctx.target_node {
        if ctx.trx_read_only {
            let backend = &ctx.backends[pinned.0];
            debug!(server = %backend.server().name(), "Read-only transaction, using pinned node");
            return Some(pinned);
        }
    }

    let mut role = role;

    if let Some(name) = name {
        for backend in ctx.backends {
            let server = backend.server();
            if backend.in_use()
                && backend.is_active()
                && ctx.is_consistent(backend)
                && server.name().eq_ignore_ascii_case(name)
                && (server.is_master() || server.is_slave() || server.is_relay())
            {
                return Some(backend.id());
            }
        }
        // Named server not usable; fall back to an ordinary replica
        role = BackendRole::Slave;
    }

    match role {
        BackendRole::Slave => select_slave(ctx, max_rlag),
        BackendRole::Master => select_master(ctx),
    }
}

fn within_lag_bound(backend: &RouterBackend, max_rlag: Option<i32>) -> bool {
    match max_rlag {
        None => true,
        // unknown lag counts as too far behind once a bound exists
        Some(bound) => backend
            .server()
            .replication_lag()
            .is_some_and(|lag| lag <= bound),
    }
}

fn select_slave(ctx: &SelectContext<'_>, max_rlag: Option<i32>) -> Option<BackendId> {
    let mut candidate: Option<&RouterBackend> = None;

    for backend in ctx.backends {
        let server = backend.server();

        if !backend.in_use()
            || !backend.is_active()
            || (!server.is_master() && !server.is_slave())
        {
            continue;
        }
        // A backend still replaying session commands is not selectable
        if backend.is_replaying() {
            continue;
        }
        if !ctx.is_consistent(backend) {
            continue;
        }

        let Some(cand) = candidate else {
            // First acceptable handle: the session's own primary, or any
            // replica inside the lag bound
            if server.is_master() && Some(backend.id()) == ctx.current_master {
                candidate = Some(backend);
            } else if server.is_slave() && within_lag_bound(backend, max_rlag) {
                candidate = Some(backend);
            }
            continue;
        };

        if cand.server().is_master()
            && server.is_slave()
            && within_lag_bound(backend, max_rlag)
            && !ctx.master_accept_reads
        {
            // Any qualifying replica beats the primary unless the primary
            // is allowed to serve reads
            candidate = Some(backend);
        } else if server.is_slave() || (ctx.master_accept_reads && server.is_master()) {
            if within_lag_bound(backend, max_rlag) {
                // Strict comparison keeps the earlier handle on ties
                if server.criterion_value(ctx.criterion)
                    < cand.server().criterion_value(ctx.criterion)
                {
                    candidate = Some(backend);
                }
            } else {
                info!(
                    server = %server.name(),
                    rlag = ?server.replication_lag(),
                    "Server is too far behind the primary and cannot be chosen"
                );
            }
        }
    }

    candidate.map(|b| b.id())
}

fn select_master(ctx: &SelectContext<'_>) -> Option<BackendId> {
    let root = root_master(ctx.backends)?;
    let backend = &ctx.backends[root.0];

    // Status may have moved under us; only return a handle that is still
    // flagged primary right now
    if backend.in_use() && backend.is_active() && backend.server().is_master() {
        Some(root)
    } else {
        None
    }
}

/// The root primary: among in-use handles flagged primary, the one with the
/// smallest replication depth. Ties break in registration order.
pub fn root_master(backends: &[RouterBackend]) -> Option<BackendId> {
    let mut candidate: Option<&RouterBackend> = None;

    for backend in backends {
        if backend.in_use() && backend.server().is_master() {
            match candidate {
                Some(cand) if backend.server().depth() >= cand.server().depth() => {}
                _ => candidate = Some(backend),
            }
        }
    }

    candidate.map(|b| b.id())
}
