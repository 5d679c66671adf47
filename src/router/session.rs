//! Router session state and lifecycle.
//!
//! One [`RouterSession`] exists per client connection. It owns the set of
//! backend handles, the session command log and the pointers into the
//! backend set (`current_master`, `target_node`). The statement path lives
//! in `engine.rs`; this file covers opening, closing and failover.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{BackendEvent, BackendId, RouterBackend};
use crate::classifier::{Classify, ClassifierAdapter};
use crate::config::{BackendConfig, MasterFailureMode, RouterConfig};
use crate::monitor::ServerRegistry;
use crate::protocol::{capabilities, ErrPacket, Packet};
use crate::router::select::root_master;
use crate::router::sescmd::SessionCommandLog;

/// Transaction state as reported by the session-layer tracker. The router
/// never derives this from SQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrxView {
    pub active: bool,
    pub read_only: bool,
    pub ending: bool,
}

/// Load-data flow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadDataState {
    #[default]
    Inactive,
    /// LOAD DATA LOCAL INFILE statement routed; file request pending
    Start,
    /// Client is streaming file contents
    Active,
    /// Empty terminator routed; final OK pending
    End,
}

/// A read stashed for one retry on a different replica
pub(crate) struct StashedRead {
    pub packet: Packet,
    pub retried: bool,
}

/// Per-session routing state
pub struct RouterSession {
    pub(crate) id: u32,
    /// Snapshot of the routing configuration; `disable_sescmd_history` and
    /// `max_sescmd_history` may flip when the history bound is crossed
    pub(crate) config: RouterConfig,
    pub(crate) classifier: ClassifierAdapter<Box<dyn Classify>>,
    pub(crate) backends: Vec<RouterBackend>,
    pub(crate) current_master: Option<BackendId>,
    /// Replica pinned by an open read-only transaction, or the primary
    /// pinned by a multi-statement packet
    pub(crate) target_node: Option<BackendId>,
    pub(crate) log: SessionCommandLog,
    /// Position of the newest session command that reached a backend
    pub(crate) sent_sescmd: Option<u64>,
    /// Backends with a reply outstanding (keep-alive pings excluded)
    pub(crate) expected_responses: u64,
    pub(crate) load_data: LoadDataState,
    pub(crate) load_data_sent: u64,
    pub(crate) have_tmp_tables: bool,
    pub(crate) retry_stash: Option<StashedRead>,
    pub(crate) client_caps: u32,
    /// Server status flags of the most recently completed statement reply;
    /// the session-layer transaction tracker consumes them
    pub(crate) reply_status: Option<u16>,
    /// Set when a fatal routing failure requires terminating the session
    pub(crate) failed: Option<String>,
}

impl RouterSession {
    /// Open the per-session backend set: one handle per configured server,
    /// each with its own connection. Servers that cannot be reached stay
    /// out of use; the session works with whatever connected.
    pub async fn open(
        id: u32,
        config: RouterConfig,
        classifier: Box<dyn Classify>,
        registry: &ServerRegistry,
        backend_configs: &[BackendConfig],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Self {
        let mut backends = Vec::with_capacity(backend_configs.len());

        for (idx, bc) in backend_configs.iter().enumerate() {
            let server = registry.register(&bc.name, &bc.addr());
            let mut backend = RouterBackend::new(BackendId(idx), server);

            if backend.server().is_usable() {
                match backend
                    .connect(&bc.user, &bc.password, bc.database.as_deref(), events.clone())
                    .await
                {
                    Ok(()) => {
                        debug!(session_id = id, server = %bc.name, "Backend opened")
                    }
                    Err(e) => {
                        warn!(session_id = id, server = %bc.name, error = %e,
                              "Failed to open backend")
                    }
                }
            }

            backends.push(backend);
        }

        let session = Self::assemble(id, config, classifier, backends);
        if session.current_master.is_none() {
            info!(
                session_id = id,
                "Session opened without a primary; writes will fail per master_failure_mode"
            );
        }
        session
    }

    fn assemble(
        id: u32,
        config: RouterConfig,
        classifier: Box<dyn Classify>,
        backends: Vec<RouterBackend>,
    ) -> Self {
        let current_master = root_master(&backends);
        let history_disabled = config.disable_sescmd_history;

        Self {
            id,
            config,
            classifier: ClassifierAdapter::new(classifier),
            backends,
            current_master,
            target_node: None,
            log: SessionCommandLog::new(history_disabled),
            sent_sescmd: None,
            expected_responses: 0,
            load_data: LoadDataState::Inactive,
            load_data_sent: 0,
            have_tmp_tables: false,
            retry_stash: None,
            client_caps: capabilities::DEFAULT_CAPABILITIES,
            reply_status: None,
            failed: None,
        }
    }

    /// Build a session over pre-constructed backend handles
    #[cfg(test)]
    pub fn for_test(
        config: RouterConfig,
        classifier: Box<dyn Classify>,
        backends: Vec<RouterBackend>,
    ) -> Self {
        Self::assemble(0, config, classifier, backends)
    }

    pub fn backend(&self, id: BackendId) -> &RouterBackend {
        &self.backends[id.0]
    }

    pub(crate) fn backend_mut(&mut self, id: BackendId) -> &mut RouterBackend {
        &mut self.backends[id.0]
    }

    pub fn current_master(&self) -> Option<BackendId> {
        self.current_master
    }

    pub fn expected_responses(&self) -> u64 {
        self.expected_responses
    }

    pub fn sescmd_count(&self) -> u64 {
        self.log.count()
    }

    /// Fatal failure message, when the session must terminate
    pub fn failure(&self) -> Option<&str> {
        self.failed.as_deref()
    }

    pub fn set_client_capabilities(&mut self, caps: u32) {
        self.client_caps = caps;
    }

    /// Status flags carried by the last completed statement reply, if any
    pub fn take_reply_status(&mut self) -> Option<u16> {
        self.reply_status.take()
    }

    /// Whether any backend connection is open
    pub fn has_open_backends(&self) -> bool {
        self.backends.iter().any(|b| b.in_use())
    }

    /// Smallest session-command cursor over in-use backends; everything
    /// below it can be pruned
    pub(crate) fn min_sescmd_cursor(&self) -> u64 {
        self.backends
            .iter()
            .filter(|b| b.in_use())
            .map(|b| b.cursor())
            .min()
            .unwrap_or(self.log.count())
    }

    /// Adjust `expected_responses` after a backend's outstanding-work flag
    /// may have changed
    pub(crate) fn note_outstanding(&mut self, id: BackendId, was_outstanding: bool) {
        let now = self.backends[id.0].has_outstanding_work();
        match (was_outstanding, now) {
            (false, true) => self.expected_responses += 1,
            (true, false) => self.expected_responses = self.expected_responses.saturating_sub(1),
            _ => {}
        }
    }

    /// React to a monitor-detected change of the primary set.
    ///
    /// The root primary is recomputed over this session's handles. When it
    /// moved, the old handle is closed and subsequent writes go to the new
    /// primary on their own; the client never sees a reconnect. What
    /// happens when no primary is left depends on `master_failure_mode`.
    /// Returns packets to emit to the client (an error for a statement that
    /// was in flight to the lost primary).
    pub fn handle_failover(&mut self) -> Vec<Packet> {
        let new_master = root_master(&self.backends);
        if new_master == self.current_master {
            return Vec::new();
        }

        let mut out = Vec::new();
        let old = self.current_master;

        if let Some(old_id) = old {
            let was_outstanding = self.backends[old_id.0].has_outstanding_work();
            let old_backend = &mut self.backends[old_id.0];
            let old_name = old_backend.server().name().to_string();

            if old_backend.in_use() {
                old_backend.close();
            }
            self.note_outstanding(old_id, was_outstanding);

            if was_outstanding {
                // the statement in flight to the old primary is lost
                out.push(
                    ErrPacket::new(
                        2013,
                        "HY000",
                        &format!("Lost connection to server '{old_name}' during query"),
                    )
                    .encode(1, self.client_caps),
                );
                if self.config.master_failure_mode != MasterFailureMode::ErrorOnWrite {
                    self.failed = Some(format!(
                        "Primary server '{old_name}' failed mid-statement"
                    ));
                }
            }

            if self.target_node == Some(old_id) {
                self.target_node = None;
            }

            match new_master {
                Some(new_id) => info!(
                    session_id = self.id,
                    old = %old_name,
                    new = %self.backends[new_id.0].server().name(),
                    "Primary changed"
                ),
                None => info!(session_id = self.id, old = %old_name, "Primary lost"),
            }
        }

        self.current_master = new_master;
        crate::metrics::metrics().record_failover();

        if new_master.is_none()
            && self.config.master_failure_mode == MasterFailureMode::FailInstantly
        {
            self.failed = Some("No primary server available".to_string());
        }

        out
    }

    /// Reconnect a lost backend and bring it back into the session.
    /// Returns false when the backend cannot rejoin (history was dropped).
    pub async fn reopen_backend(
        &mut self,
        id: BackendId,
        config: &BackendConfig,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> bool {
        if self.backends[id.0].in_use() || !self.backends[id.0].server().is_usable() {
            return false;
        }
        if self.config.disable_sescmd_history && self.log.count() > 0 {
            // a fresh connection would need the full replay log
            info!(
                session_id = self.id,
                server = %self.backends[id.0].server().name(),
                "Server cannot rejoin the session: command history is no longer available"
            );
            return false;
        }

        match self.backends[id.0]
            .connect(
                &config.user,
                &config.password,
                config.database.as_deref(),
                events,
            )
            .await
        {
            Ok(()) => self.on_backend_rejoined(id),
            Err(e) => {
                debug!(
                    session_id = self.id,
                    server = %self.backends[id.0].server().name(),
                    error = %e,
                    "Backend reopen failed"
                );
                false
            }
        }
    }

    /// A backend has a fresh connection: replay the session command log
    /// from its cursor before it can serve anything else
    pub(crate) fn on_backend_rejoined(&mut self, id: BackendId) -> bool {
        if self.config.disable_sescmd_history
            && self.backends[id.0].cursor() < self.log.count()
        {
            info!(
                session_id = self.id,
                server = %self.backends[id.0].server().name(),
                "Server cannot rejoin the session: command history is no longer available"
            );
            self.backends[id.0].close();
            return false;
        }

        let was_outstanding = self.backends[id.0].has_outstanding_work();
        self.backends[id.0].stamp(&self.log);

        if let Err(e) = self.backends[id.0].execute_session_commands() {
            warn!(
                session_id = self.id,
                server = %self.backends[id.0].server().name(),
                error = %e,
                "Session command replay on rejoin failed"
            );
            self.backends[id.0].close();
            return false;
        }

        self.note_outstanding(id, was_outstanding);
        debug!(
            session_id = self.id,
            server = %self.backends[id.0].server().name(),
            replay = ?self.backends[id.0].replay_positions(),
            "Backend rejoined the session"
        );
        true
    }

    /// Close every backend; run on every termination path
    pub fn close(&mut self) {
        debug!(session_id = self.id, "Closing router session");
        self.retry_stash = None;
        for backend in &mut self.backends {
            backend.close();
        }
    }
}
