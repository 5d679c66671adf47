//! The per-statement routing path.
//!
//! A single client request is handled atomically from classification to
//! forwarding: every write lands on a backend's outbound queue before the
//! worker yields, which preserves per-session ordering without locks.

use tracing::{debug, error, info, warn};

use crate::backend::{BackendId, PendingReply};
use crate::classifier::{Operation, QueryType};
use crate::config::MasterFailureMode;
use crate::hint::Hint;
use crate::metrics::metrics;
use crate::protocol::{is_multi_statement, Command, ErrPacket, Packet};
use crate::router::reply::{self, CompletedReply, PacketOutcome};
use crate::router::select::{select, BackendRole, SelectContext};
use crate::router::sescmd::AdvanceOutcome;
use crate::router::session::{LoadDataState, RouterSession, StashedRead, TrxView};
use crate::router::target::{resolve, RouteInput, RouteTarget};

/// One client request with the hint chain its buffer was annotated with
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub packet: Packet,
    pub hints: Vec<Hint>,
}

impl ClientRequest {
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            hints: Vec::new(),
        }
    }

    pub fn with_hints(packet: Packet, hints: Vec<Hint>) -> Self {
        Self { packet, hints }
    }
}

/// What routing one statement produced
#[derive(Debug)]
pub enum RouteOutcome {
    /// Forwarded to a backend; replies arrive via `process_reply`
    Forwarded,
    /// Reply synthesized by the router; nothing was forwarded
    Reply(Vec<Packet>),
    /// Fatal routing failure; the session must terminate
    Fail(String),
}

impl RouterSession {
    /// Route one client statement
    pub fn route_stmt(&mut self, request: &ClientRequest, trx: TrxView) -> RouteOutcome {
        let classification = self.classifier.classify(&request.packet.payload);
        let command = classification.command;
        let mut qtype = classification.qtype;

        let target = if request.packet.is_empty() && self.load_data == LoadDataState::Active {
            // empty packet: the LOAD DATA LOCAL INFILE terminator
            self.load_data = LoadDataState::End;
            info!(
                session_id = self.id,
                bytes = self.load_data_sent + request.packet.wire_len() as u64,
                "LOAD DATA LOCAL INFILE finished"
            );
            RouteTarget::MASTER
        } else {
            self.handle_multi_and_load(request, &mut qtype, classification.op);

            resolve(&RouteInput {
                qtype,
                trx_active: trx.active,
                trx_read_only: trx.read_only,
                load_active: self.load_data != LoadDataState::Inactive,
                use_sql_variables_in: self.config.use_sql_variables_in,
                target_node_is_master: self.target_node.is_some()
                    && self.target_node == self.current_master,
                hints: &request.hints,
            })
        };

        debug!(session_id = self.id, target = %target, command = ?command, "Statement resolved");

        if target.is_all() {
            metrics().record_route("all");
            return self.route_session_write(request, command);
        }

        let mut store_stmt = false;

        let selected = if target.is_named_server() || target.is_rlag_max() {
            let name = request.hints.iter().find_map(|h| h.named_server());
            let rlag = request
                .hints
                .iter()
                .find_map(|h| h.max_replication_lag())
                .or_else(|| self.config.max_replication_lag());
            let role = if target.is_slave() {
                BackendRole::Slave
            } else {
                BackendRole::Master
            };

            let found = select(&self.select_ctx(trx), role, name, rlag);
            if found.is_none() {
                match name {
                    Some(name) => info!(
                        session_id = self.id,
                        server = %name,
                        "Hinted server is not in a suitable state and no replica could stand in"
                    ),
                    None => info!(
                        session_id = self.id,
                        rlag = ?rlag,
                        "No server within the requested replication lag bound"
                    ),
                }
            }
            found
        } else if target.is_slave() {
            store_stmt = self.config.retry_failed_reads;
            let found = select(
                &self.select_ctx(trx),
                BackendRole::Slave,
                None,
                self.config.max_replication_lag(),
            );
            if found.is_none() {
                info!(
                    session_id = self.id,
                    "Was supposed to route to a replica but found none in a suitable state"
                );
            }
            found
        } else {
            let found = select(&self.select_ctx(trx), BackendRole::Master, None, None);
            match found {
                Some(id) if Some(id) == self.current_master => {
                    if !self.config.strict_multi_stmt && self.target_node == self.current_master
                    {
                        // relaxed multi-statement mode: release the pin
                        self.target_node = None;
                    }
                    found
                }
                other => return self.handle_master_failure(other),
            }
        };

        let Some(id) = selected else {
            metrics().record_query_error("no_target");
            return RouteOutcome::Fail("Could not find a suitable server for the statement".into());
        };

        let outcome = self.forward_to_target(id, request, command, trx, store_stmt);

        if matches!(outcome, RouteOutcome::Forwarded)
            && self.config.connection_keepalive > 0
            && (target.is_slave() || target.is_master())
        {
            self.run_connection_keepalive(id);
        }

        outcome
    }

    /// Multi-statement pinning, temporary table tracking and LOAD DATA
    /// detection (everything that has to happen before target resolution)
    fn handle_multi_and_load(
        &mut self,
        request: &ClientRequest,
        qtype: &mut QueryType,
        op: Operation,
    ) {
        if (self.target_node.is_none() || self.target_node != self.current_master)
            && is_multi_statement(&request.packet.payload, self.client_caps)
        {
            match self.current_master {
                Some(master) => {
                    self.target_node = Some(master);
                    info!(
                        session_id = self.id,
                        "Multi-statement query, routing all future queries to the primary"
                    );
                }
                // without a primary the write-failure policy must fire
                None => qtype.insert(QueryType::WRITE),
            }
        }

        if self.have_tmp_tables && qtype.is(QueryType::READ_TMP_TABLE) {
            qtype.insert(QueryType::MASTER_READ);
        }
        if qtype.is(QueryType::CREATE_TMP_TABLE) {
            self.have_tmp_tables = true;
        }

        if self.load_data == LoadDataState::Active {
            self.load_data_sent += request.packet.wire_len() as u64;
        } else if request.packet.command() == Some(Command::Query) && op == Operation::Load {
            self.load_data = LoadDataState::Start;
            self.load_data_sent = 0;
        }
    }

    /// Broadcast a session command to every in-use backend (§ the
    /// session-write path). The first reply that completes is forwarded to
    /// the client; the rest are merged silently.
    fn route_session_write(&mut self, request: &ClientRequest, command: Command) -> RouteOutcome {
        let expects_response = command.creates_reply();
        let entry = self.log.append(request.packet.clone(), expects_response);
        let position = entry.position();
        let mut nsucc = 0;

        info!(session_id = self.id, position, "Session write, routing to all servers");

        for idx in 0..self.backends.len() {
            let id = BackendId(idx);
            if !self.backends[idx].in_use() {
                continue;
            }

            let was_outstanding = self.backends[idx].has_outstanding_work();
            self.backends[idx].append_session_command(entry.clone());

            match self.backends[idx].execute_session_commands() {
                Ok(_) => {
                    nsucc += 1;
                    self.note_outstanding(id, was_outstanding);
                }
                Err(e) => {
                    error!(
                        session_id = self.id,
                        server = %self.backends[idx].server().name(),
                        error = %e,
                        "Failed to execute session command"
                    );
                    self.backends[idx].close();
                    self.note_outstanding(id, was_outstanding);
                }
            }
        }

        metrics().record_session_command();

        if nsucc > 0 {
            self.sent_sescmd = Some(position);
        }

        if self.log.enforce_history_bound(self.config.max_sescmd_history) {
            warn!(
                session_id = self.id,
                "Session exceeded the session command history limit. Replica recovery is \
                 disabled and only servers with consistent session state are used for the \
                 duration of the session."
            );
            self.config.disable_sescmd_history = true;
            self.config.max_sescmd_history = 0;
        }

        if self.config.disable_sescmd_history {
            let min = self.min_sescmd_cursor();
            self.log.prune_below(min);
        }

        if nsucc > 0 {
            RouteOutcome::Forwarded
        } else {
            RouteOutcome::Fail("Could not route session command to any server".into())
        }
    }

    /// Forward a statement to the chosen backend and update load-data,
    /// pinning and accounting state
    fn forward_to_target(
        &mut self,
        id: BackendId,
        request: &ClientRequest,
        command: Command,
        trx: TrxView,
        store_stmt: bool,
    ) -> RouteOutcome {
        // a read-only transaction pins the replica it started on
        if self.target_node.is_none() && trx.read_only {
            self.target_node = Some(id);
            debug!(
                session_id = self.id,
                server = %self.backends[id.0].server().name(),
                "Pinning node for an open read-only transaction"
            );
        }

        let expects_response =
            self.load_data != LoadDataState::Active && command.creates_reply();

        let was_outstanding = self.backends[id.0].has_outstanding_work();
        let pending = expects_response.then_some(PendingReply::Statement { command });

        if let Err(e) = self.backends[id.0].write(request.packet.clone(), pending) {
            warn!(
                session_id = self.id,
                server = %self.backends[id.0].server().name(),
                error = %e,
                "Forwarding the statement failed"
            );
            self.backends[id.0].close();
            self.note_outstanding(id, was_outstanding);

            if store_stmt {
                // one retry on a different replica
                return self.retry_read(request.packet.clone(), command, trx);
            }
            metrics().record_query_error("backend_write");
            return RouteOutcome::Fail("Routing the statement failed".into());
        }

        let server = self.backends[id.0].server().clone();
        debug!(
            session_id = self.id,
            server = %server.name(),
            master = server.is_master(),
            "Statement forwarded"
        );

        self.note_outstanding(id, was_outstanding);
        server.note_routed();
        metrics().record_route(if server.is_master() { "master" } else { "slave" });

        if expects_response {
            server.incr_current_ops();

            if self.load_data == LoadDataState::Start {
                // the server answers the LOAD statement with a file request
                self.load_data = LoadDataState::Active;
            }
        }

        if store_stmt {
            self.retry_stash = Some(StashedRead {
                packet: request.packet.clone(),
                retried: false,
            });
        }

        // a read-only transaction that is ending releases its pin
        if self.target_node.is_some() && trx.read_only && trx.ending {
            debug!(session_id = self.id, "Read-only transaction ends, releasing pinned node");
            self.target_node = None;
        }

        RouteOutcome::Forwarded
    }

    /// Apply `master_failure_mode` when no usable primary was selectable
    fn handle_master_failure(&mut self, found: Option<BackendId>) -> RouteOutcome {
        if self.config.master_failure_mode == MasterFailureMode::ErrorOnWrite {
            // synthesize a read-only error, close the stale handle, keep going
            if let Some(master) = self.current_master {
                let was_outstanding = self.backends[master.0].has_outstanding_work();
                if self.backends[master.0].in_use() {
                    self.backends[master.0].close();
                    self.note_outstanding(master, was_outstanding);
                }
            }
            metrics().record_query_error("read_only");
            return RouteOutcome::Reply(vec![
                ErrPacket::read_only().encode(1, self.client_caps)
            ]);
        }

        let message = match (self.current_master, found) {
            (Some(old), Some(new)) if old != new => format!(
                "Master server changed from '{}' to '{}'",
                self.backends[old.0].server().name(),
                self.backends[new.0].server().name()
            ),
            (Some(old), _) => format!(
                "The connection to master server '{}' is not available",
                self.backends[old.0].server().name()
            ),
            (None, _) => {
                if self.config.master_failure_mode != MasterFailureMode::FailInstantly {
                    "Session is in read-only mode because it was created when no master \
                     was available"
                        .to_string()
                } else {
                    "Could not find a valid master connection".to_string()
                }
            }
        };

        warn!(
            session_id = self.id,
            "Write query received. {}. Closing client connection.", message
        );
        metrics().record_query_error("no_master");
        RouteOutcome::Fail(message)
    }

    /// Re-route a failed read to another replica, once
    fn retry_read(&mut self, packet: Packet, command: Command, trx: TrxView) -> RouteOutcome {
        metrics().record_read_retry();

        let found = select(
            &self.select_ctx(trx),
            BackendRole::Slave,
            None,
            self.config.max_replication_lag(),
        );

        let Some(id) = found else {
            metrics().record_query_error("retry_exhausted");
            return RouteOutcome::Reply(vec![ErrPacket::new(
                2013,
                "HY000",
                "Lost connection to server during query",
            )
            .encode(1, self.client_caps)]);
        };

        let was_outstanding = self.backends[id.0].has_outstanding_work();
        match self.backends[id.0].write(
            packet.clone(),
            Some(PendingReply::Statement { command }),
        ) {
            Ok(()) => {
                info!(
                    session_id = self.id,
                    server = %self.backends[id.0].server().name(),
                    "Retrying failed read on another replica"
                );
                self.note_outstanding(id, was_outstanding);
                self.backends[id.0].server().incr_current_ops();
                self.retry_stash = Some(StashedRead {
                    packet,
                    retried: true,
                });
                RouteOutcome::Forwarded
            }
            Err(_) => {
                self.backends[id.0].close();
                self.note_outstanding(id, was_outstanding);
                metrics().record_query_error("retry_exhausted");
                RouteOutcome::Reply(vec![ErrPacket::new(
                    2013,
                    "HY000",
                    "Lost connection to server during query",
                )
                .encode(1, self.client_caps)])
            }
        }
    }

    /// Ping idle backends so server-side idle timeouts do not cut off
    /// replicas between user statements
    fn run_connection_keepalive(&mut self, target: BackendId) {
        let keepalive = std::time::Duration::from_secs(self.config.connection_keepalive);

        for backend in &mut self.backends {
            if backend.id() == target || !backend.in_use() || backend.is_waiting_result() {
                continue;
            }
            if backend.idle_for() > keepalive {
                info!(
                    server = %backend.server().name(),
                    idle_secs = backend.idle_for().as_secs(),
                    "Pinging idle server"
                );
                if backend.write(Packet::ping(), Some(PendingReply::Ping)).is_ok() {
                    metrics().record_keepalive_ping();
                }
            }
        }
    }

    /// Consume one packet from a backend. Returns the packets to emit to
    /// the client, in order.
    pub fn process_reply(&mut self, id: BackendId, packet: Packet) -> Vec<Packet> {
        let was_outstanding = self.backends[id.0].has_outstanding_work();
        let mut out = Vec::new();

        match reply::process_packet(&mut self.backends[id.0], packet) {
            PacketOutcome::Partial { forward } => {
                out.extend(forward);
            }
            PacketOutcome::Complete { kind, forward } => {
                match kind {
                    CompletedReply::Statement => {
                        if let Some(packet) = &forward {
                            self.reply_status = reply::completing_status_flags(
                                &packet.payload,
                                self.backends[id.0].capabilities(),
                            );
                        }
                        out.extend(forward);
                        self.retry_stash = None;

                        let server = self.backends[id.0].server().clone();
                        server.decr_current_ops();
                        server.note_response_time(
                            self.backends[id.0].busy_for().as_micros() as u64
                        );

                        if self.load_data == LoadDataState::End {
                            self.load_data = LoadDataState::Inactive;
                            self.load_data_sent = 0;
                        }
                    }
                    CompletedReply::SessionCommand { entry, reply } => {
                        out.extend(self.merge_sescmd_reply(id, entry.position(), reply));
                    }
                    CompletedReply::Ping => {}
                }
                self.note_outstanding(id, was_outstanding);
            }
            PacketOutcome::Unexpected => {}
        }

        out
    }

    /// Merge one backend's completed session command reply: deposit or
    /// compare it, emit the first completed copy of the newest command,
    /// drop a diverging backend and keep the replay moving.
    fn merge_sescmd_reply(
        &mut self,
        id: BackendId,
        position: u64,
        reply: Vec<Packet>,
    ) -> Vec<Packet> {
        let mut reply_bytes = bytes::BytesMut::new();
        for packet in &reply {
            reply_bytes.extend_from_slice(&packet.payload);
        }

        let mut out = Vec::new();

        match self.log.record_response(position, reply_bytes.freeze()) {
            AdvanceOutcome::First => {
                if self.sent_sescmd == Some(position) {
                    out.extend(reply);
                }
            }
            AdvanceOutcome::Duplicate => {}
            AdvanceOutcome::Diverged => {
                warn!(
                    session_id = self.id,
                    position,
                    server = %self.backends[id.0].server().name(),
                    "Session command returned a different result than the first server; \
                     dropping the server for the rest of the session"
                );
                metrics().record_query_error("sescmd_divergence");
                self.backends[id.0].close();
            }
        }

        // keep executing replayed commands on this connection
        if self.backends[id.0].in_use() {
            if let Err(e) = self.backends[id.0].execute_session_commands() {
                warn!(
                    session_id = self.id,
                    server = %self.backends[id.0].server().name(),
                    error = %e,
                    "Session command replay failed"
                );
                self.backends[id.0].close();
            }
        }

        if self.config.disable_sescmd_history {
            let min = self.min_sescmd_cursor();
            self.log.prune_below(min);
        }

        out
    }

    /// A backend connection ended. Returns packets to emit to the client.
    pub fn handle_backend_gone(&mut self, id: BackendId, trx: TrxView) -> Vec<Packet> {
        if !self.backends[id.0].in_use() {
            return Vec::new();
        }

        let was_outstanding = self.backends[id.0].has_outstanding_work();
        let had_statement = self.backends[id.0].has_pending_statement();
        let name = self.backends[id.0].server().name().to_string();

        warn!(session_id = self.id, server = %name, "Backend closed the connection");
        self.backends[id.0].close();
        self.note_outstanding(id, was_outstanding);

        if self.target_node == Some(id) {
            self.target_node = None;
        }

        if self.current_master == Some(id) {
            self.current_master = crate::router::select::root_master(&self.backends);

            match self.config.master_failure_mode {
                MasterFailureMode::FailInstantly => {
                    self.failed = Some(format!("Connection to master server '{name}' lost"));
                    return Vec::new();
                }
                _ => {
                    if had_statement {
                        if self.config.master_failure_mode == MasterFailureMode::FailOnWrite {
                            self.failed =
                                Some(format!("Connection to master server '{name}' lost"));
                        }
                        return vec![ErrPacket::new(
                            2013,
                            "HY000",
                            &format!("Lost connection to server '{name}' during query"),
                        )
                        .encode(1, self.client_caps)];
                    }
                    return Vec::new();
                }
            }
        }

        if had_statement {
            // a read died with the replica; retry once if one was stashed
            if self.config.retry_failed_reads {
                if let Some(stash) = self.retry_stash.take() {
                    if !stash.retried {
                        let command = stash
                            .packet
                            .command()
                            .unwrap_or(Command::Query);
                        match self.retry_read(stash.packet, command, trx) {
                            RouteOutcome::Forwarded => return Vec::new(),
                            RouteOutcome::Reply(packets) => return packets,
                            RouteOutcome::Fail(_) => {}
                        }
                    }
                }
            }
            return vec![ErrPacket::new(
                2013,
                "HY000",
                &format!("Lost connection to server '{name}' during query"),
            )
            .encode(1, self.client_caps)];
        }

        Vec::new()
    }

    fn select_ctx(&self, trx: TrxView) -> SelectContext<'_> {
        SelectContext {
            backends: &self.backends,
            current_master: self.current_master,
            target_node: self.target_node,
            trx_read_only: trx.read_only,
            master_accept_reads: self.config.master_accept_reads,
            criterion: self.config.slave_selection_criteria,
            sescmd_count: self.log.count(),
            history_disabled: self.config.disable_sescmd_history,
        }
    }
}
