//! Per-session backend handles.
//!
//! A [`RouterBackend`] owns one connection to one database server for the
//! lifetime of a session. Writes are enqueued synchronously onto an
//! unbounded channel drained by a writer task, so the routing engine never
//! suspends between classifying a statement and forwarding it. A reader
//! task pushes every server packet into the session's event channel where
//! the reply assembler correlates it with the handle's pending-reply queue.

mod conn;

pub use conn::{BackendError, MySqlConn, ResultSet};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::monitor::ServerInfo;
use crate::protocol::Packet;
use crate::router::sescmd::SessionCommand;

/// Index of a backend within its session's backend set.
///
/// `current_master` and `target_node` are stored as ids, never as second
/// owners of the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(pub usize);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// Event pushed by a backend reader task: a packet, or None when the
/// connection ended
pub type BackendEvent = (BackendId, Option<Packet>);

/// Progress of decoding the reply currently in front of the pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// No reply outstanding
    Done,
    /// Waiting for the first packet of a reply
    Start,
    /// Multi-packet non-resultset reply (LOCAL INFILE request flow)
    Body,
    /// Column count seen; reading column definitions
    RsetColCount,
    /// Reading result rows
    RsetRows,
    /// Final EOF seen; reply complete
    RsetDone,
}

/// What kind of reply the backend owes us, in request order
#[derive(Debug, Clone)]
pub enum PendingReply {
    /// Reply to a broadcast session command at a log position
    SessionCommand(Arc<SessionCommand>),
    /// Reply to a normal routed statement
    Statement { command: crate::protocol::Command },
    /// Reply to a keep-alive ping; consumed silently
    Ping,
}

/// One backend server as seen by one session
pub struct RouterBackend {
    id: BackendId,
    server: Arc<ServerInfo>,
    in_use: bool,
    writer: Option<mpsc::UnboundedSender<Packet>>,
    tasks: Vec<JoinHandle<()>>,
    reply_state: ReplyState,
    pending: VecDeque<PendingReply>,
    /// Session commands still to execute on this connection, in log order
    sescmd_queue: VecDeque<Arc<SessionCommand>>,
    /// The front of the queue has been written and awaits its reply
    sescmd_active: bool,
    /// Next log position this connection has to complete
    cursor: u64,
    /// Packets of the in-progress session command reply
    sescmd_reply: Vec<Packet>,
    /// Packets left in a counted multi-packet reply (prepare responses)
    body_remaining: u64,
    /// Capabilities negotiated with this server
    capabilities: u32,
    last_read: Instant,
    last_write: Instant,
}

impl RouterBackend {
    pub fn new(id: BackendId, server: Arc<ServerInfo>) -> Self {
        Self {
            id,
            server,
            in_use: false,
            writer: None,
            tasks: Vec::new(),
            reply_state: ReplyState::Done,
            pending: VecDeque::new(),
            sescmd_queue: VecDeque::new(),
            sescmd_active: false,
            cursor: 0,
            sescmd_reply: Vec::new(),
            body_remaining: 0,
            capabilities: crate::protocol::capabilities::DEFAULT_CAPABILITIES,
            last_read: Instant::now(),
            last_write: Instant::now(),
        }
    }

    /// Open a connection and start the writer/reader tasks. Resets the
    /// session-command cursor: a fresh connection has fresh session state
    /// and must replay the whole log.
    pub async fn connect(
        &mut self,
        user: &str,
        password: &str,
        database: Option<&str>,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<(), BackendError> {
        let conn = MySqlConn::connect(self.server.addr(), user, password, database).await?;
        self.attach(conn, events);
        Ok(())
    }

    /// Wire an established connection into this handle
    pub fn attach(&mut self, conn: MySqlConn, events: mpsc::UnboundedSender<BackendEvent>) {
        self.capabilities = conn.capabilities();
        let (mut sink, mut stream) = conn.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();

        let writer = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if sink.send(packet).await.is_err() {
                    break;
                }
            }
        });

        let id = self.id;
        let reader = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(packet)) => {
                        if events.send((id, Some(packet))).is_err() {
                            return;
                        }
                    }
                    _ => {
                        let _ = events.send((id, None));
                        return;
                    }
                }
            }
        });

        self.writer = Some(tx);
        self.tasks = vec![writer, reader];
        self.in_use = true;
        self.reply_state = ReplyState::Done;
        self.pending.clear();
        self.sescmd_queue.clear();
        self.sescmd_active = false;
        self.cursor = 0;
        self.last_read = Instant::now();
        self.server.incr_connections();
    }

    /// Handle backed by a bare channel instead of a socket; the receiver
    /// observes everything the router writes.
    #[cfg(test)]
    pub fn for_test(
        id: BackendId,
        server: Arc<ServerInfo>,
    ) -> (Self, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut backend = Self::new(id, server);
        backend.writer = Some(tx);
        backend.in_use = true;
        backend.server.incr_connections();
        (backend, rx)
    }

    /// Re-arm a closed test handle with a fresh channel, as a reconnect
    /// would: cursor reset, queues empty.
    #[cfg(test)]
    pub fn rearm_for_test(&mut self) -> mpsc::UnboundedReceiver<Packet> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.writer = Some(tx);
        self.in_use = true;
        self.server.incr_connections();
        self.reply_state = ReplyState::Done;
        self.pending.clear();
        self.sescmd_queue.clear();
        self.sescmd_active = false;
        self.cursor = 0;
        self.sescmd_reply.clear();
        rx
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn server(&self) -> &Arc<ServerInfo> {
        &self.server
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// In use and backed by a server the monitor still considers usable
    pub fn is_active(&self) -> bool {
        self.in_use && self.server.is_usable()
    }

    pub fn reply_state(&self) -> ReplyState {
        self.reply_state
    }

    pub fn set_reply_state(&mut self, state: ReplyState) {
        self.reply_state = state;
    }

    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn body_remaining(&self) -> u64 {
        self.body_remaining
    }

    pub fn set_body_remaining(&mut self, remaining: u64) {
        self.body_remaining = remaining;
    }

    /// Whether any reply is still owed
    pub fn is_waiting_result(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether a reply other than a keep-alive ping is still owed
    pub fn has_outstanding_work(&self) -> bool {
        self.pending
            .iter()
            .any(|p| !matches!(p, PendingReply::Ping))
    }

    /// Whether a normal statement reply is still owed
    pub fn has_pending_statement(&self) -> bool {
        self.pending
            .iter()
            .any(|p| matches!(p, PendingReply::Statement { .. }))
    }

    /// Still executing replayed session commands; not selectable for reads
    pub fn is_replaying(&self) -> bool {
        !self.sescmd_queue.is_empty()
    }

    pub fn pending_front(&self) -> Option<&PendingReply> {
        self.pending.front()
    }

    pub fn pop_pending(&mut self) -> Option<PendingReply> {
        let front = self.pending.pop_front();
        if self.pending.is_empty() {
            self.reply_state = ReplyState::Done;
        } else {
            self.reply_state = ReplyState::Start;
        }
        front
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Positions queued for replay, in order
    pub fn replay_positions(&self) -> Vec<u64> {
        self.sescmd_queue.iter().map(|e| e.position()).collect()
    }

    pub fn last_read(&self) -> Instant {
        self.last_read
    }

    pub fn note_read(&mut self) {
        self.last_read = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_read.elapsed()
    }

    /// Time since the most recent forwarded request
    pub fn busy_for(&self) -> Duration {
        self.last_write.elapsed()
    }

    /// Forward a request. `expect` describes the reply owed, or None for
    /// fire-and-forget packets (QUIT, LOAD DATA body, STMT_CLOSE).
    pub fn write(
        &mut self,
        packet: Packet,
        expect: Option<PendingReply>,
    ) -> Result<(), BackendError> {
        let writer = self.writer.as_ref().ok_or(BackendError::NotConnected)?;
        writer
            .send(packet)
            .map_err(|_| BackendError::Disconnected)?;
        self.last_write = Instant::now();

        if let Some(kind) = expect {
            self.pending.push_back(kind);
            if self.reply_state == ReplyState::Done {
                self.reply_state = ReplyState::Start;
            }
        }
        Ok(())
    }

    /// Queue a session command for execution on this connection
    pub fn append_session_command(&mut self, entry: Arc<SessionCommand>) {
        self.sescmd_queue.push_back(entry);
    }

    /// Enqueue every log entry this connection has not yet completed
    pub fn stamp(&mut self, log: &crate::router::sescmd::SessionCommandLog) {
        let queued_past = self
            .sescmd_queue
            .back()
            .map(|e| e.position() + 1)
            .unwrap_or(self.cursor);
        for entry in log.entries_from(queued_past) {
            self.sescmd_queue.push_back(entry.clone());
        }
    }

    /// Execute queued session commands up to the first one that awaits a
    /// reply. Returns true when a reply is now outstanding.
    pub fn execute_session_commands(&mut self) -> Result<bool, BackendError> {
        while !self.sescmd_active {
            let Some(front) = self.sescmd_queue.front().cloned() else {
                return Ok(false);
            };

            if front.awaits_response() {
                self.write(
                    front.packet().clone(),
                    Some(PendingReply::SessionCommand(front)),
                )?;
                self.sescmd_active = true;
            } else {
                self.write(front.packet().clone(), None)?;
                self.cursor = front.position() + 1;
                self.sescmd_queue.pop_front();
            }
        }
        Ok(true)
    }

    /// Mark the in-flight session command complete and advance the cursor
    pub fn complete_session_command(&mut self) -> Option<Arc<SessionCommand>> {
        let entry = self.sescmd_queue.pop_front()?;
        self.sescmd_active = false;
        self.cursor = entry.position() + 1;
        self.sescmd_reply.clear();
        Some(entry)
    }

    /// Accumulate one packet of the in-progress session command reply
    pub fn buffer_sescmd_packet(&mut self, packet: Packet) {
        self.sescmd_reply.push(packet);
    }

    pub fn take_sescmd_reply(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.sescmd_reply)
    }

    /// Close the connection and make the handle unusable for this session
    pub fn close(&mut self) {
        if !self.in_use {
            return;
        }
        debug!(backend = %self.id, server = %self.server.name(), "Closing backend");
        self.in_use = false;
        self.writer = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.pending.clear();
        self.sescmd_queue.clear();
        self.sescmd_active = false;
        self.sescmd_reply.clear();
        self.reply_state = ReplyState::Done;
        self.server.decr_connections();
    }
}

impl Drop for RouterBackend {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{server_status, ServerInfo};
    use crate::router::sescmd::SessionCommandLog;

    fn test_server(name: &str) -> Arc<ServerInfo> {
        let server = Arc::new(ServerInfo::new(name, "127.0.0.1:3306"));
        server.set_status(server_status::RUNNING | server_status::SLAVE);
        server
    }

    #[tokio::test]
    async fn test_write_tracks_pending_replies() {
        let (mut backend, mut rx) = RouterBackend::for_test(BackendId(0), test_server("db-1"));
        assert_eq!(backend.reply_state(), ReplyState::Done);

        backend
            .write(Packet::query(0, "SELECT 1"), Some(PendingReply::Statement { command: crate::protocol::Command::Query }))
            .unwrap();
        assert_eq!(backend.reply_state(), ReplyState::Start);
        assert!(backend.is_waiting_result());

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.payload[1..], *b"SELECT 1");

        backend.pop_pending();
        assert_eq!(backend.reply_state(), ReplyState::Done);
        assert!(!backend.is_waiting_result());
    }

    #[tokio::test]
    async fn test_fire_and_forget_write_leaves_state_done() {
        let (mut backend, mut rx) = RouterBackend::for_test(BackendId(0), test_server("db-1"));
        backend
            .write(Packet::new(0, bytes::Bytes::from_static(&[0x01])), None)
            .unwrap();
        assert_eq!(backend.reply_state(), ReplyState::Done);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_stamp_then_execute_replays_in_order() {
        let mut log = SessionCommandLog::new(false);
        log.append(Packet::query(0, "SET autocommit=0"), true);
        log.append(Packet::query(0, "USE app"), true);

        let (mut backend, mut rx) = RouterBackend::for_test(BackendId(1), test_server("db-2"));
        backend.stamp(&log);
        assert_eq!(backend.replay_positions(), vec![0, 1]);
        assert!(backend.is_replaying());

        // only the first command goes out; the second waits for its reply
        assert!(backend.execute_session_commands().unwrap());
        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload[1..], *b"SET autocommit=0");
        assert!(rx.try_recv().is_err());

        let done = backend.complete_session_command().unwrap();
        assert_eq!(done.position(), 0);
        assert_eq!(backend.cursor(), 1);
        backend.pop_pending();

        assert!(backend.execute_session_commands().unwrap());
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload[1..], *b"USE app");

        backend.complete_session_command().unwrap();
        backend.pop_pending();
        assert_eq!(backend.cursor(), 2);
        assert!(!backend.is_replaying());
    }

    #[tokio::test]
    async fn test_stamp_skips_already_queued_entries() {
        let mut log = SessionCommandLog::new(false);
        log.append(Packet::query(0, "SET a=1"), true);

        let (mut backend, _rx) = RouterBackend::for_test(BackendId(0), test_server("db-1"));
        backend.stamp(&log);
        backend.stamp(&log); // no duplicates
        assert_eq!(backend.replay_positions(), vec![0]);

        log.append(Packet::query(0, "SET b=2"), true);
        backend.stamp(&log);
        assert_eq!(backend.replay_positions(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_close_clears_state() {
        let (mut backend, _rx) = RouterBackend::for_test(BackendId(0), test_server("db-1"));
        backend
            .write(Packet::query(0, "SELECT 1"), Some(PendingReply::Statement { command: crate::protocol::Command::Query }))
            .unwrap();

        backend.close();
        assert!(!backend.in_use());
        assert!(!backend.is_waiting_result());
        assert_eq!(backend.reply_state(), ReplyState::Done);
        assert!(backend
            .write(Packet::query(0, "SELECT 1"), None)
            .is_err());
    }

    #[tokio::test]
    async fn test_non_responding_session_commands_advance_cursor() {
        let mut log = SessionCommandLog::new(false);
        log.append(Packet::query(0, "SET a=1"), false);
        log.append(Packet::query(0, "SET b=2"), false);

        let (mut backend, mut rx) = RouterBackend::for_test(BackendId(0), test_server("db-1"));
        backend.stamp(&log);
        // nothing awaits a response, so both are written straight through
        assert!(!backend.execute_session_commands().unwrap());
        assert_eq!(backend.cursor(), 2);
        assert!(!backend.is_replaying());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(!backend.is_waiting_result());
    }
}
