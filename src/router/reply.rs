//! Reply assembly.
//!
//! Consumes backend packets one at a time, drives the per-backend reply
//! state machine and reports when a complete reply has been observed. The
//! session-level consequences of a completed reply (log advance, response
//! merging, counter updates) are applied by the routing engine; this module
//! only decides packet boundaries and what may stream to the client.

use std::sync::Arc;

use tracing::warn;

use crate::backend::{PendingReply, ReplyState, RouterBackend};
use crate::protocol::{
    is_eof_packet, is_err_packet, is_local_infile_packet, is_ok_packet, ok_status_flags, status,
    Command, Packet,
};
use crate::router::sescmd::SessionCommand;

/// What one backend packet amounted to
#[derive(Debug)]
pub enum PacketOutcome {
    /// Reply still in progress; `forward` streams to the client when the
    /// reply belongs to a normal statement
    Partial { forward: Option<Packet> },
    /// A complete reply has been observed
    Complete {
        kind: CompletedReply,
        forward: Option<Packet>,
    },
    /// Nothing was outstanding on this backend
    Unexpected,
}

/// The reply that just finished
#[derive(Debug)]
pub enum CompletedReply {
    /// A broadcast session command; the buffered reply packets are returned
    /// so the engine can emit exactly one copy to the client
    SessionCommand {
        entry: Arc<SessionCommand>,
        reply: Vec<Packet>,
    },
    /// A normal routed statement
    Statement,
    /// A keep-alive ping; nobody is waiting for it
    Ping,
}

/// The pending queue front, reduced to what the state machine needs
enum Front {
    Ping,
    SessionCommand(Command),
    Statement(Command),
}

/// Feed one packet from a backend into its reply state machine
pub fn process_packet(backend: &mut RouterBackend, packet: Packet) -> PacketOutcome {
    backend.note_read();

    let front = match backend.pending_front() {
        Some(PendingReply::Ping) => Front::Ping,
        Some(PendingReply::SessionCommand(entry)) => {
            Front::SessionCommand(entry.packet().command().unwrap_or(Command::Unknown))
        }
        Some(PendingReply::Statement { command }) => Front::Statement(*command),
        None => {
            warn!(
                backend = %backend.id(),
                server = %backend.server().name(),
                "Discarding packet with no outstanding request"
            );
            return PacketOutcome::Unexpected;
        }
    };

    match front {
        Front::Ping => {
            // a ping answers with a single OK (or ERR); nothing streams
            backend.pop_pending();
            PacketOutcome::Complete {
                kind: CompletedReply::Ping,
                forward: None,
            }
        }
        Front::SessionCommand(command) => {
            let complete = step(backend, command, &packet);
            backend.buffer_sescmd_packet(packet);

            if complete {
                let reply = backend.take_sescmd_reply();
                backend.pop_pending();
                match backend.complete_session_command() {
                    Some(entry) => PacketOutcome::Complete {
                        kind: CompletedReply::SessionCommand { entry, reply },
                        forward: None,
                    },
                    None => PacketOutcome::Unexpected,
                }
            } else {
                PacketOutcome::Partial { forward: None }
            }
        }
        Front::Statement(command) => {
            let complete = step(backend, command, &packet);

            if complete {
                backend.pop_pending();
                PacketOutcome::Complete {
                    kind: CompletedReply::Statement,
                    forward: Some(packet),
                }
            } else {
                PacketOutcome::Partial {
                    forward: Some(packet),
                }
            }
        }
    }
}

/// Advance the reply state machine by one packet. Returns true when the
/// packet completes the reply.
///
/// `done -> start -> (rset-colcount -> rset-rows -> rset-done) | body -> done`
fn step(backend: &mut RouterBackend, command: Command, packet: &Packet) -> bool {
    let caps = backend.capabilities();
    let payload = &packet.payload;

    match backend.reply_state() {
        ReplyState::Done => {
            // pop_pending keeps Start while replies are queued, so this
            // only happens on a protocol violation
            warn!(backend = %backend.id(), "Packet received in reply state done");
            true
        }
        ReplyState::Start => {
            if is_err_packet(payload) {
                return true;
            }
            if is_local_infile_packet(payload) {
                // the file-request is a complete reply; the data stream that
                // follows is client-to-server
                return true;
            }
            if is_ok_packet(payload) {
                if command == Command::StmtPrepare && payload.len() >= 9 {
                    // prepare-OK: u8 status, u32 stmt id, u16 columns, u16 params
                    let columns = u16::from_le_bytes([payload[5], payload[6]]) as u64;
                    let params = u16::from_le_bytes([payload[7], payload[8]]) as u64;
                    let mut remaining = columns + params;
                    if params > 0 {
                        remaining += 1; // EOF after parameter definitions
                    }
                    if columns > 0 {
                        remaining += 1; // EOF after column definitions
                    }
                    if remaining == 0 {
                        return true;
                    }
                    backend.set_body_remaining(remaining);
                    backend.set_reply_state(ReplyState::Body);
                    return false;
                }

                // an OK may announce further results
                let more = ok_status_flags(payload)
                    .is_some_and(|f| f & status::SERVER_MORE_RESULTS_EXIST != 0);
                return !more;
            }

            // result set header: the column count
            backend.set_reply_state(ReplyState::RsetColCount);
            false
        }
        ReplyState::Body => {
            let remaining = backend.body_remaining().saturating_sub(1);
            backend.set_body_remaining(remaining);
            remaining == 0
        }
        ReplyState::RsetColCount => {
            if is_eof_packet(payload, caps) {
                backend.set_reply_state(ReplyState::RsetRows);
            }
            false
        }
        ReplyState::RsetRows => {
            if is_err_packet(payload) {
                return true;
            }
            if is_eof_packet(payload, caps) || is_ok_packet(payload) {
                let flags = ok_status_flags(payload)
                    .or_else(|| eof_status_flags(payload, caps))
                    .unwrap_or(0);
                if flags & status::SERVER_MORE_RESULTS_EXIST != 0 {
                    backend.set_reply_state(ReplyState::Start);
                    return false;
                }
                backend.set_reply_state(ReplyState::RsetDone);
                return true;
            }
            false
        }
        ReplyState::RsetDone => {
            warn!(backend = %backend.id(), "Packet received after result set end");
            true
        }
    }
}

/// Status flags from an EOF packet (warnings u16, status u16)
fn eof_status_flags(payload: &bytes::Bytes, caps: u32) -> Option<u16> {
    if !is_eof_packet(payload, caps) || payload.len() < 5 {
        return None;
    }
    Some(u16::from_le_bytes([payload[3], payload[4]]))
}

/// Server status flags of the packet that completed a reply
pub(crate) fn completing_status_flags(payload: &bytes::Bytes, caps: u32) -> Option<u16> {
    ok_status_flags(payload).or_else(|| eof_status_flags(payload, caps))
}
