//! Session command log.
//!
//! Statements that scope session state (SET, USE, prepares) are recorded
//! here so they can be replayed, in client order, on backends that join the
//! session later. Entries are shared-owned: the log keeps them for replay
//! and every backend's per-connection queue holds references to the ones it
//! still has to execute.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::Packet;

/// One recorded session-scoping statement
#[derive(Debug)]
pub struct SessionCommand {
    position: u64,
    packet: Packet,
    awaits_response: bool,
}

impl SessionCommand {
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn awaits_response(&self) -> bool {
        self.awaits_response
    }
}

/// Outcome of recording a reply at a log position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// First reply at this position; it is the one the client sees
    First,
    /// A byte-identical duplicate from a later backend
    Duplicate,
    /// A later backend produced different bytes at the same position
    Diverged,
}

/// Ordered log of session commands with the per-position response map
pub struct SessionCommandLog {
    entries: VecDeque<Arc<SessionCommand>>,
    responses: BTreeMap<u64, Bytes>,
    count: u64,
    history_disabled: bool,
}

impl SessionCommandLog {
    pub fn new(history_disabled: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            responses: BTreeMap::new(),
            count: 0,
            history_disabled,
        }
    }

    /// Total session commands issued; also the next position
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_history_disabled(&self) -> bool {
        self.history_disabled
    }

    /// Number of retained (replayable) entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a session command. Returns the shared entry carrying its
    /// position. With history disabled the entry is not retained for replay;
    /// in-flight backend queues keep it alive through their own references.
    pub fn append(&mut self, packet: Packet, awaits_response: bool) -> Arc<SessionCommand> {
        let position = self.count;
        self.count += 1;

        let entry = Arc::new(SessionCommand {
            position,
            packet,
            awaits_response,
        });

        if !self.history_disabled {
            self.entries.push_back(entry.clone());
        }

        entry
    }

    /// Entries at or after the given position, in order
    pub fn entries_from(&self, position: u64) -> impl Iterator<Item = &Arc<SessionCommand>> {
        self.entries.iter().filter(move |e| e.position() >= position)
    }

    /// Record a reply at a position. The first reply is authoritative;
    /// later replies are compared against it for divergence.
    pub fn record_response(&mut self, position: u64, reply: Bytes) -> AdvanceOutcome {
        match self.responses.get(&position) {
            None => {
                self.responses.insert(position, reply);
                AdvanceOutcome::First
            }
            Some(stored) if *stored == reply => AdvanceOutcome::Duplicate,
            Some(_) => AdvanceOutcome::Diverged,
        }
    }

    /// Whether a reply at this position has already been recorded
    pub fn has_response(&self, position: u64) -> bool {
        self.responses.contains_key(&position)
    }

    /// Drop responses and entries below the given position (the minimum
    /// cursor over in-use backends). Idempotent.
    pub fn prune_below(&mut self, position: u64) {
        self.responses = self.responses.split_off(&position);
        while self
            .entries
            .front()
            .is_some_and(|e| e.position() < position)
        {
            self.entries.pop_front();
        }
    }

    /// Enforce the history cap: once `count` exceeds a non-zero bound, the
    /// session stops retaining history and runs on consistent replicas only.
    /// Returns true at the moment the bound is crossed.
    pub fn enforce_history_bound(&mut self, max_sescmd_history: u64) -> bool {
        if self.history_disabled || max_sescmd_history == 0 || self.count <= max_sescmd_history {
            return false;
        }
        self.history_disabled = true;
        self.entries.clear();
        true
    }
}
