//! Client session state and the transaction-state oracle.
//!
//! The router consumes transaction state through [`TrxTracker`]; it never
//! derives it from SQL. The tracker is fed twice: by classifier flags when
//! a statement is about to route, and by the server status bits of OK
//! packets flowing back to the client.

use crate::classifier::QueryType;
use crate::protocol::status;
use crate::router::TrxView;

/// Connection-scoped facts learned during the handshake
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub username: String,
    pub database: Option<String>,
    pub capability_flags: u32,
    pub character_set: u8,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_from_handshake(
        &mut self,
        username: String,
        database: Option<String>,
        capabilities: u32,
        charset: u8,
    ) {
        self.username = username;
        self.database = database;
        self.capability_flags = capabilities;
        self.character_set = charset;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TrxState {
    #[default]
    Inactive,
    Active {
        read_only: bool,
    },
    /// The terminating statement (COMMIT/ROLLBACK) is in flight
    Ending {
        read_only: bool,
    },
}

/// Transaction-state tracker
#[derive(Debug, Default)]
pub struct TrxTracker {
    state: TrxState,
    autocommit_off: bool,
}

impl TrxTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update from the classification of a statement about to be routed
    pub fn track_statement(&mut self, qtype: QueryType) {
        if qtype.is(QueryType::BEGIN_TRX) {
            // START TRANSACTION READ ONLY classifies as BEGIN_TRX | READ
            self.state = TrxState::Active {
                read_only: qtype.is(QueryType::READ),
            };
        } else if qtype.is(QueryType::COMMIT) || qtype.is(QueryType::ROLLBACK) {
            if let TrxState::Active { read_only } = self.state {
                self.state = TrxState::Ending { read_only };
            }
        } else if qtype.is(QueryType::DISABLE_AUTOCOMMIT) {
            // autocommit off opens an implicit transaction
            self.autocommit_off = true;
            if self.state == TrxState::Inactive {
                self.state = TrxState::Active { read_only: false };
            }
        } else if qtype.is(QueryType::ENABLE_AUTOCOMMIT) {
            self.autocommit_off = false;
            if let TrxState::Active { read_only } = self.state {
                self.state = TrxState::Ending { read_only };
            }
        }
    }

    /// Update from the status flags of an OK packet the server sent.
    /// This is the database-reported state and wins over inference.
    pub fn observe_server_status(&mut self, flags: u16) {
        if flags & status::SERVER_STATUS_IN_TRANS != 0 {
            self.state = TrxState::Active {
                read_only: flags & status::SERVER_STATUS_IN_TRANS_READONLY != 0,
            };
        } else if self.autocommit_off {
            // autocommit=0 keeps an implicit transaction open
            self.state = TrxState::Active { read_only: false };
        } else {
            self.state = TrxState::Inactive;
        }
    }

    /// The view the router consumes
    pub fn view(&self) -> TrxView {
        match self.state {
            TrxState::Inactive => TrxView::default(),
            TrxState::Active { read_only } => TrxView {
                active: true,
                read_only,
                ending: false,
            },
            TrxState::Ending { read_only } => TrxView {
                active: true,
                read_only,
                ending: true,
            },
        }
    }
}
