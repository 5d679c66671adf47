//! Statement classification port.
//!
//! The router never parses SQL. It consumes `(command, query type, operation)`
//! triples produced by a classifier behind the [`Classify`] trait; routing
//! logic is exercised in tests through scripted doubles of the same shape.

mod keyword;

pub use keyword::KeywordClassifier;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::protocol::Command;

/// Bitfield of query type flags, one bit per property a statement can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryType(u32);

#[allow(dead_code)]
impl QueryType {
    pub const UNKNOWN: QueryType = QueryType(1);
    pub const READ: QueryType = QueryType(1 << 1);
    pub const WRITE: QueryType = QueryType(1 << 2);
    pub const MASTER_READ: QueryType = QueryType(1 << 3);
    pub const SESSION_WRITE: QueryType = QueryType(1 << 4);
    pub const USERVAR_READ: QueryType = QueryType(1 << 5);
    pub const USERVAR_WRITE: QueryType = QueryType(1 << 6);
    pub const SYSVAR_READ: QueryType = QueryType(1 << 7);
    pub const GSYSVAR_READ: QueryType = QueryType(1 << 8);
    pub const GSYSVAR_WRITE: QueryType = QueryType(1 << 9);
    pub const BEGIN_TRX: QueryType = QueryType(1 << 10);
    pub const ENABLE_AUTOCOMMIT: QueryType = QueryType(1 << 11);
    pub const DISABLE_AUTOCOMMIT: QueryType = QueryType(1 << 12);
    pub const ROLLBACK: QueryType = QueryType(1 << 13);
    pub const COMMIT: QueryType = QueryType(1 << 14);
    pub const PREPARE_STMT: QueryType = QueryType(1 << 15);
    pub const PREPARE_NAMED_STMT: QueryType = QueryType(1 << 16);
    pub const EXEC_STMT: QueryType = QueryType(1 << 17);
    pub const CREATE_TMP_TABLE: QueryType = QueryType(1 << 18);
    pub const READ_TMP_TABLE: QueryType = QueryType(1 << 19);
    pub const SHOW_TABLES: QueryType = QueryType(1 << 20);

    pub const fn empty() -> Self {
        QueryType(0)
    }

    pub fn is(self, other: QueryType) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: QueryType) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Any of the prepared-statement preparation flags
    pub fn is_prepare(self) -> bool {
        self.is(QueryType::PREPARE_STMT) || self.is(QueryType::PREPARE_NAMED_STMT)
    }
}

impl BitOr for QueryType {
    type Output = QueryType;

    fn bitor(self, rhs: QueryType) -> QueryType {
        QueryType(self.0 | rhs.0)
    }
}

impl BitOrAssign for QueryType {
    fn bitor_assign(&mut self, rhs: QueryType) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryType({:#x})", self.0)
    }
}

/// Coarse operation kind reported by the classifier. Only `Load` affects
/// routing (it opens a LOAD DATA LOCAL INFILE flow); the rest pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    Undefined,
    Select,
    Insert,
    Update,
    Delete,
    Load,
}

/// Result of classifying one request buffer
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub command: Command,
    pub qtype: QueryType,
    pub op: Operation,
}

impl Classification {
    pub fn new(command: Command, qtype: QueryType, op: Operation) -> Self {
        Self { command, qtype, op }
    }
}

/// The classifier port: maps a request payload to `(qtype, op)`.
///
/// Implementations see the raw payload (command byte included) and must not
/// be given protocol packets the server originated.
pub trait Classify: Send + Sync {
    fn classify(&self, payload: &[u8]) -> (QueryType, Operation);
}

impl<C: Classify + ?Sized> Classify for Box<C> {
    fn classify(&self, payload: &[u8]) -> (QueryType, Operation) {
        (**self).classify(payload)
    }
}

impl<C: Classify + ?Sized> Classify for std::sync::Arc<C> {
    fn classify(&self, payload: &[u8]) -> (QueryType, Operation) {
        (**self).classify(payload)
    }
}

/// Adapter in front of the classifier: derives the command from the packet
/// byte itself and only consults the classifier for payloads that carry SQL.
/// Commands with fixed semantics are mapped directly.
pub struct ClassifierAdapter<C> {
    inner: C,
}

impl<C: Classify> ClassifierAdapter<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn classify(&self, payload: &[u8]) -> Classification {
        let Some(&first) = payload.first() else {
            // Empty payload: LOAD DATA terminator, nothing to classify
            return Classification::new(Command::Unknown, QueryType::empty(), Operation::Undefined);
        };

        let command = Command::from(first);

        let (qtype, op) = match command {
            Command::Query | Command::StmtPrepare | Command::StmtExecute => {
                self.inner.classify(payload)
            }
            // USE db and friends scope session state and must reach every backend
            Command::InitDb | Command::ChangeUser | Command::ResetConnection
            | Command::SetOption => (QueryType::SESSION_WRITE, Operation::Undefined),
            Command::Quit | Command::Ping | Command::StmtClose | Command::StmtSendLongData
            | Command::StmtReset | Command::StmtFetch => {
                (QueryType::empty(), Operation::Undefined)
            }
            _ => (QueryType::UNKNOWN, Operation::Undefined),
        };

        Classification::new(command, qtype, op)
    }
}
