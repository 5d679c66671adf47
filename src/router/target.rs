//! Route target resolution.
//!
//! [`resolve`] is a pure function from statement classification, transaction
//! state and hints to a target bitfield. Keeping it free of session access
//! is what makes the routing decision table testable in isolation.

use std::fmt;

use tracing::warn;

use crate::classifier::QueryType;
use crate::config::UseSqlVariablesIn;
use crate::hint::Hint;

/// Bitfield naming the backends a statement is intended for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteTarget(u32);

impl RouteTarget {
    pub const UNDEFINED: RouteTarget = RouteTarget(0);
    pub const MASTER: RouteTarget = RouteTarget(1);
    pub const SLAVE: RouteTarget = RouteTarget(1 << 1);
    pub const NAMED_SERVER: RouteTarget = RouteTarget(1 << 2);
    pub const ALL: RouteTarget = RouteTarget(1 << 3);
    pub const RLAG_MAX: RouteTarget = RouteTarget(1 << 4);

    fn contains(self, other: RouteTarget) -> bool {
        self.0 & other.0 != 0
    }

    fn insert(&mut self, other: RouteTarget) {
        self.0 |= other.0;
    }

    pub fn is_master(self) -> bool {
        self.contains(Self::MASTER)
    }

    pub fn is_slave(self) -> bool {
        self.contains(Self::SLAVE)
    }

    pub fn is_all(self) -> bool {
        self.contains(Self::ALL)
    }

    pub fn is_named_server(self) -> bool {
        self.contains(Self::NAMED_SERVER)
    }

    pub fn is_rlag_max(self) -> bool {
        self.contains(Self::RLAG_MAX)
    }

    fn has_role(self) -> bool {
        self.contains(Self::MASTER) || self.contains(Self::SLAVE) || self.contains(Self::ALL)
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.is_all() {
            parts.push("ALL");
        }
        if self.is_master() {
            parts.push("MASTER");
        }
        if self.is_slave() {
            parts.push("SLAVE");
        }
        if self.is_named_server() {
            parts.push("NAMED_SERVER");
        }
        if self.is_rlag_max() {
            parts.push("RLAG_MAX");
        }
        if parts.is_empty() {
            parts.push("UNDEFINED");
        }
        write!(f, "{}", parts.join("|"))
    }
}

/// Everything the resolver looks at for one statement
#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    pub qtype: QueryType,
    pub trx_active: bool,
    pub trx_read_only: bool,
    pub load_active: bool,
    pub use_sql_variables_in: UseSqlVariablesIn,
    /// The pinned node is the session's current primary
    pub target_node_is_master: bool,
    pub hints: &'a [Hint],
}

/// Map a classified statement to its route target.
///
/// Precedence: a pinned primary wins; session-state writes broadcast;
/// plain reads go to a replica; a read-only transaction stays on replicas;
/// everything else goes to the primary. Hints are applied last, in order.
pub fn resolve(input: &RouteInput) -> RouteTarget {
    let qtype = input.qtype;
    let use_all_variables = input.use_sql_variables_in == UseSqlVariablesIn::All;

    let mut target = RouteTarget::UNDEFINED;

    if input.target_node_is_master {
        target = RouteTarget::MASTER;
    } else if !input.load_active
        && (qtype.is(QueryType::SESSION_WRITE)
            || (use_all_variables && qtype.is(QueryType::USERVAR_WRITE))
            || qtype.is(QueryType::GSYSVAR_WRITE)
            || qtype.is(QueryType::ENABLE_AUTOCOMMIT)
            || qtype.is(QueryType::DISABLE_AUTOCOMMIT))
    {
        if qtype.is(QueryType::READ) && !qtype.is_prepare() {
            // A result-producing statement cannot be broadcast: only one
            // reply may reach the client.
            warn!(
                "Statement mixes a SELECT with session variable modifications and \
                 cannot run on all servers; routing to the primary. Set \
                 use_sql_variables_in=master or split the statement in two."
            );
            target = RouteTarget::MASTER;
        } else {
            target = RouteTarget::ALL;
        }
    } else if !input.trx_active
        && !input.load_active
        && !qtype.is(QueryType::MASTER_READ)
        && !qtype.is(QueryType::WRITE)
        && !qtype.is_prepare()
        && (qtype.is(QueryType::READ)
            || qtype.is(QueryType::SHOW_TABLES)
            || qtype.is(QueryType::USERVAR_READ)
            || qtype.is(QueryType::SYSVAR_READ)
            || qtype.is(QueryType::GSYSVAR_READ))
    {
        if qtype.is(QueryType::USERVAR_READ) {
            if use_all_variables {
                target = RouteTarget::SLAVE;
            }
        } else {
            target = RouteTarget::SLAVE;
        }

        // user variable reads under use_sql_variables_in=master land here
        if !target.has_role() {
            target = RouteTarget::MASTER;
        }
    } else if input.trx_read_only {
        target = RouteTarget::SLAVE;
    } else {
        target = RouteTarget::MASTER;
    }

    for hint in input.hints {
        match hint {
            Hint::RouteToMaster => {
                target = RouteTarget::MASTER;
                break;
            }
            Hint::RouteToSlave => {
                target = RouteTarget::SLAVE;
            }
            Hint::RouteToNamedServer(_) => {
                target.insert(RouteTarget::NAMED_SERVER);
            }
            Hint::RouteToAll | Hint::RouteToUptodateServer => {
                // recognised, not implemented
            }
            Hint::Parameter { key, value } => {
                if key.eq_ignore_ascii_case(crate::hint::MAX_SLAVE_REPLICATION_LAG) {
                    target.insert(RouteTarget::RLAG_MAX);
                } else {
                    warn!(
                        parameter = %key, value = %value,
                        "Unknown hint parameter, expected max_slave_replication_lag"
                    );
                }
            }
        }
    }

    target
}
