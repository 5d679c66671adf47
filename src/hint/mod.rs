//! Routing hint types.
//!
//! Hints are attached to a request buffer by the hint parser sitting in front
//! of the router. The router only interprets them; it never produces them.

mod parser;

pub use parser::parse_hints;

/// A single routing hint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    /// Force the statement to the primary
    RouteToMaster,
    /// Force the statement to a replica
    RouteToSlave,
    /// Prefer the named server; fall back to a replica when absent
    RouteToNamedServer(String),
    /// Recognised but not acted upon
    RouteToAll,
    /// Recognised but not acted upon
    RouteToUptodateServer,
    /// Key=value parameter; only `max_slave_replication_lag` is understood
    Parameter { key: String, value: String },
}

/// Parameter key the router understands
pub const MAX_SLAVE_REPLICATION_LAG: &str = "max_slave_replication_lag";

impl Hint {
    /// The named server this hint points at, if any
    pub fn named_server(&self) -> Option<&str> {
        match self {
            Hint::RouteToNamedServer(name) => Some(name),
            _ => None,
        }
    }

    /// The replication lag bound this hint carries, if any
    pub fn max_replication_lag(&self) -> Option<i32> {
        match self {
            Hint::Parameter { key, value } if key.eq_ignore_ascii_case(MAX_SLAVE_REPLICATION_LAG) => {
                value.parse().ok()
            }
            _ => None,
        }
    }
}
