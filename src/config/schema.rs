use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(rename = "backend", default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_port() -> u16 {
    4006
}

/// One configured database server
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Unique server name used by routing hints
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
}

impl BackendConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How replicas are ranked when more than one qualifies for a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionCriterion {
    /// Fewest open connections across all sessions
    LeastGlobalConnections,
    /// Smallest replication lag behind the primary
    LeastBehindMaster,
    /// Fewest statements currently executing
    LeastCurrentOperations,
    /// Fewest statements routed over the server's lifetime
    LeastRoutedOperations,
    /// Smallest observed average response time
    AdaptiveRouting,
}

impl Default for SelectionCriterion {
    fn default() -> Self {
        SelectionCriterion::LeastCurrentOperations
    }
}

/// Where statements touching SQL variables may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseSqlVariablesIn {
    /// Variable reads go to the primary only
    Master,
    /// Variable writes are broadcast and variable reads may use replicas
    All,
}

impl Default for UseSqlVariablesIn {
    fn default() -> Self {
        UseSqlVariablesIn::All
    }
}

/// What happens to the session when no primary is selectable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterFailureMode {
    /// Terminate the session as soon as the primary is lost
    FailInstantly,
    /// Keep serving reads; terminate when a write arrives
    FailOnWrite,
    /// Never terminate; answer writes with a read-only error
    ErrorOnWrite,
}

impl Default for MasterFailureMode {
    fn default() -> Self {
        MasterFailureMode::FailInstantly
    }
}

/// Read/write split routing configuration.
///
/// Read once at session open and snapshotted; a running session never sees
/// configuration changes.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub slave_selection_criteria: SelectionCriterion,
    #[serde(default)]
    pub use_sql_variables_in: UseSqlVariablesIn,
    #[serde(default)]
    pub master_failure_mode: MasterFailureMode,
    /// Session command history cap; 0 disables the bound
    #[serde(default = "default_max_sescmd_history")]
    pub max_sescmd_history: u64,
    #[serde(default)]
    pub disable_sescmd_history: bool,
    #[serde(default = "default_retry_failed_reads")]
    pub retry_failed_reads: bool,
    #[serde(default)]
    pub master_accept_reads: bool,
    #[serde(default)]
    pub strict_multi_stmt: bool,
    /// Idle seconds before a backend gets an ignorable ping; 0 disables
    #[serde(default)]
    pub connection_keepalive: u64,
    /// Replication lag ceiling for read routing in seconds; 0 means unbounded
    #[serde(default)]
    pub max_slave_replication_lag: i32,
}

fn default_max_sescmd_history() -> u64 {
    50
}

fn default_retry_failed_reads() -> bool {
    true
}

impl RouterConfig {
    /// The configured lag bound, if one is set
    pub fn max_replication_lag(&self) -> Option<i32> {
        (self.max_slave_replication_lag > 0).then_some(self.max_slave_replication_lag)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            slave_selection_criteria: SelectionCriterion::default(),
            use_sql_variables_in: UseSqlVariablesIn::default(),
            master_failure_mode: MasterFailureMode::default(),
            max_sescmd_history: default_max_sescmd_history(),
            disable_sescmd_history: false,
            retry_failed_reads: default_retry_failed_reads(),
            master_accept_reads: false,
            strict_multi_stmt: false,
            connection_keepalive: 0,
            max_slave_replication_lag: 0,
        }
    }
}

/// Server monitor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_monitor_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_monitor_enabled() -> bool {
    true
}

fn default_monitor_interval_ms() -> u64 {
    2500
}

fn default_monitor_timeout_ms() -> u64 {
    2000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            interval_ms: default_monitor_interval_ms(),
            timeout_ms: default_monitor_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: default_listen_port(),
            },
            router: RouterConfig::default(),
            monitor: MonitorConfig::default(),
            backends: Vec::new(),
        }
    }
}
