use std::time::Duration;

pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Coordination store endpoints, host:port.
    pub endpoints: Vec<String>,
    /// Store session timeout; exceeding it drops ephemeral keys.
    pub session_timeout: Duration,
    /// Server name template; %h expands to the hostname, %p to the pid.
    pub name_template: Option<String>,
    /// Replace an existing registration with the same server name.
    pub force: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            name_template: None,
            force: false,
        }
    }
}
