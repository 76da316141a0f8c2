//! Client configuration.

use std::time::Duration;

/// Tunables for the room client and its call machine.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// STUN servers handed to the negotiation engine at session start.
    pub stun_servers: Vec<String>,
    /// How long a call error notice stays visible before the clearing
    /// event is published.
    pub error_display: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            error_display: Duration::from_secs(5),
        }
    }
}
