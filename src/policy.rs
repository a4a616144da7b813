//! Configuration options which are fixed for the lifetime of a pool.

use crate::native::{AckMode, SessionMode};

use tokio::time::Duration;

/// Policy which is applicable to a pool.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Policy {
    /// The number of native connections the pool may open.
    pub max_connections: usize,

    /// The number of sessions which may be opened on each connection.
    pub max_sessions_per_connection: usize,

    /// The number of producers each session keeps open, by destination.
    pub max_cached_producers_per_session: usize,

    /// Whether sessions are transacted.
    ///
    /// Together with [Self::ack_mode], this is the only session mode the
    /// pool will hand out.
    pub transacted: bool,

    /// The acknowledgement mode of every session.
    pub ack_mode: AckMode,

    /// How long a session may go unborrowed before it is closed.
    pub max_idle_session_time: Duration,

    /// How often sessions are checked for idleness.
    ///
    /// Defaults to [Self::max_idle_session_time] when unset.
    pub idle_check_period: Option<Duration>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_connections: 2,
            max_sessions_per_connection: 100,
            max_cached_producers_per_session: 1000,
            transacted: false,
            ack_mode: AckMode::Auto,
            max_idle_session_time: Duration::from_secs(5 * 60),
            idle_check_period: None,
        }
    }
}

impl Policy {
    /// The session mode every borrowed session must be created with.
    pub fn session_mode(&self) -> SessionMode {
        SessionMode {
            transacted: self.transacted,
            ack_mode: self.ack_mode,
        }
    }

    pub fn idle_check_period(&self) -> Duration {
        self.idle_check_period.unwrap_or(self.max_idle_session_time)
    }

    /// Checks that the policy describes a usable pool.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        if self.max_sessions_per_connection == 0 {
            return Err("max_sessions_per_connection must be at least 1".to_string());
        }
        if self.max_cached_producers_per_session == 0 {
            return Err("max_cached_producers_per_session must be at least 1".to_string());
        }
        if self.max_idle_session_time.is_zero() {
            return Err("max_idle_session_time must be non-zero".to_string());
        }
        if self.idle_check_period().is_zero() {
            return Err("idle_check_period must be non-zero".to_string());
        }
        Ok(())
    }
}
