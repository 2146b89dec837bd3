//! Connection lifecycle of the client, kept free of I/O.
//!
//! The driver in [`crate::client`] feeds transport outcomes into
//! [`ConnectionState`] and acts on the returned [`Next`] step.

use std::{fmt, time::Duration};

use crate::config::ReconnectPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected { reason: String },
    Error { reason: String },
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Disconnected { reason } | Self::Error { reason } => Some(reason),
            Self::Connecting | Self::Connected => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Disconnected { reason } => write!(f, "disconnected ({reason})"),
            Self::Error { reason } => write!(f, "error ({reason})"),
        }
    }
}

/// What the driver should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Retry(Duration),
    Stop,
}

#[derive(Debug)]
pub struct ConnectionState {
    policy: ReconnectPolicy,
    status: ConnectionStatus,
    failed_attempts: u32,
}

impl ConnectionState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            status: ConnectionStatus::Connecting,
            failed_attempts: 0,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn begin_attempt(&mut self) {
        self.status = ConnectionStatus::Connecting;
    }

    pub fn connected(&mut self) {
        self.failed_attempts = 0;
        self.status = ConnectionStatus::Connected;
    }

    pub fn attempt_failed(&mut self, cause: &str) -> Next {
        self.failed_attempts = self.failed_attempts.saturating_add(1);

        if !self.policy.enabled || self.failed_attempts >= self.policy.max_attempts.max(1) {
            self.status = ConnectionStatus::Error {
                reason: format!("gave up after {} attempts: {cause}", self.failed_attempts),
            };
            return Next::Stop;
        }

        self.status = ConnectionStatus::Error {
            reason: cause.to_string(),
        };
        Next::Retry(self.policy.delay_for(self.failed_attempts))
    }

    /// An established connection went away without the client asking for it.
    pub fn connection_lost(&mut self, reason: &str) -> Next {
        self.failed_attempts = 0;
        self.status = ConnectionStatus::Disconnected {
            reason: reason.to_string(),
        };

        if self.policy.enabled {
            Next::Retry(self.policy.delay_for(1))
        } else {
            Next::Stop
        }
    }

    pub fn closed_by_client(&mut self) {
        self.status = ConnectionStatus::Disconnected {
            reason: "client shut down".to_string(),
        };
    }
}
