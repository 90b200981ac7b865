//! Error types for the sync engine.

use conflux_protocol::MemberId;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during a sync cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// A member failed to connect.
    #[error("{member} failed to connect: {message}")]
    Connect {
        /// The failing member.
        member: MemberId,
        /// Error message.
        message: String,
    },

    /// A member failed while reporting changes or delivering content.
    #[error("{member} read failed: {message}")]
    Read {
        /// The failing member.
        member: MemberId,
        /// Error message.
        message: String,
    },

    /// A member failed to commit a change.
    #[error("{member} write failed: {message}")]
    Write {
        /// The failing member.
        member: MemberId,
        /// Error message.
        message: String,
    },

    /// A member failed to acknowledge sync completion.
    #[error("{member} sync-done failed: {message}")]
    SyncDone {
        /// The failing member.
        member: MemberId,
        /// Error message.
        message: String,
    },

    /// A member failed to disconnect.
    #[error("{member} failed to disconnect: {message}")]
    Disconnect {
        /// The failing member.
        member: MemberId,
        /// Error message.
        message: String,
    },

    /// A method call timed out without a reply.
    #[error("method call to {member} timed out")]
    Timeout {
        /// The unresponsive member.
        member: MemberId,
    },

    /// The engine was configured in an unusable way.
    #[error("engine misconfigured: {0}")]
    Misconfiguration(String),

    /// Any other failure.
    #[error("{0}")]
    Generic(String),
}

impl EngineError {
    /// Creates a connect error.
    pub fn connect(member: MemberId, message: impl Into<String>) -> Self {
        Self::Connect {
            member,
            message: message.into(),
        }
    }

    /// Creates a read error.
    pub fn read(member: MemberId, message: impl Into<String>) -> Self {
        Self::Read {
            member,
            message: message.into(),
        }
    }

    /// Creates a write error.
    pub fn write(member: MemberId, message: impl Into<String>) -> Self {
        Self::Write {
            member,
            message: message.into(),
        }
    }

    /// Creates a sync-done error.
    pub fn sync_done(member: MemberId, message: impl Into<String>) -> Self {
        Self::SyncDone {
            member,
            message: message.into(),
        }
    }

    /// Creates a disconnect error.
    pub fn disconnect(member: MemberId, message: impl Into<String>) -> Self {
        Self::Disconnect {
            member,
            message: message.into(),
        }
    }

    /// Creates a generic error.
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic(message.into())
    }

    /// Returns the member this error is attributed to, if any.
    pub fn member(&self) -> Option<MemberId> {
        match self {
            EngineError::Connect { member, .. }
            | EngineError::Read { member, .. }
            | EngineError::Write { member, .. }
            | EngineError::SyncDone { member, .. }
            | EngineError::Disconnect { member, .. }
            | EngineError::Timeout { member } => Some(*member),
            _ => None,
        }
    }

    /// Returns true if this error came from the connect or read phase.
    ///
    /// Under [`ErrorPolicy::StopAll`](crate::ErrorPolicy::StopAll) these
    /// escalate to a full engine stop.
    pub fn is_phase_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Connect { .. } | EngineError::Read { .. } | EngineError::Timeout { .. }
        )
    }
}
