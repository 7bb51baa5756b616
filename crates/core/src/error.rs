//! Error taxonomy shared by every nodeclaim crate.

/// Errors surfaced by the claim cache and the prepare/unprepare protocol.
#[derive(Debug, thiserror::Error)]
pub enum DraError {
    /// The pod may not use the claim, or a claim reference cannot be resolved.
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: claim {0} is already cached")]
    AlreadyExists(String),
    /// Another orchestration call is releasing the claim right now.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Control-plane lookup failed for a reason other than "not found".
    #[error("control_plane: {0}")]
    ControlPlane(String),
    /// Plugin unreachable, RPC failed as a whole, or the deadline passed.
    #[error("transport: plugin {plugin}: {message}")]
    Transport { plugin: String, message: String },
    /// Plugin answered but reported an error for one claim.
    #[error("claim_failed: plugin {plugin} failed claim {claim}: {message}")]
    ClaimFailed { plugin: String, claim: String, message: String },
    /// Plugin answered for fewer (or other) claims than it was asked about.
    #[error("incomplete_response: plugin {plugin}: {message}")]
    IncompleteResponse { plugin: String, message: String },
    #[error("checkpoint_write_failed: {0}")]
    CheckpointWriteFailed(String),
    #[error("checkpoint_incompatible: {0}")]
    CheckpointIncompatible(String),
    #[error("checkpoint_corrupt: {0}")]
    CheckpointCorrupt(String),
    /// A transaction panicked while holding the cache lock.
    #[error("lock_poisoned: {0}")]
    LockPoisoned(String),
}

impl DraError {
    pub fn transport(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport { plugin: plugin.into(), message: message.into() }
    }

    pub fn incomplete(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IncompleteResponse { plugin: plugin.into(), message: message.into() }
    }

    /// Whether calling prepare/unprepare again later can succeed without outside changes.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_)
                | Self::ControlPlane(_)
                | Self::Transport { .. }
                | Self::ClaimFailed { .. }
                | Self::IncompleteResponse { .. }
                | Self::CheckpointWriteFailed(_)
        )
    }
}

pub type DraResult<T> = Result<T, DraError>;
