use thiserror::Error;

/// Errors surfaced by the engine's submission-path operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// An allocation on the submission path failed. Any partially built
    /// frame was torn down before the error surfaced; no fence is left
    /// registered without the storage it needs.
    #[error("out of memory while allocating {what}")]
    OutOfMemory { what: &'static str },

    /// The caller's cancel token fired during lock acquisition. No locks
    /// are held and no frames were registered.
    #[error("lock acquisition interrupted by caller cancellation")]
    Interrupted,

    /// A required collaborator handle was absent or malformed.
    #[error("invalid parameters: {reason}")]
    InvalidParameters { reason: &'static str },
}
