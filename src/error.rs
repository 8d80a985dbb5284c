//! Error taxonomy for the agent core.
//!
//! Generation and execution failures are retried inside the regeneration
//! loop; retry exhaustion and cycle aborts surface in the cycle record.
//! Only a missing required credential is fatal, and only at startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentinelError {
    /// The model returned unusable or empty code.
    #[error("generation failure: {0}")]
    GenerationFailure(String),

    /// Sandboxed code raised or timed out.
    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    /// The retrieval collaborator was unreachable. Soft: context degrades
    /// to an empty passage list.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// A stage used up its regeneration budget. Terminal for the stage,
    /// recorded in the cycle record.
    #[error("retry budget exhausted after {attempts} attempts")]
    RetryBudgetExhausted { attempts: u32 },

    /// The cycle was stopped mid-stage under the abort policy.
    #[error("cycle aborted during {stage} stage")]
    CycleAborted { stage: String },

    /// A required tool credential is not configured. Reported at startup;
    /// a cycle is never started with this outstanding.
    #[error("missing required credential '{var}' for tool '{tool}'")]
    MissingCredential { tool: String, var: String },
}
