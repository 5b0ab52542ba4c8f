//! Shared primitives for the pipecraft orchestrator.
//!
//! Every other `pipecraft-*` crate depends on this one for error handling
//! and identifiers, so it intentionally carries no I/O or async runtime
//! dependency.
//!
//! # Main types
//!
//! - [`PipecraftError`] — unified error enum for all orchestrator subsystems.
//! - [`PipecraftResult`] — convenience alias for `Result<T, PipecraftError>`.
//! - [`RunId`], [`TaskId`], [`EpicId`], [`WorkerId`] — newtype identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Top-level error type for the pipecraft orchestrator.
///
/// Variants correspond to failure modes rather than subsystems, so the
/// propagation policy (which kinds flip a run to `error`) can match on
/// them directly.
#[derive(Debug, thiserror::Error)]
pub enum PipecraftError {
    /// Malformed argument from the gateway; surfaced synchronously, no state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// Operation rejected because the run/task is not in an admissible state.
    #[error("conflicting state: {0}")]
    ConflictState(String),

    /// Filesystem failure against the task store or conversation log.
    #[error("storage error: {0}")]
    Storage(String),

    /// A worker subprocess terminated abnormally.
    #[error("worker crash: {0}")]
    WorkerCrash(String),

    /// The supervisor's execution context died; pending requests fail and it respawns lazily.
    #[error("supervisor bridge lost: {0}")]
    BridgeLost(String),

    /// Cooperative cancellation, threaded through the same `Result` so call
    /// sites can short-circuit uniformly.
    #[error("operation cancelled")]
    Cancellation,

    /// A bounded wait (spawn budget, heartbeat, bridge round-trip) expired.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// A JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience `Result` alias using [`PipecraftError`].
pub type PipecraftResult<T> = Result<T, PipecraftError>;

macro_rules! uuid_id {
    ($name:ident) => {
        /// A stable, globally-unique identifier.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::from_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }
    };
}

uuid_id!(RunId);
uuid_id!(TaskId);
uuid_id!(EpicId);
uuid_id!(WorkerId);
