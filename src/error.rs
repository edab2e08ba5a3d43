//! Crate-wide error type.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SimError>;

/// A diagnostic dump attached to a protocol violation: everything an
/// engineer needs to reconstruct why the invariant broke, without having to
/// re-run the trace under a debugger.
#[derive(Debug, Clone, Default)]
pub struct ProtocolDiagnostic {
    /// Human-readable description of the offending line.
    pub address: u64,
    /// Per-tile cache line state for `address`, as `"tile {id}: {state:?}"`.
    pub cache_snapshot: Vec<String>,
    /// Home directory entry state for `address`.
    pub directory_snapshot: Option<String>,
}

impl std::fmt::Display for ProtocolDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "address = 0x{:016x}", self.address)?;
        for line in &self.cache_snapshot {
            writeln!(f, "  {line}")?;
        }
        if let Some(dir) = &self.directory_snapshot {
            writeln!(f, "  directory: {dir}")?;
        }
        Ok(())
    }
}

/// Errors surfaced by the simulator core.
#[derive(Error, Debug)]
pub enum SimError {
    /// A configuration value failed validation before the chip was built.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A coherence invariant was violated at runtime. Carries enough state
    /// to diagnose the offending transaction after the fact.
    #[error("protocol violation at 0x{address:016x}: {reason}\n{diagnostic}", address = diagnostic.address)]
    ProtocolViolation {
        /// What invariant was violated, in plain language.
        reason: String,
        /// Captured state at the moment of violation.
        diagnostic: ProtocolDiagnostic,
    },

    /// The interconnect could not deliver or decode a message.
    #[error("transport error: {0}")]
    Transport(String),
}

impl SimError {
    /// Build a [`SimError::ProtocolViolation`] from a reason and the address
    /// involved; the diagnostic snapshot is filled in by the caller.
    pub fn protocol_violation(reason: impl Into<String>, diagnostic: ProtocolDiagnostic) -> Self {
        SimError::ProtocolViolation {
            reason: reason.into(),
            diagnostic,
        }
    }
}
