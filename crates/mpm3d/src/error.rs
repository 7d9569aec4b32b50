//! Error types for the simulation core.
//!
//! Fallible operations return [`SimResult`]. Only failures that must abort a
//! step before any particle state is written become errors; per-particle
//! numeric trouble and solver stalls are logged and survived instead.

use thiserror::Error;

/// Fatal step-level errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// A particle position is non-finite, so the step's background grid
    /// cannot be sized around it. The caller must remove or fix the particle.
    #[error("particle {particle} has a non-finite position; cannot size the grid")]
    GridOutOfBounds {
        /// Index of the offending particle.
        particle: usize,
    },

    /// No live particles to build a grid from.
    #[error("cannot build a grid around an empty particle set")]
    EmptyParticleSet,
}

/// Convenience alias for `Result<T, SimError>`.
pub type SimResult<T> = Result<T, SimError>;
