//! Configuration for the negotiation engine.
//!
//! Provides the [`EngineConfig`] struct holding every tunable the engine
//! recognises. Users construct it manually; no file parsing dependencies
//! are required.
//!
//! # Example
//!
//! ```rust
//! use parley::EngineConfig;
//!
//! // Use the defaults
//! let config = EngineConfig::default();
//! assert_eq!(config.max_coordinator_rounds, 2);
//!
//! // Or override selectively
//! let config = EngineConfig {
//!     selection_top_k: 3,
//!     ..EngineConfig::default()
//! };
//! assert_eq!(config.selection_top_k, 3);
//! ```

/// Resource ceilings and selection parameters for a [`NegotiationEngine`](crate::NegotiationEngine).
///
/// This struct is intentionally minimal and users construct it however they
/// want. No TOML, YAML, or other config-file parsing dependencies are
/// introduced. These are the only knobs the engine reads.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on coordinator deliberation rounds per session. When the
    /// budget is exhausted without a plan, the engine forces one final
    /// `output_plan`-only call.
    pub max_coordinator_rounds: usize,

    /// Per-participant deadline for a single offer solicitation, in
    /// milliseconds. A participant that exceeds it is marked timed-out and
    /// is not retried. Also bounds each `ask_agent` exchange.
    pub per_offer_timeout_ms: u64,

    /// Wall-clock ceiling for a whole session, in milliseconds. A session
    /// still in a transient state when the ceiling elapses is
    /// force-terminated with an error event.
    pub session_wall_clock_ms: u64,

    /// Maximum number of participants selected by the resonance matcher.
    pub selection_top_k: usize,

    /// Minimum resonance score a candidate must reach to be selected.
    /// Candidates strictly below the threshold are excluded.
    pub selection_threshold: f32,

    /// Maximum total depth of `recurse_on_gap` nesting per session.
    pub recursion_max_depth: usize,

    /// Dimension of the vectors produced by the configured
    /// [`Encoder`](crate::Encoder).
    pub embedding_dimension: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_coordinator_rounds: 2,
            per_offer_timeout_ms: 30_000,
            session_wall_clock_ms: 300_000,
            selection_top_k: 5,
            selection_threshold: 0.15,
            recursion_max_depth: 1,
            embedding_dimension: 256,
        }
    }
}
