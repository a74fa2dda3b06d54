//! The four bounded prompt protocols.
//!
//! Each skill is a pure function from a typed context to a typed result:
//! it issues one or more model calls through a channel it is handed, parses
//! the structured payload out of the reply, and never touches engine state.
//! All prompt text and tool schemas live in their owning skill; the engine
//! only dispatches tools by name.
//!
//! Parsing is permissive on framing (code fences, surrounding prose) and
//! strict on content; an output that cannot be parsed fails with a
//! [`SkillError`] carrying the raw model text.

pub mod coordinator;
pub mod formulation;
pub mod offer;
pub mod parse;
pub mod sub_negotiation;

pub use coordinator::{
    CoordinatorContext, CoordinatorDecision, CoordinatorSkill, DefaultCoordinatorSkill, ToolSet,
};
pub use formulation::{DefaultFormulationSkill, FormulationContext, FormulationSkill};
pub use offer::{DefaultOfferSkill, OfferContext, OfferOutcome, OfferSkill};
pub use sub_negotiation::{
    DefaultSubNegotiationSkill, DiscoveryFinding, SubNegotiationContext, SubNegotiationSkill,
};

use std::error::Error;
use std::fmt;

/// Errors surfaced by skill implementations.
#[derive(Debug)]
pub enum SkillError {
    /// The underlying model call failed before any output was produced.
    Channel(String),
    /// No parseable payload was found in the model output. Carries the raw
    /// text for diagnosis.
    Unparseable { raw: String, detail: String },
    /// A payload parsed but violated the skill's contract (missing or
    /// invalid required field). Carries the raw text.
    Contract { field: &'static str, raw: String },
}

impl SkillError {
    /// Wrap a channel-level failure.
    pub fn channel(err: impl fmt::Display) -> Self {
        SkillError::Channel(err.to_string())
    }
}

impl fmt::Display for SkillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkillError::Channel(msg) => write!(f, "model call failed: {}", msg),
            SkillError::Unparseable { detail, .. } => {
                write!(f, "unparseable model output: {}", detail)
            }
            SkillError::Contract { field, .. } => {
                write!(f, "model output missing required field: {}", field)
            }
        }
    }
}

impl Error for SkillError {}
