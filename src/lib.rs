// src/lib.rs

// Import the top-level `parley` module.
pub mod parley;

// Re-export the component modules at the crate root so callers write
// parley::engine::..., parley::skills::..., etc. without navigating the
// internal hierarchy.
pub use parley::{central, channel, config, encoder, engine, event, resonance, session, skills, trace};

// Re-exporting key items for easier external access.
pub use parley::central::{CentralChannel, CentralTurn, ChatMessage, ChatRole, TokenUsage};
pub use parley::channel::{AgentChannel, AgentProfile, DefaultChannel, ExternalChannel, ProfileRegistry};
pub use parley::config::EngineConfig;
pub use parley::encoder::{Encoder, HashingEncoder};
pub use parley::engine::{EngineBuilder, EngineError, NegotiationEngine, NegotiationRun, SessionOutcome};
pub use parley::event::{Event, EventBus, EventType};
pub use parley::session::{NegotiationPlan, NegotiationSession, SessionState};
pub use parley::trace::{TraceChain, TraceKind};
