//! Session data model: the unit of work and everything it accumulates.
//!
//! A [`NegotiationSession`] is exclusively owned and mutated by the engine
//! task driving it; observers receive read-only snapshots. State changes go
//! through [`NegotiationSession::transition_to`], which enforces the
//! lifecycle DAG:
//!
//! ```text
//! CREATED → FORMULATING → FORMULATED → ENCODING → OFFERING
//!         → BARRIER_WAITING → SYNTHESISING → COMPLETED
//!                (any non-terminal state → COMPLETED)
//! ```

use crate::parley::central::{TokenUsage, ToolInvocation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a negotiation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Session accepted, nothing run yet.
    Created,
    /// Formulation skill in flight.
    Formulating,
    /// Structured demand available.
    Formulated,
    /// Encoding demand/profile views and running the matcher.
    Encoding,
    /// Per-participant offer tasks in flight.
    Offering,
    /// All offer tasks settled; barrier released.
    BarrierWaiting,
    /// Coordinator loop running.
    Synthesising,
    /// Terminal. Reached by success, error, cancellation, or deadline.
    Completed,
}

impl SessionState {
    /// Whether this is the terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed)
    }

    /// Whether the lifecycle DAG permits moving from `self` to `next`.
    /// Completion is reachable from any non-terminal state; there are no
    /// back-edges.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Completed {
            return true;
        }
        matches!(
            (self, next),
            (Created, Formulating)
                | (Formulating, Formulated)
                | (Formulated, Encoding)
                | (Encoding, Offering)
                | (Offering, BarrierWaiting)
                | (BarrierWaiting, Synthesising)
        )
    }
}

/// Structured demand produced by the formulation skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulatedDemand {
    /// One-sentence statement of what the requester wants.
    pub intent: String,
    /// Hard constraints the plan must satisfy.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Soft preferences worth honouring when possible.
    #[serde(default)]
    pub preferences: Vec<String>,
    /// Free-form context bag carried along for downstream prompts.
    #[serde(default)]
    pub context: serde_json::Value,
    /// Optional enrichments the formulation model volunteered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichments: Option<Vec<String>>,
}

/// Per-agent lifecycle within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantState {
    /// Selected; offer not yet settled.
    Pending,
    /// An offer (possibly a decline) was received in time.
    Offered,
    /// The offer task exceeded its per-agent deadline.
    TimedOut,
    /// The agent's channel failed or refused; the agent is out.
    Exited,
}

/// An agent selected for a specific session.
///
/// Created on selection, mutated only by the engine, frozen on session
/// termination. `agent_id` is the identity; `display_name` is presentation
/// only and never participates in comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentParticipant {
    /// Stable protocol id.
    pub agent_id: String,
    /// Opaque presentation string.
    pub display_name: String,
    /// Resonance score that got this agent selected.
    pub score: f32,
    /// Per-agent offer state.
    pub state: ParticipantState,
    /// Confidence reported with the offer, once one arrives.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// An agent's structured response to the formulated demand. Immutable once
/// received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    /// The offering agent's protocol id.
    pub agent_id: String,
    /// Free-form offer text.
    pub text: String,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,
    /// Whether the agent declined rather than offered.
    pub declined: bool,
    /// Capabilities the agent claims to bring to this demand.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Constraints the agent attaches to its participation.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// When the offer settled.
    pub received_at: DateTime<Utc>,
}

/// The outcome of dispatching one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Name of the tool that was dispatched.
    pub tool_name: String,
    /// Short human-readable result summary (also used in event payloads).
    pub summary: String,
    /// Full structured result handed back to the coordinator.
    pub payload: serde_json::Value,
    /// Whether this outcome represents a tool-error.
    pub is_error: bool,
}

/// One observable turn of the coordinator loop. Append-only, ordered by
/// round index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorTurn {
    /// 1-based round index, strictly increasing.
    pub round: usize,
    /// The coordinator's reasoning text for this round.
    pub reasoning: String,
    /// Tool invocations in the order the coordinator issued them.
    pub invocations: Vec<ToolInvocation>,
    /// Tool results in dispatch order (one per dispatched invocation).
    pub results: Vec<ToolOutcome>,
}

/// One concrete assignment in the final plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAssignment {
    /// Protocol id of the assigned agent.
    pub agent_id: String,
    /// What the agent is assigned to do.
    pub role: String,
    /// Why this agent, in one or two sentences.
    #[serde(default)]
    pub rationale: String,
}

/// Machine-readable final plan emitted by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationPlan {
    /// Narrative summary of the plan.
    pub summary: String,
    /// Agent-to-role assignments.
    #[serde(default)]
    pub assignments: Vec<PlanAssignment>,
    /// Concrete next steps, in order.
    #[serde(default)]
    pub next_steps: Vec<String>,
    /// Questions the negotiation could not close.
    #[serde(default)]
    pub open_questions: Vec<String>,
}

/// Why a session reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDisposition {
    /// A plan was emitted.
    Completed,
    /// An unrecoverable error terminated the session. Carries the cause.
    Error(String),
    /// External cancellation terminated the session.
    Cancelled,
}

/// Summary metrics for a finalised session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeSummary {
    /// How the session ended.
    pub disposition: SessionDisposition,
    /// Coordinator rounds executed (the forced closing call excluded).
    pub coordinator_rounds: usize,
    /// Participants whose offers arrived in time.
    pub offered: usize,
    /// Participants that exceeded the per-offer deadline.
    pub timed_out: usize,
    /// Participants whose channels failed or refused.
    pub exited: usize,
    /// Best-effort token accounting across every model call in the session.
    pub total_input_tokens: usize,
    /// See `total_input_tokens`.
    pub total_output_tokens: usize,
    /// Wall-clock duration from submit to terminal event, in milliseconds.
    pub duration_ms: u64,
}

/// The unit of work: one negotiation from raw demand to terminal event.
#[derive(Debug, Clone)]
pub struct NegotiationSession {
    /// Unique session id (also the event-stream key).
    pub id: String,
    /// Identity of the requester that submitted the demand.
    pub requester_id: String,
    /// The demand exactly as submitted.
    pub raw_demand: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Structured demand, once formulation succeeds.
    pub formulated: Option<FormulatedDemand>,
    /// Selected participants in rank order.
    pub participants: Vec<AgentParticipant>,
    /// Offers in arrival order.
    pub offers: Vec<Offer>,
    /// Coordinator turns in round order.
    pub turns: Vec<CoordinatorTurn>,
    /// The final plan, when one was produced.
    pub plan: Option<NegotiationPlan>,
    /// Monotonic creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent mutation.
    pub updated_at: DateTime<Utc>,
    /// Set when an external cancel has been observed.
    pub cancelled: bool,
    /// Total `recurse_on_gap` depth consumed so far.
    pub recursion_depth: usize,
    /// Accumulated token usage across all model calls.
    pub usage: TokenUsage,
}

impl NegotiationSession {
    /// Create a fresh session in [`SessionState::Created`] with a random id.
    pub fn new(requester_id: impl Into<String>, raw_demand: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            requester_id: requester_id.into(),
            raw_demand: raw_demand.into(),
            state: SessionState::Created,
            formulated: None,
            participants: Vec::new(),
            offers: Vec::new(),
            turns: Vec::new(),
            plan: None,
            created_at: now,
            updated_at: now,
            cancelled: false,
            recursion_depth: 0,
            usage: TokenUsage::default(),
        }
    }

    /// Move to `next`, enforcing the lifecycle DAG. Returns `false` and
    /// leaves the session untouched when the edge does not exist.
    pub fn transition_to(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.touch();
        true
    }

    /// Record a mutation timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Find a selected participant by protocol id.
    pub fn participant(&self, agent_id: &str) -> Option<&AgentParticipant> {
        self.participants.iter().find(|p| p.agent_id == agent_id)
    }

    /// Mutable access to a selected participant by protocol id.
    pub fn participant_mut(&mut self, agent_id: &str) -> Option<&mut AgentParticipant> {
        self.participants.iter_mut().find(|p| p.agent_id == agent_id)
    }

    /// Count participants by terminal per-agent state:
    /// `(offered, timed_out, exited)`.
    pub fn barrier_counts(&self) -> (usize, usize, usize) {
        let mut offered = 0;
        let mut timed_out = 0;
        let mut exited = 0;
        for p in &self.participants {
            match p.state {
                ParticipantState::Offered => offered += 1,
                ParticipantState::TimedOut => timed_out += 1,
                ParticipantState::Exited => exited += 1,
                ParticipantState::Pending => {}
            }
        }
        (offered, timed_out, exited)
    }
}
