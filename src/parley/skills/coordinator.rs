//! The central coordinator protocol.
//!
//! The coordinator consumes the formulated demand, the offers, and its own
//! prior turns, and either invokes tools or emits the final plan. Its tool
//! set is closed and round-dependent:
//!
//! | Round | Tool set |
//! |-------|----------|
//! | 1 | `ask_agent`, `start_discovery`, `recurse_on_gap`, `request_user_clarification`, `output_plan` |
//! | 2.. | `ask_agent`, `request_user_clarification`, `output_plan` |
//! | forced close | `output_plan` |
//!
//! # Observation masking
//!
//! After round 1 the coordinator no longer sees raw offer text. Its input
//! carries only a redacted per-agent summary (identity, declined flag,
//! confidence, declared capabilities and constraints) plus its own prior
//! reasoning and tool results. Information beyond that must be acquired
//! deliberately, through tools. The masking is built here, in the skill's
//! own prompt construction; the engine never synthesises coordinator
//! prompts, so it cannot route around it.

use crate::parley::central::{
    ChatMessage, SharedCentralChannel, TokenUsage, ToolDefinition, ToolInvocation,
};
use crate::parley::session::{
    AgentParticipant, CoordinatorTurn, FormulatedDemand, NegotiationPlan, Offer,
};
use crate::parley::skills::{parse, SkillError};
use async_trait::async_trait;

/// Tool name: one extra exchange with a named participant.
pub const TOOL_ASK_AGENT: &str = "ask_agent";
/// Tool name: scoped sub-negotiation over a participant subset.
pub const TOOL_START_DISCOVERY: &str = "start_discovery";
/// Tool name: schedule a nested mini-formulation on an information gap.
pub const TOOL_RECURSE_ON_GAP: &str = "recurse_on_gap";
/// Tool name: raise a question to the requester (answer deferred).
pub const TOOL_REQUEST_USER_CLARIFICATION: &str = "request_user_clarification";
/// Tool name: emit the terminal structured plan.
pub const TOOL_OUTPUT_PLAN: &str = "output_plan";

/// Which tools the coordinator may use this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSet {
    /// Round 1: every tool.
    Full,
    /// Rounds 2..: questioning or final output only.
    Restricted,
    /// The forced closing call: `output_plan` only.
    FinalOnly,
}

impl ToolSet {
    /// Tool names active under this set.
    pub fn tool_names(self) -> &'static [&'static str] {
        match self {
            ToolSet::Full => &[
                TOOL_ASK_AGENT,
                TOOL_START_DISCOVERY,
                TOOL_RECURSE_ON_GAP,
                TOOL_REQUEST_USER_CLARIFICATION,
                TOOL_OUTPUT_PLAN,
            ],
            ToolSet::Restricted => &[
                TOOL_ASK_AGENT,
                TOOL_REQUEST_USER_CLARIFICATION,
                TOOL_OUTPUT_PLAN,
            ],
            ToolSet::FinalOnly => &[TOOL_OUTPUT_PLAN],
        }
    }

    /// Whether `name` is invocable under this set.
    pub fn allows(self, name: &str) -> bool {
        self.tool_names().contains(&name)
    }
}

/// Input to one coordinator round.
pub struct CoordinatorContext<'a> {
    /// The formulated demand.
    pub demand: &'a FormulatedDemand,
    /// Selected participants with their current per-agent state.
    pub participants: &'a [AgentParticipant],
    /// Offers in arrival order.
    pub offers: &'a [Offer],
    /// Prior coordinator turns (reasoning plus tool results), round order.
    pub history: &'a [CoordinatorTurn],
    /// 1-based round index.
    pub round: usize,
    /// Tools active this round.
    pub tool_set: ToolSet,
}

/// What the coordinator decided this round.
#[derive(Debug, Clone)]
pub enum CoordinatorDecision {
    /// Keep negotiating: the engine should dispatch these invocations and
    /// run another round.
    Continue {
        /// The coordinator's reasoning text.
        reasoning: String,
        /// Tool invocations in issue order.
        invocations: Vec<ToolInvocation>,
    },
    /// Terminal: a plan was produced. Further invocations in the same turn
    /// were discarded.
    Plan {
        /// The coordinator's reasoning text.
        reasoning: String,
        /// The parsed plan.
        plan: NegotiationPlan,
    },
}

/// One deliberation result with its token accounting.
#[derive(Debug)]
pub struct Deliberation {
    /// The decision.
    pub decision: CoordinatorDecision,
    /// Usage reported by the central channel for this round-trip.
    pub usage: Option<TokenUsage>,
}

/// The coordinator protocol: tool schemas plus one deliberation per round.
///
/// An implementation of this trait is a **mandatory collaborator** of the
/// engine; there is no built-in fallback.
#[async_trait]
pub trait CoordinatorSkill: Send + Sync {
    /// The tool definitions active under `set`. The engine forwards these
    /// to the central channel verbatim; it never authors its own.
    fn tool_definitions(&self, set: ToolSet) -> Vec<ToolDefinition>;

    /// Run one coordinator round.
    async fn deliberate(
        &self,
        central: &SharedCentralChannel,
        ctx: CoordinatorContext<'_>,
    ) -> Result<Deliberation, SkillError>;
}

/// The crate's standard coordinator skill.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCoordinatorSkill;

impl DefaultCoordinatorSkill {
    /// Create the skill.
    pub fn new() -> Self {
        Self
    }

    fn definition(name: &str) -> ToolDefinition {
        let (description, schema) = match name {
            TOOL_ASK_AGENT => (
                "Ask one named participant a single follow-up question and \
                 receive its answer.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent_id": {"type": "string", "description": "Protocol id of the participant"},
                        "question": {"type": "string", "description": "The question to ask"}
                    },
                    "required": ["agent_id", "question"]
                }),
            ),
            TOOL_START_DISCOVERY => (
                "Start a scoped sub-negotiation among a subset of the \
                 selected participants about one defined topic.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "topic": {"type": "string", "description": "What the sub-negotiation is about"},
                        "participant_ids": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Protocol ids, all already selected"
                        }
                    },
                    "required": ["topic", "participant_ids"]
                }),
            ),
            TOOL_RECURSE_ON_GAP => (
                "Mark an information gap and schedule a nested \
                 mini-formulation of it.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "description": {"type": "string", "description": "The gap, stated as a demand"}
                    },
                    "required": ["description"]
                }),
            ),
            TOOL_REQUEST_USER_CLARIFICATION => (
                "Raise a question to the requester. The answer may arrive \
                 after this negotiation; do not wait for it.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "question": {"type": "string", "description": "The question for the requester"}
                    },
                    "required": ["question"]
                }),
            ),
            _ => (
                "Emit the final structured plan and end the negotiation.",
                serde_json::json!({
                    "type": "object",
                    "properties": {
                        "plan": {
                            "type": "object",
                            "properties": {
                                "summary": {"type": "string"},
                                "assignments": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "properties": {
                                            "agent_id": {"type": "string"},
                                            "role": {"type": "string"},
                                            "rationale": {"type": "string"}
                                        },
                                        "required": ["agent_id", "role"]
                                    }
                                },
                                "next_steps": {"type": "array", "items": {"type": "string"}},
                                "open_questions": {"type": "array", "items": {"type": "string"}}
                            },
                            "required": ["summary"]
                        }
                    },
                    "required": ["plan"]
                }),
            ),
        };
        ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters_schema: schema,
        }
    }

    fn system_prompt(ctx: &CoordinatorContext<'_>) -> String {
        let mut prompt = String::from(
            "You are the central coordinator of a multi-agent negotiation. \
             Your job is to reconcile the requester's demand with the \
             participants' offers and produce one machine-readable plan.\n\n\
             Each turn, write your reasoning as plain text, then invoke one \
             or more tools by emitting JSON fragments of the form\n\
             {\"tool\": {\"name\": \"<tool_name>\", \"arguments\": {...}}}\n\
             You must invoke at least one tool every turn. Available tools \
             this turn:\n",
        );
        for name in ctx.tool_set.tool_names() {
            let def = Self::definition(name);
            prompt.push_str(&format!("- {}: {}\n", def.name, def.description));
        }
        match ctx.tool_set {
            ToolSet::Full => prompt.push_str(
                "\nThis is your first look at the offers. Acquire what you \
                 still need now: later turns can only question participants \
                 or emit the plan.",
            ),
            ToolSet::Restricted => prompt.push_str(
                "\nOffers are now summarised, not quoted. Rely on your prior \
                 reasoning and tool results; ask participants directly if \
                 something is missing, otherwise emit the plan.",
            ),
            ToolSet::FinalOnly => prompt.push_str(
                "\nThe negotiation is closing. Emit the best plan you can \
                 from what you already know, now, via output_plan.",
            ),
        }
        prompt
    }

    /// The redacted view of one offer used from round 2 onwards:
    /// structured fields only, never the offer text.
    fn masked_offer_line(participants: &[AgentParticipant], offer: &Offer) -> String {
        let display_name = participants
            .iter()
            .find(|p| p.agent_id == offer.agent_id)
            .map(|p| p.display_name.as_str())
            .unwrap_or("?");
        format!(
            "- {} ({}): {}, confidence {:.2}, capabilities [{}], constraints [{}]",
            offer.agent_id,
            display_name,
            if offer.declined { "declined" } else { "offered" },
            offer.confidence,
            offer.capabilities.join(", "),
            offer.constraints.join(", "),
        )
    }

    fn user_prompt(ctx: &CoordinatorContext<'_>) -> String {
        let mut prompt = String::new();

        let demand_json = serde_json::to_string_pretty(ctx.demand)
            .unwrap_or_else(|_| ctx.demand.intent.clone());
        prompt.push_str(&format!("## Demand\n{}\n\n", demand_json));

        prompt.push_str("## Participants\n");
        if ctx.participants.is_empty() {
            prompt.push_str(
                "(none: no agent resonated with this demand; the plan must \
                 say so explicitly)\n",
            );
        }
        for p in ctx.participants {
            prompt.push_str(&format!(
                "- {} ({}), resonance {:.2}, state {:?}\n",
                p.agent_id, p.display_name, p.score, p.state
            ));
        }
        prompt.push('\n');

        if ctx.round <= 1 {
            prompt.push_str("## Offers\n");
            for offer in ctx.offers {
                let offer_json = serde_json::to_string(offer).unwrap_or_default();
                prompt.push_str(&format!("{}\n", offer_json));
            }
        } else {
            prompt.push_str("## Offers (summary)\n");
            for offer in ctx.offers {
                prompt.push_str(&Self::masked_offer_line(ctx.participants, offer));
                prompt.push('\n');
            }
        }
        prompt.push('\n');

        if !ctx.history.is_empty() {
            prompt.push_str("## Your prior turns\n");
            for turn in ctx.history {
                prompt.push_str(&format!("### Round {}\n{}\n", turn.round, turn.reasoning));
                for result in &turn.results {
                    let payload = serde_json::to_string(&result.payload).unwrap_or_default();
                    prompt.push_str(&format!(
                        "[{}] {} -> {}\n",
                        if result.is_error { "tool-error" } else { "ok" },
                        result.tool_name,
                        payload
                    ));
                }
            }
            prompt.push('\n');
        }

        prompt.push_str(&format!("This is round {}. Proceed.\n", ctx.round));
        prompt
    }

    fn parse_plan(invocation: &ToolInvocation, raw: &str) -> Result<NegotiationPlan, SkillError> {
        // Accept both {"plan": {...}} and the bare plan object.
        let candidate = invocation
            .arguments
            .get("plan")
            .cloned()
            .unwrap_or_else(|| invocation.arguments.clone());
        let plan: NegotiationPlan =
            serde_json::from_value(candidate).map_err(|e| SkillError::Unparseable {
                raw: raw.to_string(),
                detail: format!("output_plan arguments did not parse as a plan: {}", e),
            })?;
        if plan.summary.trim().is_empty() {
            return Err(SkillError::Contract {
                field: "plan.summary",
                raw: raw.to_string(),
            });
        }
        Ok(plan)
    }
}

#[async_trait]
impl CoordinatorSkill for DefaultCoordinatorSkill {
    fn tool_definitions(&self, set: ToolSet) -> Vec<ToolDefinition> {
        set.tool_names().iter().map(|n| Self::definition(n)).collect()
    }

    async fn deliberate(
        &self,
        central: &SharedCentralChannel,
        ctx: CoordinatorContext<'_>,
    ) -> Result<Deliberation, SkillError> {
        let messages = [
            ChatMessage::system(Self::system_prompt(&ctx)),
            ChatMessage::user(Self::user_prompt(&ctx)),
        ];
        let definitions = self.tool_definitions(ctx.tool_set);

        let turn = central
            .complete(&messages, &definitions)
            .await
            .map_err(SkillError::channel)?;

        // Prefer native tool calls; fall back to embedded fragments.
        let invocations = if turn.tool_calls.is_empty() {
            parse::tool_invocations(&turn.text)
        } else {
            turn.tool_calls.clone()
        };

        if invocations.is_empty() {
            return Err(SkillError::Contract {
                field: "tool invocation",
                raw: turn.text,
            });
        }

        // output_plan closes the turn; everything after it is discarded.
        let mut kept = Vec::new();
        for invocation in invocations {
            if invocation.name == TOOL_OUTPUT_PLAN {
                let plan = Self::parse_plan(&invocation, &turn.text)?;
                return Ok(Deliberation {
                    decision: CoordinatorDecision::Plan {
                        reasoning: turn.text,
                        plan,
                    },
                    usage: turn.usage,
                });
            }
            kept.push(invocation);
        }

        Ok(Deliberation {
            decision: CoordinatorDecision::Continue {
                reasoning: turn.text,
                invocations: kept,
            },
            usage: turn.usage,
        })
    }
}
