//! Offer solicitation: one agent, one structured response.
//!
//! Each invocation is scoped to a single agent and runs on that agent's
//! channel. Anti-fabrication is part of the contract: when the profile
//! offers no relevant basis, the prompt demands a low-confidence decline
//! rather than a plausible invention.

use crate::parley::central::ChatMessage;
use crate::parley::channel::{AgentChannel, AgentProfile};
use crate::parley::session::FormulatedDemand;
use crate::parley::skills::{parse, SkillError};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Input to one offer solicitation.
#[derive(Debug, Clone, Copy)]
pub struct OfferContext<'a> {
    /// The formulated demand the agent is responding to.
    pub demand: &'a FormulatedDemand,
    /// The agent's profile as of selection time.
    pub profile: &'a AgentProfile,
}

/// An agent's parsed response.
#[derive(Debug, Clone, Deserialize)]
pub struct OfferOutcome {
    /// Free-form offer (or decline) text.
    pub offer_text: String,
    /// Self-reported confidence, clamped into `[0, 1]` after parsing.
    pub confidence: f64,
    /// Whether the agent declined. Absent means "offered".
    #[serde(default)]
    pub declined: bool,
    /// Capabilities the agent claims to bring to this demand.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Constraints the agent attaches to its participation.
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// Solicits one structured offer from one agent.
#[async_trait]
pub trait OfferSkill: Send + Sync {
    /// Run the solicitation on `channel` for the agent named in `ctx`.
    async fn solicit(
        &self,
        channel: &Arc<dyn AgentChannel>,
        ctx: OfferContext<'_>,
    ) -> Result<OfferOutcome, SkillError>;
}

/// The crate's standard offer skill.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOfferSkill;

impl DefaultOfferSkill {
    /// Create the skill.
    pub fn new() -> Self {
        Self
    }

    fn request_text(ctx: &OfferContext<'_>) -> String {
        let demand_json = serde_json::to_string_pretty(ctx.demand)
            .unwrap_or_else(|_| ctx.demand.intent.clone());
        format!(
            "A requester has the following demand:\n{}\n\n\
             Decide whether you can genuinely contribute, based only on your \
             stated capabilities and background. If nothing in your profile is \
             relevant, you must decline with low confidence instead of \
             inventing a contribution.\n\n\
             Respond with exactly one JSON object and nothing else:\n\
             {{\n\
               \"offer_text\": \"<what you offer, or why you decline>\",\n\
               \"confidence\": <number between 0 and 1>,\n\
               \"declined\": <true|false>,\n\
               \"capabilities\": [\"<capability you would apply>\", ...],\n\
               \"constraints\": [\"<condition on your participation>\", ...]\n\
             }}",
            demand_json
        )
    }
}

#[async_trait]
impl OfferSkill for DefaultOfferSkill {
    async fn solicit(
        &self,
        channel: &Arc<dyn AgentChannel>,
        ctx: OfferContext<'_>,
    ) -> Result<OfferOutcome, SkillError> {
        let messages = [ChatMessage::user(Self::request_text(&ctx))];
        let reply = channel
            .chat(&ctx.profile.agent_id, &messages)
            .await
            .map_err(SkillError::channel)?;

        let mut outcome: OfferOutcome =
            parse::first_object_as(&reply).ok_or_else(|| SkillError::Unparseable {
                raw: reply.clone(),
                detail: "no JSON object with an offer shape".to_string(),
            })?;

        if outcome.offer_text.trim().is_empty() {
            return Err(SkillError::Contract {
                field: "offer_text",
                raw: reply,
            });
        }
        // Out-of-range confidence is framing noise, not a contract breach.
        outcome.confidence = outcome.confidence.clamp(0.0, 1.0);
        Ok(outcome)
    }
}
