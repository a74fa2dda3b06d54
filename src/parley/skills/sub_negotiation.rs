//! Scoped sub-negotiation over a participant subset.
//!
//! Spawned by the coordinator's `start_discovery` tool. The finding feeds
//! back into the coordinator's history as the tool result of the
//! originating invocation; at most one sub-negotiation runs at a time per
//! parent session.

use crate::parley::central::{ChatMessage, SharedCentralChannel};
use crate::parley::session::{AgentParticipant, Offer};
use crate::parley::skills::{parse, SkillError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Input to one sub-negotiation.
#[derive(Debug, Clone, Copy)]
pub struct SubNegotiationContext<'a> {
    /// What the sub-negotiation is about.
    pub topic: &'a str,
    /// The participant subset in scope.
    pub participants: &'a [AgentParticipant],
    /// Those participants' offers.
    pub offers: &'a [Offer],
}

/// Structured finding returned to the parent coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryFinding {
    /// The topic as negotiated.
    pub topic: String,
    /// Points the subset agrees on.
    #[serde(default)]
    pub agreements: Vec<String>,
    /// Points of active disagreement.
    #[serde(default)]
    pub disagreements: Vec<String>,
    /// Questions the subset could not settle.
    #[serde(default)]
    pub open_questions: Vec<String>,
}

/// Runs one scoped sub-negotiation.
#[async_trait]
pub trait SubNegotiationSkill: Send + Sync {
    /// Produce a finding for `ctx` on the central channel.
    async fn discover(
        &self,
        central: &SharedCentralChannel,
        ctx: SubNegotiationContext<'_>,
    ) -> Result<DiscoveryFinding, SkillError>;
}

const SYSTEM_PROMPT: &str = "\
You are moderating a scoped sub-negotiation between a handful of agents \
about a single topic. From their offers, determine where they agree, \
where they disagree, and what remains open. Respond with exactly one JSON \
object and nothing else:\n\
{\n\
  \"topic\": \"<the topic>\",\n\
  \"agreements\": [\"...\"],\n\
  \"disagreements\": [\"...\"],\n\
  \"open_questions\": [\"...\"]\n\
}";

/// The crate's standard sub-negotiation skill.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSubNegotiationSkill;

impl DefaultSubNegotiationSkill {
    /// Create the skill.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SubNegotiationSkill for DefaultSubNegotiationSkill {
    async fn discover(
        &self,
        central: &SharedCentralChannel,
        ctx: SubNegotiationContext<'_>,
    ) -> Result<DiscoveryFinding, SkillError> {
        let mut request = format!("Topic: {}\n\nParticipants and offers:\n", ctx.topic);
        for participant in ctx.participants {
            let offer_text = ctx
                .offers
                .iter()
                .find(|o| o.agent_id == participant.agent_id)
                .map(|o| o.text.as_str())
                .unwrap_or("(no offer)");
            request.push_str(&format!(
                "- {} ({}): {}\n",
                participant.agent_id, participant.display_name, offer_text
            ));
        }

        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(&request)];
        let turn = central
            .complete(&messages, &[])
            .await
            .map_err(SkillError::channel)?;

        let mut finding: DiscoveryFinding =
            parse::first_object_as(&turn.text).ok_or_else(|| SkillError::Unparseable {
                raw: turn.text.clone(),
                detail: "no JSON object with a discovery-finding shape".to_string(),
            })?;
        if finding.topic.trim().is_empty() {
            finding.topic = ctx.topic.to_string();
        }
        Ok(finding)
    }
}
