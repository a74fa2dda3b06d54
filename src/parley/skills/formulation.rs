//! Formulation: raw demand text → structured demand.
//!
//! Runs once per session, on the central channel. The output feeds both the
//! resonance matcher (view construction) and every downstream prompt.

use crate::parley::central::{ChatMessage, SharedCentralChannel};
use crate::parley::session::FormulatedDemand;
use crate::parley::skills::{parse, SkillError};
use async_trait::async_trait;

/// Input to one formulation call.
#[derive(Debug, Clone, Copy)]
pub struct FormulationContext<'a> {
    /// The demand exactly as the requester submitted it.
    pub raw_demand: &'a str,
    /// Identity of the requester, available to the model as context.
    pub requester_id: &'a str,
}

/// Turns a raw demand into a [`FormulatedDemand`].
#[async_trait]
pub trait FormulationSkill: Send + Sync {
    /// Issue the formulation call and parse the structured demand.
    async fn formulate(
        &self,
        central: &SharedCentralChannel,
        ctx: FormulationContext<'_>,
    ) -> Result<FormulatedDemand, SkillError>;
}

const SYSTEM_PROMPT: &str = "\
You turn a requester's raw demand into a structured JSON object. \
Respond with exactly one JSON object and nothing else, shaped as:\n\
{\n\
  \"intent\": \"<one sentence stating what the requester wants>\",\n\
  \"constraints\": [\"<hard requirement>\", ...],\n\
  \"preferences\": [\"<soft preference>\", ...],\n\
  \"context\": { <free-form key/value context> },\n\
  \"enrichments\": [\"<useful detail the demand implies but does not state>\", ...]\n\
}\n\
Keep the intent to a single sentence. Use empty arrays when the demand \
states no constraints or preferences; never invent requirements the \
requester did not imply.";

/// The crate's standard formulation skill.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFormulationSkill;

impl DefaultFormulationSkill {
    /// Create the skill.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FormulationSkill for DefaultFormulationSkill {
    async fn formulate(
        &self,
        central: &SharedCentralChannel,
        ctx: FormulationContext<'_>,
    ) -> Result<FormulatedDemand, SkillError> {
        let request = format!(
            "Requester: {}\nDemand:\n{}",
            ctx.requester_id, ctx.raw_demand
        );
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(&request),
        ];

        let turn = central
            .complete(&messages, &[])
            .await
            .map_err(SkillError::channel)?;

        let demand: FormulatedDemand =
            parse::first_object_as(&turn.text).ok_or_else(|| SkillError::Unparseable {
                raw: turn.text.clone(),
                detail: "no JSON object with a formulated-demand shape".to_string(),
            })?;

        if demand.intent.trim().is_empty() {
            return Err(SkillError::Contract {
                field: "intent",
                raw: turn.text,
            });
        }
        Ok(demand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parley::central::{CentralChannel, CentralTurn, ToolDefinition};
    use std::sync::Arc;

    struct CannedCentral {
        reply: String,
    }

    #[async_trait]
    impl CentralChannel for CannedCentral {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<CentralTurn, Box<dyn std::error::Error + Send + Sync>> {
            Ok(CentralTurn {
                text: self.reply.clone(),
                tool_calls: vec![],
                usage: None,
            })
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    #[tokio::test]
    async fn parses_fenced_output() {
        let central: SharedCentralChannel = Arc::new(CannedCentral {
            reply: "Sure!\n```json\n{\"intent\": \"Hire two engineers\", \
                    \"constraints\": [\"remote\"], \"preferences\": [], \
                    \"context\": {\"domain\": \"healthcare\"}}\n```"
                .to_string(),
        });
        let demand = DefaultFormulationSkill::new()
            .formulate(
                &central,
                FormulationContext {
                    raw_demand: "need two engineers, remote",
                    requester_id: "requester-1",
                },
            )
            .await
            .unwrap();
        assert_eq!(demand.intent, "Hire two engineers");
        assert_eq!(demand.constraints, vec!["remote".to_string()]);
        assert!(demand.preferences.is_empty());
    }

    #[tokio::test]
    async fn empty_intent_is_a_contract_violation() {
        let central: SharedCentralChannel = Arc::new(CannedCentral {
            reply: "{\"intent\": \"  \"}".to_string(),
        });
        let err = DefaultFormulationSkill::new()
            .formulate(
                &central,
                FormulationContext {
                    raw_demand: "anything",
                    requester_id: "r",
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SkillError::Contract { field: "intent", .. }));
    }

    #[tokio::test]
    async fn prose_without_json_is_unparseable_and_keeps_raw() {
        let central: SharedCentralChannel = Arc::new(CannedCentral {
            reply: "I would be happy to help with that.".to_string(),
        });
        let err = DefaultFormulationSkill::new()
            .formulate(
                &central,
                FormulationContext {
                    raw_demand: "anything",
                    requester_id: "r",
                },
            )
            .await
            .unwrap_err();
        match err {
            SkillError::Unparseable { raw, .. } => assert!(raw.contains("happy to help")),
            other => panic!("unexpected error: {}", other),
        }
    }
}
