//! Shared primitives for the coordinator-side model channel.
//!
//! The engine reaches the central language model exclusively through the
//! [`CentralChannel`] trait. The trait abstracts over concrete vendors while
//! the supporting structs describe chat messages, tool schemas, and token
//! accounting. No prompt text or tool schema is defined here; those belong
//! to the skills that own them.
//!
//! # Request/response shape
//!
//! ```text
//! Skill ──(ChatMessage[], ToolDefinition[])──▶ CentralChannel
//!       ◀──(CentralTurn { text, tool_calls, usage })──
//! ```

use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

/// Represents the possible roles for a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRole {
    /// A system authored message that primes or constrains model behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message.
    Assistant,
    /// A tool-result message correlating with a prior tool invocation.
    Tool,
}

/// A generic message exchanged with a language model.
///
/// The body is stored as `Arc<str>` so that histories can be cheaply cloned
/// across rounds and tasks.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// The role associated with the message.
    pub role: ChatRole,
    /// The message body.
    pub content: Arc<str>,
}

impl ChatMessage {
    /// Build a message with the given role and content.
    pub fn new(role: ChatRole, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
        }
    }

    /// Shorthand for a [`ChatRole::System`] message.
    pub fn system(content: impl AsRef<str>) -> Self {
        Self::new(ChatRole::System, content)
    }

    /// Shorthand for a [`ChatRole::User`] message.
    pub fn user(content: impl AsRef<str>) -> Self {
        Self::new(ChatRole::User, content)
    }

    /// Shorthand for a [`ChatRole::Assistant`] message.
    pub fn assistant(content: impl AsRef<str>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    /// Shorthand for a [`ChatRole::Tool`] message.
    pub fn tool(content: impl AsRef<str>) -> Self {
        Self::new(ChatRole::Tool, content)
    }
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Fold another usage record into this one, saturating on overflow.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Provider-agnostic tool schema passed to the model along with a request.
///
/// Definitions are authored by the skill that owns the tool protocol; the
/// engine and channels only transport them.
///
/// # Example
///
/// ```rust
/// use parley::central::ToolDefinition;
///
/// let def = ToolDefinition {
///     name: "ask_agent".to_string(),
///     description: "Ask a named participant one follow-up question.".to_string(),
///     parameters_schema: serde_json::json!({
///         "type": "object",
///         "properties": {
///             "agent_id": {"type": "string"},
///             "question": {"type": "string"}
///         },
///         "required": ["agent_id", "question"]
///     }),
/// };
/// assert_eq!(def.name, "ask_agent");
/// ```
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name as it will appear to the model.
    pub name: String,
    /// Human-readable description surfaced to the model to aid selection.
    pub description: String,
    /// JSON Schema object describing the accepted arguments.
    pub parameters_schema: serde_json::Value,
}

/// A single tool call requested by the model.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolInvocation {
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the model for this call.
    pub arguments: serde_json::Value,
}

/// One completed round-trip with the central model under a tool protocol.
///
/// `tool_calls` is non-empty when the provider surfaced native
/// function-calling results. Providers without native tool support return
/// everything in `text`; the calling skill is responsible for extracting
/// embedded tool-call payloads from it.
#[derive(Debug, Clone)]
pub struct CentralTurn {
    /// The assistant's free text for this turn (reasoning, prose, or an
    /// embedded structured payload).
    pub text: String,
    /// Native tool calls requested by the model, in invocation order.
    pub tool_calls: Vec<ToolInvocation>,
    /// Token accounting for this round-trip, when the provider reports it.
    pub usage: Option<TokenUsage>,
}

/// Trait defining the interface to the central, tool-use-capable model.
///
/// All implementations must be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks as `Arc<dyn CentralChannel>`.
#[async_trait]
pub trait CentralChannel: Send + Sync {
    /// Send a full request/response style completion.
    ///
    /// The `messages` slice must include any system priming messages the
    /// caller wishes to send. When `tools` is non-empty, implementations
    /// that support native function calling forward the definitions to the
    /// provider; others may ignore them and rely on the caller's embedded
    /// tool-call conventions.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<CentralTurn, Box<dyn Error + Send + Sync>>;

    /// Return the identifier used to select the upstream model.
    fn model_name(&self) -> &str;

    /// Usage from the most recent [`complete`](CentralChannel::complete)
    /// call, when the implementation tracks it. Accounting is best-effort;
    /// the default reports nothing.
    async fn last_usage(&self) -> Option<TokenUsage> {
        None
    }
}

/// Convenience alias used throughout the crate for shared central channels.
pub type SharedCentralChannel = Arc<dyn CentralChannel>;
