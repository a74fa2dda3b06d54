//! Per-agent conversational channels and the shared profile registry.
//!
//! Every agent the engine can talk to is reachable through the
//! [`AgentChannel`] trait: a single-turn `chat` operation plus structured
//! `profile` lookup. Two concrete variants ship with the crate:
//!
//! - [`DefaultChannel`] proxies every agent to one [`CentralChannel`],
//!   synthesising a per-agent system prompt from the agent's profile.
//! - [`ExternalChannel`] delegates to a per-agent HTTP endpoint hosted by
//!   an identity provider.
//!
//! Both hold the [`ProfileRegistry`] **by reference** (`Arc`): a profile
//! updated in the registry is visible through the channel on the next call
//! without any resync. Assemblers can verify the wiring with
//! [`AgentChannel::registry`] and [`ProfileRegistry::same_handle`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use parley::channel::{AgentProfile, ProfileRegistry};
//!
//! # async fn example() {
//! let registry = Arc::new(ProfileRegistry::new());
//! registry
//!     .upsert(AgentProfile {
//!         agent_id: "alice".to_string(),
//!         display_name: "Alice Park".to_string(),
//!         capabilities: vec!["project management".to_string()],
//!         context: "Ten years shipping healthcare software.".to_string(),
//!     })
//!     .await;
//! assert_eq!(registry.len().await, 1);
//! # }
//! ```

use crate::parley::central::{ChatMessage, ChatRole, SharedCentralChannel, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Structured description of one agent: who it is and what it can do.
///
/// The `agent_id` is the stable protocol identity used in every equality
/// comparison and event payload; `display_name` is an opaque presentation
/// string and must never be used to identify an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Stable, machine-readable protocol id.
    pub agent_id: String,
    /// Mutable, human-readable name. Presentation only.
    pub display_name: String,
    /// Declared capabilities, one phrase each.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-form biographical context.
    #[serde(default)]
    pub context: String,
}

/// Shared, read-mostly store of agent profiles.
///
/// The registry is owned by the surrounding application and handed to
/// channels and engines as `Arc<ProfileRegistry>`. Updates through any
/// handle are observed by every holder; nothing is copied at assembly time.
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: RwLock<HashMap<String, AgentProfile>>,
}

impl ProfileRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile, keyed by its `agent_id`.
    pub async fn upsert(&self, profile: AgentProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.agent_id.clone(), profile);
    }

    /// Remove a profile. Returns the removed entry, if any.
    pub async fn remove(&self, agent_id: &str) -> Option<AgentProfile> {
        self.profiles.write().await.remove(agent_id)
    }

    /// Snapshot the profile stored under `agent_id` as of this call.
    pub async fn get(&self, agent_id: &str) -> Option<AgentProfile> {
        self.profiles.read().await.get(agent_id).cloned()
    }

    /// Snapshot every profile, in unspecified order.
    pub async fn all(&self) -> Vec<AgentProfile> {
        self.profiles.read().await.values().cloned().collect()
    }

    /// Number of registered agents.
    pub async fn len(&self) -> usize {
        self.profiles.read().await.len()
    }

    /// Whether the registry holds no profiles. An empty registry is a valid
    /// value, distinct from an absent one.
    pub async fn is_empty(&self) -> bool {
        self.profiles.read().await.is_empty()
    }

    /// Assembly-time connectivity check: do `a` and `b` refer to the same
    /// live registry (not merely equal contents)?
    pub fn same_handle(a: &Arc<ProfileRegistry>, b: &Arc<ProfileRegistry>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

/// Errors surfaced by [`AgentChannel`] implementations.
#[derive(Debug)]
pub enum ChannelError {
    /// The agent id is not present in the profile registry.
    UnknownAgent(String),
    /// The agent's endpoint refused the request or the transport failed.
    Unavailable(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::UnknownAgent(id) => write!(f, "unknown agent: {}", id),
            ChannelError::Unavailable(msg) => write!(f, "agent channel unavailable: {}", msg),
        }
    }
}

impl Error for ChannelError {}

/// Abstraction over one agent's conversational endpoint.
///
/// Channels are capability sets, not class hierarchies: the engine is
/// polymorphic over anything implementing these operations, shared as
/// `Arc<dyn AgentChannel>`.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    /// Single-turn completion on the named agent's endpoint.
    async fn chat(
        &self,
        agent_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String, Box<dyn Error + Send + Sync>>;

    /// Structured profile for the named agent, read through the shared
    /// registry at call time.
    async fn profile(&self, agent_id: &str) -> Result<AgentProfile, Box<dyn Error + Send + Sync>> {
        match self.registry().get(agent_id).await {
            Some(profile) => Ok(profile),
            None => Err(Box::new(ChannelError::UnknownAgent(agent_id.to_string()))),
        }
    }

    /// The registry handle this channel reads profiles through.
    fn registry(&self) -> &Arc<ProfileRegistry>;

    /// Usage from the most recent [`chat`](AgentChannel::chat) call, when
    /// the implementation tracks it. Best-effort; the default reports
    /// nothing.
    async fn last_usage(&self) -> Option<TokenUsage> {
        None
    }
}

/// Channel that proxies all agents to a single central model.
///
/// Each `chat` call prepends a system prompt synthesised from the agent's
/// current profile, so one upstream model can speak *as* any registered
/// agent. This is the variant used when agents have no endpoint of their
/// own.
pub struct DefaultChannel {
    central: SharedCentralChannel,
    registry: Arc<ProfileRegistry>,
    usage: Mutex<Option<TokenUsage>>,
}

impl DefaultChannel {
    /// Create a channel backed by `central`, reading profiles from
    /// `registry`.
    pub fn new(central: SharedCentralChannel, registry: Arc<ProfileRegistry>) -> Self {
        Self {
            central,
            registry,
            usage: Mutex::new(None),
        }
    }

    /// Synthesise the persona system prompt for one agent.
    fn persona_prompt(profile: &AgentProfile) -> String {
        let mut prompt = String::new();
        prompt.push_str(&format!("You are {}.\n", profile.display_name));
        if !profile.capabilities.is_empty() {
            prompt.push_str(&format!(
                "Your capabilities: {}\n",
                profile.capabilities.join(", ")
            ));
        }
        if !profile.context.is_empty() {
            prompt.push_str(&format!("Your background: {}\n", profile.context));
        }
        prompt.push_str(
            "Answer strictly as this person would, grounded in the capabilities \
             and background above. Do not claim abilities that are not listed.",
        );
        prompt
    }
}

#[async_trait]
impl AgentChannel for DefaultChannel {
    async fn chat(
        &self,
        agent_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let profile = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| ChannelError::UnknownAgent(agent_id.to_string()))?;

        let mut framed = Vec::with_capacity(messages.len() + 1);
        framed.push(ChatMessage::system(Self::persona_prompt(&profile)));
        framed.extend_from_slice(messages);

        let turn = self.central.complete(&framed, &[]).await?;
        *self.usage.lock().await = turn.usage.clone();
        Ok(turn.text)
    }

    fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    async fn last_usage(&self) -> Option<TokenUsage> {
        self.usage.lock().await.clone()
    }
}

/// Wire shape accepted by an external per-agent endpoint.
#[derive(Serialize)]
struct ExternalChatRequest<'a> {
    agent_id: &'a str,
    messages: Vec<ExternalChatMessage<'a>>,
}

#[derive(Serialize)]
struct ExternalChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Wire shape returned by an external per-agent endpoint.
#[derive(Deserialize)]
struct ExternalChatResponse {
    text: String,
}

/// Channel that delegates each agent to an identity-provider-hosted
/// endpoint.
///
/// `chat` issues `POST {base_url}/agents/{agent_id}/chat` with a JSON body
/// and expects `{"text": "..."}` back. Profile lookups still go through the
/// shared registry, so both channel variants are interchangeable from the
/// engine's viewpoint.
pub struct ExternalChannel {
    base_url: String,
    http: reqwest::Client,
    registry: Arc<ProfileRegistry>,
}

impl ExternalChannel {
    /// Create a channel posting to `base_url`, reading profiles from
    /// `registry`.
    pub fn new(base_url: impl Into<String>, registry: Arc<ProfileRegistry>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            registry,
        }
    }

    fn role_label(role: &ChatRole) -> &'static str {
        match role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        }
    }
}

#[async_trait]
impl AgentChannel for ExternalChannel {
    async fn chat(
        &self,
        agent_id: &str,
        messages: &[ChatMessage],
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        // The registry is still authoritative for which agents exist.
        if self.registry.get(agent_id).await.is_none() {
            return Err(Box::new(ChannelError::UnknownAgent(agent_id.to_string())));
        }

        let body = ExternalChatRequest {
            agent_id,
            messages: messages
                .iter()
                .map(|m| ExternalChatMessage {
                    role: Self::role_label(&m.role),
                    content: m.content.as_ref(),
                })
                .collect(),
        };

        let url = format!("{}/agents/{}/chat", self.base_url.trim_end_matches('/'), agent_id);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Box::new(ChannelError::Unavailable(format!(
                "endpoint returned {} for {}",
                response.status(),
                agent_id
            ))));
        }

        let parsed: ExternalChatResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;
        Ok(parsed.text)
    }

    fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }
}
