//! The negotiation orchestration engine.
//!
//! One [`NegotiationEngine`] drives any number of sessions; each session
//! runs in its own task and is mutated by that task alone. The engine walks
//! the session lifecycle, fans offer solicitations out in parallel under
//! per-agent deadlines, releases the barrier once every offer task settles,
//! and then runs the bounded coordinator loop, dispatching the
//! coordinator's tool calls against local handlers.
//!
//! # Session flow
//!
//! ```text
//! negotiate(requester, demand)
//!   ├─ Formulation skill ───────────────▶ formulation.ready
//!   ├─ batch encode + resonance matcher ▶ resonance.activated
//!   ├─ per-participant offer tasks ─────▶ offer.received (each)
//!   ├─ barrier (all tasks settled) ─────▶ barrier.complete
//!   ├─ coordinator loop, ≤ M rounds ────▶ center.tool_call (each)
//!   │    └─ output_plan ────────────────▶ plan.ready
//!   └─ terminal ────────────────────────▶ negotiation.{completed,error,cancelled}
//! ```
//!
//! The engine embeds no prompts and no tool schemas: those live in the
//! skills, and a [`CoordinatorSkill`] is a mandatory collaborator:
//! constructing an engine without one fails.

use crate::parley::central::{SharedCentralChannel, TokenUsage, ToolInvocation};
use crate::parley::channel::{AgentChannel, AgentProfile, ProfileRegistry};
use crate::parley::central::ChatMessage;
use crate::parley::config::EngineConfig;
use crate::parley::encoder::Encoder;
use crate::parley::event::{Event, EventBus, EventType};
use crate::parley::resonance::{self, EncodedDemand, EncodedProfile};
use crate::parley::session::{
    AgentParticipant, FormulatedDemand, NegotiationPlan, NegotiationSession, Offer,
    OutcomeSummary, ParticipantState, SessionDisposition, SessionState, CoordinatorTurn,
    ToolOutcome,
};
use crate::parley::skills::coordinator::{
    CoordinatorContext, CoordinatorDecision, CoordinatorSkill, ToolSet, TOOL_ASK_AGENT,
    TOOL_OUTPUT_PLAN, TOOL_RECURSE_ON_GAP, TOOL_REQUEST_USER_CLARIFICATION, TOOL_START_DISCOVERY,
};
use crate::parley::skills::{
    DefaultFormulationSkill, DefaultOfferSkill, DefaultSubNegotiationSkill, FormulationContext,
    FormulationSkill, OfferContext, OfferSkill, SkillError, SubNegotiationContext,
    SubNegotiationSkill,
};
use crate::parley::trace::{TraceChain, TraceKind};
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Errors surfaced by the engine: construction problems and the causes
/// that terminate a session.
#[derive(Debug)]
pub enum EngineError {
    /// No [`CoordinatorSkill`] was provided at construction. There is no
    /// built-in fallback coordinator.
    MissingCoordinator,
    /// The profile registry handed to the builder is not the same handle
    /// the agent channel reads through.
    DisconnectedRegistry,
    /// A required collaborator or a consistency check failed at build time.
    Misconfigured(String),
    /// An agent's endpoint refused or failed.
    ChannelUnavailable(String),
    /// A model call failed or returned unparseable output.
    Model(String),
    /// Parsed model output violated a skill contract.
    Contract(String),
    /// The session exceeded its wall-clock ceiling.
    DeadlineExceeded,
    /// The session was cancelled externally.
    Cancelled,
    /// A bug: an internal invariant did not hold.
    Internal(String),
}

impl EngineError {
    /// Stable cause label used in trace entries and terminal events.
    pub fn cause(&self) -> &'static str {
        match self {
            EngineError::MissingCoordinator
            | EngineError::DisconnectedRegistry
            | EngineError::Misconfigured(_) => "misconfigured",
            EngineError::ChannelUnavailable(_) => "channel-unavailable",
            EngineError::Model(_) => "model-error",
            EngineError::Contract(_) => "skill-contract-violation",
            EngineError::DeadlineExceeded => "deadline-exceeded",
            EngineError::Cancelled => "cancelled",
            EngineError::Internal(_) => "internal-invariant",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::MissingCoordinator => {
                write!(f, "a coordinator skill is required to construct an engine")
            }
            EngineError::DisconnectedRegistry => write!(
                f,
                "the agent channel does not read through the engine's profile registry"
            ),
            EngineError::Misconfigured(msg) => write!(f, "engine misconfigured: {}", msg),
            EngineError::ChannelUnavailable(msg) => write!(f, "channel unavailable: {}", msg),
            EngineError::Model(msg) => write!(f, "model error: {}", msg),
            EngineError::Contract(msg) => write!(f, "skill contract violation: {}", msg),
            EngineError::DeadlineExceeded => write!(f, "session wall-clock ceiling exceeded"),
            EngineError::Cancelled => write!(f, "session cancelled"),
            EngineError::Internal(msg) => write!(f, "internal invariant violated: {}", msg),
        }
    }
}

impl Error for EngineError {}

/// A finalised session: the frozen session record, its trace chain, and
/// summary metrics.
pub struct SessionOutcome {
    /// The session, frozen in its terminal state.
    pub session: NegotiationSession,
    /// The complete audit trail.
    pub trace: TraceChain,
    /// Summary metrics.
    pub summary: OutcomeSummary,
}

/// Handle to a session spawned with [`NegotiationEngine::spawn`].
pub struct NegotiationRun {
    /// The session id, usable immediately for event subscription.
    pub negotiation_id: String,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<SessionOutcome>,
}

impl NegotiationRun {
    /// Request cancellation. The engine propagates it to all in-flight
    /// child tasks; the terminal event is guaranteed.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the session to reach its terminal event.
    pub async fn join(self) -> Result<SessionOutcome, EngineError> {
        self.handle
            .await
            .map_err(|e| EngineError::Internal(format!("session task failed: {}", e)))
    }
}

/// Builder for [`NegotiationEngine`]. A coordinator skill is mandatory;
/// the other skills default to the crate's standard implementations.
pub struct EngineBuilder {
    config: EngineConfig,
    encoder: Option<Arc<dyn Encoder>>,
    agent_channel: Option<Arc<dyn AgentChannel>>,
    central: Option<SharedCentralChannel>,
    registry: Option<Arc<ProfileRegistry>>,
    formulation: Arc<dyn FormulationSkill>,
    offer: Arc<dyn OfferSkill>,
    coordinator: Option<Arc<dyn CoordinatorSkill>>,
    sub_negotiation: Arc<dyn SubNegotiationSkill>,
    bus: Option<Arc<EventBus>>,
    trace_dir: Option<PathBuf>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            encoder: None,
            agent_channel: None,
            central: None,
            registry: None,
            formulation: Arc::new(DefaultFormulationSkill::new()),
            offer: Arc::new(DefaultOfferSkill::new()),
            coordinator: None,
            sub_negotiation: Arc::new(DefaultSubNegotiationSkill::new()),
            bus: None,
            trace_dir: None,
        }
    }
}

impl EngineBuilder {
    /// Override the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the encoder (required).
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Set the per-agent channel (required).
    pub fn with_agent_channel(mut self, channel: Arc<dyn AgentChannel>) -> Self {
        self.agent_channel = Some(channel);
        self
    }

    /// Set the central, tool-use-capable channel (required).
    pub fn with_central_channel(mut self, central: SharedCentralChannel) -> Self {
        self.central = Some(central);
        self
    }

    /// Set the profile registry. Defaults to the agent channel's handle;
    /// when set explicitly it must be the same handle.
    pub fn with_registry(mut self, registry: Arc<ProfileRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the formulation skill.
    pub fn with_formulation_skill(mut self, skill: Arc<dyn FormulationSkill>) -> Self {
        self.formulation = skill;
        self
    }

    /// Replace the offer skill.
    pub fn with_offer_skill(mut self, skill: Arc<dyn OfferSkill>) -> Self {
        self.offer = skill;
        self
    }

    /// Set the coordinator skill (required; no fallback exists).
    pub fn with_coordinator_skill(mut self, skill: Arc<dyn CoordinatorSkill>) -> Self {
        self.coordinator = Some(skill);
        self
    }

    /// Replace the sub-negotiation skill.
    pub fn with_sub_negotiation_skill(mut self, skill: Arc<dyn SubNegotiationSkill>) -> Self {
        self.sub_negotiation = skill;
        self
    }

    /// Share an event bus. Defaults to a fresh bus with default policy.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Persist each session's trace chain as `.jsonl` under `dir`.
    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    /// Validate the wiring and construct the engine.
    ///
    /// Fails when the coordinator skill is absent, a required collaborator
    /// is missing, the encoder's dimension contradicts the configuration,
    /// or the registry handle is not the one the agent channel reads
    /// through (connectivity over copy).
    pub fn build(self) -> Result<NegotiationEngine, EngineError> {
        let coordinator = self.coordinator.ok_or(EngineError::MissingCoordinator)?;
        let encoder = self
            .encoder
            .ok_or_else(|| EngineError::Misconfigured("an encoder is required".to_string()))?;
        let agent_channel = self.agent_channel.ok_or_else(|| {
            EngineError::Misconfigured("an agent channel is required".to_string())
        })?;
        let central = self.central.ok_or_else(|| {
            EngineError::Misconfigured("a central channel is required".to_string())
        })?;

        let registry = match self.registry {
            Some(registry) => {
                if !ProfileRegistry::same_handle(&registry, agent_channel.registry()) {
                    return Err(EngineError::DisconnectedRegistry);
                }
                registry
            }
            None => Arc::clone(agent_channel.registry()),
        };

        if encoder.dimension() != self.config.embedding_dimension {
            return Err(EngineError::Misconfigured(format!(
                "encoder dimension {} contradicts configured embedding_dimension {}",
                encoder.dimension(),
                self.config.embedding_dimension
            )));
        }

        Ok(NegotiationEngine {
            config: self.config,
            encoder,
            agent_channel,
            central,
            registry,
            formulation: self.formulation,
            offer: self.offer,
            coordinator,
            sub_negotiation: self.sub_negotiation,
            bus: self.bus.unwrap_or_default(),
            trace_dir: self.trace_dir,
        })
    }
}

/// How one offer task settled.
enum OfferSettled {
    Offered(crate::parley::skills::OfferOutcome, Option<TokenUsage>),
    TimedOut,
    Exited(String),
    Cancelled,
}

/// The orchestration engine. See the module docs for the session flow.
pub struct NegotiationEngine {
    config: EngineConfig,
    encoder: Arc<dyn Encoder>,
    agent_channel: Arc<dyn AgentChannel>,
    central: SharedCentralChannel,
    registry: Arc<ProfileRegistry>,
    formulation: Arc<dyn FormulationSkill>,
    offer: Arc<dyn OfferSkill>,
    coordinator: Arc<dyn CoordinatorSkill>,
    sub_negotiation: Arc<dyn SubNegotiationSkill>,
    bus: Arc<EventBus>,
    trace_dir: Option<PathBuf>,
}

/// Await `fut`, aborting on external cancellation or the session deadline.
async fn guarded<T>(
    cancel: &mut watch::Receiver<bool>,
    deadline: Instant,
    fut: impl Future<Output = T>,
) -> Result<T, EngineError> {
    let interrupted = async {
        // A dropped sender means cancellation can no longer arrive.
        if cancel.wait_for(|flag| *flag).await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        biased;
        _ = interrupted => Err(EngineError::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(EngineError::DeadlineExceeded),
        out = fut => Ok(out),
    }
}

fn fatal_skill_error(stage: &str, err: SkillError) -> EngineError {
    match err {
        SkillError::Channel(msg) => EngineError::Model(format!("{}: {}", stage, msg)),
        SkillError::Unparseable { detail, .. } => {
            EngineError::Model(format!("{}: {}", stage, detail))
        }
        SkillError::Contract { field, .. } => {
            EngineError::Contract(format!("{}: missing {}", stage, field))
        }
    }
}

fn string_arg<'a>(arguments: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(|v| v.as_str())
}

impl NegotiationEngine {
    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The bus this engine publishes session events to.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The shared profile registry.
    pub fn registry(&self) -> &Arc<ProfileRegistry> {
        &self.registry
    }

    /// Drive one negotiation to its terminal event on the current task.
    ///
    /// Every outcome (plan, error, cancellation, deadline) is reported
    /// through the returned [`SessionOutcome`] and the event stream; this
    /// method itself never fails.
    pub async fn negotiate(
        &self,
        requester_id: impl Into<String>,
        raw_demand: impl Into<String>,
    ) -> SessionOutcome {
        self.negotiate_session(NegotiationSession::new(requester_id, raw_demand))
            .await
    }

    /// Like [`negotiate`](NegotiationEngine::negotiate), for a session the
    /// caller constructed (and may already have subscribed to by id). The
    /// session must be freshly created; anything else terminates with an
    /// internal-invariant error.
    pub async fn negotiate_session(&self, session: NegotiationSession) -> SessionOutcome {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.drive_to_outcome(session, cancel_rx).await
    }

    /// Spawn one negotiation onto its own task and return a handle that
    /// can cancel it or await its outcome. The handle's `negotiation_id`
    /// is available immediately, so observers can subscribe before the
    /// first event fires.
    pub fn spawn(
        self: &Arc<Self>,
        requester_id: impl Into<String>,
        raw_demand: impl Into<String>,
    ) -> NegotiationRun {
        self.spawn_session(NegotiationSession::new(requester_id, raw_demand))
    }

    /// Like [`spawn`](NegotiationEngine::spawn), for a caller-constructed
    /// session.
    pub fn spawn_session(self: &Arc<Self>, session: NegotiationSession) -> NegotiationRun {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let negotiation_id = session.id.clone();
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.drive_to_outcome(session, cancel_rx).await });
        NegotiationRun {
            negotiation_id,
            cancel: cancel_tx,
            handle,
        }
    }

    async fn drive_to_outcome(
        &self,
        mut session: NegotiationSession,
        mut cancel: watch::Receiver<bool>,
    ) -> SessionOutcome {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.session_wall_clock_ms);

        let mut trace = match &self.trace_dir {
            Some(dir) => TraceChain::with_persistence(session.id.clone(), dir).unwrap_or_else(|e| {
                log::error!("trace persistence unavailable for {}: {}", session.id, e);
                TraceChain::new(session.id.clone())
            }),
            None => TraceChain::new(session.id.clone()),
        };

        // Child tasks watch this; it fires on every exit path below, so
        // cancellation and deadlines reach in-flight work even when a
        // child would swallow its own interruption.
        let (children_tx, children_rx) = watch::channel(false);

        let result = self
            .drive(&mut session, &mut trace, &mut cancel, deadline, &children_rx)
            .await;
        let _ = children_tx.send(true);

        let disposition = match &result {
            Ok(()) => SessionDisposition::Completed,
            Err(EngineError::Cancelled) => SessionDisposition::Cancelled,
            Err(e) => SessionDisposition::Error(e.to_string()),
        };

        session.cancelled = matches!(disposition, SessionDisposition::Cancelled);
        if !session.state.is_terminal() {
            session.transition_to(SessionState::Completed);
        }

        let (event_type, data) = match &result {
            Ok(()) => (
                EventType::NegotiationCompleted,
                json!({ "rounds": session.turns.len() }),
            ),
            Err(EngineError::Cancelled) => {
                self.record(&mut trace, TraceKind::Error, json!({ "cause": "cancelled" }));
                (
                    EventType::NegotiationCancelled,
                    json!({ "detail": "cancelled by requester" }),
                )
            }
            Err(e) => {
                self.record(
                    &mut trace,
                    TraceKind::Error,
                    json!({ "cause": e.cause(), "detail": e.to_string() }),
                );
                (
                    EventType::NegotiationError,
                    json!({ "cause": e.cause(), "detail": e.to_string(), "plan": session.plan }),
                )
            }
        };
        self.emit(&mut trace, &session.id, event_type, data).await;
        self.bus.complete(&session.id).await;

        let (offered, timed_out, exited) = session.barrier_counts();
        let summary = OutcomeSummary {
            disposition,
            coordinator_rounds: session
                .turns
                .iter()
                .filter(|t| t.round <= self.config.max_coordinator_rounds)
                .count(),
            offered,
            timed_out,
            exited,
            total_input_tokens: session.usage.input_tokens,
            total_output_tokens: session.usage.output_tokens,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        SessionOutcome {
            session,
            trace,
            summary,
        }
    }

    /// Publish one event and record any subscriber evictions in the trace.
    async fn emit(
        &self,
        trace: &mut TraceChain,
        negotiation_id: &str,
        event_type: EventType,
        data: serde_json::Value,
    ) {
        let report = self
            .bus
            .publish(Event::now(event_type, negotiation_id, data))
            .await;
        for subscriber in report.evicted {
            self.record(
                trace,
                TraceKind::Error,
                json!({ "cause": "subscriber-evicted", "subscriber": subscriber, "at": event_type.as_str() }),
            );
        }
    }

    fn record(&self, trace: &mut TraceChain, kind: TraceKind, payload: serde_json::Value) {
        if let Err(e) = trace.append(kind, payload) {
            log::error!("trace append failed for {}: {}", trace.session_id(), e);
        }
    }

    fn accumulate_usage(session: &mut NegotiationSession, usage: Option<TokenUsage>) {
        if let Some(usage) = usage {
            session.usage.accumulate(&usage);
        }
    }

    /// Transition or fail: an edge missing from the lifecycle DAG is a bug.
    fn advance(session: &mut NegotiationSession, next: SessionState) -> Result<(), EngineError> {
        if !session.transition_to(next) {
            return Err(EngineError::Internal(format!(
                "illegal transition {:?} -> {:?} in session {}",
                session.state, next, session.id
            )));
        }
        Ok(())
    }

    async fn drive(
        &self,
        session: &mut NegotiationSession,
        trace: &mut TraceChain,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
        children: &watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        // ── Formulation ──────────────────────────────────────────────
        Self::advance(session, SessionState::Formulating)?;
        let formulated = guarded(
            cancel,
            deadline,
            self.formulation.formulate(
                &self.central,
                FormulationContext {
                    raw_demand: &session.raw_demand,
                    requester_id: &session.requester_id,
                },
            ),
        )
        .await?
        .map_err(|e| fatal_skill_error("formulation", e))?;
        Self::accumulate_usage(session, self.central.last_usage().await);

        session.formulated = Some(formulated.clone());
        Self::advance(session, SessionState::Formulated)?;
        let demand_json = serde_json::to_value(&formulated)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        self.record(trace, TraceKind::Formulated, demand_json.clone());
        self.emit(trace, &session.id, EventType::FormulationReady, demand_json)
            .await;

        // ── Encoding + resonance ─────────────────────────────────────
        Self::advance(session, SessionState::Encoding)?;
        let mut profiles = self.registry.all().await;
        profiles.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let mut texts: Vec<String> = resonance::demand_view_texts(&formulated).to_vec();
        for profile in &profiles {
            texts.extend(resonance::profile_view_texts(profile));
        }
        let vectors = guarded(cancel, deadline, self.encoder.encode_batch(&texts))
            .await?
            .map_err(|e| EngineError::Model(format!("encoder: {}", e)))?;
        if vectors.len() != texts.len() {
            return Err(EngineError::Internal(format!(
                "encoder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }

        let mut vectors = vectors.into_iter();
        let encoded_demand = EncodedDemand {
            intent: vectors.next().unwrap_or_default(),
            constraints: vectors.next().unwrap_or_default(),
            combined: vectors.next().unwrap_or_default(),
        };
        let encoded_profiles: Vec<EncodedProfile> = profiles
            .iter()
            .map(|profile| EncodedProfile {
                agent_id: profile.agent_id.clone(),
                capabilities: vectors.next().unwrap_or_default(),
                context: vectors.next().unwrap_or_default(),
            })
            .collect();

        let ranked = resonance::rank(&encoded_demand, &encoded_profiles);
        let selected = resonance::select(
            ranked,
            self.config.selection_threshold,
            self.config.selection_top_k,
        );

        let by_id: HashMap<&str, &AgentProfile> = profiles
            .iter()
            .map(|p| (p.agent_id.as_str(), p))
            .collect();
        session.participants = selected
            .iter()
            .map(|m| AgentParticipant {
                agent_id: m.agent_id.clone(),
                display_name: by_id
                    .get(m.agent_id.as_str())
                    .map(|p| p.display_name.clone())
                    .unwrap_or_else(|| m.agent_id.clone()),
                score: m.score,
                state: ParticipantState::Pending,
                confidence: None,
            })
            .collect();
        session.touch();

        let roster: Vec<serde_json::Value> = session
            .participants
            .iter()
            .map(|p| json!({ "agent_id": p.agent_id, "display_name": p.display_name, "score": p.score }))
            .collect();
        self.record(
            trace,
            TraceKind::ResonanceComputed,
            json!({ "selected": roster.clone(), "candidates": selected }),
        );
        self.emit(
            trace,
            &session.id,
            EventType::ResonanceActivated,
            serde_json::Value::Array(roster),
        )
        .await;

        // ── Offer fan-out ────────────────────────────────────────────
        Self::advance(session, SessionState::Offering)?;
        let per_offer = Duration::from_millis(self.config.per_offer_timeout_ms);
        let mut pending: FuturesUnordered<JoinHandle<(usize, OfferSettled)>> =
            FuturesUnordered::new();
        for (index, participant) in session.participants.iter().enumerate() {
            let Some(profile) = by_id.get(participant.agent_id.as_str()).map(|p| (*p).clone())
            else {
                continue;
            };
            let channel = Arc::clone(&self.agent_channel);
            let offer_skill = Arc::clone(&self.offer);
            let demand = formulated.clone();
            let mut child_cancel = children.clone();
            pending.push(tokio::spawn(async move {
                let work = async {
                    let solicited = tokio::time::timeout(
                        per_offer,
                        offer_skill.solicit(
                            &channel,
                            OfferContext {
                                demand: &demand,
                                profile: &profile,
                            },
                        ),
                    )
                    .await;
                    match solicited {
                        Ok(Ok(outcome)) => {
                            let usage = channel.last_usage().await;
                            OfferSettled::Offered(outcome, usage)
                        }
                        Ok(Err(err)) => OfferSettled::Exited(err.to_string()),
                        Err(_) => OfferSettled::TimedOut,
                    }
                };
                let interrupted = async {
                    if child_cancel.wait_for(|flag| *flag).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                };
                let settled = tokio::select! {
                    biased;
                    _ = interrupted => OfferSettled::Cancelled,
                    settled = work => settled,
                };
                (index, settled)
            }));
        }

        while let Some(joined) = guarded(cancel, deadline, pending.next()).await? {
            let (index, settled) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("offer task join error in {}: {}", session.id, e);
                    continue;
                }
            };
            let agent_id = match session.participants.get(index) {
                Some(p) => p.agent_id.clone(),
                None => continue,
            };
            match settled {
                OfferSettled::Offered(outcome, usage) => {
                    Self::accumulate_usage(session, usage);
                    let offer = Offer {
                        agent_id: agent_id.clone(),
                        text: outcome.offer_text,
                        confidence: outcome.confidence,
                        declined: outcome.declined,
                        capabilities: outcome.capabilities,
                        constraints: outcome.constraints,
                        received_at: Utc::now(),
                    };
                    if let Some(p) = session.participant_mut(&agent_id) {
                        p.state = ParticipantState::Offered;
                        p.confidence = Some(offer.confidence);
                    }
                    let data = json!({
                        "agent_id": offer.agent_id,
                        "text": offer.text,
                        "confidence": offer.confidence,
                        "declined": offer.declined,
                    });
                    session.offers.push(offer);
                    session.touch();
                    self.record(trace, TraceKind::OfferReceived, data.clone());
                    self.emit(trace, &session.id, EventType::OfferReceived, data)
                        .await;
                }
                OfferSettled::TimedOut => {
                    log::warn!("offer from {} timed out in {}", agent_id, session.id);
                    if let Some(p) = session.participant_mut(&agent_id) {
                        p.state = ParticipantState::TimedOut;
                    }
                }
                OfferSettled::Exited(reason) => {
                    log::warn!("agent {} exited {}: {}", agent_id, session.id, reason);
                    if let Some(p) = session.participant_mut(&agent_id) {
                        p.state = ParticipantState::Exited;
                    }
                }
                OfferSettled::Cancelled => return Err(EngineError::Cancelled),
            }
        }

        // A join error above leaves its participant pending; close it out
        // so the barrier accounting stays exact.
        for p in &mut session.participants {
            if p.state == ParticipantState::Pending {
                p.state = ParticipantState::Exited;
            }
        }

        // ── Barrier ──────────────────────────────────────────────────
        Self::advance(session, SessionState::BarrierWaiting)?;
        let (offered, timed_out, exited) = session.barrier_counts();
        self.emit(
            trace,
            &session.id,
            EventType::BarrierComplete,
            json!({ "offered": offered, "timed_out": timed_out, "exited": exited }),
        )
        .await;

        // ── Coordinator loop ─────────────────────────────────────────
        Self::advance(session, SessionState::Synthesising)?;
        let plan = self
            .coordinator_loop(session, trace, &formulated, cancel, deadline)
            .await?;

        session.plan = Some(plan.clone());
        session.touch();
        let plan_json =
            serde_json::to_value(&plan).map_err(|e| EngineError::Internal(e.to_string()))?;
        self.record(trace, TraceKind::PlanEmitted, plan_json.clone());
        self.emit(trace, &session.id, EventType::PlanReady, plan_json)
            .await;
        Ok(())
    }

    async fn coordinator_loop(
        &self,
        session: &mut NegotiationSession,
        trace: &mut TraceChain,
        demand: &FormulatedDemand,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<NegotiationPlan, EngineError> {
        let max_rounds = self.config.max_coordinator_rounds.max(1);

        // An empty participant set is never hidden behind deliberation
        // rounds: the coordinator is sent straight to its closing call.
        if !session.participants.is_empty() {
            for round in 1..=max_rounds {
                let tool_set = if round == 1 {
                    ToolSet::Full
                } else {
                    ToolSet::Restricted
                };
                let deliberated = guarded(
                    cancel,
                    deadline,
                    self.coordinator.deliberate(
                        &self.central,
                        CoordinatorContext {
                            demand,
                            participants: &session.participants,
                            offers: &session.offers,
                            history: &session.turns,
                            round,
                            tool_set,
                        },
                    ),
                )
                .await?;

                match deliberated {
                    Err(err) => {
                        // A failed round consumes budget; the loop continues.
                        log::warn!("coordinator round {} failed in {}: {}", round, session.id, err);
                        session.turns.push(CoordinatorTurn {
                            round,
                            reasoning: format!("(round {} failed: {})", round, err),
                            invocations: vec![],
                            results: vec![],
                        });
                        session.touch();
                        self.record(
                            trace,
                            TraceKind::CoordinatorRound,
                            json!({ "round": round, "error": err.to_string() }),
                        );
                    }
                    Ok(deliberation) => {
                        Self::accumulate_usage(session, deliberation.usage);
                        match deliberation.decision {
                            CoordinatorDecision::Plan { reasoning, plan } => {
                                self.close_planning_turn(session, trace, round, reasoning, &plan)
                                    .await;
                                return Ok(plan);
                            }
                            CoordinatorDecision::Continue {
                                reasoning,
                                invocations,
                            } => {
                                let mut results = Vec::with_capacity(invocations.len());
                                let mut discovery_done = false;
                                for invocation in &invocations {
                                    let outcome = self
                                        .dispatch_tool(
                                            session,
                                            trace,
                                            demand,
                                            invocation,
                                            tool_set,
                                            round,
                                            &mut discovery_done,
                                            cancel,
                                            deadline,
                                        )
                                        .await?;
                                    results.push(outcome);
                                }
                                self.record(
                                    trace,
                                    TraceKind::CoordinatorRound,
                                    json!({
                                        "round": round,
                                        "tool_calls": invocations.iter().map(|i| i.name.clone()).collect::<Vec<_>>(),
                                    }),
                                );
                                session.turns.push(CoordinatorTurn {
                                    round,
                                    reasoning,
                                    invocations,
                                    results,
                                });
                                session.touch();
                            }
                        }
                    }
                }
            }
        }

        // Budget exhausted (or no participants): force one closing call
        // restricted to output_plan.
        let closing_round = session.turns.last().map(|t| t.round + 1).unwrap_or(1);
        let deliberated = guarded(
            cancel,
            deadline,
            self.coordinator.deliberate(
                &self.central,
                CoordinatorContext {
                    demand,
                    participants: &session.participants,
                    offers: &session.offers,
                    history: &session.turns,
                    round: closing_round,
                    tool_set: ToolSet::FinalOnly,
                },
            ),
        )
        .await?;

        match deliberated {
            Ok(deliberation) => {
                Self::accumulate_usage(session, deliberation.usage);
                if let CoordinatorDecision::Plan { reasoning, plan } = deliberation.decision {
                    self.close_planning_turn(session, trace, closing_round, reasoning, &plan)
                        .await;
                    return Ok(plan);
                }
                log::warn!(
                    "forced closing call in {} produced no plan",
                    session.id
                );
            }
            Err(err) => {
                log::warn!("forced closing call failed in {}: {}", session.id, err);
            }
        }

        // The model would not comply even under the output_plan-only set.
        // Leave a synthesised error plan on the session and fail.
        session.plan = Some(Self::synthesise_error_plan(session));
        session.touch();
        self.record(
            trace,
            TraceKind::CoordinatorRound,
            json!({ "round": closing_round, "error": "closing call produced no plan" }),
        );
        Err(EngineError::Contract(
            "coordinator round budget exhausted without a plan".to_string(),
        ))
    }

    /// Record the turn that carried `output_plan` and emit its tool event.
    async fn close_planning_turn(
        &self,
        session: &mut NegotiationSession,
        trace: &mut TraceChain,
        round: usize,
        reasoning: String,
        plan: &NegotiationPlan,
    ) {
        let arguments = json!({ "plan": plan });
        self.emit(
            trace,
            &session.id,
            EventType::CenterToolCall,
            json!({
                "round": round,
                "tool_name": TOOL_OUTPUT_PLAN,
                "arguments": arguments,
                "result_summary": "plan emitted",
            }),
        )
        .await;
        self.record(
            trace,
            TraceKind::CoordinatorRound,
            json!({ "round": round, "tool_calls": [TOOL_OUTPUT_PLAN] }),
        );
        session.turns.push(CoordinatorTurn {
            round,
            reasoning,
            invocations: vec![ToolInvocation {
                name: TOOL_OUTPUT_PLAN.to_string(),
                arguments,
            }],
            results: vec![ToolOutcome {
                tool_name: TOOL_OUTPUT_PLAN.to_string(),
                summary: "plan emitted".to_string(),
                payload: json!({ "accepted": true }),
                is_error: false,
            }],
        });
        session.touch();
    }

    fn synthesise_error_plan(session: &NegotiationSession) -> NegotiationPlan {
        let next_steps = session
            .offers
            .iter()
            .filter(|o| !o.declined)
            .map(|o| format!("review the standing offer from {}", o.agent_id))
            .collect();
        NegotiationPlan {
            summary: "The coordinator exhausted its round budget without emitting a plan. \
                      This record preserves the negotiation state at closure."
                .to_string(),
            assignments: vec![],
            next_steps,
            open_questions: vec!["how should the requester's demand be satisfied?".to_string()],
        }
    }

    /// Execute one tool invocation against the engine's local handlers.
    ///
    /// Tool-level failures (unknown tool, invalid arguments, unknown agent,
    /// per-call timeout) become error-flagged [`ToolOutcome`]s and the loop
    /// continues; only cancellation and the session deadline abort.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool(
        &self,
        session: &mut NegotiationSession,
        trace: &mut TraceChain,
        demand: &FormulatedDemand,
        invocation: &ToolInvocation,
        tool_set: ToolSet,
        round: usize,
        discovery_done: &mut bool,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<ToolOutcome, EngineError> {
        let outcome = if !tool_set.allows(&invocation.name) {
            let known = [
                TOOL_ASK_AGENT,
                TOOL_START_DISCOVERY,
                TOOL_RECURSE_ON_GAP,
                TOOL_REQUEST_USER_CLARIFICATION,
                TOOL_OUTPUT_PLAN,
            ]
            .contains(&invocation.name.as_str());
            Self::tool_error(
                &invocation.name,
                if known {
                    format!("tool {} is not available this round", invocation.name)
                } else {
                    format!("unknown tool: {}", invocation.name)
                },
            )
        } else {
            match invocation.name.as_str() {
                TOOL_ASK_AGENT => {
                    self.handle_ask_agent(session, demand, &invocation.arguments, cancel, deadline)
                        .await?
                }
                TOOL_START_DISCOVERY => {
                    self.handle_start_discovery(
                        session,
                        &invocation.arguments,
                        discovery_done,
                        cancel,
                        deadline,
                    )
                    .await?
                }
                TOOL_RECURSE_ON_GAP => {
                    self.handle_recurse_on_gap(session, &invocation.arguments, cancel, deadline)
                        .await?
                }
                TOOL_REQUEST_USER_CLARIFICATION => {
                    Self::handle_clarification(&invocation.arguments)
                }
                TOOL_OUTPUT_PLAN => Self::tool_error(
                    TOOL_OUTPUT_PLAN,
                    "output_plan must terminate the turn; it is not dispatchable".to_string(),
                ),
                other => Self::tool_error(other, format!("unknown tool: {}", other)),
            }
        };

        self.emit(
            trace,
            &session.id,
            EventType::CenterToolCall,
            json!({
                "round": round,
                "tool_name": invocation.name,
                "arguments": invocation.arguments,
                "result_summary": outcome.summary,
            }),
        )
        .await;
        Ok(outcome)
    }

    fn tool_error(name: &str, message: String) -> ToolOutcome {
        ToolOutcome {
            tool_name: name.to_string(),
            summary: format!("tool-error: {}", message),
            payload: json!({ "error": message }),
            is_error: true,
        }
    }

    async fn handle_ask_agent(
        &self,
        session: &NegotiationSession,
        demand: &FormulatedDemand,
        arguments: &serde_json::Value,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<ToolOutcome, EngineError> {
        let question = string_arg(arguments, "question").unwrap_or("").trim();
        if question.is_empty() {
            // An empty question is a no-op, not an error: observable but
            // never dispatched.
            return Ok(ToolOutcome {
                tool_name: TOOL_ASK_AGENT.to_string(),
                summary: "no-op: empty question".to_string(),
                payload: json!({ "note": "empty question; not dispatched" }),
                is_error: false,
            });
        }
        let agent_id = string_arg(arguments, "agent_id").unwrap_or("").trim().to_string();
        if session.participant(&agent_id).is_none() {
            return Ok(Self::tool_error(
                TOOL_ASK_AGENT,
                format!("unknown agent: {}", agent_id),
            ));
        }

        let prompt = format!(
            "Regarding the demand \"{}\", the coordinator asks: {}",
            demand.intent, question
        );
        let messages = [ChatMessage::user(prompt)];
        let asked = guarded(
            cancel,
            deadline,
            tokio::time::timeout(
                Duration::from_millis(self.config.per_offer_timeout_ms),
                self.agent_channel.chat(&agent_id, &messages),
            ),
        )
        .await?;

        Ok(match asked {
            Ok(Ok(answer)) => ToolOutcome {
                tool_name: TOOL_ASK_AGENT.to_string(),
                summary: format!("{} answered", agent_id),
                payload: json!({ "agent_id": agent_id, "answer": answer }),
                is_error: false,
            },
            Ok(Err(err)) => Self::tool_error(
                TOOL_ASK_AGENT,
                format!("agent {} unavailable: {}", agent_id, err),
            ),
            Err(_) => Self::tool_error(
                TOOL_ASK_AGENT,
                format!("agent {} timed out", agent_id),
            ),
        })
    }

    async fn handle_start_discovery(
        &self,
        session: &mut NegotiationSession,
        arguments: &serde_json::Value,
        discovery_done: &mut bool,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<ToolOutcome, EngineError> {
        if *discovery_done {
            return Ok(Self::tool_error(
                TOOL_START_DISCOVERY,
                "a sub-negotiation is already running for this session".to_string(),
            ));
        }
        let topic = string_arg(arguments, "topic").unwrap_or("").trim().to_string();
        if topic.is_empty() {
            return Ok(Self::tool_error(
                TOOL_START_DISCOVERY,
                "topic must not be empty".to_string(),
            ));
        }
        let ids: Vec<String> = arguments
            .get("participant_ids")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(Self::tool_error(
                TOOL_START_DISCOVERY,
                "participant_ids must name at least one selected participant".to_string(),
            ));
        }
        let unknown: Vec<&String> = ids
            .iter()
            .filter(|id| session.participant(id).is_none())
            .collect();
        if !unknown.is_empty() {
            return Ok(Self::tool_error(
                TOOL_START_DISCOVERY,
                format!(
                    "participants not selected for this session: {}",
                    unknown
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            ));
        }

        *discovery_done = true;
        let subset: Vec<AgentParticipant> = session
            .participants
            .iter()
            .filter(|p| ids.contains(&p.agent_id))
            .cloned()
            .collect();
        let subset_offers: Vec<Offer> = session
            .offers
            .iter()
            .filter(|o| ids.contains(&o.agent_id))
            .cloned()
            .collect();

        let discovered = guarded(
            cancel,
            deadline,
            self.sub_negotiation.discover(
                &self.central,
                SubNegotiationContext {
                    topic: &topic,
                    participants: &subset,
                    offers: &subset_offers,
                },
            ),
        )
        .await?;
        Self::accumulate_usage(session, self.central.last_usage().await);

        Ok(match discovered {
            Ok(finding) => ToolOutcome {
                tool_name: TOOL_START_DISCOVERY.to_string(),
                summary: format!(
                    "discovery on \"{}\": {} agreement(s), {} disagreement(s)",
                    finding.topic,
                    finding.agreements.len(),
                    finding.disagreements.len()
                ),
                payload: serde_json::to_value(&finding).unwrap_or_else(|_| json!({})),
                is_error: false,
            },
            Err(err) => Self::tool_error(
                TOOL_START_DISCOVERY,
                format!("sub-negotiation failed: {}", err),
            ),
        })
    }

    async fn handle_recurse_on_gap(
        &self,
        session: &mut NegotiationSession,
        arguments: &serde_json::Value,
        cancel: &mut watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<ToolOutcome, EngineError> {
        let description = string_arg(arguments, "description").unwrap_or("").trim().to_string();
        if description.is_empty() {
            return Ok(Self::tool_error(
                TOOL_RECURSE_ON_GAP,
                "description must not be empty".to_string(),
            ));
        }
        if session.recursion_depth >= self.config.recursion_max_depth {
            return Ok(Self::tool_error(
                TOOL_RECURSE_ON_GAP,
                format!(
                    "recursion depth {} exhausted",
                    self.config.recursion_max_depth
                ),
            ));
        }
        session.recursion_depth += 1;

        let formulated = guarded(
            cancel,
            deadline,
            self.formulation.formulate(
                &self.central,
                FormulationContext {
                    raw_demand: &description,
                    requester_id: &session.requester_id,
                },
            ),
        )
        .await?;
        Self::accumulate_usage(session, self.central.last_usage().await);

        Ok(match formulated {
            Ok(mini_demand) => ToolOutcome {
                tool_name: TOOL_RECURSE_ON_GAP.to_string(),
                summary: format!("gap formulated: {}", mini_demand.intent),
                payload: serde_json::to_value(&mini_demand).unwrap_or_else(|_| json!({})),
                is_error: false,
            },
            Err(err) => Self::tool_error(
                TOOL_RECURSE_ON_GAP,
                format!("mini-formulation failed: {}", err),
            ),
        })
    }

    fn handle_clarification(arguments: &serde_json::Value) -> ToolOutcome {
        let question = string_arg(arguments, "question").unwrap_or("").trim().to_string();
        if question.is_empty() {
            return Self::tool_error(
                TOOL_REQUEST_USER_CLARIFICATION,
                "question must not be empty".to_string(),
            );
        }
        ToolOutcome {
            tool_name: TOOL_REQUEST_USER_CLARIFICATION.to_string(),
            summary: "clarification recorded; answer deferred".to_string(),
            payload: json!({ "question": question, "status": "pending" }),
            is_error: false,
        }
    }
}
