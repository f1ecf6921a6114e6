//! Per-process agent service.
//!
//! Owns every stateful component of one agent (limiters, queue, memory,
//! consensus coordinator, tool loop) and wires them to the shared channel.
//! [`OrchestratorService::start`] spawns the inbound event loop and the
//! periodic sweep; [`ServiceHandle::stop`] cancels both and flushes memory.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{
    pressure::MemoryProbe, CircuitBreaker, CircuitState, PressureGauge, RateLimiter,
    RequestQueue, SharedRequestQueue,
};
use crate::channel::{
    symbols, AnnotationEvent, ChannelError, ChannelEvent, ChatChannel, InboundMessage,
    MessageHandle,
};
use crate::completion::SharedCompletionClient;
use crate::config::TribunalConfig;
use crate::consensus::{
    CompletionReviewer, ConsensusCoordinator, ConsensusError, ConsensusSettings, PendingSummary,
    ProposalArtifact, ProposalOutcome, ProposalRequest, ProposalReviewer, ProposalSource,
    Verdict, VoteOutcome,
};
use crate::memory::{
    AppendSlot, CompletionSummarizer, ConversationEntry, ConversationStore, Summarizer,
};
use crate::orchestrator::{
    compose_turns, system_prompt, LoopContext, SharedRateLimiter, ToolLoop,
};
use crate::state::{SharedKvStore, SCOPE_STATUS};
use crate::tools::{ToolBackend, ToolKind, ToolRegistry};

/// Max tokens for a peer review verdict.
const REVIEW_MAX_TOKENS: u32 = 128;

/// External collaborators of a service.
pub struct ServiceDeps {
    pub channel: Arc<dyn ChatChannel>,
    pub completion: SharedCompletionClient,
    pub kv: SharedKvStore,
    pub tool_backend: Arc<dyn ToolBackend>,
    /// Defaults to a completion-backed summarizer.
    pub summarizer: Option<Arc<dyn Summarizer>>,
    /// Defaults to a completion-backed reviewer.
    pub reviewer: Option<Arc<dyn ProposalReviewer>>,
    /// Defaults to reading `/proc/self/status`.
    pub memory_probe: Option<MemoryProbe>,
}

impl ServiceDeps {
    pub fn new(
        channel: Arc<dyn ChatChannel>,
        completion: SharedCompletionClient,
        kv: SharedKvStore,
        tool_backend: Arc<dyn ToolBackend>,
    ) -> Self {
        Self {
            channel,
            completion,
            kv,
            tool_backend,
            summarizer: None,
            reviewer: None,
            memory_probe: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn ProposalReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn with_memory_probe(mut self, probe: MemoryProbe) -> Self {
        self.memory_probe = Some(probe);
        self
    }
}

/// What handling one inbound message amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Own message, or not addressed to this agent.
    Ignored,
    /// A peer's proposal; carries the vote cast, if any.
    Reviewed(Option<Verdict>),
    /// Shed by rate limit or backpressure; marked with the busy symbol.
    Busy,
    Replied(MessageHandle),
    /// The tool loop failed; a short notice was posted.
    Failed,
}

/// Admission decision for one inbound message.
///
/// Made synchronously, in arrival order, so that rate windows and the
/// conversation append order follow the order messages were observed.
enum Admission {
    Ignore,
    Review,
    Shed(&'static str),
    Converse { slot: AppendSlot, is_override: bool },
}

/// Status snapshot written to the key/value store on every sweep.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub identity: String,
    pub breaker: CircuitState,
    pub queue_depth: usize,
    pub queue_active: usize,
    pub queue_max_concurrent: usize,
    pub queue_max_queued: usize,
    pub under_pressure: bool,
    pub rss_bytes: Option<u64>,
    pub pending: Vec<PendingSummary>,
    pub updated_at: DateTime<Utc>,
}

/// One agent process.
pub struct OrchestratorService {
    config: TribunalConfig,
    channel: Arc<dyn ChatChannel>,
    kv: SharedKvStore,
    queue: SharedRequestQueue,
    pressure: PressureGauge,
    message_limiter: Mutex<RateLimiter>,
    tool_limiter: SharedRateLimiter,
    memory: ConversationStore,
    coordinator: Arc<ConsensusCoordinator>,
    tool_loop: ToolLoop,
    prompt: String,
}

impl OrchestratorService {
    pub fn new(config: TribunalConfig, deps: ServiceDeps) -> Arc<Self> {
        let identity = config.agent.identity.clone();
        let founder = config.agent.override_identity.clone();

        let breaker = CircuitBreaker::new(
            config.breaker.failure_threshold,
            std::time::Duration::from_secs(config.breaker.cooldown_secs),
        );
        let queue =
            RequestQueue::new(config.queue.max_concurrent, config.queue.max_queued, breaker)
                .shared();
        let mut pressure =
            PressureGauge::new(config.queue.pressure_depth, config.memory.pressure_threshold_mb);
        if let Some(probe) = deps.memory_probe {
            pressure = pressure.with_probe(probe);
        }

        let message_limiter = RateLimiter::new(
            "message",
            config.limits.message_window(),
            config.limits.message_max,
        )
        .with_privileged(founder.clone());
        let tool_limiter = Arc::new(Mutex::new(
            RateLimiter::new("tool", config.limits.tool_window(), config.limits.tool_max)
                .with_privileged(founder),
        ));

        let tools = ToolRegistry::new(deps.tool_backend);
        let summarizer = deps.summarizer.unwrap_or_else(|| {
            Arc::new(CompletionSummarizer::new(
                deps.completion.clone(),
                config.memory.summary_max_tokens,
            ))
        });
        let memory = ConversationStore::new(config.memory.clone(), deps.kv.clone(), summarizer);

        let reviewer = deps.reviewer.unwrap_or_else(|| {
            Arc::new(CompletionReviewer::new(
                identity.clone(),
                deps.completion.clone(),
                queue.clone(),
                REVIEW_MAX_TOKENS,
            ))
        });
        let coordinator = Arc::new(ConsensusCoordinator::new(
            ConsensusSettings::from_config(&config),
            deps.channel.clone(),
            tools.clone(),
            reviewer,
        ));

        let prompt = system_prompt(
            &identity,
            config.agent.role_of(&identity),
            &tools.catalogue_prompt(),
        );
        let tool_loop = ToolLoop::new(
            identity,
            config.agent.roles.clone(),
            deps.completion,
            queue.clone(),
            tools,
            coordinator.clone(),
            tool_limiter.clone(),
            config.completion.max_rounds,
        );

        Arc::new(Self {
            config,
            channel: deps.channel,
            kv: deps.kv,
            queue,
            pressure,
            message_limiter: Mutex::new(message_limiter),
            tool_limiter,
            memory,
            coordinator,
            tool_loop,
            prompt,
        })
    }

    pub fn identity(&self) -> &str {
        &self.config.agent.identity
    }

    pub fn coordinator(&self) -> &Arc<ConsensusCoordinator> {
        &self.coordinator
    }

    pub fn memory(&self) -> &ConversationStore {
        &self.memory
    }

    pub fn queue(&self) -> &SharedRequestQueue {
        &self.queue
    }

    /// Subscribe to the channel and spawn the event loop and the sweep.
    pub fn start(self: &Arc<Self>) -> ServiceHandle {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let rx = self.channel.subscribe();
        tasks.spawn(Arc::clone(self).event_loop(rx, cancel.clone()));
        tasks.spawn(Arc::clone(self).sweep_loop(cancel.clone()));

        info!(identity = %self.identity(), "Agent service started");
        ServiceHandle {
            identity: self.identity().to_string(),
            cancel,
            tasks,
            memory: self.memory.clone(),
        }
    }

    async fn event_loop(
        self: Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                event = rx.recv() => match event {
                    Ok(ChannelEvent::Message(message)) => {
                        let admission = self.admit(&message);
                        let service = Arc::clone(&self);
                        handlers.spawn(async move {
                            service.finish_message(&message, admission).await;
                        });
                    }
                    Ok(event) => {
                        let service = Arc::clone(&self);
                        handlers.spawn(async move { service.handle_event(event).await });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event loop lagged; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        handlers.shutdown().await;
        debug!(identity = %self.identity(), "Event loop stopped");
    }

    async fn sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.consensus.sweep_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// Expire proposals, prune idle rate windows and persist a status snapshot.
    pub async fn sweep(&self) {
        let expired = self.coordinator.sweep_expired().await;
        if !expired.is_empty() {
            debug!(count = expired.len(), "Swept expired proposals");
        }
        let senders = {
            let mut limiter = self.message_limiter();
            limiter.prune_idle();
            limiter.tracked_identities()
        };
        let callers = {
            let mut limiter = self
                .tool_limiter
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            limiter.prune_idle();
            limiter.tracked_identities()
        };
        debug!(senders, callers, "Pruned idle rate windows");
        self.write_status().await;
    }

    pub async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => {
                let admission = self.admit(&message);
                self.finish_message(&message, admission).await;
            }
            ChannelEvent::Annotation(annotation) => {
                let outcome = self.handle_annotation(&annotation).await;
                if outcome != VoteOutcome::Ignored {
                    debug!(id = %annotation.handle.message_id, ?outcome, "Annotation handled");
                }
            }
        }
    }

    pub async fn handle_annotation(&self, event: &AnnotationEvent) -> VoteOutcome {
        self.coordinator.on_annotation(event).await
    }

    pub async fn handle_message(&self, message: &InboundMessage) -> MessageDisposition {
        let admission = self.admit(message);
        self.dispatch(message, admission).await
    }

    async fn finish_message(&self, message: &InboundMessage, admission: Admission) {
        let disposition = self.dispatch(message, admission).await;
        debug!(id = %message.handle.message_id, ?disposition, "Message handled");
    }

    fn admit(&self, message: &InboundMessage) -> Admission {
        if message.author == self.identity() {
            return Admission::Ignore;
        }
        if ProposalArtifact::is_artifact(&message.content) && self.is_peer(&message.author) {
            return Admission::Review;
        }
        if !self.is_addressed(message) {
            return Admission::Ignore;
        }

        let is_override = message.author == self.config.agent.override_identity;
        if !is_override {
            {
                let mut limiter = self.message_limiter();
                if !limiter.allow(&message.author) {
                    return Admission::Shed("message rate limit");
                }
                debug!(
                    author = %message.author,
                    remaining = limiter.remaining(&message.author),
                    "Message admitted"
                );
            }
            if self.pressure.evaluate(&self.queue).under_pressure {
                return Admission::Shed("under pressure");
            }
        }
        Admission::Converse {
            slot: self.memory.reserve(&message.handle.channel_id),
            is_override,
        }
    }

    async fn dispatch(&self, message: &InboundMessage, admission: Admission) -> MessageDisposition {
        match admission {
            Admission::Ignore => MessageDisposition::Ignored,
            Admission::Review => {
                MessageDisposition::Reviewed(self.coordinator.review_proposal(message).await)
            }
            Admission::Shed(reason) => {
                self.mark_busy(message, reason).await;
                MessageDisposition::Busy
            }
            Admission::Converse { slot, is_override } => {
                self.converse(message, slot, is_override).await
            }
        }
    }

    async fn converse(
        &self,
        message: &InboundMessage,
        slot: AppendSlot,
        is_override: bool,
    ) -> MessageDisposition {
        let identity = self.identity();
        let channel_id = &message.handle.channel_id;
        slot.append(ConversationEntry::user(&message.author, &message.content))
            .await;
        let history = self.memory.history(channel_id).await;
        let turns = compose_turns(&self.prompt, &history);
        let ctx = LoopContext {
            caller: message.author.clone(),
            channel_id: channel_id.clone(),
            founder_initiated: is_override,
        };

        match self.tool_loop.run(turns, &ctx).await {
            Ok(reply) => {
                match self.post_to(channel_id, &reply.text).await {
                    Ok(handle) => {
                        self.memory
                            .append(channel_id, ConversationEntry::assistant(identity, &reply.text))
                            .await;
                        info!(
                            channel = %channel_id,
                            rounds = reply.rounds,
                            tool_calls = reply.calls.len(),
                            "Replied"
                        );
                        MessageDisposition::Replied(handle)
                    }
                    Err(e) => {
                        warn!(channel = %channel_id, error = %e, "Failed to post reply");
                        MessageDisposition::Failed
                    }
                }
            }
            Err(e) if e.is_capacity() => {
                self.mark_busy(message, "completion capacity").await;
                MessageDisposition::Busy
            }
            Err(e) => {
                warn!(channel = %channel_id, error = %e, "Tool loop failed");
                let notice = format!(
                    "⚠️ @{} I couldn't finish that request. Please try again later.",
                    message.author
                );
                if let Err(e) = self.post_to(channel_id, &notice).await {
                    warn!(error = %e, "Failed to post failure notice");
                }
                MessageDisposition::Failed
            }
        }
    }

    /// Put an approval request from outside the roster to the vote.
    ///
    /// External requests stay open for the external TTL rather than the
    /// organic one.
    pub async fn request_approval(
        &self,
        tool: ToolKind,
        args: &str,
        rationale: &str,
        origin_channel: &str,
    ) -> Result<ProposalOutcome, ConsensusError> {
        self.coordinator
            .propose(ProposalRequest {
                tool,
                args: args.to_string(),
                rationale: rationale.to_string(),
                origin_channel: origin_channel.to_string(),
                source: ProposalSource::External,
                founder_initiated: false,
            })
            .await
    }

    pub fn status(&self) -> ServiceStatus {
        let report = self.pressure.evaluate(&self.queue);
        ServiceStatus {
            identity: self.identity().to_string(),
            breaker: report.breaker,
            queue_depth: report.queue_depth,
            queue_active: self.queue.active(),
            queue_max_concurrent: self.queue.max_concurrent(),
            queue_max_queued: self.queue.max_queued(),
            under_pressure: report.under_pressure,
            rss_bytes: report.rss_bytes,
            pending: self.coordinator.pending(),
            updated_at: Utc::now(),
        }
    }

    async fn write_status(&self) {
        let status = self.status();
        let json = match serde_json::to_string(&status) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize status");
                return;
            }
        };
        if let Err(e) = self.kv.set(SCOPE_STATUS, self.identity(), &json).await {
            warn!(error = %e, "Failed to persist status");
        }
    }

    fn is_addressed(&self, message: &InboundMessage) -> bool {
        let identity = self.identity();
        if message.mentions(identity) {
            return true;
        }
        // Peers only get answers when they ask by name; otherwise agents
        // sharing a listen channel would answer each other forever.
        !self.is_peer(&message.author)
            && message.handle.channel_id != self.config.agent.proposal_channel
            && self
                .config
                .agent
                .listen_channels
                .iter()
                .any(|c| c == &message.handle.channel_id)
    }

    /// Another member of the roster.
    fn is_peer(&self, author: &str) -> bool {
        author != self.identity() && self.config.agent.roster.iter().any(|a| a == author)
    }

    async fn post_to(&self, channel_id: &str, text: &str) -> Result<MessageHandle, ChannelError> {
        let channel = self.channel.fetch(channel_id).await?;
        self.channel.post(&channel, text).await
    }

    async fn mark_busy(&self, message: &InboundMessage, reason: &'static str) {
        debug!(author = %message.author, reason, "Shedding message");
        if let Err(e) = self.channel.annotate(&message.handle, symbols::BUSY).await {
            warn!(error = %e, "Failed to mark message busy");
        }
    }

    fn message_limiter(&self) -> MutexGuard<'_, RateLimiter> {
        self.message_limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Running tasks of a started service.
pub struct ServiceHandle {
    identity: String,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    memory: ConversationStore,
}

impl ServiceHandle {
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Cancel the event loop and sweep, then flush conversation memory.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(identity = %self.identity, error = %e, "Service task ended abnormally");
            }
        }
        let flushed = self.memory.flush_now().await;
        info!(identity = %self.identity, flushed, "Agent service stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::{LocalChannel, LocalChannelHub};
    use crate::completion::{CompletionError, ScriptedCompletionClient};
    use crate::consensus::StaticReviewer;
    use crate::memory::MockSummarizer;
    use crate::state::{KvStore, MemoryKvStore};
    use crate::tools::RecordingBackend;

    const ADDR: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    struct Fixture {
        hub: Arc<LocalChannelHub>,
        client: Arc<ScriptedCompletionClient>,
        kv: Arc<MemoryKvStore>,
        backend: RecordingBackend,
        service: Arc<OrchestratorService>,
    }

    /// Delays the first read it serves, like a cold disk.
    struct SlowFirstLoad {
        inner: Arc<MemoryKvStore>,
        loaded_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl KvStore for SlowFirstLoad {
        async fn get(&self, scope: &str, key: &str) -> crate::state::KvResult<Option<String>> {
            if !self
                .loaded_once
                .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.get(scope, key).await
        }

        async fn set(&self, scope: &str, key: &str, value: &str) -> crate::state::KvResult<()> {
            self.inner.set(scope, key, value).await
        }
    }

    fn fixture_with(config: TribunalConfig, probe: MemoryProbe) -> Fixture {
        build_fixture(config, probe, false)
    }

    fn build_fixture(config: TribunalConfig, probe: MemoryProbe, slow_first_load: bool) -> Fixture {
        let hub = LocalChannelHub::new();
        let client = Arc::new(ScriptedCompletionClient::new().with_fallback("noted"));
        let kv = Arc::new(MemoryKvStore::new());
        let store: SharedKvStore = if slow_first_load {
            Arc::new(SlowFirstLoad {
                inner: kv.clone(),
                loaded_once: Default::default(),
            })
        } else {
            kv.clone()
        };
        let backend = RecordingBackend::new();
        let deps = ServiceDeps::new(
            Arc::new(hub.channel_for(&config.agent.identity)),
            client.clone(),
            store,
            Arc::new(backend.clone()),
        )
        .with_summarizer(Arc::new(MockSummarizer::new()))
        .with_reviewer(Arc::new(StaticReviewer(Some(Verdict::Approve))))
        .with_memory_probe(probe);
        Fixture {
            hub,
            client,
            kv,
            backend,
            service: OrchestratorService::new(config, deps),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(TribunalConfig::default(), || None)
    }

    async fn say(channel: &LocalChannel, channel_id: &str, text: &str) -> InboundMessage {
        let handle = channel.fetch(channel_id).await.unwrap();
        let posted = channel.post(&handle, text).await.unwrap();
        channel
            .hub()
            .messages_in(channel_id)
            .into_iter()
            .find(|m| m.handle == posted)
            .unwrap()
    }

    #[tokio::test]
    async fn test_mention_gets_reply_and_is_remembered() {
        let f = fixture();
        f.client.push_reply("hello founder");
        let founder = f.hub.channel_for("founder");
        let message = say(&founder, "general", "@arbiter hi there").await;

        let disposition = f.service.handle_message(&message).await;
        assert!(matches!(disposition, MessageDisposition::Replied(_)));

        let general = f.hub.messages_in("general");
        assert_eq!(general.last().unwrap().content, "hello founder");
        assert_eq!(general.last().unwrap().author, "arbiter");

        let history = f.service.memory().history("general").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].identity_label, "founder");
        assert_eq!(history[1].text, "hello founder");
    }

    #[tokio::test]
    async fn test_unaddressed_and_own_messages_are_ignored() {
        let f = fixture();
        let founder = f.hub.channel_for("founder");
        let message = say(&founder, "general", "just thinking aloud").await;
        assert_eq!(
            f.service.handle_message(&message).await,
            MessageDisposition::Ignored
        );

        let own = say(&f.hub.channel_for("arbiter"), "general", "@arbiter echo").await;
        assert_eq!(
            f.service.handle_message(&own).await,
            MessageDisposition::Ignored
        );
        assert!(f.client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_listen_channel_ignores_unmentioning_peers() {
        let mut config = TribunalConfig::default();
        config.agent.listen_channels = vec!["lobby".to_string()];
        let f = fixture_with(config, || None);

        let visitor = say(&f.hub.channel_for("alice"), "lobby", "anyone around?").await;
        assert!(matches!(
            f.service.handle_message(&visitor).await,
            MessageDisposition::Replied(_)
        ));

        let peer = say(&f.hub.channel_for("sentinel"), "lobby", "status is green").await;
        assert_eq!(
            f.service.handle_message(&peer).await,
            MessageDisposition::Ignored
        );
    }

    #[tokio::test]
    async fn test_rate_limited_sender_is_marked_busy() {
        let mut config = TribunalConfig::default();
        config.limits.message_max = 1;
        let f = fixture_with(config, || None);
        let alice = f.hub.channel_for("alice");

        let first = say(&alice, "general", "@arbiter one").await;
        assert!(matches!(
            f.service.handle_message(&first).await,
            MessageDisposition::Replied(_)
        ));
        let second = say(&alice, "general", "@arbiter two").await;
        assert_eq!(
            f.service.handle_message(&second).await,
            MessageDisposition::Busy
        );
        let marks = f.hub.annotations_on(&second.handle);
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].symbol, symbols::BUSY);

        // The override identity is never limited.
        let founder = f.hub.channel_for("founder");
        for text in ["@arbiter a", "@arbiter b", "@arbiter c"] {
            let message = say(&founder, "general", text).await;
            assert!(matches!(
                f.service.handle_message(&message).await,
                MessageDisposition::Replied(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_memory_pressure_sheds_all_but_override() {
        let f = fixture_with(TribunalConfig::default(), || Some(u64::MAX));
        let status = f.service.status();
        assert!(status.under_pressure);
        assert_eq!(status.queue_max_concurrent, 1);
        assert_eq!(status.queue_max_queued, 5);

        let alice = say(&f.hub.channel_for("alice"), "general", "@arbiter hi").await;
        assert_eq!(
            f.service.handle_message(&alice).await,
            MessageDisposition::Busy
        );
        assert!(f.client.requests().is_empty());

        let founder = say(&f.hub.channel_for("founder"), "general", "@arbiter hi").await;
        assert!(matches!(
            f.service.handle_message(&founder).await,
            MessageDisposition::Replied(_)
        ));
    }

    #[tokio::test]
    async fn test_upstream_failure_posts_notice() {
        let f = fixture();
        f.client.push_error(CompletionError::Request("refused".into()));
        let message = say(&f.hub.channel_for("founder"), "general", "@arbiter hi").await;

        assert_eq!(
            f.service.handle_message(&message).await,
            MessageDisposition::Failed
        );
        let last = f.hub.messages_in("general").pop().unwrap();
        assert!(last.content.contains("couldn't finish"));
        assert!(last.mentions.contains(&"founder".to_string()));
    }

    #[tokio::test]
    async fn test_tool_reply_executes_read_tool() {
        let f = fixture();
        f.client.push_reply(format!("TOOL: check_balance {ADDR}"));
        f.client.push_reply("The balance is 12.");
        let message = say(&f.hub.channel_for("founder"), "general", "@arbiter balance?").await;

        assert!(matches!(
            f.service.handle_message(&message).await,
            MessageDisposition::Replied(_)
        ));
        assert_eq!(f.backend.count(ToolKind::CheckBalance), 1);
        assert_eq!(
            f.hub.messages_in("general").pop().unwrap().content,
            "The balance is 12."
        );
    }

    #[tokio::test]
    async fn test_peer_proposal_is_reviewed() {
        let f = fixture();
        let artifact = ProposalArtifact {
            tool: ToolKind::Transfer,
            args: format!("{ADDR} 3"),
            rationale: "refund".into(),
            proposer: "sentinel".into(),
            origin_channel: "general".into(),
            source: ProposalSource::Organic,
            founder_initiated: false,
        };
        let message = say(&f.hub.channel_for("sentinel"), "proposals", &artifact.render()).await;

        assert_eq!(
            f.service.handle_message(&message).await,
            MessageDisposition::Reviewed(Some(Verdict::Approve))
        );
        assert_eq!(f.hub.annotations_on(&message.handle).len(), 1);
    }

    fn outsider_artifact(n: usize) -> ProposalArtifact {
        ProposalArtifact {
            tool: ToolKind::Transfer,
            args: format!("{ADDR} {n}"),
            rationale: "trust me".into(),
            proposer: "mallory".into(),
            origin_channel: "random".into(),
            source: ProposalSource::Organic,
            founder_initiated: false,
        }
    }

    #[tokio::test]
    async fn test_outsider_artifacts_are_not_reviewed() {
        let mut config = TribunalConfig::default();
        config.limits.message_max = 1;
        let f = fixture_with(config, || None);
        let mallory = f.hub.channel_for("mallory");

        for n in 0..5 {
            let message = say(&mallory, "random", &outsider_artifact(n).render()).await;
            assert_eq!(
                f.service.handle_message(&message).await,
                MessageDisposition::Ignored
            );
            assert!(f.hub.annotations_on(&message.handle).is_empty());
        }
        assert!(f.client.requests().is_empty());
    }

    #[tokio::test]
    async fn test_outsider_artifacts_in_listen_channel_are_rate_limited() {
        let mut config = TribunalConfig::default();
        config.limits.message_max = 1;
        config.agent.listen_channels = vec!["random".to_string()];
        let f = fixture_with(config, || None);
        let mallory = f.hub.channel_for("mallory");

        let first = say(&mallory, "random", &outsider_artifact(1).render()).await;
        assert!(matches!(
            f.service.handle_message(&first).await,
            MessageDisposition::Replied(_)
        ));
        assert!(f.hub.annotations_on(&first.handle).is_empty());

        let second = say(&mallory, "random", &outsider_artifact(2).render()).await;
        assert_eq!(
            f.service.handle_message(&second).await,
            MessageDisposition::Busy
        );
        let marks = f.hub.annotations_on(&second.handle);
        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].symbol, symbols::BUSY);
    }

    #[tokio::test]
    async fn test_request_approval_opens_external_proposal() {
        let f = fixture();
        let outcome = f
            .service
            .request_approval(ToolKind::Transfer, &format!("{ADDR} 9"), "grant", "general")
            .await
            .unwrap();
        assert!(matches!(outcome, ProposalOutcome::Pending { .. }));

        let pending = f.service.coordinator().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source, ProposalSource::External);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_service_replies_and_flushes_on_stop() {
        let f = fixture();
        f.client.push_reply("on it");
        let handle = f.service.start();
        assert!(handle.is_running());
        tokio::time::sleep(Duration::from_millis(10)).await;

        say(&f.hub.channel_for("founder"), "general", "@arbiter ping").await;
        for _ in 0..50 {
            if f.hub.messages_in("general").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.hub.messages_in("general")[1].content, "on it");

        handle.stop().await;
        assert!(f.kv.get(SCOPE_STATUS, "arbiter").await.unwrap().is_some());
        assert!(f
            .kv
            .get(crate::state::SCOPE_CONVERSATIONS, "general")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_messages_are_remembered_in_arrival_order() {
        let f = build_fixture(TribunalConfig::default(), || None, true);
        let handle = f.service.start();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let founder = f.hub.channel_for("founder");
        say(&founder, "general", "@arbiter first").await;
        say(&founder, "general", "@arbiter second").await;
        for _ in 0..100 {
            if f.hub.messages_in("general").len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let asked: Vec<String> = f
            .service
            .memory()
            .history("general")
            .await
            .into_iter()
            .filter(|e| e.identity_label == "founder")
            .map(|e| e.text)
            .collect();
        assert_eq!(asked, vec!["@arbiter first", "@arbiter second"]);
        handle.stop().await;
    }
}
