//! Agent invocation.
//!
//! An invocation turns (agent, conversation, query) into exactly one AI
//! message. Structural problems (unknown or inactive agent) are returned as
//! errors and produce nothing. Anything that goes wrong after the agent
//! snapshot is taken becomes a Failed message instead.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use confab_core::agent::Agent;
use confab_core::conversation::Conversation;
use confab_core::ids::{AgentId, OrganizationId};
use confab_core::message::{AiUsage, DelegationTrace, Message, MessageStatus, Sender};
use confab_core::provider::{
    ContextBlock, ContextSource, DelegationRequest, GeneratedReply, GenerationRequest,
    ReplyGenerator,
};

use crate::agents::AgentDirectory;
use crate::context::ContextSources;
use crate::conversation::{ConversationManager, InvocationPermit};
use crate::error::EngineError;

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub invocation_timeout: Duration,
    /// Recent messages included as conversation history. Zero disables it.
    pub history_window: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(60),
            history_window: 20,
        }
    }
}

/// Running totals across every generator call of one invocation.
#[derive(Default)]
struct Tally {
    tokens: u64,
    cost: f64,
    delegations: Vec<DelegationTrace>,
}

impl Tally {
    fn add(&mut self, reply: &GeneratedReply) {
        self.tokens += reply.tokens;
        self.cost += reply.cost;
    }
}

pub struct AgentPool {
    directory: Arc<AgentDirectory>,
    conversations: Arc<ConversationManager>,
    sources: ContextSources,
    generator: Arc<dyn ReplyGenerator>,
    config: PoolConfig,
}

impl AgentPool {
    pub fn new(
        directory: Arc<AgentDirectory>,
        conversations: Arc<ConversationManager>,
        sources: ContextSources,
        generator: Arc<dyn ReplyGenerator>,
        config: PoolConfig,
    ) -> Self {
        Self {
            directory,
            conversations,
            sources,
            generator,
            config,
        }
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    /// Invoke one agent and append its reply.
    pub async fn invoke(
        &self,
        permit: &InvocationPermit,
        agent_id: &AgentId,
        query: &str,
    ) -> Result<Message, EngineError> {
        let agent = self.snapshot(permit.conversation(), agent_id)?;
        self.run(permit, agent, query).await
    }

    /// Invoke several agents concurrently. Every agent is validated before
    /// any work starts; replies are returned in completion order.
    pub async fn invoke_all(
        &self,
        permit: &InvocationPermit,
        agent_ids: &[AgentId],
        query: &str,
    ) -> Result<Vec<Message>, EngineError> {
        let agents = agent_ids
            .iter()
            .map(|id| self.snapshot(permit.conversation(), id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut in_flight: FuturesUnordered<_> = agents
            .into_iter()
            .map(|agent| self.run(permit, agent, query))
            .collect();

        let mut replies = Vec::with_capacity(agent_ids.len());
        while let Some(result) = in_flight.next().await {
            match result {
                Ok(message) => replies.push(message),
                Err(e) => warn!(
                    conversation_id = %permit.conversation_id(),
                    error = %e,
                    "reply could not be recorded"
                ),
            }
        }
        Ok(replies)
    }

    fn snapshot(&self, conversation: &Conversation, agent_id: &AgentId) -> Result<Arc<Agent>, EngineError> {
        let agent = self.directory.get_active(agent_id)?;
        if agent.organization_id != conversation.organization_id {
            return Err(EngineError::AgentNotFound(agent_id.clone()));
        }
        Ok(agent)
    }

    #[instrument(skip_all, fields(conversation_id = %permit.conversation_id(), agent_id = %agent.id))]
    async fn run(
        &self,
        permit: &InvocationPermit,
        agent: Arc<Agent>,
        query: &str,
    ) -> Result<Message, EngineError> {
        let started = Instant::now();
        let mut tally = Tally::default();
        let timeout = self.config.invocation_timeout;

        let outcome = tokio::time::timeout(
            timeout,
            self.generate(&agent, permit.conversation(), query, &mut tally),
        )
        .await
        .unwrap_or(Err(EngineError::InvocationTimeout(timeout)));

        let (content, status, error) = match outcome {
            Ok(text) => (text, MessageStatus::Sent, None),
            Err(e) => {
                warn!(agent_id = %agent.id, error = %e, "invocation failed");
                (String::new(), MessageStatus::Failed, Some(e.failure_text()))
            }
        };
        let usage = AiUsage {
            tokens: tally.tokens,
            response_time_ms: started.elapsed().as_millis() as u64,
            cost: tally.cost,
            error,
            delegations: tally.delegations,
        };
        let message = Message::from_agent(
            permit.conversation_id().clone(),
            agent.id.clone(),
            content,
            status,
            usage,
        );
        let message = self.conversations.record_reply(permit, message).await?;
        info!(
            message_id = %message.id,
            status = %message.status,
            tokens = message.tokens(),
            "agent replied"
        );
        Ok(message)
    }

    async fn generate(
        &self,
        agent: &Agent,
        conversation: &Conversation,
        query: &str,
        tally: &mut Tally,
    ) -> Result<String, EngineError> {
        let organization_id = &conversation.organization_id;
        let mut context = self
            .sources
            .resolve(&agent.context_scopes, organization_id)
            .await?;
        if let Some(history) = self.history_block(conversation, query).await? {
            context.push(history);
        }
        let available_specialists = if agent.can_delegate() {
            self.directory.available_specialists(organization_id)?
        } else {
            Vec::new()
        };

        let mut request = GenerationRequest {
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            prompt: agent.effective_prompt(),
            context,
            query: query.to_string(),
            available_specialists,
        };
        let reply = self.generator.generate(&request).await?;
        tally.add(&reply);

        let Some(delegation) = reply.delegation else {
            return Ok(reply.text);
        };
        if !agent.can_delegate() {
            warn!(
                agent_id = %agent.id,
                specialist = %delegation.specialist_key,
                "delegation requested by an agent without permission; ignored"
            );
            return Ok(reply.text);
        }

        let mut trace = DelegationTrace {
            specialist_key: delegation.specialist_key.clone(),
            specialist_id: None,
            query: delegation.query.clone(),
            succeeded: false,
            error: None,
        };
        let block = match self.consult(organization_id, &delegation, &mut trace, tally).await {
            Ok(answer) => {
                trace.succeeded = true;
                ContextBlock::specialist(&delegation.specialist_key, answer)
            }
            Err(e) => {
                warn!(specialist = %delegation.specialist_key, error = %e, "delegation failed");
                let note = format!(
                    "The {} specialist could not be consulted: {e}",
                    delegation.specialist_key
                );
                trace.error = Some(e.failure_text());
                ContextBlock::specialist(&delegation.specialist_key, note)
            }
        };
        tally.delegations.push(trace);

        request.context.push(block);
        request.available_specialists.clear();
        let final_reply = self.generator.generate(&request).await?;
        tally.add(&final_reply);
        if final_reply.delegation.is_some() {
            debug!(agent_id = %agent.id, "second delegation request ignored");
        }
        Ok(final_reply.text)
    }

    /// Ask a built-in specialist a narrower question. The specialist gets its
    /// own scoped context, no history, and cannot delegate further.
    async fn consult(
        &self,
        organization_id: &OrganizationId,
        delegation: &DelegationRequest,
        trace: &mut DelegationTrace,
        tally: &mut Tally,
    ) -> Result<String, EngineError> {
        let key = &delegation.specialist_key;
        let specialist = self
            .directory
            .find_specialist(organization_id, key)?
            .ok_or_else(|| EngineError::SpecialistNotFound(key.clone()))?;
        trace.specialist_id = Some(specialist.id.clone());
        if !specialist.is_active {
            return Err(EngineError::SpecialistNotFound(key.clone()));
        }
        if !specialist.can_be_orchestrated() {
            return Err(EngineError::SpecialistNotOrchestrable(key.clone()));
        }

        let context = self
            .sources
            .resolve(&specialist.context_scopes, organization_id)
            .await?;
        let request = GenerationRequest {
            agent_id: specialist.id.clone(),
            agent_name: specialist.name.clone(),
            prompt: specialist.effective_prompt(),
            context,
            query: delegation.query.clone(),
            available_specialists: Vec::new(),
        };
        let reply = self.generator.generate(&request).await?;
        tally.add(&reply);

        let attempted = reply.delegation.is_some() || DelegationRequest::extract(&reply.text).1.is_some();
        if attempted {
            return Err(EngineError::DelegationDepthExceeded {
                specialist_key: key.clone(),
            });
        }
        debug!(specialist_id = %specialist.id, tokens = reply.tokens, "specialist answered");
        Ok(reply.text)
    }

    /// Recent sent turns, oldest first. The user turn that triggered this
    /// invocation is already the query, so it is left out.
    async fn history_block(
        &self,
        conversation: &Conversation,
        query: &str,
    ) -> Result<Option<ContextBlock>, EngineError> {
        let window = self.config.history_window;
        if window == 0 {
            return Ok(None);
        }
        let mut messages: Vec<Message> = self
            .conversations
            .messages(&conversation.id, Some(window + 1))
            .await?
            .into_iter()
            .filter(Message::is_sent)
            .collect();
        if let Some(trigger) = messages
            .iter()
            .rposition(|m| matches!(m.sender, Sender::User { .. }) && m.content == query)
        {
            messages.remove(trigger);
        }
        let skip = messages.len().saturating_sub(window);
        let turns: Vec<Value> = messages[skip..]
            .iter()
            .map(|m| json!({"speaker": self.speaker(&m.sender), "content": m.content}))
            .collect();
        if turns.is_empty() {
            return Ok(None);
        }
        Ok(Some(ContextBlock {
            source: ContextSource::History,
            data: Value::Array(turns),
        }))
    }

    fn speaker(&self, sender: &Sender) -> String {
        match sender {
            Sender::User { user_id } => user_id.to_string(),
            Sender::Ai { agent_id } => self
                .directory
                .get(agent_id)
                .map_or_else(|_| agent_id.to_string(), |a| a.name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::NewCustomAgent;
    use crate::context::StaticContextLoader;
    use confab_core::agent::ContextScope;
    use confab_core::conversation::{ConversationMode, ParticipantKind};
    use confab_core::errors::GenerationError;
    use confab_core::ids::UserId;
    use confab_llm::{MockGenerator, MockReply};
    use confab_store::SqliteStore;
    use tokio::sync::broadcast;

    struct Fixture {
        directory: Arc<AgentDirectory>,
        conversations: Arc<ConversationManager>,
        loader: Arc<StaticContextLoader>,
        generator: Arc<MockGenerator>,
        pool: AgentPool,
        conversation: Conversation,
    }

    fn org() -> OrganizationId {
        OrganizationId::from_raw("org_1")
    }

    fn fixture(generator: MockGenerator, config: PoolConfig) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (tx, _) = broadcast::channel(64);
        let directory = Arc::new(AgentDirectory::new(store.clone()));
        let conversations = Arc::new(ConversationManager::new(store, tx));
        let loader = Arc::new(StaticContextLoader::new());
        let generator = Arc::new(generator);
        directory.seed_builtins(&org()).unwrap();
        let pool = AgentPool::new(
            directory.clone(),
            conversations.clone(),
            ContextSources::uniform(loader.clone()),
            generator.clone(),
            config,
        );
        let conversation = conversations
            .create_conversation(org(), UserId::from_raw("user_1"), "Planning", ConversationMode::Free)
            .unwrap();
        Fixture {
            directory,
            conversations,
            loader,
            generator,
            pool,
            conversation,
        }
    }

    impl Fixture {
        fn agent(&self, key: &str) -> Arc<Agent> {
            self.directory.find_specialist(&org(), key).unwrap().unwrap()
        }

        fn custom(&self, name: &str, can_call: bool) -> Arc<Agent> {
            self.directory
                .create_custom(
                    &org(),
                    NewCustomAgent {
                        name: name.into(),
                        prompt: format!("You are {name}."),
                        context_scopes: vec![],
                        can_call_built_in_agents: can_call,
                    },
                )
                .unwrap()
        }

        async fn permit(&self) -> InvocationPermit {
            self.conversations.begin_invocation(&self.conversation.id).await.unwrap()
        }

        async fn say(&self, text: &str) {
            self.conversations
                .append_user_message(&self.conversation.id, UserId::from_raw("user_1"), text, vec![])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn sent_reply_with_scoped_context() {
        let f = fixture(
            MockGenerator::new().script("CFO", vec![MockReply::text("Budget is fine.")]),
            PoolConfig::default(),
        );
        f.loader.set(&org(), ContextScope::Resources, json!({"budget": 1200}));
        let cfo = f.agent("finance");

        let message = f.pool.invoke(&f.permit().await, &cfo.id, "budget?").await.unwrap();
        assert!(message.is_sent());
        assert_eq!(message.content, "Budget is fine.");
        assert_eq!(message.tokens(), 3);

        let call = &f.generator.calls_for("CFO")[0];
        assert_eq!(call.prompt, cfo.effective_prompt());
        assert_eq!(call.context[0], ContextBlock::scope(ContextScope::Resources, json!({"budget": 1200})));
        assert!(call.available_specialists.is_empty());

        let conv = f.conversations.get(&f.conversation.id).await.unwrap();
        assert_eq!(conv.stats.ai_response_count, 1);
        assert_eq!(conv.last_responder.as_ref(), Some(&cfo.id));
    }

    #[tokio::test]
    async fn generation_error_becomes_failed_message() {
        let f = fixture(
            MockGenerator::new().script("CFO", vec![MockReply::Error(GenerationError::ProviderOverloaded)]),
            PoolConfig::default(),
        );
        let cfo = f.agent("finance");
        let message = f.pool.invoke(&f.permit().await, &cfo.id, "q").await.unwrap();

        assert_eq!(message.status, MessageStatus::Failed);
        assert!(message.content.is_empty());
        assert!(message.error().unwrap().starts_with("provider_overloaded"));
        let conv = f.conversations.get(&f.conversation.id).await.unwrap();
        assert_eq!(conv.stats.message_count, 1);
        assert_eq!(conv.stats.ai_response_count, 0);
    }

    #[tokio::test]
    async fn structural_errors_produce_no_message() {
        let f = fixture(MockGenerator::echo(), PoolConfig::default());
        let permit = f.permit().await;

        let missing = f.pool.invoke(&permit, &AgentId::from_raw("agent_x"), "q").await;
        assert!(matches!(missing, Err(EngineError::AgentNotFound(_))));

        let cfo = f.agent("finance");
        f.directory.set_active(&cfo.id, false).unwrap();
        let inactive = f.pool.invoke(&permit, &cfo.id, "q").await;
        assert!(matches!(inactive, Err(EngineError::AgentInactive(_))));

        let messages = f.conversations.messages(&f.conversation.id, None).await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(f.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn agents_from_other_organizations_are_not_found() {
        let f = fixture(MockGenerator::echo(), PoolConfig::default());
        let other = f
            .directory
            .seed_builtins(&OrganizationId::from_raw("org_2"))
            .unwrap();
        let result = f.pool.invoke(&f.permit().await, &other[0].id, "q").await;
        assert!(matches!(result, Err(EngineError::AgentNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_failed_message() {
        let f = fixture(
            MockGenerator::new().script(
                "CFO",
                vec![MockReply::delayed(Duration::from_secs(30), MockReply::text("late"))],
            ),
            PoolConfig {
                invocation_timeout: Duration::from_secs(5),
                history_window: 20,
            },
        );
        let cfo = f.agent("finance");
        let message = f.pool.invoke(&f.permit().await, &cfo.id, "q").await.unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.error(), Some("timeout"));
    }

    #[tokio::test]
    async fn history_is_included_without_the_query_turn() {
        let f = fixture(
            MockGenerator::new().script("CFO", vec![MockReply::text("Noted."), MockReply::text("Ok.")]),
            PoolConfig::default(),
        );
        let cfo = f.agent("finance");
        f.say("What about hiring?").await;
        f.pool.invoke(&f.permit().await, &cfo.id, "What about hiring?").await.unwrap();
        f.say("And the budget?").await;
        f.pool.invoke(&f.permit().await, &cfo.id, "And the budget?").await.unwrap();

        let calls = f.generator.calls_for("CFO");
        assert!(calls[0].context.iter().all(|b| b.source != ContextSource::History));

        let history = calls[1]
            .context
            .iter()
            .find(|b| b.source == ContextSource::History)
            .unwrap();
        assert_eq!(
            history.data,
            json!([
                {"speaker": "user_1", "content": "What about hiring?"},
                {"speaker": "CFO", "content": "Noted."},
            ])
        );
        assert_eq!(calls[1].query, "And the budget?");
    }

    #[tokio::test]
    async fn history_window_counts_prior_turns_only() {
        let config = PoolConfig {
            history_window: 1,
            ..PoolConfig::default()
        };
        let f = fixture(MockGenerator::echo(), config);
        let cfo = f.agent("finance");
        f.say("first").await;
        f.say("second").await;
        f.pool.invoke(&f.permit().await, &cfo.id, "second").await.unwrap();

        let call = &f.generator.calls_for("CFO")[0];
        let history = call
            .context
            .iter()
            .find(|b| b.source == ContextSource::History)
            .unwrap();
        assert_eq!(history.data, json!([{"speaker": "user_1", "content": "first"}]));
    }

    #[tokio::test]
    async fn custom_agent_consults_specialist() {
        let f = fixture(
            MockGenerator::new()
                .script(
                    "Coach",
                    vec![
                        MockReply::delegate("finance", "What is the Q3 budget?"),
                        MockReply::text("Finance says we have room."),
                    ],
                )
                .script("CFO", vec![MockReply::text("Q3 budget is 1.2M.")]),
            PoolConfig::default(),
        );
        let coach = f.custom("Coach", true);
        let cfo = f.agent("finance");

        let message = f.pool.invoke(&f.permit().await, &coach.id, "Can we hire?").await.unwrap();
        assert!(message.is_sent());
        assert_eq!(message.content, "Finance says we have room.");
        assert_eq!(message.sender, Sender::Ai { agent_id: coach.id.clone() });

        let usage = message.usage.unwrap();
        assert_eq!(usage.delegations.len(), 1);
        assert!(usage.delegations[0].succeeded);
        assert_eq!(usage.delegations[0].specialist_id.as_ref(), Some(&cfo.id));
        assert_eq!(usage.tokens, 5 + 4);

        let specialist_call = &f.generator.calls_for("CFO")[0];
        assert_eq!(specialist_call.query, "What is the Q3 budget?");
        assert!(specialist_call.available_specialists.is_empty());

        let coach_calls = f.generator.calls_for("Coach");
        assert!(coach_calls[0].available_specialists.contains(&"finance".to_string()));
        assert!(coach_calls[1].available_specialists.is_empty());
        assert!(coach_calls[1]
            .context
            .contains(&ContextBlock::specialist("finance", "Q3 budget is 1.2M.")));

        // only the outer reply is appended
        let messages = f.conversations.messages(&f.conversation.id, None).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn specialist_cannot_delegate_further() {
        let f = fixture(
            MockGenerator::new()
                .script(
                    "Coach",
                    vec![
                        MockReply::delegate("finance", "Q3?"),
                        MockReply::text("I could not reach finance."),
                    ],
                )
                .script("CFO", vec![MockReply::delegate("people", "headcount?")]),
            PoolConfig::default(),
        );
        let coach = f.custom("Coach", true);

        let message = f.pool.invoke(&f.permit().await, &coach.id, "q").await.unwrap();
        assert!(message.is_sent());
        let trace = &message.usage.unwrap().delegations[0];
        assert!(!trace.succeeded);
        assert!(trace.error.as_deref().unwrap().starts_with("delegation_depth_exceeded"));
        assert!(f.generator.calls_for("CHRO").is_empty());
    }

    #[tokio::test]
    async fn delegation_to_unknown_specialist_degrades() {
        let f = fixture(
            MockGenerator::echo().script("Coach", vec![MockReply::delegate("legal", "contract?")]),
            PoolConfig::default(),
        );
        let coach = f.custom("Coach", true);
        let message = f.pool.invoke(&f.permit().await, &coach.id, "q").await.unwrap();

        assert!(message.is_sent());
        assert!(message.content.contains("legal says: The legal specialist could not be consulted"));
        let trace = &message.usage.unwrap().delegations[0];
        assert!(trace.specialist_id.is_none());
        assert!(trace.error.as_deref().unwrap().starts_with("specialist_not_found"));
    }

    #[tokio::test]
    async fn directive_without_permission_is_ignored() {
        let f = fixture(
            MockGenerator::new().script(
                "Loner",
                vec![MockReply::Delegate {
                    text: "I'll answer myself.".into(),
                    specialist_key: "finance".into(),
                    query: "q".into(),
                }],
            ),
            PoolConfig::default(),
        );
        let loner = f.custom("Loner", false);
        let message = f.pool.invoke(&f.permit().await, &loner.id, "q").await.unwrap();
        assert_eq!(message.content, "I'll answer myself.");
        assert!(message.usage.unwrap().delegations.is_empty());
        assert!(f.generator.calls_for("CFO").is_empty());
    }

    #[tokio::test]
    async fn invoke_all_in_completion_order() {
        let f = fixture(
            MockGenerator::new()
                .script(
                    "CFO",
                    vec![MockReply::delayed(Duration::from_millis(50), MockReply::text("slow"))],
                )
                .script("CHRO", vec![MockReply::text("fast")]),
            PoolConfig::default(),
        );
        let cfo = f.agent("finance");
        let chro = f.agent("people");
        for agent in [&cfo, &chro] {
            f.conversations
                .add_participant(&f.conversation.id, ParticipantKind::Agent { agent_id: agent.id.clone() })
                .await
                .unwrap();
        }

        let replies = f
            .pool
            .invoke_all(&f.permit().await, &[cfo.id.clone(), chro.id.clone()], "q")
            .await
            .unwrap();
        let contents: Vec<_> = replies.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["fast", "slow"]);

        let stored = f.conversations.messages(&f.conversation.id, None).await.unwrap();
        assert_eq!(stored[0].content, "fast");
        assert_eq!(stored[1].content, "slow");
    }

    #[tokio::test]
    async fn invoke_all_validates_before_starting() {
        let f = fixture(MockGenerator::echo(), PoolConfig::default());
        let cfo = f.agent("finance");
        let result = f
            .pool
            .invoke_all(&f.permit().await, &[cfo.id.clone(), AgentId::from_raw("agent_x")], "q")
            .await;
        assert!(matches!(result, Err(EngineError::AgentNotFound(_))));
        assert_eq!(f.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn snapshot_taken_at_start() {
        let f = fixture(
            MockGenerator::new().script(
                "Coach",
                vec![MockReply::delayed(Duration::from_millis(20), MockReply::text("done"))],
            ),
            PoolConfig::default(),
        );
        let coach = f.custom("Coach", false);
        let permit = f.permit().await;
        let invoke = f.pool.invoke(&permit, &coach.id, "q");
        let edit = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            f.directory.update_custom_prompt(&coach.id, "changed".into()).unwrap();
        };
        let (message, ()) = tokio::join!(invoke, edit);
        assert!(message.unwrap().is_sent());
        assert_eq!(f.generator.calls_for("Coach")[0].prompt, "You are Coach.");
    }
}
