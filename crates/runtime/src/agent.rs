//! The agent loop: retrieval, model calls, and tool dispatch over one
//! transcript.

use std::path::Path;

use storage::{Event, EventKind, EventStore, Role, SessionId};
use tracing::{debug, info, warn};

use crate::host::Hosted;
use crate::model::{Model, ModelError};
use crate::provider::{Connector, ProviderState, ToolDescriptor};
use crate::registry::ProviderRegistry;
use crate::retrieval::{IndexSummary, NoRetrieval, Retriever};
use crate::transcript::{ToolCallRequest, Transcript, Turn};
use crate::{Error, Result};

/// Upper bound on model rounds that request tools within one chat.
pub const DEFAULT_MAX_ROUNDS: usize = 10;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to external tools. \
When a tool can answer the question or do the work, call it instead of describing what you would do. \
Answer from the tool results and the provided context.";

/// Where the loop currently is. Only meaningful for observation; the loop
/// itself is driven by [`Agent::chat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Retrieving,
    ModelCall,
    DispatchingTools,
    Done,
    Failed,
}

struct Journal {
    store: EventStore,
    session: SessionId,
}

impl Journal {
    fn append(&self, kind: EventKind) {
        let name = kind.name();
        if let Err(e) = self.store.append(&Event::new(self.session, kind)) {
            warn!(session = %self.session, kind = name, error = %e, "journal write failed");
        }
    }

    fn record(&self, turn: &Turn) {
        if let Some(content) = turn.content.as_deref().filter(|c| !c.is_empty()) {
            match (turn.role, turn.tool_call_id.as_deref()) {
                (Role::Tool, Some(call_id)) => self.append(EventKind::ToolResult {
                    call_id: call_id.to_string(),
                    output: content.to_string(),
                }),
                (role, _) => self.append(EventKind::Message {
                    role,
                    content: content.to_string(),
                }),
            }
        }
        for call in &turn.tool_calls {
            self.append(EventKind::ToolCall {
                call_id: call.id.clone(),
                name: call.tool_name.clone(),
                input: call.arguments.clone(),
            });
        }
    }
}

/// One conversation with a model, a retriever, and a set of tool providers.
///
/// The agent is single-owner: every operation takes `&mut self` or runs to
/// completion before the next one starts. Share it across tasks through an
/// [`AgentHandle`](crate::AgentHandle).
pub struct Agent<M, R = NoRetrieval, C = mcp::ServerConfig> {
    model: M,
    retriever: R,
    registry: ProviderRegistry<C>,
    transcript: Transcript,
    label: Option<String>,
    max_rounds: usize,
    phase: Phase,
    journal: Option<Journal>,
}

impl<M: Model, C: Connector> Agent<M, NoRetrieval, C> {
    pub fn new(model: M, registry: ProviderRegistry<C>) -> Self {
        Self {
            model,
            retriever: NoRetrieval,
            registry,
            transcript: Transcript::new(DEFAULT_SYSTEM_PROMPT),
            label: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            phase: Phase::Idle,
            journal: None,
        }
    }
}

impl<M: Model, R: Retriever, C: Connector> Agent<M, R, C> {
    pub fn with_retriever<R2: Retriever>(self, retriever: R2) -> Agent<M, R2, C> {
        Agent {
            model: self.model,
            retriever,
            registry: self.registry,
            transcript: self.transcript,
            label: self.label,
            max_rounds: self.max_rounds,
            phase: self.phase,
            journal: self.journal,
        }
    }

    /// Replace the system prompt. Only meaningful before the first chat.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.transcript = Transcript::new(prompt);
        self
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Mirror every turn into `store` under a new session.
    pub fn with_journal(mut self, store: EventStore) -> Result<Self> {
        let session = SessionId::new();
        store.append(&Event::new(session, EventKind::SessionStart))?;
        let journal = Journal { store, session };
        for turn in self.transcript.turns() {
            journal.record(turn);
        }
        self.journal = Some(journal);
        Ok(self)
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn registry(&self) -> &ProviderRegistry<C> {
        &self.registry
    }

    pub fn catalog(&self) -> Vec<ToolDescriptor> {
        self.registry.catalog()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.journal.as_ref().map(|j| j.session)
    }

    /// Connect every provider. Returns how many are ready.
    pub async fn setup(&mut self) -> usize {
        let ready = self.registry.connect_all().await;
        let tools: Vec<String> = self.catalog().into_iter().map(|t| t.name).collect();
        info!(ready, tools = ?tools, "agent setup complete");
        ready
    }

    /// Release every provider. The agent can be set up again afterwards.
    pub async fn cleanup(&mut self) {
        self.registry.cleanup().await;
        debug!("agent cleaned up");
    }

    /// Release every provider and end the journal session. Later turns are
    /// no longer journaled.
    pub async fn close(&mut self) {
        self.cleanup().await;
        if let Some(journal) = self.journal.take() {
            journal.append(EventKind::SessionEnd);
        }
    }

    /// Scope retrieval to `label`, or disable it with `None`.
    pub fn update_label(&mut self, label: Option<String>) {
        info!(label = ?label, "knowledge label updated");
        self.label = label;
    }

    pub async fn create_index(&self, dir: &Path, label: &str) -> Result<IndexSummary> {
        Ok(self.retriever.create_index(dir, label).await?)
    }

    pub async fn delete_index(&self, label: &str) -> Result<()> {
        Ok(self.retriever.delete_index(label).await?)
    }

    /// Run one user query to a final answer.
    ///
    /// Tool-level failures become tool turns the model can react to. Model
    /// errors and the round limit abort the chat; turns appended before the
    /// failure stay in the transcript.
    pub async fn chat(&mut self, query: &str) -> Result<String> {
        let outcome = self.run(query).await;
        self.phase = match &outcome {
            Ok(_) => Phase::Done,
            Err(e) => {
                warn!(error = %e, "chat failed");
                Phase::Failed
            }
        };
        outcome
    }

    async fn run(&mut self, query: &str) -> Result<String> {
        self.phase = Phase::Retrieving;
        let context = self
            .retriever
            .retrieve(query, self.label.as_deref())
            .await?;
        self.record(Turn::user(with_context(&context, query)));

        let mut rounds = 0;
        loop {
            self.phase = Phase::ModelCall;
            let catalog = self.registry.catalog();
            let reply = self.model.complete(self.transcript.turns(), &catalog).await?;
            if reply.role != Role::Assistant {
                return Err(ModelError::InvalidResponse(format!(
                    "expected an assistant turn, got {}",
                    reply.role
                ))
                .into());
            }

            if !reply.requests_tools() {
                let answer = reply.text().to_string();
                self.record(reply);
                return Ok(answer);
            }

            if rounds == self.max_rounds {
                return Err(Error::LoopBoundExceeded { rounds });
            }
            rounds += 1;

            self.phase = Phase::DispatchingTools;
            let calls = reply.tool_calls.clone();
            self.record(reply);
            for call in &calls {
                let content = self.dispatch(call).await;
                self.record(Turn::tool(&call.id, content));
            }
        }
    }

    /// Run one tool call and describe the outcome for the model. Never
    /// fails: every error becomes the content of the tool turn.
    async fn dispatch(&self, call: &ToolCallRequest) -> String {
        let tool = call.tool_name.as_str();
        let Some(connection) = self.registry.resolve(tool) else {
            return describe_failure(tool, &Error::ToolNotAvailable(tool.to_string()));
        };

        if connection.state() != ProviderState::Ready {
            if let Err(e) = connection.connect().await {
                return describe_failure(tool, &e);
            }
        }

        debug!(tool, provider = connection.name(), call_id = %call.id, "dispatching tool call");
        match connection.call_tool(tool, call.arguments.clone()).await {
            Ok(output) => output.text(),
            Err(e) if e.is_transport() => {
                warn!(tool, error = %e, "provider channel lost; reconnecting and retrying once");
                self.registry.reconnect_all().await;
                if !connection.is_ready() {
                    if let Err(e) = connection.connect().await {
                        return describe_failure(tool, &e);
                    }
                }
                match connection.call_tool(tool, call.arguments.clone()).await {
                    Ok(output) => output.text(),
                    Err(e) => describe_failure(tool, &e),
                }
            }
            Err(e) => describe_failure(tool, &e),
        }
    }

    fn record(&mut self, turn: Turn) {
        if let Some(journal) = &self.journal {
            journal.record(&turn);
        }
        self.transcript.push(turn);
    }
}

impl<M, R, C> Hosted for Agent<M, R, C>
where
    M: Model + 'static,
    R: Retriever + 'static,
    C: Connector + 'static,
{
    async fn start(&mut self) {
        self.setup().await;
    }

    async fn stop(&mut self) {
        self.close().await;
    }
}

fn with_context(context: &str, query: &str) -> String {
    if context.trim().is_empty() {
        return query.to_string();
    }
    format!(
        "Use the following retrieved context when it helps answer the question.\n\n\
         {context}\n\
         Question: {query}"
    )
}

fn describe_failure(tool: &str, error: &Error) -> String {
    warn!(tool, error = %error, "tool call failed");
    format!("Error: {error}")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::provider::{ProviderConnection, ProviderTimeouts};
    use crate::retrieval::KeywordRetriever;
    use crate::testing::{MockProvider, RecordingRetriever, ScriptedModel, call};
    use serde_json::json;
    use storage::KnowledgeStore;

    fn registry(mocks: &[(&str, &MockProvider)]) -> ProviderRegistry<MockProvider> {
        ProviderRegistry::new(
            mocks
                .iter()
                .map(|(name, mock)| {
                    ProviderConnection::new(*name, (*mock).clone(), ProviderTimeouts::default())
                })
                .collect(),
        )
    }

    async fn agent(
        model: &Arc<ScriptedModel>,
        mocks: &[(&str, &MockProvider)],
    ) -> Agent<Arc<ScriptedModel>, NoRetrieval, MockProvider> {
        let mut agent = Agent::new(model.clone(), registry(mocks));
        agent.setup().await;
        agent
    }

    fn roles(transcript: &Transcript) -> Vec<Role> {
        transcript.turns().iter().map(|t| t.role).collect()
    }

    #[tokio::test]
    async fn answer_without_tools() {
        let model = Arc::new(ScriptedModel::new([Turn::assistant("hello")]));
        let mut agent = agent(&model, &[]).await;

        let answer = agent.chat("hi").await.unwrap();

        assert_eq!(answer, "hello");
        assert_eq!(
            roles(agent.transcript()),
            vec![Role::System, Role::User, Role::Assistant]
        );
        assert_eq!(agent.transcript().turns()[1].text(), "hi");
        assert_eq!(agent.phase(), Phase::Done);
    }

    #[tokio::test]
    async fn routes_each_call_to_its_provider() {
        let a = MockProvider::new(&["search"]);
        let b = MockProvider::new(&["write"]);
        let model = Arc::new(ScriptedModel::new([
            Turn::tool_request(
                None,
                vec![
                    ToolCallRequest::new("c1", "search", json!({ "q": "rust" })),
                    ToolCallRequest::new("c2", "write", json!({ "path": "out.txt" })),
                ],
            ),
            Turn::assistant("done"),
        ]));
        let mut agent = agent(&model, &[("a", &a), ("b", &b)]).await;

        agent.chat("go").await.unwrap();

        assert_eq!(a.calls(), vec!["search"]);
        assert_eq!(b.calls(), vec!["write"]);
        let turns = agent.transcript().turns();
        assert_eq!(turns[3], Turn::tool("c1", r#"search: {"q":"rust"}"#));
        assert_eq!(turns[4], Turn::tool("c2", r#"write: {"path":"out.txt"}"#));
        assert!(agent.transcript().is_balanced());

        let seen = model.seen();
        assert_eq!(seen[0].tools, vec!["search", "write"]);
        assert_eq!(seen[1].transcript.len(), 5);
    }

    #[tokio::test]
    async fn recovers_from_one_transport_failure() {
        let provider = MockProvider::new(&["search"]).failing_next_calls(1);
        let model = Arc::new(ScriptedModel::new([
            call("c1", "search", json!({})),
            Turn::assistant("found it"),
        ]));
        let mut agent = agent(&model, &[("a", &provider)]).await;

        let answer = agent.chat("look").await.unwrap();

        assert_eq!(answer, "found it");
        assert_eq!(provider.handshakes(), 2);
        assert_eq!(provider.calls(), vec!["search"]);
        let tool_turns: Vec<_> = agent
            .transcript()
            .turns()
            .iter()
            .filter(|t| t.role == Role::Tool)
            .collect();
        assert_eq!(tool_turns.len(), 1);
        assert_eq!(tool_turns[0].text(), "search: {}");
    }

    #[tokio::test]
    async fn second_failure_becomes_error_turn() {
        let provider = MockProvider::new(&["search"]).failing_next_calls(2);
        let model = Arc::new(ScriptedModel::new([
            call("c1", "search", json!({})),
            Turn::assistant("sorry"),
        ]));
        let mut agent = agent(&model, &[("a", &provider)]).await;

        agent.chat("look").await.unwrap();

        let tool_turn = &agent.transcript().turns()[3];
        assert_eq!(tool_turn.role, Role::Tool);
        assert!(tool_turn.text().starts_with("Error: lost connection to provider `a`"));
        assert!(agent.transcript().is_balanced());
    }

    #[tokio::test]
    async fn tool_bound_is_enforced() {
        let provider = MockProvider::new(&["spin"]);
        let model = Arc::new(ScriptedModel::looping("spin", json!({})));
        let mut agent = agent(&model, &[("a", &provider)])
            .await
            .with_max_rounds(3);

        let err = agent.chat("forever").await.unwrap_err();

        assert!(matches!(err, Error::LoopBoundExceeded { rounds: 3 }));
        assert_eq!(model.completions(), 4);
        assert_eq!(provider.calls().len(), 3);
        assert_eq!(agent.phase(), Phase::Failed);
        // system, user, then three (request, answer) pairs; the fourth request is dropped.
        assert_eq!(agent.transcript().len(), 2 + 3 * 2);
        assert!(agent.transcript().is_balanced());
    }

    #[tokio::test]
    async fn unknown_tool_gets_an_error_turn() {
        let provider = MockProvider::new(&["search"]);
        let model = Arc::new(ScriptedModel::new([
            call("c1", "teleport", json!({})),
            Turn::assistant("cannot"),
        ]));
        let mut agent = agent(&model, &[("a", &provider)]).await;

        let answer = agent.chat("beam me up").await.unwrap();

        assert_eq!(answer, "cannot");
        assert_eq!(
            agent.transcript().turns()[3],
            Turn::tool("c1", "Error: tool `teleport` is not available")
        );
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn tool_error_is_reported_without_retry() {
        let provider = MockProvider::new(&["broken"]).with_failing_tool("broken");
        let model = Arc::new(ScriptedModel::new([
            call("c1", "broken", json!({})),
            Turn::assistant("it failed"),
        ]));
        let mut agent = agent(&model, &[("a", &provider)]).await;

        agent.chat("try").await.unwrap();

        assert_eq!(
            agent.transcript().turns()[3].text(),
            "Error: tool `broken` failed: broken exploded"
        );
        assert_eq!(provider.handshakes(), 1);
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn model_error_keeps_only_the_user_turn() {
        let model = Arc::new(ScriptedModel::failing("boom"));
        let mut agent = agent(&model, &[]).await;

        let err = agent.chat("hi").await.unwrap_err();

        assert!(matches!(err, Error::ModelCall(ModelError::Api(ref m)) if m == "boom"));
        assert_eq!(roles(agent.transcript()), vec![Role::System, Role::User]);
        assert_eq!(agent.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn unreachable_provider_does_not_block_chat() {
        let up = MockProvider::new(&["search"]);
        let down = MockProvider::new(&["write"]).refusing_connections();
        let model = Arc::new(ScriptedModel::new([
            call("c1", "search", json!({})),
            Turn::assistant("ok"),
        ]));
        let mut agent = agent(&model, &[("down", &down), ("up", &up)]).await;

        assert_eq!(agent.chat("go").await.unwrap(), "ok");
        assert_eq!(model.seen()[0].tools, vec!["search"]);
    }

    #[tokio::test]
    async fn degraded_provider_reconnects_on_next_call() {
        let provider = MockProvider::new(&["search"]);
        let model = Arc::new(ScriptedModel::new([
            call("c1", "search", json!({})),
            Turn::assistant("first"),
            call("c2", "search", json!({})),
            Turn::assistant("second"),
        ]));
        let mut agent = agent(&model, &[("a", &provider)]).await;

        // The call drops and the reconnect is refused: the model gets an
        // error turn and the connection stays degraded.
        provider.fail_next_calls(1);
        provider.set_refusing(true);
        agent.chat("one").await.unwrap();

        let tool_turn = &agent.transcript().turns()[3];
        assert_eq!(tool_turn.tool_call_id.as_deref(), Some("c1"));
        assert!(
            tool_turn.text().starts_with("Error: provider `a` unavailable"),
            "{}",
            tool_turn.text()
        );
        let connection = agent.registry().get("a").unwrap();
        assert_eq!(connection.state(), ProviderState::Degraded);

        provider.set_refusing(false);
        agent.chat("two").await.unwrap();

        assert_eq!(agent.transcript().turns()[7], Turn::tool("c2", "search: {}"));
        assert!(agent.registry().get("a").unwrap().is_ready());
        assert_eq!(provider.handshakes(), 2);
    }

    #[tokio::test]
    async fn labelled_context_is_folded_into_user_turn() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.md"), "The launch code is tangerine.").unwrap();
        let retriever = KeywordRetriever::new(KnowledgeStore::in_memory().unwrap());
        let model = Arc::new(ScriptedModel::new([
            Turn::assistant("tangerine"),
            Turn::assistant("no idea"),
        ]));
        let mut agent = agent(&model, &[]).await.with_retriever(retriever);

        let summary = agent.create_index(dir.path(), "secrets").await.unwrap();
        assert_eq!(summary.chunks, 1);

        agent.update_label(Some("secrets".into()));
        agent.chat("what is the launch code").await.unwrap();
        let prompt = agent.transcript().turns()[1].text().to_string();
        assert!(prompt.contains("## 1:\nThe launch code is tangerine."));
        assert!(prompt.ends_with("Question: what is the launch code"));

        agent.update_label(None);
        agent.chat("what is the launch code").await.unwrap();
        assert_eq!(agent.transcript().turns()[3].text(), "what is the launch code");
    }

    #[tokio::test]
    async fn unknown_label_aborts_before_appending() {
        let retriever = KeywordRetriever::new(KnowledgeStore::in_memory().unwrap());
        let model = Arc::new(ScriptedModel::new([Turn::assistant("unused")]));
        let mut agent = agent(&model, &[])
            .await
            .with_retriever(retriever)
            .with_label(Some("nope".into()));

        let err = agent.chat("q").await.unwrap_err();

        assert!(matches!(err, Error::Retrieval(_)));
        assert_eq!(agent.transcript().len(), 1);
        assert_eq!(model.completions(), 0);
    }

    #[tokio::test]
    async fn transcript_accumulates_across_chats() {
        let provider = MockProvider::new(&["search"]);
        let model = Arc::new(ScriptedModel::new([
            call("c1", "search", json!({})),
            Turn::assistant("one"),
            Turn::assistant("two"),
        ]));
        let mut agent = agent(&model, &[("a", &provider)]).await;

        agent.chat("first").await.unwrap();
        agent.chat("second").await.unwrap();

        assert_eq!(
            roles(agent.transcript()),
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::Tool,
                Role::Assistant,
                Role::User,
                Role::Assistant,
            ]
        );
        assert!(agent.transcript().is_balanced());
        assert_eq!(model.seen()[2].transcript.len(), 6);
    }

    #[tokio::test]
    async fn journal_mirrors_turns() {
        let provider = MockProvider::new(&["search"]);
        let model = Arc::new(ScriptedModel::new([
            call("c1", "search", json!({ "q": 1 })),
            Turn::assistant("done"),
        ]));
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("events.db");
        let mut agent = agent(&model, &[("a", &provider)])
            .await
            .with_journal(EventStore::open(&db).unwrap())
            .unwrap();
        let session = agent.session_id().unwrap();

        agent.chat("go").await.unwrap();
        agent.close().await;

        let kinds: Vec<_> = EventStore::open(&db)
            .unwrap()
            .load_session(session)
            .unwrap()
            .into_iter()
            .map(|e| e.kind.name())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "session_start",
                "message",
                "message",
                "tool_call",
                "tool_result",
                "message",
                "session_end",
            ]
        );
    }

    #[tokio::test]
    async fn call_timeout_counts_as_transport_failure() {
        let provider = MockProvider::new(&["slow"]).with_call_delay(Duration::from_millis(200));
        let connection = ProviderConnection::new(
            "a",
            provider.clone(),
            ProviderTimeouts {
                call: Duration::from_millis(20),
                handshake: Duration::from_secs(5),
            },
        );
        let model = Arc::new(ScriptedModel::new([
            call("c1", "slow", json!({})),
            Turn::assistant("gave up"),
        ]));
        let mut agent = Agent::new(model.clone(), ProviderRegistry::new(vec![connection]));
        agent.setup().await;

        agent.chat("wait").await.unwrap();

        let tool_turn = &agent.transcript().turns()[3];
        assert!(tool_turn.text().starts_with("Error: lost connection"));
        assert_eq!(provider.handshakes(), 2);
    }

    #[tokio::test]
    async fn session_ends_once_across_cleanup_cycles() {
        let model = Arc::new(ScriptedModel::new([
            Turn::assistant("one"),
            Turn::assistant("two"),
        ]));
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("events.db");
        let mut agent = agent(&model, &[])
            .await
            .with_journal(EventStore::open(&db).unwrap())
            .unwrap();
        let session = agent.session_id().unwrap();

        agent.chat("first").await.unwrap();
        agent.cleanup().await;
        agent.setup().await;
        agent.chat("second").await.unwrap();
        agent.close().await;
        agent.close().await;

        let kinds: Vec<_> = EventStore::open(&db)
            .unwrap()
            .load_session(session)
            .unwrap()
            .into_iter()
            .map(|e| e.kind.name())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "session_start",
                "message",
                "message",
                "message",
                "message",
                "message",
                "session_end",
            ]
        );
        assert_eq!(agent.session_id(), None);
    }

    #[tokio::test]
    async fn retriever_sees_query_and_active_label() {
        let retriever = Arc::new(RecordingRetriever::with_context("## 1:\nbackground\n"));
        let model = Arc::new(ScriptedModel::new([
            Turn::assistant("a"),
            Turn::assistant("b"),
        ]));
        let mut agent = agent(&model, &[]).await.with_retriever(retriever.clone());

        agent.chat("hello").await.unwrap();
        agent.update_label(Some("docs".to_string()));
        agent.chat("again").await.unwrap();

        assert_eq!(
            retriever.queries(),
            vec![
                ("hello".to_string(), None),
                ("again".to_string(), Some("docs".to_string())),
            ]
        );
        let turns = agent.transcript().turns();
        assert_eq!(turns[1].text(), "hello");
        assert!(turns[3].text().contains("background"));
        assert!(turns[3].text().ends_with("Question: again"));
    }
}
