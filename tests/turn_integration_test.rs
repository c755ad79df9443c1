//! 单轮执行集成测试（模拟执行环境 + 内存存储）

use std::sync::Arc;
use std::time::Duration;

use deckmind::config::{AppConfig, ContinuityMode};
use deckmind::environment::files::DOCUMENT_FILE;
use deckmind::environment::{
    CommandPurpose, EnvironmentProvider, EnvironmentSpec, MockAgentScript, MockEnvironmentProvider,
    ReferenceFiles, AGENT_FINISHED, AGENT_STARTED,
};
use deckmind::protocol::{split_response, FINAL_CONTENT_SENTINEL};
use deckmind::store::{DocumentSessions, EnvironmentHandle, MemoryKvStore};
use deckmind::turn::{build_executor, TurnExecutor, TurnOutcome, TurnPhase, TurnRequest, TurnSink};

const HELLO: &str = r#"{"type":"assistant","message":{"content":[{"text":"Hello "}]}}"#;
const WORLD: &str = r#"{"type":"assistant","message":{"content":[{"text":"world"}]}}"#;

fn result_line(session_id: &str) -> String {
    format!(r#"{{"type":"result","duration_ms":1500,"session_id":"{}"}}"#, session_id)
}

struct Harness {
    provider: Arc<MockEnvironmentProvider>,
    sessions: DocumentSessions,
    executor: TurnExecutor,
}

fn harness(mode: ContinuityMode, script: MockAgentScript) -> Harness {
    let mut cfg = AppConfig::default();
    cfg.agent.continuity = mode;
    cfg.agent.install_command = None;

    let store = Arc::new(MemoryKvStore::new());
    let provider = Arc::new(MockEnvironmentProvider::new(script));
    let executor = build_executor(
        &cfg,
        store.clone(),
        provider.clone(),
        ReferenceFiles {
            rules: "rules".into(),
            sample: "sample".into(),
        },
    );
    Harness {
        provider,
        sessions: DocumentSessions::new(store),
        executor,
    }
}

impl Harness {
    /// 预先建好环境并写入句柄，模拟上一轮留下的状态
    async fn existing_environment(&self, document_id: &str) -> String {
        let env = self
            .provider
            .create(&EnvironmentSpec {
                vcpus: 2,
                idle_timeout: Duration::from_secs(900),
                runtime: "node22".into(),
            })
            .await
            .unwrap();
        self.sessions
            .save_environment_handle(
                document_id,
                &EnvironmentHandle {
                    environment_id: env.id().to_string(),
                },
                Duration::from_secs(840),
            )
            .await
            .unwrap();
        env.id().to_string()
    }

    async fn turn(&self, document_id: &str, message: &str, content: &str) -> (TurnOutcome, String) {
        let (sink, mut rx) = TurnSink::channel();
        let outcome = self
            .executor
            .run_turn(
                TurnRequest {
                    document_id: document_id.into(),
                    user_message: message.into(),
                    current_content: content.into(),
                },
                sink,
            )
            .await;
        let mut body = String::new();
        while let Some(event) = rx.recv().await {
            body.push_str(&event.encode());
        }
        (outcome, body)
    }

    async fn agent_scripts(&self, environment_id: &str) -> Vec<String> {
        self.provider
            .environment(environment_id)
            .await
            .unwrap()
            .commands()
            .await
            .into_iter()
            .filter(|c| c.purpose == CommandPurpose::Agent)
            .filter_map(|c| c.script().map(str::to_string))
            .collect()
    }

    async fn current_environment(&self, document_id: &str) -> String {
        self.sessions
            .environment_handle(document_id)
            .await
            .unwrap()
            .unwrap()
            .environment_id
    }
}

#[tokio::test]
async fn test_streaming_contract() {
    let h = harness(
        ContinuityMode::Resume,
        MockAgentScript {
            lines: vec![HELLO.into(), WORLD.into(), result_line("sess-1")],
            document_after: Some("# Tides\n---\n# Moon".into()),
            ..Default::default()
        },
    );
    h.existing_environment("deck-1").await;

    let (outcome, body) = h.turn("deck-1", "Make it shorter", "# Old").await;
    assert_eq!(outcome, TurnOutcome::Done);
    assert_eq!(
        body,
        format!("Hello world{}# Tides\n---\n# Moon", FINAL_CONTENT_SENTINEL)
    );
}

#[tokio::test]
async fn test_malformed_line_does_not_break_stream() {
    let h = harness(
        ContinuityMode::Resume,
        MockAgentScript {
            lines: vec![
                HELLO.into(),
                "{not json".into(),
                r#"{"type":"thinking","text":"hmm"}"#.into(),
                WORLD.into(),
                result_line("sess-1"),
            ],
            document_after: Some("# Done".into()),
            ..Default::default()
        },
    );
    h.existing_environment("deck-1").await;

    let (outcome, body) = h.turn("deck-1", "go", "# Old").await;
    assert_eq!(outcome, TurnOutcome::Done);
    let split = split_response(&body);
    assert_eq!(split.narration, "Hello world");
    assert_eq!(split.final_content, Some("# Done"));
}

#[tokio::test]
async fn test_tool_notices_are_streamed_in_order() {
    let h = harness(
        ContinuityMode::Resume,
        MockAgentScript {
            lines: vec![
                HELLO.into(),
                r#"{"type":"tool_call","subtype":"started","tool_call":{"editToolCall":{"args":{"path":"presentation.md"}}}}"#.into(),
                r#"{"type":"tool_call","subtype":"completed","tool_call":{"editToolCall":{"args":{"path":"presentation.md"}}}}"#.into(),
                WORLD.into(),
            ],
            ..Default::default()
        },
    );
    h.existing_environment("deck-1").await;

    let (_, body) = h.turn("deck-1", "go", "# Old").await;
    assert_eq!(
        split_response(&body).narration,
        "Hello \n[Editing presentation.md...]\nworld"
    );
}

#[tokio::test]
async fn test_continuation_token_is_scoped_and_resumed() {
    let h = harness(
        ContinuityMode::Resume,
        MockAgentScript {
            lines: vec![HELLO.into(), result_line("sess-42")],
            document_after: Some("# Deck".into()),
            ..Default::default()
        },
    );

    let (outcome, body) = h.turn("deck-1", "A deck about tides", "").await;
    assert_eq!(outcome, TurnOutcome::Done);
    assert!(body.starts_with("[Creating secure environment...]\n\n[Setting up files...]\n\n"));
    assert_eq!(
        h.sessions.continuation_token("deck-1").await.unwrap().as_deref(),
        Some("sess-42")
    );
    assert_eq!(h.sessions.continuation_token("deck-2").await.unwrap(), None);

    let (outcome, body) = h.turn("deck-1", "Make it shorter", "# Deck").await;
    assert_eq!(outcome, TurnOutcome::Done);
    assert!(body.starts_with("Hello "));

    let env_id = h.current_environment("deck-1").await;
    let scripts = h.agent_scripts(&env_id).await;
    assert_eq!(scripts.len(), 2);
    assert!(scripts[0].contains("<user_request>"));
    assert!(!scripts[0].contains("'--resume'"));
    assert!(scripts[1].ends_with("'--resume' 'sess-42' 'Make it shorter'"));
    assert_eq!(h.provider.created_count(), 1);
}

#[tokio::test]
async fn test_fresh_environment_ignores_stored_token() {
    let h = harness(
        ContinuityMode::Resume,
        MockAgentScript {
            lines: vec![result_line("sess-new")],
            document_after: Some("# Deck".into()),
            ..Default::default()
        },
    );
    h.sessions
        .save_continuation_token("deck-1", "sess-stale", Duration::from_secs(60))
        .await
        .unwrap();

    let (outcome, _) = h.turn("deck-1", "Add a slide", "# Deck").await;
    assert_eq!(outcome, TurnOutcome::Done);
    let env_id = h.current_environment("deck-1").await;
    let scripts = h.agent_scripts(&env_id).await;
    assert!(!scripts[0].contains("sess-stale"));
    assert!(scripts[0].contains("presentation.md"));
    assert_eq!(
        h.sessions.continuation_token("deck-1").await.unwrap().as_deref(),
        Some("sess-new")
    );
}

#[tokio::test]
async fn test_agent_failure_streams_error_and_keeps_token() {
    let h = harness(
        ContinuityMode::Resume,
        MockAgentScript {
            lines: vec![HELLO.into(), result_line("sess-7")],
            exit_code: 1,
            stderr: "rate limited\n".into(),
            ..Default::default()
        },
    );
    h.existing_environment("deck-1").await;

    let (outcome, body) = h.turn("deck-1", "go", "# Old").await;
    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            phase: TurnPhase::InvokeAgent,
            reason: "Agent CLI failed: rate limited".into(),
        }
    );
    assert_eq!(body, "Hello \n\nError: Agent CLI failed: rate limited");
    assert_eq!(split_response(&body).final_content, None);
    assert_eq!(
        h.sessions.continuation_token("deck-1").await.unwrap().as_deref(),
        Some("sess-7")
    );
}

#[tokio::test]
async fn test_environment_creation_failure() {
    let h = harness(ContinuityMode::Resume, MockAgentScript::default());
    h.provider.fail_creation(Some("quota exceeded".into())).await;

    let (outcome, body) = h.turn("deck-1", "go", "").await;
    assert!(matches!(
        outcome,
        TurnOutcome::Failed {
            phase: TurnPhase::ResolveEnv,
            ..
        }
    ));
    assert_eq!(
        body,
        "[Creating secure environment...]\n\n\n\nError: Failed to create environment: quota exceeded"
    );
    assert_eq!(h.sessions.environment_handle("deck-1").await.unwrap(), None);
}

#[tokio::test]
async fn test_document_bytes_survive_sync_and_read_back() {
    let content = "# Costs\n\tPrice: $5 or ${PRICE}\n\tPath C:\\tmp\\new\n```sh\necho `date` \\\n```";
    let h = harness(ContinuityMode::Resume, MockAgentScript::default());
    let env_id = h.existing_environment("deck-1").await;

    let (outcome, body) = h.turn("deck-1", "no changes", content).await;
    assert_eq!(outcome, TurnOutcome::Done);
    assert_eq!(split_response(&body).final_content, Some(content));

    let env = h.provider.environment(&env_id).await.unwrap();
    assert_eq!(env.file(DOCUMENT_FILE).await.as_deref(), Some(content));
    assert_eq!(env.file("RULES.md").await.as_deref(), Some("rules"));
}

#[tokio::test]
async fn test_transcript_mode_replays_history() {
    let h = harness(
        ContinuityMode::Transcript,
        MockAgentScript {
            lines: vec![HELLO.into(), WORLD.into(), result_line("sess-1")],
            document_after: Some("# Deck".into()),
            ..Default::default()
        },
    );

    h.turn("deck-1", "A deck about tides", "").await;
    h.turn("deck-1", "Add a moon slide", "# Deck").await;

    let env_id = h.current_environment("deck-1").await;
    let scripts = h.agent_scripts(&env_id).await;
    assert_eq!(scripts.len(), 2);
    assert!(!scripts[1].contains("'--resume'"));
    assert!(scripts[1].contains("<conversation_history>\nUser: A deck about tides\nAssistant: Hello world\n"));
    assert!(scripts[1].contains("Add a moon slide"));
    assert_eq!(h.sessions.continuation_token("deck-1").await.unwrap(), None);
    assert_eq!(h.sessions.transcript("deck-1").await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_concurrent_turns_for_one_document_are_serialized() {
    let h = harness(
        ContinuityMode::Resume,
        MockAgentScript {
            lines: vec![HELLO.into(), WORLD.into(), result_line("sess-1")],
            document_after: Some("# Deck".into()),
            line_delay: Duration::from_millis(20),
            ..Default::default()
        },
    );

    let (a, b, c) = tokio::join!(
        h.turn("deck-1", "first", ""),
        h.turn("deck-1", "second", ""),
        h.turn("deck-1", "third", "# Deck")
    );
    assert_eq!(a.0, TurnOutcome::Done);
    assert_eq!(b.0, TurnOutcome::Done);
    assert_eq!(c.0, TurnOutcome::Done);
    assert_eq!(h.provider.created_count(), 1);

    // 每次运行都在下一次开始前结束
    let log = h.provider.agent_log().await;
    assert_eq!(log.len(), 6);
    for pair in log.chunks(2) {
        assert_eq!(pair, [AGENT_STARTED, AGENT_FINISHED]);
    }
}

#[tokio::test]
async fn test_turns_for_different_documents_run_concurrently() {
    let h = harness(
        ContinuityMode::Resume,
        MockAgentScript {
            lines: vec![HELLO.into(), WORLD.into(), result_line("sess-1")],
            document_after: Some("# Deck".into()),
            line_delay: Duration::from_millis(20),
            ..Default::default()
        },
    );

    let (a, b) = tokio::join!(
        h.turn("deck-1", "first", ""),
        h.turn("deck-2", "first", "")
    );
    assert_eq!(a.0, TurnOutcome::Done);
    assert_eq!(b.0, TurnOutcome::Done);
    assert_eq!(h.provider.created_count(), 2);
    assert_eq!(h.provider.agent_log().await[..2], [AGENT_STARTED, AGENT_STARTED]);
}
