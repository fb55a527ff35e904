use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use parley::engine::{EngineSettings, SubmissionEngine, SubmitOutcome};
use parley::failover::KeyRing;
use parley::history_pruning::TokenBudget;
use parley::i18n::Catalog;
use parley::session::GenerationSession;
use parley::store::{ChatStore, MemoryPersistence};
use parley::transport::{CompletionApi, CompletionRequest, ResponseBody};
use parley::types::*;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

enum Script {
    Chunks(Vec<String>),
    /// Sends these chunks, then never finishes.
    Hang(Vec<String>),
    Fail(fn() -> ParleyError),
    Once(serde_json::Value),
}

#[derive(Default)]
struct FakeApi {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeApi {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: CompletionRequest) -> Script {
        self.requests.lock().unwrap().push(request);
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no scripted response left")
    }
}

impl CompletionApi for FakeApi {
    fn complete_once(
        &self,
        request: CompletionRequest,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let script = self.next(request);
        Box::pin(async move {
            match script {
                Script::Once(v) => Ok(v),
                Script::Fail(make) => Err(make().into()),
                _ => panic!("streaming script used for a single-shot call"),
            }
        })
    }

    fn open_stream(
        &self,
        request: CompletionRequest,
        _cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<ResponseBody>> {
        let script = self.next(request);
        Box::pin(async move {
            match script {
                Script::Chunks(chunks) => Ok(ResponseBody::from_chunks(chunks)),
                Script::Hang(chunks) => {
                    let items: Vec<Result<Bytes>> =
                        chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
                    let stream = futures_util::stream::iter(items).chain(futures_util::stream::pending());
                    Ok(ResponseBody::new(Box::pin(stream)))
                }
                Script::Fail(make) => Err(make().into()),
                Script::Once(_) => panic!("single-shot script used for a stream"),
            }
        })
    }
}

fn sse(deltas: &[&str]) -> Vec<String> {
    let mut chunks: Vec<String> = deltas
        .iter()
        .map(|d| format!("data: {}\n\n", json!({"choices": [{"delta": {"content": d}}]})))
        .collect();
    chunks.push("data: [DONE]\n\n".to_string());
    chunks
}

struct Harness {
    engine: SubmissionEngine,
    store: Arc<ChatStore>,
    session: Arc<GenerationSession>,
    keys: Arc<KeyRing>,
    api: Arc<FakeApi>,
}

fn harness(scripts: Vec<Script>, settings: EngineSettings, keys: &str) -> Harness {
    let mut chat = Chat::with_system_message(ChatConfig::default(), "Be brief.");
    chat.messages.push(Message::text(Role::User, "What is 2+2?"));

    let store = Arc::new(ChatStore::new(
        vec![chat],
        Arc::new(MemoryPersistence::new()),
        Arc::new(Catalog::english()),
    ));
    let session = Arc::new(GenerationSession::new());
    let keys = Arc::new(KeyRing::from_raw(keys));
    let api = FakeApi::new(scripts);

    let engine = SubmissionEngine::new(
        store.clone(),
        session.clone(),
        keys.clone(),
        api.clone(),
        Arc::new(Catalog::english()),
        settings,
    );
    Harness {
        engine,
        store,
        session,
        keys,
        api,
    }
}

fn auto_check_settings(stream_first: bool) -> EngineSettings {
    EngineSettings {
        endpoint: "http://upstream.test/v1/chat/completions".into(),
        auto_check: true,
        stream_first,
        checker_config: ChatConfig {
            model: "checker-model".into(),
            ..ChatConfig::default()
        },
        ..EngineSettings::default()
    }
}

async fn last_text(store: &ChatStore) -> String {
    let chats = store.snapshot().await;
    chats[0]
        .last_message()
        .map(|m| m.text_parts().collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_single_stage_streams_into_placeholder() {
    let h = harness(vec![Script::Chunks(sse(&["He", "l", "lo"]))], EngineSettings::default(), "sk-test");
    let mut rx = h.store.subscribe();

    let outcome = h.engine.submit().await;

    assert_eq!(outcome, SubmitOutcome::Completed);
    assert_eq!(last_text(&h.store).await, "Hello");
    assert!(!h.session.is_generating());
    assert!(h.session.abort_token().is_none());
    assert_eq!(h.session.error(), "");

    let mut deltas = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AppEvent::Delta { text, .. } = event {
            deltas.push(text);
        }
    }
    assert_eq!(deltas, vec!["He", "l", "lo"]);

    let requests = h.api.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].credential.as_deref(), Some("sk-test"));
    // The placeholder is never sent upstream.
    assert_eq!(requests[0].messages.len(), 2);
    assert_eq!(requests[0].messages[1].role, Role::User);
}

#[tokio::test]
async fn test_empty_stage_one_skips_checker() {
    for stage_one in [vec![], vec!["   "], vec!["\n", "\t"]] {
        let h = harness(
            vec![Script::Chunks(sse(&stage_one))],
            auto_check_settings(false),
            "",
        );
        let outcome = h.engine.submit().await;
        assert_eq!(outcome, SubmitOutcome::Completed);
        assert_eq!(h.api.requests().len(), 1, "checker must not run");
    }
}

#[tokio::test]
async fn test_checker_receives_stage_one_answer() {
    let h = harness(
        vec![
            Script::Chunks(sse(&["It is ", "5"])),
            Script::Chunks(sse(&["It is ", "4"])),
        ],
        auto_check_settings(false),
        "",
    );
    let mut rx = h.store.subscribe();

    let outcome = h.engine.submit().await;
    assert_eq!(outcome, SubmitOutcome::Completed);
    assert_eq!(last_text(&h.store).await, "It is 4");

    let requests = h.api.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].config.model, ChatConfig::default().model);
    assert_eq!(requests[1].config.model, "checker-model");
    assert_eq!(requests[1].messages.len(), 1);
    assert_eq!(requests[1].messages[0].role, Role::User);
    assert_eq!(
        requests[1].messages[0].text_parts().collect::<String>(),
        "The user asked: What is 2+2?\nThe LLM answered: It is 5\nIs everything correct? Improve the answer."
    );

    let mut deltas = Vec::new();
    let mut cleared = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            AppEvent::Delta { text, .. } => deltas.push(text),
            AppEvent::StageCleared { .. } => cleared = true,
            _ => {}
        }
    }
    assert!(cleared);
    // Stage 1 stays hidden without stream_first.
    assert_eq!(deltas, vec!["It is ", "4"]);
}

#[tokio::test]
async fn test_stream_first_shows_stage_one_then_clears() {
    let h = harness(
        vec![
            Script::Chunks(sse(&["draft"])),
            Script::Chunks(sse(&["final"])),
        ],
        auto_check_settings(true),
        "",
    );
    let mut rx = h.store.subscribe();

    assert_eq!(h.engine.submit().await, SubmitOutcome::Completed);
    assert_eq!(last_text(&h.store).await, "final");

    let mut order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            AppEvent::Delta { text, .. } => order.push(text),
            AppEvent::StageCleared { .. } => order.push("<cleared>".into()),
            _ => {}
        }
    }
    assert_eq!(order, vec!["draft", "<cleared>", "final"]);
}

#[tokio::test]
async fn test_custom_template_placeholders() {
    let mut settings = auto_check_settings(false);
    settings.checker_template = Some("Q={user-request} A={first-llm-response}".into());
    let h = harness(
        vec![Script::Chunks(sse(&["5"])), Script::Chunks(sse(&["4"]))],
        settings,
        "",
    );

    h.engine.submit().await;
    let requests = h.api.requests();
    assert_eq!(
        requests[1].messages[0].text_parts().collect::<String>(),
        "Q=What is 2+2? A=5"
    );
}

struct NothingFits;

impl TokenBudget for NothingFits {
    fn trim(&self, _messages: &[Message], _max_tokens: u32, _model: &str) -> Vec<Message> {
        Vec::new()
    }
}

#[tokio::test]
async fn test_budget_error_is_recorded_without_network() {
    let h = harness(vec![], EngineSettings::default(), "sk-test");
    let engine = h.engine.with_budget(Arc::new(NothingFits));

    let outcome = engine.submit().await;

    assert_eq!(
        outcome,
        SubmitOutcome::Failed("Message exceeds max token!".into())
    );
    assert_eq!(h.session.error(), "Message exceeds max token!");
    assert!(h.api.requests().is_empty());
    assert!(!h.session.is_generating());
}

#[tokio::test]
async fn test_auto_check_errors_are_prefixed() {
    let h = harness(
        vec![Script::Fail(|| ParleyError::EndpointAccess {
            status: reqwest::StatusCode::NOT_FOUND,
            body: "nope".into(),
            model_not_found: false,
        })],
        auto_check_settings(false),
        "",
    );

    let outcome = h.engine.submit().await;
    let expected = "[Auto-Check Error]: Invalid API endpoint! We recommend you to check your API endpoint.";
    assert_eq!(outcome, SubmitOutcome::Failed(expected.into()));
    assert_eq!(h.session.error(), expected);
}

#[tokio::test]
async fn test_missing_key_for_default_endpoint() {
    let h = harness(vec![], EngineSettings::default(), "");
    let outcome = h.engine.submit().await;
    match outcome {
        SubmitOutcome::Failed(msg) => assert!(msg.starts_with("No API key supplied")),
        other => panic!("Unexpected outcome: {:?}", other),
    }
    assert!(h.api.requests().is_empty());
}

#[tokio::test]
async fn test_submit_rejected_while_generating() {
    let h = harness(vec![], EngineSettings::default(), "sk-test");
    let _held = h.session.try_begin().unwrap();
    let before = h.store.snapshot().await;

    assert_eq!(h.engine.submit().await, SubmitOutcome::Rejected);
    assert_eq!(h.store.snapshot().await, before);
    assert!(h.api.requests().is_empty());
    assert!(h.session.is_generating());
}

#[tokio::test]
async fn test_cancel_mid_stream() {
    let h = harness(vec![Script::Hang(vec![sse(&["Hel"]).remove(0)])], EngineSettings::default(), "sk-test");
    let mut rx = h.store.subscribe();

    let canceller = async {
        while let Ok(event) = rx.recv().await {
            if let AppEvent::Delta { .. } = event {
                h.engine.cancel();
                break;
            }
        }
    };

    let (outcome, _) = tokio::join!(h.engine.submit(), canceller);

    assert_eq!(outcome, SubmitOutcome::Cancelled);
    assert_eq!(last_text(&h.store).await, "Hel");
    assert!(!h.session.is_generating());
    assert_eq!(h.session.error(), "");
}

#[tokio::test]
async fn test_key_failover_inside_submit() {
    let h = harness(
        vec![
            Script::Fail(|| ParleyError::RateLimited {
                status: reqwest::StatusCode::TOO_MANY_REQUESTS,
                body: "slow down".into(),
                insufficient_quota: false,
            }),
            Script::Chunks(sse(&["ok"])),
        ],
        EngineSettings::default(),
        "first,second",
    );

    assert_eq!(h.engine.submit().await, SubmitOutcome::Completed);
    assert_eq!(h.keys.active_index(), 1);
    let creds: Vec<_> = h
        .api
        .requests()
        .into_iter()
        .map(|r| r.credential.unwrap_or_default())
        .collect();
    assert_eq!(creds, vec!["first", "second"]);
}

#[tokio::test]
async fn test_generate_title_uses_title_model() {
    let settings = EngineSettings {
        title_model: Some("title-model".into()),
        ..EngineSettings::default()
    };
    let h = harness(
        vec![Script::Once(json!({"choices": [{"message": {"content": "Math"}, "finish_reason": "stop"}]}))],
        settings,
        "sk-test",
    );

    let title = h
        .engine
        .generate_title(vec![Message::text(Role::User, "2+2")], &ChatConfig::default())
        .await
        .unwrap();
    assert_eq!(title, "Math");
    assert_eq!(h.api.requests()[0].config.model, "title-model");
}

#[tokio::test]
async fn test_generate_title_failure_is_prefixed() {
    let h = harness(
        vec![Script::Fail(|| ParleyError::Transport {
            status: reqwest::StatusCode::BAD_REQUEST,
            body: "bad request".into(),
        })],
        EngineSettings::default(),
        "sk-test",
    );

    let err = h
        .engine
        .generate_title(vec![Message::text(Role::User, "2+2")], &ChatConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Error generating title!\nbad request");
}

#[tokio::test]
async fn test_auto_title_after_completion() {
    let settings = EngineSettings {
        auto_title: true,
        ..EngineSettings::default()
    };
    let h = harness(
        vec![
            Script::Chunks(sse(&["Four."])),
            Script::Once(json!({"choices": [{"message": {"content": "\"Simple Sum\""}, "finish_reason": "stop"}]})),
        ],
        settings,
        "sk-test",
    );

    assert_eq!(h.engine.submit().await, SubmitOutcome::Completed);
    let chat = h.store.chat(0).await.unwrap();
    assert!(chat.title_set);
    assert_eq!(chat.title, "Simple Sum");
}

#[tokio::test]
async fn test_cancel_in_stage_one_skips_checker() {
    let h = harness(
        vec![
            Script::Hang(vec![sse(&["draft"]).remove(0)]),
            Script::Chunks(sse(&["final"])),
        ],
        auto_check_settings(true),
        "",
    );
    let mut rx = h.store.subscribe();

    let canceller = async {
        while let Ok(event) = rx.recv().await {
            if let AppEvent::Delta { .. } = event {
                h.engine.cancel();
                break;
            }
        }
    };

    let (outcome, _) = tokio::join!(h.engine.submit(), canceller);

    assert_eq!(outcome, SubmitOutcome::Cancelled);
    assert_eq!(h.api.requests().len(), 1);
    assert_eq!(last_text(&h.store).await, "draft");
    assert_eq!(h.session.error(), "");
}

#[tokio::test]
async fn test_title_failure_notice_precedes_finish() {
    let settings = EngineSettings {
        auto_title: true,
        ..EngineSettings::default()
    };
    let h = harness(
        vec![
            Script::Chunks(sse(&["Four."])),
            Script::Fail(|| ParleyError::Transport {
                status: reqwest::StatusCode::BAD_REQUEST,
                body: "no titles today".into(),
            }),
        ],
        settings,
        "sk-test",
    );
    let mut rx = h.store.subscribe();

    assert_eq!(h.engine.submit().await, SubmitOutcome::Completed);

    let mut order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            AppEvent::Notice(n) => order.push(n.message),
            AppEvent::GenerationFinished { .. } => order.push("<finished>".into()),
            _ => {}
        }
    }
    assert_eq!(
        order,
        vec![
            "Error generating title!\nno titles today".to_string(),
            "<finished>".to_string()
        ]
    );
    assert!(!h.store.chat(0).await.unwrap().title_set);
}
