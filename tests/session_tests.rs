//! End-to-end tests over the embedding API: load a tiny model from disk,
//! run sessions, and check the documented behaviors.
mod common;

use std::sync::Arc;

use quern::telemetry::TelemetryEvent;
use quern::{
    CancelToken, ChatRequest, ContextPolicy, Engine, EngineOptions, FinishReason, QuernError,
    SessionOptions,
};

fn greedy_options(seed: u64) -> SessionOptions {
    SessionOptions {
        temperature: 0.0,
        seed: Some(seed),
        deterministic: true,
        max_new_tokens: 12,
        ..Default::default()
    }
}

#[test]
fn test_generate_round_trip() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let session = engine.create_session(&model, greedy_options(0)).unwrap();

    let response = session
        .generate(ChatRequest::from_user_text("hi there"), &CancelToken::new())
        .unwrap();

    assert!(response.usage.prompt_tokens > 0);
    assert!(matches!(
        response.finish_reason,
        FinishReason::Length | FinishReason::Eos
    ));
    let info = session.info();
    assert_eq!(info.message_count, 2); // user + assistant
    assert_eq!(info.usage.prompt_tokens, response.usage.prompt_tokens);
}

#[test]
fn test_greedy_generation_is_deterministic() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let session = engine.create_session(&model, greedy_options(0)).unwrap();
        let response = session
            .generate(ChatRequest::from_user_text("abc"), &CancelToken::new())
            .unwrap();
        outputs.push(response.message.content);
    }
    assert_eq!(outputs[0].as_bytes(), outputs[1].as_bytes());
}

#[test]
fn test_multi_turn_reuses_cache() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let session = engine.create_session(&model, greedy_options(0)).unwrap();

    session
        .generate(ChatRequest::from_user_text("one"), &CancelToken::new())
        .unwrap();
    let cached_after_first = session.info().cached_tokens;
    assert!(cached_after_first > 0);

    session
        .generate(ChatRequest::from_user_text("two"), &CancelToken::new())
        .unwrap();
    let info = session.info();
    assert_eq!(info.message_count, 4);
    assert!(info.cached_tokens > cached_after_first);
}

#[test]
fn test_concurrent_sessions_match_sequential_runs() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Arc::new(Engine::new(EngineOptions::default()));
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();

    let run = |seed: u64| {
        let opts = SessionOptions {
            temperature: 1.0,
            seed: Some(seed),
            deterministic: true,
            max_new_tokens: 16,
            ..Default::default()
        };
        let session = engine.create_session(&model, opts).unwrap();
        session
            .generate(ChatRequest::from_user_text("start"), &CancelToken::new())
            .unwrap()
            .message
            .content
    };

    let sequential_a = run(5);
    let sequential_b = run(7);

    let (concurrent_a, concurrent_b) = std::thread::scope(|scope| {
        let ha = scope.spawn(|| run(5));
        let hb = scope.spawn(|| run(7));
        (ha.join().unwrap(), hb.join().unwrap())
    });

    assert_eq!(sequential_a, concurrent_a);
    assert_eq!(sequential_b, concurrent_b);
    assert_ne!(sequential_a, sequential_b);
}

#[test]
fn test_streaming_pieces_assemble_final_message() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let session = engine.create_session(&model, greedy_options(0)).unwrap();

    let mut streamed = String::new();
    let response = session
        .generate_streaming(
            ChatRequest::from_user_text("stream this"),
            &CancelToken::new(),
            &mut |piece| streamed.push_str(piece),
        )
        .unwrap();
    assert_eq!(streamed, response.message.content);
}

#[test]
fn test_token_stream_iterator() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let session = Arc::new(engine.create_session(&model, greedy_options(0)).unwrap());

    let stream = session.stream(ChatRequest::from_user_text("go"), &CancelToken::new());
    let mut assembled = String::new();
    let mut stream = stream;
    for piece in stream.by_ref() {
        assembled.push_str(&piece.unwrap());
    }
    let response = stream.finish().unwrap();
    assert_eq!(assembled, response.message.content);
}

#[test]
fn test_session_in_use_detected() {
    let fixture = common::write_tiny_model(2048, false); // no EOS: runs long
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let options = SessionOptions {
        max_new_tokens: 512,
        temperature: 0.0,
        deterministic: true,
        ..Default::default()
    };
    let session = Arc::new(engine.create_session(&model, options).unwrap());

    let cancel = CancelToken::new();
    let mut stream = session.stream(ChatRequest::from_user_text("busy"), &cancel);
    // once the first piece arrives the worker holds the session lock
    let first = stream.next();
    assert!(first.is_some());

    let err = session
        .generate(ChatRequest::from_user_text("again"), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, QuernError::SessionInUse));

    cancel.cancel();
    let _ = stream.finish();
}

#[test]
fn test_cancellation_before_output() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let session = engine.create_session(&model, greedy_options(0)).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = session
        .generate(ChatRequest::from_user_text("never"), &cancel)
        .unwrap_err();
    assert!(matches!(err, QuernError::Cancelled));
}

#[test]
fn test_per_session_budget_refused() {
    let fixture = common::write_tiny_model(64, true);
    let sink = common::RecordingSink::shared();
    let engine = Engine::with_telemetry(
        EngineOptions {
            kv_store: quern::kv::KvStoreConfig {
                per_session_max: Some(16), // far below any real cache
                ..Default::default()
            },
            ..Default::default()
        },
        sink.clone(),
    );
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let err = engine
        .create_session(&model, SessionOptions::default())
        .unwrap_err();
    assert!(matches!(err, QuernError::BudgetExceeded { .. }));
    assert_eq!(
        sink.count(|e| matches!(e, TelemetryEvent::KvCacheBudgetExceeded { .. })),
        1
    );
}

#[test]
fn test_lru_eviction_across_sessions() {
    let fixture = common::write_tiny_model(64, true);
    // cache bytes per session: 2 layers * 2 planes * 64 pos * 8 * 4 bytes
    let per_session = 2u64 * 2 * 64 * 8 * 4;
    let sink = common::RecordingSink::shared();
    let engine = Engine::with_telemetry(
        EngineOptions {
            kv_store: quern::kv::KvStoreConfig {
                total_max: Some(2 * per_session),
                ..Default::default()
            },
            ..Default::default()
        },
        sink.clone(),
    );
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();

    let _a = engine.create_session(&model, greedy_options(1)).unwrap();
    let _b = engine.create_session(&model, greedy_options(2)).unwrap();
    assert_eq!(sink.count(|e| matches!(e, TelemetryEvent::KvCacheEviction { .. })), 0);

    let _c = engine.create_session(&model, greedy_options(3)).unwrap();
    assert_eq!(
        sink.count(|e| matches!(e, TelemetryEvent::KvCacheEviction { .. })),
        1
    );
}

#[test]
fn test_response_format_validation_failure_carries_text() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let session = engine.create_session(&model, greedy_options(0)).unwrap();

    let request = ChatRequest {
        response_format: Some(quern::chat::ResponseFormat {
            json_schema: serde_json::json!({"type": "object", "required": ["answer"]}),
        }),
        ..ChatRequest::from_user_text("say something")
    };
    // a random tiny model will not emit valid JSON
    match session.generate(request, &CancelToken::new()) {
        Err(QuernError::InvalidOutput { text, .. }) => {
            // the unvalidated output is still surfaced
            let _ = text;
        }
        Ok(response) => panic!("unexpectedly valid: {:?}", response.message.content),
        Err(other) => panic!("wrong error: {other}"),
    }
}

#[test]
fn test_save_and_load_session() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let session = engine.create_session(&model, greedy_options(0)).unwrap();
    session.set_system_prompt("stay terse");
    session
        .generate(ChatRequest::from_user_text("remember me"), &CancelToken::new())
        .unwrap();

    let path = fixture.dir.path().join("session.json");
    session.save(&path).unwrap();

    let restored = engine.create_session(&model, greedy_options(0)).unwrap();
    restored.load(&path).unwrap();
    let info = restored.info();
    assert_eq!(info.message_count, 2);
    assert_eq!(info.usage.prompt_tokens, session.info().usage.prompt_tokens);
}

#[test]
fn test_sliding_window_policy_respects_budget() {
    let fixture = common::write_tiny_model(64, true);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let options = SessionOptions {
        context_policy: ContextPolicy::SlidingWindow(40),
        ..greedy_options(0)
    };
    let session = engine.create_session(&model, options).unwrap();
    session.set_system_prompt("s");

    // several turns; old ones must fall out of the prompt budget rather
    // than blowing the model context
    for text in ["turn one text", "turn two text", "turn three text"] {
        session
            .generate(ChatRequest::from_user_text(text), &CancelToken::new())
            .unwrap();
    }
    assert_eq!(session.info().message_count, 6);
}

#[test]
fn test_cache_overflow_mid_generation_recovers() {
    // A window smaller than prompt-plus-generation forces the overflow
    // retry path (slide to half, continue) several times in one turn.
    let fixture = common::write_tiny_model(64, false); // no EOS: runs to the limit
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();

    let run = || {
        let options = SessionOptions {
            max_kv_cache_tokens: Some(16),
            max_new_tokens: 24,
            temperature: 0.0,
            deterministic: true,
            ..Default::default()
        };
        let session = engine.create_session(&model, options).unwrap();
        let response = session
            .generate(
                ChatRequest::from_user_text("fill the window"),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(response.usage.completion_tokens, 24);

        // the session's token ledger and the cache it checked in must
        // agree, even across overflow-triggered slides
        let info = session.info();
        assert_eq!(info.cached_tokens, info.cache_occupancy);
        assert!(info.cache_occupancy <= 16);
        assert!(info.cache_occupancy > 0);
        response.message.content
    };

    // deterministic greedy: the recovery path must not inject any
    // run-to-run variation
    let first = run();
    let second = run();
    assert_eq!(first, second);
}

#[test]
fn test_timeout_maps_to_cancellation() {
    let fixture = common::write_tiny_model(2048, false);
    let engine = Engine::new(EngineOptions::default());
    let model = engine
        .load_model(&fixture.model_path, &CancelToken::new())
        .unwrap();
    let options = SessionOptions {
        max_new_tokens: 100_000,
        timeout_ms: Some(30),
        temperature: 0.0,
        deterministic: true,
        ..Default::default()
    };
    let session = engine.create_session(&model, options).unwrap();

    let result = session.generate(
        ChatRequest::from_user_text("run forever"),
        &CancelToken::new(),
    );
    match result {
        Ok(response) => assert_eq!(response.finish_reason, FinishReason::Cancelled),
        Err(err) => assert!(matches!(err, QuernError::Cancelled)),
    }
}
