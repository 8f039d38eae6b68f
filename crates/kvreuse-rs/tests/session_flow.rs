//! End-to-end session tests through the public API.
//!
//! A byte-level tokenizer and a scripted runtime stand in for a real model,
//! so prompt sizes and cache reuse can be checked exactly.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use kvreuse_rs::error::RuntimeResult;
use kvreuse_rs::prelude::*;

const EOG: TokenId = -1;

/// One token per byte.
struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.bytes().map(TokenId::from).collect()
    }
}

/// Images expand to `<img>` + a 32-token unit + `</img>`.
struct ImagePipeline;

impl MediaPipeline for ImagePipeline {
    fn load_and_tokenize(
        &self,
        identity: &str,
        _marker: &str,
    ) -> Result<Vec<MediaPart>, MediaError> {
        if !identity.ends_with(".png") {
            return Err(MediaError::Load {
                identity: identity.to_string(),
                reason: "unsupported format".into(),
            });
        }
        Ok(vec![
            MediaPart::Text(ByteTokenizer.tokenize("<img>")),
            MediaPart::Media {
                kind: MediaKind::Image,
                token_count: 32,
                payload: Arc::new(identity.to_string()),
            },
            MediaPart::Text(ByteTokenizer.tokenize("</img>")),
        ])
    }
}

/// Tracks the resident token count like a real KV cache would.
struct ScriptedRuntime {
    context_size: usize,
    resident: usize,
    media_computes: usize,
    script: VecDeque<TokenId>,
}

impl ScriptedRuntime {
    fn new(context_size: usize) -> Self {
        Self {
            context_size,
            resident: 0,
            media_computes: 0,
            script: VecDeque::new(),
        }
    }

    fn say(&mut self, text: &str) {
        self.script.extend(text.bytes().map(TokenId::from));
        self.script.push_back(EOG);
    }
}

impl ModelRuntime for ScriptedRuntime {
    fn context_size(&self) -> usize {
        self.context_size
    }

    fn truncate(&mut self, _seq: SequenceId, keep: usize) -> RuntimeResult<()> {
        self.resident = self.resident.min(keep);
        Ok(())
    }

    fn compute(
        &mut self,
        _seq: SequenceId,
        unit: ComputeUnit<'_>,
        _want_logits: bool,
    ) -> RuntimeResult<()> {
        if matches!(unit, ComputeUnit::Media(_)) {
            self.media_computes += 1;
        }
        self.resident += unit.token_count();
        if self.resident > self.context_size {
            return Err(RuntimeError::Fatal("context overflow".into()));
        }
        Ok(())
    }

    fn sample_next_token(&mut self) -> RuntimeResult<TokenId> {
        Ok(self.script.pop_front().unwrap_or(EOG))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG
    }

    fn detokenize(&self, token: TokenId) -> Vec<u8> {
        u8::try_from(token).map(|b| vec![b]).unwrap_or_default()
    }
}

fn chat_session(config: SessionConfig, runtime: ScriptedRuntime) -> Session<ScriptedRuntime> {
    Session::new(config, runtime, ChatMlTemplate::new(), ByteTokenizer, ImagePipeline)
}

fn run_turn(
    session: &mut Session<ScriptedRuntime>,
    reply: &str,
    max_tokens: usize,
) -> GenerationOutcome {
    session.runtime_mut().say(reply);
    session
        .generate(&GenerationConfig::default().with_max_tokens(max_tokens), |_| true)
        .unwrap()
}

#[test]
fn second_turn_reuses_prompt_and_reply() {
    let mut session = chat_session(SessionConfig::default(), ScriptedRuntime::new(4096));
    session.add_message(Message::system("You are terse."), true).unwrap();
    session.add_message(Message::user("Hi"), false).unwrap();

    let first = run_turn(&mut session, "Hello", 64);
    assert_eq!(first.text, "Hello");
    assert_eq!(first.stop, StopReason::EndOfGeneration);
    assert_eq!(first.report.reused_tokens, 0);
    assert_eq!(
        session.scheduler().resident_tokens(),
        first.report.prompt_tokens + 5
    );

    session.add_message(Message::assistant(first.text.clone()), false).unwrap();
    session.add_message(Message::user("Bye"), false).unwrap();
    let second = run_turn(&mut session, "Later", 64);

    assert_eq!(second.report.reused_tokens, first.report.prompt_tokens + 5);
    assert_eq!(
        second.report.reused_tokens + second.report.computed_tokens,
        second.report.prompt_tokens
    );
    assert_eq!(session.scheduler().resident_tokens(), session.runtime().resident);
}

#[test]
fn images_are_encoded_and_computed_once() {
    let mut session = chat_session(SessionConfig::default(), ScriptedRuntime::new(4096));
    session
        .add_message(Message::user("What is this? <__media:cat.png__>"), false)
        .unwrap();

    let first = run_turn(&mut session, "A cat.", 64);
    assert_eq!(session.runtime().media_computes, 1);
    assert!(first.warnings.is_empty());

    session.add_message(Message::assistant(first.text), false).unwrap();
    session.add_message(Message::user("Sure?"), false).unwrap();
    let second = run_turn(&mut session, "Yes.", 64);

    assert_eq!(session.runtime().media_computes, 1);
    assert!(second.report.reused_tokens > 32);
    assert_eq!(session.history().media_cache().len(), 1);
}

#[test]
fn unsupported_media_is_skipped_and_reported() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut session = chat_session(SessionConfig::default(), ScriptedRuntime::new(4096))
        .with_handler(FnEventHandler::new(move |event: &SessionEvent<'_>| {
            if let SessionEvent::Warning(RenderWarning::MediaSkipped { identity, .. }) = event {
                sink.lock().unwrap().push(identity.clone());
            }
        }));
    session
        .add_message(Message::user("Listen: <__media:song.mp3__>"), false)
        .unwrap();

    let outcome = run_turn(&mut session, "Nothing to hear.", 64);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(*seen.lock().unwrap(), vec!["song.mp3".to_string()]);
    assert_eq!(session.runtime().media_computes, 0);
    assert_eq!(session.history().tail().len(), 1);
}

#[test]
fn long_chat_stays_within_budget_and_in_sync() {
    let config = SessionConfig::default().with_safety_margin(32);
    let mut session = chat_session(config, ScriptedRuntime::new(600));
    session.add_message(Message::system("Keep answers short."), true).unwrap();

    let mut pruned_turns = 0;
    for turn in 0..30 {
        session
            .add_message(Message::user(format!("Question number {turn}, please answer.")), false)
            .unwrap();
        let outcome = run_turn(&mut session, "Fine.", 64);
        if outcome.pruned.is_some() {
            pruned_turns += 1;
        }
        let estimate = session.history().estimate();
        assert!(estimate.total + 32 <= 600 - 64);
        assert_eq!(session.scheduler().resident_tokens(), session.runtime().resident);
        assert_eq!(session.history().head().len(), 1);

        session.add_message(Message::assistant(outcome.text), false).unwrap();
    }
    assert!(pruned_turns > 0);
    assert!(session.scheduler().stats().hit_rate() > 0.0);
}

#[test]
fn pinned_message_dropped_when_nothing_else_fits() {
    let config = SessionConfig::default()
        .with_context_size(200)
        .with_safety_margin(0);
    let mut session = chat_session(config, ScriptedRuntime::new(4096));
    session.add_message(Message::system("x".repeat(300)), true).unwrap();

    let outcome = run_turn(&mut session, "ok", 16);
    assert_eq!(
        outcome.warnings,
        vec![RenderWarning::PinnedDropped { count: 1 }]
    );
    assert!(session.history().head().is_empty());
}

#[test]
fn tools_that_do_not_fit_fail_the_turn() {
    let config = SessionConfig::default()
        .with_context_size(256)
        .with_safety_margin(16);
    let mut session = chat_session(config, ScriptedRuntime::new(4096));
    session
        .add_tool(Tool::new(
            "search",
            "d".repeat(400),
            serde_json::json!({"type": "object"}),
        ))
        .unwrap();
    session.add_message(Message::user("find it"), false).unwrap();

    let err = session
        .generate(&GenerationConfig::default().with_max_tokens(32), |_| true)
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Render(RenderError::BudgetExhausted { .. })
    ));
}

#[test]
fn session_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"context_size": 2048, "safety_margin": 8, "estimator": {{"char_ratio": {{"chars_per_token": 4.0}}}}}}"#
    )
    .unwrap();
    let config = SessionConfig::from_json_file(file.path()).unwrap();

    let mut session = chat_session(config, ScriptedRuntime::new(4096));
    assert_eq!(session.context_size(), 2048);

    session.add_message(Message::user("a".repeat(40)), false).unwrap();
    let outcome = run_turn(&mut session, "ok", 8);
    assert_eq!(outcome.text, "ok");
}

#[test]
fn editing_history_recomputes_from_the_edit() {
    let mut session = chat_session(SessionConfig::default(), ScriptedRuntime::new(4096));
    session.add_message(Message::system("Be helpful."), true).unwrap();
    session.add_message(Message::user("first question"), false).unwrap();
    let first = run_turn(&mut session, "answer", 32);

    session.set_content(MessageSlot::Tail(0), "edited question").unwrap();
    let second = run_turn(&mut session, "answer", 32);

    assert!(second.report.reused_tokens < first.report.prompt_tokens);
    assert!(second.report.reused_tokens > 0);
    assert_eq!(session.scheduler().resident_tokens(), session.runtime().resident);
}

#[test]
fn oversized_token_cap_is_clamped_to_the_context() {
    let mut session = chat_session(SessionConfig::default(), ScriptedRuntime::new(4096));
    session.add_message(Message::user("Hi"), false).unwrap();

    let outcome = run_turn(&mut session, "Hello", 100_000);
    assert_eq!(outcome.text, "Hello");
    assert_eq!(outcome.stop, StopReason::EndOfGeneration);
    assert!(outcome.pruned.is_some());
    assert_eq!(session.scheduler().resident_tokens(), session.runtime().resident);
}
