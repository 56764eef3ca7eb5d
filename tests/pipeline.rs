//! End-to-end behaviour of the speech pipeline with stub collaborators.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use avatar_voice::lipsync::RhubarbExtractor;
use avatar_voice::pipeline::SpeechPipeline;
use avatar_voice::transcode::PassthroughTranscoder;
use avatar_voice::{
    CueTimings, LipsyncState, MouthCue, PipelineConfig, PipelineError, RenderedReply,
    SynthesisState, TempWorkspace, TranscodeState, Utterance, Viseme,
};

use common::{Harness, StubExtractor, StubSynthesizer};

fn reply(messages: Value) -> String {
    json!({ "messages": messages }).to_string()
}

fn enriched(rendered: RenderedReply) -> Vec<Value> {
    match rendered {
        RenderedReply::Enriched(items) => items.into_iter().map(|u| u.into_value()).collect(),
        RenderedReply::Raw(raw) => panic!("expected enriched reply, got raw: {raw}"),
    }
}

fn b_cue() -> Vec<MouthCue> {
    vec![MouthCue::new(0.0, 0.3, Viseme::B)]
}

#[tokio::test]
async fn single_utterance_scenario() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![0u8; 100]),
        StubExtractor::returning(b_cue()),
    );
    let raw = reply(json!([
        {"text": "Hi there!", "facialExpression": "smile", "animation": "Talking_0"}
    ]));

    let out = enriched(
        harness
            .pipeline
            .render(&raw, "conv-1", &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(out.len(), 1);
    let item = out[0].as_object().unwrap();
    let keys: Vec<&str> = item.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        ["text", "facialExpression", "animation", "audioBase64", "lipsync"]
    );
    assert_eq!(item["text"], "Hi there!");
    assert_eq!(item["facialExpression"], "smile");
    assert_eq!(item["animation"], "Talking_0");
    assert_eq!(item["audioBase64"], BASE64.encode([0u8; 100]));

    let cues = item["lipsync"].as_array().unwrap();
    assert_eq!(cues.len(), 1);
    assert_eq!(cues[0]["start"].as_f64(), Some(0.0));
    assert_eq!(cues[0]["end"].as_f64(), Some(0.3));
    assert_eq!(cues[0]["value"], "B");

    assert_eq!(harness.synthesizer.calls(), vec!["Hi there!".to_string()]);
    assert!(harness.leftover_files().is_empty());
}

#[tokio::test]
async fn preserves_length_order_and_unknown_fields() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![1, 2, 3]).tagged(),
        StubExtractor::returning(b_cue()),
    );
    let messages = json!([
        {"text": "One", "facialExpression": "smile", "animation": "Talking_0",
         "emphasis": 2, "whisper": false, "gesture": null},
        {"text": "Two", "facialExpression": "sad", "animation": "Crying",
         "tags": ["soft", {"level": 1.5}], "meta": {"source": "llm"}},
        {"animation": "Idle", "text": "Three", "facialExpression": "default",
         "score": -0.25}
    ]);

    let out = enriched(
        harness
            .pipeline
            .render(&reply(messages.clone()), "conv", &CancellationToken::new())
            .await
            .unwrap(),
    );

    let inputs = messages.as_array().unwrap();
    assert_eq!(out.len(), inputs.len());
    for (input, output) in inputs.iter().zip(&out) {
        let input = input.as_object().unwrap();
        let output = output.as_object().unwrap();
        assert_eq!(output.len(), input.len() + 2);
        for (key, value) in input {
            assert_eq!(output.get(key), Some(value), "field {key} changed");
        }
        let input_keys: Vec<&String> = input.keys().collect();
        let output_keys: Vec<&String> = output.keys().take(input.len()).collect();
        assert_eq!(input_keys, output_keys);
    }

    // Audio is traced back to its own utterance.
    for (index, text) in ["One", "Two", "Three"].iter().enumerate() {
        let mut expected = vec![1, 2, 3];
        expected.extend_from_slice(text.as_bytes());
        assert_eq!(out[index]["audioBase64"], BASE64.encode(&expected));
    }
}

#[tokio::test]
async fn completion_order_never_reorders_output() {
    let synthesizer = StubSynthesizer::with_audio(vec![9])
        .tagged()
        .delayed("first", Duration::from_millis(150))
        .delayed("second", Duration::from_millis(75))
        .delayed("third", Duration::from_millis(5));
    let harness = Harness::new(synthesizer, StubExtractor::returning(b_cue()));
    let raw = reply(json!([
        {"text": "first"}, {"text": "second"}, {"text": "third"}
    ]));

    let out = enriched(
        harness
            .pipeline
            .render(&raw, "conv", &CancellationToken::new())
            .await
            .unwrap(),
    );

    let texts: Vec<&str> = out.iter().map(|u| u["text"].as_str().unwrap()).collect();
    assert_eq!(texts, ["first", "second", "third"]);
    assert_eq!(out[2]["audioBase64"], BASE64.encode(b"\x09third"));
}

#[tokio::test]
async fn synthesis_runs_concurrently() {
    let synthesizer = StubSynthesizer::with_audio(vec![1])
        .delayed("a", Duration::from_millis(100))
        .delayed("b", Duration::from_millis(100))
        .delayed("c", Duration::from_millis(100));
    let harness = Harness::new(synthesizer, StubExtractor::returning(b_cue()));
    let raw = reply(json!([{"text": "a"}, {"text": "b"}, {"text": "c"}]));

    harness
        .pipeline
        .render(&raw, "conv", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(harness.synthesizer.max_in_flight.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn emoji_only_utterance_skips_synthesis() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![5; 10]),
        StubExtractor::returning(b_cue()),
    );
    let utterances = vec![
        Utterance::from_value(json!({"text": "😀😀", "facialExpression": "smile", "animation": "Laughing"}))
            .unwrap(),
        Utterance::from_value(json!({"text": "Nice ✨ day", "facialExpression": "smile", "animation": "Talking_1"}))
            .unwrap(),
    ];

    let (out, reports) = harness
        .pipeline
        .render_utterances(utterances, "conv", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out[0].audio_base64(), "");
    assert!(out[0].lipsync().is_empty());
    assert_eq!(out[0].get("text"), Some(&json!("😀😀")));
    assert_eq!(reports[0].synthesis, SynthesisState::Skipped);
    assert_eq!(reports[0].lipsync, LipsyncState::Skipped);

    // The sanitized copy is spoken; the original text is kept.
    assert_eq!(harness.synthesizer.calls(), vec!["Nice day".to_string()]);
    assert_eq!(out[1].get("text"), Some(&json!("Nice ✨ day")));
    assert!(!out[1].audio_base64().is_empty());
}

#[tokio::test]
async fn synthesis_failure_is_isolated() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![7; 20]).failing_for("second"),
        StubExtractor::returning(b_cue()),
    );
    let raw = reply(json!([
        {"text": "first"}, {"text": "second"}, {"text": "third"}
    ]));
    let utterances = avatar_voice::reply::parse_reply(&raw).unwrap();

    let (out, reports) = harness
        .pipeline
        .render_utterances(utterances, "conv", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(out.len(), 3);
    assert!(!out[0].audio_base64().is_empty());
    assert_eq!(out[1].audio_base64(), "");
    assert!(out[1].lipsync().is_empty());
    assert!(!out[2].audio_base64().is_empty());
    assert_eq!(out[0].lipsync(), b_cue());
    assert_eq!(out[2].lipsync(), b_cue());

    assert_eq!(reports[1].synthesis, SynthesisState::Failed);
    assert_eq!(reports[1].transcode, TranscodeState::Skipped);
    assert_eq!(reports[1].lipsync, LipsyncState::Skipped);
    assert_eq!(reports[0].synthesis, SynthesisState::Synthesized);
    assert_eq!(reports[0].lipsync, LipsyncState::Generated);
    // Only the two utterances with audio reached the extractor.
    assert_eq!(harness.extractor.seen().len(), 2);
}

#[tokio::test]
async fn malformed_payload_is_returned_raw() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![1]),
        StubExtractor::returning(b_cue()),
    );
    for raw in [
        "I'm not JSON, sorry!",
        r#"{"answer": "hello"}"#,
        r#"[{"text":"hi"}]"#,
        r#"{"messages": [{"facialExpression": "smile"}]}"#,
    ] {
        let out = harness
            .pipeline
            .render(raw, "conv", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, RenderedReply::Raw(raw.to_string()));
        assert_eq!(out.to_body(), raw);
    }
    assert!(harness.synthesizer.calls().is_empty());
}

#[tokio::test]
async fn missing_extractor_binary_keeps_audio() {
    let scratch = tempfile::tempdir().unwrap();
    let synthesizer = Arc::new(StubSynthesizer::with_audio(vec![3; 64]));
    let mut config = PipelineConfig::default();
    config.temp_root = scratch.path().to_path_buf();
    let pipeline = SpeechPipeline::new(
        config,
        synthesizer,
        Arc::new(PassthroughTranscoder),
        Arc::new(RhubarbExtractor::new(
            scratch.path().join("bin").join("rhubarb-missing"),
            CueTimings::default(),
            Duration::from_secs(5),
        )),
        Arc::new(TempWorkspace::new(scratch.path())),
    );
    let raw = reply(json!([{"text": "Hello"}, {"text": "World"}]));
    let utterances = avatar_voice::reply::parse_reply(&raw).unwrap();

    let (out, reports) = pipeline
        .render_utterances(utterances, "conv", &CancellationToken::new())
        .await
        .unwrap();

    for (item, report) in out.iter().zip(&reports) {
        assert_eq!(item.audio_base64(), BASE64.encode([3u8; 64]));
        assert!(item.lipsync().is_empty());
        assert_eq!(report.lipsync, LipsyncState::Failed);
        assert_eq!(report.transcode, TranscodeState::Fallback);
    }
}

#[tokio::test]
async fn extractor_failure_empties_lipsync_only() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![4; 8]),
        StubExtractor::failing(),
    );
    let raw = reply(json!([{"text": "Hey", "animation": "Talking_2"}]));

    let out = enriched(
        harness
            .pipeline
            .render(&raw, "conv", &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert_eq!(out[0]["audioBase64"], BASE64.encode([4u8; 8]));
    assert_eq!(out[0]["lipsync"], json!([]));
    assert_eq!(out[0]["animation"], "Talking_2");
}

#[tokio::test]
async fn rendering_is_idempotent_with_stubs() {
    let cues = vec![
        MouthCue::new(0.0, 0.12, Viseme::C),
        MouthCue::new(0.12, 0.4, Viseme::E),
    ];
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![8; 16]),
        StubExtractor::returning(cues),
    );
    let raw = reply(json!([{"text": "Again"}, {"text": "and again"}]));

    let first = harness
        .pipeline
        .render(&raw, "conv", &CancellationToken::new())
        .await
        .unwrap();
    let second = harness
        .pipeline
        .render(&raw, "conv", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn scratch_files_exist_during_extraction_and_are_removed_after() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![2; 32]),
        StubExtractor::returning(b_cue()),
    );
    let raw = reply(json!([{"text": "a"}, {"text": "b"}]));

    harness
        .pipeline
        .render(&raw, "conversation 7", &CancellationToken::new())
        .await
        .unwrap();

    let seen = harness.extractor.seen();
    assert_eq!(seen.len(), 2);
    for (path, existed) in &seen {
        assert!(existed, "{} missing during extraction", path.display());
        assert!(path.starts_with(harness.scratch.path().join("conversation_7")));
        assert!(!path.exists());
    }
    assert!(harness.leftover_files().is_empty());
}

#[tokio::test]
async fn include_audio_off_skips_all_synthesis() {
    let mut config = PipelineConfig::default();
    config.include_audio = false;
    let harness = Harness::with_config(
        StubSynthesizer::with_audio(vec![1]),
        StubExtractor::returning(b_cue()),
        config,
    );
    let raw = reply(json!([{"text": "quiet"}, {"text": "please"}]));

    let out = enriched(
        harness
            .pipeline
            .render(&raw, "conv", &CancellationToken::new())
            .await
            .unwrap(),
    );

    assert!(harness.synthesizer.calls().is_empty());
    for item in &out {
        assert_eq!(item["audioBase64"], "");
        assert_eq!(item["lipsync"], json!([]));
    }
}

#[tokio::test]
async fn long_text_is_truncated_before_synthesis() {
    let mut config = PipelineConfig::default();
    config.synthesis.max_chars = 20;
    let harness = Harness::with_config(
        StubSynthesizer::with_audio(vec![1]),
        StubExtractor::returning(b_cue()),
        config,
    );
    let long = "word ".repeat(30);
    let raw = reply(json!([{ "text": long }]));

    let out = enriched(
        harness
            .pipeline
            .render(&raw, "conv", &CancellationToken::new())
            .await
            .unwrap(),
    );

    let calls = harness.synthesizer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].chars().count(), 20);
    assert!(calls[0].ends_with("..."));
    // The reply still carries the full line.
    assert_eq!(out[0]["text"], json!(long));
}

#[tokio::test]
async fn empty_message_list_renders_empty_array() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![1]),
        StubExtractor::returning(b_cue()),
    );
    let out = harness
        .pipeline
        .render(r#"{"messages": []}"#, "conv", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.to_body(), "[]");
}

#[tokio::test]
async fn cancellation_aborts_the_whole_batch() {
    let synthesizer = StubSynthesizer::with_audio(vec![1])
        .delayed("slow", Duration::from_secs(30))
        .delayed("fast", Duration::from_millis(1));
    let harness = Harness::new(synthesizer, StubExtractor::returning(b_cue()));
    let raw = reply(json!([{"text": "fast"}, {"text": "slow"}]));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = harness.pipeline.render(&raw, "conv", &cancel).await;

    assert_eq!(result, Err(PipelineError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(harness.extractor.seen().is_empty());
    assert!(harness.leftover_files().is_empty());
}

#[tokio::test]
async fn already_cancelled_token_does_no_work() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![1]),
        StubExtractor::returning(b_cue()),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = harness
        .pipeline
        .render(&reply(json!([{"text": "hi"}])), "conv", &cancel)
        .await;

    assert_eq!(result, Err(PipelineError::Cancelled));
    assert!(harness.synthesizer.calls().is_empty());
}

#[tokio::test]
async fn unknown_numbers_round_trip_verbatim() {
    let harness = Harness::new(
        StubSynthesizer::with_audio(vec![1]),
        StubExtractor::returning(b_cue()),
    );
    let raw = r#"{"messages":[{"text":"hi","id":18446744073709551616,"price":1.50,"exp":1e2}]}"#;

    let body = harness
        .pipeline
        .render(raw, "conv", &CancellationToken::new())
        .await
        .unwrap()
        .to_body();

    assert!(
        body.starts_with(
            r#"[{"text":"hi","id":18446744073709551616,"price":1.50,"exp":1e2,"audioBase64":"#
        ),
        "got: {body}"
    );
}
