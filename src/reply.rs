//! The AI reply as the pipeline sees it.
//!
//! The chat model answers with a JSON object holding a `messages` array.
//! Each message (an utterance) carries `text`, `facialExpression` and
//! `animation`, and may carry anything else the prompt asked for. The
//! pipeline only reads `text`; every other field is passed through
//! untouched, in its original order, so utterances are kept as open JSON
//! maps rather than fixed structs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::lipsync::MouthCue;

pub const MESSAGES_KEY: &str = "messages";
pub const AUDIO_KEY: &str = "audioBase64";
pub const LIPSYNC_KEY: &str = "lipsync";

/// One line of the reply, as produced upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Utterance {
    fields: Map<String, Value>,
}

impl Utterance {
    /// Accept any JSON object with a string `text` field.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) if fields.get("text").is_some_and(Value::is_string) => {
                Some(Self { fields })
            }
            _ => None,
        }
    }

    pub fn text(&self) -> &str {
        self.fields.get("text").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn facial_expression(&self) -> Option<&str> {
        self.fields.get("facialExpression").and_then(Value::as_str)
    }

    pub fn animation(&self) -> Option<&str> {
        self.fields.get("animation").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

/// An utterance with its audio and mouth cues attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnrichedUtterance {
    fields: Map<String, Value>,
}

impl EnrichedUtterance {
    pub fn audio_base64(&self) -> &str {
        self.fields.get(AUDIO_KEY).and_then(Value::as_str).unwrap_or_default()
    }

    pub fn lipsync(&self) -> Vec<MouthCue> {
        self.fields
            .get(LIPSYNC_KEY)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Copy every original field and add the two enrichment fields. Upstream
/// values under those two keys are replaced.
pub fn assemble(original: Utterance, audio_base64: String, cues: Vec<MouthCue>) -> EnrichedUtterance {
    let mut fields = original.fields;
    let lipsync = cues
        .into_iter()
        .map(|c| serde_json::to_value(c).unwrap_or(Value::Null))
        .collect();
    fields.insert(AUDIO_KEY.to_string(), Value::String(audio_base64));
    fields.insert(LIPSYNC_KEY.to_string(), Value::Array(lipsync));
    EnrichedUtterance { fields }
}

pub fn encode_audio(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Parse the model's reply into utterances. Returns `None` when the payload
/// is not an object with a `messages` array of text-bearing objects; the
/// caller then passes the raw text through.
pub fn parse_reply(raw: &str) -> Option<Vec<Utterance>> {
    let body = strip_code_fence(raw.trim());
    let doc: Value = match serde_json::from_str(body) {
        Ok(doc) => doc,
        Err(e) => {
            log::debug!("AI reply is not JSON: {e}");
            return None;
        }
    };
    let Value::Object(mut root) = doc else {
        return None;
    };
    let Some(Value::Array(items)) = root.remove(MESSAGES_KEY) else {
        log::debug!("AI reply has no '{MESSAGES_KEY}' array");
        return None;
    };
    items.into_iter().map(Utterance::from_value).collect()
}

/// Models sometimes wrap JSON answers in a Markdown fence; drop it.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(rest) = rest.strip_suffix("```") else {
        return text;
    };
    // Skip the info string ("json") on the opening fence line.
    match rest.find('\n') {
        Some(newline) => rest[newline + 1..].trim(),
        None => {
            let body = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()).trim();
            if body.starts_with(['{', '[']) {
                body
            } else {
                rest.trim()
            }
        }
    }
}

/// What goes back to the HTTP layer for one chat turn.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedReply {
    Enriched(Vec<EnrichedUtterance>),
    /// The upstream payload, unmodified, because it could not be parsed.
    Raw(String),
}

impl RenderedReply {
    /// Response body: a JSON array of enriched utterances, or the raw text.
    pub fn to_body(&self) -> String {
        match self {
            RenderedReply::Enriched(items) => {
                serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
            }
            RenderedReply::Raw(raw) => raw.clone(),
        }
    }
}
