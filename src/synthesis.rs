//! Text-to-speech behind a uniform `text -> audio bytes` contract.
//!
//! The pipeline does not care which engine speaks; it only needs MP3 bytes
//! back or an error it can absorb for that one utterance. [`HttpSynthesizer`]
//! talks to an OpenAI-compatible `/audio/speech` endpoint, which covers the
//! hosted API as well as most self-hosted speech servers.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::SynthesisConfig;
use crate::reply::encode_audio;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Render `text` to encoded audio.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    async fn synthesize_base64(&self, text: &str) -> Result<String> {
        let audio = self.synthesize(text).await?;
        Ok(encode_audio(&audio))
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

pub struct HttpSynthesizer {
    client: Client,
    config: SynthesisConfig,
}

impl HttpSynthesizer {
    pub fn new(config: SynthesisConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client for speech synthesis")?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            bail!("cannot synthesize empty text");
        }
        log::info!("Converting text to speech, length: {}", text.chars().count());

        let request = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice: &self.config.voice,
            response_format: "mp3",
        };
        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .context("speech service request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => anyhow!("speech service rejected credentials ({status}): {body}"),
                429 => anyhow!("speech service rate limited ({status}): {body}"),
                _ => anyhow!("speech service error ({status}): {body}"),
            });
        }

        let audio = response
            .bytes()
            .await
            .context("failed to read speech audio")?
            .to_vec();
        log::info!("Synthesized speech, audio size: {} bytes", audio.len());
        Ok(audio)
    }
}
