// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

/// Seam for the external STT/TTS collaborators.  Codecs and model choices
/// live behind this trait; the orchestrator only wraps the calls in the
/// `voice_stt`/`voice_tts` breakers and the voice bulkhead.
#[async_trait]
pub trait SpeechService: Send + Sync {
    /// Transcribe one audio frame to text.
    async fn transcribe(&self, audio: &[u8]) -> anyhow::Result<String>;

    /// Synthesize speech for a response text.
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;
}

/// Pass-through speech service: treats audio bytes as UTF-8 text and
/// responses as their own audio.  Lets the voice path run end-to-end in
/// deployments and tests that have no codec attached.
pub struct NullSpeech;

#[async_trait]
impl SpeechService for NullSpeech {
    async fn transcribe(&self, audio: &[u8]) -> anyhow::Result<String> {
        Ok(String::from_utf8_lossy(audio).into_owned())
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        Ok(text.as_bytes().to_vec())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_speech_round_trips_text() {
        let s = NullSpeech;
        let text = s.transcribe(b"turn on the lights").await.unwrap();
        assert_eq!(text, "turn on the lights");
        let audio = s.synthesize(&text).await.unwrap();
        assert_eq!(audio, b"turn on the lights");
    }
}
