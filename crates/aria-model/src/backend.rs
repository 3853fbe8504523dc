// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use aria_config::BackendConfig;

use crate::types::{GenerateRequest, ModelError, StreamEvent, TokenStream};

/// One inference endpoint.  Implementations stream token fragments; the pool
/// and engine layered above handle selection, health, caching, and fallback.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name from configuration (unique per endpoint).
    fn name(&self) -> &str;

    /// Model identifier forwarded in the request body.
    fn model_name(&self) -> &str;

    async fn generate(&self, req: GenerateRequest) -> Result<TokenStream, ModelError>;
}

/// HTTP streaming client for one backend endpoint.
///
/// Request: `POST {endpoint}/generate` with `{model, prompt, options}`.
/// Response: newline-delimited JSON chunks — `{"token": "…"}`,
/// `{"tool_call": {"name": …, "parameters": …}}`, `{"error": "…"}`, and a
/// terminating `{"done": true}`.  Any non-2xx status or mid-stream disconnect
/// is a failure.
pub struct HttpBackend {
    name: String,
    model: String,
    generate_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(cfg: &BackendConfig, request_timeout: Duration) -> Self {
        // The overall deadline covers the whole streamed body; connect
        // failures should surface much faster than that.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            name: cfg.name.clone(),
            model: cfg.model.clone(),
            generate_url: format!("{}/generate", cfg.endpoint.trim_end_matches('/')),
            client,
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, req: GenerateRequest) -> Result<TokenStream, ModelError> {
        let body = json!({
            "model": self.model,
            "prompt": req.prompt,
            "options": req.options,
        });

        debug!(backend = %self.name, model = %self.model, "sending generate request");

        let resp = self
            .client
            .post(&self.generate_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                413 => ModelError::ContentTooLarge,
                code => ModelError::Status(code),
            });
        }

        // Chunks can split a JSON line across TCP packets.  Maintain a line
        // buffer across chunks; emit events only for complete lines.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<Result<StreamEvent, ModelError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_lines(buf)
                    }
                    Err(e) => vec![Err(ModelError::Transport(e.to_string()))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Drain all complete `\n`-terminated lines from `buf`, leaving any trailing
/// partial line in place for the next chunk.
pub(crate) fn drain_complete_lines(buf: &mut String) -> Vec<Result<StreamEvent, ModelError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_chunk_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse a single complete chunk line.  Empty lines are keep-alives.
fn parse_chunk_line(line: &str) -> Option<Result<StreamEvent, ModelError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let v: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Some(Err(ModelError::Protocol(format!("{e}: {line}")))),
    };
    if let Some(token) = v.get("token").and_then(Value::as_str) {
        return Some(Ok(StreamEvent::TokenDelta(token.to_string())));
    }
    if v.get("done").and_then(Value::as_bool) == Some(true) {
        return Some(Ok(StreamEvent::Done));
    }
    if let Some(tc) = v.get("tool_call") {
        let name = tc.get("name").and_then(Value::as_str).unwrap_or_default();
        if name.is_empty() {
            return Some(Err(ModelError::Protocol("tool_call without name".into())));
        }
        let parameters = tc.get("parameters").cloned().unwrap_or(Value::Null);
        return Some(Ok(StreamEvent::ToolCallRequest {
            name: name.to_string(),
            parameters,
        }));
    }
    if let Some(err) = v.get("error").and_then(Value::as_str) {
        return Some(Err(ModelError::Transport(err.to_string())));
    }
    Some(Err(ModelError::Protocol(format!("unrecognized chunk: {line}"))))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_chunk_parses_to_delta() {
        let ev = parse_chunk_line(r#"{"token": "hel"}"#).unwrap().unwrap();
        assert_eq!(ev, StreamEvent::TokenDelta("hel".into()));
    }

    #[test]
    fn done_chunk_terminates_stream() {
        let ev = parse_chunk_line(r#"{"done": true}"#).unwrap().unwrap();
        assert_eq!(ev, StreamEvent::Done);
    }

    #[test]
    fn tool_call_chunk_carries_name_and_parameters() {
        let ev = parse_chunk_line(r#"{"tool_call": {"name": "weather", "parameters": {"city": "x"}}}"#)
            .unwrap()
            .unwrap();
        match ev {
            StreamEvent::ToolCallRequest { name, parameters } => {
                assert_eq!(name, "weather");
                assert_eq!(parameters["city"], "x");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn error_chunk_becomes_transport_error() {
        let ev = parse_chunk_line(r#"{"error": "backend shutting down"}"#).unwrap();
        assert!(matches!(ev, Err(ModelError::Transport(_))));
    }

    #[test]
    fn empty_lines_are_skipped() {
        assert!(parse_chunk_line("").is_none());
        assert!(parse_chunk_line("   ").is_none());
    }

    #[test]
    fn garbage_line_is_protocol_error() {
        let ev = parse_chunk_line("not json").unwrap();
        assert!(matches!(ev, Err(ModelError::Protocol(_))));
    }

    // ── Line-buffer behaviour across chunk boundaries ─────────────────────────

    #[test]
    fn complete_lines_drain_fully() {
        let mut buf = "{\"token\": \"a\"}\n{\"done\": true}\n".to_string();
        let events = drain_complete_lines(&mut buf);
        assert_eq!(events.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_line_stays_in_buffer() {
        let mut buf = "{\"token\": \"a\"}\n{\"tok".to_string();
        let events = drain_complete_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(buf, "{\"tok");
    }

    #[test]
    fn chunk_split_mid_line_parses_after_completion() {
        let full = "{\"token\": \"hello world\"}\n";
        let (a, b) = full.split_at(10);
        let mut buf = a.to_string();
        assert!(drain_complete_lines(&mut buf).is_empty());
        buf.push_str(b);
        let events = drain_complete_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Ok(StreamEvent::TokenDelta(t)) if t == "hello world"
        ));
    }
}
