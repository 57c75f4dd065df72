//! Networked agent: UltraVox speech-to-text plus Kokoro text-to-speech.
//!
//! Text input goes to Kokoro `/tts` and comes back as one audio chunk.
//! Audio input is buffered until the stream ends, then sent to UltraVox
//! `/stt` and the transcript is returned as text.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};

use super::errors::AgentError;
use super::types::{AgentEvents, AgentStatus, ToolOutcome};
use super::VoiceAgent;

pub const AGENT_TYPE: &str = "UltraVoxKokoro";

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const ULTRAVOX: &str = "UltraVox";
const KOKORO: &str = "Kokoro";

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UltraVoxKokoroConfig {
    pub ultravox_url: String,
    pub kokoro_url: String,
    #[serde(default)]
    pub ultravox_api_key: Option<String>,
    #[serde(default)]
    pub kokoro_api_key: Option<String>,
    /// Total timeout for each service call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Most audio buffered for one stream before it is dropped.
    #[serde(default = "default_max_audio_bytes")]
    pub max_audio_bytes: usize,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_audio_bytes() -> usize {
    10 * 1024 * 1024
}

impl UltraVoxKokoroConfig {
    fn endpoint(base: &str, path: &str) -> String {
        format!("{}/{path}", base.trim_end_matches('/'))
    }
}

/// STT answers with `{text}` or a bare JSON string.
#[derive(Deserialize)]
#[serde(untagged)]
enum Transcript {
    Wrapped { text: String },
    Bare(String),
}

// ─── Agent ───────────────────────────────────────────────────────────────────

pub struct UltraVoxKokoroAgent {
    events: AgentEvents,
    config: Option<UltraVoxKokoroConfig>,
    http: Option<HttpClient>,
    audio: Vec<u8>,
}

impl UltraVoxKokoroAgent {
    pub fn new(events: AgentEvents) -> Self {
        Self {
            events,
            config: None,
            http: None,
            audio: Vec::new(),
        }
    }

    fn ready(&self) -> Result<(&UltraVoxKokoroConfig, &HttpClient), AgentError> {
        match (&self.config, &self.http) {
            (Some(config), Some(http)) => Ok((config, http)),
            _ => Err(AgentError::NotInitialized),
        }
    }

    async fn health_check(http: &HttpClient, service: &str, base: &str) -> Result<(), AgentError> {
        let url = UltraVoxKokoroConfig::endpoint(base, "health");
        let response = http
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::ServiceUnavailable {
                service: service.to_string(),
                endpoint: url.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(AgentError::ServiceUnavailable {
                service: service.to_string(),
                endpoint: url,
                reason: format!("health check returned HTTP {}", response.status().as_u16()),
            });
        }
        Ok(())
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, AgentError> {
        let (config, http) = self.ready()?;
        let url = UltraVoxKokoroConfig::endpoint(&config.kokoro_url, "tts");
        let mut request = http.post(&url).json(&json!({ "text": text }));
        if let Some(key) = config.kokoro_api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| unavailable(KOKORO, &url, e))?;
        let response = check_status(KOKORO, response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| unavailable(KOKORO, &url, e))?;
        Ok(bytes.to_vec())
    }

    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, AgentError> {
        let (config, http) = self.ready()?;
        let url = UltraVoxKokoroConfig::endpoint(&config.ultravox_url, "stt");
        let mut request = http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(audio);
        if let Some(key) = config.ultravox_api_key.as_deref() {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| unavailable(ULTRAVOX, &url, e))?;
        let response = check_status(ULTRAVOX, response).await?;
        let body = response
            .text()
            .await
            .map_err(|e| unavailable(ULTRAVOX, &url, e))?;
        Ok(match serde_json::from_str::<Transcript>(&body) {
            Ok(Transcript::Wrapped { text }) | Ok(Transcript::Bare(text)) => text,
            Err(_) => body,
        })
    }
}

fn unavailable(service: &str, url: &str, e: reqwest::Error) -> AgentError {
    AgentError::ServiceUnavailable {
        service: service.to_string(),
        endpoint: url.to_string(),
        reason: e.to_string(),
    }
}

async fn check_status(
    service: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AgentError::HttpError {
        service: service.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl VoiceAgent for UltraVoxKokoroAgent {
    fn agent_type(&self) -> &'static str {
        AGENT_TYPE
    }

    async fn initialize(&mut self, config: Value) -> Result<(), AgentError> {
        let config: UltraVoxKokoroConfig =
            serde_json::from_value(config).map_err(|e| AgentError::InvalidConfig {
                reason: e.to_string(),
            })?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| AgentError::InvalidConfig {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        for (service, base) in [(ULTRAVOX, &config.ultravox_url), (KOKORO, &config.kokoro_url)] {
            if let Err(e) = Self::health_check(&http, service, base).await {
                self.events.error(
                    "Failed to connect to UltraVox or Kokoro",
                    Some(e.to_string()),
                );
                return Err(e);
            }
        }

        tracing::info!(
            ultravox = %config.ultravox_url,
            kokoro = %config.kokoro_url,
            "ultravox/kokoro agent initialized"
        );
        self.audio.clear();
        self.config = Some(config);
        self.http = Some(http);
        self.events.status(AgentStatus::Ready, None);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), AgentError> {
        self.audio.clear();
        self.config = None;
        self.http = None;
        self.events.status(AgentStatus::Shutdown, None);
        Ok(())
    }

    async fn process_text_message(&mut self, text: &str) -> Result<(), AgentError> {
        self.ready()?;
        self.events.status(AgentStatus::ProcessingText, None);
        match self.synthesize(text).await {
            Ok(audio) => {
                self.events.audio(audio);
                self.events.status(AgentStatus::Idle, None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "kokoro tts failed");
                self.events.error("Kokoro TTS failed", Some(e.to_string()));
                self.events.status(AgentStatus::Error, None);
            }
        }
        Ok(())
    }

    async fn process_audio_chunk(&mut self, chunk: Vec<u8>) -> Result<(), AgentError> {
        let (config, _) = self.ready()?;
        let limit = config.max_audio_bytes;
        if self.audio.len() + chunk.len() > limit {
            let buffered = self.audio.len();
            self.audio.clear();
            tracing::warn!(buffered, chunk = chunk.len(), limit, "audio stream too large, dropped");
            return Err(AgentError::InvalidInput {
                reason: format!("audio stream exceeds {limit} bytes"),
            });
        }
        if self.audio.is_empty() {
            self.events.status(AgentStatus::ReceivingAudio, None);
        }
        self.audio.extend_from_slice(&chunk);
        Ok(())
    }

    async fn end_audio_stream(&mut self) -> Result<(), AgentError> {
        self.ready()?;
        self.events.status(AgentStatus::ProcessingAudio, None);
        let audio = std::mem::take(&mut self.audio);
        match self.transcribe(audio).await {
            Ok(text) => {
                self.events.text(text);
                self.events.status(AgentStatus::Idle, None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "ultravox stt failed");
                self.events.error("UltraVox STT failed", Some(e.to_string()));
                self.events.status(AgentStatus::Error, None);
            }
        }
        Ok(())
    }

    async fn provide_tool_result(
        &mut self,
        request_id: &str,
        outcome: ToolOutcome,
    ) -> Result<(), AgentError> {
        tracing::debug!(request_id, ok = outcome.is_ok(), "ultravox/kokoro agent got tool result");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::AgentEvent;
    use axum::routing::{get, post};
    use axum::Router;

    /// Local stand-in for both services.
    async fn spawn_services(healthy: bool) -> String {
        let health = if healthy {
            axum::http::StatusCode::OK
        } else {
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        };
        let app = Router::new()
            .route("/health", get(move || async move { health }))
            .route("/tts", post(|body: String| async move { format!("AUDIO:{body}") }))
            .route(
                "/stt",
                post(|body: axum::body::Bytes| async move {
                    axum::Json(json!({ "text": format!("heard {} bytes", body.len()) }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn config(base: &str) -> Value {
        json!({ "ultravoxUrl": base, "kokoroUrl": format!("{base}/"), "kokoroApiKey": "k" })
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_missing_urls_is_invalid_config() {
        let (events, _rx) = AgentEvents::channel();
        let mut agent = UltraVoxKokoroAgent::new(events);
        let err = agent.initialize(json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_unhealthy_service_fails_initialize() {
        let base = spawn_services(false).await;
        let (events, mut rx) = AgentEvents::channel();
        let mut agent = UltraVoxKokoroAgent::new(events);
        let err = agent.initialize(config(&base)).await.unwrap_err();
        assert!(matches!(err, AgentError::ServiceUnavailable { .. }));
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::Error { message, details: Some(_) }
                if message == "Failed to connect to UltraVox or Kokoro"
        )));
        assert!(!events.iter().any(|e| matches!(
            e,
            AgentEvent::StatusUpdate { status: AgentStatus::Ready, .. }
        )));
        assert!(matches!(
            agent.process_text_message("x").await,
            Err(AgentError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_text_to_speech_and_speech_to_text() {
        let base = spawn_services(true).await;
        let (events, mut rx) = AgentEvents::channel();
        let mut agent = UltraVoxKokoroAgent::new(events);
        agent.initialize(config(&base)).await.unwrap();

        agent.process_text_message("hi").await.unwrap();
        let audio = drain(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                AgentEvent::AudioResponseChunk(a) => Some(a),
                _ => None,
            })
            .unwrap();
        assert_eq!(String::from_utf8(audio).unwrap(), r#"AUDIO:{"text":"hi"}"#);

        agent.process_audio_chunk(vec![0; 10]).await.unwrap();
        agent.process_audio_chunk(vec![0; 6]).await.unwrap();
        agent.end_audio_stream().await.unwrap();
        let events = drain(&mut rx);
        assert!(events.contains(&AgentEvent::TextResponse("heard 16 bytes".into())));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(
                    e,
                    AgentEvent::StatusUpdate { status: AgentStatus::ReceivingAudio, .. }
                ))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_oversized_audio_stream_is_rejected() {
        let base = spawn_services(true).await;
        let (events, mut rx) = AgentEvents::channel();
        let mut agent = UltraVoxKokoroAgent::new(events);
        let mut cfg = config(&base);
        cfg["maxAudioBytes"] = json!(8);
        agent.initialize(cfg).await.unwrap();

        agent.process_audio_chunk(vec![0; 6]).await.unwrap();
        let err = agent.process_audio_chunk(vec![0; 6]).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput { .. }));
        assert_eq!(err.to_string(), "invalid input: audio stream exceeds 8 bytes");

        // The buffer was dropped, so a fresh stream fits again.
        drain(&mut rx);
        agent.process_audio_chunk(vec![0; 4]).await.unwrap();
        agent.end_audio_stream().await.unwrap();
        assert!(drain(&mut rx).contains(&AgentEvent::TextResponse("heard 4 bytes".into())));
    }
}
