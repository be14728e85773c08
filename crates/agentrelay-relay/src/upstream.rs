//! Upstream stream reader.
//!
//! One call to [`Gateway::open_stream`] issues one request against the
//! gateway and yields [`UpstreamDelta`]s decoded from its SSE body. Transport
//! problems surface as [`UpstreamFailure`] values, never as panics or raw
//! `reqwest` errors.

use crate::config::RelayConfig;
use crate::error::UpstreamFailure;
use async_stream::stream;
use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, trace};

/// Bodies of failed responses are cut to this many characters.
pub const ERROR_BODY_LIMIT: usize = 500;

/// A fact extracted from the gateway stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamDelta {
    Text(String),
    Finish,
    /// In-band error object sent instead of a chunk.
    Error { code: Option<String>, body: String },
}

impl UpstreamDelta {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish | Self::Error { .. })
    }
}

pub type DeltaStream = BoxStream<'static, Result<UpstreamDelta, UpstreamFailure>>;

/// Request forwarded to the gateway.
#[derive(Debug, Clone, Default)]
pub struct GatewayRequest {
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

impl GatewayRequest {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Buffered (non-streaming) gateway answer.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Value,
}

/// The backend gateway as seen by the relay.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Issue one streaming request.
    async fn open_stream(&self, request: &GatewayRequest) -> Result<DeltaStream, UpstreamFailure>;

    /// Issue one buffered request.
    async fn complete(&self, request: &GatewayRequest) -> Result<GatewayResponse, UpstreamFailure>;

    /// One liveness probe. `true` when the gateway answers successfully.
    async fn probe(&self) -> bool;
}

/// [`Gateway`] backed by an OpenAI-compatible HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
    read_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpGateway {
    pub fn new(base_url: &str, config: &RelayConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            read_timeout: config.read_timeout(),
            probe_timeout: config.liveness_probe_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, request: &GatewayRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.url("/v1/chat/completions"))
            .json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    async fn send(&self, request: &GatewayRequest) -> Result<reqwest::Response, UpstreamFailure> {
        // The gateway may hold the response until its tool loop finishes.
        match tokio::time::timeout(self.read_timeout, self.post(request).send()).await {
            Err(_) => Err(UpstreamFailure::Timeout(format!(
                "no response within {}s",
                self.read_timeout.as_secs()
            ))),
            Ok(Err(e)) => Err(classify_send_error(&e)),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn open_stream(&self, request: &GatewayRequest) -> Result<DeltaStream, UpstreamFailure> {
        let response = self.send(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamFailure::ServerError {
                status: status.as_u16(),
                body: truncate_chars(&body, ERROR_BODY_LIMIT),
            });
        }

        debug!(%status, "gateway stream opened");
        Ok(decode_sse(response.bytes_stream(), self.read_timeout).boxed())
    }

    async fn complete(&self, request: &GatewayRequest) -> Result<GatewayResponse, UpstreamFailure> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let text = match tokio::time::timeout(self.read_timeout, response.text()).await {
            Err(_) => {
                return Err(UpstreamFailure::Timeout(format!(
                    "body not received within {}s",
                    self.read_timeout.as_secs()
                )))
            }
            Ok(Err(e)) => return Err(UpstreamFailure::MidStreamDrop(e.to_string())),
            Ok(Ok(text)) => text,
        };

        let body = serde_json::from_str(&text)
            .unwrap_or_else(|_| json!({"error": {"message": truncate_chars(&text, ERROR_BODY_LIMIT)}}));
        Ok(GatewayResponse { status, body })
    }

    async fn probe(&self) -> bool {
        let probe = self
            .client
            .get(self.url("/v1/models"))
            .timeout(self.probe_timeout)
            .send()
            .await;
        match probe {
            Ok(response) => response.status().as_u16() == 200,
            Err(e) => {
                trace!(error = %e, "liveness probe failed");
                false
            }
        }
    }
}

fn classify_send_error(e: &reqwest::Error) -> UpstreamFailure {
    if e.is_connect() {
        UpstreamFailure::Connect(e.to_string())
    } else if e.is_timeout() {
        UpstreamFailure::Timeout(e.to_string())
    } else {
        UpstreamFailure::MidStreamDrop(e.to_string())
    }
}

/// Failure on the raw body, before SSE framing.
#[derive(Debug)]
enum BodyError<E> {
    Stalled(Duration),
    Transport(E),
}

impl<E: Display> Display for BodyError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stalled(after) => write!(f, "no bytes within {}s", after.as_secs()),
            Self::Transport(e) => e.fmt(f),
        }
    }
}

/// Pass body chunks through, failing once no bytes arrive for `read_timeout`.
///
/// Every chunk resets the timer, SSE comments included.
fn with_read_timeout<S, B, E>(
    bytes: S,
    read_timeout: Duration,
) -> impl Stream<Item = Result<B, BodyError<E>>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Send + 'static,
    E: Send + 'static,
{
    stream! {
        let mut bytes = Box::pin(bytes);
        loop {
            match tokio::time::timeout(read_timeout, bytes.next()).await {
                Err(_) => {
                    yield Err(BodyError::Stalled(read_timeout));
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => {
                    yield Ok(chunk);
                }
                Ok(Some(Err(e))) => {
                    yield Err(BodyError::Transport(e));
                    break;
                }
            }
        }
    }
}

/// Decode an OpenAI-style SSE byte stream into deltas.
///
/// Ends after `[DONE]`, a terminal delta, a failure, or the end of the body.
/// Undecodable chunks are skipped.
pub fn decode_sse<S, B, E>(
    bytes: S,
    read_timeout: Duration,
) -> impl Stream<Item = Result<UpstreamDelta, UpstreamFailure>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    stream! {
        let mut events = Box::pin(with_read_timeout(bytes, read_timeout).eventsource());
        while let Some(next) = events.next().await {
            let event = match next {
                Ok(event) => event,
                Err(EventStreamError::Transport(stalled @ BodyError::Stalled(_))) => {
                    yield Err(UpstreamFailure::Timeout(stalled.to_string()));
                    break;
                }
                Err(e) => {
                    yield Err(UpstreamFailure::MidStreamDrop(e.to_string()));
                    break;
                }
            };

            if event.data.trim() == "[DONE]" {
                break;
            }

            let mut terminal = false;
            for delta in parse_chunk(&event.data) {
                terminal |= delta.is_terminal();
                yield Ok(delta);
            }
            if terminal {
                break;
            }
        }
    }
}

/// Interpret one `data:` payload.
///
/// A chunk carrying both text and a finish reason yields the text first.
pub fn parse_chunk(data: &str) -> Vec<UpstreamDelta> {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            trace!(error = %e, "skipping undecodable upstream chunk");
            return Vec::new();
        }
    };

    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return vec![parse_error(error)];
    }

    let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        return Vec::new();
    };

    let mut deltas = Vec::new();
    let text = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("");
    if !text.is_empty() {
        deltas.push(UpstreamDelta::Text(text.to_string()));
    }

    let finished = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .is_some_and(|reason| !reason.is_empty());
    if finished {
        deltas.push(UpstreamDelta::Finish);
    }

    deltas
}

fn parse_error(error: &Value) -> UpstreamDelta {
    let code = error.get("code").and_then(|code| match code {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    let body = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    UpstreamDelta::Error { code, body }
}

pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunk(content: Option<&str>, finish: Option<&str>) -> String {
        let delta = match content {
            Some(c) => json!({"content": c}),
            None => json!({}),
        };
        json!({
            "id": "chatcmpl-up",
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
        })
        .to_string()
    }

    async fn decode(body: Vec<&'static str>) -> Vec<Result<UpstreamDelta, UpstreamFailure>> {
        let bytes = stream::iter(body.into_iter().map(Ok::<_, std::io::Error>));
        decode_sse(bytes, Duration::from_secs(5)).collect().await
    }

    #[test]
    fn test_parse_text_and_finish() {
        assert_eq!(
            parse_chunk(&chunk(Some("hi"), None)),
            vec![UpstreamDelta::Text("hi".into())]
        );
        assert_eq!(parse_chunk(&chunk(None, Some("stop"))), vec![UpstreamDelta::Finish]);
        assert_eq!(
            parse_chunk(&chunk(Some("bye"), Some("stop"))),
            vec![UpstreamDelta::Text("bye".into()), UpstreamDelta::Finish]
        );
    }

    #[test]
    fn test_parse_skips_noise() {
        assert!(parse_chunk("not json").is_empty());
        assert!(parse_chunk(r#"{"choices": []}"#).is_empty());
        assert!(parse_chunk(&chunk(Some(""), None)).is_empty());
        assert!(parse_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).is_empty());
    }

    #[test]
    fn test_parse_inband_error() {
        let deltas = parse_chunk(r#"{"error":{"code":"overloaded","message":"try later"}}"#);
        assert_eq!(
            deltas,
            vec![UpstreamDelta::Error {
                code: Some("overloaded".into()),
                body: "try later".into()
            }]
        );

        let deltas = parse_chunk(r#"{"error":"plain"}"#);
        assert_eq!(
            deltas,
            vec![UpstreamDelta::Error {
                code: None,
                body: "plain".into()
            }]
        );
    }

    fn leak(frame: String) -> &'static str {
        Box::leak(frame.into_boxed_str())
    }

    #[tokio::test]
    async fn test_decode_sse_across_split_frames() {
        let body = vec![
            leak(format!("data: {}\n", chunk(Some("Hel"), None))),
            "\ndata: ",
            leak(format!("{}\n\n", chunk(Some("lo"), None))),
            "data: [DONE]\n\n",
            leak(format!("data: {}\n\n", chunk(Some("ignored"), None))),
        ];

        let deltas: Vec<_> = decode(body).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            deltas,
            vec![
                UpstreamDelta::Text("Hel".into()),
                UpstreamDelta::Text("lo".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_sse_stops_after_finish() {
        let body = vec![
            leak(format!("data: {}\n\n", chunk(None, Some("stop")))),
            leak(format!("data: {}\n\n", chunk(Some("late"), None))),
        ];
        let deltas: Vec<_> = decode(body).await.into_iter().map(Result::unwrap).collect();
        assert_eq!(deltas, vec![UpstreamDelta::Finish]);
    }

    #[tokio::test]
    async fn test_decode_sse_transport_error_is_drop() {
        let bytes = stream::iter(vec![
            Ok::<_, std::io::Error>("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n"),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let items: Vec<_> = decode_sse(bytes, Duration::from_secs(5)).collect().await;
        assert_eq!(items[0], Ok(UpstreamDelta::Text("a".into())));
        assert!(matches!(items[1], Err(UpstreamFailure::MidStreamDrop(_))));
        assert_eq!(items.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_sse_read_timeout() {
        let bytes = stream::pending::<Result<&'static str, std::io::Error>>();
        let items: Vec<_> = decode_sse(bytes, Duration::from_secs(30)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(UpstreamFailure::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_sse_keepalive_comments_reset_read_timeout() {
        let data = leak(format!("data: {}\n\n", chunk(Some("after the tool loop"), None)));
        let bytes = async_stream::stream! {
            for _ in 0..6 {
                tokio::time::sleep(Duration::from_secs(10)).await;
                yield Ok::<_, std::io::Error>(": keepalive\n\n");
            }
            yield Ok(data);
        };

        let items: Vec<_> = decode_sse(bytes, Duration::from_secs(30)).collect().await;
        assert_eq!(
            items,
            vec![Ok(UpstreamDelta::Text("after the tool loop".into()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_sse_read_timeout_message() {
        let bytes = async_stream::stream! {
            yield Ok::<_, std::io::Error>(": keepalive\n\n");
            tokio::time::sleep(Duration::from_secs(31)).await;
            yield Ok("data: [DONE]\n\n");
        };
        let items: Vec<_> = decode_sse(bytes, Duration::from_secs(30)).collect().await;
        assert_eq!(
            items,
            vec![Err(UpstreamFailure::Timeout("no bytes within 30s".into()))]
        );
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
