//! Claude CLI backend.
//!
//! Every request runs `claude -p <prompt>` once. Streaming requests use the
//! CLI's `stream-json` output, whose records look like:
//!
//! ```text
//! {"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}}
//! {"type":"result","result":"Hi","usage":{"input_tokens":3,"output_tokens":1}}
//! ```

use super::sse_response;
use crate::auth;
use crate::config::ClaudeConfig;
use crate::error::ProxyError;
use crate::translation::build_prompt;
use crate::types::ChatRequest;
use actix_web::{web, HttpRequest, HttpResponse};
use agentrelay_relay::types::{unix_now, ChatCompletion, CompletionUsage, ModelList};
use agentrelay_relay::{encode_stream, ChunkEncoder, OutputDelta};
use async_stream::stream;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, warn};

const DEFAULT_MODEL: &str = "claude-sonnet";
const OWNED_BY: &str = "claude-code";
const NO_RESPONSE: &str = "(No response from Claude)";

pub struct ClaudeState {
    config: ClaudeConfig,
}

impl ClaudeState {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClaudeConfig {
        &self.config
    }

    /// CLI invocation for one prompt.
    pub fn command(&self, prompt: &str, model: &str, streaming: bool) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(self.config.models.resolve(model));
        if streaming {
            cmd.args([
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
            ]);
        } else {
            cmd.args(["--output-format", "json"]);
        }
        cmd.arg("--no-session-persistence");

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/v1/models", web::get().to(list_models))
        .route("/v1/chat/completions", web::post().to(chat_completions));
}

async fn list_models(
    state: web::Data<ClaudeState>,
    req: HttpRequest,
) -> Result<HttpResponse, ProxyError> {
    auth::authorize(&req, &state.config.api_key)?;
    let list = ModelList::new(state.config.models.public_ids(), unix_now(), OWNED_BY);
    Ok(HttpResponse::Ok().json(list))
}

async fn chat_completions(
    state: web::Data<ClaudeState>,
    req: HttpRequest,
    body: web::Json<ChatRequest>,
) -> Result<HttpResponse, ProxyError> {
    auth::authorize(&req, &state.config.api_key)?;

    let body = body.into_inner();
    let model = body.model_or(DEFAULT_MODEL).to_string();
    let prompt = build_prompt(&body.messages);
    if prompt.is_empty() {
        return Err(ProxyError::BadRequest("No message content found".to_string()));
    }

    debug!(%model, stream = body.stream, prompt_len = prompt.len(), "claude request");

    if body.stream {
        let mut cmd = state.command(&prompt, &model, true);
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        let child = cmd.spawn().map_err(|e| {
            error!(error = %e, binary = %state.config.binary, "failed to start claude");
            ProxyError::Backend(format!("Claude process failed: {}", e))
        })?;

        let encoder = ChunkEncoder::for_model(model);
        return Ok(sse_response(encode_stream(encoder, stream_deltas(child))));
    }

    let output = state
        .command(&prompt, &model, false)
        .output()
        .await
        .map_err(|e| ProxyError::Backend(format!("Claude process failed: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            "Unknown error".to_string()
        } else {
            stderr
        };
        warn!(status = %output.status, "claude exited with failure");
        return Err(ProxyError::Backend(format!(
            "Claude process failed: {}",
            message
        )));
    }

    let (content, usage) = parse_json_output(&String::from_utf8_lossy(&output.stdout));
    let completion = ChatCompletion::assistant(
        agentrelay_relay::types::new_completion_id(),
        unix_now(),
        model,
        content,
        usage,
    );
    Ok(HttpResponse::Ok().json(completion))
}

/// One meaningful record of `stream-json` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    Text(String),
    Result,
}

pub fn parse_stream_line(line: &str) -> Option<StreamRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let record: Value = serde_json::from_str(line).ok()?;

    match record.get("type").and_then(Value::as_str)? {
        "result" => Some(StreamRecord::Result),
        "stream_event" => {
            let event = record.get("event")?;
            if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
                return None;
            }
            let delta = event.get("delta")?;
            if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                return None;
            }
            delta
                .get("text")
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
                .map(|text| StreamRecord::Text(text.to_string()))
        }
        _ => None,
    }
}

/// Read the child's stdout until a `result` record or EOF.
///
/// The child is owned by the stream; dropping the stream kills it.
fn stream_deltas(mut child: Child) -> impl futures::Stream<Item = OutputDelta> + Send {
    stream! {
        yield OutputDelta::Role;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_stream_line(&line) {
                        Some(StreamRecord::Text(text)) => {
                            yield OutputDelta::Content(text);
                        }
                        Some(StreamRecord::Result) => break,
                        None => {}
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "reading claude output failed");
                        break;
                    }
                }
            }
        }

        yield OutputDelta::Stop;

        if let Ok(None) = child.try_wait() {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;
    }
}

/// Interpret `--output-format json` stdout. Non-JSON output is the answer.
pub fn parse_json_output(stdout: &str) -> (String, CompletionUsage) {
    let value: Value = match serde_json::from_str(stdout) {
        Ok(v) => v,
        Err(_) => return (stdout.trim().to_string(), CompletionUsage::default()),
    };

    let content = value
        .get("result")
        .and_then(Value::as_str)
        .unwrap_or(NO_RESPONSE)
        .to_string();
    let tokens = |key: &str| {
        value
            .get("usage")
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    (
        content,
        CompletionUsage::new(tokens("input_tokens"), tokens("output_tokens")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_parse_text_delta() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}}"#;
        assert_eq!(
            parse_stream_line(line),
            Some(StreamRecord::Text("Hello".into()))
        );
    }

    #[test]
    fn test_parse_ignores_other_records() {
        for line in [
            "",
            "not json",
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"stream_event","event":{"type":"message_start"}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":""}}}"#,
        ] {
            assert_eq!(parse_stream_line(line), None, "{}", line);
        }
        assert_eq!(
            parse_stream_line(r#"{"type":"result","result":"x"}"#),
            Some(StreamRecord::Result)
        );
    }

    #[test]
    fn test_parse_json_output() {
        let (content, usage) = parse_json_output(
            r#"{"type":"result","result":"Done.","usage":{"input_tokens":10,"output_tokens":5}}"#,
        );
        assert_eq!(content, "Done.");
        assert_eq!(usage, CompletionUsage::new(10, 5));

        let (content, usage) = parse_json_output(r#"{"type":"result"}"#);
        assert_eq!(content, NO_RESPONSE);
        assert_eq!(usage.total_tokens, 0);

        let (content, _) = parse_json_output("  plain text answer\n");
        assert_eq!(content, "plain text answer");
    }

    #[test]
    fn test_command_arguments() {
        let state = ClaudeState::new(ClaudeConfig {
            binary: "/opt/claude".into(),
            ..ClaudeConfig::default()
        });

        let cmd = state.command("[User]: hi", "claude-opus", true);
        let std = cmd.as_std();
        assert_eq!(std.get_program(), OsStr::new("/opt/claude"));
        let args: Vec<&OsStr> = std.get_args().collect();
        assert_eq!(
            args,
            [
                "-p",
                "[User]: hi",
                "--model",
                "opus",
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
                "--no-session-persistence",
            ]
            .map(OsStr::new)
        );

        let cmd = state.command("[User]: hi", "unknown", false);
        let args: Vec<&OsStr> = cmd.as_std().get_args().collect();
        assert_eq!(
            args,
            [
                "-p",
                "[User]: hi",
                "--model",
                "sonnet",
                "--output-format",
                "json",
                "--no-session-persistence",
            ]
            .map(OsStr::new)
        );
    }
}
