//! Merge engine.
//!
//! Interleaves tool events from the log tailer with upstream deltas from the
//! reconnection controller into one ordered sequence of [`OutputDelta`]s.
//!
//! Tool activity and retry notes are wrapped in an activity block:
//!
//! ```text
//! :::thinking
//! [exec] started
//! [exec] completed
//!
//! :::
//! ```
//!
//! At most one block is open at a time. It is closed before the first piece
//! of assistant text that follows it and before the terminal `Stop`.

use crate::config::RelayConfig;
use crate::encoder::{encode_stream, ChunkEncoder, OutputDelta};
use crate::event_log::{LogSource, LogTailer, ToolEvent};
use crate::reconnect::{ReconnectController, RelayEvent};
use crate::upstream::{Gateway, GatewayRequest, UpstreamDelta};
use async_stream::stream;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const ACTIVITY_OPEN: &str = ":::thinking\n";
pub const ACTIVITY_CLOSE: &str = "\n:::\n";

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveTool {
    tool: String,
    call_id: String,
}

/// Per-request merge state.
///
/// Failure details carry no call id, so a `Detail` is attributed to the
/// single currently active call when the tool names match. Two concurrent
/// calls of the same tool would share that attribution.
#[derive(Debug)]
pub struct Session {
    encoder: ChunkEncoder,
    block_open: bool,
    active_tool: Option<ActiveTool>,
    failed_calls: HashSet<String>,
    finished: bool,
}

impl Session {
    pub fn new(encoder: ChunkEncoder) -> Self {
        Self {
            encoder,
            block_open: false,
            active_tool: None,
            failed_calls: HashSet::new(),
            finished: false,
        }
    }

    pub fn encoder(&self) -> &ChunkEncoder {
        &self.encoder
    }

    pub fn is_block_open(&self) -> bool {
        self.block_open
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn on_tool_event(&mut self, event: ToolEvent) -> Vec<OutputDelta> {
        if self.finished {
            return Vec::new();
        }

        match event {
            ToolEvent::Start { tool, call_id } => {
                let line = format!("[{}] started\n", tool);
                self.active_tool = Some(ActiveTool { tool, call_id });
                self.annotate(line)
            }
            ToolEvent::Detail { tool, message } => {
                if let Some(active) = &self.active_tool {
                    if active.tool == tool {
                        self.failed_calls.insert(active.call_id.clone());
                    }
                }
                self.annotate(format!("[{}] FAILED: {}\n", tool, message))
            }
            ToolEvent::End { tool, call_id } => {
                self.active_tool = None;
                if self.failed_calls.contains(&call_id) {
                    Vec::new()
                } else {
                    self.annotate(format!("[{}] completed\n", tool))
                }
            }
        }
    }

    /// Retry progress. Stays inside the block until real text or stop.
    pub fn on_note(&mut self, note: &str) -> Vec<OutputDelta> {
        if self.finished {
            return Vec::new();
        }
        self.annotate(note.to_string())
    }

    pub fn on_text(&mut self, text: &str) -> Vec<OutputDelta> {
        if self.finished || text.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.close_block(&mut out);
        out.push(OutputDelta::content(text));
        out
    }

    pub fn finish(&mut self) -> Vec<OutputDelta> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.close_block(&mut out);
        out.push(OutputDelta::Stop);
        self.finished = true;
        out
    }

    /// Terminal error: close the block, show `message`, stop.
    pub fn fail(&mut self, message: String) -> Vec<OutputDelta> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.close_block(&mut out);
        out.push(OutputDelta::Content(message));
        out.push(OutputDelta::Stop);
        self.finished = true;
        out
    }

    fn annotate(&mut self, line: String) -> Vec<OutputDelta> {
        let mut out = Vec::with_capacity(2);
        if !self.block_open {
            self.block_open = true;
            out.push(OutputDelta::content(ACTIVITY_OPEN));
        }
        out.push(OutputDelta::Content(line));
        out
    }

    fn close_block(&mut self, out: &mut Vec<OutputDelta>) {
        if self.block_open {
            self.block_open = false;
            out.push(OutputDelta::content(ACTIVITY_CLOSE));
        }
    }
}

/// Run the merge loop.
///
/// Waits at most `wait` for the next upstream event, then drains every queued
/// tool event before handling that upstream event. The tailer, if any, is
/// shut down before the stream ends; dropping the stream early aborts it.
pub fn merge<U>(
    mut session: Session,
    upstream: U,
    mut events: mpsc::Receiver<ToolEvent>,
    tailer: Option<LogTailer>,
    wait: Duration,
) -> impl Stream<Item = OutputDelta> + Send
where
    U: Stream<Item = RelayEvent> + Send + 'static,
{
    stream! {
        let mut upstream = Box::pin(upstream);
        yield OutputDelta::Role;

        loop {
            let next = tokio::time::timeout(wait, upstream.next()).await;

            while let Ok(event) = events.try_recv() {
                for delta in session.on_tool_event(event) {
                    yield delta;
                }
            }

            let Ok(next) = next else {
                continue;
            };

            let out = match next {
                Some(RelayEvent::Delta(UpstreamDelta::Text(text))) => session.on_text(&text),
                Some(RelayEvent::Delta(UpstreamDelta::Finish)) | None => session.finish(),
                Some(RelayEvent::Delta(UpstreamDelta::Error { code, body })) => {
                    warn!(
                        code = code.as_deref().unwrap_or("none"),
                        error = %body,
                        "gateway sent an error chunk"
                    );
                    session.fail(format!("Error: {}", body))
                }
                Some(RelayEvent::Retrying { note, .. }) | Some(RelayEvent::Recovered { note }) => {
                    session.on_note(&note)
                }
                Some(RelayEvent::Failed(failure)) => session.fail(failure.client_message()),
            };
            for delta in out {
                yield delta;
            }

            if session.is_finished() {
                break;
            }
        }

        if let Some(tailer) = tailer {
            tailer.shutdown().await;
        }
        debug!(completion_id = session.encoder().completion_id(), "relay session closed");
    }
}

/// A running relay session.
pub struct RelayStream {
    encoder: ChunkEncoder,
    deltas: BoxStream<'static, OutputDelta>,
}

impl RelayStream {
    pub fn encoder(&self) -> &ChunkEncoder {
        &self.encoder
    }

    pub fn into_deltas(self) -> BoxStream<'static, OutputDelta> {
        self.deltas
    }

    /// Encoded SSE frames, ending with the `[DONE]` terminator.
    pub fn into_frames(self) -> BoxStream<'static, String> {
        encode_stream(self.encoder, self.deltas).boxed()
    }
}

/// Streaming relay in front of one gateway.
pub struct Relay<G: ?Sized> {
    gateway: Arc<G>,
    config: RelayConfig,
    log_source: Option<LogSource>,
}

impl<G> Relay<G>
where
    G: Gateway + ?Sized + 'static,
{
    pub fn new(gateway: Arc<G>, config: RelayConfig) -> Self {
        Self {
            gateway,
            config,
            log_source: None,
        }
    }

    pub fn with_log_source(mut self, source: LogSource) -> Self {
        self.log_source = Some(source);
        self
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Start one session.
    ///
    /// The tail cursor is captured here, before the upstream request is
    /// issued on first poll of the returned stream.
    pub async fn start(&self, request: GatewayRequest, model: &str) -> RelayStream {
        let encoder = ChunkEncoder::for_model(model);
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));

        let tailer = match &self.log_source {
            Some(source) => source.start_tailer(self.config.log_poll(), tx).await,
            None => None,
        };
        info!(
            completion_id = encoder.completion_id(),
            model,
            tailing = ?tailer.as_ref().map(|t| t.path().to_path_buf()),
            "relay session started"
        );

        let controller =
            ReconnectController::new(self.gateway.clone(), request, self.config.clone());
        let deltas = merge(
            Session::new(encoder.clone()),
            controller.into_stream(),
            rx,
            tailer,
            self.config.upstream_wait(),
        )
        .boxed();

        RelayStream { encoder, deltas }
    }
}
