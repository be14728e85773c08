//! Agentrelay relay core.
//!
//! Streams an OpenAI-compatible gateway's answer to a client while surfacing
//! the gateway's tool activity, which is only visible in its log file, as an
//! inline activity block.
//!
//! Pieces, leaf first:
//! - [`event_log`]: tails the gateway log from a fixed cursor into [`ToolEvent`]s.
//! - [`upstream`]: one streaming request, decoded into [`UpstreamDelta`]s.
//! - [`reconnect`]: bounded retries around the upstream reader.
//! - [`merge`]: interleaves both sources into [`OutputDelta`]s.
//! - [`encoder`]: `chat.completion.chunk` SSE framing.

pub mod config;
pub mod encoder;
pub mod error;
pub mod event_log;
pub mod merge;
pub mod reconnect;
pub mod types;
pub mod upstream;

pub use config::RelayConfig;
pub use encoder::{encode_stream, ChunkEncoder, OutputDelta};
pub use error::UpstreamFailure;
pub use event_log::{LogSource, LogTailer, TailCursor, ToolEvent};
pub use merge::{Relay, RelayStream, Session, ACTIVITY_CLOSE, ACTIVITY_OPEN};
pub use reconnect::{complete_with_retry, ReconnectController, RelayEvent, RelayFailure};
pub use upstream::{
    DeltaStream, Gateway, GatewayRequest, GatewayResponse, HttpGateway, UpstreamDelta,
};
