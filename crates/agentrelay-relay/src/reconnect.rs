//! Reconnection controller.
//!
//! Wraps [`Gateway::open_stream`] in a bounded-retry state machine:
//!
//! ```text
//! Connecting -> Streaming -> Succeeded
//!     |             |
//!     +-------------+--> Retrying -> Connecting
//!                   |
//!                   +--> Failed
//! ```
//!
//! The controller is consumed into a stream of [`RelayEvent`]s. Progress
//! notes for every retry travel on the same stream as upstream deltas, so the
//! merge engine can show the client why output paused. Output already
//! forwarded before a drop is kept; the next attempt reissues the whole
//! request.

use crate::config::RelayConfig;
use crate::error::UpstreamFailure;
use crate::upstream::{Gateway, GatewayRequest, GatewayResponse, UpstreamDelta};
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Note emitted once a liveness probe succeeds after a failure.
pub const RECOVERED_NOTE: &str = "✅ gateway back online, retrying request...\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Connecting,
    Streaming,
    Retrying,
    Succeeded,
    Failed,
}

/// What the controller reports to the merge engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Delta(UpstreamDelta),
    /// A retry was scheduled. `attempt` counts from 1.
    Retrying { attempt: u32, note: String },
    Recovered { note: String },
    Failed(RelayFailure),
}

/// Terminal failure of a whole session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayFailure {
    #[error("gateway rejected the request: {0}")]
    Rejected(UpstreamFailure),

    #[error("gateway did not come back after {retries} retries: {last}")]
    Exhausted { retries: u32, last: UpstreamFailure },
}

impl RelayFailure {
    /// Text shown to the client in place of an answer.
    pub fn client_message(&self) -> String {
        match self {
            Self::Rejected(UpstreamFailure::ServerError { body, .. }) => format!("Error: {}", body),
            Self::Rejected(other) => format!("Error: {}", other),
            Self::Exhausted { retries, .. } => format!(
                "\n\n[proxy error: gateway did not come back after {} retries]\n",
                retries
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RetryDecision {
    Retry { attempt: u32, note: String },
    GiveUp(RelayFailure),
}

pub struct ReconnectController<G: ?Sized> {
    gateway: Arc<G>,
    request: GatewayRequest,
    config: RelayConfig,
    retries_used: u32,
    state: AttemptState,
}

impl<G> ReconnectController<G>
where
    G: Gateway + ?Sized + 'static,
{
    pub fn new(gateway: Arc<G>, request: GatewayRequest, config: RelayConfig) -> Self {
        Self {
            gateway,
            request,
            config,
            retries_used: 0,
            state: AttemptState::Connecting,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    fn transition(&mut self, next: AttemptState) {
        debug!(
            from = ?self.state,
            to = ?next,
            retries_used = self.retries_used,
            "relay attempt"
        );
        self.state = next;
    }

    /// Apply one failure to the state machine.
    ///
    /// Every retry spends one unit of the shared budget, whichever phase
    /// failed.
    fn on_failure(&mut self, failure: UpstreamFailure) -> RetryDecision {
        if !failure.is_retryable() {
            self.transition(AttemptState::Failed);
            return RetryDecision::GiveUp(RelayFailure::Rejected(failure));
        }

        if self.retries_used >= self.config.max_retries {
            self.transition(AttemptState::Failed);
            return RetryDecision::GiveUp(RelayFailure::Exhausted {
                retries: self.retries_used,
                last: failure,
            });
        }

        self.retries_used += 1;
        self.transition(AttemptState::Retrying);
        RetryDecision::Retry {
            attempt: self.retries_used,
            note: retry_note(&failure, self.retries_used, self.config.max_retries),
        }
    }

    /// Drive the state machine, yielding deltas, retry notes and finally a
    /// terminal event.
    ///
    /// The stream always ends with `Delta(Finish)`, `Delta(Error { .. })` or
    /// `Failed(..)`. A body that ends without a finish reason counts as
    /// success.
    pub fn into_stream(self) -> impl Stream<Item = RelayEvent> + Send {
        let mut ctl = self;
        stream! {
            loop {
                ctl.transition(AttemptState::Connecting);

                let failure = match ctl.gateway.open_stream(&ctl.request).await {
                    Err(failure) => failure,
                    Ok(mut deltas) => {
                        ctl.transition(AttemptState::Streaming);
                        let mut failure = None;
                        let mut terminal = false;

                        while let Some(item) = deltas.next().await {
                            match item {
                                Ok(delta) => {
                                    terminal = delta.is_terminal();
                                    if terminal {
                                        ctl.transition(match delta {
                                            UpstreamDelta::Finish => AttemptState::Succeeded,
                                            _ => AttemptState::Failed,
                                        });
                                    }
                                    yield RelayEvent::Delta(delta);
                                    if terminal {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }

                        match failure {
                            Some(failure) => failure,
                            None => {
                                if !terminal {
                                    ctl.transition(AttemptState::Succeeded);
                                    yield RelayEvent::Delta(UpstreamDelta::Finish);
                                }
                                return;
                            }
                        }
                    }
                };

                match ctl.on_failure(failure.clone()) {
                    RetryDecision::GiveUp(reason) => {
                        warn!(error = %reason, "gateway request failed for good");
                        yield RelayEvent::Failed(reason);
                        return;
                    }
                    RetryDecision::Retry { attempt, note } => {
                        warn!(
                            attempt,
                            max_retries = ctl.config.max_retries,
                            error = %failure,
                            "gateway attempt failed, retrying"
                        );
                        yield RelayEvent::Retrying { attempt, note };

                        sleep(ctl.config.retry_delay()).await;
                        let back = wait_until_reachable(
                            ctl.gateway.as_ref(),
                            ctl.config.liveness_timeout(),
                            ctl.config.liveness_poll(),
                        )
                        .await;
                        if back {
                            info!(attempt, "gateway reachable again");
                            yield RelayEvent::Recovered { note: RECOVERED_NOTE.to_string() };
                        } else {
                            warn!(attempt, "gateway still unreachable, reconnecting anyway");
                        }
                    }
                }
            }
        }
    }
}

fn retry_note(failure: &UpstreamFailure, attempt: u32, max: u32) -> String {
    match failure {
        UpstreamFailure::Connect(_) => format!(
            "⚡ gateway connection lost, waiting for restart ({}/{})...\n",
            attempt, max
        ),
        UpstreamFailure::ServerError { status, .. } => format!(
            "⚡ gateway returned {}, retrying ({}/{})...\n",
            status, attempt, max
        ),
        other => format!(
            "⚡ connection dropped ({}), retrying ({}/{})...\n",
            other.kind(),
            attempt,
            max
        ),
    }
}

/// Poll the liveness probe until it succeeds or `timeout` elapses.
pub async fn wait_until_reachable<G>(gateway: &G, timeout: Duration, poll: Duration) -> bool
where
    G: Gateway + ?Sized,
{
    let deadline = Instant::now() + timeout;
    loop {
        if gateway.probe().await {
            return true;
        }
        if Instant::now() + poll > deadline {
            return false;
        }
        sleep(poll).await;
    }
}

/// Buffered request with the same retry budget as the streaming path.
pub async fn complete_with_retry<G>(
    gateway: &G,
    request: &GatewayRequest,
    config: &RelayConfig,
) -> Result<GatewayResponse, RelayFailure>
where
    G: Gateway + ?Sized,
{
    let mut retries_used = 0;
    loop {
        let failure = match gateway.complete(request).await {
            Ok(response) => return Ok(response),
            Err(failure) => failure,
        };

        if !failure.is_retryable() {
            return Err(RelayFailure::Rejected(failure));
        }
        if retries_used >= config.max_retries {
            return Err(RelayFailure::Exhausted {
                retries: retries_used,
                last: failure,
            });
        }

        retries_used += 1;
        warn!(
            attempt = retries_used,
            max_retries = config.max_retries,
            error = %failure,
            "gateway request failed, retrying"
        );
        wait_until_reachable(gateway, config.liveness_timeout(), config.liveness_poll()).await;
    }
}
