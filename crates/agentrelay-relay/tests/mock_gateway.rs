//! Scripted gateway for relay tests
//!
//! Each call to `open_stream` consumes the next queued attempt. An attempt
//! either fails before any bytes arrive or plays back a list of steps.

use agentrelay_relay::{
    DeltaStream, Gateway, GatewayRequest, GatewayResponse, UpstreamDelta, UpstreamFailure,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Step {
    Delta(UpstreamDelta),
    Fail(UpstreamFailure),
    Pause(Duration),
}

#[derive(Debug, Clone)]
pub enum Attempt {
    Refused(UpstreamFailure),
    Plays(Vec<Step>),
}

pub struct MockGateway {
    attempts: Mutex<VecDeque<Attempt>>,
    completions: Mutex<VecDeque<Result<GatewayResponse, UpstreamFailure>>>,
    opened: AtomicUsize,
    probes: AtomicUsize,
    reachable: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            opened: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn refuse(self, failure: UpstreamFailure) -> Self {
        self.attempts
            .lock()
            .unwrap()
            .push_back(Attempt::Refused(failure));
        self
    }

    pub fn play(self, steps: Vec<Step>) -> Self {
        self.attempts.lock().unwrap().push_back(Attempt::Plays(steps));
        self
    }

    pub fn answer(self, response: Result<GatewayResponse, UpstreamFailure>) -> Self {
        self.completions.lock().unwrap().push_back(response);
        self
    }

    pub fn unreachable(self) -> Self {
        self.reachable.store(false, Ordering::SeqCst);
        self
    }

    /// Number of streaming requests issued so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn open_stream(&self, _: &GatewayRequest) -> Result<DeltaStream, UpstreamFailure> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let attempt = self
            .attempts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Attempt::Refused(UpstreamFailure::Connect("script exhausted".into())));

        match attempt {
            Attempt::Refused(failure) => Err(failure),
            Attempt::Plays(steps) => {
                let stream = async_stream::stream! {
                    for step in steps {
                        match step {
                            Step::Delta(delta) => {
                                yield Ok(delta);
                            }
                            Step::Fail(failure) => {
                                yield Err(failure);
                                break;
                            }
                            Step::Pause(duration) => tokio::time::sleep(duration).await,
                        }
                    }
                };
                Ok(stream.boxed())
            }
        }
    }

    async fn complete(&self, _: &GatewayRequest) -> Result<GatewayResponse, UpstreamFailure> {
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(UpstreamFailure::Connect("script exhausted".into())))
    }

    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

pub fn text(s: &str) -> Step {
    Step::Delta(UpstreamDelta::Text(s.to_string()))
}

pub fn finish() -> Step {
    Step::Delta(UpstreamDelta::Finish)
}

pub fn connect_error() -> UpstreamFailure {
    UpstreamFailure::Connect("connection refused".into())
}
