//! Recording session coordinator.
//!
//! Drives `Idle -> PreRoll -> Recording -> Idle` from button edges, the
//! pre-roll chime, the auto-stop timer and the capture process. Deferred
//! completions come back through the node's event channel tagged with the
//! session generation; anything from a superseded session is ignored.
//!
//! Bytes never pass through the coordinator. Each recording gets a pump task
//! that owns the capture source and the fan-out; stopping a session cancels
//! the pump, which then closes every peer stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioBackend;
use crate::fanout::Fanout;
use crate::node::NodeEvent;
use crate::sink::PeerConnector;

/// Deferred completions delivered back to the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    PreRollComplete { generation: u64 },
    TimedOut { generation: u64 },
    CaptureEnded { generation: u64 },
}

/// Observable coordinator state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PreRoll { generation: u64 },
    Recording { generation: u64 },
}

struct PendingSession {
    generation: u64,
    cancel: CancellationToken,
    chime: JoinHandle<()>,
}

struct ActiveSession {
    generation: u64,
    cancel: CancellationToken,
    timer: JoinHandle<()>,
}

enum Phase {
    Idle,
    PreRoll(PendingSession),
    Recording(ActiveSession),
}

pub struct SessionCoordinator {
    audio: Arc<dyn AudioBackend>,
    connector: Arc<dyn PeerConnector>,
    events: UnboundedSender<NodeEvent>,
    recording_timeout: Duration,
    generation: u64,
    phase: Phase,
    /// Pump of the most recent recording; the next pump waits for it.
    draining: Option<JoinHandle<()>>,
}

impl SessionCoordinator {
    pub fn new(
        audio: Arc<dyn AudioBackend>,
        connector: Arc<dyn PeerConnector>,
        events: UnboundedSender<NodeEvent>,
        recording_timeout: Duration,
    ) -> Self {
        Self {
            audio,
            connector,
            events,
            recording_timeout,
            generation: 0,
            phase: Phase::Idle,
            draining: None,
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.phase {
            Phase::Idle => SessionState::Idle,
            Phase::PreRoll(p) => SessionState::PreRoll {
                generation: p.generation,
            },
            Phase::Recording(a) => SessionState::Recording {
                generation: a.generation,
            },
        }
    }

    /// Button pressed: tear down whatever runs and start a fresh pre-roll.
    pub fn press(&mut self) {
        self.stop("superseded");
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();

        let audio = self.audio.clone();
        let events = self.events.clone();
        let token = cancel.clone();
        let chime = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = audio.chime() => {}
            }
            if !token.is_cancelled() {
                let _ = events.send(NodeEvent::Session(SessionEvent::PreRollComplete {
                    generation,
                }));
            }
        });

        tracing::debug!(generation, "session: pre-roll started");
        self.phase = Phase::PreRoll(PendingSession {
            generation,
            cancel,
            chime,
        });
    }

    /// Button released: stop the current session, if any.
    pub fn release(&mut self) {
        self.stop("released");
    }

    /// Apply a deferred completion. `peers` is only called when a recording
    /// actually starts.
    pub fn handle<F>(&mut self, event: SessionEvent, peers: F)
    where
        F: FnOnce() -> Vec<String>,
    {
        match event {
            SessionEvent::PreRollComplete { generation } => {
                if matches!(&self.phase, Phase::PreRoll(p) if p.generation == generation) {
                    self.start_recording(peers());
                } else {
                    tracing::debug!(generation, "session: stale pre-roll completion ignored");
                }
            }
            SessionEvent::TimedOut { generation } => {
                if self.is_recording(generation) {
                    self.stop("timeout");
                }
            }
            SessionEvent::CaptureEnded { generation } => {
                if self.is_recording(generation) {
                    self.stop("capture ended");
                }
            }
        }
    }

    /// Stop everything and wait until the last pump has closed its streams.
    pub async fn shutdown(&mut self) {
        self.stop("shutdown");
        if let Some(pump) = self.draining.take() {
            let _ = pump.await;
        }
    }

    fn is_recording(&self, generation: u64) -> bool {
        matches!(&self.phase, Phase::Recording(a) if a.generation == generation)
    }

    fn start_recording(&mut self, peers: Vec<String>) {
        let Phase::PreRoll(pending) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let generation = pending.generation;
        let cancel = pending.cancel;
        tracing::info!(generation, peers = peers.len(), "session: recording started");

        let pump = tokio::spawn(run_pump(Pump {
            generation,
            peers,
            cancel: cancel.clone(),
            previous: self.draining.take(),
            audio: self.audio.clone(),
            connector: self.connector.clone(),
            events: self.events.clone(),
        }));
        self.draining = Some(pump);

        let events = self.events.clone();
        let timeout = self.recording_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events.send(NodeEvent::Session(SessionEvent::TimedOut { generation }));
        });

        self.phase = Phase::Recording(ActiveSession {
            generation,
            cancel,
            timer,
        });
    }

    fn stop(&mut self, reason: &'static str) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::PreRoll(pending) => {
                pending.cancel.cancel();
                pending.chime.abort();
                tracing::info!(
                    generation = pending.generation,
                    reason,
                    "session: cancelled before recording"
                );
            }
            Phase::Recording(active) => {
                active.cancel.cancel();
                active.timer.abort();
                tracing::info!(generation = active.generation, reason, "session: recording stopped");
            }
        }
    }
}

struct Pump {
    generation: u64,
    peers: Vec<String>,
    cancel: CancellationToken,
    previous: Option<JoinHandle<()>>,
    audio: Arc<dyn AudioBackend>,
    connector: Arc<dyn PeerConnector>,
    events: UnboundedSender<NodeEvent>,
}

async fn run_pump(pump: Pump) {
    let Pump {
        generation,
        peers,
        cancel,
        previous,
        audio,
        connector,
        events,
    } = pump;

    if let Some(previous) = previous {
        let _ = previous.await;
    }
    if cancel.is_cancelled() {
        return;
    }

    let mut fanout = Fanout::open(connector.as_ref(), &peers).await;
    if cancel.is_cancelled() {
        fanout.close().await;
        return;
    }

    let mut source = match audio.open_capture().await {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(generation, "capture failed to start: {e:#}");
            fanout.close().await;
            let _ = events.send(NodeEvent::Session(SessionEvent::CaptureEnded { generation }));
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = source.next_chunk() => match chunk {
                Ok(Some(chunk)) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = fanout.write(chunk) => {}
                },
                Ok(None) => {
                    tracing::debug!(generation, "capture ended");
                    let _ = events.send(NodeEvent::Session(SessionEvent::CaptureEnded { generation }));
                    break;
                }
                Err(e) => {
                    tracing::warn!(generation, error = %e, "capture read failed");
                    let _ = events.send(NodeEvent::Session(SessionEvent::CaptureEnded { generation }));
                    break;
                }
            }
        }
    }

    drop(source);
    fanout.close().await;
    tracing::debug!(generation, "session: streams closed");
}
