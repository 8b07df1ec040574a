//! In-memory fakes for the network and audio seams.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, mpsc};

use crate::audio::AudioBackend;
use crate::identity::PeerId;
use crate::sink::{ByteSink, ByteSource, PeerConnector, SinkError};
use crate::verify::{IdentityProbe, ProbeError};

#[derive(Default)]
pub(crate) struct FakeProbe {
    answers: Mutex<HashMap<String, String>>,
}

impl FakeProbe {
    pub(crate) fn answer(&self, hostname: &str, identity: &str) {
        self.answers
            .lock()
            .unwrap()
            .insert(hostname.to_string(), identity.to_string());
    }
}

#[async_trait]
impl IdentityProbe for FakeProbe {
    async fn probe(&self, hostname: &str) -> Result<PeerId, ProbeError> {
        let answer = self.answers.lock().unwrap().get(hostname).cloned();
        match answer {
            Some(id) => Ok(PeerId::from(id.as_str())),
            None => Err(ProbeError::Status(503)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum SinkOp {
    Open(String),
    Write(String, Bytes),
    Finish(String),
}

#[derive(Clone, Default)]
pub(crate) struct SinkLog {
    ops: Arc<Mutex<Vec<SinkOp>>>,
}

impl SinkLog {
    fn push(&self, op: SinkOp) {
        self.ops.lock().unwrap().push(op);
    }

    pub(crate) fn ops(&self) -> Vec<SinkOp> {
        self.ops.lock().unwrap().clone()
    }

    pub(crate) fn opened(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SinkOp::Open(host) => Some(host),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn finished(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SinkOp::Finish(host) => Some(host),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn bytes_for(&self, hostname: &str) -> Vec<u8> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                SinkOp::Write(host, chunk) if host == hostname => Some(chunk.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub(crate) fn total_written(&self) -> usize {
        self.ops()
            .iter()
            .map(|op| match op {
                SinkOp::Write(_, chunk) => chunk.len(),
                _ => 0,
            })
            .sum()
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    pub(crate) log: SinkLog,
    fail_open: HashSet<String>,
    fail_write_after: HashMap<String, usize>,
    stall_write: HashSet<String>,
    stall_finish: HashSet<String>,
}

impl FakeConnector {
    pub(crate) fn failing_open(mut self, hostname: &str) -> Self {
        self.fail_open.insert(hostname.to_string());
        self
    }

    pub(crate) fn failing_write_after(mut self, hostname: &str, writes: usize) -> Self {
        self.fail_write_after.insert(hostname.to_string(), writes);
        self
    }

    /// Writes to `hostname` never complete.
    pub(crate) fn stalling_write(mut self, hostname: &str) -> Self {
        self.stall_write.insert(hostname.to_string());
        self
    }

    /// Finishing `hostname` never completes.
    pub(crate) fn stalling_finish(mut self, hostname: &str) -> Self {
        self.stall_finish.insert(hostname.to_string());
        self
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn open(&self, hostname: &str) -> Result<Box<dyn ByteSink>, SinkError> {
        if self.fail_open.contains(hostname) {
            return Err(SinkError::Unresolved(hostname.to_string()));
        }
        self.log.push(SinkOp::Open(hostname.to_string()));
        Ok(Box::new(FakeSink {
            hostname: hostname.to_string(),
            log: self.log.clone(),
            writes_left: self.fail_write_after.get(hostname).copied(),
            stall_write: self.stall_write.contains(hostname),
            stall_finish: self.stall_finish.contains(hostname),
        }))
    }
}

struct FakeSink {
    hostname: String,
    log: SinkLog,
    writes_left: Option<usize>,
    stall_write: bool,
    stall_finish: bool,
}

#[async_trait]
impl ByteSink for FakeSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if self.stall_write {
            return std::future::pending().await;
        }
        if let Some(left) = self.writes_left.as_mut() {
            if *left == 0 {
                return Err(SinkError::Closed);
            }
            *left -= 1;
        }
        self.log.push(SinkOp::Write(self.hostname.clone(), chunk));
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), SinkError> {
        if self.stall_finish {
            return std::future::pending().await;
        }
        self.log.push(SinkOp::Finish(self.hostname.clone()));
        Ok(())
    }
}

/// Capture source fed by the test through an unbounded channel.
pub(crate) struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl ByteSource for ChannelSource {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

#[derive(Default)]
pub(crate) struct FakeAudio {
    /// When set, the chime waits for a permit on this gate.
    pub(crate) chime_gate: Option<Arc<Notify>>,
    pub(crate) chimes: AtomicUsize,
    pub(crate) capture_opened: Arc<Notify>,
    captures: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
    pub(crate) fail_playback: bool,
    pub(crate) played: Arc<Mutex<Vec<u8>>>,
    pub(crate) playback_finished: Arc<AtomicBool>,
}

impl FakeAudio {
    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            chime_gate: Some(gate),
            ..Self::default()
        }
    }

    pub(crate) fn failing_playback() -> Self {
        Self {
            fail_playback: true,
            ..Self::default()
        }
    }

    /// Sender feeding the most recently opened capture.
    pub(crate) fn capture(&self) -> mpsc::UnboundedSender<Bytes> {
        self.captures
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no capture opened")
    }

    /// Close every capture opened so far.
    pub(crate) fn end_captures(&self) {
        self.captures.lock().unwrap().clear();
    }
}

#[async_trait]
impl AudioBackend for FakeAudio {
    async fn chime(&self) {
        self.chimes.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = self.chime_gate.as_ref() {
            gate.notified().await;
        }
    }

    async fn open_capture(&self) -> anyhow::Result<Box<dyn ByteSource>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.captures.lock().unwrap().push(tx);
        self.capture_opened.notify_one();
        Ok(Box::new(ChannelSource { rx }))
    }

    async fn open_playback(&self) -> anyhow::Result<Box<dyn ByteSink>> {
        if self.fail_playback {
            anyhow::bail!("no playback device");
        }
        Ok(Box::new(FakePlayback {
            played: self.played.clone(),
            finished: self.playback_finished.clone(),
        }))
    }
}

struct FakePlayback {
    played: Arc<Mutex<Vec<u8>>>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl ByteSink for FakePlayback {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        self.played.lock().unwrap().extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), SinkError> {
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}
