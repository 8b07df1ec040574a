//! Local audio I/O through `arecord` / `aplay` child processes.
//!
//! Capture is a child whose stdout is the producer; playback is a child whose
//! stdin is the consumer. The chime is a short wav played to completion.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::io::ReaderStream;

use crate::config::PLAYBACK_DRAIN_TIMEOUT;
use crate::sink::{ByteSink, ByteSource, SinkError};

/// Local audio devices used by the session coordinator and the playback path.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Pre-roll acknowledgment. Resolves once the cue has finished.
    async fn chime(&self);

    async fn open_capture(&self) -> Result<Box<dyn ByteSource>>;

    async fn open_playback(&self) -> Result<Box<dyn ByteSink>>;
}

/// Commands used to reach the sound card.
#[derive(Clone, Debug)]
pub struct AudioConfig {
    /// Capture command, e.g. `arecord -D <device>`.
    pub capture_command: Vec<String>,
    pub playback_command: Vec<String>,
    /// Player invoked as `<chime_command...> <chime_wav>`.
    pub chime_command: Vec<String>,
    pub chime_wav: Option<PathBuf>,
}

/// [`AudioBackend`] backed by child processes.
pub struct ProcessAudio {
    config: AudioConfig,
}

impl ProcessAudio {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AudioBackend for ProcessAudio {
    async fn chime(&self) {
        let Some(wav) = self.config.chime_wav.as_ref() else {
            return;
        };
        if tokio::fs::metadata(wav).await.is_err() {
            tracing::debug!(path = %wav.display(), "chime file missing, skipping pre-roll cue");
            return;
        }
        let mut cmd = match build_command(&self.config.chime_command) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!("chime: {e:#}");
                return;
            }
        };
        cmd.arg(wav).stdin(Stdio::null()).stdout(Stdio::null());
        match cmd.status().await {
            Ok(status) if !status.success() => {
                tracing::warn!(status = %status, "chime: player exited with failure");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "chime: failed to start player"),
        }
    }

    async fn open_capture(&self) -> Result<Box<dyn ByteSource>> {
        let mut cmd = build_command(&self.config.capture_command)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn capture {:?}", self.config.capture_command))?;
        let stdout = child.stdout.take().context("capture stdout not piped")?;
        tracing::debug!(pid = ?child.id(), "capture process started");
        Ok(Box::new(ProcessCapture {
            _child: child,
            stdout: ReaderStream::new(stdout),
        }))
    }

    async fn open_playback(&self) -> Result<Box<dyn ByteSink>> {
        let mut cmd = build_command(&self.config.playback_command)?;
        cmd.stdin(Stdio::piped()).stdout(Stdio::null());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn playback {:?}", self.config.playback_command))?;
        let stdin = child.stdin.take().context("playback stdin not piped")?;
        tracing::debug!(pid = ?child.id(), "playback process started");
        Ok(Box::new(ProcessPlayback {
            child,
            stdin: Some(stdin),
        }))
    }
}

fn build_command(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .context("audio command must not be empty")?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Capture child; killed when dropped.
struct ProcessCapture {
    _child: Child,
    stdout: ReaderStream<ChildStdout>,
}

#[async_trait]
impl ByteSource for ProcessCapture {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        self.stdout.next().await.transpose()
    }
}

struct ProcessPlayback {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ByteSink for ProcessPlayback {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        let stdin = self.stdin.as_mut().ok_or(SinkError::Closed)?;
        stdin.write_all(&chunk).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<(), SinkError> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        // Closing stdin lets the player drain its buffer and exit on its own.
        match tokio::time::timeout(PLAYBACK_DRAIN_TIMEOUT, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                if !status.success() {
                    tracing::warn!(status = %status, "playback process exited with failure");
                }
                Ok(())
            }
            Err(_) => {
                let _ = self.child.kill().await;
                Err(SinkError::Timeout)
            }
        }
    }
}
