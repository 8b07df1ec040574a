//! Configuration loading and protocol constants.
//!
//! Every field of the TOML file is optional; missing values fall back to the
//! constants below.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::audio::AudioConfig;
use crate::button::{ButtonConfig, default_pull_up_command};

/// Listening port for the HTTP API and the mDNS advertisement.
pub const HTTP_PORT: u16 = 4242;
/// Service-type label shared by every intercom on the network.
pub const SERVICE_LABEL: &str = "rpi-intercom";
pub const SERVICE_TYPE: &str = "_rpi-intercom._tcp.local.";
/// Header carrying the caller's identity on every peer request.
pub const ID_HEADER: &str = "x-origin-id";

pub const ID_PATH: &str = "/id";
pub const INTERCOM_PATH: &str = "/intercom";
pub const DEBUG_PATH: &str = "/debug";
pub const HEALTH_PATH: &str = "/health";

/// Recording stops on its own after this long.
pub const RECORDING_TIMEOUT: Duration = Duration::from_secs(10);
/// BCM numbering; physical header pin 40.
pub const GPIO_PIN: u32 = 21;
pub const RECORD_DEVICE: &str = "sysdefault:CARD=Device";
pub const CHIME_WAV: &str = "./chime.wav";

pub const IDENTITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(3);
pub const STREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// A peer that has not taken a chunk within this long is dropped.
pub const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Chunks buffered per outbound peer stream before writes wait.
pub const STREAM_CHANNEL_CAPACITY: usize = 32;
pub const PLAYBACK_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Intercom configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct IntercomConfig {
    /// HTTP and mDNS port.
    pub port: Option<u16>,
    /// BCM pin number of the push button.
    pub gpio_pin: Option<u32>,
    /// sysfs number of BCM 0; detected from the header gpiochip when unset.
    pub gpio_chip_base: Option<u32>,
    /// Command enabling the button's pull-up; an empty list skips it.
    pub gpio_pull_command: Option<Vec<String>>,
    /// Network interface for mDNS, e.g. `wlan0`. All interfaces when unset.
    pub mdns_interface: Option<String>,
    /// ALSA capture device passed to `arecord -D`.
    pub record_device: Option<String>,
    /// Auto-stop timeout in milliseconds.
    pub recording_timeout_ms: Option<u64>,
    /// Pre-roll chime; an empty string disables it.
    pub chime_wav: Option<String>,
    /// Full capture command line; overrides `record_device`.
    pub capture_command: Option<Vec<String>>,
    pub playback_command: Option<Vec<String>>,
    pub chime_command: Option<Vec<String>>,
}

impl IntercomConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<IntercomConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Settings resolved from the config file and command line.
#[derive(Clone, Debug)]
pub struct IntercomRunConfig {
    pub http_bind: SocketAddr,
    /// `None` runs without a push button.
    pub button: Option<ButtonConfig>,
    pub mdns_interface: Option<String>,
    pub recording_timeout: Duration,
    pub audio: AudioConfig,
}

impl IntercomRunConfig {
    pub fn port(&self) -> u16 {
        self.http_bind.port()
    }
}

/// Resolve the run configuration. An explicit `http_bind` wins over `port`.
pub fn resolve(
    cfg: &IntercomConfig,
    http_bind: Option<SocketAddr>,
    button: bool,
) -> IntercomRunConfig {
    let http_bind = http_bind.unwrap_or_else(|| {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port.unwrap_or(HTTP_PORT)))
    });
    let button = button.then(|| button_from_config(cfg));
    let mdns_interface = cfg
        .mdns_interface
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string);
    let recording_timeout = cfg
        .recording_timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(RECORDING_TIMEOUT);
    IntercomRunConfig {
        http_bind,
        button,
        mdns_interface,
        recording_timeout,
        audio: audio_from_config(cfg),
    }
}

fn button_from_config(cfg: &IntercomConfig) -> ButtonConfig {
    let pin = cfg.gpio_pin.unwrap_or(GPIO_PIN);
    ButtonConfig {
        pin,
        chip_base: cfg.gpio_chip_base,
        pull_up_command: cfg
            .gpio_pull_command
            .clone()
            .unwrap_or_else(|| default_pull_up_command(pin)),
    }
}

fn audio_from_config(cfg: &IntercomConfig) -> AudioConfig {
    let record_device = cfg.record_device.as_deref().unwrap_or(RECORD_DEVICE);
    let capture_command = non_empty(cfg.capture_command.clone())
        .unwrap_or_else(|| argv(&["arecord", "-D", record_device]));
    let playback_command =
        non_empty(cfg.playback_command.clone()).unwrap_or_else(|| argv(&["aplay"]));
    let chime_command = non_empty(cfg.chime_command.clone()).unwrap_or_else(|| argv(&["aplay"]));
    AudioConfig {
        capture_command,
        playback_command,
        chime_command,
        chime_wav: chime_wav_from_config(cfg),
    }
}

fn chime_wav_from_config(cfg: &IntercomConfig) -> Option<PathBuf> {
    match cfg.chime_wav.as_deref() {
        None => Some(PathBuf::from(CHIME_WAV)),
        Some(path) if path.trim().is_empty() => None,
        Some(path) => Some(PathBuf::from(path.trim())),
    }
}

fn non_empty(command: Option<Vec<String>>) -> Option<Vec<String>> {
    command.filter(|argv| !argv.is_empty())
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
