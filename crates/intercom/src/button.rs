//! Push button input through the sysfs GPIO interface.
//!
//! The button pulls the pin low while held, so the line needs a pull-up.
//! sysfs cannot set pull resistors; a configurable command (by default
//! `pinctrl set <pin> ip pu`) does that before the pin is exported. Without it
//! the board needs an external pull-up.
//!
//! A background thread polls the pin value and reports debounced edges.
//! Nothing is reported until the line has been seen released, so a pin that
//! idles low never starts a recording on its own.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Consecutive identical samples before an edge is reported.
const STABLE_POLLS: u32 = 3;
const EXPORT_SETTLE_ATTEMPTS: u32 = 20;
/// gpiochip labels of the SoC header bank (bcm2835..bcm2712 and the Pi 5 RP1).
const HEADER_CHIP_LABELS: &[&str] = &["pinctrl-bcm", "pinctrl-rp1"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonEdge {
    Pressed,
    Released,
}

/// Where and how the push button is read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ButtonConfig {
    /// BCM pin number.
    pub pin: u32,
    /// sysfs number of BCM 0. `None` reads it from the header gpiochip.
    pub chip_base: Option<u32>,
    /// Enables the pin's pull-up; empty skips the step.
    pub pull_up_command: Vec<String>,
}

impl ButtonConfig {
    pub fn new(pin: u32) -> Self {
        Self {
            pin,
            chip_base: None,
            pull_up_command: default_pull_up_command(pin),
        }
    }
}

pub fn default_pull_up_command(pin: u32) -> Vec<String> {
    vec![
        "pinctrl".to_string(),
        "set".to_string(),
        pin.to_string(),
        "ip".to_string(),
        "pu".to_string(),
    ]
}

struct EdgeDetector {
    armed: bool,
    reported: bool,
    candidate: bool,
    count: u32,
}

impl EdgeDetector {
    fn new() -> Self {
        Self {
            armed: false,
            reported: false,
            candidate: false,
            count: 0,
        }
    }

    fn sample(&mut self, pressed: bool) -> Option<ButtonEdge> {
        if pressed == self.candidate {
            self.count = self.count.saturating_add(1);
        } else {
            self.candidate = pressed;
            self.count = 1;
        }
        if self.count < STABLE_POLLS {
            return None;
        }
        if !self.armed {
            self.armed = !self.candidate;
            return None;
        }
        if self.candidate == self.reported {
            return None;
        }
        self.reported = self.candidate;
        Some(if self.reported {
            ButtonEdge::Pressed
        } else {
            ButtonEdge::Released
        })
    }

    /// True once the line has read pressed steadily without ever being released.
    fn held_since_start(&self) -> bool {
        !self.armed && self.candidate && self.count >= STABLE_POLLS
    }
}

/// sysfs number of the header bank's first line, if a matching chip exists.
fn detect_chip_base(root: &Path) -> Option<u32> {
    let entries = std::fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let dir = entry.path();
        let is_chip = dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("gpiochip"));
        if !is_chip {
            continue;
        }
        let Ok(label) = std::fs::read_to_string(dir.join("label")) else {
            continue;
        };
        if !HEADER_CHIP_LABELS.iter().any(|l| label.trim().starts_with(l)) {
            continue;
        }
        if let Some(base) = std::fs::read_to_string(dir.join("base"))
            .ok()
            .and_then(|b| b.trim().parse().ok())
        {
            return Some(base);
        }
    }
    None
}

fn apply_pull_up(command: &[String]) {
    let Some((program, args)) = command.split_first() else {
        return;
    };
    match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {
            tracing::debug!(command = ?command, "gpio: pull-up enabled");
        }
        Ok(status) => {
            tracing::warn!(command = ?command, status = %status, "gpio: pull-up command failed; an external pull-up is required");
        }
        Err(e) => {
            tracing::warn!(command = ?command, error = %e, "gpio: pull-up command unavailable; an external pull-up is required");
        }
    }
}

#[derive(Clone, Debug)]
struct SysfsPin {
    root: PathBuf,
    /// sysfs line number (chip base + BCM pin).
    line: u32,
}

impl SysfsPin {
    fn dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.line))
    }

    fn export(&self) -> Result<()> {
        if !self.dir().exists() {
            std::fs::write(self.root.join("export"), self.line.to_string())
                .with_context(|| format!("export gpio {}", self.line))?;
        }
        // The pin directory appears asynchronously after export.
        let direction = self.dir().join("direction");
        let mut attempt = 0;
        loop {
            match std::fs::write(&direction, "in") {
                Ok(()) => return Ok(()),
                Err(e) if attempt < EXPORT_SETTLE_ATTEMPTS => {
                    tracing::debug!(line = self.line, error = %e, "gpio: waiting for export");
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("set direction {:?}", direction));
                }
            }
        }
    }

    fn is_pressed(&self) -> std::io::Result<bool> {
        let raw = std::fs::read_to_string(self.dir().join("value"))?;
        Ok(raw.trim() == "0")
    }

    fn unexport(&self) {
        if let Err(e) = std::fs::write(self.root.join("unexport"), self.line.to_string()) {
            tracing::debug!(line = self.line, error = %e, "gpio: unexport failed");
        }
    }
}

/// Handle for the running button poller.
pub struct ButtonPoller {
    pin: SysfsPin,
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

/// Prepare and export the button pin and start polling it. `on_edge` runs on
/// the poller thread.
pub fn spawn_button_poller<F>(config: &ButtonConfig, on_edge: F) -> Result<ButtonPoller>
where
    F: Fn(ButtonEdge) + Send + 'static,
{
    spawn_at(Path::new(SYSFS_GPIO_ROOT), config, on_edge)
}

fn spawn_at<F>(root: &Path, config: &ButtonConfig, on_edge: F) -> Result<ButtonPoller>
where
    F: Fn(ButtonEdge) + Send + 'static,
{
    apply_pull_up(&config.pull_up_command);
    let base = config
        .chip_base
        .or_else(|| detect_chip_base(root))
        .unwrap_or(0);
    let pin = SysfsPin {
        root: root.to_path_buf(),
        line: base + config.pin,
    };
    pin.export()?;

    let stop = Arc::new(AtomicBool::new(false));
    let join = {
        let pin = pin.clone();
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("button".to_string())
            .spawn(move || poll_loop(pin, stop, on_edge))
            .context("spawn button thread")?
    };
    tracing::info!(pin = config.pin, line = pin.line, "button: polling");
    Ok(ButtonPoller {
        pin,
        stop,
        join: Some(join),
    })
}

fn poll_loop<F: Fn(ButtonEdge)>(pin: SysfsPin, stop: Arc<AtomicBool>, on_edge: F) {
    let mut detector = EdgeDetector::new();
    let mut read_failed = false;
    let mut warned_held = false;
    while !stop.load(Ordering::Relaxed) {
        match pin.is_pressed() {
            Ok(pressed) => {
                read_failed = false;
                if let Some(edge) = detector.sample(pressed) {
                    tracing::debug!(?edge, "button: edge");
                    on_edge(edge);
                }
                if !warned_held && detector.held_since_start() {
                    warned_held = true;
                    tracing::warn!(
                        line = pin.line,
                        "button: line reads pressed since start; waiting for release (missing pull-up?)"
                    );
                }
            }
            Err(e) => {
                if !read_failed {
                    tracing::warn!(line = pin.line, error = %e, "button: read failed");
                }
                read_failed = true;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl ButtonPoller {
    /// Stop polling and release the pin.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.pin.unexport();
        tracing::info!(line = self.pin.line, "button: released");
    }
}
