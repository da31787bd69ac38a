//! Firmware update job manager.
//!
//! One job at a time, driven from the cooperative tick loop. The manager
//! never talks to the network directly; all transfer work goes through the
//! [`NetworkLink`] collaborator so the job logic is testable without I/O.

#[cfg(test)]
use std::collections::VecDeque;

use crate::config::ShutterConfig;
use crate::types::{ApiError, LinkInfo, OtaStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Filesystem,
    Firmware,
}

impl ImageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Firmware => "firmware",
        }
    }
}

/// Connectivity and transfer operations supplied by the platform layer.
pub trait NetworkLink {
    fn is_connected(&mut self) -> bool;
    fn link_info(&mut self) -> LinkInfo;
    /// Cheap reachability probe of the release host, used by the
    /// update-availability check.
    fn probe_release_host(&mut self) -> Result<(), String>;
    /// Downloads and stages one image. Blocking is acceptable; the tick
    /// loop tolerates a long call here.
    fn fetch_image(&mut self, url: &str, kind: ImageKind) -> Result<(), String>;
    fn reset_credentials(&mut self) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    Queued,
    Running,
    Failed,
    RebootPending,
}

impl OtaState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::RebootPending => "rebootPending",
        }
    }
}

/// Fully resolved update job; URL construction happens before enqueue.
#[derive(Debug, Clone, Default)]
pub struct OtaRequest {
    pub source: String,
    pub release_tag: String,
    pub firmware_url: String,
    pub filesystem_url: String,
    pub include_filesystem: bool,
}

pub struct OtaManager {
    settle_delay_ms: u64,
    retry_backoff_ms: u64,
    max_attempts: u8,
    reboot_grace_ms: u64,

    state: OtaState,
    source: String,
    release_tag: String,
    firmware_url: String,
    filesystem_url: String,
    include_filesystem: bool,
    filesystem_done: bool,
    phase: String,
    last_error: String,
    attempts: u8,
    queued_at_ms: u64,
    next_attempt_at_ms: u64,
    reboot_at_ms: u64,
}

impl OtaManager {
    pub fn new(cfg: &ShutterConfig) -> Self {
        Self {
            settle_delay_ms: cfg.ota_settle_delay_ms,
            retry_backoff_ms: cfg.ota_retry_backoff_ms,
            max_attempts: cfg.ota_max_attempts,
            reboot_grace_ms: cfg.ota_reboot_grace_ms,
            state: OtaState::Idle,
            source: String::new(),
            release_tag: String::new(),
            firmware_url: String::new(),
            filesystem_url: String::new(),
            include_filesystem: false,
            filesystem_done: false,
            phase: String::new(),
            last_error: String::new(),
            attempts: 0,
            queued_at_ms: 0,
            next_attempt_at_ms: 0,
            reboot_at_ms: 0,
        }
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    /// A busy manager refuses new jobs; a failed one accepts them.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state,
            OtaState::Queued | OtaState::Running | OtaState::RebootPending
        )
    }

    pub fn enqueue(&mut self, request: OtaRequest, now_ms: u64) -> Result<(), ApiError> {
        if self.is_busy() {
            return Err(ApiError::conflict("an update job is already in progress"));
        }
        if request.firmware_url.trim().is_empty() {
            return Err(ApiError::validation("firmware URL is required"));
        }
        if request.include_filesystem && request.filesystem_url.trim().is_empty() {
            return Err(ApiError::validation(
                "filesystem URL is required when the filesystem image is included",
            ));
        }

        self.state = OtaState::Queued;
        self.source = request.source;
        self.release_tag = request.release_tag;
        self.firmware_url = request.firmware_url;
        self.filesystem_url = request.filesystem_url;
        self.include_filesystem = request.include_filesystem;
        self.filesystem_done = false;
        self.phase = "waiting".to_string();
        self.last_error.clear();
        self.attempts = 0;
        self.queued_at_ms = now_ms;
        self.next_attempt_at_ms = 0;
        self.reboot_at_ms = 0;
        Ok(())
    }

    /// True once a queued job has waited out the settle delay. The caller
    /// stops motion and flushes state before calling [`begin`].
    ///
    /// [`begin`]: OtaManager::begin
    pub fn start_due(&self, now_ms: u64) -> bool {
        self.state == OtaState::Queued
            && now_ms.saturating_sub(self.queued_at_ms) >= self.settle_delay_ms
    }

    pub fn begin(&mut self, now_ms: u64) {
        if self.state != OtaState::Queued {
            return;
        }
        self.state = OtaState::Running;
        self.attempts = 0;
        self.next_attempt_at_ms = now_ms;
        self.phase = self.current_image().as_str().to_string();
    }

    fn current_image(&self) -> ImageKind {
        if self.include_filesystem && !self.filesystem_done {
            ImageKind::Filesystem
        } else {
            ImageKind::Firmware
        }
    }

    fn fail(&mut self, message: String) {
        self.last_error = message;
        self.state = OtaState::Failed;
        self.phase = "failed".to_string();
    }

    /// One unit of job progress. Returns true when a completed job is due
    /// for the restart.
    pub fn advance(&mut self, now_ms: u64, link: &mut dyn NetworkLink) -> bool {
        match self.state {
            OtaState::Idle | OtaState::Queued | OtaState::Failed => false,
            OtaState::RebootPending => now_ms >= self.reboot_at_ms,
            OtaState::Running => {
                if now_ms < self.next_attempt_at_ms {
                    return false;
                }
                if !link.is_connected() {
                    self.fail("network connection lost during update".to_string());
                    return false;
                }

                let kind = self.current_image();
                let url = match kind {
                    ImageKind::Filesystem => self.filesystem_url.clone(),
                    ImageKind::Firmware => self.firmware_url.clone(),
                };
                self.attempts += 1;
                match link.fetch_image(&url, kind) {
                    Ok(()) => match kind {
                        ImageKind::Filesystem => {
                            self.filesystem_done = true;
                            self.attempts = 0;
                            self.next_attempt_at_ms = now_ms;
                            self.phase = ImageKind::Firmware.as_str().to_string();
                        }
                        ImageKind::Firmware => {
                            self.state = OtaState::RebootPending;
                            self.phase = "rebooting".to_string();
                            self.reboot_at_ms = now_ms + self.reboot_grace_ms;
                        }
                    },
                    Err(err) => {
                        self.last_error = format!("{} image: {err}", kind.as_str());
                        if self.attempts >= self.max_attempts {
                            self.state = OtaState::Failed;
                            self.phase = "failed".to_string();
                        } else {
                            self.next_attempt_at_ms = now_ms + self.retry_backoff_ms;
                        }
                    }
                }
                false
            }
        }
    }

    pub fn status(&self) -> OtaStatus {
        OtaStatus {
            state: self.state.as_str(),
            phase: self.phase.clone(),
            last_error: self.last_error.clone(),
            source: self.source.clone(),
            release_tag: self.release_tag.clone(),
            include_filesystem: self.include_filesystem,
        }
    }
}

/// Format gate for user-supplied image URLs.
pub fn looks_like_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

#[cfg(test)]
pub(crate) struct ScriptedLink {
    pub connected: bool,
    pub fetch_results: VecDeque<Result<(), String>>,
    pub fetched: Vec<(String, ImageKind)>,
    pub probe_result: Result<(), String>,
}

#[cfg(test)]
impl ScriptedLink {
    pub fn online() -> Self {
        Self {
            connected: true,
            fetch_results: VecDeque::new(),
            fetched: Vec::new(),
            probe_result: Ok(()),
        }
    }
}

#[cfg(test)]
impl NetworkLink for ScriptedLink {
    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn link_info(&mut self) -> LinkInfo {
        LinkInfo {
            connected: self.connected,
            ssid: "test-net".to_string(),
            rssi: -55,
            ip: "192.0.2.10".to_string(),
        }
    }

    fn probe_release_host(&mut self) -> Result<(), String> {
        self.probe_result.clone()
    }

    fn fetch_image(&mut self, url: &str, kind: ImageKind) -> Result<(), String> {
        self.fetched.push((url.to_string(), kind));
        self.fetch_results.pop_front().unwrap_or(Ok(()))
    }

    fn reset_credentials(&mut self) -> Result<(), String> {
        Ok(())
    }
}
