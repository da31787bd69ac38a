use serde::Serialize;

/// Failure classification carried back to the request layer. The HTTP
/// surface maps these onto status codes; the engine never panics on bad
/// input and never mutates state before validation passes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("failed to persist state: {0}")]
    Persistence(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionPhase {
    Idle,
    Opening,
    Closing,
}

impl MotionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Closing => "closing",
        }
    }
}

/// Connectivity snapshot supplied by the network collaborator.
#[derive(Debug, Clone, Default)]
pub struct LinkInfo {
    pub connected: bool,
    pub ssid: String,
    pub rssi: i32,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SunStatus {
    pub enabled: bool,
    #[serde(rename = "cacheValid")]
    pub cache_valid: bool,
    #[serde(rename = "eventsAvailable")]
    pub events_available: bool,
    #[serde(rename = "sunriseEpoch")]
    pub sunrise_epoch: Option<i64>,
    #[serde(rename = "sunsetEpoch")]
    pub sunset_epoch: Option<i64>,
    #[serde(rename = "sunriseFired")]
    pub sunrise_fired: bool,
    #[serde(rename = "sunsetFired")]
    pub sunset_fired: bool,
    #[serde(rename = "sunriseTargetPercent")]
    pub sunrise_target_percent: f32,
    #[serde(rename = "sunsetTargetPercent")]
    pub sunset_target_percent: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtaStatus {
    pub state: &'static str,
    pub phase: String,
    #[serde(rename = "lastError")]
    pub last_error: String,
    pub source: String,
    #[serde(rename = "releaseTag")]
    pub release_tag: String,
    #[serde(rename = "includeFilesystem")]
    pub include_filesystem: bool,
}

/// Full status snapshot returned by `GET /api/state` and echoed after
/// every state-changing request.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub ok: bool,
    pub version: &'static str,
    pub ip: String,
    pub ssid: String,
    pub rssi: i32,
    #[serde(rename = "uptimeSec")]
    pub uptime_sec: u64,
    pub motion: &'static str,
    pub moving: bool,
    pub calibrated: bool,
    #[serde(rename = "positionSteps")]
    pub position_steps: i32,
    #[serde(rename = "targetSteps")]
    pub target_steps: i32,
    #[serde(rename = "travelSteps")]
    pub travel_steps: i32,
    #[serde(rename = "positionPercent")]
    pub position_percent: f32,
    #[serde(rename = "targetPercent")]
    pub target_percent: f32,
    #[serde(rename = "reverseDirection")]
    pub reverse_direction: bool,
    #[serde(rename = "maxSpeed")]
    pub max_speed: f32,
    pub acceleration: f32,
    #[serde(rename = "coilHoldMs")]
    pub coil_hold_ms: u16,
    #[serde(rename = "topOverdriveEnabled")]
    pub top_overdrive_enabled: bool,
    #[serde(rename = "topOverdrivePercent")]
    pub top_overdrive_percent: f32,
    #[serde(rename = "rawPosition")]
    pub raw_position: i32,
    #[serde(rename = "firmwareRepo")]
    pub firmware_repo: String,
    #[serde(rename = "firmwareAssetName")]
    pub firmware_asset_name: String,
    #[serde(rename = "firmwareFsAssetName")]
    pub firmware_fs_asset_name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(rename = "sunriseOffsetMinutes")]
    pub sunrise_offset_minutes: i16,
    #[serde(rename = "sunsetOffsetMinutes")]
    pub sunset_offset_minutes: i16,
    pub sun: SunStatus,
    pub ota: OtaStatus,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateImageCheck {
    pub ok: bool,
    #[serde(rename = "urlFormatOk")]
    pub url_format_ok: bool,
}

/// Result of the update-availability probe; returned with an upstream
/// failure code when `ok` is false, but always carries the breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateCheck {
    pub ok: bool,
    #[serde(rename = "firmwareUrl")]
    pub firmware_url: String,
    #[serde(rename = "filesystemUrl")]
    pub filesystem_url: String,
    #[serde(rename = "networkOk")]
    pub network_ok: bool,
    #[serde(rename = "networkError")]
    pub network_error: String,
    pub firmware: UpdateImageCheck,
    pub filesystem: UpdateImageCheck,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
